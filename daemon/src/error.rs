use std::path::PathBuf;

// errors the daemon's supervisor logic tells apart from ordinary failures
#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("readiness indicator file {0} was removed")]
    ReadinessGone(PathBuf),

    #[error(
        "CNI version incompatibility: the derived config is {derived} but the primary config is {primary}; a primary of 0.4.0 or newer is required"
    )]
    VersionIncompatible { derived: String, primary: String },

    #[error("no primary CNI config appeared in {dir} after {attempts} attempts")]
    PrimaryConfNotFound { dir: PathBuf, attempts: usize },
}
