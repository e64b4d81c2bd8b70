use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::generator::MultusConf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Daemon configuration file
    #[arg(short, long, default_value = "/etc/cni/net.d/multus.d/daemon-config.json")]
    config: String,

    /// Filesystem root the delegate plugin binaries live under
    #[arg(long)]
    chroot_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub conf: MultusConf,
    pub chroot_dir: Option<PathBuf>,
    // raw daemon config file contents, spliced into every shim request
    pub config_override: String,
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let args = Args::parse();
        Self::from_file(Path::new(&args.config), args.chroot_dir.map(PathBuf::from))
    }

    pub fn from_file(path: &Path, chroot_dir: Option<PathBuf>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read daemon configuration {}", path.display()))?;
        let conf = MultusConf::parse(&raw)?;

        Ok(Self {
            conf,
            chroot_dir,
            config_override: raw,
        })
    }
}
