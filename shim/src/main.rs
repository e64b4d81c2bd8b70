use std::io::Write;

use anyhow::{Context, Result, bail};
use common::{DEFAULT_SOCKET_DIR, socket_path};
use log::{debug, error};
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use crate::client::{DaemonClient, READY_TIMEOUT};

mod client;

const FALLBACK_CNI_VERSION: &str = "0.4.0";
const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShimConf {
    cni_version: String,
    #[serde(default = "default_socket_dir")]
    daemon_socket_dir: String,
    #[serde(default = "default_log_file")]
    log_file: String,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_to_stderr: bool,
}

fn default_socket_dir() -> String {
    DEFAULT_SOCKET_DIR.to_string()
}

fn default_log_file() -> String {
    "/var/log/multus-shim.log".to_string()
}

impl ShimConf {
    fn fallback() -> Self {
        Self {
            cni_version: FALLBACK_CNI_VERSION.to_string(),
            daemon_socket_dir: default_socket_dir(),
            log_file: default_log_file(),
            log_level: None,
            log_to_stderr: false,
        }
    }
}

#[tokio::main]
async fn main() {
    let (command, stdin, conf) = match setup().await {
        Ok(v) => v,
        Err(e) => {
            // DEL reports success to the runtime no matter what, so a
            // broken setup must not block pod teardown either
            if std::env::var("CNI_COMMAND").is_ok_and(|c| c == "DEL") {
                eprintln!("DEL proceeding after a setup failure: {e:#}");
                return;
            }
            print_cni_error(FALLBACK_CNI_VERSION, &e);
            std::process::exit(1);
        }
    };

    if let Err(e) = dispatch(&command, &stdin, &conf).await {
        error!("{command} failed: {e:#}");
        print_cni_error(&conf.cni_version, &e);
        std::process::exit(1);
    }
}

async fn setup() -> Result<(String, String, ShimConf)> {
    let command = std::env::var("CNI_COMMAND").context("CNI_COMMAND is not set")?;

    let mut stdin = String::new();
    tokio::io::stdin()
        .read_to_string(&mut stdin)
        .await
        .context("failed to read stdin")?;

    let conf = parse_conf(&command, &stdin)?;
    init_logging(&conf);

    debug!("command: {command:?}");
    Ok((command, stdin, conf))
}

fn parse_conf(command: &str, stdin: &str) -> Result<ShimConf> {
    match serde_json::from_str(stdin) {
        Ok(conf) => Ok(conf),
        // a DEL with unparseable stdin proceeds on defaults instead of
        // aborting; the daemon gets its chance to clean up regardless
        Err(_) if command == "DEL" => Ok(ShimConf::fallback()),
        Err(e) => Err(e).context("failed to parse the shim configuration from stdin"),
    }
}

async fn dispatch(command: &str, stdin: &str, conf: &ShimConf) -> Result<()> {
    let client = DaemonClient::new(socket_path(&conf.daemon_socket_dir));

    match command {
        "ADD" | "CHECK" => {
            client.wait_until_ready(READY_TIMEOUT).await?;
            let response = client.send_cni_request(stdin).await?;

            if command == "ADD" {
                let result = response
                    .result
                    .context("daemon returned no result for ADD")?;
                println!("{}", serde_json::to_string(&result)?);
            }
            Ok(())
        }
        "DEL" => {
            // one probe, outcome ignored: a dead daemon must never block
            // pod teardown, and DEL always reports success
            if let Err(e) = client.probe().await {
                error!("DEL proceeding without a ready daemon: {e:#}");
            }
            if let Err(e) = client.send_cni_request(stdin).await {
                error!("DEL failed, reporting success anyway: {e:#}");
            }
            Ok(())
        }
        "VERSION" => {
            let versions = serde_json::json!({
                "cniVersion": conf.cni_version,
                "supportedVersions": SUPPORTED_CNI_VERSIONS,
            });
            println!("{versions}");
            Ok(())
        }
        other => bail!("unknown CNI command: {other}"),
    }
}

fn init_logging(conf: &ShimConf) {
    let mut builder = env_logger::Builder::new();

    let target = if conf.log_to_stderr {
        env_logger::Target::Stderr
    } else {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&conf.log_file)
        {
            Ok(file) => env_logger::Target::Pipe(Box::new(file)),
            Err(_) => env_logger::Target::Stderr,
        }
    };

    let level = conf
        .log_level
        .as_deref()
        .and_then(|l| l.parse().ok())
        .unwrap_or(log::LevelFilter::Info);

    let _ = builder
        .target(target)
        .filter(None, level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Local::now(),
                record.level(),
                record.module_path().unwrap_or("<unknown>"),
                record.args()
            )
        })
        .try_init();
}

fn print_cni_error(cni_version: &str, err: &anyhow::Error) {
    println!("{}", cni_error_json(cni_version, err));
}

fn cni_error_json(cni_version: &str, err: &anyhow::Error) -> String {
    serde_json::json!({
        "cniVersion": cni_version,
        "code": 100,
        "msg": "multus-shim failed",
        "details": format!("{err:#}"),
    })
    .to_string()
}
