use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use common::{API_ENDPOINT, CniRequest, CniResponse, HEALTH_ENDPOINT};
use http::{Method, header::CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, client::conn::http1};
use hyper_util::rt::TokioIo;
use log::{debug, error};
use tokio::{net::UnixStream, time::sleep};

pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const READY_TIMEOUT: Duration = Duration::from_secs(45);

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    // ADD and CHECK only; DEL must never wait on a dead daemon
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.probe().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("daemon not ready yet: {e:#}"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "daemon at {} did not become ready within {timeout:?}",
                    self.socket_path.display()
                );
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub async fn probe(&self) -> Result<()> {
        self.request(Method::GET, HEALTH_ENDPOINT, Bytes::new())
            .await
            .map(|_| ())
    }

    pub async fn send_cni_request(&self, stdin: &str) -> Result<CniResponse> {
        let request = CniRequest {
            env: std::env::vars().collect(),
            config: stdin.to_string(),
            interface_attributes: None,
        };

        let body = self
            .request(
                Method::POST,
                API_ENDPOINT,
                Bytes::from(serde_json::to_vec(&request)?),
            )
            .await?;

        if body.is_empty() {
            return Ok(CniResponse::default());
        }
        serde_json::from_slice(&body).context("malformed response from the daemon")
    }

    async fn request(&self, method: Method, uri: &str, body: Bytes) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::task::spawn(async move {
            if let Err(e) = conn.await {
                error!("connection failed: {e:#?}");
            }
        });

        let req = http::Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))?;

        let res = sender.send_request(req).await?;
        let (parts, body) = res.into_parts();
        let body = body.collect().await?.to_bytes();

        if !parts.status.is_success() {
            bail!(
                "daemon rejected the request ({}): {}",
                parts.status,
                String::from_utf8_lossy(&body)
            );
        }
        Ok(body)
    }
}
