use std::{collections::HashMap, fs::Permissions, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use common::{API_ENDPOINT, CniRequest, CniResponse, HEALTH_ENDPOINT};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response,
    body::{Buf, Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use kube::Client;
use tokio::{
    fs::{create_dir_all, remove_file, set_permissions},
    net::UnixListener,
};
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::{dispatch::Dispatcher, k8s};

#[derive(Debug)]
pub struct CniCmd {
    pub command: String,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub config: String,
    pub pod_namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
}

impl CniCmd {
    pub fn parse(request: &CniRequest, config_override: Option<&str>) -> Result<Self> {
        let env = &request.env;
        let command = required_env(env, "CNI_COMMAND")?;
        let container_id = required_env(env, "CNI_CONTAINERID")?;
        let netns = required_env(env, "CNI_NETNS")?;
        let ifname = env
            .get("CNI_IFNAME")
            .cloned()
            .unwrap_or_else(|| "eth0".to_string());
        let args = parse_cni_args(&required_env(env, "CNI_ARGS")?);

        let pod_namespace = args
            .get("K8S_POD_NAMESPACE")
            .filter(|v| !v.is_empty())
            .context("CNI_ARGS is missing K8S_POD_NAMESPACE")?
            .clone();
        let pod_name = args
            .get("K8S_POD_NAME")
            .filter(|v| !v.is_empty())
            .context("CNI_ARGS is missing K8S_POD_NAME")?
            .clone();
        let pod_uid = args.get("K8S_POD_UID").cloned().unwrap_or_default();

        let config = match config_override {
            Some(fragment) => merge_config_override(&request.config, fragment)?,
            None => request.config.clone(),
        };

        Ok(Self {
            command,
            container_id,
            netns,
            ifname,
            config,
            pod_namespace,
            pod_name,
            pod_uid,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "[{} {}/{}:{}] netns {} ifname {}",
            self.command, self.pod_namespace, self.pod_name, self.container_id, self.netns, self.ifname
        )
    }

    pub fn delegate_env(&self, bin_dir: &str) -> HashMap<String, String> {
        HashMap::from([
            ("CNI_COMMAND".to_string(), self.command.clone()),
            ("CNI_CONTAINERID".to_string(), self.container_id.clone()),
            ("CNI_NETNS".to_string(), self.netns.clone()),
            ("CNI_IFNAME".to_string(), self.ifname.clone()),
            ("CNI_PATH".to_string(), bin_dir.to_string()),
            (
                "CNI_ARGS".to_string(),
                format!(
                    "IgnoreUnknown=true;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={};K8S_POD_UID={}",
                    self.pod_namespace, self.pod_name, self.container_id, self.pod_uid
                ),
            ),
        ])
    }
}

fn required_env(env: &HashMap<String, String>, key: &str) -> Result<String> {
    env.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .with_context(|| format!("required CNI environment variable {key} is missing"))
}

fn parse_cni_args(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// serde_json keeps the last value for a duplicate key, so splicing the
// daemon-side fragment in before the closing brace makes it win
fn merge_config_override(config: &str, fragment: &str) -> Result<String> {
    let base = config
        .trim_end()
        .strip_suffix('}')
        .context("shim configuration is not a JSON object")?;
    let fragment = fragment
        .trim()
        .strip_prefix('{')
        .context("daemon config override is not a JSON object")?;

    Ok(format!("{base},{fragment}"))
}

pub struct CniServer {
    socket_path: PathBuf,
    config_override: Option<String>,
    dispatcher: Arc<Dispatcher>,
    kube_client: Option<Client>,
}

#[derive(Clone)]
struct ServerState {
    config_override: Option<String>,
    dispatcher: Arc<Dispatcher>,
    kube_client: Option<Client>,
}

impl CniServer {
    pub fn new(
        socket_path: PathBuf,
        config_override: Option<String>,
        dispatcher: Arc<Dispatcher>,
        kube_client: Option<Client>,
    ) -> Self {
        Self {
            socket_path,
            config_override,
            dispatcher,
            kube_client,
        }
    }

    #[instrument(
        name = "cni_server",
        skip_all,
        err,
        fields(socket_path = %self.socket_path.display())
    )]
    pub async fn run(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if self.socket_path.exists() {
            remove_file(&self.socket_path).await?;
        }
        if let Some(parent) = self.socket_path.parent() {
            create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        set_permissions(&self.socket_path, Permissions::from_mode(0o600)).await?;

        info!("CNI server listening");

        let state = ServerState {
            config_override: self.config_override.clone(),
            dispatcher: self.dispatcher.clone(),
            kube_client: self.kube_client.clone(),
        };

        loop {
            let (stream, _) = listener.accept().await?;
            let state = state.clone();

            tokio::spawn(
                async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| Self::route(req, state.clone())),
                        )
                        .await
                    {
                        error!(error = ?e, "Error serving connection");
                    }
                }
                .in_current_span(),
            );
        }
    }

    async fn route(
        req: Request<Incoming>,
        state: ServerState,
    ) -> Result<Response<Full<Bytes>>> {
        let path = req.uri().path().to_string();
        match path.as_str() {
            API_ENDPOINT if req.method() == Method::POST => Self::handle_cni(req, state).await,
            HEALTH_ENDPOINT => Ok(Response::new(Full::from("ok"))),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::default())?),
        }
    }

    // every failure becomes an HTTP 400 whose plain-text body carries
    // the error and the reconstructed command context
    #[instrument(name = "handle", skip_all)]
    async fn handle_cni(
        req: Request<Incoming>,
        state: ServerState,
    ) -> Result<Response<Full<Bytes>>> {
        match Self::process(req, state).await {
            Ok(body) => Ok(Response::new(Full::from(body))),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "CNI request failed");
                Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Full::from(format!("{e:#}")))?)
            }
        }
    }

    async fn process(req: Request<Incoming>, state: ServerState) -> Result<Bytes> {
        let body = req.collect().await?.aggregate();
        let request: CniRequest =
            serde_json::from_reader(body.reader()).context("malformed CNI request body")?;

        if let Some(attrs) = &request.interface_attributes {
            debug!(?attrs, "Request carries interface attributes");
        }

        let mut cmd = CniCmd::parse(&request, state.config_override.as_deref())?;

        if cmd.pod_uid.is_empty() {
            let client = state.kube_client.clone().with_context(|| {
                format!(
                    "cannot resolve the UID of pod {}/{}: no Kubernetes client",
                    cmd.pod_namespace, cmd.pod_name
                )
            })?;
            cmd.pod_uid = k8s::pod_uid(client, &cmd.pod_namespace, &cmd.pod_name).await?;
        }

        let summary = cmd.summary();
        debug!(%summary, "Dispatching CNI request");

        let body = match cmd.command.as_str() {
            "ADD" => {
                let result = state.dispatcher.add(&cmd).await.with_context(|| summary.clone())?;
                let response = CniResponse { result: Some(result) };
                Bytes::from(serde_json::to_vec(&response)?)
            }
            "DEL" => {
                state.dispatcher.del(&cmd).await.with_context(|| summary.clone())?;
                Bytes::new()
            }
            "CHECK" => {
                state.dispatcher.check(&cmd).await.with_context(|| summary.clone())?;
                Bytes::new()
            }
            other => bail!("unknown CNI command {other:?} ({summary})"),
        };

        info!(%summary, "CNI request served");
        Ok(body)
    }
}
