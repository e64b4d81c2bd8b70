use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tracing::debug;

// used when the runtime did not hand the UID to the shim via CNI_ARGS
pub async fn pod_uid(client: Client, namespace: &str, name: &str) -> Result<String> {
    let pod_api: Api<Pod> = Api::namespaced(client, namespace);
    let pod = pod_api
        .get(name)
        .await
        .with_context(|| format!("failed to look up pod {namespace}/{name}"))?;

    debug!(pod = %format!("{namespace}/{name}"), "Resolved pod from the API server");

    pod.metadata
        .uid
        .filter(|uid| !uid.is_empty())
        .with_context(|| format!("pod {namespace}/{name} carries no UID"))
}
