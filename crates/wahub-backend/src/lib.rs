//! The two control-plane backends and the process-start selector.
//!
//! Exactly one adapter is constructed per process, based on the deployment
//! mode flag, and injected as `Arc<dyn BackendAdapter>` wherever lifecycle
//! intents need translating. Nothing downstream branches on the concrete
//! backend.

use std::str::FromStr;
use std::sync::Arc;

use wahub_common::{BackendAdapter, HubError, Result};

// Re-export dependencies potentially needed by consumers
pub use bollard;
pub use kube;
pub use wahub_common as common;

pub mod cluster;
pub mod docker;

pub use cluster::ClusterAdapter;
pub use docker::DockerAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Docker,
    Kubernetes,
}

impl FromStr for DeploymentMode {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(DeploymentMode::Docker),
            "kubernetes" | "k8s" => Ok(DeploymentMode::Kubernetes),
            other => Err(HubError::Config(format!(
                "unknown deployment mode: {other} (expected docker or kubernetes)"
            ))),
        }
    }
}

/// Backend-facing slice of the settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub mode: DeploymentMode,
    /// Worker image every instance runs.
    pub worker_image: String,
    /// Bridge network joined by all worker containers (docker mode).
    pub docker_network: String,
    /// Namespace holding all workload objects (kubernetes mode).
    pub namespace: String,
}

/// Builds the adapter for the configured mode. Called once at process
/// start; the choice is fixed for the process lifetime.
pub async fn select_backend(config: &BackendConfig) -> Result<Arc<dyn BackendAdapter>> {
    match config.mode {
        DeploymentMode::Docker => {
            let docker = bollard::Docker::connect_with_local_defaults()
                .map_err(|e| HubError::Config(format!("docker daemon unreachable: {e}")))?;
            let adapter =
                DockerAdapter::new(Arc::new(docker), config.worker_image.clone(), config.docker_network.clone())
                    .await?;
            Ok(Arc::new(adapter))
        }
        DeploymentMode::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .map_err(|e| HubError::Config(format!("cluster api unreachable: {e}")))?;
            Ok(Arc::new(ClusterAdapter::new(
                client,
                config.namespace.clone(),
                config.worker_image.clone(),
            )))
        }
    }
}

/// Normalizes an instance name into a valid container/deployment name.
pub fn sanitize_unit_name(name: &str) -> String {
    let mut out: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}
