//! Process configuration, loaded from the environment (with `.env` support).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use wahub_backend::{BackendConfig, DeploymentMode};
use wahub_common::{HubError, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: DeploymentMode,
    pub database_path: PathBuf,
    pub port_min: u16,
    pub port_max: u16,
    pub namespace: String,
    pub worker_image: String,
    pub docker_network: String,
    pub metrics_interval: Duration,
    pub metrics_retention: Duration,
    pub poll_timeout: Duration,
    pub stop_grace: Duration,
    pub listen_addr: SocketAddr,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| HubError::Config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = Self {
            mode: env_or("WAHUB_BACKEND", DeploymentMode::Docker)?,
            database_path: env_or("WAHUB_DB", PathBuf::from("wahub.db"))?,
            port_min: env_or("WAHUB_PORT_MIN", 21000)?,
            port_max: env_or("WAHUB_PORT_MAX", 22000)?,
            namespace: env_or("WAHUB_NAMESPACE", "wahub".to_string())?,
            worker_image: env_or("WAHUB_WORKER_IMAGE", "wwebjs-api:latest".to_string())?,
            docker_network: env_or("WAHUB_DOCKER_NETWORK", "wahub-net".to_string())?,
            metrics_interval: Duration::from_secs(env_or("WAHUB_METRICS_INTERVAL_SECS", 5u64)?),
            metrics_retention: Duration::from_secs(
                env_or("WAHUB_METRICS_RETENTION_DAYS", 30u64)? * 24 * 60 * 60,
            ),
            poll_timeout: Duration::from_secs(env_or("WAHUB_POLL_TIMEOUT_SECS", 5u64)?),
            stop_grace: Duration::from_secs(env_or("WAHUB_STOP_GRACE_SECS", 10u64)?),
            listen_addr: env_or("WAHUB_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        };

        if settings.port_min > settings.port_max {
            return Err(HubError::Config(format!(
                "WAHUB_PORT_MIN ({}) exceeds WAHUB_PORT_MAX ({})",
                settings.port_min, settings.port_max
            )));
        }
        Ok(settings)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            mode: self.mode,
            worker_image: self.worker_image.clone(),
            docker_network: self.docker_network.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_parses_and_defaults() {
        assert_eq!(env_or("WAHUB_TEST_UNSET_KEY", 42u16).unwrap(), 42);
        std::env::set_var("WAHUB_TEST_PORT_KEY", "21500");
        assert_eq!(env_or("WAHUB_TEST_PORT_KEY", 0u16).unwrap(), 21500);
        std::env::set_var("WAHUB_TEST_BAD_KEY", "not-a-number");
        assert!(env_or("WAHUB_TEST_BAD_KEY", 0u16).is_err());
    }
}
