// Re-export dependencies used in public interfaces of common types

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid;
use uuid::Uuid;

use thiserror::Error;

/// Container port every hosted worker listens on, regardless of backend.
pub const WORKER_PORT: u16 = 3000;

/// Config key carrying the per-instance worker credential.
pub const WORKER_API_KEY: &str = "WORKER_API_KEY";

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Backend Adapter Error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Worker Poll Error: {0}")]
    Poll(String),

    #[error("Registry Error: {0}")]
    Registry(#[from] sqlx::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

// Define the primary Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors crossing the backend adapter boundary. `AlreadyExists` and
/// `NotFound` are distinct variants so the orchestrator can reuse or
/// recreate instead of failing.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("work unit already exists: {0}")]
    AlreadyExists(String),

    #[error("work unit not found: {0}")]
    NotFound(String),

    #[error("backend api error: {0}")]
    Api(String),
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(InstanceStatus::Stopped),
            "running" => Ok(InstanceStatus::Running),
            other => Err(HubError::Validation(format!(
                "unknown instance status: {other}"
            ))),
        }
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream-connectivity state derived on read by the session poller.
/// Never persisted as truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

/// Live state of a backend work unit as reported by the control plane.
/// An existing-but-not-running unit (exited container, zero-replica
/// deployment) reports `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    Running,
    Pending,
    NotFound,
}

/// Durable registry row for one hosted worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Host port in docker mode; kubernetes mode uses name-based discovery.
    pub assigned_port: Option<u16>,
    /// Container name or deployment name. Set iff the instance has been
    /// started at least once.
    pub backend_handle: Option<String>,
    pub status: InstanceStatus,
    /// Merged defaults + template + user overrides, including the generated
    /// worker credential.
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn worker_api_key(&self) -> Option<&str> {
        self.config.get(WORKER_API_KEY).map(String::as_str)
    }
}

/// Named reusable config fragment, owner-scoped or global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    /// None means global.
    pub owner_id: Option<Uuid>,
    pub config: HashMap<String, String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// One resource-usage reading for a running instance. Append-only,
/// pruned by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub instance_id: Uuid,
    pub cpu_percent: f64,
    pub mem_used_bytes: i64,
    pub mem_limit_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    /// True when the values are declared requests/limits rather than
    /// observed usage (cluster metrics endpoint unavailable).
    pub estimated: bool,
    pub sampled_at: DateTime<Utc>,
}

/// Point-in-time resource usage returned by `BackendAdapter::stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitStats {
    pub cpu_percent: f64,
    pub mem_used_bytes: i64,
    pub mem_limit_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub estimated: bool,
}

/// Everything a backend needs to materialize one work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnitSpec {
    /// Unit name, unique per backend (container name / deployment name).
    pub name: String,
    /// Worker environment, the merged instance config.
    pub env: HashMap<String, String>,
    /// Requested host port (docker mode only).
    pub host_port: Option<u16>,
    /// Named volume holding the worker's session storage.
    pub session_volume: String,
    pub labels: HashMap<String, String>,
}

/// Lifecycle and metrics events fanned out to realtime subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    InstanceCreated { id: Uuid, name: String },
    InstanceStarted { id: Uuid, name: String },
    InstanceStopped { id: Uuid, name: String },
    InstanceRestarted { id: Uuid, name: String },
    InstanceDeleted { id: Uuid, name: String },
    InstanceScaled { id: Uuid, name: String, replicas: i32 },
    MetricsSampled { id: Uuid, sample: MetricSample },
}

/// Contract shared by both control-plane backends. Selected once at process
/// start and injected into the lifecycle orchestrator; callers never branch
/// on the concrete backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Creates the backend resources for one work unit and returns its
    /// opaque handle. A name collision surfaces as
    /// `AdapterError::AlreadyExists` so the caller can reuse the unit.
    async fn create_work_unit(&self, spec: &WorkUnitSpec) -> AdapterResult<String>;

    /// Idempotent: starting an already-running unit succeeds as a no-op.
    async fn start(&self, handle: &str) -> AdapterResult<()>;

    /// Waits up to `grace` before forced termination. Idempotent.
    async fn stop(&self, handle: &str, grace: Duration) -> AdapterResult<()>;

    async fn restart(&self, handle: &str, grace: Duration) -> AdapterResult<()>;

    /// Tears down the unit and any exposed network binding. Errors if the
    /// unit is still running and `force` is false.
    async fn remove(&self, handle: &str, force: bool) -> AdapterResult<()>;

    /// Replica control. Backends without a replica concept collapse 0/1 to
    /// stop/start.
    async fn scale(&self, handle: &str, replicas: i32) -> AdapterResult<()>;

    async fn stats(&self, handle: &str) -> AdapterResult<UnitStats>;

    async fn logs(&self, handle: &str, tail: i64) -> AdapterResult<String>;

    async fn status(&self, handle: &str) -> AdapterResult<UnitState>;

    /// Base URL of the instance's own worker API, if reachable from here.
    fn endpoint(&self, instance: &Instance) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let id = Uuid::new_v4();
        let event = LifecycleEvent::InstanceStarted {
            id,
            name: "acct-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("instance_started"));
        assert!(json.contains("acct-1"));

        let back: LifecycleEvent = serde_json::from_str(&json).unwrap();
        match back {
            LifecycleEvent::InstanceStarted { id: got, .. } => assert_eq!(got, id),
            _ => panic!("wrong event variant"),
        }
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            "running".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::Running
        );
        assert_eq!(InstanceStatus::Stopped.as_str(), "stopped");
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_unit_state_serde() {
        let json = serde_json::to_string(&UnitState::NotFound).unwrap();
        assert_eq!(json, "\"not-found\"");
    }

    #[test]
    fn test_worker_api_key_lookup() {
        let mut config = HashMap::new();
        config.insert(WORKER_API_KEY.to_string(), "k1".to_string());
        let instance = Instance {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "acct-1".to_string(),
            description: None,
            assigned_port: Some(21000),
            backend_handle: None,
            status: InstanceStatus::Stopped,
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_started_at: None,
            last_stopped_at: None,
        };
        assert_eq!(instance.worker_api_key(), Some("k1"));
    }
}
