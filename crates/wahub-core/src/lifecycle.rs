//! Instance lifecycle orchestration.
//!
//! All state transitions for one instance are serialized behind a
//! per-instance async lock, so concurrent starts (or a start racing a
//! delete) collapse into one backend mutation. The backend itself is an
//! injected `BackendAdapter`; nothing in here branches on the concrete
//! control plane beyond the docker/kubernetes feature gates (host ports,
//! replica scaling).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::allocator::PortAllocator;
use crate::events::EventBroadcaster;
use crate::poller::SessionPoller;
use crate::registry::Registry;
use wahub_backend::{sanitize_unit_name, DeploymentMode};
use wahub_common::{
    AdapterError, BackendAdapter, HubError, Instance, InstanceStatus, LifecycleEvent, Result,
    SessionStatus, UnitState, UnitStats, WorkUnitSpec, WORKER_API_KEY,
};

const MAX_NAME_LEN: usize = 63;
const CREDENTIAL_LEN: usize = 32;

const LABEL_INSTANCE: &str = "wahub.dev/instance";
const LABEL_OWNER: &str = "wahub.dev/owner";

/// Identity of the caller, resolved by the outer API layer.
#[derive(Debug, Clone, Copy)]
pub struct Requester {
    pub user_id: Uuid,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateInstanceSpec {
    pub name: String,
    pub description: Option<String>,
    pub template_id: Option<Uuid>,
    /// User config overrides, applied on top of defaults and template.
    pub config: HashMap<String, String>,
    /// Docker mode only: requested host port instead of an allocated one.
    pub custom_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateInstanceSpec {
    pub description: Option<String>,
    /// Full replacement of the override layer; only accepted while stopped.
    pub config: Option<HashMap<String, String>>,
}

pub struct Orchestrator {
    registry: Registry,
    adapter: Arc<dyn BackendAdapter>,
    allocator: PortAllocator,
    broadcaster: Arc<EventBroadcaster>,
    poller: SessionPoller,
    mode: DeploymentMode,
    stop_grace: Duration,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        adapter: Arc<dyn BackendAdapter>,
        allocator: PortAllocator,
        broadcaster: Arc<EventBroadcaster>,
        poller: SessionPoller,
        mode: DeploymentMode,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            adapter,
            allocator,
            broadcaster,
            poller,
            mode,
            stop_grace,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn authorize(&self, requester: &Requester, instance: &Instance) -> Result<()> {
        if requester.is_admin || requester.user_id == instance.owner_id {
            Ok(())
        } else {
            Err(HubError::Forbidden(format!(
                "instance {} belongs to another owner",
                instance.id
            )))
        }
    }

    // --- Create / read / update / delete ---

    #[instrument(skip(self, requester, spec), fields(name = %spec.name))]
    pub async fn create(
        &self,
        requester: &Requester,
        spec: CreateInstanceSpec,
    ) -> Result<Instance> {
        let name = validate_name(&spec.name)?;
        if self
            .registry
            .find_by_name(requester.user_id, &name)
            .await?
            .is_some()
        {
            return Err(HubError::Validation(format!(
                "instance name already in use: {name}"
            )));
        }

        let config = self
            .merge_config(requester, spec.template_id, spec.config)
            .await?;

        let assigned_port = match self.mode {
            DeploymentMode::Docker => Some(match spec.custom_port {
                Some(port) => self.allocator.validate_custom(port).await?,
                None => self.allocator.allocate().await?,
            }),
            DeploymentMode::Kubernetes => {
                if spec.custom_port.is_some() {
                    return Err(HubError::Validation(
                        "custom ports are not supported on the kubernetes backend".to_string(),
                    ));
                }
                None
            }
        };

        let now = Utc::now();
        let instance = Instance {
            id: Uuid::new_v4(),
            owner_id: requester.user_id,
            name,
            description: spec.description,
            assigned_port,
            backend_handle: None,
            status: InstanceStatus::Stopped,
            config,
            created_at: now,
            updated_at: now,
            last_started_at: None,
            last_stopped_at: None,
        };
        self.registry.insert_instance(&instance).await?;
        info!(instance = %instance.id, name = %instance.name, "instance created");
        self.broadcaster.broadcast(&LifecycleEvent::InstanceCreated {
            id: instance.id,
            name: instance.name.clone(),
        });
        Ok(instance)
    }

    /// Layered worker environment: hub defaults, then the template (explicit
    /// or the global default), then user overrides. A worker credential is
    /// generated unless one was supplied.
    async fn merge_config(
        &self,
        requester: &Requester,
        template_id: Option<Uuid>,
        overrides: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let mut config = HashMap::from([
            ("LOG_LEVEL".to_string(), "info".to_string()),
            ("WEBHOOK_ENABLED".to_string(), "false".to_string()),
        ]);

        let template = match template_id {
            Some(id) => {
                let template = self
                    .registry
                    .get_template(id)
                    .await?
                    .ok_or_else(|| HubError::NotFound(format!("template {id}")))?;
                if let Some(owner) = template.owner_id {
                    if owner != requester.user_id && !requester.is_admin {
                        return Err(HubError::Forbidden(format!(
                            "template {id} belongs to another owner"
                        )));
                    }
                }
                Some(template)
            }
            None => self.registry.default_template().await?,
        };
        if let Some(template) = template {
            config.extend(template.config);
        }
        config.extend(overrides);
        config
            .entry(WORKER_API_KEY.to_string())
            .or_insert_with(generate_credential);
        Ok(config)
    }

    pub async fn get(&self, requester: &Requester, id: Uuid) -> Result<Instance> {
        let instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;
        Ok(instance)
    }

    pub async fn list(&self, requester: &Requester) -> Result<Vec<Instance>> {
        let owner = if requester.is_admin {
            None
        } else {
            Some(requester.user_id)
        };
        self.registry.list_instances(owner).await
    }

    #[instrument(skip(self, requester, spec))]
    pub async fn update(
        &self,
        requester: &Requester,
        id: Uuid,
        spec: UpdateInstanceSpec,
    ) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;

        if let Some(description) = spec.description {
            instance.description = Some(description);
        }
        if let Some(overrides) = spec.config {
            if instance.status != InstanceStatus::Stopped {
                return Err(HubError::Validation(
                    "config can only change while the instance is stopped".to_string(),
                ));
            }
            // The generated credential survives config replacement unless
            // explicitly overridden.
            let credential = instance.config.get(WORKER_API_KEY).cloned();
            instance.config = overrides;
            if let Some(credential) = credential {
                instance
                    .config
                    .entry(WORKER_API_KEY.to_string())
                    .or_insert(credential);
            }
        }
        instance.updated_at = Utc::now();
        self.registry.update_instance(&instance).await?;
        Ok(instance)
    }

    /// Removes the instance unconditionally: the backend unit is torn down
    /// best-effort, the registry row (and its samples) always goes away.
    #[instrument(skip(self, requester))]
    pub async fn delete(&self, requester: &Requester, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;

            let instance = self.registry.get_instance(id).await?;
            self.authorize(requester, &instance)?;

            if let Some(handle) = instance.backend_handle.as_deref() {
                if let Err(e) = self.adapter.remove(handle, true).await {
                    warn!(instance = %id, "backend teardown failed, deleting anyway: {e}");
                }
            }
            self.registry.delete_instance(id).await?;
            info!(instance = %id, name = %instance.name, "instance deleted");
            self.broadcaster.broadcast(&LifecycleEvent::InstanceDeleted {
                id,
                name: instance.name,
            });
        }
        self.locks.remove(&id);
        Ok(())
    }

    // --- Lifecycle transitions ---

    #[instrument(skip(self, requester))]
    pub async fn start(&self, requester: &Requester, id: Uuid) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;

        if self.start_locked(&mut instance).await? {
            self.broadcaster.broadcast(&LifecycleEvent::InstanceStarted {
                id: instance.id,
                name: instance.name.clone(),
            });
        }
        Ok(instance)
    }

    /// Brings the instance's work unit up, creating it first if the backend
    /// no longer has it. Returns whether a transition actually happened
    /// (an already-running unit is a no-op). Caller holds the instance lock.
    async fn start_locked(&self, instance: &mut Instance) -> Result<bool> {
        if let Some(handle) = instance.backend_handle.clone() {
            match self.adapter.status(&handle).await {
                Ok(UnitState::Running) => {
                    if instance.status != InstanceStatus::Running {
                        // Registry drifted behind the backend.
                        self.mark_started(instance).await?;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Ok(UnitState::Pending) => {
                    self.adapter.start(&handle).await?;
                    self.mark_started(instance).await?;
                    return Ok(true);
                }
                Ok(UnitState::NotFound) | Err(AdapterError::NotFound(_)) => {
                    warn!(instance = %instance.id, %handle, "work unit vanished, recreating");
                    instance.backend_handle = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.mode == DeploymentMode::Docker && instance.assigned_port.is_none() {
            instance.assigned_port = Some(self.allocator.allocate().await?);
        }

        let unit_name = format!("wwebjs-{}", sanitize_unit_name(&instance.name));
        let spec = WorkUnitSpec {
            name: unit_name.clone(),
            env: instance.config.clone(),
            host_port: match self.mode {
                DeploymentMode::Docker => instance.assigned_port,
                DeploymentMode::Kubernetes => None,
            },
            session_volume: format!("{unit_name}-session"),
            labels: HashMap::from([
                (LABEL_INSTANCE.to_string(), instance.id.to_string()),
                (LABEL_OWNER.to_string(), instance.owner_id.to_string()),
            ]),
        };

        let handle = match self.adapter.create_work_unit(&spec).await {
            Ok(handle) => handle,
            // A leftover unit with our name is ours: reuse it.
            Err(AdapterError::AlreadyExists(_)) => unit_name,
            Err(e) => return Err(e.into()),
        };
        self.adapter.start(&handle).await?;
        instance.backend_handle = Some(handle);
        self.mark_started(instance).await?;
        Ok(true)
    }

    async fn mark_started(&self, instance: &mut Instance) -> Result<()> {
        let now = Utc::now();
        instance.status = InstanceStatus::Running;
        instance.last_started_at = Some(now);
        instance.updated_at = now;
        self.registry.update_instance(instance).await?;
        info!(instance = %instance.id, name = %instance.name, "instance started");
        Ok(())
    }

    /// Stops the work unit with the configured grace period. A missing unit
    /// (or no handle at all) still transitions the instance to stopped. The
    /// handle is retained so a later start reuses the unit.
    #[instrument(skip(self, requester))]
    pub async fn stop(&self, requester: &Requester, id: Uuid) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;

        if let Some(handle) = instance.backend_handle.as_deref() {
            match self.adapter.stop(handle, self.stop_grace).await {
                Ok(()) => {}
                Err(AdapterError::NotFound(_)) => {
                    warn!(instance = %id, %handle, "work unit already gone on stop");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        instance.status = InstanceStatus::Stopped;
        instance.last_stopped_at = Some(now);
        instance.updated_at = now;
        self.registry.update_instance(&instance).await?;
        info!(instance = %id, name = %instance.name, "instance stopped");
        self.broadcaster.broadcast(&LifecycleEvent::InstanceStopped {
            id: instance.id,
            name: instance.name.clone(),
        });
        Ok(instance)
    }

    /// Restart in place; if the backend lost the unit, fall back to the
    /// full start path so the unit is recreated.
    #[instrument(skip(self, requester))]
    pub async fn restart(&self, requester: &Requester, id: Uuid) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;

        match instance.backend_handle.clone() {
            Some(handle) => match self.adapter.restart(&handle, self.stop_grace).await {
                Ok(()) => self.mark_started(&mut instance).await?,
                Err(AdapterError::NotFound(_)) => {
                    warn!(instance = %id, %handle, "work unit vanished, recreating on restart");
                    instance.backend_handle = None;
                    self.start_locked(&mut instance).await?;
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                self.start_locked(&mut instance).await?;
            }
        }

        self.broadcaster
            .broadcast(&LifecycleEvent::InstanceRestarted {
                id: instance.id,
                name: instance.name.clone(),
            });
        Ok(instance)
    }

    /// Replica control, kubernetes mode only. Zero replicas counts as
    /// stopped; anything above as running.
    #[instrument(skip(self, requester))]
    pub async fn scale(&self, requester: &Requester, id: Uuid, replicas: i32) -> Result<Instance> {
        if self.mode != DeploymentMode::Kubernetes {
            return Err(HubError::Validation(
                "scaling is only available on the kubernetes backend".to_string(),
            ));
        }
        if replicas < 0 {
            return Err(HubError::Validation(format!(
                "replica count cannot be negative: {replicas}"
            )));
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut instance = self.registry.get_instance(id).await?;
        self.authorize(requester, &instance)?;

        let handle = instance.backend_handle.clone().ok_or_else(|| {
            HubError::Validation(format!("instance {id} has never been started"))
        })?;
        self.adapter.scale(&handle, replicas).await?;

        let now = Utc::now();
        if replicas > 0 {
            instance.status = InstanceStatus::Running;
            instance.last_started_at = Some(now);
        } else {
            instance.status = InstanceStatus::Stopped;
            instance.last_stopped_at = Some(now);
        }
        instance.updated_at = now;
        self.registry.update_instance(&instance).await?;
        info!(instance = %id, replicas, "instance scaled");
        self.broadcaster.broadcast(&LifecycleEvent::InstanceScaled {
            id: instance.id,
            name: instance.name.clone(),
            replicas,
        });
        Ok(instance)
    }

    // --- Observability passthroughs ---

    pub async fn stats(&self, requester: &Requester, id: Uuid) -> Result<UnitStats> {
        let instance = self.get(requester, id).await?;
        let handle = instance
            .backend_handle
            .as_deref()
            .ok_or_else(|| HubError::NotFound(format!("instance {id} has no work unit")))?;
        Ok(self.adapter.stats(handle).await?)
    }

    pub async fn logs(&self, requester: &Requester, id: Uuid, tail: i64) -> Result<String> {
        if tail < 0 {
            return Err(HubError::Validation(format!(
                "log tail cannot be negative: {tail}"
            )));
        }
        let instance = self.get(requester, id).await?;
        let handle = instance
            .backend_handle
            .as_deref()
            .ok_or_else(|| HubError::NotFound(format!("instance {id} has no work unit")))?;
        Ok(self.adapter.logs(handle, tail).await?)
    }

    pub async fn session_status(&self, requester: &Requester, id: Uuid) -> Result<SessionStatus> {
        let instance = self.get(requester, id).await?;
        Ok(self.poller.session_status(&instance).await)
    }

    pub async fn metric_samples(
        &self,
        requester: &Requester,
        id: Uuid,
        limit: i64,
    ) -> Result<Vec<wahub_common::MetricSample>> {
        let instance = self.get(requester, id).await?;
        self.registry.samples_for(instance.id, limit).await
    }
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(HubError::Validation("instance name cannot be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(HubError::Validation(format!(
            "instance name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(HubError::Validation(
            "instance name may only contain alphanumerics, '-', '_' and '.'".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn generate_credential() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name("  acct-1 ").unwrap(), "acct-1");
        assert_eq!(validate_name("My_App.2").unwrap(), "My_App.2");
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_credential_shape() {
        let credential = generate_credential();
        assert_eq!(credential.len(), 32);
        assert!(credential.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(credential, generate_credential());
    }
}
