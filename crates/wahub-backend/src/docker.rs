//! Single-host backend over the local Docker daemon.
//!
//! One named container per instance, joined to a shared bridge network,
//! with the session store on a named volume and the worker API published
//! on the instance's assigned host port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use wahub_common::{
    AdapterError, AdapterResult, BackendAdapter, Instance, UnitState, UnitStats, WorkUnitSpec,
    WORKER_PORT,
};

/// Where the worker keeps its session files inside the container.
const SESSION_DIR: &str = "/app/sessions";

pub struct DockerAdapter {
    docker: Arc<Docker>,
    image: String,
    network: String,
}

impl DockerAdapter {
    /// Connects the adapter to an existing client and makes sure the shared
    /// worker network exists (creation is idempotent by name).
    pub async fn new(docker: Arc<Docker>, image: String, network: String) -> AdapterResult<Self> {
        let adapter = Self {
            docker,
            image,
            network,
        };
        adapter.ensure_network().await?;
        Ok(adapter)
    }

    async fn ensure_network(&self) -> AdapterResult<()> {
        let options = CreateNetworkOptions {
            name: self.network.clone(),
            check_duplicate: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!(network = %self.network, "created worker network");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(AdapterError::Api(e.to_string())),
        }
    }

    async fn ensure_session_volume(&self, spec: &WorkUnitSpec) -> AdapterResult<()> {
        match self.docker.inspect_volume(&spec.session_volume).await {
            Ok(_) => {
                debug!(volume = %spec.session_volume, "session volume already exists");
                Ok(())
            }
            Err(_) => {
                let options = CreateVolumeOptions {
                    name: spec.session_volume.clone(),
                    driver: "local".to_string(),
                    labels: spec.labels.clone(),
                    ..Default::default()
                };
                self.docker
                    .create_volume(options)
                    .await
                    .map_err(|e| AdapterError::Api(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn pull_image(&self) {
        let pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        // Pull failures are tolerated here; create_container reports a
        // clear error if the image is genuinely absent.
        let _: Vec<_> = pull.collect().await;
    }
}

fn classify(err: BollardError, what: &str) -> AdapterError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => AdapterError::NotFound(what.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409, ..
        } => AdapterError::AlreadyExists(what.to_string()),
        other => AdapterError::Api(other.to_string()),
    }
}

/// Docker answers 304 when a container is already in the requested state.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn compute_cpu_percent(cpu_delta: f64, system_delta: f64, online_cpus: f64) -> f64 {
    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    }
}

fn port_bindings_for(host_port: u16) -> HashMap<String, Option<Vec<PortBinding>>> {
    let mut bindings = HashMap::new();
    bindings.insert(
        format!("{WORKER_PORT}/tcp"),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    );
    bindings
}

#[async_trait]
impl BackendAdapter for DockerAdapter {
    async fn create_work_unit(&self, spec: &WorkUnitSpec) -> AdapterResult<String> {
        self.ensure_session_volume(spec).await?;
        self.pull_image().await;

        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{WORKER_PORT}/tcp"), HashMap::new());

        let host_config = HostConfig {
            port_bindings: spec.host_port.map(port_bindings_for),
            binds: Some(vec![format!("{}:{SESSION_DIR}", spec.session_volume)]),
            network_mode: Some(self.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(self.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| classify(e, &spec.name))?;

        info!(unit = %spec.name, "created container");
        // The name is the handle; every engine call accepts it.
        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> AdapterResult<()> {
        match self.docker.start_container::<String>(handle, None).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(unit = %handle, "container already running");
                Ok(())
            }
            Err(e) => Err(classify(e, handle)),
        }
    }

    async fn stop(&self, handle: &str, grace: Duration) -> AdapterResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(unit = %handle, "container already stopped");
                Ok(())
            }
            Err(e) => Err(classify(e, handle)),
        }
    }

    async fn restart(&self, handle: &str, grace: Duration) -> AdapterResult<()> {
        let options = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        self.docker
            .restart_container(handle, Some(options))
            .await
            .map_err(|e| classify(e, handle))
    }

    async fn remove(&self, handle: &str, force: bool) -> AdapterResult<()> {
        let inspect = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, handle))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if running && !force {
            return Err(AdapterError::Api(format!("unit {handle} is still running")));
        }

        let volumes: Vec<String> = inspect
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.name)
            .collect();

        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, handle))?;

        for volume in volumes {
            if let Err(e) = self
                .docker
                .remove_volume(&volume, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                warn!(%volume, error = %e, "failed to remove session volume");
            }
        }

        info!(unit = %handle, "removed container");
        Ok(())
    }

    async fn scale(&self, handle: &str, replicas: i32) -> AdapterResult<()> {
        // No replica concept on a single host: 0 collapses to stop,
        // anything positive to start.
        if replicas > 0 {
            self.start(handle).await
        } else {
            self.stop(handle, Duration::from_secs(10)).await
        }
    }

    async fn stats(&self, handle: &str) -> AdapterResult<UnitStats> {
        let mut stream = self.docker.stats(
            handle,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| AdapterError::Api(format!("no stats reported for {handle}")))?
            .map_err(|e| classify(e, handle))?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
            as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;

        let (net_rx, net_tx) = stats
            .networks
            .unwrap_or_default()
            .values()
            .fold((0u64, 0u64), |(rx, tx), net| {
                (rx + net.rx_bytes, tx + net.tx_bytes)
            });

        Ok(UnitStats {
            cpu_percent: compute_cpu_percent(cpu_delta, system_delta, online_cpus),
            mem_used_bytes: stats.memory_stats.usage.unwrap_or(0) as i64,
            mem_limit_bytes: stats.memory_stats.limit.unwrap_or(0) as i64,
            net_rx_bytes: net_rx as i64,
            net_tx_bytes: net_tx as i64,
            estimated: false,
        })
    }

    async fn logs(&self, handle: &str, tail: i64) -> AdapterResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(handle, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(e, handle))?;
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    async fn status(&self, handle: &str) -> AdapterResult<UnitState> {
        match self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running {
                    Ok(UnitState::Running)
                } else {
                    Ok(UnitState::Pending)
                }
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(UnitState::NotFound),
            Err(e) => Err(classify(e, handle)),
        }
    }

    fn endpoint(&self, instance: &Instance) -> Option<String> {
        instance
            .assigned_port
            .map(|port| format!("http://127.0.0.1:{port}"))
    }
}
