//! Cluster backend over the Kubernetes control plane.
//!
//! Each instance owns three namespaced objects sharing its unit name: an
//! env ConfigMap, a Deployment, and a ClusterIP Service. Start/stop are
//! replica patches (stop scales to zero and keeps the objects around for a
//! fast restart); removal deletes all three.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource,
    Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use wahub_common::{
    AdapterError, AdapterResult, BackendAdapter, Instance, UnitState, UnitStats, WorkUnitSpec,
    WORKER_PORT,
};

/// Where the worker keeps its session files inside the pod.
const SESSION_DIR: &str = "/app/sessions";

const REQUEST_CPU: &str = "100m";
const REQUEST_MEMORY: &str = "256Mi";
const LIMIT_CPU: &str = "1";
const LIMIT_MEMORY: &str = "1Gi";

pub struct ClusterAdapter {
    client: Client,
    namespace: String,
    image: String,
}

impl ClusterAdapter {
    pub fn new(client: Client, namespace: String, image: String) -> Self {
        Self {
            client,
            namespace,
            image,
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn configmaps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create-or-replace, following the 404 branch the control plane gives
    /// us instead of racing a separate existence check.
    async fn apply_configmap(&self, configmap: ConfigMap) -> AdapterResult<()> {
        let api = self.configmaps();
        let name = configmap.metadata.name.clone().unwrap_or_default();
        match api.get(&name).await {
            Ok(_) => {
                api.replace(&name, &PostParams::default(), &configmap)
                    .await
                    .map_err(|e| classify(e, &name))?;
            }
            Err(kube::Error::Api(ref err)) if err.code == 404 => {
                api.create(&PostParams::default(), &configmap)
                    .await
                    .map_err(|e| classify(e, &name))?;
            }
            Err(e) => return Err(classify(e, &name)),
        }
        Ok(())
    }

    async fn apply_service(&self, service: Service) -> AdapterResult<()> {
        let api = self.services();
        let name = service.metadata.name.clone().unwrap_or_default();
        match api.get(&name).await {
            Ok(existing) => {
                // clusterIP is immutable; carry it over on replace.
                let mut service = service;
                service.metadata.resource_version = existing.metadata.resource_version.clone();
                if let (Some(spec), Some(existing_spec)) =
                    (service.spec.as_mut(), existing.spec.as_ref())
                {
                    spec.cluster_ip = existing_spec.cluster_ip.clone();
                }
                api.replace(&name, &PostParams::default(), &service)
                    .await
                    .map_err(|e| classify(e, &name))?;
            }
            Err(kube::Error::Api(ref err)) if err.code == 404 => {
                api.create(&PostParams::default(), &service)
                    .await
                    .map_err(|e| classify(e, &name))?;
            }
            Err(e) => return Err(classify(e, &name)),
        }
        Ok(())
    }

    async fn patch_replicas(&self, handle: &str, replicas: i32) -> AdapterResult<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(handle, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, handle))?;
        debug!(unit = %handle, replicas, "patched deployment replicas");
        Ok(())
    }

    /// Sums live pod usage from metrics.k8s.io. Returns (cpu cores, memory
    /// bytes); any failure bubbles up so the caller can fall back.
    async fn observed_usage(&self, handle: &str) -> AdapterResult<(f64, i64)> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods?labelSelector=app%3D{}",
            self.namespace, handle
        );
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| AdapterError::Api(e.to_string()))?;
        let body: serde_json::Value = self
            .client
            .request(request)
            .await
            .map_err(|e| AdapterError::Api(e.to_string()))?;

        let items = body["items"].as_array().cloned().unwrap_or_default();
        if items.is_empty() {
            return Err(AdapterError::Api(format!("no pod metrics for {handle}")));
        }

        let mut cpu_cores = 0.0;
        let mut mem_bytes = 0i64;
        for item in &items {
            for container in item["containers"].as_array().cloned().unwrap_or_default() {
                cpu_cores += parse_cpu_quantity(container["usage"]["cpu"].as_str().unwrap_or("0"));
                mem_bytes +=
                    parse_memory_quantity(container["usage"]["memory"].as_str().unwrap_or("0"));
            }
        }
        Ok((cpu_cores, mem_bytes))
    }
}

fn classify(err: kube::Error, what: &str) -> AdapterError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => AdapterError::NotFound(what.to_string()),
        kube::Error::Api(ref resp) if resp.code == 409 => {
            AdapterError::AlreadyExists(what.to_string())
        }
        other => AdapterError::Api(other.to_string()),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Parses a Kubernetes cpu quantity ("250m", "12345678n") into cores.
fn parse_cpu_quantity(quantity: &str) -> f64 {
    if let Some(n) = quantity.strip_suffix('n') {
        n.parse::<f64>().unwrap_or(0.0) / 1e9
    } else if let Some(u) = quantity.strip_suffix('u') {
        u.parse::<f64>().unwrap_or(0.0) / 1e6
    } else if let Some(m) = quantity.strip_suffix('m') {
        m.parse::<f64>().unwrap_or(0.0) / 1e3
    } else {
        quantity.parse::<f64>().unwrap_or(0.0)
    }
}

/// Parses a Kubernetes memory quantity ("512Mi", "1Gi", "1000k") into bytes.
fn parse_memory_quantity(quantity: &str) -> i64 {
    const BINARY: [(&str, i64); 4] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
    ];
    const DECIMAL: [(&str, i64); 3] = [("k", 1_000), ("M", 1_000_000), ("G", 1_000_000_000)];

    for (suffix, factor) in BINARY {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<f64>().map(|v| (v * factor as f64) as i64).unwrap_or(0);
        }
    }
    for (suffix, factor) in DECIMAL {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<f64>().map(|v| (v * factor as f64) as i64).unwrap_or(0);
        }
    }
    quantity.parse::<f64>().map(|v| v as i64).unwrap_or(0)
}

fn unit_labels(spec: &WorkUnitSpec) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = spec.labels.clone().into_iter().collect();
    labels.insert("app".to_string(), spec.name.clone());
    labels
}

fn configmap_name(handle: &str) -> String {
    format!("{handle}-env")
}

fn build_configmap(spec: &WorkUnitSpec, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name(&spec.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(unit_labels(spec)),
            ..Default::default()
        },
        data: Some(spec.env.clone().into_iter().collect()),
        ..Default::default()
    }
}

fn build_deployment(spec: &WorkUnitSpec, namespace: &str, image: &str) -> Deployment {
    let labels = unit_labels(spec);

    let container = Container {
        name: "worker".to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(WORKER_PORT),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: configmap_name(&spec.name),
                optional: None,
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: spec.session_volume.clone(),
            mount_path: SESSION_DIR.to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(REQUEST_CPU.to_string())),
                ("memory".to_string(), Quantity(REQUEST_MEMORY.to_string())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(LIMIT_CPU.to_string())),
                ("memory".to_string(), Quantity(LIMIT_MEMORY.to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: spec.session_volume.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]),
        termination_grace_period_seconds: Some(10),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            // Created dormant; the first start scales to one.
            replicas: Some(0),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(spec: &WorkUnitSpec, namespace: &str) -> Service {
    let labels = unit_labels(spec);
    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port: i32::from(WORKER_PORT),
                target_port: Some(IntOrString::Int(i32::from(WORKER_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Declared (requested, limited) resources of the worker container:
/// ((cpu cores, memory bytes), (cpu cores, memory bytes)).
fn declared_resources(deployment: &Deployment) -> ((f64, i64), (f64, i64)) {
    let resources = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.resources.as_ref());

    let read = |map: Option<&BTreeMap<String, Quantity>>| {
        let cpu = map
            .and_then(|m| m.get("cpu"))
            .map(|q| parse_cpu_quantity(&q.0))
            .unwrap_or(0.0);
        let memory = map
            .and_then(|m| m.get("memory"))
            .map(|q| parse_memory_quantity(&q.0))
            .unwrap_or(0);
        (cpu, memory)
    };

    (
        read(resources.and_then(|r| r.requests.as_ref())),
        read(resources.and_then(|r| r.limits.as_ref())),
    )
}

#[async_trait]
impl BackendAdapter for ClusterAdapter {
    async fn create_work_unit(&self, spec: &WorkUnitSpec) -> AdapterResult<String> {
        match self.deployments().get(&spec.name).await {
            Ok(_) => return Err(AdapterError::AlreadyExists(spec.name.clone())),
            Err(kube::Error::Api(ref err)) if err.code == 404 => {}
            Err(e) => return Err(classify(e, &spec.name)),
        }

        self.apply_configmap(build_configmap(spec, &self.namespace))
            .await?;
        self.deployments()
            .create(
                &PostParams::default(),
                &build_deployment(spec, &self.namespace, &self.image),
            )
            .await
            .map_err(|e| classify(e, &spec.name))?;
        self.apply_service(build_service(spec, &self.namespace))
            .await?;

        info!(unit = %spec.name, namespace = %self.namespace, "created workload objects");
        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> AdapterResult<()> {
        self.patch_replicas(handle, 1).await
    }

    async fn stop(&self, handle: &str, _grace: Duration) -> AdapterResult<()> {
        // Scale to zero; the deployment, service and configmap survive so a
        // restart does not have to rebuild them. The pod grace period comes
        // from the pod spec.
        self.patch_replicas(handle, 0).await
    }

    async fn restart(&self, handle: &str, _grace: Duration) -> AdapterResult<()> {
        let patch = serde_json::json!({
            "spec": {
                "replicas": 1,
                "template": {
                    "metadata": {
                        "annotations": {
                            "wahub.dev/restarted-at": chrono::Utc::now().to_rfc3339(),
                        }
                    }
                }
            }
        });
        self.deployments()
            .patch(handle, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, handle))?;
        Ok(())
    }

    async fn remove(&self, handle: &str, force: bool) -> AdapterResult<()> {
        match self.deployments().get(handle).await {
            Ok(deployment) => {
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                if ready > 0 && !force {
                    return Err(AdapterError::Api(format!("unit {handle} is still running")));
                }
            }
            Err(e) if is_not_found(&e) => return Err(AdapterError::NotFound(handle.to_string())),
            Err(e) => return Err(classify(e, handle)),
        }

        let params = DeleteParams::default();
        if let Err(e) = self.deployments().delete(handle, &params).await {
            if !is_not_found(&e) {
                return Err(classify(e, handle));
            }
        }
        if let Err(e) = self.services().delete(handle, &params).await {
            if !is_not_found(&e) {
                warn!(unit = %handle, error = %e, "failed to delete service");
            }
        }
        if let Err(e) = self.configmaps().delete(&configmap_name(handle), &params).await {
            if !is_not_found(&e) {
                warn!(unit = %handle, error = %e, "failed to delete configmap");
            }
        }

        info!(unit = %handle, "removed workload objects");
        Ok(())
    }

    async fn scale(&self, handle: &str, replicas: i32) -> AdapterResult<()> {
        self.patch_replicas(handle, replicas).await
    }

    async fn stats(&self, handle: &str) -> AdapterResult<UnitStats> {
        let deployment = self
            .deployments()
            .get(handle)
            .await
            .map_err(|e| classify(e, handle))?;
        let (requests, limits) = declared_resources(&deployment);

        match self.observed_usage(handle).await {
            Ok((cpu_cores, mem_used_bytes)) => Ok(UnitStats {
                cpu_percent: cpu_cores * 100.0,
                mem_used_bytes,
                mem_limit_bytes: limits.1,
                net_rx_bytes: 0,
                net_tx_bytes: 0,
                estimated: false,
            }),
            Err(e) => {
                debug!(unit = %handle, error = %e, "metrics endpoint unavailable, reporting declared resources");
                Ok(UnitStats {
                    cpu_percent: requests.0 * 100.0,
                    mem_used_bytes: requests.1,
                    mem_limit_bytes: limits.1,
                    net_rx_bytes: 0,
                    net_tx_bytes: 0,
                    estimated: true,
                })
            }
        }
    }

    async fn logs(&self, handle: &str, tail: i64) -> AdapterResult<String> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("app={handle}")))
            .await
            .map_err(|e| classify(e, handle))?;
        let pod_name = pods
            .items
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| AdapterError::NotFound(format!("no pods for {handle}")))?;

        self.pods()
            .logs(
                &pod_name,
                &LogParams {
                    tail_lines: Some(tail),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, handle))
    }

    async fn status(&self, handle: &str) -> AdapterResult<UnitState> {
        match self.deployments().get(handle).await {
            Ok(deployment) => {
                let available = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0);
                if available > 0 {
                    Ok(UnitState::Running)
                } else {
                    Ok(UnitState::Pending)
                }
            }
            Err(e) if is_not_found(&e) => Ok(UnitState::NotFound),
            Err(e) => Err(classify(e, handle)),
        }
    }

    fn endpoint(&self, instance: &Instance) -> Option<String> {
        // Name-based service discovery: the service shares the handle.
        instance.backend_handle.as_ref().map(|handle| {
            format!(
                "http://{handle}.{}.svc.cluster.local:{WORKER_PORT}",
                self.namespace
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec() -> WorkUnitSpec {
        WorkUnitSpec {
            name: "wwebjs-acct-1".to_string(),
            env: HashMap::from([("API_KEY".to_string(), "k1".to_string())]),
            host_port: None,
            session_volume: "wwebjs-acct-1-session".to_string(),
            labels: HashMap::from([("wahub.dev/instance".to_string(), "i1".to_string())]),
        }
    }

    #[test]
    fn test_cpu_quantity_parsing() {
        assert!((parse_cpu_quantity("250m") - 0.25).abs() < 1e-9);
        assert!((parse_cpu_quantity("1500000000n") - 1.5).abs() < 1e-9);
        assert!((parse_cpu_quantity("2") - 2.0).abs() < 1e-9);
        assert_eq!(parse_cpu_quantity("garbage"), 0.0);
    }

    #[test]
    fn test_memory_quantity_parsing() {
        assert_eq!(parse_memory_quantity("512Mi"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("1Gi"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("1000k"), 1_000_000);
        assert_eq!(parse_memory_quantity("12345"), 12345);
    }

    #[test]
    fn test_deployment_created_dormant() {
        let deployment = build_deployment(&spec(), "wahub", "wwebjs-api:latest");
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(0));
        let labels = spec.selector.match_labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("wwebjs-acct-1"));
    }

    #[test]
    fn test_configmap_carries_env() {
        let configmap = build_configmap(&spec(), "wahub");
        assert_eq!(
            configmap.metadata.name.as_deref(),
            Some("wwebjs-acct-1-env")
        );
        assert_eq!(
            configmap.data.unwrap().get("API_KEY").map(String::as_str),
            Some("k1")
        );
    }

    #[test]
    fn test_service_targets_worker_port() {
        let service = build_service(&spec(), "wahub");
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, 3000);
    }

    #[test]
    fn test_declared_resources_fallback_values() {
        let deployment = build_deployment(&spec(), "wahub", "img");
        let (requests, limits) = declared_resources(&deployment);
        assert!((requests.0 - 0.1).abs() < 1e-9);
        assert_eq!(requests.1, 256 * 1024 * 1024);
        assert_eq!(limits.1, 1024 * 1024 * 1024);
    }
}
