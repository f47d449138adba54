#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use uuid::Uuid;

use wahub_common::{
    AdapterResult, BackendAdapter, Instance, UnitState, UnitStats, WorkUnitSpec,
};
use wahub_core::{
    CreateInstanceSpec, DeploymentMode, EventBroadcaster, Orchestrator, PortAllocator, Registry,
    Requester, SessionPoller,
};

mock! {
    pub Adapter {}

    #[async_trait]
    impl BackendAdapter for Adapter {
        async fn create_work_unit(&self, spec: &WorkUnitSpec) -> AdapterResult<String>;
        async fn start(&self, handle: &str) -> AdapterResult<()>;
        async fn stop(&self, handle: &str, grace: Duration) -> AdapterResult<()>;
        async fn restart(&self, handle: &str, grace: Duration) -> AdapterResult<()>;
        async fn remove(&self, handle: &str, force: bool) -> AdapterResult<()>;
        async fn scale(&self, handle: &str, replicas: i32) -> AdapterResult<()>;
        async fn stats(&self, handle: &str) -> AdapterResult<UnitStats>;
        async fn logs(&self, handle: &str, tail: i64) -> AdapterResult<String>;
        async fn status(&self, handle: &str) -> AdapterResult<UnitState>;
        fn endpoint(&self, instance: &Instance) -> Option<String>;
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub registry: Registry,
    pub broadcaster: Arc<EventBroadcaster>,
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn harness(adapter: MockAdapter, mode: DeploymentMode) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::connect(&dir.path().join("hub.db")).await.unwrap();
    let adapter: Arc<dyn BackendAdapter> = Arc::new(adapter);
    let broadcaster = Arc::new(EventBroadcaster::new());
    let allocator = PortAllocator::new(registry.clone(), 21000, 22000);
    let poller = SessionPoller::new(Arc::clone(&adapter), Duration::from_secs(2)).unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        adapter,
        allocator,
        Arc::clone(&broadcaster),
        poller,
        mode,
        Duration::from_secs(5),
    ));
    Harness {
        _dir: dir,
        registry,
        broadcaster,
        orchestrator,
    }
}

pub fn owner() -> Requester {
    Requester {
        user_id: Uuid::new_v4(),
        is_admin: false,
    }
}

pub fn create_spec(name: &str) -> CreateInstanceSpec {
    CreateInstanceSpec {
        name: name.to_string(),
        ..Default::default()
    }
}

pub fn config_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
