mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::MockAdapter;
use uuid::Uuid;

use wahub_common::{
    AdapterError, BackendAdapter, Instance, InstanceStatus, MetricSample, UnitStats,
};
use wahub_core::{EventBroadcaster, MetricsCollector, Registry};

struct Fixture {
    _dir: tempfile::TempDir,
    registry: Registry,
    broadcaster: Arc<EventBroadcaster>,
    collector: Arc<MetricsCollector>,
}

async fn fixture(adapter: MockAdapter) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::connect(&dir.path().join("hub.db")).await.unwrap();
    let broadcaster = Arc::new(EventBroadcaster::new());
    let adapter: Arc<dyn BackendAdapter> = Arc::new(adapter);
    let collector = Arc::new(MetricsCollector::new(
        registry.clone(),
        adapter,
        Arc::clone(&broadcaster),
        Duration::from_millis(50),
    ));
    Fixture {
        _dir: dir,
        registry,
        broadcaster,
        collector,
    }
}

async fn running_instance(registry: &Registry, name: &str, handle: &str) -> Instance {
    let now = Utc::now();
    let instance = Instance {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
        assigned_port: None,
        backend_handle: Some(handle.to_string()),
        status: InstanceStatus::Running,
        config: HashMap::new(),
        created_at: now,
        updated_at: now,
        last_started_at: Some(now),
        last_stopped_at: None,
    };
    registry.insert_instance(&instance).await.unwrap();
    instance
}

#[tokio::test]
async fn test_empty_tick_touches_no_backend() {
    // No expectations: any stats call would panic the mock.
    let f = fixture(MockAdapter::new()).await;
    assert_eq!(f.collector.collect_once().await, 0);
}

#[tokio::test]
async fn test_partial_failure_still_samples_the_rest() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_stats()
        .returning(|handle| match handle {
            "h-bad" => Err(AdapterError::Api("probe failed".to_string())),
            _ => Ok(UnitStats {
                cpu_percent: 12.5,
                mem_used_bytes: 64 << 20,
                mem_limit_bytes: 512 << 20,
                net_rx_bytes: 100,
                net_tx_bytes: 200,
                estimated: false,
            }),
        });

    let f = fixture(adapter).await;
    let healthy = running_instance(&f.registry, "acct-1", "h-ok").await;
    let broken = running_instance(&f.registry, "acct-2", "h-bad").await;

    let (_sub, mut rx) = f.broadcaster.subscribe();
    assert_eq!(f.collector.collect_once().await, 1);

    let samples = f.registry.samples_for(healthy.id, 10).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].cpu_percent, 12.5);
    assert!(!samples[0].estimated);
    assert!(f.registry.samples_for(broken.id, 10).await.unwrap().is_empty());

    assert!(rx.recv().await.unwrap().contains("metrics_sampled"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stopped_instances_are_not_sampled() {
    // list_running filters on status, so a stopped instance with a handle
    // must not reach the backend.
    let f = fixture(MockAdapter::new()).await;
    let mut instance = running_instance(&f.registry, "acct-1", "h-1").await;
    instance.status = InstanceStatus::Stopped;
    f.registry.update_instance(&instance).await.unwrap();

    assert_eq!(f.collector.collect_once().await, 0);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let f = fixture(MockAdapter::new()).await;

    assert!(!f.collector.is_running().await);
    f.collector.start().await;
    assert!(f.collector.is_running().await);
    // Second start is a warned no-op, not a second loop.
    f.collector.start().await;
    assert!(f.collector.is_running().await);

    f.collector.stop().await;
    assert!(!f.collector.is_running().await);
    // Stopping again is also a no-op.
    f.collector.stop().await;
    assert!(!f.collector.is_running().await);
}

#[tokio::test]
async fn test_background_loop_samples_on_interval() {
    let mut adapter = MockAdapter::new();
    adapter.expect_stats().returning(|_| Ok(UnitStats::default()));

    let f = fixture(adapter).await;
    let instance = running_instance(&f.registry, "acct-1", "h-1").await;

    f.collector.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    f.collector.stop().await;

    let samples = f.registry.samples_for(instance.id, 100).await.unwrap();
    assert!(!samples.is_empty());
}

#[tokio::test]
async fn test_prune_removes_only_aged_samples() {
    let f = fixture(MockAdapter::new()).await;
    let instance = running_instance(&f.registry, "acct-1", "h-1").await;

    let mut sample = MetricSample {
        instance_id: instance.id,
        cpu_percent: 1.0,
        mem_used_bytes: 1,
        mem_limit_bytes: 2,
        net_rx_bytes: 0,
        net_tx_bytes: 0,
        estimated: false,
        sampled_at: Utc::now() - chrono::Duration::days(31),
    };
    f.registry.insert_metric_sample(&sample).await.unwrap();
    sample.sampled_at = Utc::now();
    f.registry.insert_metric_sample(&sample).await.unwrap();

    let removed = f
        .collector
        .prune(Duration::from_secs(30 * 24 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(f.registry.samples_for(instance.id, 10).await.unwrap().len(), 1);
}
