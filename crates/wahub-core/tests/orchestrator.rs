mod common;

use common::*;
use mockall::predicate::eq;
use wahub_common::{AdapterError, HubError, InstanceStatus, UnitState, WORKER_API_KEY};
use wahub_core::{CreateInstanceSpec, DeploymentMode, UpdateInstanceSpec};

#[tokio::test]
async fn test_create_starts_stopped_with_port_and_credential() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();

    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert_eq!(instance.backend_handle, None);
    let port = instance.assigned_port.unwrap();
    assert!((21000..=22000).contains(&port));
    assert_eq!(instance.config.get(WORKER_API_KEY).map(String::len), Some(32));
    assert_eq!(instance.config.get("LOG_LEVEL").map(String::as_str), Some("info"));

    let loaded = h.orchestrator.get(&req, instance.id).await.unwrap();
    assert_eq!(loaded.status, InstanceStatus::Stopped);
    assert_eq!(loaded.backend_handle, None);
}

#[tokio::test]
async fn test_created_instances_get_distinct_ports() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();

    let a = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    let b = h.orchestrator.create(&req, create_spec("acct-2")).await.unwrap();

    assert_ne!(a.assigned_port, b.assigned_port);
}

#[tokio::test]
async fn test_duplicate_name_rejected_per_owner() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();

    h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    let err = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap_err();
    assert!(matches!(err, HubError::Validation(_)));

    // Another owner may reuse the name.
    h.orchestrator
        .create(&owner(), create_spec("acct-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_custom_port_honored_and_conflicts_rejected() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();

    let spec = CreateInstanceSpec {
        custom_port: Some(21500),
        ..create_spec("acct-1")
    };
    let instance = h.orchestrator.create(&req, spec).await.unwrap();
    assert_eq!(instance.assigned_port, Some(21500));

    let clash = CreateInstanceSpec {
        custom_port: Some(21500),
        ..create_spec("acct-2")
    };
    assert!(matches!(
        h.orchestrator.create(&req, clash).await,
        Err(HubError::Validation(_))
    ));

    let outside = CreateInstanceSpec {
        custom_port: Some(9000),
        ..create_spec("acct-3")
    };
    assert!(matches!(
        h.orchestrator.create(&req, outside).await,
        Err(HubError::Validation(_))
    ));
}

#[tokio::test]
async fn test_kubernetes_rejects_custom_port() {
    let h = harness(MockAdapter::new(), DeploymentMode::Kubernetes).await;
    let spec = CreateInstanceSpec {
        custom_port: Some(21500),
        ..create_spec("acct-1")
    };
    assert!(matches!(
        h.orchestrator.create(&owner(), spec).await,
        Err(HubError::Validation(_))
    ));

    // Without a custom port, kubernetes instances carry no host port.
    let instance = h
        .orchestrator
        .create(&owner(), create_spec("acct-2"))
        .await
        .unwrap();
    assert_eq!(instance.assigned_port, None);
}

#[tokio::test]
async fn test_concurrent_starts_create_one_work_unit() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_create_work_unit()
        .times(1)
        .returning(|spec| Ok(spec.name.clone()));
    adapter.expect_start().times(1).returning(|_| Ok(()));
    // The loser of the race sees the winner's handle already running.
    adapter
        .expect_status()
        .returning(|_| Ok(UnitState::Running));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let (a, b) = tokio::join!(
        orchestrator.start(&req, instance.id),
        h.orchestrator.start(&req, instance.id),
    );
    a.unwrap();
    b.unwrap();

    let loaded = h.orchestrator.get(&req, instance.id).await.unwrap();
    assert_eq!(loaded.status, InstanceStatus::Running);
    assert_eq!(loaded.backend_handle.as_deref(), Some("wwebjs-acct-1"));
}

#[tokio::test]
async fn test_docker_lifecycle_reuses_unit_across_stop_start() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_create_work_unit()
        .times(1)
        .withf(|spec| {
            spec.name == "wwebjs-acct-1"
                && spec.host_port == Some(21000)
                && spec.session_volume == "wwebjs-acct-1-session"
                && spec.env.contains_key(WORKER_API_KEY)
        })
        .returning(|spec| Ok(spec.name.clone()));
    adapter
        .expect_start()
        .with(eq("wwebjs-acct-1"))
        .times(2)
        .returning(|_| Ok(()));
    adapter
        .expect_stop()
        .times(1)
        .returning(|_, _| Ok(()));
    // Second start finds the stopped unit and restarts it in place.
    adapter
        .expect_status()
        .times(1)
        .returning(|_| Ok(UnitState::Pending));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    let started = h.orchestrator.start(&req, instance.id).await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert_eq!(started.backend_handle.as_deref(), Some("wwebjs-acct-1"));
    assert!(started.last_started_at.is_some());

    let stopped = h.orchestrator.stop(&req, instance.id).await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    // The handle survives a stop so the unit (and its session volume) is reused.
    assert_eq!(stopped.backend_handle.as_deref(), Some("wwebjs-acct-1"));
    assert!(stopped.last_stopped_at.is_some());

    let restarted = h.orchestrator.start(&req, instance.id).await.unwrap();
    assert_eq!(restarted.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_stop_without_unit_is_noop_success() {
    // No expectations: any backend call would panic the mock.
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    let stopped = h.orchestrator.stop(&req, instance.id).await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert_eq!(stopped.backend_handle, None);
}

#[tokio::test]
async fn test_restart_recreates_vanished_unit() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_restart()
        .times(1)
        .returning(|handle, _| Err(AdapterError::NotFound(handle.to_string())));
    adapter
        .expect_create_work_unit()
        .times(1)
        .returning(|spec| Ok(spec.name.clone()));
    adapter.expect_start().times(1).returning(|_| Ok(()));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let req = owner();
    let created = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    // Simulate an instance whose unit was removed behind the hub's back.
    let mut instance = h.registry.get_instance(created.id).await.unwrap();
    instance.backend_handle = Some("wwebjs-acct-1".to_string());
    h.registry.update_instance(&instance).await.unwrap();

    let restarted = h.orchestrator.restart(&req, created.id).await.unwrap();
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(restarted.backend_handle.as_deref(), Some("wwebjs-acct-1"));
}

#[tokio::test]
async fn test_delete_survives_backend_teardown_failure() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_remove()
        .times(1)
        .returning(|_, _| Err(AdapterError::Api("engine unreachable".to_string())));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let req = owner();
    let created = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    let mut instance = h.registry.get_instance(created.id).await.unwrap();
    instance.backend_handle = Some("wwebjs-acct-1".to_string());
    h.registry.update_instance(&instance).await.unwrap();

    h.orchestrator.delete(&req, created.id).await.unwrap();
    assert!(h.registry.find_instance(created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_frees_assigned_port() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();

    let spec = CreateInstanceSpec {
        custom_port: Some(21500),
        ..create_spec("acct-1")
    };
    let instance = h.orchestrator.create(&req, spec.clone()).await.unwrap();
    h.orchestrator.delete(&req, instance.id).await.unwrap();

    let again = CreateInstanceSpec {
        custom_port: Some(21500),
        ..create_spec("acct-2")
    };
    let reused = h.orchestrator.create(&req, again).await.unwrap();
    assert_eq!(reused.assigned_port, Some(21500));
}

#[tokio::test]
async fn test_kubernetes_scale_drives_status() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_create_work_unit()
        .times(1)
        .returning(|spec| Ok(spec.name.clone()));
    adapter.expect_start().times(1).returning(|_| Ok(()));
    adapter
        .expect_scale()
        .with(eq("wwebjs-acct-1"), eq(3))
        .times(1)
        .returning(|_, _| Ok(()));
    adapter
        .expect_scale()
        .with(eq("wwebjs-acct-1"), eq(0))
        .times(1)
        .returning(|_, _| Ok(()));

    let h = harness(adapter, DeploymentMode::Kubernetes).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    h.orchestrator.start(&req, instance.id).await.unwrap();

    let up = h.orchestrator.scale(&req, instance.id, 3).await.unwrap();
    assert_eq!(up.status, InstanceStatus::Running);

    // Scale to zero stops without deleting the unit.
    let down = h.orchestrator.scale(&req, instance.id, 0).await.unwrap();
    assert_eq!(down.status, InstanceStatus::Stopped);
    assert_eq!(down.backend_handle.as_deref(), Some("wwebjs-acct-1"));
}

#[tokio::test]
async fn test_scale_rejected_on_docker_and_for_negative_replicas() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    assert!(matches!(
        h.orchestrator.scale(&req, instance.id, 2).await,
        Err(HubError::Validation(_))
    ));

    let hk = harness(MockAdapter::new(), DeploymentMode::Kubernetes).await;
    let instance = hk.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    assert!(matches!(
        hk.orchestrator.scale(&req, instance.id, -1).await,
        Err(HubError::Validation(_))
    ));
}

#[tokio::test]
async fn test_non_owner_is_forbidden() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    let stranger = owner();
    assert!(matches!(
        h.orchestrator.get(&stranger, instance.id).await,
        Err(HubError::Forbidden(_))
    ));
    assert!(matches!(
        h.orchestrator.start(&stranger, instance.id).await,
        Err(HubError::Forbidden(_))
    ));
    assert!(matches!(
        h.orchestrator.delete(&stranger, instance.id).await,
        Err(HubError::Forbidden(_))
    ));

    // Admins see and manage everything.
    let admin = wahub_core::Requester {
        user_id: uuid::Uuid::new_v4(),
        is_admin: true,
    };
    h.orchestrator.get(&admin, instance.id).await.unwrap();
    assert_eq!(h.orchestrator.list(&admin).await.unwrap().len(), 1);
    assert!(h.orchestrator.list(&stranger).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_config_update_only_while_stopped() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_create_work_unit()
        .returning(|spec| Ok(spec.name.clone()));
    adapter.expect_start().returning(|_| Ok(()));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    let credential = instance.config.get(WORKER_API_KEY).cloned().unwrap();

    let updated = h
        .orchestrator
        .update(
            &req,
            instance.id,
            UpdateInstanceSpec {
                description: Some("billing account".to_string()),
                config: Some(config_of(&[("LOG_LEVEL", "debug")])),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.description.as_deref(), Some("billing account"));
    assert_eq!(updated.config.get("LOG_LEVEL").map(String::as_str), Some("debug"));
    // Credential is preserved across config replacement.
    assert_eq!(updated.config.get(WORKER_API_KEY), Some(&credential));

    h.orchestrator.start(&req, instance.id).await.unwrap();
    let err = h
        .orchestrator
        .update(
            &req,
            instance.id,
            UpdateInstanceSpec {
                description: None,
                config: Some(config_of(&[("LOG_LEVEL", "warn")])),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Validation(_)));

    // Description alone is fine while running.
    h.orchestrator
        .update(
            &req,
            instance.id,
            UpdateInstanceSpec {
                description: Some("renamed".to_string()),
                config: None,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_reach_subscribers() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_create_work_unit()
        .returning(|spec| Ok(spec.name.clone()));
    adapter.expect_start().returning(|_| Ok(()));
    adapter.expect_stop().returning(|_, _| Ok(()));

    let h = harness(adapter, DeploymentMode::Docker).await;
    let (_sub, mut rx) = h.broadcaster.subscribe();
    let req = owner();

    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();
    h.orchestrator.start(&req, instance.id).await.unwrap();
    h.orchestrator.stop(&req, instance.id).await.unwrap();

    assert!(rx.recv().await.unwrap().contains("instance_created"));
    assert!(rx.recv().await.unwrap().contains("instance_started"));
    assert!(rx.recv().await.unwrap().contains("instance_stopped"));
}

#[tokio::test]
async fn test_stats_and_logs_require_a_unit() {
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    assert!(matches!(
        h.orchestrator.stats(&req, instance.id).await,
        Err(HubError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.logs(&req, instance.id, 100).await,
        Err(HubError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_negative_log_tail_rejected() {
    // Rejected before the registry or the backend is consulted.
    let h = harness(MockAdapter::new(), DeploymentMode::Docker).await;
    let req = owner();
    let instance = h.orchestrator.create(&req, create_spec("acct-1")).await.unwrap();

    assert!(matches!(
        h.orchestrator.logs(&req, instance.id, -5).await,
        Err(HubError::Validation(_))
    ));
}
