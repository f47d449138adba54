//! Lifecycle orchestration core: registry, port allocation, per-instance
//! state machine, session polling, metrics collection and event fan-out.

pub mod allocator;
pub mod collector;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod poller;
pub mod registry;

pub use allocator::PortAllocator;
pub use collector::MetricsCollector;
pub use config::Settings;
pub use events::EventBroadcaster;
pub use lifecycle::{CreateInstanceSpec, Orchestrator, Requester, UpdateInstanceSpec};
pub use poller::SessionPoller;
pub use registry::Registry;

pub use wahub_backend::{select_backend, BackendConfig, DeploymentMode};
pub use wahub_common::{
    BackendAdapter, HubError, Instance, InstanceStatus, LifecycleEvent, MetricSample, Result,
    SessionStatus, Template, UnitState, UnitStats,
};
