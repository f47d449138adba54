//! Background resource-usage sampling for running instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::EventBroadcaster;
use crate::registry::Registry;
use wahub_common::{BackendAdapter, Instance, LifecycleEvent, MetricSample, Result};

struct CollectorTask {
    shutdown: watch::Sender<()>,
    handle: JoinHandle<()>,
}

/// Samples every running instance on a fixed interval, persists the samples
/// and fans them out to event subscribers. Old samples are pruned by an
/// explicit call, never as a side effect of sampling.
pub struct MetricsCollector {
    registry: Registry,
    adapter: Arc<dyn BackendAdapter>,
    broadcaster: Arc<EventBroadcaster>,
    interval: Duration,
    inner: Mutex<Option<CollectorTask>>,
}

impl MetricsCollector {
    pub fn new(
        registry: Registry,
        adapter: Arc<dyn BackendAdapter>,
        broadcaster: Arc<EventBroadcaster>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            adapter,
            broadcaster,
            interval,
            inner: Mutex::new(None),
        }
    }

    /// Spawns the sampling loop. Calling this while the loop is already
    /// running is a warned no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            warn!("metrics collector already running, ignoring start");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let collector = Arc::clone(self);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sampled = collector.collect_once().await;
                        debug!(sampled, "metrics tick complete");
                    }
                    _ = shutdown_rx.changed() => {
                        info!("metrics collector shutting down");
                        return;
                    }
                }
            }
        });

        *inner = Some(CollectorTask {
            shutdown: shutdown_tx,
            handle,
        });
        info!(interval_secs = self.interval.as_secs(), "metrics collector started");
    }

    /// Stops the sampling loop and waits for it to exit. Calling this while
    /// the loop is not running is a warned no-op.
    pub async fn stop(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.take()
        };
        match task {
            Some(task) => {
                let _ = task.shutdown.send(());
                if let Err(e) = task.handle.await {
                    warn!("metrics collector task join failed: {e}");
                }
            }
            None => warn!("metrics collector not running, ignoring stop"),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// One sampling pass. Instances whose backend probe fails are skipped
    /// with a warning; the rest still get their sample. Returns how many
    /// samples were recorded. An empty working set touches no backend at all.
    pub async fn collect_once(&self) -> usize {
        let instances = match self.registry.list_running().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("metrics tick could not list running instances: {e}");
                return 0;
            }
        };
        if instances.is_empty() {
            return 0;
        }

        let probes = instances.iter().map(|instance| self.sample_one(instance));
        join_all(probes).await.into_iter().filter(|ok| *ok).count()
    }

    async fn sample_one(&self, instance: &Instance) -> bool {
        // list_running only returns rows with a handle.
        let Some(handle) = instance.backend_handle.as_deref() else {
            return false;
        };
        let stats = match self.adapter.stats(handle).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(instance = %instance.id, "stats probe failed: {e}");
                return false;
            }
        };

        let sample = MetricSample {
            instance_id: instance.id,
            cpu_percent: stats.cpu_percent,
            mem_used_bytes: stats.mem_used_bytes,
            mem_limit_bytes: stats.mem_limit_bytes,
            net_rx_bytes: stats.net_rx_bytes,
            net_tx_bytes: stats.net_tx_bytes,
            estimated: stats.estimated,
            sampled_at: Utc::now(),
        };
        if let Err(e) = self.registry.insert_metric_sample(&sample).await {
            warn!(instance = %instance.id, "failed to persist metric sample: {e}");
            return false;
        }
        self.broadcaster.broadcast(&LifecycleEvent::MetricsSampled {
            id: instance.id,
            sample,
        });
        true
    }

    /// Deletes samples older than the retention window.
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        let removed = self.registry.prune_samples_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "pruned aged metric samples");
        }
        Ok(removed)
    }
}
