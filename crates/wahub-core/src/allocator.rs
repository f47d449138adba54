//! Host-port allocation for container-mode instances.
//!
//! A wrapping counter persisted in the registry gives monotonic candidates;
//! each candidate is checked against assigned ports before being handed out.

use crate::registry::Registry;
use wahub_common::{HubError, Result};

pub struct PortAllocator {
    registry: Registry,
    min: u16,
    max: u16,
}

impl PortAllocator {
    pub fn new(registry: Registry, min: u16, max: u16) -> Self {
        Self { registry, min, max }
    }

    /// Returns the next counter value and persists its wrapping successor.
    async fn next_candidate(&self) -> Result<u16> {
        let current = match self.registry.load_port_counter().await? {
            Some(port) if (self.min..=self.max).contains(&port) => port,
            _ => self.min,
        };
        let successor = if current >= self.max {
            self.min
        } else {
            current + 1
        };
        self.registry.store_port_counter(successor).await?;
        Ok(current)
    }

    /// Allocates a free port in the configured range, skipping ports already
    /// assigned to an instance. Errors when the whole range is taken.
    pub async fn allocate(&self) -> Result<u16> {
        let range_size = u32::from(self.max - self.min) + 1;
        for _ in 0..range_size {
            let candidate = self.next_candidate().await?;
            if self.registry.find_by_port(candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(HubError::Validation(format!(
            "no free ports left in range [{}, {}]",
            self.min, self.max
        )))
    }

    /// Validates a caller-supplied port: in range and not already assigned.
    pub async fn validate_custom(&self, port: u16) -> Result<u16> {
        if !(self.min..=self.max).contains(&port) {
            return Err(HubError::Validation(format!(
                "port {port} outside allowed range [{}, {}]",
                self.min, self.max
            )));
        }
        if let Some(holder) = self.registry.find_by_port(port).await? {
            return Err(HubError::Validation(format!(
                "port {port} already assigned to instance {}",
                holder.id
            )));
        }
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;
    use wahub_common::{Instance, InstanceStatus};

    async fn scratch() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::connect(&dir.path().join("test.db")).await.unwrap();
        (dir, registry)
    }

    async fn occupy(registry: &Registry, port: u16) {
        let now = Utc::now();
        registry
            .insert_instance(&Instance {
                id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                name: format!("holder-{port}"),
                description: None,
                assigned_port: Some(port),
                backend_handle: None,
                status: InstanceStatus::Stopped,
                config: HashMap::new(),
                created_at: now,
                updated_at: now,
                last_started_at: None,
                last_stopped_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequential_allocation() {
        let (_dir, registry) = scratch().await;
        let allocator = PortAllocator::new(registry, 21000, 21005);
        assert_eq!(allocator.allocate().await.unwrap(), 21000);
        assert_eq!(allocator.allocate().await.unwrap(), 21001);
    }

    #[tokio::test]
    async fn test_skips_assigned_ports() {
        let (_dir, registry) = scratch().await;
        occupy(&registry, 21000).await;
        occupy(&registry, 21001).await;
        let allocator = PortAllocator::new(registry, 21000, 21005);
        assert_eq!(allocator.allocate().await.unwrap(), 21002);
    }

    #[tokio::test]
    async fn test_wraps_around_range_end() {
        let (_dir, registry) = scratch().await;
        registry.store_port_counter(21002).await.unwrap();
        let allocator = PortAllocator::new(registry, 21000, 21002);
        assert_eq!(allocator.allocate().await.unwrap(), 21002);
        assert_eq!(allocator.allocate().await.unwrap(), 21000);
    }

    #[tokio::test]
    async fn test_exhausted_range_errors() {
        let (_dir, registry) = scratch().await;
        occupy(&registry, 21000).await;
        occupy(&registry, 21001).await;
        let allocator = PortAllocator::new(registry, 21000, 21001);
        assert!(matches!(
            allocator.allocate().await,
            Err(HubError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_port_validation() {
        let (_dir, registry) = scratch().await;
        occupy(&registry, 21003).await;
        let allocator = PortAllocator::new(registry, 21000, 21010);
        assert_eq!(allocator.validate_custom(21005).await.unwrap(), 21005);
        assert!(allocator.validate_custom(20999).await.is_err());
        assert!(allocator.validate_custom(21003).await.is_err());
    }
}
