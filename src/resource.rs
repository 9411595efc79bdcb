//! Resource manager: arbitrates named logical resources (capacity +
//! exclusion) across parallel steps. Each named resource is backed by a
//! counting semaphore; acquiring a set of names is all-or-nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::errors::ResourceLimitError;

/// Default capacity for a resource that has not been explicitly configured
/// (§4.4: "models each resource as a counted semaphore with capacity 1
/// unless configured otherwise").
const DEFAULT_CAPACITY: usize = 1;

struct ResourcePool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Tracks which step currently holds which permits, keyed by step name, so
/// that releases are idempotent and scoped to the caller that acquired them.
pub struct ResourceManager {
    pools: Mutex<HashMap<String, ResourcePool>>,
    holders: Mutex<HashMap<String, HashMap<String, Vec<OwnedSemaphorePermit>>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-configure a named resource pool's capacity. Production
    /// deployments should call this for CPU/memory pools before any step
    /// attempts to acquire them.
    pub async fn configure(&self, name: impl Into<String>, capacity: usize) {
        let mut pools = self.pools.lock().await;
        pools.insert(
            name.into(),
            ResourcePool {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
            },
        );
    }

    async fn pool_for(&self, name: &str) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().await;
        pools
            .entry(name.to_string())
            .or_insert_with(|| ResourcePool {
                semaphore: Arc::new(Semaphore::new(DEFAULT_CAPACITY)),
                capacity: DEFAULT_CAPACITY,
            })
            .semaphore
            .clone()
    }

    pub async fn is_resource_available(&self, name: &str) -> bool {
        self.pool_for(name).await.available_permits() > 0
    }

    /// Acquires every named resource for `step_name`, all-or-nothing: if any
    /// requested resource is unavailable, every permit already acquired in
    /// this call is dropped immediately and `false` is returned (or the
    /// deadline elapses and the same happens).
    pub async fn acquire(&self, step_name: &str, names: &[String], timeout: Option<std::time::Duration>) -> Result<bool, ResourceLimitError> {
        let mut acquired: Vec<(String, OwnedSemaphorePermit)> = Vec::with_capacity(names.len());

        for name in names {
            let semaphore = self.pool_for(name).await;
            let permit = match timeout {
                Some(duration) => match tokio::time::timeout(duration, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    _ => return Ok(false),
                },
                None => match semaphore.try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => return Ok(false),
                },
            };
            acquired.push((name.clone(), permit));
        }

        let mut holders = self.holders.lock().await;
        let step_holders = holders.entry(step_name.to_string()).or_default();
        for (name, permit) in acquired {
            step_holders.entry(name).or_default().push(permit);
        }
        Ok(true)
    }

    /// Releases every permit `step_name` holds for the given resource names.
    /// Idempotent: releasing a resource that is not held is a no-op.
    pub async fn release(&self, step_name: &str, names: &[String]) {
        let mut holders = self.holders.lock().await;
        if let Some(step_holders) = holders.get_mut(step_name) {
            for name in names {
                step_holders.remove(name);
            }
            if step_holders.is_empty() {
                holders.remove(step_name);
            }
        }
    }

    pub async fn get_resource_usage(&self) -> HashMap<String, ResourceUsage> {
        let pools = self.pools.lock().await;
        pools
            .iter()
            .map(|(name, pool)| {
                let available = pool.semaphore.available_permits();
                (
                    name.clone(),
                    ResourceUsage {
                        capacity: pool.capacity,
                        available,
                        in_use: pool.capacity.saturating_sub(available),
                    },
                )
            })
            .collect()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_capacity_is_one() {
        let manager = ResourceManager::new();
        assert!(manager.is_resource_available("gpu").await);
        let ok = manager.acquire("step-a", &["gpu".to_string()], None).await.unwrap();
        assert!(ok);
        assert!(!manager.is_resource_available("gpu").await);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = ResourceManager::new();
        manager.acquire("step-a", &["gpu".to_string()], None).await.unwrap();
        manager.release("step-a", &["gpu".to_string()]).await;
        manager.release("step-a", &["gpu".to_string()]).await;
        assert!(manager.is_resource_available("gpu").await);
    }

    #[tokio::test]
    async fn acquire_is_all_or_nothing() {
        let manager = ResourceManager::new();
        manager.configure("r1", 1).await;
        manager.configure("r2", 1).await;
        assert!(manager.acquire("step-a", &["r1".to_string()], None).await.unwrap());

        // step-b wants r1 (taken) and r2 (free): must not end up holding r2.
        let ok = manager
            .acquire("step-b", &["r1".to_string(), "r2".to_string()], None)
            .await
            .unwrap();
        assert!(!ok);
        assert!(manager.is_resource_available("r2").await);
    }

    #[tokio::test]
    async fn configured_capacity_allows_multiple_holders() {
        let manager = ResourceManager::new();
        manager.configure("cpu", 4).await;
        for i in 0..4 {
            let ok = manager.acquire(&format!("step-{i}"), &["cpu".to_string()], None).await.unwrap();
            assert!(ok);
        }
        assert!(!manager.is_resource_available("cpu").await);
        let usage = manager.get_resource_usage().await;
        assert_eq!(usage["cpu"].in_use, 4);
        assert_eq!(usage["cpu"].available, 0);
    }

    #[tokio::test]
    async fn release_frees_capacity_for_other_holders() {
        let manager = ResourceManager::new();
        manager.configure("cpu", 1).await;
        manager.acquire("step-a", &["cpu".to_string()], None).await.unwrap();
        assert!(!manager.acquire("step-b", &["cpu".to_string()], None).await.unwrap());
        manager.release("step-a", &["cpu".to_string()]).await;
        assert!(manager.acquire("step-b", &["cpu".to_string()], None).await.unwrap());
    }
}
