use crate::scheduler::config::{ResourcePoolConfig, ResourceSpec};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifier of the built-in thread-count resource
pub const RESOURCE_THREAD: &str = "threads";

/// A named counting resource
pub trait Resource: Send + Sync {
    fn id(&self) -> &str;

    /// Display name used in status messages
    fn name(&self) -> &str;

    /// Unit suffix appended to amounts in messages ("Mb", ...)
    fn suffix(&self) -> &str;

    /// Take `n` units if available right now
    fn try_acquire(&self, n: usize) -> bool;

    fn release(&self, n: usize);

    /// Largest amount a single task may ever hold
    fn max_task_use(&self) -> usize;
}

/// Registry of named resources
pub trait ResourcePool: Send + Sync {
    fn resource(&self, id: &str) -> Option<Arc<dyn Resource>>;
}

/// Errors from resource registration
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Duplicate resource: {0}")]
    Duplicate(String),

    #[error("Invalid capacity {capacity} for resource {id}")]
    InvalidCapacity { id: String, capacity: usize },
}

#[derive(Debug)]
struct SemaphoreState {
    capacity: usize,
    in_use: usize,
}

/// Counting semaphore with a fixed capacity
#[derive(Debug)]
pub struct ResourceSemaphore {
    id: String,
    name: String,
    suffix: String,
    state: Mutex<SemaphoreState>,
}

impl ResourceSemaphore {
    pub fn new(id: impl Into<String>, capacity: usize, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            suffix: String::new(),
            state: Mutex::new(SemaphoreState {
                capacity,
                in_use: 0,
            }),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.in_use)
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Change the capacity; units already held stay held
    pub fn set_max_use(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }
}

impl Resource for ResourceSemaphore {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn suffix(&self) -> &str {
        &self.suffix
    }

    fn try_acquire(&self, n: usize) -> bool {
        let mut state = self.state.lock();
        if state.in_use + n > state.capacity {
            return false;
        }
        state.in_use += n;
        true
    }

    fn release(&self, n: usize) {
        let mut state = self.state.lock();
        if n > state.in_use {
            warn!(
                "Resource {} released {} units but only {} were held",
                self.id, n, state.in_use
            );
            state.in_use = 0;
        } else {
            state.in_use -= n;
        }
    }

    fn max_task_use(&self) -> usize {
        self.state.lock().capacity
    }
}

/// Default resource pool: a concurrent registry of semaphores, always
/// containing the thread-count resource.
pub struct AppResourcePool {
    resources: DashMap<String, Arc<ResourceSemaphore>>,
}

impl AppResourcePool {
    /// Pool with only the thread resource, sized to `threads`
    pub fn new(threads: usize) -> Self {
        let pool = Self {
            resources: DashMap::new(),
        };
        pool.resources.insert(
            RESOURCE_THREAD.to_string(),
            Arc::new(ResourceSemaphore::new(RESOURCE_THREAD, threads.max(1), "Threads")),
        );
        pool
    }

    /// Pool built from configuration
    pub fn with_config(config: &ResourcePoolConfig) -> Result<Self, ResourceError> {
        let pool = Self::new(config.thread_count());
        for spec in &config.resources {
            pool.register(spec)?;
        }
        Ok(pool)
    }

    pub fn register(&self, spec: &ResourceSpec) -> Result<Arc<ResourceSemaphore>, ResourceError> {
        if spec.capacity == 0 {
            return Err(ResourceError::InvalidCapacity {
                id: spec.id.clone(),
                capacity: spec.capacity,
            });
        }
        if self.resources.contains_key(&spec.id) {
            return Err(ResourceError::Duplicate(spec.id.clone()));
        }
        let resource = Arc::new(
            ResourceSemaphore::new(
                spec.id.clone(),
                spec.capacity,
                spec.name.clone().unwrap_or_else(|| spec.id.clone()),
            )
            .with_suffix(spec.suffix.clone().unwrap_or_default()),
        );
        self.resources.insert(spec.id.clone(), resource.clone());
        debug!("Registered resource {} with capacity {}", spec.id, spec.capacity);
        Ok(resource)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.resources.remove(id).is_some()
    }

    /// Typed access to a registered semaphore
    pub fn semaphore(&self, id: &str) -> Option<Arc<ResourceSemaphore>> {
        self.resources.get(id).map(|r| r.value().clone())
    }

    pub fn threads(&self) -> Option<Arc<ResourceSemaphore>> {
        self.semaphore(RESOURCE_THREAD)
    }

    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resources.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl ResourcePool for AppResourcePool {
    fn resource(&self, id: &str) -> Option<Arc<dyn Resource>> {
        self.resources
            .get(id)
            .map(|r| r.value().clone() as Arc<dyn Resource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_acquire_release() {
        let sem = ResourceSemaphore::new("mem", 4, "Memory").with_suffix("Mb");
        assert!(sem.try_acquire(3));
        assert!(!sem.try_acquire(2));
        assert_eq!(sem.available(), 1);
        sem.release(3);
        assert_eq!(sem.available(), 4);
        assert_eq!(sem.suffix(), "Mb");
    }

    #[test]
    fn test_over_release_is_clamped() {
        let sem = ResourceSemaphore::new("r", 2, "R");
        assert!(sem.try_acquire(1));
        sem.release(5);
        assert_eq!(sem.in_use(), 0);
    }

    #[test]
    fn test_pool_registration() {
        let pool = AppResourcePool::new(2);
        assert!(pool.resource(RESOURCE_THREAD).is_some());

        let spec = ResourceSpec::new("gpu", 1);
        assert!(pool.register(&spec).is_ok());
        assert!(matches!(pool.register(&spec), Err(ResourceError::Duplicate(_))));
        assert_eq!(pool.resource_ids(), vec!["gpu".to_string(), "threads".to_string()]);

        assert!(pool.unregister("gpu"));
        assert!(pool.resource("gpu").is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let pool = AppResourcePool::new(1);
        let spec = ResourceSpec::new("empty", 0);
        assert!(matches!(
            pool.register(&spec),
            Err(ResourceError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_set_max_use() {
        let pool = AppResourcePool::new(1);
        let threads = pool.threads().unwrap();
        assert!(threads.try_acquire(1));
        assert!(!threads.try_acquire(1));
        threads.set_max_use(2);
        assert!(threads.try_acquire(1));
        assert_eq!(threads.max_task_use(), 2);
    }
}
