use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use jana_contracts::Service;

/// `TypeId`-keyed store of shared singletons (spec.md §4.12), handed to
/// plugin components in place of process-global statics. Analogous to the
/// batch-state `Storage` registries keyed by `TypeId::of::<Primitive>()`
/// elsewhere in this codebase, but generic over any `'static + Send +
/// Sync` service rather than one concrete trait object kind.
///
/// Each concrete service type may be registered at most once; a second
/// `register::<T>` call replaces the first rather than erroring, since
/// re-registration only happens in tests that rebuild a topology.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Service>(&self, service: Arc<T>) {
        self.services.write().insert(TypeId::of::<T>(), service);
    }

    /// Fetch a registered service, or `None` if `T` was never registered.
    /// Components that treat a service as mandatory should `expect` on
    /// this themselves with a message naming the service, the same way
    /// `Event::view` panics on a missing factory set: a missing mandatory
    /// service is a wiring bug, not a runtime condition to recover from.
    pub fn get<T: Service>(&self) -> Option<Arc<T>> {
        self.services
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .map(|service| {
                service
                    .downcast::<T>()
                    .unwrap_or_else(|_| unreachable!("TypeId key guarantees matching concrete type"))
            })
    }

    pub fn contains<T: Service>(&self) -> bool {
        self.services.read().contains_key(&TypeId::of::<T>())
    }
}

/// Single reader/writer lock shared by all processors that write to a
/// common output resource (spec.md §4.12, §4.7, §5 "Shared resources").
/// The one built-in service: registered by the application host, fetched
/// by processors via `ServiceRegistry::get::<OutputLock>()`.
#[derive(Default)]
pub struct OutputLock {
    guard: parking_lot::Mutex<()>,
}

impl OutputLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the shared output resource.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard.lock();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(std::sync::atomic::AtomicU64);

    #[test]
    fn register_then_get_round_trips_same_instance() {
        let registry = ServiceRegistry::new();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicU64::new(0)));
        registry.register(counter.clone());

        let fetched = registry.get::<Counter>().expect("registered above");
        fetched.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn unregistered_type_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.get::<OutputLock>().is_none());
    }

    #[test]
    fn output_lock_serialises_access() {
        let lock = OutputLock::new();
        let result = lock.with_lock(|| 1 + 1);
        assert_eq!(result, 2);
    }
}
