use std::any::Any;

/// Marker for a singleton registered in the engine's service registry
/// (e.g. a shared output-file lock). Anything `'static + Send + Sync`
/// qualifies; the registry keys lookups by `TypeId` so each concrete
/// service type may be registered at most once.
pub trait Service: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> Service for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
