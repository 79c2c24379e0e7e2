use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tether_core::HandleId;

use crate::{Host, RemoteHandle, Value, serialize::type_name};

/// Values pinned locally and referred to remotely by handle id.
///
/// Entries live until [`HandleRegistry::release`] or [`HandleRegistry::clear`];
/// nothing is collected automatically.
pub struct HandleRegistry {
    host: Arc<dyn Host>,
    entries: Mutex<HashMap<HandleId, Value>>,
}

impl HandleRegistry {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Pins `value` under a fresh id.
    pub fn register(&self, value: Value) -> RemoteHandle {
        let handle = RemoteHandle {
            category: type_name(&value, self.host.as_ref()).as_str().to_string(),
            handle_id: HandleId::generate(),
        };
        self.entries().insert(handle.handle_id.clone(), value);
        tracing::debug!(handle_id = %handle.handle_id, category = %handle.category, "registered handle");
        handle
    }

    /// Local value behind `handle`, if it was registered here.
    pub fn resolve(&self, handle: &RemoteHandle) -> Option<Value> {
        self.entries().get(&handle.handle_id).cloned()
    }

    /// Unpins `handle`. Returns false if it was not registered.
    pub fn release(&self, handle: &RemoteHandle) -> bool {
        self.entries().remove(&handle.handle_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        // Values may own channels whose drop touches the hub; drop them unlocked.
        let drained: Vec<Value> = self.entries().drain().map(|(_, value)| value).collect();
        drop(drained);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<HandleId, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::HandleRegistry;
    use crate::{StandardHost, Value};

    struct Window;

    #[test]
    fn register_resolve_release() {
        let registry = HandleRegistry::new(Arc::new(StandardHost::new()));
        let value = Value::array(vec![Value::Null]);
        let handle = registry.register(value.clone());
        assert_eq!(handle.category, "array");

        let local = registry.resolve(&handle).expect("registered value");
        assert!(local.as_array().expect("array").ptr_eq(value.as_array().expect("array")));

        assert!(registry.release(&handle));
        assert!(registry.resolve(&handle).is_none());
        assert!(!registry.release(&handle));
    }

    #[test]
    fn host_objects_use_host_category() {
        let host = StandardHost::new().with_category::<Window>("window");
        let registry = HandleRegistry::new(Arc::new(host));
        let handle = registry.register(Value::host(Window));
        assert_eq!(handle.category, "window");
        assert_eq!(registry.len(), 1);
    }
}
