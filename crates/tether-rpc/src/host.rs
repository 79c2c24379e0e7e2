use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use crate::{Function, HostObject};

/// Error kinds every host understands.
pub const STANDARD_ERROR_KINDS: &[&str] = &[
    "Error",
    "AggregateError",
    "EvalError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "TypeError",
    "URIError",
];

/// Embedding environment of one context.
pub trait Host: Send + Sync + 'static {
    /// Category tag for a host-owned value, if the host knows it.
    fn classify(&self, object: &HostObject) -> Option<String>;

    /// True if errors of `kind` can be rebuilt with that kind.
    fn recognizes_error_kind(&self, kind: &str) -> bool;

    /// Turns function source text into a callable running in this context.
    fn compile(&self, source: &str) -> Option<Function>;
}

/// Host with the standard error kinds, a table of compilable functions keyed
/// by source text, and categories registered per Rust type.
#[derive(Default)]
pub struct StandardHost {
    functions: Mutex<HashMap<String, Function>>,
    categories: Mutex<HashMap<TypeId, String>>,
}

impl StandardHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `function` compilable from its source text.
    pub fn define(&self, function: Function) {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function.source().to_string(), function);
    }

    pub fn with_function(self, function: Function) -> Self {
        self.define(function);
        self
    }

    /// Classifies host objects wrapping a `T` as `category`.
    pub fn with_category<T: Any>(self, category: impl Into<String>) -> Self {
        self.categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), category.into());
        self
    }
}

impl Host for StandardHost {
    fn classify(&self, object: &HostObject) -> Option<String> {
        self.categories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&object.value_type_id())
            .cloned()
    }

    fn recognizes_error_kind(&self, kind: &str) -> bool {
        STANDARD_ERROR_KINDS.contains(&kind)
    }

    fn compile(&self, source: &str) -> Option<Function> {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{Host, StandardHost};
    use crate::{Function, HostObject, Value};

    struct Window;

    #[test]
    fn classifies_registered_types_only() {
        let host = StandardHost::new().with_category::<Window>("window");
        assert_eq!(host.classify(&HostObject::new(Window)).as_deref(), Some("window"));
        assert_eq!(host.classify(&HostObject::new(5_u8)), None);
    }

    #[test]
    fn compiles_defined_sources() {
        let host = StandardHost::new().with_function(Function::sync("() => 1", |_| Ok(Value::Number(1.0))));
        assert!(host.compile("() => 1").is_some());
        assert!(host.compile("() => 2").is_none());
    }

    #[test]
    fn knows_standard_error_kinds() {
        let host = StandardHost::new();
        assert!(host.recognizes_error_kind("RangeError"));
        assert!(!host.recognizes_error_kind("BoomError"));
    }
}
