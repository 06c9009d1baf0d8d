//! Live component instances: a method table plus typed sub-objects.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::OperatorError;
use crate::value::Value;
use crate::vm::operator::Method;

/// A named instance bundling state (model handles, caches) with the method
/// operators that act on it. Owned exclusively by the VM thread; no two
/// methods of the same component ever run concurrently.
#[derive(Default)]
pub struct Component {
    methods: BTreeMap<String, Method>,
    objects: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Component {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, name: impl Into<String>, method: Method) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    pub fn with_object(
        mut self,
        name: impl Into<String>,
        object: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        self.objects.insert(name.into(), object);
        self
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Typed sub-object lookup; `None` if the name is unknown or the type
    /// does not match.
    pub fn object<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.objects.get(name).cloned()?.downcast::<T>().ok()
    }
}

/// Builds a component from an attribute value, keyed by type name in a
/// module.
pub type ComponentFactory = Arc<dyn Fn(Value) -> Result<Component, OperatorError> + Send + Sync>;
