//! # Mutable Proxy
//!
//! A `MutableProxy<T>` is a stable reference whose target can be replaced in one
//! atomic step. Every access loads the current target, so callers never observe a
//! half-updated object: they see either the old target or the new one.
//!
//! ## Forwarded Capabilities
//!
//! Targets implementing [`ProxyTarget`] expose a fixed capability set that the
//! proxy forwards: invocation, get/set/define/delete of named properties,
//! existence checks, key enumeration and prototype queries.
//!
//! Two operations are refused outright because they would pin the proxy to one
//! target: making it non-extensible and defining non-configurable properties.
//!
//! The proxy never reports a `then` capability, so generic code probing for an
//! awaitable shape does not mistake it for one.

use crate::error::RestartError;
use arc_swap::ArcSwap;
use serde_json::Value;
use std::sync::Arc;

/// Property name reserved for awaitable probes.
const THEN: &str = "then";

/// Describes a property being defined through [`MutableProxy::define_property`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    pub value: Value,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl PropertyDescriptor {
    /// A writable, enumerable, configurable property.
    pub fn value(value: Value) -> Self {
        Self {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.enumerable = false;
        self
    }

    pub fn non_configurable(mut self) -> Self {
        self.configurable = false;
        self
    }
}

/// The capability set a proxy forwards to its target.
pub trait ProxyTarget: Send + Sync {
    /// Call the target. Targets that are not callable keep the default.
    fn invoke(&self, _args: Vec<Value>) -> Result<Value, RestartError> {
        Err(RestartError::InvalidOperation(format!(
            "{} is not callable",
            self.prototype()
        )))
    }

    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<(), RestartError>;

    /// Targets that do not track writability or enumerability keep only the value.
    fn define(&self, key: &str, descriptor: PropertyDescriptor) -> Result<(), RestartError> {
        self.set(key, descriptor.value)
    }

    fn delete(&self, key: &str) -> bool;

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn keys(&self) -> Vec<String>;

    /// Name of the target's type, the answer to prototype queries.
    fn prototype(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A reference whose target can be swapped atomically.
pub struct MutableProxy<T> {
    target: ArcSwap<T>,
}

impl<T> MutableProxy<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self {
            target: ArcSwap::new(target),
        }
    }

    /// The current target.
    pub fn target(&self) -> Arc<T> {
        self.target.load_full()
    }

    /// Point every later access at `target`. Returns the previous target.
    pub fn change_target(&self, target: Arc<T>) -> Arc<T> {
        self.target.swap(target)
    }

    /// Always refused: a non-extensible proxy could not be retargeted.
    pub fn prevent_extensions(&self) -> Result<(), RestartError> {
        Err(RestartError::InvalidOperation(
            "Cannot prevent extensions for mutable proxy".to_string(),
        ))
    }

    /// The proxy is never awaitable.
    pub fn is_thenable(&self) -> bool {
        false
    }
}

impl<T: ProxyTarget> MutableProxy<T> {
    pub fn invoke(&self, args: Vec<Value>) -> Result<Value, RestartError> {
        self.target.load().invoke(args)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if key == THEN {
            return None;
        }
        self.target.load().get(key)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), RestartError> {
        self.target.load().set(key, value)
    }

    pub fn define_property(
        &self,
        key: &str,
        descriptor: PropertyDescriptor,
    ) -> Result<(), RestartError> {
        if !descriptor.configurable {
            return Err(RestartError::InvalidOperation(
                "Cannot define non-configurable property for mutable proxy".to_string(),
            ));
        }
        self.target.load().define(key, descriptor)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.target.load().delete(key)
    }

    pub fn has(&self, key: &str) -> bool {
        key != THEN && self.target.load().has(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.target.load().keys()
    }

    pub fn prototype(&self) -> &'static str {
        self.target.load().prototype()
    }
}
