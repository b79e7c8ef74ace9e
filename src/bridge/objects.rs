use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde_json::Value;

use super::gate::CallGate;
use crate::js::serialize::script_name;

/// A host object callable from script.
///
/// `Ok(None)` is returned to script as `undefined`.
pub trait NativeObject: Send + Sync {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>>;

    fn has_method(&self, _method: &str) -> bool {
        true
    }
}

type Method = Box<dyn Fn(Vec<Value>) -> Result<Option<Value>> + Send + Sync>;

/// A [`NativeObject`] assembled from closures. Method names are matched by
/// their script name, so `Clicked` and `clicked` are the same method.
#[derive(Default)]
pub struct NativeMethods {
    methods: HashMap<String, Method>,
}

impl NativeMethods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.methods.insert(script_name(name), Box::new(handler));
        self
    }

    /// A method with no interesting return value.
    pub fn action<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.method(name, move |args| {
            handler(args);
            Ok(None)
        })
    }

    pub fn into_object(self) -> Arc<dyn NativeObject> {
        Arc::new(self)
    }
}

impl NativeObject for NativeMethods {
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let handler = self
            .methods
            .get(&script_name(method))
            .ok_or_else(|| anyhow!("unknown method '{method}'"))?;
        handler(args)
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(&script_name(method))
    }
}

/// Named native objects exposed to script, with every call admitted through
/// the shared [`CallGate`].
pub struct ObjectRegistry {
    objects: RwLock<HashMap<String, Arc<dyn NativeObject>>>,
    gate: CallGate,
}

impl ObjectRegistry {
    pub fn new(gate: CallGate) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            gate,
        }
    }

    /// Register `object` under `name`, replacing any previous binding.
    /// Returns `false` once the host is disposing.
    pub fn register(&self, name: &str, object: Arc<dyn NativeObject>) -> bool {
        if self.gate.is_disposing() {
            return false;
        }
        tracing::debug!(target: "bridge", object = %name, "registering native object");
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), object);
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        if removed {
            tracing::debug!(target: "bridge", object = %name, "unregistered native object");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn clear(&self) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Run a script-originated call. Refused calls (host disposing) and
    /// calls to unknown objects yield `undefined`.
    pub fn invoke(&self, name: &str, method: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let Some(_token) = self.gate.begin() else {
            tracing::debug!(target: "bridge", object = %name, %method, "call refused while disposing");
            return Ok(None);
        };

        let object = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned();
        match object {
            Some(object) => {
                tracing::trace!(target: "bridge", object = %name, %method, "native call");
                object.call(method, args)
            }
            None => {
                tracing::warn!(target: "bridge", object = %name, %method, "call to unregistered object");
                Ok(None)
            }
        }
    }
}
