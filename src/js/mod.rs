pub mod channel;
pub mod exception;
pub mod runtime;
pub mod serialize;

use std::sync::Arc;

use serde_json::Value;

pub use channel::{FaultSink, ScriptChannel};
pub use exception::RawFault;
pub use runtime::QuickJsEngine;
pub use serialize::ScriptValue;

/// A script engine bound to a single execution context.
///
/// Engines are created and used on one worker thread only, so they need not
/// be `Send`.
pub trait ScriptEngine {
    /// Evaluate `script` and return the JSON rendering of its completion
    /// value, or `None` when the value is `undefined`.
    fn evaluate(&mut self, script: &str) -> Result<Option<String>, RawFault>;

    /// Faults raised outside of any submission (rejected jobs and the like)
    /// since the last call.
    fn take_async_faults(&mut self) -> Vec<RawFault> {
        Vec::new()
    }
}

pub type EngineFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn ScriptEngine>> + Send + Sync>;

/// Host services reachable from script through the `__viewhost_*` globals.
pub trait HostBindings: Send + Sync {
    /// `(eventName, ...args)` notification from script.
    fn notify(&self, event: &str, args: Vec<Value>);
    fn has_object(&self, name: &str) -> bool;
    /// Invoke `method` on the native object registered as `object`.
    /// `Ok(None)` means the call produced `undefined`.
    fn call(&self, object: &str, method: &str, args: Vec<Value>) -> anyhow::Result<Option<Value>>;
    fn resolve(&self, frame: &str, path: &str) -> anyhow::Result<Option<String>>;
    fn cache_get(&self, key: &str) -> Option<String>;
    fn cache_store(&self, source: &str, hash: &str, markup: &str, capacity: usize);
    /// An error the script side caught but could not hand to a caller.
    fn report_error(&self, fault: RawFault);
}
