//! Per-frame call queue for component methods.
//!
//! Calls made before the frame's component exists are buffered and replayed
//! in order once the frame reports its generation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ViewError, ViewResult};
use crate::js::serialize::encode_string;
use crate::js::ScriptChannel;

/// Global script function that resolves `(frame, generation, instance)` to a
/// module instance.
pub const MODULES_FUNCTION: &str = "__Modules__";

#[derive(Debug, Clone)]
struct PendingCall {
    instance: String,
    method: String,
    args: Vec<Value>,
}

#[derive(Default)]
struct EngineState {
    generation: Option<String>,
    pending: VecDeque<PendingCall>,
}

pub struct ExecutionEngine {
    frame: String,
    channel: Option<Arc<ScriptChannel>>,
    state: Mutex<EngineState>,
}

impl ExecutionEngine {
    pub fn new(frame: impl Into<String>, channel: Arc<ScriptChannel>) -> Self {
        Self {
            frame: frame.into(),
            channel: Some(channel),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// An engine with nowhere to send calls. Modules start on one of these
    /// until they are bound to a frame.
    pub fn placeholder() -> Self {
        Self {
            frame: String::new(),
            channel: None,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn frame(&self) -> &str {
        &self.frame
    }

    pub fn is_placeholder(&self) -> bool {
        self.channel.is_none()
    }

    pub fn is_started(&self) -> bool {
        self.lock().generation.is_some()
    }

    pub fn pending_calls(&self) -> usize {
        self.lock().pending.len()
    }

    /// Call `instance.method(args)`, now if the frame is ready, otherwise
    /// once it is.
    pub fn execute(&self, instance: &str, method: &str, args: &[Value]) {
        let mut state = self.lock();
        if let (Some(channel), Some(generation)) = (&self.channel, state.generation.as_deref()) {
            self.forward(channel, generation, instance, method, args);
            return;
        }
        tracing::trace!(target: "view", frame = %self.frame, %instance, %method, "buffering call");
        state.pending.push_back(PendingCall {
            instance: instance.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        });
    }

    /// Evaluate `instance.method(args)`. Never buffered.
    pub fn evaluate<T>(&self, instance: &str, method: &str, args: &[Value]) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let Some(channel) = &self.channel else {
            return Err(ViewError::InvalidOperation(
                "cannot evaluate on an unbound execution engine".to_string(),
            ));
        };
        let generation = self.lock().generation.clone().unwrap_or_default();
        let target = self.invocation(&generation, instance, method);
        channel.evaluate_function(&target, true, args, None)
    }

    /// Switch to forwarding and flush buffered calls in order.
    pub fn start(&self, generation: &str) -> ViewResult<()> {
        let Some(channel) = &self.channel else {
            return Err(ViewError::InvalidOperation(
                "cannot start an unbound execution engine".to_string(),
            ));
        };
        let mut state = self.lock();
        state.generation = Some(generation.to_string());
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            tracing::debug!(target: "view", frame = %self.frame, count = pending.len(), "flushing buffered calls");
        }
        for call in pending {
            self.forward(channel, generation, &call.instance, &call.method, &call.args);
        }
        Ok(())
    }

    /// Move the calls still queued on `other` behind this engine's own.
    pub fn merge_workload(&self, other: &ExecutionEngine) {
        if std::ptr::eq(self, other) {
            return;
        }
        let taken = std::mem::take(&mut other.lock().pending);
        if taken.is_empty() {
            return;
        }

        let mut state = self.lock();
        match (&self.channel, state.generation.clone()) {
            (Some(channel), Some(generation)) => {
                for call in taken {
                    self.forward(channel, &generation, &call.instance, &call.method, &call.args);
                }
            }
            _ => state.pending.extend(taken),
        }
    }

    fn forward(
        &self,
        channel: &ScriptChannel,
        generation: &str,
        instance: &str,
        method: &str,
        args: &[Value],
    ) {
        channel.execute_function(&self.invocation(generation, instance, method), true, args);
    }

    fn invocation(&self, generation: &str, instance: &str, method: &str) -> String {
        format!(
            "{MODULES_FUNCTION}({},{},{}).{method}",
            encode_string(&self.frame),
            encode_string(generation),
            encode_string(instance)
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
