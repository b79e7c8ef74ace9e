//! Admission gate for script-to-native calls.
//!
//! The counter starts at one: a baseline token that is only released when
//! disposal begins, so "count == 1" means idle while the host is alive.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

const BASELINE: usize = 1;

#[derive(Debug)]
struct GateState {
    pending: AtomicUsize,
    disposing: AtomicBool,
    lock: Mutex<()>,
    drained: Condvar,
}

#[derive(Debug, Clone)]
pub struct CallGate {
    state: Arc<GateState>,
}

/// Held for the duration of one admitted call; dropping it ends the call.
#[derive(Debug)]
pub struct CallToken {
    state: Arc<GateState>,
}

impl Default for CallGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CallGate {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GateState {
                pending: AtomicUsize::new(BASELINE),
                disposing: AtomicBool::new(false),
                lock: Mutex::new(()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Admit a call, or refuse it once disposal has begun.
    pub fn begin(&self) -> Option<CallToken> {
        if self.state.disposing.load(Ordering::SeqCst) {
            return None;
        }
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        let token = CallToken {
            state: Arc::clone(&self.state),
        };
        // lost the race with begin_disposal: back out through the token
        if self.state.disposing.load(Ordering::SeqCst) {
            drop(token);
            return None;
        }
        Some(token)
    }

    /// Flip the disposing flag. Returns `true` only for the first caller.
    pub fn begin_disposal(&self) -> bool {
        !self.state.disposing.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposing(&self) -> bool {
        self.state.disposing.load(Ordering::SeqCst)
    }

    /// No admitted call is in flight.
    pub fn is_idle(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst) <= BASELINE
    }

    /// Calls currently in flight, baseline excluded.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst).saturating_sub(BASELINE)
    }

    /// Release the baseline token and block until every admitted call has
    /// finished. Must follow [`CallGate::begin_disposal`].
    pub fn drain(&self) {
        release(&self.state);
        let guard = self.state.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .state
            .drained
            .wait_while(guard, |_| self.state.pending.load(Ordering::SeqCst) > 0)
            .unwrap_or_else(|e| e.into_inner());
        tracing::debug!(target: "bridge", "admission gate drained");
    }
}

impl Drop for CallToken {
    fn drop(&mut self) {
        release(&self.state);
    }
}

fn release(state: &GateState) {
    if state.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        let _guard = state.lock.lock().unwrap_or_else(|e| e.into_inner());
        state.drained.notify_all();
    }
}
