//! Script-to-native notifications.
//!
//! Every event name owns two ordered handler lists: handlers that run inline
//! on the script worker and handlers posted to the UI queue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;

use super::gate::CallGate;
use crate::error::{ViewError, ViewResult};
use crate::js::FaultSink;

pub type ListenerHandler = Arc<dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync>;

type UiTask = Box<dyn FnOnce() -> ViewResult<()> + Send>;

/// Work that must run on the host's UI thread. The host pumps it with
/// [`UiQueue::run_pending`] or [`UiQueue::run_next`].
#[derive(Clone)]
pub struct UiQueue {
    sender: UnboundedSender<UiTask>,
    receiver: Arc<AsyncMutex<UnboundedReceiver<UiTask>>>,
}

impl Default for UiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UiQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }

    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() -> ViewResult<()> + Send + 'static,
    {
        let _ = self.sender.send(Box::new(task));
    }

    /// Run everything queued so far. Stops at, and returns, the first error.
    pub fn run_pending(&self) -> ViewResult<usize> {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return Ok(0);
        };
        let mut ran = 0;
        while let Ok(task) = receiver.try_recv() {
            ran += 1;
            task()?;
        }
        Ok(ran)
    }

    /// Wait for the next task and run it.
    pub async fn run_next(&self) -> Option<ViewResult<()>> {
        let task = self.receiver.lock().await.recv().await?;
        Some(task())
    }
}

#[derive(Default, Clone)]
struct Handlers {
    inline: Vec<ListenerHandler>,
    ui: Vec<ListenerHandler>,
}

pub struct ListenerRegistry {
    handlers: RwLock<HashMap<String, Handlers>>,
    gate: CallGate,
    ui: UiQueue,
    fault_sink: FaultSink,
}

impl ListenerRegistry {
    pub fn new(gate: CallGate, ui: UiQueue, fault_sink: FaultSink) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            gate,
            ui,
            fault_sink,
        }
    }

    /// Run `handler` on the notifying thread.
    pub fn attach(&self, event: &str, handler: ListenerHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .inline
            .push(handler);
    }

    /// Run `handler` on the UI queue.
    pub fn attach_ui(&self, event: &str, handler: ListenerHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .ui
            .push(handler);
    }

    pub fn detach_all(&self, event: &str) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event);
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .is_some_and(|handlers| !handlers.inline.is_empty() || !handlers.ui.is_empty())
    }

    /// Deliver `(event, args)` to every handler attached to `event`.
    pub fn dispatch(&self, event: &str, args: &[Value]) {
        let Some(_token) = self.gate.begin() else {
            tracing::debug!(target: "bridge", %event, "notification dropped while disposing");
            return;
        };

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned();
        let Some(handlers) = handlers else {
            tracing::trace!(target: "bridge", %event, "no listeners");
            return;
        };

        for handler in &handlers.inline {
            if let Err(err) = handler(args) {
                (self.fault_sink)(ViewError::Native(err.context(format!("listener for '{event}'"))));
            }
        }

        if !handlers.ui.is_empty() {
            let event = event.to_string();
            let args = args.to_vec();
            let sink = Arc::clone(&self.fault_sink);
            self.ui.post(move || {
                for handler in &handlers.ui {
                    if let Err(err) = handler(&args) {
                        sink(ViewError::Native(err.context(format!("listener for '{event}'"))));
                    }
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> ListenerHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        let make = move |label: &str| -> ListenerHandler {
            let log = Arc::clone(&shared);
            let label = label.to_string();
            Arc::new(move |args: &[Value]| -> anyhow::Result<()> {
                log.lock().unwrap().push(format!("{label}:{}", args.len()));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn inline_handlers_run_in_order_and_ui_handlers_wait_for_the_queue() {
        let ui = UiQueue::new();
        let registry = ListenerRegistry::new(CallGate::new(), ui.clone(), Arc::new(|_: ViewError| {}));
        let (log, make) = recorder();
        registry.attach("Clicked", make("first"));
        registry.attach_ui("Clicked", make("ui"));
        registry.attach("Clicked", make("second"));

        registry.dispatch("Clicked", &[json!(1), json!("a")]);
        registry.dispatch("Other", &[]);
        assert_eq!(*log.lock().unwrap(), vec!["first:2", "second:2"]);

        assert_eq!(ui.run_pending().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["first:2", "second:2", "ui:2"]);
    }

    #[test]
    fn handler_errors_go_to_the_fault_sink() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&faults);
        let registry = ListenerRegistry::new(
            CallGate::new(),
            UiQueue::new(),
            Arc::new(move |err: ViewError| seen.lock().unwrap().push(err.to_string())),
        );
        registry.attach(
            "Boom",
            Arc::new(|_: &[Value]| -> anyhow::Result<()> { Err(anyhow::anyhow!("handler failed")) }),
        );
        registry.dispatch("Boom", &[]);

        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("listener for 'Boom'"));
    }

    #[test]
    fn dispatch_is_refused_while_disposing() {
        let gate = CallGate::new();
        let registry = ListenerRegistry::new(gate.clone(), UiQueue::new(), Arc::new(|_: ViewError| {}));
        let (log, make) = recorder();
        registry.attach("Event", make("inline"));
        gate.begin_disposal();
        registry.dispatch("Event", &[]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_next_executes_posted_work() {
        let ui = UiQueue::new();
        ui.post(|| Err(ViewError::InvalidOperation("posted".into())));
        let result = ui.run_next().await.unwrap();
        assert!(matches!(result, Err(ViewError::InvalidOperation(_))));
    }
}
