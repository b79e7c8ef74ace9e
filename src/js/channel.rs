//! The per-frame script task channel.
//!
//! A single named worker thread owns the frame's [`ScriptEngine`] and drains
//! a FIFO of tasks. Consecutive fire-and-forget tasks are joined into one
//! submission; awaitable tasks are submitted alone and answered through a
//! one-shot slot the caller blocks on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use super::exception::{parse_fault, wrap_script, RawFault};
use super::serialize::function_call;
use super::{EngineFactory, ScriptEngine};
use crate::config::HostConfig;
use crate::error::{ViewError, ViewResult};

/// Receives faults that have no caller to return to.
pub type FaultSink = Arc<dyn Fn(ViewError) + Send + Sync>;

type Outcome = Result<Option<String>, RawFault>;

enum Task {
    Execute {
        script: String,
        function: Option<String>,
    },
    Evaluate {
        script: String,
        reply: SyncSender<Outcome>,
    },
    Stop,
}

/// What an awaiting caller ends up with.
enum Settled {
    Value(Option<String>),
    Fault(RawFault),
    Disposed,
}

#[derive(Default)]
struct WorkerState {
    running: AtomicBool,
    cancelled: AtomicBool,
    abort: Arc<AtomicBool>,
    thread: Mutex<Option<ThreadId>>,
    stopped: Mutex<bool>,
    stopped_signal: Condvar,
}

impl WorkerState {
    fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *stopped = true;
        self.stopped_signal.notify_all();
    }

    fn wait_stopped(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = self
            .stopped_signal
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *stopped
    }
}

pub struct ScriptChannel {
    frame: String,
    config: HostConfig,
    sender: Mutex<Option<UnboundedSender<Task>>>,
    receiver: Mutex<Option<UnboundedReceiver<Task>>>,
    state: Arc<WorkerState>,
    fault_sink: FaultSink,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptChannel {
    /// Create a channel for `frame`. Tasks can be queued right away; they
    /// run once [`ScriptChannel::start`] is called.
    pub fn new(frame: impl Into<String>, config: HostConfig, fault_sink: FaultSink) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            frame: frame.into(),
            config,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            state: Arc::new(WorkerState::default()),
            fault_sink,
            worker: Mutex::new(None),
        }
    }

    pub fn frame(&self) -> &str {
        &self.frame
    }

    /// The flag the engine's interrupt handler should watch.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.abort)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Spawn the worker. `bootstrap` is evaluated before any queued task.
    pub fn start(&self, factory: EngineFactory, bootstrap: Option<String>) -> ViewResult<()> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                ViewError::InvalidOperation(format!(
                    "script channel for frame '{}' was already started",
                    self.frame
                ))
            })?;

        if self.is_disposed() {
            return Ok(());
        }

        let worker = Worker {
            frame: self.frame.clone(),
            receiver,
            state: Arc::clone(&self.state),
            fault_sink: Arc::clone(&self.fault_sink),
        };
        let thread_name = if self.frame.is_empty() {
            "viewhost-script-main".to_string()
        } else {
            format!("viewhost-script-{}", self.frame)
        };

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run(factory, bootstrap))
            .map_err(|err| ViewError::Native(anyhow::Error::new(err)))?;

        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Queue a fire-and-forget script.
    pub fn execute(&self, script: impl Into<String>) {
        self.enqueue(Task::Execute {
            script: script.into(),
            function: None,
        });
    }

    /// Queue `name(args...)`.
    pub fn execute_function(&self, name: &str, serialize: bool, args: &[Value]) {
        self.enqueue(Task::Execute {
            script: function_call(name, serialize, args),
            function: Some(name.to_string()),
        });
    }

    /// Evaluate `script` and wait for its value.
    ///
    /// `timeout` falls back to the configured default. After disposal this
    /// returns `T::default()` instead of an error.
    pub fn evaluate<T>(&self, script: &str, timeout: Option<Duration>) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let settled = self.evaluate_raw(script.to_string(), timeout)?;
        self.convert(settled, None)
    }

    pub fn evaluate_function<T>(
        &self,
        name: &str,
        serialize: bool,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let settled = self.evaluate_raw(function_call(name, serialize, args), timeout)?;
        self.convert(settled, Some(name))
    }

    /// Async flavour of [`ScriptChannel::evaluate`]; the wait happens on the
    /// blocking pool.
    pub async fn evaluate_async<T>(
        self: &Arc<Self>,
        script: String,
        timeout: Option<Duration>,
    ) -> ViewResult<T>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let channel = Arc::clone(self);
        tokio::task::spawn_blocking(move || channel.evaluate::<T>(&script, timeout))
            .await
            .map_err(|err| ViewError::Native(anyhow::Error::new(err)))?
    }

    /// Stop the worker and release every waiting caller. Idempotent. Waits
    /// for the current submission up to the dispose timeout, then interrupts
    /// the engine. Never blocks when called from the worker itself.
    pub fn dispose(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "script_channel", frame = %self.frame, "disposing");

        if let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = sender.send(Task::Stop);
        }
        // never started: drop queued tasks so their waiters see the disposal
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take();

        if self.is_worker_thread() {
            return;
        }

        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };

        let timeout = self.config.dispose_timeout();
        if !self.state.wait_stopped(timeout) {
            tracing::warn!(
                target: "script_channel",
                frame = %self.frame,
                "worker still busy after {:?}, interrupting",
                timeout
            );
            self.state.abort.store(true, Ordering::SeqCst);
            if !self.state.wait_stopped(timeout) {
                tracing::error!(target: "script_channel", frame = %self.frame, "worker did not stop");
                return;
            }
        }
        let _ = handle.join();
    }

    fn enqueue(&self, task: Task) -> bool {
        if self.is_disposed() {
            return false;
        }
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }

    fn is_worker_thread(&self) -> bool {
        let worker = self.state.thread.lock().unwrap_or_else(|e| e.into_inner());
        *worker == Some(thread::current().id())
    }

    fn evaluate_raw(&self, script: String, timeout: Option<Duration>) -> ViewResult<Settled> {
        if self.is_worker_thread() {
            return Err(ViewError::InvalidOperation(format!(
                "cannot wait for script evaluation on the worker of frame '{}'",
                self.frame
            )));
        }

        let (reply, slot) = sync_channel(1);
        let queued_at = Instant::now();
        if !self.enqueue(Task::Evaluate { script, reply }) {
            return Ok(Settled::Disposed);
        }

        let timeout = timeout.or_else(|| self.config.default_script_timeout());
        if !self.is_running() {
            let fallback = timeout.unwrap_or_else(|| self.config.engine_start_timeout());
            return match slot.recv_timeout(fallback) {
                Ok(outcome) => Ok(settle(outcome)),
                Err(RecvTimeoutError::Disconnected) => Ok(Settled::Disposed),
                Err(RecvTimeoutError::Timeout) if self.is_running() => {
                    self.wait_running(&slot, timeout, queued_at)
                }
                Err(RecvTimeoutError::Timeout) => Err(ViewError::Timeout(format!(
                    "javascript engine is not initialized after {}s",
                    fallback.as_secs()
                ))),
            };
        }

        self.wait_running(&slot, timeout, queued_at)
    }

    fn wait_running(
        &self,
        slot: &Receiver<Outcome>,
        timeout: Option<Duration>,
        queued_at: Instant,
    ) -> ViewResult<Settled> {
        let received = match timeout {
            None => slot.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(timeout) => {
                let remaining = timeout.saturating_sub(queued_at.elapsed());
                slot.recv_timeout(remaining)
            }
        };

        match received {
            Ok(outcome) => Ok(settle(outcome)),
            Err(RecvTimeoutError::Disconnected) => Ok(Settled::Disposed),
            Err(RecvTimeoutError::Timeout) => {
                let elapsed = timeout.unwrap_or_default();
                tracing::debug!(target: "script_channel", frame = %self.frame, "evaluation timed out");
                Err(ViewError::Timeout(format!(
                    "more than {}ms elapsed evaluating the script",
                    elapsed.as_millis()
                )))
            }
        }
    }

    fn convert<T>(&self, settled: Settled, function: Option<&str>) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        match settled {
            Settled::Disposed | Settled::Value(None) => Ok(T::default()),
            Settled::Value(Some(json)) if json == "null" => Ok(T::default()),
            Settled::Value(Some(json)) => Ok(serde_json::from_str(&json)?),
            Settled::Fault(fault) => {
                let functions: Vec<String> = function.map(str::to_string).into_iter().collect();
                Err(ViewError::ScriptFault(parse_fault(&fault, &functions)))
            }
        }
    }
}

impl Drop for ScriptChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn settle(outcome: Outcome) -> Settled {
    match outcome {
        Ok(value) => Settled::Value(value),
        Err(fault) => Settled::Fault(fault),
    }
}

struct Worker {
    frame: String,
    receiver: UnboundedReceiver<Task>,
    state: Arc<WorkerState>,
    fault_sink: FaultSink,
}

impl Worker {
    fn run(mut self, factory: EngineFactory, bootstrap: Option<String>) {
        *self.state.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());

        let mut engine = match factory() {
            Ok(engine) => engine,
            Err(err) => {
                tracing::error!(target: "script_channel", frame = %self.frame, "failed to create script engine: {err:#}");
                self.state.mark_stopped();
                return;
            }
        };

        self.state.running.store(true, Ordering::SeqCst);
        tracing::debug!(target: "script_channel", frame = %self.frame, "worker started");

        if let Some(bootstrap) = bootstrap {
            self.submit_batch(engine.as_mut(), &bootstrap, &[]);
        }

        self.drain(engine.as_mut());

        // release anything still queued
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}

        drop(engine);
        self.state.mark_stopped();
        tracing::debug!(target: "script_channel", frame = %self.frame, "worker stopped");
    }

    fn drain(&mut self, engine: &mut dyn ScriptEngine) {
        let mut held: Option<Task> = None;

        loop {
            if self.state.cancelled.load(Ordering::SeqCst) {
                return;
            }

            let task = match held.take() {
                Some(task) => task,
                None => match self.receiver.blocking_recv() {
                    Some(task) => task,
                    None => return,
                },
            };
            if self.state.cancelled.load(Ordering::SeqCst) {
                return;
            }

            match task {
                Task::Stop => return,
                Task::Evaluate { script, reply } => {
                    let outcome = engine.evaluate(&wrap_script(&script));
                    self.forward_async_faults(engine);
                    // the caller may have timed out already
                    let _ = reply.send(outcome);
                }
                Task::Execute { script, function } => {
                    let mut scripts = vec![script];
                    let mut functions: Vec<String> = function.into_iter().collect();
                    loop {
                        match self.receiver.try_recv() {
                            Ok(Task::Execute { script, function }) => {
                                scripts.push(script);
                                functions.extend(function);
                            }
                            Ok(other) => {
                                held = Some(other);
                                break;
                            }
                            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                        }
                    }
                    if self.state.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::trace!(target: "script_channel", frame = %self.frame, count = scripts.len(), "executing batch");
                    self.submit_batch(engine, &scripts.join(";\n"), &functions);
                }
            }
        }
    }

    fn submit_batch(&self, engine: &mut dyn ScriptEngine, script: &str, functions: &[String]) {
        if let Err(fault) = engine.evaluate(&wrap_script(script)) {
            let exception = parse_fault(&fault, functions);
            tracing::debug!(target: "script_channel", frame = %self.frame, "batch failed: {exception}");
            (self.fault_sink)(ViewError::UncaughtAsyncFault(exception));
        }
        self.forward_async_faults(engine);
    }

    fn forward_async_faults(&self, engine: &mut dyn ScriptEngine) {
        for fault in engine.take_async_faults() {
            (self.fault_sink)(ViewError::UncaughtAsyncFault(parse_fault(&fault, &[])));
        }
    }
}
