//! Engine-facing host: owns the script channels of every frame and the
//! native side of the bridge (objects, listeners, faults, resources).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::{CallGate, ListenerHandler, ListenerRegistry, NativeObject, ObjectRegistry, UiQueue};
use crate::config::HostConfig;
use crate::error::{ViewError, ViewResult};
use crate::js::exception::parse_fault;
use crate::js::{EngineFactory, FaultSink, HostBindings, QuickJsEngine, RawFault, ScriptChannel, ScriptEngine};
use crate::resources::ResourceResolver;
use crate::storage::KeyValueStore;
use crate::view::cache::PrerenderCache;

/// Name of the main frame.
pub const MAIN_FRAME: &str = "";

/// Fired with the frame name whenever a script context is torn down.
pub const CONTEXT_RELEASED_EVENT: &str = "JavascriptContextReleased";

/// A fault no caller is waiting for. Hooks set `handled` to stop it from
/// being raised on the UI queue.
#[derive(Debug)]
pub struct UnhandledFault {
    pub error: ViewError,
    pub handled: bool,
}

pub type UnhandledFaultHook = Arc<dyn Fn(&mut UnhandledFault) + Send + Sync>;

/// Consulted before the resolver. Returning `None` passes the request on.
pub type ResourceInterceptor =
    Arc<dyn Fn(&str, &str) -> Option<anyhow::Result<Option<String>>> + Send + Sync>;

type DisposedHandler = Box<dyn FnOnce() + Send>;

struct BrowserInner {
    config: HostConfig,
    gate: CallGate,
    objects: ObjectRegistry,
    listeners: ListenerRegistry,
    ui: UiQueue,
    resolver: Arc<dyn ResourceResolver>,
    interceptor: RwLock<Option<ResourceInterceptor>>,
    cache: PrerenderCache,
    main: RwLock<Arc<ScriptChannel>>,
    frames: Mutex<HashMap<String, Arc<ScriptChannel>>>,
    bootstrap: RwLock<Option<String>>,
    fault_hooks: RwLock<Vec<UnhandledFaultHook>>,
    disposed_handlers: Mutex<Vec<DisposedHandler>>,
    disposed: AtomicBool,
    weak: Weak<BrowserInner>,
}

#[derive(Clone)]
pub struct BrowserHost {
    inner: Arc<BrowserInner>,
}

impl BrowserHost {
    pub fn new(
        config: HostConfig,
        resolver: Arc<dyn ResourceResolver>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BrowserInner>| {
            let gate = CallGate::new();
            let ui = UiQueue::new();
            let sink = fault_sink(weak.clone());
            BrowserInner {
                main: RwLock::new(Arc::new(ScriptChannel::new(
                    MAIN_FRAME,
                    config.clone(),
                    Arc::clone(&sink),
                ))),
                config,
                objects: ObjectRegistry::new(gate.clone()),
                listeners: ListenerRegistry::new(gate.clone(), ui.clone(), sink),
                gate,
                ui,
                resolver,
                interceptor: RwLock::new(None),
                cache: PrerenderCache::new(store),
                frames: Mutex::new(HashMap::new()),
                bootstrap: RwLock::new(None),
                fault_hooks: RwLock::new(Vec::new()),
                disposed_handlers: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
                weak: weak.clone(),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &PrerenderCache {
        &self.inner.cache
    }

    pub fn ui_queue(&self) -> UiQueue {
        self.inner.ui.clone()
    }

    /// Start the main frame, evaluating `bootstrap` before anything queued.
    pub fn load(&self, bootstrap: Option<String>) -> ViewResult<()> {
        *self.inner.bootstrap.write().unwrap_or_else(|e| e.into_inner()) = bootstrap.clone();
        let channel = self.main_channel();
        channel.start(self.inner.engine_factory(&channel), bootstrap)
    }

    /// Replace the main script context with a fresh one. Listeners see
    /// [`CONTEXT_RELEASED_EVENT`] for the main frame before the new context
    /// runs its bootstrap.
    pub fn reload(&self) -> ViewResult<()> {
        if self.is_disposing() {
            return Ok(());
        }
        let fresh = Arc::new(ScriptChannel::new(
            MAIN_FRAME,
            self.inner.config.clone(),
            fault_sink(self.inner.weak.clone()),
        ));
        let previous = std::mem::replace(
            &mut *self.inner.main.write().unwrap_or_else(|e| e.into_inner()),
            Arc::clone(&fresh),
        );
        tracing::info!(target: "view", "reloading main frame");
        previous.dispose();

        self.inner
            .listeners
            .dispatch(CONTEXT_RELEASED_EVENT, &[Value::from(MAIN_FRAME)]);

        let bootstrap = self
            .inner
            .bootstrap
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        fresh.start(self.inner.engine_factory(&fresh), bootstrap)
    }

    pub fn main_channel(&self) -> Arc<ScriptChannel> {
        Arc::clone(&self.inner.main.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// The channel of `frame`, creating and starting an isolated context on
    /// first use.
    pub fn channel(&self, frame: &str) -> ViewResult<Arc<ScriptChannel>> {
        if frame == MAIN_FRAME {
            return Ok(self.main_channel());
        }
        let mut frames = self.inner.frames.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = frames.get(frame) {
            return Ok(Arc::clone(channel));
        }
        if self.is_disposing() {
            return Err(ViewError::EngineUnavailable);
        }
        let channel = Arc::new(ScriptChannel::new(
            frame,
            self.inner.config.clone(),
            fault_sink(self.inner.weak.clone()),
        ));
        channel.start(self.inner.engine_factory(&channel), None)?;
        frames.insert(frame.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Dispose the isolated context of `frame` and notify listeners.
    pub fn release_frame(&self, frame: &str) {
        let removed = self
            .inner
            .frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(frame);
        if let Some(channel) = removed {
            channel.dispose();
            self.inner
                .listeners
                .dispatch(CONTEXT_RELEASED_EVENT, &[Value::from(frame)]);
        }
    }

    pub fn execute(&self, script: &str) {
        self.main_channel().execute(script);
    }

    pub fn execute_function(&self, name: &str, args: &[Value]) {
        self.main_channel().execute_function(name, true, args);
    }

    pub fn evaluate<T>(&self, script: &str, timeout: Option<Duration>) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        self.main_channel().evaluate(script, timeout)
    }

    pub fn evaluate_function<T>(&self, name: &str, args: &[Value]) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        self.main_channel().evaluate_function(name, true, args, None)
    }

    pub async fn evaluate_async<T>(&self, script: &str, timeout: Option<Duration>) -> ViewResult<T>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        self.main_channel()
            .evaluate_async(script.to_string(), timeout)
            .await
    }

    /// Expose `object` to script as `name`. Returns `false` while disposing.
    pub fn register_object(&self, name: &str, object: Arc<dyn NativeObject>) -> bool {
        self.inner.objects.register(name, object)
    }

    pub fn unregister_object(&self, name: &str) -> bool {
        self.inner.objects.unregister(name)
    }

    pub fn is_object_registered(&self, name: &str) -> bool {
        self.inner.objects.contains(name)
    }

    pub fn attach_listener(&self, event: &str, handler: ListenerHandler) {
        self.inner.listeners.attach(event, handler);
    }

    pub fn attach_ui_listener(&self, event: &str, handler: ListenerHandler) {
        self.inner.listeners.attach_ui(event, handler);
    }

    pub fn on_unhandled_async_fault(&self, hook: UnhandledFaultHook) {
        self.inner
            .fault_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn on_disposed<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .disposed_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    pub fn set_resource_interceptor(&self, interceptor: ResourceInterceptor) {
        *self
            .inner
            .interceptor
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(interceptor);
    }

    pub fn is_disposing(&self) -> bool {
        self.inner.gate.is_disposing()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Tear the host down once no script-to-native call is in flight.
    ///
    /// When calls are in flight (typically because this is called from
    /// inside one) the wait and the teardown move to a background thread,
    /// so this never blocks on its own caller.
    pub fn dispose(&self) {
        if !self.inner.gate.begin_disposal() {
            return;
        }
        tracing::info!(target: "view", pending = self.inner.gate.pending(), "disposing browser host");

        if self.inner.gate.is_idle() {
            self.inner.gate.drain();
            self.inner.teardown();
            return;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("viewhost-dispose".to_string())
            .spawn(move || {
                inner.gate.drain();
                inner.teardown();
            });
        if let Err(err) = spawned {
            tracing::error!(target: "view", "failed to spawn dispose thread: {err}");
        }
    }
}

impl BrowserInner {
    fn engine_factory(&self, channel: &ScriptChannel) -> EngineFactory {
        let frame = channel.frame().to_string();
        let abort = channel.abort_flag();
        let bindings: Arc<dyn HostBindings> = Arc::new(HostBridge {
            inner: self.weak.clone(),
        });
        Arc::new(move || {
            let engine = QuickJsEngine::with_host(&frame, Arc::clone(&bindings), Arc::clone(&abort))?;
            Ok(Box::new(engine) as Box<dyn ScriptEngine>)
        })
    }

    fn handle_fault(&self, error: ViewError) {
        if self.gate.is_disposing() {
            tracing::debug!(target: "view", "ignoring fault while disposing: {error}");
            return;
        }
        tracing::warn!(target: "view", "unhandled script fault: {error}");

        let hooks = self
            .fault_hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut fault = UnhandledFault {
            error,
            handled: false,
        };
        for hook in hooks {
            hook(&mut fault);
            if fault.handled {
                return;
            }
        }
        let error = fault.error;
        self.ui.post(move || Err(error));
    }

    fn teardown(&self) {
        self.main
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .dispose();
        let frames: Vec<Arc<ScriptChannel>> = self
            .frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in frames {
            channel.dispose();
        }
        self.objects.clear();
        self.disposed.store(true, Ordering::SeqCst);
        tracing::info!(target: "view", "browser host disposed");

        let handlers = std::mem::take(
            &mut *self
                .disposed_handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for handler in handlers {
            handler();
        }
    }

    fn resolve(&self, frame: &str, path: &str) -> anyhow::Result<Option<String>> {
        let interceptor = self
            .interceptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(answer) = interceptor.and_then(|intercept| intercept(frame, path)) {
            return answer;
        }
        let content = self.resolver.resolve(path)?;
        if content.is_none() {
            tracing::warn!(target: "view", %path, %frame, "resource not found");
        }
        Ok(content)
    }
}

fn fault_sink(inner: Weak<BrowserInner>) -> FaultSink {
    Arc::new(move |error: ViewError| {
        if let Some(inner) = inner.upgrade() {
            inner.handle_fault(error);
        }
    })
}

/// What script reaches through the `__viewhost_*` globals.
struct HostBridge {
    inner: Weak<BrowserInner>,
}

impl HostBindings for HostBridge {
    fn notify(&self, event: &str, args: Vec<Value>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.dispatch(event, &args);
        }
    }

    fn has_object(&self, name: &str) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.objects.contains(name))
    }

    fn call(&self, object: &str, method: &str, args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        match self.inner.upgrade() {
            Some(inner) => inner.objects.invoke(object, method, args),
            None => Ok(None),
        }
    }

    fn resolve(&self, frame: &str, path: &str) -> anyhow::Result<Option<String>> {
        match self.inner.upgrade() {
            Some(inner) => inner.resolve(frame, path),
            None => Ok(None),
        }
    }

    fn cache_get(&self, key: &str) -> Option<String> {
        let inner = self.inner.upgrade()?;
        inner.cache.get(key).unwrap_or_else(|err| {
            tracing::warn!(target: "storage", %key, "pre-render cache read failed: {err}");
            None
        })
    }

    fn cache_store(&self, source: &str, hash: &str, markup: &str, capacity: usize) {
        if let Some(inner) = self.inner.upgrade() {
            if let Err(err) = inner.cache.store(source, hash, markup, capacity) {
                tracing::warn!(target: "storage", %source, "pre-render cache write failed: {err}");
            }
        }
    }

    fn report_error(&self, fault: RawFault) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_fault(ViewError::UncaughtAsyncFault(parse_fault(&fault, &[])));
        }
    }
}
