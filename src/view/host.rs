//! Frame registry and the per-frame load state machine.
//!
//! ```text
//! Initialized -> ViewInitialized -> ComponentLoading -> Ready
//! ```
//!
//! Stage changes are driven by notifications from the loader script and by
//! calls on [`ComponentHost`]. All of them happen under one lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use super::engine::ExecutionEngine;
use super::frame::{CustomResourceHandler, Frame, LoadStage};
use super::loader::{
    bootstrap_script, LoaderMessage, VIEW_DESTROYED_EVENT, VIEW_INITIALIZED_EVENT, VIEW_LOADED_EVENT,
};
use super::module::{ModuleRegistry, ViewModule};
use crate::browser::{BrowserHost, CONTEXT_RELEASED_EVENT, MAIN_FRAME};
use crate::error::{ViewError, ViewResult};

const CUSTOM_SCHEME: &str = "custom://";

pub type ReadyHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct HostState {
    frames: HashMap<String, Frame>,
    default_stylesheet: Option<String>,
}

struct HostInner {
    browser: BrowserHost,
    registry: ModuleRegistry,
    state: Mutex<HostState>,
    ready_handlers: RwLock<Vec<ReadyHandler>>,
}

/// Hosts one component per frame, plus its plugins, on top of a
/// [`BrowserHost`].
#[derive(Clone)]
pub struct ComponentHost {
    inner: Arc<HostInner>,
}

impl ComponentHost {
    /// Install the loader into `browser` and start its main frame.
    pub fn new(browser: BrowserHost, registry: ModuleRegistry) -> ViewResult<Self> {
        let root = Frame::new(
            MAIN_FRAME,
            Arc::new(ExecutionEngine::new(MAIN_FRAME, browser.main_channel())),
        );
        let inner = Arc::new(HostInner {
            browser,
            registry,
            state: Mutex::new(HostState {
                frames: HashMap::from([(MAIN_FRAME.to_string(), root)]),
                default_stylesheet: None,
            }),
            ready_handlers: RwLock::new(Vec::new()),
        });

        listen(&inner, VIEW_INITIALIZED_EVENT, |inner, args| {
            inner.on_view_initialized(&string_arg(args, 0)?);
            Ok(())
        });
        listen(&inner, VIEW_LOADED_EVENT, |inner, args| {
            inner.on_view_loaded(&string_arg(args, 0)?, &string_arg(args, 1)?)
        });
        listen(&inner, VIEW_DESTROYED_EVENT, |inner, args| {
            inner.on_view_destroyed(&string_arg(args, 0)?);
            Ok(())
        });
        listen(&inner, CONTEXT_RELEASED_EVENT, |inner, args| {
            inner.on_context_released(&string_arg(args, 0)?);
            Ok(())
        });

        let weak = Arc::downgrade(&inner);
        inner.browser.set_resource_interceptor(Arc::new(move |frame: &str, path: &str| {
            if !path.starts_with(CUSTOM_SCHEME) {
                return None;
            }
            let inner = weak.upgrade()?;
            Some(inner.resolve_custom(frame, path))
        }));

        inner
            .browser
            .load(Some(bootstrap_script(inner.browser.config())))?;
        Ok(Self { inner })
    }

    pub fn browser(&self) -> &BrowserHost {
        &self.inner.browser
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    /// Bind `component` to `frame` and load it as soon as the frame's view
    /// exists. Once the frame is past `ViewInitialized` this does nothing.
    pub fn load_component(&self, frame: &str, component: Arc<ViewModule>) -> ViewResult<()> {
        component.validate().map_err(ViewError::InvalidOperation)?;
        self.inner.load_component(frame, component);
        Ok(())
    }

    /// Create `name` from the registry and load it into `frame`.
    pub fn load_component_by_name(&self, frame: &str, name: &str) -> ViewResult<Arc<ViewModule>> {
        let component = self.inner.registry.create(name)?;
        self.load_component(frame, Arc::clone(&component))?;
        Ok(component)
    }

    /// Add plugins to `frame`. Every plugin is checked before any of them
    /// is added.
    pub fn add_plugins(&self, frame: &str, plugins: Vec<Arc<ViewModule>>) -> ViewResult<()> {
        for plugin in &plugins {
            plugin.validate().map_err(ViewError::InvalidPlugin)?;
        }
        self.inner.add_plugins(frame, plugins)
    }

    /// Stylesheet applied to the main view before its component. Cannot be
    /// changed once the main component started loading.
    pub fn set_default_stylesheet(&self, url: &str) -> ViewResult<()> {
        self.inner.set_default_stylesheet(url)
    }

    pub fn add_custom_resource_handler(&self, frame: &str, handler: CustomResourceHandler) {
        let mut state = self.inner.lock();
        self.inner
            .frame_entry(&mut state, frame)
            .resource_handlers
            .push(handler);
    }

    /// `handler` runs on the UI queue with the frame name each time a frame
    /// becomes ready.
    pub fn on_ready(&self, handler: ReadyHandler) {
        self.inner
            .ready_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn stage(&self, frame: &str) -> Option<LoadStage> {
        self.inner.lock().frames.get(frame).map(|frame| frame.stage)
    }

    pub fn is_ready(&self, frame: &str) -> bool {
        self.stage(frame) == Some(LoadStage::Ready)
    }

    pub fn frame_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().frames.keys().cloned().collect();
        names.sort();
        names
    }

    /// Poll until `frame` is ready. Must not be called from the script
    /// worker.
    pub fn wait_until_ready(&self, frame: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_ready(frame) {
            if Instant::now() >= deadline || self.inner.browser.is_disposing() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Markup currently rendered in `frame`.
    pub fn markup(&self, frame: &str) -> ViewResult<Option<String>> {
        self.inner
            .browser
            .evaluate_function("Loader.markup", &[json!(frame)])
    }

    pub fn reload(&self) -> ViewResult<()> {
        self.inner.browser.reload()
    }

    pub fn dispose(&self) {
        self.inner.browser.dispose();
    }
}

fn listen(inner: &Arc<HostInner>, event: &str, handler: fn(&HostInner, &[Value]) -> Result<()>) {
    let weak: Weak<HostInner> = Arc::downgrade(inner);
    inner.browser.attach_listener(
        event,
        Arc::new(move |args: &[Value]| match weak.upgrade() {
            Some(inner) => handler(&inner, args),
            None => Ok(()),
        }),
    );
}

fn string_arg(args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        _ => Err(anyhow!("missing argument {index}")),
    }
}

impl HostInner {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn frame_entry<'a>(&self, state: &'a mut HostState, name: &str) -> &'a mut Frame {
        state.frames.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(target: "view", frame = %name, "creating frame");
            Frame::new(
                name,
                Arc::new(ExecutionEngine::new(name, self.browser.main_channel())),
            )
        })
    }

    fn load_component(&self, name: &str, component: Arc<ViewModule>) {
        let mut guard = self.lock();
        let has_stylesheet = guard.default_stylesheet.is_some();
        let frame = self.frame_entry(&mut guard, name);
        if frame.stage > LoadStage::ViewInitialized {
            tracing::debug!(target: "view", frame = %name, stage = ?frame.stage, "component already loading");
            return;
        }

        component.bind(name, Arc::clone(&frame.engine));
        frame.component = Some(component);
        frame.ready_to_load = true;
        self.try_load_component(frame, has_stylesheet);
    }

    fn add_plugins(&self, name: &str, plugins: Vec<Arc<ViewModule>>) -> ViewResult<()> {
        let mut state = self.lock();
        let frame = self.frame_entry(&mut state, name);
        if !frame.accepts_plugins() {
            return Err(ViewError::InvalidOperation(format!(
                "cannot add plugins to frame '{name}' after its component started loading"
            )));
        }

        for plugin in &plugins {
            plugin.bind(name, Arc::clone(&frame.engine));
        }
        frame.plugins.extend(plugins.iter().cloned());

        if frame.stage == LoadStage::ViewInitialized {
            self.send_plugins(name, &plugins);
        }
        Ok(())
    }

    fn set_default_stylesheet(&self, url: &str) -> ViewResult<()> {
        let mut state = self.lock();
        let stage = state.frames.get(MAIN_FRAME).map(|root| root.stage);
        if stage > Some(LoadStage::ViewInitialized) {
            return Err(ViewError::InvalidOperation(
                "cannot set the default stylesheet after the main component started loading"
                    .to_string(),
            ));
        }
        state.default_stylesheet = Some(url.to_string());
        if stage == Some(LoadStage::ViewInitialized) {
            LoaderMessage::load_default_stylesheet(url).send(&self.browser.main_channel());
        }
        Ok(())
    }

    fn on_view_initialized(&self, name: &str) {
        let mut guard = self.lock();
        let stylesheet = guard.default_stylesheet.clone();
        let frame = self.frame_entry(&mut guard, name);
        if frame.stage != LoadStage::Initialized {
            tracing::warn!(target: "view", frame = %name, stage = ?frame.stage, "view initialized twice");
            return;
        }
        frame.stage = LoadStage::ViewInitialized;
        tracing::debug!(target: "view", frame = %name, "view initialized");

        if frame.is_main() {
            if let Some(url) = &stylesheet {
                LoaderMessage::load_default_stylesheet(url).send(&self.browser.main_channel());
            }
        }
        if !frame.plugins.is_empty() {
            self.send_plugins(name, &frame.plugins);
        }
        self.try_load_component(frame, stylesheet.is_some());
    }

    fn on_view_loaded(&self, name: &str, generation: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(frame) = state.frames.get_mut(name) else {
                tracing::warn!(target: "view", frame = %name, "loaded notification for unknown frame");
                return Ok(());
            };
            frame.stage = LoadStage::Ready;
            frame.engine.start(generation)?;
        }
        tracing::info!(target: "view", frame = %name, %generation, "component ready");

        let handlers = self
            .ready_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            let name = name.to_string();
            self.browser.ui_queue().post(move || {
                handler(&name);
                Ok(())
            });
        }
        Ok(())
    }

    fn on_view_destroyed(&self, name: &str) {
        if name == MAIN_FRAME {
            return;
        }
        let removed = self.lock().frames.remove(name);
        if let Some(frame) = removed {
            tracing::debug!(target: "view", frame = %name, "view destroyed");
            self.unregister_modules(&frame);
        }
    }

    fn on_context_released(&self, name: &str) {
        if name != MAIN_FRAME {
            self.on_view_destroyed(name);
            return;
        }

        let mut state = self.lock();
        let children: Vec<String> = state
            .frames
            .keys()
            .filter(|frame| frame.as_str() != MAIN_FRAME)
            .cloned()
            .collect();
        for child in children {
            if let Some(frame) = state.frames.remove(&child) {
                self.unregister_modules(&frame);
            }
        }

        if let Some(root) = state.frames.get_mut(MAIN_FRAME) {
            tracing::debug!(target: "view", "resetting main frame");
            root.reset(Arc::new(ExecutionEngine::new(
                MAIN_FRAME,
                self.browser.main_channel(),
            )));
        }
    }

    fn try_load_component(&self, frame: &mut Frame, has_stylesheet: bool) {
        if !frame.can_load_component() {
            return;
        }
        let Some(component) = frame.component.clone() else {
            return;
        };
        frame.stage = LoadStage::ComponentLoading;
        tracing::debug!(target: "view", frame = %frame.name, component = component.name(), "loading component");

        self.register_module(&frame.name, &component);
        let capacity = if frame.is_main() {
            self.browser.config().prerender_cache_entries
        } else {
            0
        };
        LoaderMessage::load_component(
            &component,
            &frame.name,
            capacity,
            has_stylesheet,
            !frame.plugins.is_empty(),
        )
        .send(&self.browser.main_channel());
    }

    fn send_plugins(&self, frame: &str, plugins: &[Arc<ViewModule>]) {
        for plugin in plugins {
            self.register_module(frame, plugin);
        }
        LoaderMessage::load_plugins(plugins, frame).send(&self.browser.main_channel());
    }

    fn register_module(&self, frame: &str, module: &ViewModule) {
        let name = module.native_object_full_name(frame);
        if !self.browser.register_object(&name, module.create_native_object()) {
            tracing::debug!(target: "view", object = %name, "not registered while disposing");
        }
    }

    fn unregister_modules(&self, frame: &Frame) {
        for module in frame.modules() {
            self.browser
                .unregister_object(&module.native_object_full_name(&frame.name));
        }
    }

    fn resolve_custom(&self, frame: &str, url: &str) -> Result<Option<String>> {
        let state = self.lock();
        let answer = state
            .frames
            .get(frame)
            .and_then(|frame| frame.resolve_custom(url))
            .or_else(|| {
                state
                    .frames
                    .get(MAIN_FRAME)
                    .and_then(|root| root.resolve_custom(url))
            });
        match answer {
            Some(result) => result.map(Some),
            None => {
                tracing::warn!(target: "view", %frame, %url, "no handler for custom resource");
                Ok(None)
            }
        }
    }
}
