use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::engine::ExecutionEngine;
use crate::bridge::{NativeMethods, NativeObject};
use crate::browser::MAIN_FRAME;
use crate::error::{ViewError, ViewResult};

pub type NativeObjectFactory = Arc<dyn Fn() -> Arc<dyn NativeObject> + Send + Sync>;

struct Binding {
    frame: String,
    engine: Arc<ExecutionEngine>,
}

/// A script bundle rendered into a frame, either as its component or as a
/// plugin, together with the native object it talks to.
pub struct ViewModule {
    name: String,
    instance_name: String,
    main_source: String,
    dependency_sources: Vec<String>,
    css_sources: Vec<String>,
    events: Vec<String>,
    properties: Vec<(String, Value)>,
    native_object_name: String,
    native_object_factory: Option<NativeObjectFactory>,
    binding: Mutex<Binding>,
}

impl ViewModule {
    pub fn builder(name: impl Into<String>) -> ViewModuleBuilder {
        ViewModuleBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn main_source(&self) -> &str {
        &self.main_source
    }

    pub fn dependency_sources(&self) -> &[String] {
        &self.dependency_sources
    }

    pub fn css_sources(&self) -> &[String] {
        &self.css_sources
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn properties(&self) -> &[(String, Value)] {
        &self.properties
    }

    pub fn native_object_name(&self) -> &str {
        &self.native_object_name
    }

    /// Name, main source and native object name must all be present.
    pub fn validate(&self) -> Result<(), String> {
        let missing = [
            ("name", &self.name),
            ("main source", &self.main_source),
            ("native object name", &self.native_object_name),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty());
        match missing {
            Some((field, _)) => Err(format!("module '{}' has no {field}", self.name)),
            None => Ok(()),
        }
    }

    /// Name under which the native object is registered for `frame`.
    pub fn native_object_full_name(&self, frame: &str) -> String {
        if frame == MAIN_FRAME {
            format!("${}", self.native_object_name)
        } else {
            format!("${frame}${}", self.native_object_name)
        }
    }

    pub fn create_native_object(&self) -> Arc<dyn NativeObject> {
        match &self.native_object_factory {
            Some(factory) => factory(),
            None => NativeMethods::new().into_object(),
        }
    }

    /// Frame the module is bound to, if any.
    pub fn frame(&self) -> Option<String> {
        let binding = self.lock();
        (!binding.engine.is_placeholder()).then(|| binding.frame.clone())
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        Arc::clone(&self.lock().engine)
    }

    /// Attach to `frame`, carrying over calls queued on the previous engine.
    pub(crate) fn bind(&self, frame: &str, engine: Arc<ExecutionEngine>) {
        let previous = {
            let mut binding = self.lock();
            binding.frame = frame.to_string();
            std::mem::replace(&mut binding.engine, Arc::clone(&engine))
        };
        engine.merge_workload(&previous);
    }

    pub fn execute_method(&self, method: &str, args: &[Value]) {
        self.engine().execute(&self.instance_name, method, args);
    }

    pub fn evaluate_method<T>(&self, method: &str, args: &[Value]) -> ViewResult<T>
    where
        T: DeserializeOwned + Default,
    {
        self.engine().evaluate(&self.instance_name, method, args)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ViewModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewModule")
            .field("name", &self.name)
            .field("instance_name", &self.instance_name)
            .field("main_source", &self.main_source)
            .finish_non_exhaustive()
    }
}

pub struct ViewModuleBuilder {
    name: String,
    instance_name: Option<String>,
    main_source: String,
    dependency_sources: Vec<String>,
    css_sources: Vec<String>,
    events: Vec<String>,
    properties: Vec<(String, Value)>,
    native_object_name: Option<String>,
    native_object_factory: Option<NativeObjectFactory>,
}

impl ViewModuleBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_name: None,
            main_source: String::new(),
            dependency_sources: Vec::new(),
            css_sources: Vec::new(),
            events: Vec::new(),
            properties: Vec::new(),
            native_object_name: None,
            native_object_factory: None,
        }
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn main_source(mut self, source: impl Into<String>) -> Self {
        self.main_source = source.into();
        self
    }

    /// Later dependencies are loaded first.
    pub fn dependency(mut self, source: impl Into<String>) -> Self {
        self.dependency_sources.push(source.into());
        self
    }

    pub fn stylesheet(mut self, source: impl Into<String>) -> Self {
        self.css_sources.push(source.into());
        self
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.push(name.into());
        self
    }

    /// Set a property, keeping the position of an existing one.
    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.properties.push((name, value)),
        }
        self
    }

    pub fn native_object_name(mut self, name: impl Into<String>) -> Self {
        self.native_object_name = Some(name.into());
        self
    }

    pub fn native_object<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn NativeObject> + Send + Sync + 'static,
    {
        self.native_object_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> Arc<ViewModule> {
        let instance_name = self.instance_name.unwrap_or_else(|| self.name.clone());
        let native_object_name = self.native_object_name.unwrap_or_else(|| self.name.clone());
        Arc::new(ViewModule {
            name: self.name,
            instance_name,
            main_source: self.main_source,
            dependency_sources: self.dependency_sources,
            css_sources: self.css_sources,
            events: self.events,
            properties: self.properties,
            native_object_name,
            native_object_factory: self.native_object_factory,
            binding: Mutex::new(Binding {
                frame: String::new(),
                engine: Arc::new(ExecutionEngine::placeholder()),
            }),
        })
    }
}

pub type ModuleFactory = Arc<dyn Fn() -> Arc<ViewModule> + Send + Sync>;

/// Component factories looked up by name.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: Arc<RwLock<HashMap<String, ModuleFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<ViewModule> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factory(name).is_some()
    }

    /// Build the module registered as `name` or `<name>Module`.
    pub fn create(&self, name: &str) -> ViewResult<Arc<ViewModule>> {
        let factory = self
            .factory(name)
            .ok_or_else(|| ViewError::InvalidOperation(format!("no module registered as '{name}'")))?;
        Ok(factory())
    }

    fn factory(&self, name: &str) -> Option<ModuleFactory> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories
            .get(name)
            .or_else(|| factories.get(&format!("{name}Module")))
            .cloned()
    }
}
