use std::sync::Arc;

use super::engine::ExecutionEngine;
use super::module::ViewModule;
use crate::browser::MAIN_FRAME;

/// Lifecycle of one frame. Stages only move forward, except when the root
/// frame is reset after its script context is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadStage {
    Initialized,
    ViewInitialized,
    ComponentLoading,
    Ready,
}

/// Answers a `custom://` request for a frame. `None` passes it on.
pub type CustomResourceHandler = Arc<dyn Fn(&str) -> Option<anyhow::Result<String>> + Send + Sync>;

pub struct Frame {
    pub name: String,
    pub stage: LoadStage,
    pub component: Option<Arc<ViewModule>>,
    pub plugins: Vec<Arc<ViewModule>>,
    pub engine: Arc<ExecutionEngine>,
    pub ready_to_load: bool,
    pub resource_handlers: Vec<CustomResourceHandler>,
}

impl Frame {
    pub fn new(name: &str, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            name: name.to_string(),
            stage: LoadStage::Initialized,
            component: None,
            plugins: Vec::new(),
            engine,
            ready_to_load: false,
            resource_handlers: Vec::new(),
        }
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_FRAME
    }

    /// Plugins first, then the component.
    pub fn modules(&self) -> impl Iterator<Item = &Arc<ViewModule>> {
        self.plugins.iter().chain(self.component.iter())
    }

    pub fn accepts_plugins(&self) -> bool {
        self.stage <= LoadStage::ViewInitialized
    }

    /// Whether the component can be sent to script now.
    pub fn can_load_component(&self) -> bool {
        self.component.is_some() && self.ready_to_load && self.stage == LoadStage::ViewInitialized
    }

    pub fn resolve_custom(&self, url: &str) -> Option<anyhow::Result<String>> {
        self.resource_handlers.iter().find_map(|handler| handler(url))
    }

    /// Back to `Initialized` on a fresh engine, keeping the bound modules.
    pub fn reset(&mut self, engine: Arc<ExecutionEngine>) {
        self.stage = LoadStage::Initialized;
        self.engine = Arc::clone(&engine);
        self.ready_to_load = self.component.is_some();
        for module in self.plugins.iter().chain(self.component.iter()) {
            module.bind(&self.name, Arc::clone(&engine));
        }
    }
}
