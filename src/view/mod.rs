pub mod cache;
pub mod engine;
pub mod frame;
pub mod host;
pub mod loader;
pub mod module;

pub use cache::PrerenderCache;
pub use engine::ExecutionEngine;
pub use frame::{CustomResourceHandler, LoadStage};
pub use host::{ComponentHost, ReadyHandler};
pub use loader::LoaderMessage;
pub use module::{ModuleRegistry, ViewModule, ViewModuleBuilder};
