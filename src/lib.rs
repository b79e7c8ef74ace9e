// Library exports for the binary and integration tests

pub mod bridge;
pub mod browser;
pub mod config;
pub mod error;
pub mod js;
pub mod resources;
pub mod storage;
pub mod view;

// Re-export commonly used types
pub use bridge::{NativeMethods, NativeObject};
pub use browser::{BrowserHost, UnhandledFault, MAIN_FRAME};
pub use config::HostConfig;
pub use error::{JsException, StackFrame, ViewError, ViewResult};
pub use resources::{FileResolver, MemoryResolver, ResourceResolver};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use view::{ComponentHost, LoadStage, ModuleRegistry, ViewModule};
