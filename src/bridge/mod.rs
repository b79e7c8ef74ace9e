pub mod gate;
pub mod listener;
pub mod objects;

pub use gate::{CallGate, CallToken};
pub use listener::{ListenerHandler, ListenerRegistry, UiQueue};
pub use objects::{NativeMethods, NativeObject, ObjectRegistry};
