//! nsbridge - Rust wrappers for a dynamic-dispatch native object runtime
//!
//! Keeps one wrapper per native handle, resolves wrapper types from native
//! class metadata, and marshals calls made by native code into managed
//! method implementations and callback blocks.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod interop;
pub mod logging;
pub mod object;
pub mod registry;
pub mod runtime;
pub mod types;

// Re-export core types
pub use bridge::{Bridge, MethodBinding};
pub use config::BridgeConfig;
pub use errors::{BridgeError, ErrorKind, Result};
pub use interop::{
    CallFrame, Direction, Implementation, ManagedValue, MethodSignature, ParamDescriptor, ReturnKind, ValueType,
};
pub use object::{
    handle_of, require_handle, BaseObject, ClassHandle, FromHandle, NativeHandle, NativeObject, ObjectCore,
    ObjectRef, Selector,
};
pub use registry::HandleRegistry;
pub use runtime::{MemoryRuntime, NativeRuntime};
pub use types::{Module, TypeResolver, TypeTable, WrapperType};

/// Logging initialization for hosts linking the static library
#[no_mangle]
pub extern "C" fn nsbridge_init_logging() {
    logging::init();
}
