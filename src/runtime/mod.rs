//! Native runtime seam - the dynamic message-dispatch surface the bridge needs
//!
//! Architecture:
//! - `memory.rs` - in-process object model (classes, strings, arrays, method tables)
//! - `objc.rs` - the platform Objective-C runtime (`objc` feature, Apple targets)
//!
//! Every method here may call into native code. Callers must not hold any
//! bridge lock while calling them.

mod memory;
#[cfg(all(feature = "objc", target_vendor = "apple"))]
mod objc;

pub use memory::MemoryRuntime;
#[cfg(all(feature = "objc", target_vendor = "apple"))]
pub use objc::ObjcRuntime;

use crate::object::{ClassHandle, NativeHandle, Selector};
use core::ffi::c_void;

pub trait NativeRuntime: Send + Sync {
    /// Send `sel` to `receiver` with word-sized arguments, answering one word
    fn send(&self, receiver: NativeHandle, sel: Selector, args: &[usize]) -> usize;

    /// Register (or look up) a selector by name
    fn selector(&self, name: &str) -> Option<Selector>;

    fn selector_name(&self, sel: Selector) -> Option<String>;

    fn class_by_name(&self, name: &str) -> Option<ClassHandle>;

    fn class_name(&self, class: ClassHandle) -> Option<String>;

    fn superclass_of(&self, class: ClassHandle) -> Option<ClassHandle>;

    /// Create and register a new native class deriving from `superclass`
    fn allocate_class(&self, name: &str, superclass: ClassHandle) -> Option<ClassHandle>;

    /// Decode a native string object
    fn string_value(&self, string: NativeHandle) -> Option<String>;

    fn create_string(&self, text: &str) -> Option<NativeHandle>;

    /// Elements of a native array object, in order
    fn array_elements(&self, array: NativeHandle) -> Vec<Option<NativeHandle>>;

    fn create_array(&self, items: &[Option<NativeHandle>]) -> Option<NativeHandle>;

    /// Install `imp` as the implementation of `sel` on `class`
    fn add_method(&self, class: ClassHandle, sel: Selector, imp: *const c_void, encoding: &str) -> bool;

    /// Send a zero-argument message whose answer is an object
    fn send_for_object(&self, receiver: NativeHandle, sel: Selector) -> Option<NativeHandle> {
        NativeHandle::new(self.send(receiver, sel, &[]))
    }
}
