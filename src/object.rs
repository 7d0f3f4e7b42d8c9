//! Native identities and the wrapper object model
//!
//! Design: a native object is only ever known by its address. The bridge
//! never dereferences a handle; it passes it back into message dispatch.
//! Wrappers are shared (`Arc`) Rust objects that hold exactly one handle
//! until they are told the native object died.

use crate::errors::{BridgeError, ErrorKind, Result};
use core::ffi::c_void;
use core::fmt;
use core::num::NonZeroUsize;
use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque address of one native object instance
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(NonZeroUsize);

impl NativeHandle {
    /// Wrap a raw address, `None` for the null address
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        Self::new(ptr as usize)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:#x})", self.addr())
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Raw address of an optional handle (0 for none)
#[inline]
pub fn raw_handle(handle: Option<NativeHandle>) -> usize {
    handle.map_or(0, NativeHandle::addr)
}

/// Native class identity (the value answered by the "class" message)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassHandle(NonZeroUsize);

impl ClassHandle {
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }
}

impl fmt::Debug for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassHandle({:#x})", self.addr())
    }
}

/// Registered selector token used for dynamic message dispatch
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Selector(NonZeroUsize);

impl Selector {
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}

/// Handle storage shared by every wrapper type
///
/// Holds the handle until cleared. A cleared core never accepts a new
/// handle, so a wrapper can't be silently reused for another object.
#[derive(Debug)]
pub struct ObjectCore {
    handle: AtomicUsize,
    cleared: AtomicBool,
}

impl ObjectCore {
    #[inline]
    pub fn new(handle: NativeHandle) -> Self {
        Self {
            handle: AtomicUsize::new(handle.addr()),
            cleared: AtomicBool::new(false),
        }
    }

    /// Core for a wrapper whose native object doesn't exist yet
    #[inline]
    pub fn unbound() -> Self {
        Self {
            handle: AtomicUsize::new(0),
            cleared: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn handle(&self) -> Option<NativeHandle> {
        NativeHandle::new(self.handle.load(Ordering::Acquire))
    }

    /// Attach `handle`; fails if cleared or already bound to another handle
    pub fn bind(&self, handle: NativeHandle) -> bool {
        if self.cleared.load(Ordering::Acquire) {
            return false;
        }
        match self
            .handle
            .compare_exchange(0, handle.addr(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == handle.addr(),
        }
    }

    /// Forget the handle (the native object is gone)
    #[inline]
    pub fn clear(&self) {
        self.cleared.store(true, Ordering::Release);
        self.handle.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }
}

/// A Rust proxy for exactly one native object
pub trait NativeObject: Any + Send + Sync {
    fn core(&self) -> &ObjectCore;

    fn as_any(&self) -> &dyn Any;

    /// Name used in diagnostics
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    #[inline]
    fn handle(&self) -> Option<NativeHandle> {
        self.core().handle()
    }

    /// Handle for an outgoing native call; fails fast once cleared
    fn live_handle(&self) -> Result<NativeHandle> {
        self.handle().ok_or_else(|| {
            BridgeError::new(ErrorKind::ObjectDisposed {
                type_name: self.type_name().to_string(),
            })
        })
    }
}

/// Wrapper types that can be built from a bare handle
pub trait FromHandle: NativeObject + Sized {
    fn from_handle(handle: NativeHandle) -> Self;
}

/// Shared wrapper reference
pub type ObjectRef = Arc<dyn NativeObject>;

/// Concrete Rust type of a wrapper
#[inline]
pub fn dynamic_type(obj: &dyn NativeObject) -> TypeId {
    obj.as_any().type_id()
}

/// Handle of an optional wrapper, `None` when there is no wrapper
#[inline]
pub fn handle_of(obj: Option<&ObjectRef>) -> Option<NativeHandle> {
    obj.and_then(|o| o.handle())
}

/// Handle of a wrapper that must be present and alive
pub fn require_handle(obj: Option<&ObjectRef>, argument: &str) -> Result<NativeHandle> {
    match obj {
        None => Err(BridgeError::null_argument(argument)),
        Some(o) => o.live_handle(),
    }
}

/// Downcast a shared wrapper to its concrete type
pub fn downcast<T: NativeObject>(obj: &ObjectRef) -> Option<&T> {
    obj.as_any().downcast_ref::<T>()
}

/// Implement [`NativeObject`] for a struct with an `ObjectCore` field
#[macro_export]
macro_rules! native_object {
    ($ty:ty, $field:ident) => {
        impl $crate::object::NativeObject for $ty {
            #[inline]
            fn core(&self) -> &$crate::object::ObjectCore {
                &self.$field
            }

            #[inline]
            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn type_name(&self) -> &'static str {
                stringify!($ty)
            }
        }
    };
}

/// Root wrapper: every registered wrapper type derives from it
#[derive(Debug)]
pub struct BaseObject {
    core: ObjectCore,
}

impl BaseObject {
    /// Native class the root wrapper stands for
    pub const NATIVE_CLASS: &'static str = "NSObject";

    pub fn new(handle: NativeHandle) -> Self {
        Self {
            core: ObjectCore::new(handle),
        }
    }
}

native_object!(BaseObject, core);

impl FromHandle for BaseObject {
    fn from_handle(handle: NativeHandle) -> Self {
        Self::new(handle)
    }
}
