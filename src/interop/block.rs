//! Block packaging - managed callables as native callback records
//!
//! A packaged block is marked global, so the native runtime never copies or
//! releases it. Both the shared descriptor and every callable token are
//! deliberately leaked: native code may invoke a block at any point for the
//! rest of the process.

use super::call::call_block;
use crate::errors::{BridgeError, ErrorKind, Result};
use crate::logging::log_block_created;
use core::ffi::c_void;
use core::fmt;
use core::mem::size_of;
use core::ptr;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Block is stateless and exempt from copy/release
pub const BLOCK_IS_GLOBAL: i32 = 1 << 28;

/// Managed side of a block: word arguments in, one word out
pub type BlockCallable = Arc<dyn Fn(&[usize]) -> usize + Send + Sync>;

#[repr(C)]
#[derive(Debug)]
pub struct BlockDescriptor {
    pub reserved: i32,
    pub size: i32,
    pub copy_helper: *const c_void,
    pub dispose: *const c_void,
}

#[repr(C)]
#[derive(Debug)]
pub struct BlockLiteral {
    pub isa: *const c_void,
    pub flags: i32,
    pub reserved: i32,
    pub invoke: *const c_void,
    pub descriptor: *const BlockDescriptor,
    /// Leaked `Box<BlockCallable>`
    pub handle: *const c_void,
}

/// One descriptor shared by every block, allocated on first use
static DESCRIPTOR: Lazy<usize> = Lazy::new(|| {
    let descriptor = Box::new(BlockDescriptor {
        reserved: 0,
        size: size_of::<BlockLiteral>() as i32,
        copy_helper: ptr::null(),
        dispose: ptr::null(),
    });
    Box::into_raw(descriptor) as usize
});

impl BlockLiteral {
    pub fn descriptor() -> *const BlockDescriptor {
        *DESCRIPTOR as *const BlockDescriptor
    }

    /// Packaged callable of a block, for use inside an invoke thunk
    ///
    /// # Safety
    /// `block` must be null or a block created by [`create_block`].
    pub unsafe fn user_callable<'a>(block: *const BlockLiteral) -> Option<&'a BlockCallable> {
        if block.is_null() {
            return None;
        }
        let token = (*block).handle as *const BlockCallable;
        token.as_ref()
    }
}

#[cfg(unix)]
unsafe fn alloc_record() -> *mut BlockLiteral {
    libc::malloc(size_of::<BlockLiteral>()) as *mut BlockLiteral
}

#[cfg(not(unix))]
unsafe fn alloc_record() -> *mut BlockLiteral {
    Box::into_raw(Box::new(BlockLiteral {
        isa: ptr::null(),
        flags: 0,
        reserved: 0,
        invoke: ptr::null(),
        descriptor: ptr::null(),
        handle: ptr::null(),
    }))
}

/// Package `callable` behind the native entry point `invoke`
///
/// `invoke` receives the block pointer first, followed by the block's own
/// arguments. `isa` is the global block class.
pub fn create_block(isa: *const c_void, invoke: *const c_void, callable: BlockCallable) -> Result<*mut BlockLiteral> {
    if invoke.is_null() {
        return Err(BridgeError::null_argument("invoke"));
    }

    // SAFETY: fresh allocation of the right size, fully written before use
    let block = unsafe { alloc_record() };
    if block.is_null() {
        return Err(BridgeError::unsupported("block allocation failed"));
    }

    let token = Box::into_raw(Box::new(callable)) as *const c_void;
    unsafe {
        block.write(BlockLiteral {
            isa,
            flags: BLOCK_IS_GLOBAL,
            reserved: 0,
            invoke,
            descriptor: BlockLiteral::descriptor(),
            handle: token,
        });
    }

    log_block_created(block as *const u8);
    Ok(block)
}

/// Entry point forwarding to the packaged callable, for blocks of `arity` words
pub fn invoke_thunk(arity: usize) -> Option<*const c_void> {
    let thunk = match arity {
        0 => thunk_0 as *const c_void,
        1 => thunk_1 as *const c_void,
        2 => thunk_2 as *const c_void,
        3 => thunk_3 as *const c_void,
        4 => thunk_4 as *const c_void,
        _ => return None,
    };
    Some(thunk)
}

fn forward(block: *const BlockLiteral, args: &[usize]) -> usize {
    // SAFETY: these thunks are only installed in blocks built by `create_block`
    let callable = unsafe { BlockLiteral::user_callable(block) };
    callable.map_or(0, |f| {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(args))).unwrap_or(0)
    })
}

extern "C" fn thunk_0(block: *const BlockLiteral) -> usize {
    forward(block, &[])
}

extern "C" fn thunk_1(block: *const BlockLiteral, a: usize) -> usize {
    forward(block, &[a])
}

extern "C" fn thunk_2(block: *const BlockLiteral, a: usize, b: usize) -> usize {
    forward(block, &[a, b])
}

extern "C" fn thunk_3(block: *const BlockLiteral, a: usize, b: usize, c: usize) -> usize {
    forward(block, &[a, b, c])
}

extern "C" fn thunk_4(block: *const BlockLiteral, a: usize, b: usize, c: usize, d: usize) -> usize {
    forward(block, &[a, b, c, d])
}

/// A block received from native code, callable with `arity` word arguments
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NativeBlock {
    addr: usize,
    arity: usize,
}

impl NativeBlock {
    pub fn from_raw(block: *const c_void, arity: usize) -> Option<Self> {
        if block.is_null() {
            None
        } else {
            Some(Self {
                addr: block as usize,
                arity,
            })
        }
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.addr as *const c_void
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Call the block through its invoke pointer
    ///
    /// # Safety
    /// The block must still be alive and its invoke function must take the
    /// block pointer plus `arity` word arguments.
    pub unsafe fn invoke(&self, args: &[usize]) -> Result<usize> {
        if args.len() != self.arity {
            return Err(ErrorKind::ArgumentCount {
                expected: self.arity,
                found: args.len(),
            }
            .into());
        }
        let invoke = (*(self.addr as *const BlockLiteral)).invoke;
        call_block(invoke, self.addr, args)
    }
}

impl fmt::Debug for NativeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeBlock({:#x}, arity {})", self.addr, self.arity)
    }
}
