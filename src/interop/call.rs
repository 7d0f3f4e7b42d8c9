//! Native entry points and word-sized calls
//!
//! Implementations installed on native classes are plain `extern "C"`
//! functions taking word arguments. Each entry point packs its arguments
//! and routes them to the bridge that connected the selector.

use super::abi::AbiSignature;
use crate::errors::{BridgeError, ErrorKind, Result};
use crate::logging::log_dispatch_error;
use core::ffi::c_void;
use core::mem::transmute;

/// Most declared arguments an entry point can carry
pub const MAX_WORD_ARGS: usize = 4;

type Imp0 = unsafe extern "C" fn(usize, usize) -> usize;
type Imp1 = unsafe extern "C" fn(usize, usize, usize) -> usize;
type Imp2 = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;
type Imp3 = unsafe extern "C" fn(usize, usize, usize, usize, usize) -> usize;
type Imp4 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize) -> usize;
type Imp5 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize, usize) -> usize;

fn too_many(found: usize) -> BridgeError {
    ErrorKind::ArgumentCount {
        expected: MAX_WORD_ARGS,
        found,
    }
    .into()
}

/// Call a method implementation with word arguments
///
/// # Safety
/// `imp` must be a function taking `(receiver, selector, args...)` as words.
pub unsafe fn call_imp(imp: *const c_void, receiver: usize, sel: usize, args: &[usize]) -> Result<usize> {
    if imp.is_null() {
        return Err(BridgeError::null_argument("imp"));
    }
    let ret = match *args {
        [] => transmute::<*const c_void, Imp0>(imp)(receiver, sel),
        [a] => transmute::<*const c_void, Imp1>(imp)(receiver, sel, a),
        [a, b] => transmute::<*const c_void, Imp2>(imp)(receiver, sel, a, b),
        [a, b, c] => transmute::<*const c_void, Imp3>(imp)(receiver, sel, a, b, c),
        [a, b, c, d] => transmute::<*const c_void, Imp4>(imp)(receiver, sel, a, b, c, d),
        _ => return Err(too_many(args.len())),
    };
    Ok(ret)
}

/// [`call_imp`] for implementations returning through a structure slot
///
/// # Safety
/// `imp` must take `(stret, receiver, selector, args...)` as words and
/// `stret` must point at a buffer large enough for the result.
pub unsafe fn call_imp_stret(
    imp: *const c_void,
    stret: usize,
    receiver: usize,
    sel: usize,
    args: &[usize],
) -> Result<usize> {
    if imp.is_null() {
        return Err(BridgeError::null_argument("imp"));
    }
    let ret = match *args {
        [] => transmute::<*const c_void, Imp1>(imp)(stret, receiver, sel),
        [a] => transmute::<*const c_void, Imp2>(imp)(stret, receiver, sel, a),
        [a, b] => transmute::<*const c_void, Imp3>(imp)(stret, receiver, sel, a, b),
        [a, b, c] => transmute::<*const c_void, Imp4>(imp)(stret, receiver, sel, a, b, c),
        [a, b, c, d] => transmute::<*const c_void, Imp5>(imp)(stret, receiver, sel, a, b, c, d),
        _ => return Err(too_many(args.len())),
    };
    Ok(ret)
}

type Block0 = unsafe extern "C" fn(usize) -> usize;
type Block1 = unsafe extern "C" fn(usize, usize) -> usize;
type Block2 = unsafe extern "C" fn(usize, usize, usize) -> usize;
type Block3 = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;
type Block4 = unsafe extern "C" fn(usize, usize, usize, usize, usize) -> usize;

/// Call a block's invoke function
///
/// # Safety
/// `invoke` must take `(block, args...)` as words.
pub unsafe fn call_block(invoke: *const c_void, block: usize, args: &[usize]) -> Result<usize> {
    if invoke.is_null() {
        return Err(BridgeError::null_argument("invoke"));
    }
    let ret = match *args {
        [] => transmute::<*const c_void, Block0>(invoke)(block),
        [a] => transmute::<*const c_void, Block1>(invoke)(block, a),
        [a, b] => transmute::<*const c_void, Block2>(invoke)(block, a, b),
        [a, b, c] => transmute::<*const c_void, Block3>(invoke)(block, a, b, c),
        [a, b, c, d] => transmute::<*const c_void, Block4>(invoke)(block, a, b, c, d),
        _ => return Err(too_many(args.len())),
    };
    Ok(ret)
}

/// Native entry point able to carry an adapter's parameter list
pub fn entry_point(abi: &AbiSignature) -> Result<*const c_void> {
    if !abi.is_word_only() {
        return Err(BridgeError::unsupported(
            "floating point parameters need a dedicated entry point",
        ));
    }
    let stret = abi.leading == 3;
    let entry = match (stret, abi.declared().len()) {
        (false, 0) => entry_0 as *const c_void,
        (false, 1) => entry_1 as *const c_void,
        (false, 2) => entry_2 as *const c_void,
        (false, 3) => entry_3 as *const c_void,
        (false, 4) => entry_4 as *const c_void,
        (true, 0) => entry_stret_0 as *const c_void,
        (true, 1) => entry_stret_1 as *const c_void,
        (true, 2) => entry_stret_2 as *const c_void,
        (true, 3) => entry_stret_3 as *const c_void,
        (true, 4) => entry_stret_4 as *const c_void,
        (_, n) => {
            return Err(BridgeError::unsupported(format!(
                "{} declared parameters, at most {} supported",
                n, MAX_WORD_ARGS
            )))
        }
    };
    Ok(entry)
}

/// Errors cannot cross the native boundary; they are logged and answer zero
fn enter(stret: bool, words: &[usize]) -> usize {
    let outcome = std::panic::catch_unwind(|| crate::bridge::route(stret, words));
    let sel = words.get(if stret { 2 } else { 1 }).copied().unwrap_or(0);
    match outcome {
        Ok(Ok(ret)) => ret,
        Ok(Err(err)) => {
            log_dispatch_error(&format!("{:#x}", sel), &err.to_string());
            0
        }
        Err(_) => {
            log_dispatch_error(&format!("{:#x}", sel), "implementation panicked");
            0
        }
    }
}

extern "C" fn entry_0(receiver: usize, sel: usize) -> usize {
    enter(false, &[receiver, sel])
}

extern "C" fn entry_1(receiver: usize, sel: usize, a: usize) -> usize {
    enter(false, &[receiver, sel, a])
}

extern "C" fn entry_2(receiver: usize, sel: usize, a: usize, b: usize) -> usize {
    enter(false, &[receiver, sel, a, b])
}

extern "C" fn entry_3(receiver: usize, sel: usize, a: usize, b: usize, c: usize) -> usize {
    enter(false, &[receiver, sel, a, b, c])
}

extern "C" fn entry_4(receiver: usize, sel: usize, a: usize, b: usize, c: usize, d: usize) -> usize {
    enter(false, &[receiver, sel, a, b, c, d])
}

extern "C" fn entry_stret_0(stret: usize, receiver: usize, sel: usize) -> usize {
    enter(true, &[stret, receiver, sel])
}

extern "C" fn entry_stret_1(stret: usize, receiver: usize, sel: usize, a: usize) -> usize {
    enter(true, &[stret, receiver, sel, a])
}

extern "C" fn entry_stret_2(stret: usize, receiver: usize, sel: usize, a: usize, b: usize) -> usize {
    enter(true, &[stret, receiver, sel, a, b])
}

extern "C" fn entry_stret_3(stret: usize, receiver: usize, sel: usize, a: usize, b: usize, c: usize) -> usize {
    enter(true, &[stret, receiver, sel, a, b, c])
}

extern "C" fn entry_stret_4(
    stret: usize,
    receiver: usize,
    sel: usize,
    a: usize,
    b: usize,
    c: usize,
    d: usize,
) -> usize {
    enter(true, &[stret, receiver, sel, a, b, c, d])
}
