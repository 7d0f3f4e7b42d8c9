//! Platform Objective-C runtime backend
//!
//! Thin wrapper over libobjc. Every message goes through `objc_msgSend`
//! cast to the word-sized signature of the call.

use super::NativeRuntime;
use crate::object::{ClassHandle, NativeHandle, Selector};
use core::ffi::c_void;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

#[link(name = "objc")]
extern "C" {
    fn objc_getClass(name: *const c_char) -> *mut c_void;
    fn class_getName(class: *mut c_void) -> *const c_char;
    fn class_getSuperclass(class: *mut c_void) -> *mut c_void;
    fn class_addMethod(
        class: *mut c_void,
        sel: *const c_void,
        imp: *const c_void,
        types: *const c_char,
    ) -> bool;
    fn objc_allocateClassPair(superclass: *mut c_void, name: *const c_char, extra: usize) -> *mut c_void;
    fn objc_registerClassPair(class: *mut c_void);
    fn sel_registerName(name: *const c_char) -> *const c_void;
    fn sel_getName(sel: *const c_void) -> *const c_char;
    fn objc_msgSend();
}

#[link(name = "Foundation", kind = "framework")]
extern "C" {}

type Send0 = unsafe extern "C" fn(usize, usize) -> usize;
type Send1 = unsafe extern "C" fn(usize, usize, usize) -> usize;
type Send2 = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;
type Send3 = unsafe extern "C" fn(usize, usize, usize, usize, usize) -> usize;
type Send4 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize) -> usize;

/// Objective-C runtime of the current process
#[derive(Debug, Default)]
pub struct ObjcRuntime;

impl ObjcRuntime {
    pub fn new() -> Self {
        Self
    }

    unsafe fn msg_send(receiver: usize, sel: usize, args: &[usize]) -> usize {
        let f = objc_msgSend as unsafe extern "C" fn();
        match *args {
            [] => core::mem::transmute::<_, Send0>(f)(receiver, sel),
            [a] => core::mem::transmute::<_, Send1>(f)(receiver, sel, a),
            [a, b] => core::mem::transmute::<_, Send2>(f)(receiver, sel, a, b),
            [a, b, c] => core::mem::transmute::<_, Send3>(f)(receiver, sel, a, b, c),
            [a, b, c, d] => core::mem::transmute::<_, Send4>(f)(receiver, sel, a, b, c, d),
            _ => 0,
        }
    }

    fn send_named(&self, receiver: usize, name: &str, args: &[usize]) -> usize {
        match self.selector(name) {
            // SAFETY: word-sized message to a live object or class
            Some(sel) => unsafe { Self::msg_send(receiver, sel.addr(), args) },
            None => 0,
        }
    }
}

impl NativeRuntime for ObjcRuntime {
    fn send(&self, receiver: NativeHandle, sel: Selector, args: &[usize]) -> usize {
        // SAFETY: the caller vouches that `receiver` is a live object
        unsafe { Self::msg_send(receiver.addr(), sel.addr(), args) }
    }

    fn selector(&self, name: &str) -> Option<Selector> {
        let name = CString::new(name).ok()?;
        // SAFETY: NUL-terminated name
        Selector::new(unsafe { sel_registerName(name.as_ptr()) } as usize)
    }

    fn selector_name(&self, sel: Selector) -> Option<String> {
        // SAFETY: selectors are interned for the life of the process
        let name = unsafe { sel_getName(sel.addr() as *const c_void) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    fn class_by_name(&self, name: &str) -> Option<ClassHandle> {
        let name = CString::new(name).ok()?;
        ClassHandle::new(unsafe { objc_getClass(name.as_ptr()) } as usize)
    }

    fn class_name(&self, class: ClassHandle) -> Option<String> {
        let name = unsafe { class_getName(class.as_ptr()) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    fn superclass_of(&self, class: ClassHandle) -> Option<ClassHandle> {
        ClassHandle::new(unsafe { class_getSuperclass(class.as_ptr()) } as usize)
    }

    fn allocate_class(&self, name: &str, superclass: ClassHandle) -> Option<ClassHandle> {
        let name = CString::new(name).ok()?;
        // SAFETY: a null answer means the name is taken
        let class = unsafe { objc_allocateClassPair(superclass.as_ptr(), name.as_ptr(), 0) };
        let class = ClassHandle::new(class as usize)?;
        unsafe { objc_registerClassPair(class.as_ptr()) };
        Some(class)
    }

    fn string_value(&self, string: NativeHandle) -> Option<String> {
        let utf8 = self.send_named(string.addr(), "UTF8String", &[]) as *const c_char;
        if utf8.is_null() {
            return None;
        }
        // SAFETY: UTF8String answers a NUL-terminated buffer owned by the string
        Some(unsafe { CStr::from_ptr(utf8) }.to_string_lossy().into_owned())
    }

    fn create_string(&self, text: &str) -> Option<NativeHandle> {
        let class = self.class_by_name("NSString")?;
        let text = CString::new(text).ok()?;
        NativeHandle::new(self.send_named(
            class.addr(),
            "stringWithUTF8String:",
            &[text.as_ptr() as usize],
        ))
    }

    fn array_elements(&self, array: NativeHandle) -> Vec<Option<NativeHandle>> {
        let count = self.send_named(array.addr(), "count", &[]);
        (0..count)
            .map(|i| NativeHandle::new(self.send_named(array.addr(), "objectAtIndex:", &[i])))
            .collect()
    }

    fn create_array(&self, items: &[Option<NativeHandle>]) -> Option<NativeHandle> {
        let class = self.class_by_name("NSMutableArray")?;
        let array = NativeHandle::new(self.send_named(class.addr(), "array", &[]))?;
        let null = self.class_by_name("NSNull").map(|c| self.send_named(c.addr(), "null", &[]));
        for item in items {
            let word = match item {
                Some(h) => h.addr(),
                None => null.unwrap_or(0),
            };
            self.send_named(array.addr(), "addObject:", &[word]);
        }
        Some(array)
    }

    fn add_method(&self, class: ClassHandle, sel: Selector, imp: *const c_void, encoding: &str) -> bool {
        let Ok(types) = CString::new(encoding) else {
            return false;
        };
        unsafe { class_addMethod(class.as_ptr(), sel.addr() as *const c_void, imp, types.as_ptr()) }
    }
}
