//! In-process native object model
//!
//! Objects are plain addresses into a simulated heap. Freed addresses go on
//! a free list and are handed out again by the next allocation, the same
//! way a native allocator recycles memory. Each runtime instance gets its
//! own selector range, so selectors never collide between instances.

use super::NativeRuntime;
use crate::interop::{call_imp, call_imp_stret};
use crate::object::{ClassHandle, NativeHandle, Selector};
use core::ffi::c_void;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const OBJECT_BASE: usize = 0x1_0000;
const CLASS_BASE: usize = 0x7f00_0000;
const SELECTOR_BASE: usize = 0x5000_0000;
const SELECTOR_SPACE: usize = 0x1_0000;
const SLOT: usize = 0x10;

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct ClassInfo {
    name: String,
    superclass: Option<ClassHandle>,
    methods: HashMap<Selector, (usize, String)>,
}

#[derive(Debug, Clone)]
enum Payload {
    Plain,
    Text(String),
    Array(Vec<usize>),
}

#[derive(Debug)]
struct ObjectInfo {
    class: ClassHandle,
    payload: Payload,
    description: Option<String>,
}

#[derive(Debug, Default)]
struct Heap {
    classes: Vec<ClassInfo>,
    class_names: HashMap<String, ClassHandle>,
    selectors: Vec<String>,
    selector_names: HashMap<String, Selector>,
    objects: HashMap<usize, ObjectInfo>,
    free: Vec<usize>,
    next: usize,
    selector_base: usize,
}

impl Heap {
    fn class(&self, class: ClassHandle) -> Option<&ClassInfo> {
        let offset = class.addr().checked_sub(CLASS_BASE)?;
        self.classes.get(offset / SLOT)
    }

    fn class_mut(&mut self, class: ClassHandle) -> Option<&mut ClassInfo> {
        let offset = class.addr().checked_sub(CLASS_BASE)?;
        self.classes.get_mut(offset / SLOT)
    }

    fn define_class(&mut self, name: &str, superclass: Option<ClassHandle>) -> ClassHandle {
        if let Some(&existing) = self.class_names.get(name) {
            return existing;
        }
        let handle = ClassHandle::new(CLASS_BASE + self.classes.len() * SLOT)
            .unwrap_or_else(|| unreachable!("class addresses are non-zero"));
        self.classes.push(ClassInfo {
            name: name.to_string(),
            superclass,
            methods: HashMap::new(),
        });
        self.class_names.insert(name.to_string(), handle);
        handle
    }

    fn selector(&mut self, name: &str) -> Selector {
        if let Some(&sel) = self.selector_names.get(name) {
            return sel;
        }
        let sel = Selector::new(self.selector_base + self.selectors.len() * SLOT)
            .unwrap_or_else(|| unreachable!("selector addresses are non-zero"));
        self.selectors.push(name.to_string());
        self.selector_names.insert(name.to_string(), sel);
        sel
    }

    fn alloc(&mut self, class: ClassHandle, payload: Payload) -> NativeHandle {
        let addr = match self.free.pop() {
            Some(addr) => addr,
            None => {
                let addr = OBJECT_BASE + self.next * SLOT;
                self.next += 1;
                addr
            }
        };
        self.objects.insert(
            addr,
            ObjectInfo {
                class,
                payload,
                description: None,
            },
        );
        NativeHandle::new(addr).unwrap_or_else(|| unreachable!("object addresses are non-zero"))
    }

    fn selector_name(&self, sel: Selector) -> Option<&String> {
        let offset = sel.addr().checked_sub(self.selector_base)?;
        self.selectors.get(offset / SLOT)
    }

    fn lookup_method(&self, mut class: Option<ClassHandle>, sel: Selector) -> Option<(usize, bool)> {
        while let Some(current) = class {
            let info = self.class(current)?;
            if let Some((imp, encoding)) = info.methods.get(&sel) {
                return Some((*imp, encoding.starts_with('{')));
            }
            class = info.superclass;
        }
        None
    }
}

/// Simulated native runtime
pub struct MemoryRuntime {
    heap: RwLock<Heap>,
}

impl MemoryRuntime {
    pub const ROOT_CLASS: &'static str = "NSObject";
    pub const STRING_CLASS: &'static str = "NSString";
    pub const ARRAY_CLASS: &'static str = "NSArray";
    pub const PROXY_CLASS: &'static str = "NSProxy";

    pub fn new() -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let mut heap = Heap {
            selector_base: SELECTOR_BASE + (instance % 0x1000) * SELECTOR_SPACE,
            ..Heap::default()
        };
        let root = heap.define_class(Self::ROOT_CLASS, None);
        heap.define_class(Self::STRING_CLASS, Some(root));
        heap.define_class(Self::ARRAY_CLASS, Some(root));
        heap.define_class(Self::PROXY_CLASS, None);
        heap.define_class("__NSConcreteGlobalBlock", Some(root));
        Self {
            heap: RwLock::new(heap),
        }
    }

    /// Define a class (idempotent by name); the superclass must exist
    pub fn define_class(&self, name: &str, superclass: Option<&str>) -> ClassHandle {
        let mut heap = self.heap.write();
        let superclass = superclass.and_then(|s| heap.class_names.get(s).copied());
        heap.define_class(name, superclass)
    }

    pub fn alloc(&self, class: ClassHandle) -> NativeHandle {
        self.heap.write().alloc(class, Payload::Plain)
    }

    /// Allocate an instance of a class by name, defining it under the root if needed
    pub fn alloc_named(&self, class_name: &str) -> NativeHandle {
        let class = match self.class_by_name(class_name) {
            Some(class) => class,
            None => self.define_class(class_name, Some(Self::ROOT_CLASS)),
        };
        self.alloc(class)
    }

    /// Free an object; its address is reused by the next allocation
    pub fn dealloc(&self, handle: NativeHandle) -> bool {
        let mut heap = self.heap.write();
        if heap.objects.remove(&handle.addr()).is_some() {
            heap.free.push(handle.addr());
            true
        } else {
            false
        }
    }

    pub fn is_alive(&self, handle: NativeHandle) -> bool {
        self.heap.read().objects.contains_key(&handle.addr())
    }

    pub fn set_description(&self, handle: NativeHandle, text: &str) {
        if let Some(info) = self.heap.write().objects.get_mut(&handle.addr()) {
            info.description = Some(text.to_string());
        }
    }

    /// Installed implementation and type encoding for `sel` on exactly `class`
    pub fn implementation(&self, class: ClassHandle, sel: Selector) -> Option<(usize, String)> {
        self.heap
            .read()
            .class(class)
            .and_then(|info| info.methods.get(&sel).cloned())
    }

    /// Send a message whose implementation returns through `stret`
    ///
    /// Answers zero when no structure-returning implementation is installed.
    pub fn send_stret(&self, stret: *mut c_void, receiver: NativeHandle, sel: Selector, args: &[usize]) -> usize {
        let imp = {
            let heap = self.heap.read();
            let class = match heap.objects.get(&receiver.addr()) {
                Some(info) => info.class,
                None => return 0,
            };
            heap.lookup_method(Some(class), sel)
        };
        match imp {
            Some((imp, true)) => {
                // SAFETY: installed with a structure return encoding, so it takes the slot first
                unsafe { call_imp_stret(imp as *const c_void, stret as usize, receiver.addr(), sel.addr(), args) }
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn describe(&self, receiver: NativeHandle) -> usize {
        let text = {
            let heap = self.heap.read();
            match heap.objects.get(&receiver.addr()) {
                Some(info) => match &info.description {
                    Some(text) => text.clone(),
                    None => {
                        let name = heap.class(info.class).map_or("?", |c| c.name.as_str());
                        format!("<{}: {:#x}>", name, receiver.addr())
                    }
                },
                None => return 0,
            }
        };
        self.create_string(&text).map_or(0, NativeHandle::addr)
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntime for MemoryRuntime {
    fn send(&self, receiver: NativeHandle, sel: Selector, args: &[usize]) -> usize {
        let (class, imp, name) = {
            let heap = self.heap.read();
            let class = match heap.objects.get(&receiver.addr()) {
                Some(info) => info.class,
                None => return 0,
            };
            let name = heap.selector_name(sel).cloned().unwrap_or_default();
            (class, heap.lookup_method(Some(class), sel), name)
        };

        // Installed implementations win over the built-in messages
        match imp {
            // Structure returns need a slot; see `send_stret`
            Some((_, true)) => return 0,
            Some((imp, false)) => {
                // SAFETY: `imp` was installed through `add_method` as a word entry point
                return unsafe { call_imp(imp as *const c_void, receiver.addr(), sel.addr(), args) }
                    .unwrap_or(0);
            }
            None => {}
        }

        match name.as_str() {
            "class" => class.addr(),
            "description" => self.describe(receiver),
            _ => 0,
        }
    }

    fn selector(&self, name: &str) -> Option<Selector> {
        if name.is_empty() {
            return None;
        }
        Some(self.heap.write().selector(name))
    }

    fn selector_name(&self, sel: Selector) -> Option<String> {
        self.heap.read().selector_name(sel).cloned()
    }

    fn class_by_name(&self, name: &str) -> Option<ClassHandle> {
        self.heap.read().class_names.get(name).copied()
    }

    fn class_name(&self, class: ClassHandle) -> Option<String> {
        self.heap.read().class(class).map(|c| c.name.clone())
    }

    fn superclass_of(&self, class: ClassHandle) -> Option<ClassHandle> {
        self.heap.read().class(class).and_then(|c| c.superclass)
    }

    fn allocate_class(&self, name: &str, superclass: ClassHandle) -> Option<ClassHandle> {
        let mut heap = self.heap.write();
        if heap.class_names.contains_key(name) || heap.class(superclass).is_none() {
            return None;
        }
        Some(heap.define_class(name, Some(superclass)))
    }

    fn string_value(&self, string: NativeHandle) -> Option<String> {
        match &self.heap.read().objects.get(&string.addr())?.payload {
            Payload::Text(text) => Some(text.clone()),
            _ => None,
        }
    }

    fn create_string(&self, text: &str) -> Option<NativeHandle> {
        let mut heap = self.heap.write();
        let class = *heap.class_names.get(Self::STRING_CLASS)?;
        Some(heap.alloc(class, Payload::Text(text.to_string())))
    }

    fn array_elements(&self, array: NativeHandle) -> Vec<Option<NativeHandle>> {
        match self.heap.read().objects.get(&array.addr()).map(|o| &o.payload) {
            Some(Payload::Array(items)) => items.iter().map(|&a| NativeHandle::new(a)).collect(),
            _ => Vec::new(),
        }
    }

    fn create_array(&self, items: &[Option<NativeHandle>]) -> Option<NativeHandle> {
        let mut heap = self.heap.write();
        let class = *heap.class_names.get(Self::ARRAY_CLASS)?;
        let words = items.iter().map(|h| h.map_or(0, NativeHandle::addr)).collect();
        Some(heap.alloc(class, Payload::Array(words)))
    }

    fn add_method(&self, class: ClassHandle, sel: Selector, imp: *const c_void, encoding: &str) -> bool {
        if imp.is_null() {
            return false;
        }
        match self.heap.write().class_mut(class) {
            Some(info) => {
                info.methods.insert(sel, (imp as usize, encoding.to_string()));
                true
            }
            None => false,
        }
    }
}
