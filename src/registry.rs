//! Handle registry - at most one live wrapper per native handle
//!
//! Design: the map holds `Weak` references, so the registry never keeps a
//! wrapper alive. One mutex serializes every lookup and mutation; it is
//! released before any call that may reach native code (type resolution,
//! wrapper construction).

use crate::errors::{BridgeError, ErrorKind, Result};
use crate::logging::{log_stale_handle, log_type_fallback, log_wrapper_created};
use crate::object::{dynamic_type, FromHandle, NativeHandle, NativeObject, ObjectRef};
use crate::types::{Resolution, TypeResolver};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Map size at which `get_or_create` first sweeps dead entries
const SWEEP_THRESHOLD: usize = 256;

/// Last-resort constructor for a typed request
#[derive(Clone, Copy)]
struct DirectConstructor {
    name: &'static str,
    build: fn(NativeHandle) -> ObjectRef,
}

fn construct_as<T: FromHandle>(handle: NativeHandle) -> ObjectRef {
    Arc::new(T::from_handle(handle))
}

pub struct HandleRegistry {
    map: Mutex<HashMap<NativeHandle, Weak<dyn NativeObject>>>,
    sweep_at: AtomicUsize,
    warn_on_fallback: bool,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::with_fallback_warnings(true)
    }

    pub fn with_fallback_warnings(warn_on_fallback: bool) -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(SWEEP_THRESHOLD)),
            sweep_at: AtomicUsize::new(SWEEP_THRESHOLD),
            warn_on_fallback,
        }
    }

    /// Map `handle` to `wrapper`, replacing any previous entry
    ///
    /// Binds the wrapper to the handle if it has none yet. A wrapper bound to
    /// another handle, or already cleared, is rejected.
    pub fn register(&self, wrapper: &ObjectRef, handle: NativeHandle) -> Result<()> {
        if !wrapper.core().bind(handle) {
            return Err(BridgeError::invalid_argument(
                "wrapper",
                format!("{} cannot be bound to {}", wrapper.type_name(), handle),
            ));
        }
        self.map.lock().insert(handle, Arc::downgrade(wrapper));
        Ok(())
    }

    /// [`register`](Self::register) for a raw address; zero is rejected
    pub fn register_raw(&self, wrapper: &ObjectRef, addr: usize) -> Result<()> {
        let handle = NativeHandle::new(addr).ok_or_else(|| BridgeError::null_argument("handle"))?;
        self.register(wrapper, handle)
    }

    /// Live wrapper for `handle`, never creates one
    pub fn resolve(&self, handle: NativeHandle) -> Option<ObjectRef> {
        let mut map = self.map.lock();
        let weak = map.get(&handle)?;
        match weak.upgrade() {
            Some(obj) if obj.handle() == Some(handle) => Some(obj),
            _ => {
                map.remove(&handle);
                None
            }
        }
    }

    /// Drop the entry for `handle` (idempotent)
    pub fn unregister(&self, handle: NativeHandle) {
        self.map.lock().remove(&handle);
    }

    /// Drop the entry and clear the wrapper's handle (idempotent)
    pub fn mark_dead(&self, handle: NativeHandle) {
        let removed = self.map.lock().remove(&handle);
        if let Some(obj) = removed.and_then(|weak| weak.upgrade()) {
            if obj.handle() == Some(handle) {
                obj.core().clear();
            }
        }
    }

    /// Wrapper for `handle` usable as `requested`, creating one if needed
    ///
    /// A registered wrapper of an incompatible type means the address was
    /// recycled for another object. Once the handle's class confirms that,
    /// the old wrapper is cleared; otherwise its entry is only dropped. Fails
    /// with `UnresolvedType` when `requested` has no constructible type in the
    /// table; [`get_or_create_as`](Self::get_or_create_as) never does.
    pub fn get_or_create(
        &self,
        handle: NativeHandle,
        requested: TypeId,
        resolver: &TypeResolver,
    ) -> Result<ObjectRef> {
        self.get_or_create_with(handle, requested, resolver, None)
    }

    /// Typed [`get_or_create`](Self::get_or_create) for `T` or any subtype
    ///
    /// When nothing in the table fits, the wrapper is built with
    /// `T::from_handle`, so the call fails only for a null or cleared handle.
    pub fn get_or_create_as<T: FromHandle>(&self, handle: NativeHandle, resolver: &TypeResolver) -> Result<ObjectRef> {
        let direct = DirectConstructor {
            name: std::any::type_name::<T>(),
            build: construct_as::<T>,
        };
        self.get_or_create_with(handle, TypeId::of::<T>(), resolver, Some(direct))
    }

    fn get_or_create_with(
        &self,
        handle: NativeHandle,
        requested: TypeId,
        resolver: &TypeResolver,
        direct: Option<DirectConstructor>,
    ) -> Result<ObjectRef> {
        let table = resolver.table();

        let mut stale = None;
        if let Some(existing) = self.resolve(handle) {
            let actual = dynamic_type(existing.as_ref());
            if table.is_assignable(actual, requested) {
                return Ok(existing);
            }
            log_stale_handle(handle, existing.type_name(), table.type_name(requested));
            self.unregister(handle);
            stale = Some((existing, actual));
        }

        // No lock held: resolution sends messages to the native object
        let resolution = resolver.resolve(handle, requested);

        if let (Some((old, old_type)), Resolution::Resolved(ty)) = (&stale, &resolution) {
            // The class names a type the old wrapper can't stand for: another object
            if !table.is_assignable(ty.id(), *old_type) && old.handle() == Some(handle) {
                old.core().clear();
            }
        }

        let created = match (&resolution, direct) {
            (Resolution::Resolved(ty), _) => ty.construct(handle),
            // The requested type itself is more specific than any ancestor
            (Resolution::Fallback(ty), Some(direct)) if ty.id() != requested => {
                self.report_fallback(handle, resolver, direct.name);
                Some((direct.build)(handle))
            }
            (Resolution::Fallback(ty), _) => {
                self.report_fallback(handle, resolver, ty.name());
                ty.construct(handle)
            }
            (Resolution::Unresolvable, Some(direct)) => {
                self.report_fallback(handle, resolver, direct.name);
                Some((direct.build)(handle))
            }
            (Resolution::Unresolvable, None) => None,
        };
        let created = created.ok_or_else(|| {
            BridgeError::new(ErrorKind::UnresolvedType { handle }).with_context(table.type_name(requested))
        })?;

        let mut map = self.map.lock();
        // Another thread may have registered a usable wrapper meanwhile
        if let Some(raced) = map.get(&handle).and_then(Weak::upgrade) {
            if raced.handle() == Some(handle) && table.is_assignable(dynamic_type(raced.as_ref()), requested) {
                return Ok(raced);
            }
        }
        if !created.core().bind(handle) {
            return Err(BridgeError::invalid_argument("handle", "constructed wrapper rejected its handle"));
        }
        map.insert(handle, Arc::downgrade(&created));
        self.sweep_if_due(&mut map);
        drop(map);

        log_wrapper_created(handle, created.type_name());
        Ok(created)
    }

    fn report_fallback(&self, handle: NativeHandle, resolver: &TypeResolver, fallback: &str) {
        log_type_fallback(
            handle,
            resolver.class_name_of(handle).as_deref(),
            fallback,
            self.warn_on_fallback,
        );
    }

    /// Drop dead entries once the map has doubled since the last sweep
    fn sweep_if_due(&self, map: &mut HashMap<NativeHandle, Weak<dyn NativeObject>>) {
        if map.len() < self.sweep_at.load(Ordering::Relaxed) {
            return;
        }
        map.retain(|_, weak| weak.strong_count() > 0);
        self.sweep_at.store((map.len() * 2).max(SWEEP_THRESHOLD), Ordering::Relaxed);
    }

    /// Number of entries, including ones whose wrapper is already gone
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Remove entries whose wrapper has been dropped; returns how many
    ///
    /// `get_or_create` sweeps on its own as the map grows; entries made
    /// through `register` are only swept by that or by calling this.
    pub fn purge(&self) -> usize {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|_, weak| weak.strong_count() > 0);
        before - map.len()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::native_object;
    use crate::object::{BaseObject, FromHandle, ObjectCore};
    use crate::runtime::MemoryRuntime;
    use crate::types::{Module, TypeTable, WrapperType};

    struct Window {
        core: ObjectCore,
    }
    native_object!(Window, core);
    impl FromHandle for Window {
        fn from_handle(handle: NativeHandle) -> Self {
            Self { core: ObjectCore::new(handle) }
        }
    }

    struct Image {
        core: ObjectCore,
    }
    native_object!(Image, core);
    impl FromHandle for Image {
        fn from_handle(handle: NativeHandle) -> Self {
            Self { core: ObjectCore::new(handle) }
        }
    }

    fn setup() -> (Arc<MemoryRuntime>, TypeResolver) {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.define_class("NSWindow", Some("NSObject"));
        runtime.define_class("NSImage", Some("NSObject"));
        let table = Arc::new(TypeTable::new());
        let module = Module::new("test")
            .with_type(WrapperType::of::<BaseObject>("NSObject"))
            .with_type(WrapperType::of::<Window>("NSWindow"))
            .with_type(WrapperType::of::<Image>("NSImage"));
        table.register_module(&module, runtime.as_ref());
        let resolver = TypeResolver::new(runtime.clone(), table, Arc::new(BridgeConfig::default()));
        (runtime, resolver)
    }

    fn h(addr: usize) -> NativeHandle {
        NativeHandle::new(addr).unwrap()
    }

    #[test]
    fn test_register_then_resolve() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));

        registry.register(&a, h(0x100)).unwrap();
        assert!(Arc::ptr_eq(&registry.resolve(h(0x100)).unwrap(), &a));
        assert!(registry.resolve(h(0x200)).is_none());
    }

    #[test]
    fn test_register_rejects_zero_and_foreign_handles() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));

        let err = registry.register_raw(&a, 0).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NullArgument { .. }));

        let err = registry.register(&a, h(0x200)).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_register_binds_unbound_wrapper() {
        struct Fresh {
            core: ObjectCore,
        }
        native_object!(Fresh, core);

        let registry = HandleRegistry::new();
        let fresh: ObjectRef = Arc::new(Fresh { core: ObjectCore::unbound() });
        registry.register(&fresh, h(0x300)).unwrap();
        assert_eq!(fresh.handle(), Some(h(0x300)));
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));
        let b: ObjectRef = Arc::new(BaseObject::new(h(0x100)));

        registry.register(&a, h(0x100)).unwrap();
        registry.register(&b, h(0x100)).unwrap();
        assert!(Arc::ptr_eq(&registry.resolve(h(0x100)).unwrap(), &b));
    }

    #[test]
    fn test_weak_entries_do_not_keep_wrappers_alive() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));
        registry.register(&a, h(0x100)).unwrap();
        drop(a);

        assert!(registry.resolve(h(0x100)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_purge() {
        let registry = HandleRegistry::new();
        let keep: ObjectRef = Arc::new(BaseObject::new(h(0x100)));
        let gone: ObjectRef = Arc::new(BaseObject::new(h(0x200)));
        registry.register(&keep, h(0x100)).unwrap();
        registry.register(&gone, h(0x200)).unwrap();
        drop(gone);

        assert_eq!(registry.purge(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_dead_clears_wrapper() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));
        registry.register(&a, h(0x100)).unwrap();

        registry.mark_dead(h(0x100));
        registry.mark_dead(h(0x100));
        assert!(registry.resolve(h(0x100)).is_none());
        assert!(a.handle().is_none());
        assert!(a.live_handle().is_err());

        // A cleared wrapper can't come back for another handle
        assert!(registry.register(&a, h(0x100)).is_err());
    }

    #[test]
    fn test_unregister_keeps_wrapper_handle() {
        let registry = HandleRegistry::new();
        let a: ObjectRef = Arc::new(BaseObject::new(h(0x100)));
        registry.register(&a, h(0x100)).unwrap();

        registry.unregister(h(0x100));
        assert!(registry.resolve(h(0x100)).is_none());
        assert_eq!(a.handle(), Some(h(0x100)));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();
        let handle = runtime.alloc_named("NSWindow");

        let first = registry.get_or_create_as::<BaseObject>(handle, &resolver).unwrap();
        let second = registry.get_or_create_as::<BaseObject>(handle, &resolver).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dynamic_type(first.as_ref()), TypeId::of::<Window>());
    }

    #[test]
    fn test_get_or_create_detects_recycled_address() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();

        let window = runtime.alloc_named("NSWindow");
        let old = registry.get_or_create_as::<Window>(window, &resolver).unwrap();

        // The window dies without telling us, and its memory is reused
        runtime.dealloc(window);
        let image = runtime.alloc_named("NSImage");
        assert_eq!(window, image);

        let fresh = registry.get_or_create_as::<Image>(image, &resolver).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(dynamic_type(fresh.as_ref()), TypeId::of::<Image>());
        assert!(Arc::ptr_eq(&registry.resolve(image).unwrap(), &fresh));

        // Only one wrapper may answer for the address
        assert!(old.handle().is_none());
        assert!(old.live_handle().is_err());
        assert_eq!(fresh.handle(), Some(image));
    }

    #[test]
    fn test_less_specific_wrapper_is_replaced_not_cleared() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();
        let window = runtime.alloc_named("NSWindow");

        // A root wrapper registered by hand for the same object
        let root: ObjectRef = Arc::new(BaseObject::new(window));
        registry.register(&root, window).unwrap();

        let typed = registry.get_or_create_as::<Window>(window, &resolver).unwrap();
        assert!(!Arc::ptr_eq(&root, &typed));
        // Same object, so the old wrapper keeps its handle
        assert_eq!(root.handle(), Some(window));
    }

    #[test]
    fn test_unregistered_type_is_built_directly() {
        struct Widget {
            core: ObjectCore,
        }
        native_object!(Widget, core);
        impl FromHandle for Widget {
            fn from_handle(handle: NativeHandle) -> Self {
                Self { core: ObjectCore::new(handle) }
            }
        }

        let (runtime, resolver) = setup();
        let registry = HandleRegistry::with_fallback_warnings(false);
        let mystery = runtime.alloc_named("NSMystery");

        let obj = registry.get_or_create_as::<Widget>(mystery, &resolver).unwrap();
        assert_eq!(dynamic_type(obj.as_ref()), TypeId::of::<Widget>());
        assert!(Arc::ptr_eq(&obj, &registry.get_or_create_as::<Widget>(mystery, &resolver).unwrap()));

        // A registered class still wins over the direct constructor
        let window = runtime.alloc_named("NSWindow");
        let obj = registry.get_or_create_as::<BaseObject>(window, &resolver).unwrap();
        assert_eq!(dynamic_type(obj.as_ref()), TypeId::of::<Window>());
    }

    #[test]
    fn test_concurrent_get_or_create_agrees() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();
        let handles: Vec<NativeHandle> = (0..64).map(|_| runtime.alloc_named("NSWindow")).collect();
        let barrier = std::sync::Barrier::new(8);

        let results: Vec<Vec<ObjectRef>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        handles
                            .iter()
                            .map(|&h| registry.get_or_create_as::<BaseObject>(h, &resolver).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for (i, &handle) in handles.iter().enumerate() {
            let registered = registry.resolve(handle).unwrap();
            for wrappers in &results {
                assert!(Arc::ptr_eq(&wrappers[i], &registered));
            }
        }
    }

    #[test]
    fn test_get_or_create_sweeps_dead_entries() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();

        for _ in 0..SWEEP_THRESHOLD * 3 {
            let handle = runtime.alloc_named("NSWindow");
            drop(registry.get_or_create_as::<Window>(handle, &resolver).unwrap());
        }
        assert!(registry.len() <= SWEEP_THRESHOLD);
    }

    #[test]
    fn test_get_or_create_falls_back_to_requested_type() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::with_fallback_warnings(false);

        let unknown = runtime.alloc_named("NSSomethingElse");
        let obj = registry.get_or_create_as::<Window>(unknown, &resolver).unwrap();
        assert_eq!(dynamic_type(obj.as_ref()), TypeId::of::<Window>());
    }

    #[test]
    fn test_get_or_create_unregistered_type_fails() {
        let (runtime, resolver) = setup();
        let registry = HandleRegistry::new();
        let unknown = runtime.alloc_named("NSSomethingElse");

        let err = registry.get_or_create(unknown, TypeId::of::<String>(), &resolver).err().expect("expected UnresolvedType error");
        assert!(matches!(err.kind, ErrorKind::UnresolvedType { .. }));
    }
}
