//! Bridge context - registry, resolver and adapters owned by one object
//!
//! Design: nothing here is a process global except the entry-point route
//! table, which only maps selectors to the installed bridge that connected
//! them. Dropping a bridge removes its routes.

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, ErrorKind, Result};
use crate::interop::{
    create_block, entry_point, invoke_thunk, Adapter, AdapterFactory, BlockCallable, BlockLiteral, Conversion,
    Implementation, Marshaler, MethodSignature,
};
use crate::object::{BaseObject, ClassHandle, FromHandle, NativeHandle, NativeObject, ObjectRef, Selector};
use crate::registry::HandleRegistry;
use crate::runtime::NativeRuntime;
use crate::types::{Module, ModuleScan, TypeResolver, TypeTable, WrapperType};
use core::ffi::c_void;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use std::any::TypeId;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Module holding the root wrapper type
pub const ROOT_MODULE: &str = "nsbridge";

/// Selector address → bridge answering native entry points for it
static ROUTES: Lazy<DashMap<usize, Weak<Bridge>>> = Lazy::new(DashMap::new);

/// A managed implementation installed for one selector on one class
pub struct MethodBinding {
    pub class: ClassHandle,
    pub selector: Selector,
    pub declaring: TypeId,
    pub adapter: Arc<Adapter>,
    imp: Implementation,
}

impl MethodBinding {
    pub fn is_static(&self) -> bool {
        self.adapter.signature().is_static
    }
}

pub struct Bridge {
    runtime: Arc<dyn NativeRuntime>,
    config: Arc<BridgeConfig>,
    resolver: TypeResolver,
    registry: HandleRegistry,
    adapters: AdapterFactory,
    bindings: DashMap<(ClassHandle, Selector), Arc<MethodBinding>>,
    installed: OnceCell<Weak<Bridge>>,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn NativeRuntime>, config: BridgeConfig) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(TypeTable::new());
        let root = Module::new(ROOT_MODULE).with_type(WrapperType::of::<BaseObject>(BaseObject::NATIVE_CLASS));
        table.register_module(&root, runtime.as_ref());

        Self {
            resolver: TypeResolver::new(runtime.clone(), table, config.clone()),
            registry: HandleRegistry::with_fallback_warnings(config.warn_on_fallback),
            adapters: AdapterFactory::new(),
            bindings: DashMap::new(),
            installed: OnceCell::new(),
            runtime,
            config,
        }
    }

    pub fn with_defaults(runtime: Arc<dyn NativeRuntime>) -> Self {
        Self::new(runtime, BridgeConfig::default())
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<TypeTable> {
        self.resolver.table()
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn adapters(&self) -> &AdapterFactory {
        &self.adapters
    }

    // ------------------------------------------------------------------
    // Types and identity
    // ------------------------------------------------------------------

    /// Scan a module's wrapper types into the class table
    pub fn register_module(&self, module: &Module) -> ModuleScan {
        let scan = self.table().register_module(module, self.runtime.as_ref());
        info!(
            module = %module.name,
            registered = scan.registered,
            skipped = scan.skipped.len(),
            unbound = scan.unbound_classes.len(),
            "Module registered"
        );
        scan
    }

    pub fn register(&self, wrapper: &ObjectRef, handle: NativeHandle) -> Result<()> {
        self.registry.register(wrapper, handle)
    }

    pub fn resolve(&self, handle: NativeHandle) -> Option<ObjectRef> {
        self.registry.resolve(handle)
    }

    pub fn unregister(&self, handle: NativeHandle) {
        self.registry.unregister(handle)
    }

    pub fn mark_dead(&self, handle: NativeHandle) {
        self.registry.mark_dead(handle)
    }

    /// The native object behind `handle` was deallocated
    pub fn notify_dealloc(&self, handle: NativeHandle) {
        debug!(handle = %handle, "Native object deallocated");
        self.registry.mark_dead(handle)
    }

    /// Wrapper for `handle` usable as `T`, created if needed
    ///
    /// Never fails for lack of a matching type: `T::from_handle` is the last resort.
    pub fn get_or_create<T: FromHandle>(&self, handle: NativeHandle) -> Result<ObjectRef> {
        self.registry.get_or_create_as::<T>(handle, &self.resolver)
    }

    /// [`get_or_create`](Self::get_or_create) for a raw address; null gives `None`
    pub fn object_for<T: FromHandle>(&self, addr: usize) -> Result<Option<ObjectRef>> {
        match NativeHandle::new(addr) {
            None => Ok(None),
            Some(handle) => self.get_or_create::<T>(handle).map(Some),
        }
    }

    // ------------------------------------------------------------------
    // Late-bound methods
    // ------------------------------------------------------------------

    /// Install `imp` as the native implementation of `signature` on the
    /// class bound to `declaring`
    pub fn connect_method(
        &self,
        declaring: TypeId,
        signature: &MethodSignature,
        imp: Option<Implementation>,
    ) -> Result<Selector> {
        let imp = imp.ok_or_else(|| BridgeError::null_argument("method"))?;
        if signature.selector.is_empty() {
            return Err(BridgeError::null_argument("selector"));
        }

        let table = self.table();
        let ineligible = || {
            BridgeError::new(ErrorKind::IneligibleType {
                type_name: table.type_name(declaring).to_string(),
            })
        };
        let ty = table.get(declaring).ok_or_else(ineligible)?;
        if ty.is_model() {
            return Err(ineligible().with_context("model types have no native class"));
        }
        let class = table.class_for(declaring).ok_or_else(ineligible)?;

        let adapter = self.adapters.adapter_for(signature)?;
        self.check_wrapper_types(&adapter)?;
        let entry = entry_point(adapter.abi())?;
        let selector = self
            .runtime
            .selector(&signature.selector)
            .ok_or_else(|| BridgeError::invalid_argument("selector", "not registered by the runtime"))?;

        let binding = Arc::new(MethodBinding {
            class,
            selector,
            declaring,
            adapter: adapter.clone(),
            imp,
        });
        let previous = self.bindings.insert((class, selector), binding);

        if !self.runtime.add_method(class, selector, entry, adapter.encoding()) {
            match previous {
                Some(previous) => self.bindings.insert((class, selector), previous),
                None => self.bindings.remove(&(class, selector)).map(|(_, b)| b),
            };
            return Err(ineligible().with_context("native class rejected the method"));
        }

        if let Some(this) = self.installed.get() {
            ROUTES.insert(selector.addr(), this.clone());
        }

        debug!(
            selector = %signature.selector,
            wrapper = ty.name(),
            encoding = adapter.encoding(),
            "Method connected"
        );
        Ok(selector)
    }

    /// Every wrapper type the plan converts to must be buildable from the table
    fn check_wrapper_types(&self, adapter: &Adapter) -> Result<()> {
        let table = self.table();
        for (index, step) in adapter.plan().steps().iter().enumerate() {
            let (ty, buildable) = match *step {
                Conversion::Object { ty } | Conversion::ObjectRef { ty, .. } | Conversion::ObjectArray { ty } => {
                    (ty, table.nearest_constructible(ty).is_some())
                }
                Conversion::Opaque { ty } => (ty, table.get(ty).map_or(false, |t| t.is_constructible())),
                _ => continue,
            };
            if !buildable {
                return Err(BridgeError::unresolved_conversion(
                    index,
                    format!("wrapper type {} is not registered", table.type_name(ty)),
                ));
            }
        }
        Ok(())
    }

    /// [`connect_method`](Self::connect_method) on the class of `T`
    pub fn connect<T: NativeObject>(&self, signature: &MethodSignature, imp: Implementation) -> Result<Selector> {
        self.connect_method(TypeId::of::<T>(), signature, Some(imp))
    }

    /// Number of connected methods
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Route native entry points for this bridge's selectors here
    ///
    /// Returns false if the bridge was already installed.
    pub fn install(self: &Arc<Self>) -> bool {
        let this = Arc::downgrade(self);
        let first = self.installed.set(this.clone()).is_ok();
        for binding in self.bindings.iter() {
            ROUTES.insert(binding.selector.addr(), this.clone());
        }
        first
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get().is_some()
    }

    /// Run the managed implementation of `sel` for `receiver`
    pub fn dispatch(&self, receiver: NativeHandle, sel: Selector, args: &[usize]) -> Result<usize> {
        let mut words = Vec::with_capacity(args.len() + 2);
        words.push(receiver.addr());
        words.push(sel.addr());
        words.extend_from_slice(args);
        self.dispatch_words(false, &words)
    }

    /// [`dispatch`](Self::dispatch) for methods returning through a structure slot
    pub fn dispatch_stret(
        &self,
        stret: *mut c_void,
        receiver: NativeHandle,
        sel: Selector,
        args: &[usize],
    ) -> Result<usize> {
        let mut words = Vec::with_capacity(args.len() + 3);
        words.push(stret as usize);
        words.push(receiver.addr());
        words.push(sel.addr());
        words.extend_from_slice(args);
        self.dispatch_words(true, &words)
    }

    fn dispatch_words(&self, stret: bool, words: &[usize]) -> Result<usize> {
        let offset = usize::from(stret);
        let (receiver, sel) = match (words.get(offset), words.get(offset + 1)) {
            (Some(&receiver), Some(&sel)) => (receiver, sel),
            _ => {
                return Err(ErrorKind::ArgumentCount {
                    expected: offset + 2,
                    found: words.len(),
                }
                .into())
            }
        };
        let sel = Selector::new(sel).ok_or_else(|| BridgeError::null_argument("selector"))?;
        let binding = self.find_binding(receiver, sel)?;
        if binding.adapter.plan().is_stret() != stret {
            return Err(BridgeError::unsupported("structure return mismatch between caller and method"));
        }

        let marshaler = Marshaler::new(&self.registry, &self.resolver);
        binding.adapter.invoke(&marshaler, binding.declaring, &binding.imp, words)
    }

    /// Binding for `sel` on the receiver's class or its nearest superclass
    fn find_binding(&self, receiver: usize, sel: Selector) -> Result<Arc<MethodBinding>> {
        // Classes with a wrapper type may receive class methods directly
        let class_receiver = ClassHandle::new(receiver).filter(|c| self.table().for_class(*c).is_some());
        let mut class = match class_receiver {
            Some(class) => Some(class),
            None => NativeHandle::new(receiver).and_then(|h| self.resolver.class_of(h)),
        };

        while let Some(current) = class {
            let found = self.bindings.get(&(current, sel)).map(|b| Arc::clone(b.value()));
            if let Some(binding) = found {
                if binding.is_static() == class_receiver.is_some() {
                    return Ok(binding);
                }
            }
            class = self.runtime.superclass_of(current);
        }

        let name = self.runtime.selector_name(sel).unwrap_or_else(|| format!("{:#x}", sel.addr()));
        Err(BridgeError::invalid_argument(
            "selector",
            format!("no managed implementation of '{}' for {:#x}", name, receiver),
        ))
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Package `callable` as a global block taking `arity` word arguments
    pub fn create_block(&self, arity: usize, callable: BlockCallable) -> Result<*mut BlockLiteral> {
        let thunk = invoke_thunk(arity)
            .ok_or_else(|| BridgeError::unsupported(format!("blocks take at most 4 arguments, got {}", arity)))?;
        self.create_block_with(thunk, callable)
    }

    /// Package `callable` behind a caller-supplied invoke thunk
    pub fn create_block_with(&self, invoke: *const c_void, callable: BlockCallable) -> Result<*mut BlockLiteral> {
        let isa = self
            .runtime
            .class_by_name(&self.config.global_block_class)
            .map_or(core::ptr::null(), |class| class.as_ptr() as *const c_void);
        create_block(isa, invoke, callable)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.is_installed() {
            ROUTES.retain(|_, bridge| bridge.strong_count() > 0);
        }
    }
}

/// Entry-point target: hand the packed words to the bridge owning the selector
pub(crate) fn route(stret: bool, words: &[usize]) -> Result<usize> {
    let sel = words.get(if stret { 2 } else { 1 }).copied().unwrap_or(0);
    // Guard released before dispatching; implementations may connect methods
    let bridge = ROUTES.get(&sel).and_then(|entry| entry.value().upgrade());
    match bridge {
        Some(bridge) => bridge.dispatch_words(stret, words),
        None => Err(ErrorKind::NotInstalled.into()),
    }
}
