//! Class table - native class identity to wrapper type
//!
//! Built once per module at registration time by scanning the module's
//! wrapper types. Only types deriving from the root wrapper take part.

use crate::logging::log_class_registered;
use crate::object::{BaseObject, ClassHandle, FromHandle, NativeHandle, NativeObject, ObjectRef};
use crate::runtime::NativeRuntime;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a wrapper for a handle
pub type Constructor = Arc<dyn Fn(NativeHandle) -> ObjectRef + Send + Sync>;

/// Metadata for one wrapper type
#[derive(Clone)]
pub struct WrapperType {
    id: TypeId,
    name: &'static str,
    native_class: String,
    parent: Option<TypeId>,
    constructor: Option<Constructor>,
    proxy: bool,
    model: bool,
}

impl WrapperType {
    /// Wrapper type constructible from a handle, deriving from the root
    pub fn of<T: FromHandle>(native_class: &str) -> Self {
        let mut ty = Self::without_constructor::<T>(native_class);
        ty.constructor = Some(Arc::new(|h| Arc::new(T::from_handle(h)) as ObjectRef));
        ty
    }

    /// Wrapper type that has no handle-based constructor
    pub fn without_constructor<T: NativeObject>(native_class: &str) -> Self {
        let id = TypeId::of::<T>();
        let root = TypeId::of::<BaseObject>();
        Self {
            id,
            name: std::any::type_name::<T>(),
            native_class: native_class.to_string(),
            parent: if id == root { None } else { Some(root) },
            constructor: None,
            proxy: false,
            model: false,
        }
    }

    pub fn extends<P: NativeObject>(mut self) -> Self {
        self.parent = Some(TypeId::of::<P>());
        self
    }

    /// Detach from the root wrapper (such types are skipped by module scans)
    pub fn standalone(mut self) -> Self {
        self.parent = None;
        self
    }

    /// Mark as a dynamic-proxy class that may stand in for another class
    pub fn proxy(mut self) -> Self {
        self.proxy = true;
        self
    }

    /// Mark as a model (protocol-only) type with no native class of its own
    pub fn model(mut self) -> Self {
        self.model = true;
        self
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn native_class(&self) -> &str {
        &self.native_class
    }

    pub fn parent(&self) -> Option<TypeId> {
        self.parent
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn is_model(&self) -> bool {
        self.model
    }

    pub fn is_constructible(&self) -> bool {
        self.constructor.is_some()
    }

    pub fn construct(&self, handle: NativeHandle) -> Option<ObjectRef> {
        self.constructor.as_ref().map(|ctor| ctor(handle))
    }
}

impl fmt::Debug for WrapperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperType")
            .field("name", &self.name)
            .field("native_class", &self.native_class)
            .field("constructible", &self.is_constructible())
            .field("proxy", &self.proxy)
            .field("model", &self.model)
            .finish()
    }
}

/// A unit of wrapper types registered together
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub types: Vec<WrapperType>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, ty: WrapperType) -> Self {
        self.types.push(ty);
        self
    }
}

/// Outcome of scanning one module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleScan {
    pub registered: usize,
    pub skipped: Vec<&'static str>,
    pub unbound_classes: Vec<String>,
}

#[derive(Default)]
struct Tables {
    types: HashMap<TypeId, Arc<WrapperType>>,
    by_class: HashMap<ClassHandle, TypeId>,
    class_of_type: HashMap<TypeId, ClassHandle>,
    modules: Vec<String>,
}

/// Class→type table shared by the resolver and the registry
pub struct TypeTable {
    tables: RwLock<Tables>,
}

impl TypeTable {
    /// Table holding only the root wrapper
    pub fn new() -> Self {
        let mut tables = Tables::default();
        let root = Arc::new(WrapperType::of::<BaseObject>(BaseObject::NATIVE_CLASS));
        tables.types.insert(root.id, root);
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Scan a module's types and map their native classes
    ///
    /// Native calls happen with no table lock held.
    pub fn register_module(&self, module: &Module, runtime: &dyn NativeRuntime) -> ModuleScan {
        let mut scan = ModuleScan::default();

        // Types first, so parents declared later in the same module count
        let accepted: Vec<Arc<WrapperType>> = {
            let mut tables = self.tables.write();
            let candidates: HashMap<TypeId, &WrapperType> =
                module.types.iter().map(|t| (t.id, t)).collect();
            let mut accepted = Vec::new();
            for ty in &module.types {
                if derives_from_root(ty, &tables.types, &candidates) {
                    accepted.push(Arc::new(ty.clone()));
                } else {
                    debug!(wrapper = ty.name, "Skipping type not deriving from the root wrapper");
                    scan.skipped.push(ty.name);
                }
            }
            for ty in &accepted {
                tables.types.insert(ty.id, ty.clone());
            }
            tables.modules.push(module.name.clone());
            accepted
        };

        // Parents before children so allocated classes find their superclass
        let mut pending: Vec<Arc<WrapperType>> = accepted.into_iter().filter(|t| !t.model).collect();
        while !pending.is_empty() {
            let pending_ids: Vec<TypeId> = pending.iter().map(|t| t.id).collect();
            let mut deferred = Vec::new();
            let mut progressed = false;
            for ty in pending {
                let waiting = ty.parent.map_or(false, |p| {
                    p != ty.id && pending_ids.contains(&p) && self.class_for(p).is_none()
                });
                if waiting {
                    deferred.push(ty);
                    continue;
                }
                progressed = true;
                match self.bind_class(&ty, runtime) {
                    Some(class) => {
                        log_class_registered(class, ty.name);
                        scan.registered += 1;
                    }
                    None => scan.unbound_classes.push(ty.native_class.clone()),
                }
            }
            if !progressed {
                scan.unbound_classes
                    .extend(deferred.iter().map(|t| t.native_class.clone()));
                break;
            }
            pending = deferred;
        }

        scan
    }

    fn bind_class(&self, ty: &WrapperType, runtime: &dyn NativeRuntime) -> Option<ClassHandle> {
        let class = match runtime.class_by_name(&ty.native_class) {
            Some(class) => Some(class),
            None => {
                let superclass = ty.parent.and_then(|p| self.class_for(p))?;
                runtime.allocate_class(&ty.native_class, superclass)
            }
        }?;
        let mut tables = self.tables.write();
        tables.by_class.insert(class, ty.id);
        tables.class_of_type.insert(ty.id, class);
        Some(class)
    }

    pub fn get(&self, id: TypeId) -> Option<Arc<WrapperType>> {
        self.tables.read().types.get(&id).cloned()
    }

    pub fn root(&self) -> Arc<WrapperType> {
        self.get(TypeId::of::<BaseObject>())
            .unwrap_or_else(|| Arc::new(WrapperType::of::<BaseObject>(BaseObject::NATIVE_CLASS)))
    }

    /// Wrapper type mapped to a native class, `None` if unmapped
    pub fn for_class(&self, class: ClassHandle) -> Option<Arc<WrapperType>> {
        let tables = self.tables.read();
        let id = tables.by_class.get(&class)?;
        tables.types.get(id).cloned()
    }

    /// Native class a wrapper type was bound to
    pub fn class_for(&self, id: TypeId) -> Option<ClassHandle> {
        self.tables.read().class_of_type.get(&id).copied()
    }

    /// Can a wrapper of type `actual` be used where `requested` is expected
    pub fn is_assignable(&self, actual: TypeId, requested: TypeId) -> bool {
        if actual == requested {
            return true;
        }
        let tables = self.tables.read();
        let mut current = tables.types.get(&actual).and_then(|t| t.parent);
        while let Some(id) = current {
            if id == requested {
                return true;
            }
            current = tables.types.get(&id).and_then(|t| t.parent);
        }
        false
    }

    /// `requested` itself if constructible, else its nearest constructible ancestor
    pub fn nearest_constructible(&self, requested: TypeId) -> Option<Arc<WrapperType>> {
        let tables = self.tables.read();
        let mut current = tables.types.get(&requested);
        while let Some(ty) = current {
            if ty.is_constructible() {
                return Some(ty.clone());
            }
            current = ty.parent.and_then(|p| tables.types.get(&p));
        }
        None
    }

    pub fn type_name(&self, id: TypeId) -> &'static str {
        self.tables.read().types.get(&id).map_or("<unregistered>", |t| t.name)
    }

    pub fn modules(&self) -> Vec<String> {
        self.tables.read().modules.clone()
    }

    pub fn class_count(&self) -> usize {
        self.tables.read().by_class.len()
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn derives_from_root(
    ty: &WrapperType,
    known: &HashMap<TypeId, Arc<WrapperType>>,
    candidates: &HashMap<TypeId, &WrapperType>,
) -> bool {
    let root = TypeId::of::<BaseObject>();
    let mut current = ty.parent;
    // Bounded walk guards against parent cycles in malformed modules
    for _ in 0..=known.len() + candidates.len() {
        match current {
            Some(id) if id == root => return true,
            Some(id) => {
                current = match (known.get(&id), candidates.get(&id)) {
                    (Some(t), _) => t.parent,
                    (None, Some(t)) => t.parent,
                    (None, None) => return false,
                }
            }
            None => return ty.id == root,
        }
    }
    false
}
