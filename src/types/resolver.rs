//! Type resolver - concrete wrapper type for a native handle
//!
//! Asks the object for its class, maps the class through the table, and
//! refines dynamic proxies through their description text. The refinement
//! is a heuristic: it trusts the leading token of the description to be a
//! class name and gives up quietly when that doesn't work out.

use super::table::{TypeTable, WrapperType};
use crate::config::BridgeConfig;
use crate::logging::log_proxy_refined;
use crate::object::{ClassHandle, NativeHandle};
use crate::runtime::NativeRuntime;
use std::any::TypeId;
use std::sync::Arc;

/// How a wrapper type was chosen
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The handle's class maps to a usable type
    Resolved(Arc<WrapperType>),
    /// Nothing better was found; the requested type (or its nearest constructible ancestor)
    Fallback(Arc<WrapperType>),
    /// Not even the fallback can be constructed
    Unresolvable,
}

impl Resolution {
    pub fn wrapper_type(&self) -> Option<&Arc<WrapperType>> {
        match self {
            Self::Resolved(ty) | Self::Fallback(ty) => Some(ty),
            Self::Unresolvable => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

pub struct TypeResolver {
    runtime: Arc<dyn NativeRuntime>,
    table: Arc<TypeTable>,
    config: Arc<BridgeConfig>,
}

impl TypeResolver {
    pub fn new(runtime: Arc<dyn NativeRuntime>, table: Arc<TypeTable>, config: Arc<BridgeConfig>) -> Self {
        Self { runtime, table, config }
    }

    pub fn table(&self) -> &Arc<TypeTable> {
        &self.table
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    /// Native class of a handle (the "class" message)
    pub fn class_of(&self, handle: NativeHandle) -> Option<ClassHandle> {
        let sel = self.runtime.selector(&self.config.class_query)?;
        ClassHandle::new(self.runtime.send(handle, sel, &[]))
    }

    /// Wrapper type for the handle's class, `None` if unmapped
    pub fn lookup(&self, handle: NativeHandle) -> Option<Arc<WrapperType>> {
        self.class_of(handle).and_then(|class| self.table.for_class(class))
    }

    /// Pick the wrapper type to build for `handle` when `requested` is expected
    pub fn resolve(&self, handle: NativeHandle, requested: TypeId) -> Resolution {
        let mut found = self.lookup(handle);

        if let Some(ty) = &found {
            if ty.is_proxy() && !self.table.is_assignable(ty.id(), requested) {
                found = if self.config.proxy_disambiguation {
                    self.refine_proxy(handle)
                } else {
                    None
                };
            }
        }

        match found {
            Some(ty) if ty.is_constructible() && self.table.is_assignable(ty.id(), requested) => {
                Resolution::Resolved(ty)
            }
            _ => match self.table.nearest_constructible(requested) {
                Some(ty) => Resolution::Fallback(ty),
                None => Resolution::Unresolvable,
            },
        }
    }

    /// Re-run the lookup on the class named by the description's leading token
    pub fn refine_proxy(&self, handle: NativeHandle) -> Option<Arc<WrapperType>> {
        let description = self.description(handle)?;
        let candidate = leading_class_name(&description)?;

        let refined = self
            .runtime
            .class_by_name(candidate)
            .and_then(|class| self.table.for_class(class))
            .filter(|ty| ty.is_constructible());

        log_proxy_refined(handle, candidate, refined.is_some());
        refined
    }

    fn description(&self, handle: NativeHandle) -> Option<String> {
        let sel = self.runtime.selector(&self.config.description_query)?;
        let text = self.runtime.send_for_object(handle, sel)?;
        self.runtime.string_value(text)
    }

    /// Native class name of a handle, for diagnostics
    pub fn class_name_of(&self, handle: NativeHandle) -> Option<String> {
        self.class_of(handle).and_then(|class| self.runtime.class_name(class))
    }
}

/// Text up to the first space
fn leading_class_name(description: &str) -> Option<&str> {
    let candidate = description.split(' ').next()?;
    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}
