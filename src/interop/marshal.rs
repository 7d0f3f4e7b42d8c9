//! Argument marshaling - native words ↔ managed values
//!
//! Design: the classification work happens once, when a `ConversionPlan` is
//! built for a signature. Each invocation only walks the plan.

use super::block::NativeBlock;
use super::types::{ArgSlots, Direction, ManagedValue, MethodSignature, ParamKind, Receiver, ReturnKind, ValueType};
use crate::errors::{BridgeError, Result};
use crate::object::{handle_of, raw_handle, ClassHandle, NativeHandle, ObjectRef, Selector};
use crate::registry::HandleRegistry;
use crate::types::TypeResolver;
use core::ffi::c_void;
use std::any::TypeId;

/// How one declared parameter is converted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Word passed to the implementation unchanged
    Passthrough,
    /// Narrow value: truncated to its width, sign-extended if signed
    Narrow(ValueType),
    Object { ty: TypeId },
    /// By-ref object slot; `read` is false for output-only parameters
    ObjectRef { ty: TypeId, read: bool },
    ObjectArray { ty: TypeId },
    StringArray,
    Text,
    Block { arity: usize },
    Opaque { ty: TypeId },
    Selector,
}

impl Conversion {
    #[inline]
    pub const fn needs_slot(self) -> bool {
        !matches!(self, Self::Passthrough | Self::Narrow(_))
    }

    #[inline]
    pub const fn writes_back(self) -> bool {
        matches!(self, Self::ObjectRef { .. })
    }
}

/// Per-parameter conversions for one signature, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPlan {
    steps: Vec<Conversion>,
    ret: ReturnKind,
    stret: bool,
    is_static: bool,
}

impl ConversionPlan {
    /// Classify every parameter; fails on the first one without a rule
    pub fn generate(signature: &MethodSignature) -> Result<Self> {
        let steps = signature
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| classify(index, param.direction, param.kind))
            .collect::<Result<Vec<_>>>()?;

        if signature.stret != matches!(signature.ret, ReturnKind::Struct { .. }) {
            return Err(BridgeError::unsupported(
                "structure return slot requires a structure return type",
            ));
        }

        Ok(Self {
            steps,
            ret: signature.ret,
            stret: signature.stret,
            is_static: signature.is_static,
        })
    }

    pub fn steps(&self) -> &[Conversion] {
        &self.steps
    }

    pub fn ret(&self) -> ReturnKind {
        self.ret
    }

    pub fn is_stret(&self) -> bool {
        self.stret
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Parameters that get a conversion slot
    pub fn converted_count(&self) -> usize {
        self.steps.iter().filter(|s| s.needs_slot()).count()
    }
}

fn classify(index: usize, direction: Direction, kind: ParamKind) -> Result<Conversion> {
    let by_ref = direction.is_by_ref();
    let conversion = match kind {
        // By-ref values are pointers the implementation uses as is
        ParamKind::Value(ty) if !by_ref && ty.is_narrow() => Conversion::Narrow(ty),
        ParamKind::Value(_) => Conversion::Passthrough,
        ParamKind::Object(ty) if by_ref => Conversion::ObjectRef {
            ty,
            read: direction == Direction::Ref,
        },
        ParamKind::Object(ty) => Conversion::Object { ty },
        _ if by_ref => {
            return Err(BridgeError::unresolved_conversion(
                index,
                format!("by-ref {:?} parameters have no conversion", kind),
            ))
        }
        ParamKind::ObjectArray(ty) => Conversion::ObjectArray { ty },
        ParamKind::StringArray => Conversion::StringArray,
        ParamKind::String => Conversion::Text,
        ParamKind::Block { arity } => Conversion::Block { arity },
        ParamKind::Opaque(ty) => Conversion::Opaque { ty },
        ParamKind::Selector => Conversion::Selector,
    };
    Ok(conversion)
}

/// Runs conversions against the registry and the native runtime
pub struct Marshaler<'a> {
    registry: &'a HandleRegistry,
    resolver: &'a TypeResolver,
}

impl<'a> Marshaler<'a> {
    pub fn new(registry: &'a HandleRegistry, resolver: &'a TypeResolver) -> Self {
        Self { registry, resolver }
    }

    /// Receiver from its raw word: wrapper for instance methods, class otherwise
    pub fn receiver(&self, word: usize, is_static: bool, declaring: TypeId) -> Result<Receiver> {
        if is_static {
            let class = ClassHandle::new(word).ok_or_else(|| BridgeError::null_argument("receiver"))?;
            return Ok(Receiver::Class(class));
        }
        let handle = NativeHandle::new(word).ok_or_else(|| BridgeError::null_argument("receiver"))?;
        let obj = self.registry.get_or_create(handle, declaring, self.resolver)?;
        Ok(Receiver::Instance(obj))
    }

    /// Convert incoming words into argument slots
    pub fn inbound(&self, plan: &ConversionPlan, words: &[usize]) -> Result<ArgSlots> {
        let mut slots = ArgSlots::with_capacity(words.len());
        for (index, (step, &word)) in plan.steps.iter().zip(words).enumerate() {
            slots.push(self.convert_in(index, *step, word)?);
        }
        Ok(slots)
    }

    fn convert_in(&self, index: usize, step: Conversion, word: usize) -> Result<ManagedValue> {
        let value = match step {
            Conversion::Passthrough => ManagedValue::Word(word),
            Conversion::Narrow(ty) => ManagedValue::Word(ty.normalize(word)),
            Conversion::Object { ty } => ManagedValue::Object(self.object(word, ty)?),
            Conversion::ObjectRef { ty, read } => {
                if word == 0 || !read {
                    ManagedValue::Object(None)
                } else {
                    // SAFETY: by-ref object parameters point at one handle-sized slot
                    let current = unsafe { core::ptr::read_unaligned(word as *const usize) };
                    ManagedValue::Object(self.object(current, ty)?)
                }
            }
            Conversion::ObjectArray { ty } => ManagedValue::Objects(match NativeHandle::new(word) {
                None => None,
                Some(array) => Some(
                    self.runtime()
                        .array_elements(array)
                        .into_iter()
                        .map(|item| self.object(raw_handle(item), ty))
                        .collect::<Result<Vec<_>>>()?,
                ),
            }),
            Conversion::StringArray => ManagedValue::Strings(NativeHandle::new(word).map(|array| {
                self.runtime()
                    .array_elements(array)
                    .into_iter()
                    .map(|item| item.and_then(|s| self.runtime().string_value(s)))
                    .collect()
            })),
            Conversion::Text => match NativeHandle::new(word) {
                None => ManagedValue::Text(None),
                Some(string) => {
                    let text = self
                        .runtime()
                        .string_value(string)
                        .ok_or_else(|| BridgeError::unresolved_conversion(index, "handle is not a native string"))?;
                    ManagedValue::Text(Some(text))
                }
            },
            Conversion::Block { arity } => ManagedValue::Block(NativeBlock::from_raw(word as *const c_void, arity)),
            Conversion::Opaque { ty } => ManagedValue::Object(match NativeHandle::new(word) {
                None => None,
                Some(handle) => Some(self.opaque(index, handle, ty)?),
            }),
            Conversion::Selector => ManagedValue::Selector(Selector::new(word)),
        };
        Ok(value)
    }

    /// Write by-ref object slots back through their pointers
    pub fn outbound(&self, plan: &ConversionPlan, words: &[usize], slots: &ArgSlots) -> Result<()> {
        for (index, step) in plan.steps.iter().enumerate() {
            if !step.writes_back() {
                continue;
            }
            let target = words.get(index).copied().unwrap_or(0);
            if target == 0 {
                continue;
            }
            let handle = match slots.get(index) {
                Some(ManagedValue::Object(obj)) => raw_handle(handle_of(obj.as_ref())),
                Some(other) => {
                    return Err(BridgeError::unresolved_conversion(
                        index,
                        format!("by-ref object slot holds a {}", other.kind_name()),
                    ))
                }
                None => 0,
            };
            // SAFETY: the pointer was handed to us for exactly this slot
            unsafe { core::ptr::write_unaligned(target as *mut usize, handle) };
        }
        Ok(())
    }

    /// Convert the implementation's result to the native return word
    pub fn return_word(&self, plan: &ConversionPlan, stret: usize, value: ManagedValue) -> Result<usize> {
        let word = match (plan.ret, value) {
            (ReturnKind::Void, _) => 0,
            (ReturnKind::Value(_), ManagedValue::Word(w)) => w,
            (ReturnKind::Object, ManagedValue::Object(obj)) => raw_handle(handle_of(obj.as_ref())),
            (ReturnKind::Object | ReturnKind::Value(_), ManagedValue::Void) => 0,
            (ReturnKind::String, ManagedValue::Text(None) | ManagedValue::Void) => 0,
            (ReturnKind::String, ManagedValue::Text(Some(text))) => {
                raw_handle(self.runtime().create_string(&text))
            }
            (ReturnKind::Struct { size }, ManagedValue::Bytes(bytes)) => {
                if stret == 0 {
                    return Err(BridgeError::null_argument("stret"));
                }
                let copied = size.min(bytes.len());
                // SAFETY: the caller's stret slot holds `size` bytes
                unsafe {
                    let dst = stret as *mut u8;
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, copied);
                    core::ptr::write_bytes(dst.add(copied), 0, size - copied);
                }
                stret
            }
            (ret, other) => {
                return Err(BridgeError::invalid_argument(
                    "return value",
                    format!("{:?} cannot be returned as a {}", ret, other.kind_name()),
                ))
            }
        };
        Ok(word)
    }

    fn object(&self, word: usize, ty: TypeId) -> Result<Option<ObjectRef>> {
        match NativeHandle::new(word) {
            None => Ok(None),
            Some(handle) => self.registry.get_or_create(handle, ty, self.resolver).map(Some),
        }
    }

    fn opaque(&self, index: usize, handle: NativeHandle, ty: TypeId) -> Result<ObjectRef> {
        self.resolver
            .table()
            .get(ty)
            .and_then(|wrapper| wrapper.construct(handle))
            .ok_or_else(|| BridgeError::unresolved_conversion(index, "opaque type has no handle constructor"))
    }

    fn runtime(&self) -> &dyn crate::runtime::NativeRuntime {
        self.resolver.runtime().as_ref()
    }
}
