//! Parameter and value model for native call marshaling
//!
//! Describes method signatures as the native side sees them and the values
//! an implementation receives once arguments have been converted.

use crate::errors::{BridgeError, Result};
use crate::interop::block::NativeBlock;
use crate::object::{handle_of, ClassHandle, NativeHandle, ObjectRef, Selector};
use smallvec::SmallVec;
use std::any::TypeId;
use std::fmt;

/// Plain (passthrough) value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
}

impl ValueType {
    /// Size in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => core::mem::size_of::<usize>(),
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Narrower than a register; its upper bits arrive unspecified
    #[inline]
    pub const fn is_narrow(self) -> bool {
        !self.is_float() && self.size() < core::mem::size_of::<usize>()
    }

    /// Keep only the value's own bits of a register word, sign-extending signed types
    pub const fn normalize(self, word: usize) -> usize {
        match self {
            Self::Bool => (word as u8 != 0) as usize,
            Self::I8 => word as i8 as isize as usize,
            Self::I16 => word as i16 as isize as usize,
            Self::I32 => word as i32 as isize as usize,
            Self::U8 => word as u8 as usize,
            Self::U16 => word as u16 as usize,
            Self::U32 => word as u32 as usize,
            _ => word,
        }
    }

    /// Native type encoding code
    pub const fn encoding(self) -> &'static str {
        match self {
            Self::Bool => "B",
            Self::I8 => "c",
            Self::I16 => "s",
            Self::I32 => "i",
            Self::I64 => "q",
            Self::U8 => "C",
            Self::U16 => "S",
            Self::U32 => "I",
            Self::U64 => "Q",
            Self::F32 => "f",
            Self::F64 => "d",
            Self::Pointer => "^v",
        }
    }
}

/// How a parameter travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    /// By-ref, written by the callee only
    Out,
    /// By-ref, read and written
    Ref,
}

impl Direction {
    #[inline]
    pub const fn is_by_ref(self) -> bool {
        matches!(self, Self::Out | Self::Ref)
    }
}

/// What a parameter is on the managed side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Value(ValueType),
    /// Wrapped object of the given wrapper type (resolved through the registry)
    Object(TypeId),
    /// Native array of handles, each resolved as the given wrapper type
    ObjectArray(TypeId),
    /// Native array of strings
    StringArray,
    String,
    /// Callback block taking `arity` word arguments
    Block { arity: usize },
    /// Object built straight from its handle, never registered
    Opaque(TypeId),
    Selector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamDescriptor {
    pub direction: Direction,
    pub kind: ParamKind,
}

impl ParamDescriptor {
    pub const fn new(direction: Direction, kind: ParamKind) -> Self {
        Self { direction, kind }
    }

    pub const fn value(ty: ValueType) -> Self {
        Self::new(Direction::In, ParamKind::Value(ty))
    }

    pub fn object<T: 'static>() -> Self {
        Self::new(Direction::In, ParamKind::Object(TypeId::of::<T>()))
    }

    /// By-ref object parameter (`T**`)
    pub fn object_ref<T: 'static>(direction: Direction) -> Self {
        Self::new(direction, ParamKind::Object(TypeId::of::<T>()))
    }

    pub fn objects<T: 'static>() -> Self {
        Self::new(Direction::In, ParamKind::ObjectArray(TypeId::of::<T>()))
    }

    pub fn opaque<T: 'static>() -> Self {
        Self::new(Direction::In, ParamKind::Opaque(TypeId::of::<T>()))
    }

    pub const fn string() -> Self {
        Self::new(Direction::In, ParamKind::String)
    }

    pub const fn strings() -> Self {
        Self::new(Direction::In, ParamKind::StringArray)
    }

    pub const fn block(arity: usize) -> Self {
        Self::new(Direction::In, ParamKind::Block { arity })
    }

    pub const fn selector() -> Self {
        Self::new(Direction::In, ParamKind::Selector)
    }
}

/// Return value as declared by the native method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Void,
    Value(ValueType),
    Object,
    String,
    /// Structure of `size` bytes written through the stret slot
    Struct { size: usize },
}

/// Shape of one native method: the adapter cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub selector: String,
    pub params: Vec<ParamDescriptor>,
    pub ret: ReturnKind,
    pub stret: bool,
    pub is_static: bool,
}

impl MethodSignature {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            params: Vec::new(),
            ret: ReturnKind::Void,
            stret: false,
            is_static: false,
        }
    }

    pub fn param(mut self, param: ParamDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ret: ReturnKind) -> Self {
        if let ReturnKind::Struct { .. } = ret {
            self.stret = true;
        }
        self.ret = ret;
        self
    }

    pub fn class_method(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Who a method was invoked on
#[derive(Clone)]
pub enum Receiver {
    Instance(ObjectRef),
    Class(ClassHandle),
}

impl Receiver {
    pub fn object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Instance(obj) => Some(obj),
            Self::Class(_) => None,
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(obj) => write!(f, "Instance({}, {:?})", obj.type_name(), obj.handle()),
            Self::Class(class) => write!(f, "Class({:?})", class),
        }
    }
}

/// A converted argument or return value
#[derive(Clone, Default)]
pub enum ManagedValue {
    #[default]
    Void,
    /// Passed through unchanged
    Word(usize),
    Object(Option<ObjectRef>),
    Objects(Option<Vec<Option<ObjectRef>>>),
    Strings(Option<Vec<Option<String>>>),
    Text(Option<String>),
    Block(Option<NativeBlock>),
    Selector(Option<Selector>),
    Bytes(Vec<u8>),
}

impl ManagedValue {
    pub fn as_word(&self) -> Option<usize> {
        match self {
            Self::Word(w) => Some(*w),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(obj) => obj.as_ref(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => text.as_deref(),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&NativeBlock> {
        match self {
            Self::Block(block) => block.as_ref(),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Word(_) => "word",
            Self::Object(_) => "object",
            Self::Objects(_) => "object array",
            Self::Strings(_) => "string array",
            Self::Text(_) => "string",
            Self::Block(_) => "block",
            Self::Selector(_) => "selector",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Debug for ManagedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "Void"),
            Self::Word(w) => write!(f, "Word({:#x})", w),
            Self::Object(obj) => write!(f, "Object({:?})", handle_of(obj.as_ref())),
            Self::Objects(items) => write!(f, "Objects({:?})", items.as_ref().map(Vec::len)),
            Self::Strings(items) => write!(f, "Strings({:?})", items),
            Self::Text(text) => write!(f, "Text({:?})", text),
            Self::Block(block) => write!(f, "Block({:?})", block),
            Self::Selector(sel) => write!(f, "Selector({:?})", sel),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

/// Per-invocation argument slots
pub type ArgSlots = SmallVec<[ManagedValue; 6]>;

/// What the implementation sees: receiver, selector and converted arguments
#[derive(Debug)]
pub struct CallFrame {
    pub receiver: Receiver,
    pub selector: Selector,
    pub args: ArgSlots,
}

impl CallFrame {
    pub fn arg(&self, index: usize) -> Result<&ManagedValue> {
        self.args.get(index).ok_or_else(|| {
            BridgeError::invalid_argument("index", format!("no argument {} in a {}-argument call", index, self.args.len()))
        })
    }

    pub fn object(&self, index: usize) -> Result<Option<&ObjectRef>> {
        Ok(self.arg(index)?.as_object())
    }

    /// Word argument; narrow value parameters are already truncated to
    /// their width (signed ones sign-extended)
    pub fn word(&self, index: usize) -> Result<usize> {
        match self.arg(index)? {
            ManagedValue::Word(w) => Ok(*w),
            other => Err(BridgeError::invalid_argument(
                "index",
                format!("argument {} is a {}, not a word", index, other.kind_name()),
            )),
        }
    }

    pub fn text(&self, index: usize) -> Result<Option<&str>> {
        Ok(self.arg(index)?.as_text())
    }

    /// Replace an argument slot (by-ref outputs are written back from here)
    pub fn set(&mut self, index: usize, value: ManagedValue) -> Result<()> {
        let count = self.args.len();
        let slot = self.args.get_mut(index).ok_or_else(|| {
            BridgeError::invalid_argument("index", format!("no argument {} in a {}-argument call", index, count))
        })?;
        *slot = value;
        Ok(())
    }

    /// Raw handle of the receiver (instance or class)
    pub fn receiver_handle(&self) -> Option<NativeHandle> {
        match &self.receiver {
            Receiver::Instance(obj) => obj.handle(),
            Receiver::Class(class) => NativeHandle::new(class.addr()),
        }
    }
}
