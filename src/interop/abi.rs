//! Native-side adapter signatures
//!
//! Every adapter is entered with the calling convention's fixed leading
//! parameters ahead of the declared ones: `(receiver, selector)`, or
//! `(stret, receiver, selector)` when the result goes through a structure
//! return slot. Wrapped objects travel as raw handles, strings as native
//! string handles and blocks as raw pointers.

use super::types::{MethodSignature, ParamDescriptor, ParamKind, ReturnKind, ValueType};

/// Parameter type as it appears in the native entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    /// Raw object handle
    Handle,
    /// Native string handle
    StringHandle,
    /// Raw block pointer
    FunctionPointer,
    Selector,
    Class,
    /// Pointer to a caller-owned slot (by-ref parameters)
    Pointer,
    /// Structure return slot
    StretPointer,
    Value(ValueType),
}

impl AbiType {
    /// Fits a general purpose register
    #[inline]
    pub const fn is_word(self) -> bool {
        match self {
            Self::Value(ty) => !ty.is_float(),
            _ => true,
        }
    }
}

/// Full native parameter list of one adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbiSignature {
    pub params: Vec<AbiType>,
    pub ret: Option<AbiType>,
    /// Number of leading convention parameters in `params`
    pub leading: usize,
}

impl AbiSignature {
    pub fn for_method(signature: &MethodSignature) -> Self {
        let receiver = if signature.is_static { AbiType::Class } else { AbiType::Handle };
        let mut params = Vec::with_capacity(signature.params.len() + 3);
        if signature.stret {
            params.push(AbiType::StretPointer);
        }
        params.push(receiver);
        params.push(AbiType::Selector);
        let leading = params.len();
        params.extend(signature.params.iter().map(|p| abi_param(*p)));

        let ret = match signature.ret {
            ReturnKind::Void => None,
            ReturnKind::Value(ty) => Some(AbiType::Value(ty)),
            ReturnKind::Object => Some(AbiType::Handle),
            ReturnKind::String => Some(AbiType::StringHandle),
            ReturnKind::Struct { .. } => None,
        };

        Self { params, ret, leading }
    }

    /// Declared parameters only
    pub fn declared(&self) -> &[AbiType] {
        &self.params[self.leading..]
    }

    /// Every parameter and the return fit word-sized registers
    pub fn is_word_only(&self) -> bool {
        self.params.iter().all(|p| p.is_word()) && self.ret.map_or(true, AbiType::is_word)
    }
}

fn abi_param(param: ParamDescriptor) -> AbiType {
    if param.direction.is_by_ref() {
        return AbiType::Pointer;
    }
    match param.kind {
        ParamKind::Value(ty) => AbiType::Value(ty),
        ParamKind::Object(_) | ParamKind::ObjectArray(_) | ParamKind::StringArray | ParamKind::Opaque(_) => {
            AbiType::Handle
        }
        ParamKind::String => AbiType::StringHandle,
        ParamKind::Block { .. } => AbiType::FunctionPointer,
        ParamKind::Selector => AbiType::Selector,
    }
}

/// Native method type encoding, e.g. `v@:@` or `@@:^@`
pub fn type_encoding(signature: &MethodSignature) -> String {
    let mut out = String::with_capacity(4 + signature.params.len() * 2);
    out.push_str(match signature.ret {
        ReturnKind::Void => "v",
        ReturnKind::Value(ty) => ty.encoding(),
        ReturnKind::Object | ReturnKind::String => "@",
        ReturnKind::Struct { .. } => "{?=}",
    });
    out.push_str(if signature.is_static { "#:" } else { "@:" });

    for param in &signature.params {
        let code = match param.kind {
            ParamKind::Value(ty) => ty.encoding(),
            ParamKind::Object(_)
            | ParamKind::ObjectArray(_)
            | ParamKind::StringArray
            | ParamKind::String
            | ParamKind::Opaque(_) => "@",
            ParamKind::Block { .. } => "@?",
            ParamKind::Selector => ":",
        };
        if param.direction.is_by_ref() {
            out.push('^');
        }
        out.push_str(code);
    }
    out
}

