//! Interoperability - native calls into managed implementations
//!
//! Design: no code generation at runtime. One generic adapter per signature
//! interprets a precomputed conversion plan on every call.
//!
//! Architecture:
//! - `types.rs` - signature descriptors and managed values
//! - `abi.rs` - native parameter lists and type encodings
//! - `marshal.rs` - conversion plans and per-call marshaling
//! - `adapter.rs` - adapters and the signature-keyed adapter cache
//! - `call.rs` - word-sized native calls and `extern "C"` entry points
//! - `block.rs` - block records for managed callbacks

mod abi;
mod adapter;
mod block;
mod call;
mod marshal;
mod types;

pub use abi::{type_encoding, AbiSignature, AbiType};
pub use adapter::{Adapter, AdapterFactory, Implementation};
pub use block::{
    create_block, invoke_thunk, BlockCallable, BlockDescriptor, BlockLiteral, NativeBlock, BLOCK_IS_GLOBAL,
};
pub use call::{call_block, call_imp, call_imp_stret, entry_point, MAX_WORD_ARGS};
pub use marshal::{Conversion, ConversionPlan, Marshaler};
pub use types::{
    ArgSlots, CallFrame, Direction, ManagedValue, MethodSignature, ParamDescriptor, ParamKind, Receiver,
    ReturnKind, ValueType,
};
