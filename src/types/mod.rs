//! Wrapper type system - class table and type resolution
//!
//! Architecture:
//! - `table.rs` - wrapper type metadata and the class→type table built by module scans
//! - `resolver.rs` - handle→type resolution with proxy disambiguation

mod resolver;
mod table;

pub use resolver::{Resolution, TypeResolver};
pub use table::{Constructor, Module, ModuleScan, TypeTable, WrapperType};
