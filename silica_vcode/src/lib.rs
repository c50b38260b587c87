//! VCODE: the typed control-flow IR consumed by the JIT pipeline.
//!
//! A unit is a graph of basic blocks holding typed ops over virtual
//! registers and frame variables. This crate provides:
//! - The type system and aggregate layouts (`types`)
//! - Unit construction and the read-side query surface (`unit`)
//! - Annotated dumps for diagnostics (`dump`)

pub mod dump;
pub mod types;
pub mod unit;

pub use dump::{DumpAnnotator, NoAnnotations};
pub use types::{uarray, TypeKind, VType, WORD_SIZE};
pub use unit::{BlockId, Opcode, RegId, Unit, UnitBuilder, UnitId, UnitKind, VCmp, VarId};
