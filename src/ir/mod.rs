// IR data model: the module produced by the eight-pass builder and handed
// read-only to codegen consumers.

pub mod inst;
pub mod method;
pub mod module;
pub mod types;

pub use inst::{BasicBlock, DebugInfo, Inst, InstKind};
pub use method::{IrMethod, Parameter};
pub use module::{ArrayInitBlob, Module, PrimitiveInfo, StringLiteral};
pub use types::{InterfaceImpl, IrField, IrType, MethodSlotRef, TypeSource, VTableEntry};
