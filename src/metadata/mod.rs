// Metadata layer: raw-assembly model, the CIL opcode set, and the readers
// that populate the model from disk.

pub mod cil;
pub mod model;
pub mod pdb;
pub mod reader;
pub mod sig;

pub use model::{
    ConstantValue, EhClause, EhKind, FieldRef, MethodRef, RawAssembly, RawBody, RawField,
    RawMethod, RawType, SequencePoint,
};
pub use reader::MetadataSource;
