//! Plain-data view of one loaded assembly.
//!
//! Everything downstream of the readers (reachability, the IR builder, the
//! gate) consumes these records; nothing below this module touches
//! `dotscope` or the on-disk format. Cross-entity references are carried by
//! canonical name, never by pointer, so a `RawAssembly` is freely clonable
//! and safe to build by hand in tests.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use bitflags::bitflags;

use super::cil::CilInst;

/// Start-line sentinel marking a hidden sequence point (ECMA-335 / PDB
/// convention).
pub const HIDDEN_SEQUENCE_POINT_LINE: u32 = 0xFEEF_EE;

bitflags! {
    /// ECMA-335 II.23.1.15 TypeAttributes, reduced to the bits the
    /// pipeline consults.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        const PUBLIC        = 0x0000_0001;
        const INTERFACE     = 0x0000_0020;
        const ABSTRACT      = 0x0000_0080;
        const SEALED        = 0x0000_0100;
        const SPECIAL_NAME  = 0x0000_0400;
        const IMPORT        = 0x0000_1000;
        const SERIALIZABLE  = 0x0000_2000;
        const EXPLICIT_LAYOUT = 0x0000_0010;
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    /// ECMA-335 II.23.1.5 FieldAttributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldFlags: u32 {
        const STATIC        = 0x0010;
        const INIT_ONLY     = 0x0020;
        const LITERAL       = 0x0040;
        const NOT_SERIALIZED = 0x0080;
        const SPECIAL_NAME  = 0x0200;
        const PINVOKE_IMPL  = 0x2000;
        const RT_SPECIAL_NAME = 0x0400;
        const HAS_FIELD_RVA = 0x0100;
        const PUBLIC        = 0x0006;
    }
}

bitflags! {
    /// ECMA-335 II.23.1.10 MethodAttributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u32 {
        const STATIC        = 0x0010;
        const FINAL         = 0x0020;
        const VIRTUAL       = 0x0040;
        const HIDE_BY_SIG   = 0x0080;
        const NEW_SLOT      = 0x0100;
        const ABSTRACT      = 0x0400;
        const SPECIAL_NAME  = 0x0800;
        const RT_SPECIAL_NAME = 0x1000;
        const PINVOKE_IMPL  = 0x2000;
        const PUBLIC        = 0x0006;
    }
}

bitflags! {
    /// ECMA-335 II.23.1.11 MethodImplAttributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodImplFlags: u32 {
        const NATIVE        = 0x0001;
        const RUNTIME       = 0x0003;
        const INTERNAL_CALL = 0x1000;
        const SYNCHRONIZED  = 0x0020;
        const NO_INLINING   = 0x0008;
    }
}

/// A by-name reference to a method, as it appears at a call-site.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MethodRef {
    /// Declaring type full name, instantiated form for generic owners
    /// (`List`1<System.Int32>`).
    pub owner: String,
    pub name: String,
    pub has_this: bool,
    pub return_type: String,
    pub params: Vec<String>,
    /// Concrete argument names when the site instantiates a generic method.
    pub generic_args: Vec<String>,
}

impl MethodRef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn fullname(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}({})", self.owner, self.name, self.params.join(","))
    }
}

/// A by-name reference to a field.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub field_type: String,
}

/// Stand-alone call-site signature for `calli`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CallSig {
    pub has_this: bool,
    pub return_type: String,
    pub params: Vec<String>,
}

/// `ldtoken` payload.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TokenRef {
    Type(String),
    Method(MethodRef),
    Field(FieldRef),
}

/// Literal constants attached to fields or parameters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ConstantValue {
    Bool(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    Str(String),
    Null,
}

impl ConstantValue {
    /// Literal rendering used for hoisted enum constants and defaults.
    pub fn render(&self) -> String {
        match self {
            ConstantValue::Bool(v) => v.to_string(),
            ConstantValue::Char(v) => v.to_string(),
            ConstantValue::I1(v) => v.to_string(),
            ConstantValue::U1(v) => v.to_string(),
            ConstantValue::I2(v) => v.to_string(),
            ConstantValue::U2(v) => v.to_string(),
            ConstantValue::I4(v) => v.to_string(),
            ConstantValue::U4(v) => v.to_string(),
            ConstantValue::I8(v) => v.to_string(),
            ConstantValue::U8(v) => v.to_string(),
            ConstantValue::R4(v) => v.to_string(),
            ConstantValue::R8(v) => v.to_string(),
            ConstantValue::Str(v) => format!("{v:?}"),
            ConstantValue::Null => "nullptr".to_string(),
        }
    }
}

/// A custom attribute application; only the constructor identity and the
/// rendered fixed arguments survive distillation from the blob.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CustomAttribute {
    pub attribute_type: String,
    pub fixed_args: Vec<String>,
}

/// P/Invoke import data from the ImplMap row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PInvokeInfo {
    pub module: String,
    pub entry_point: String,
    pub calling_convention: String,
    pub charset: String,
    pub set_last_error: bool,
}

/// `.override` binding from the MethodImpl table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplicitOverride {
    pub interface_type: String,
    pub method_name: String,
}

/// One row of the sequence-point table for a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencePoint {
    pub source_file: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub il_offset: u32,
}

impl SequencePoint {
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_SEQUENCE_POINT_LINE
    }
}

/// Exception-region kinds from the method data section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EhKind {
    Catch { catch_type: String },
    Filter { filter_offset: u32 },
    Finally,
    Fault,
}

/// One ECMA-335 EH clause, offsets in IL bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EhClause {
    pub kind: EhKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
}

impl EhClause {
    pub fn try_end(&self) -> u32 {
        self.try_offset + self.try_length
    }

    pub fn handler_end(&self) -> u32 {
        self.handler_offset + self.handler_length
    }
}

/// A local variable slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVar {
    pub name: Option<String>,
    pub local_type: String,
}

/// Decoded method body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawBody {
    pub max_stack: u16,
    pub init_locals: bool,
    pub locals: Vec<LocalVar>,
    pub ops: Vec<CilInst>,
    pub eh: Vec<EhClause>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawParam {
    pub name: Option<String>,
    pub param_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSig {
    pub has_this: bool,
    pub return_type: String,
    pub params: Vec<RawParam>,
}

impl MethodSig {
    /// Positional signature used for slot matching in v-table and
    /// interface-impl construction.
    pub fn param_types(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.param_type.as_str()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawMethod {
    pub name: String,
    pub flags: MethodFlags,
    pub impl_flags: MethodImplFlags,
    pub sig: MethodSig,
    pub generic_params: Vec<String>,
    pub body: Option<RawBody>,
    /// Set when the reader could not lower the IL stream (for example an
    /// unresolvable operand token); the gate stubs the method.
    pub body_error: Option<String>,
    pub pinvoke: Option<PInvokeInfo>,
    pub explicit_overrides: Vec<ExplicitOverride>,
    pub custom_attributes: Vec<CustomAttribute>,
    pub sequence_points: Vec<SequencePoint>,
}

impl RawMethod {
    pub fn new(name: impl Into<String>, sig: MethodSig) -> Self {
        Self {
            name: name.into(),
            flags: MethodFlags::default(),
            impl_flags: MethodImplFlags::default(),
            sig,
            generic_params: Vec::new(),
            body: None,
            body_error: None,
            pinvoke: None,
            explicit_overrides: Vec::new(),
            custom_attributes: Vec::new(),
            sequence_points: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodFlags::VIRTUAL)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    pub fn is_newslot(&self) -> bool {
        self.flags.contains(MethodFlags::NEW_SLOT)
    }

    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }

    pub fn is_cctor(&self) -> bool {
        self.name == ".cctor"
    }

    pub fn is_internal_call(&self) -> bool {
        self.impl_flags.contains(MethodImplFlags::INTERNAL_CALL)
            || self.impl_flags.contains(MethodImplFlags::RUNTIME)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawField {
    pub name: String,
    pub field_type: String,
    pub flags: FieldFlags,
    pub literal: Option<ConstantValue>,
    /// Mapped initializer bytes for fields with an RVA (array initializers).
    pub rva_data: Option<Vec<u8>>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl RawField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            flags: FieldFlags::default(),
            literal: None,
            rva_data: None,
            custom_attributes: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_literal(&self) -> bool {
        self.flags.contains(FieldFlags::LITERAL)
    }
}

/// Per-generic-parameter variance, from the GenericParam flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Variance {
    #[default]
    Invariant,
    Covariant,
    Contravariant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenericParam {
    pub name: String,
    pub variance: Variance,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawType {
    pub namespace: String,
    pub name: String,
    pub flags: TypeFlags,
    pub is_value_type: bool,
    pub is_enum: bool,
    pub is_delegate: bool,
    /// Records are recognized by their compiler-emitted `<Clone>$` member;
    /// in-memory assemblies set the flag directly.
    pub is_record: bool,
    pub base: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<RawField>,
    pub methods: Vec<RawMethod>,
    pub generic_params: Vec<GenericParam>,
    pub enum_underlying: Option<String>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl RawType {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            flags: TypeFlags::default(),
            is_value_type: false,
            is_enum: false,
            is_delegate: false,
            is_record: false,
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            generic_params: Vec::new(),
            enum_underlying: None,
            custom_attributes: Vec::new(),
        }
    }

    pub fn fullname(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(TypeFlags::ABSTRACT)
    }

    pub fn has_cctor(&self) -> bool {
        self.methods.iter().any(|m| m.is_cctor())
    }

    pub fn find_method(&self, name: &str) -> Option<&RawMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Reference to another assembly by simple name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyRef {
    pub name: String,
    pub version: Option<String>,
}

/// ExportedType row that forwards a name to another assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeForwarder {
    pub type_fullname: String,
    pub target_assembly: String,
}

/// Entry-point designation inside one assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPointRef {
    pub type_fullname: String,
    pub method_name: String,
}

/// Everything the pipeline needs from one assembly, decoded up front.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawAssembly {
    pub name: String,
    pub path: Option<PathBuf>,
    pub has_debug_symbols: bool,
    pub entry_point: Option<EntryPointRef>,
    pub types: Vec<RawType>,
    pub references: Vec<AssemblyRef>,
    pub forwarders: Vec<TypeForwarder>,
}

impl RawAssembly {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn find_type(&self, fullname: &str) -> Option<&RawType> {
        self.types.iter().find(|t| t.fullname() == fullname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_sequence_points_use_the_sentinel_line() {
        let sp = SequencePoint {
            source_file: "Program.cs".into(),
            start_line: HIDDEN_SEQUENCE_POINT_LINE,
            start_column: 0,
            end_line: HIDDEN_SEQUENCE_POINT_LINE,
            end_column: 0,
            il_offset: 4,
        };
        assert!(sp.is_hidden());
    }

    #[test]
    fn type_fullname_joins_namespace() {
        let t = RawType::new("Demo.App", "Calculator");
        assert_eq!(t.fullname(), "Demo.App.Calculator");
        let t = RawType::new("", "Program");
        assert_eq!(t.fullname(), "Program");
    }

    #[test]
    fn cctor_detection_scans_methods() {
        let mut t = RawType::new("Demo", "WithCctor");
        assert!(!t.has_cctor());
        t.methods.push(RawMethod::new(
            ".cctor",
            MethodSig {
                has_this: false,
                return_type: "System.Void".into(),
                params: vec![],
            },
        ));
        assert!(t.has_cctor());
    }
}
