//! Type, field, v-table and interface-dispatch records.

use serde::Serialize;

use crate::metadata::model::{ConstantValue, CustomAttribute, Variance};

use super::method::IrMethod;

/// Where a type came from, which decides how the emitter treats it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TypeSource {
    User,
    ThirdParty,
    RuntimeProvided,
    /// Synthesized shell for a BCL interface implemented by reachable user
    /// code but not otherwise loaded.
    BclProxy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IrField {
    /// Declaring type, by canonical name.
    pub owner: String,
    pub cil_name: String,
    pub mangled_name: String,
    /// CIL type-name of the field (`System.Int32`, `T[]`).
    pub field_type: String,
    pub is_static: bool,
    /// ECMA-335 field attribute bits.
    pub attributes: u32,
    pub literal: Option<ConstantValue>,
    pub custom_attributes: Vec<CustomAttribute>,
}

/// One dense v-table slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VTableEntry {
    pub slot: usize,
    /// CIL name of the virtual method this slot dispatches.
    pub method_name: String,
    /// Parameter type names, for signature matching along the chain.
    pub signature: Vec<String>,
    /// Type whose implementation currently fills the slot; `None` while
    /// the slot is abstract.
    pub impl_type: Option<String>,
    /// Index of the implementing method inside `impl_type`.
    pub impl_method: Option<usize>,
}

/// Reference to a method by declaring type and index, used by
/// interface-impl slot tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MethodSlotRef {
    pub type_name: String,
    pub method_index: usize,
    pub method_name: String,
}

/// Per-interface dispatch table for one class.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InterfaceImpl {
    pub interface_name: String,
    /// Indexed identically to the interface's non-ctor method order; `None`
    /// marks an unfilled slot (flagged for the gate).
    pub method_impls: Vec<Option<MethodSlotRef>>,
    pub defective: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IrType {
    pub cil_name: String,
    pub mangled_name: String,
    pub namespace: String,
    pub source: TypeSource,
    pub is_value_type: bool,
    pub is_enum: bool,
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_delegate: bool,
    pub is_record: bool,
    pub is_generic_instance: bool,
    pub is_runtime_provided: bool,
    /// Base type by canonical name; `None` for `System.Object`, interfaces
    /// and shells.
    pub base: Option<String>,
    pub interfaces: Vec<String>,
    /// Instance fields in layout order.
    pub fields: Vec<IrField>,
    pub static_fields: Vec<IrField>,
    /// Object-header-inclusive size for reference types, raw struct size
    /// for value types.
    pub instance_size: u32,
    pub methods: Vec<IrMethod>,
    pub vtable: Vec<VTableEntry>,
    pub interface_impls: Vec<InterfaceImpl>,
    /// Method index of `Finalize`, when the type declares one.
    pub finalizer: Option<usize>,
    pub custom_attributes: Vec<CustomAttribute>,
    /// Open definition name for generic instances (`Wrapper`1`).
    pub generic_definition: Option<String>,
    pub generic_args: Vec<String>,
    pub generic_variance: Vec<Variance>,
    pub enum_underlying: Option<String>,
    pub has_cctor: bool,
}

impl IrType {
    pub fn new(cil_name: impl Into<String>, mangled_name: impl Into<String>) -> Self {
        Self {
            cil_name: cil_name.into(),
            mangled_name: mangled_name.into(),
            namespace: String::new(),
            source: TypeSource::User,
            is_value_type: false,
            is_enum: false,
            is_interface: false,
            is_abstract: false,
            is_delegate: false,
            is_record: false,
            is_generic_instance: false,
            is_runtime_provided: false,
            base: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            static_fields: Vec::new(),
            instance_size: 0,
            methods: Vec::new(),
            vtable: Vec::new(),
            interface_impls: Vec::new(),
            finalizer: None,
            custom_attributes: Vec::new(),
            generic_definition: None,
            generic_args: Vec::new(),
            generic_variance: Vec::new(),
            enum_underlying: None,
            has_cctor: false,
        }
    }

    pub fn find_method(&self, name: &str) -> Option<&IrMethod> {
        self.methods.iter().find(|m| m.cil_name == name)
    }

    pub fn find_method_index(&self, name: &str, arity: usize) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.cil_name == name && m.params.len() == arity)
    }

    pub fn find_field(&self, name: &str) -> Option<&IrField> {
        self.fields
            .iter()
            .chain(self.static_fields.iter())
            .find(|f| f.cil_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_spans_instance_and_static_lists() {
        let mut ty = IrType::new("T", "T");
        ty.fields.push(IrField {
            owner: "T".into(),
            cil_name: "a".into(),
            mangled_name: "f_a".into(),
            field_type: "System.Int32".into(),
            is_static: false,
            attributes: 0,
            literal: None,
            custom_attributes: vec![],
        });
        ty.static_fields.push(IrField {
            owner: "T".into(),
            cil_name: "b".into(),
            mangled_name: "f_b".into(),
            field_type: "System.Int32".into(),
            is_static: true,
            attributes: 0,
            literal: None,
            custom_attributes: vec![],
        });
        assert!(ty.find_field("a").is_some());
        assert!(ty.find_field("b").is_some());
        assert!(ty.find_field("c").is_none());
    }
}
