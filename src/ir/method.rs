//! Method records.

use serde::Serialize;

use crate::diagnostics::StubReason;
use crate::metadata::model::{CustomAttribute, ExplicitOverride, PInvokeInfo};

use super::inst::BasicBlock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Parameter {
    pub name: String,
    /// CIL type-name, kept for signature matching.
    pub cil_type: String,
    /// Rendered target-language type.
    pub target_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IrMethod {
    /// Declaring type, by canonical name.
    pub owner: String,
    pub cil_name: String,
    pub mangled_name: String,
    pub is_static: bool,
    pub is_ctor: bool,
    pub is_cctor: bool,
    pub is_finalizer: bool,
    pub is_operator: bool,
    pub is_property_accessor: bool,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub is_newslot: bool,
    /// Dense slot when dispatched through the v-table, -1 otherwise.
    pub vtable_slot: i32,
    pub is_entry_point: bool,
    pub is_generic_instance: bool,
    pub generic_args: Vec<String>,
    pub params: Vec<Parameter>,
    /// CIL return type-name.
    pub return_cil_type: String,
    /// Rendered target-language return type.
    pub return_type: String,
    /// Empty for abstract, extern, P/Invoke and ICall-mapped methods.
    pub blocks: Vec<BasicBlock>,
    pub explicit_overrides: Vec<ExplicitOverride>,
    /// ECMA-335 method attribute bits.
    pub attributes: u32,
    pub custom_attributes: Vec<CustomAttribute>,
    pub pinvoke: Option<PInvokeInfo>,
    pub operator_name: Option<String>,
    /// Body provided by the runtime; `blocks` stays empty.
    pub is_icall: bool,
    pub icall_symbol: Option<String>,
    /// Gate verdict: present when the body was replaced by a stub.
    pub stub: Option<StubReason>,
    pub stub_detail: Option<String>,
    /// Index of the source method inside the raw declaring type, for the
    /// passes that need to re-read metadata (None for synthesized members).
    pub source_index: Option<usize>,
}

impl IrMethod {
    pub fn new(owner: impl Into<String>, cil_name: impl Into<String>) -> Self {
        let cil_name = cil_name.into();
        Self {
            owner: owner.into(),
            is_ctor: cil_name == ".ctor",
            is_cctor: cil_name == ".cctor",
            is_finalizer: cil_name == "Finalize",
            cil_name,
            mangled_name: String::new(),
            is_static: false,
            is_operator: false,
            is_property_accessor: false,
            is_virtual: false,
            is_abstract: false,
            is_newslot: false,
            vtable_slot: -1,
            is_entry_point: false,
            is_generic_instance: false,
            generic_args: Vec::new(),
            params: Vec::new(),
            return_cil_type: "System.Void".into(),
            return_type: "void".into(),
            blocks: Vec::new(),
            explicit_overrides: Vec::new(),
            attributes: 0,
            custom_attributes: Vec::new(),
            pinvoke: None,
            operator_name: None,
            is_icall: false,
            icall_symbol: None,
            stub: None,
            stub_detail: None,
            source_index: None,
        }
    }

    /// Canonical `Owner::Name` form used in reports and diagnostics.
    pub fn fullname(&self) -> String {
        format!("{}::{}", self.owner, self.cil_name)
    }

    pub fn param_cil_types(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.cil_type.as_str()).collect()
    }

    /// True when the gate expects this method to carry a lowered body.
    pub fn requires_body(&self) -> bool {
        !self.is_abstract && self.pinvoke.is_none() && !self.is_icall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_flags_derive_from_special_names() {
        assert!(IrMethod::new("T", ".ctor").is_ctor);
        assert!(IrMethod::new("T", ".cctor").is_cctor);
        assert!(IrMethod::new("T", "Finalize").is_finalizer);
        assert!(!IrMethod::new("T", "Go").is_ctor);
    }

    #[test]
    fn body_requirement_tracks_externs() {
        let mut m = IrMethod::new("T", "Go");
        assert!(m.requires_body());
        m.is_icall = true;
        assert!(!m.requires_body());
    }
}
