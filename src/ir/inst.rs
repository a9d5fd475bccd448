//! Tagged instruction variants.
//!
//! One enum instead of a class hierarchy: consumers pattern-match on the
//! tag. Every field is a rendered operand string (a temp name, a mangled
//! member name, or a literal), so the deterministic mapping to a line of
//! target text is a pure function of the variant (see `codegen::text`).

use serde::Serialize;

/// Source location attached to an instruction in debug builds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DebugInfo {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub il_offset: u32,
}

/// One IR instruction with its optional debug location.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Inst {
    pub kind: InstKind,
    pub debug: Option<DebugInfo>,
}

impl Inst {
    pub fn new(kind: InstKind) -> Self {
        Self { kind, debug: None }
    }

    pub fn with_debug(kind: InstKind, debug: Option<DebugInfo>) -> Self {
        Self { kind, debug }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum InstKind {
    Comment(String),
    DeclareLocal {
        name: String,
        var_type: String,
        init: Option<String>,
    },
    Assign {
        target: String,
        value: String,
    },
    LoadArg {
        arg: String,
        result: String,
    },
    LoadLocal {
        local: String,
        result: String,
    },
    LoadField {
        object: String,
        field: String,
        result: String,
    },
    LoadStaticField {
        owner: String,
        field: String,
        result: String,
    },
    LoadArrayElement {
        array: String,
        index: String,
        element_type: String,
        result: String,
    },
    LoadIndirect {
        address: String,
        value_type: String,
        result: String,
    },
    StoreArg {
        arg: String,
        value: String,
    },
    StoreLocal {
        local: String,
        value: String,
    },
    StoreField {
        object: String,
        field: String,
        value: String,
    },
    StoreStaticField {
        owner: String,
        field: String,
        value: String,
    },
    StoreArrayElement {
        array: String,
        index: String,
        element_type: String,
        value: String,
    },
    StoreIndirect {
        address: String,
        value_type: String,
        value: String,
    },
    BinaryOp {
        op: String,
        left: String,
        right: String,
        result: String,
        result_type: String,
    },
    UnaryOp {
        op: String,
        operand: String,
        result: String,
        result_type: String,
    },
    Branch {
        target: String,
    },
    ConditionalBranch {
        condition: String,
        true_target: String,
        false_target: Option<String>,
    },
    Switch {
        value: String,
        targets: Vec<String>,
        default: Option<String>,
    },
    Label {
        name: String,
    },
    Call {
        callee: String,
        is_virtual: bool,
        vtable_slot: i32,
        is_interface_call: bool,
        receiver: Option<String>,
        args: Vec<String>,
        result: Option<String>,
        result_type: Option<String>,
    },
    NewObj {
        type_name: String,
        ctor: String,
        args: Vec<String>,
        result: String,
    },
    NewArray {
        element_type: String,
        length: String,
        result: String,
    },
    DelegateCreate {
        delegate_type: String,
        object: String,
        function: String,
        result: String,
    },
    DelegateInvoke {
        delegate: String,
        args: Vec<String>,
        result: Option<String>,
        result_type: Option<String>,
    },
    LoadFunctionPointer {
        method: String,
        is_virtual: bool,
        result: String,
    },
    Cast {
        value: String,
        target_type: String,
        /// Safe casts yield null on failure (`isinst`); unsafe casts trap.
        safe: bool,
        result: String,
    },
    Convert {
        value: String,
        target_scalar: String,
        result: String,
    },
    Box {
        value: String,
        value_type_cpp_name: String,
        result: String,
    },
    Unbox {
        value: String,
        value_type_cpp_name: String,
        result: String,
    },
    TryBegin,
    CatchBegin {
        exception_type: String,
        variable: Option<String>,
    },
    FinallyBegin,
    FilterBegin,
    FilterHandlerBegin,
    EndFilter {
        result: String,
    },
    TryEnd,
    Throw {
        exception: String,
    },
    Rethrow,
    Return {
        value: Option<String>,
    },
    StaticCtorGuard {
        type_name: String,
    },
    RawTargetCode {
        code: String,
        result: Option<String>,
        result_type: Option<String>,
    },
}

impl InstKind {
    /// The temp introduced by this instruction, when it produces one.
    pub fn result(&self) -> Option<&str> {
        use InstKind::*;
        match self {
            LoadArg { result, .. }
            | LoadLocal { result, .. }
            | LoadField { result, .. }
            | LoadStaticField { result, .. }
            | LoadArrayElement { result, .. }
            | LoadIndirect { result, .. }
            | BinaryOp { result, .. }
            | UnaryOp { result, .. }
            | NewObj { result, .. }
            | NewArray { result, .. }
            | DelegateCreate { result, .. }
            | LoadFunctionPointer { result, .. }
            | Cast { result, .. }
            | Convert { result, .. }
            | Box { result, .. }
            | Unbox { result, .. } => Some(result),
            Call { result, .. } | DelegateInvoke { result, .. } | RawTargetCode { result, .. } => {
                result.as_deref()
            }
            _ => None,
        }
    }
}

/// A straight-line run of instructions; edges are implied by the branch
/// targets inside.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BasicBlock {
    pub id: usize,
    pub insts: Vec<Inst>,
}

impl BasicBlock {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            insts: Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        format!("BB_{}", self.id)
    }

    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_block_ids() {
        assert_eq!(BasicBlock::new(3).label(), "BB_3");
    }

    #[test]
    fn results_are_exposed_per_variant() {
        let kind = InstKind::BinaryOp {
            op: "+".into(),
            left: "__t0".into(),
            right: "__t1".into(),
            result: "__t2".into(),
            result_type: "int32_t".into(),
        };
        assert_eq!(kind.result(), Some("__t2"));
        assert_eq!(InstKind::TryBegin.result(), None);
        let call = InstKind::Call {
            callee: "f".into(),
            is_virtual: false,
            vtable_slot: -1,
            is_interface_call: false,
            receiver: None,
            args: vec![],
            result: None,
            result_type: None,
        };
        assert_eq!(call.result(), None);
    }
}
