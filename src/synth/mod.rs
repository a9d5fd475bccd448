//! Synthesized method bodies.
//!
//! Records compile against `EqualityComparer` machinery that cannot be
//! lowered ahead of time, so their equality, hashing, printing and clone
//! members get deterministic replacements built directly in IR. All
//! synthesized hashes share one mixing primitive (`cil2cpp::hash_combine`)
//! and printing goes through the runtime's string-concat symbol.

use crate::ir::{BasicBlock, Inst, InstKind, IrField, Module};

/// Fields that participate in record equality/printing: the instance
/// fields, in declaration order.
fn record_fields(fields: &[IrField]) -> Vec<(String, String, String)> {
    fields
        .iter()
        .map(|f| {
            (
                f.cil_name.trim_start_matches('_').trim_start_matches('<').trim_end_matches(">k__BackingField").to_string(),
                f.mangled_name.clone(),
                f.field_type.clone(),
            )
        })
        .collect()
}

fn block_with(insts: Vec<InstKind>) -> Vec<BasicBlock> {
    let mut block = BasicBlock::new(0);
    block.push(Inst::new(InstKind::Label {
        name: "BB_0".into(),
    }));
    for kind in insts {
        block.push(Inst::new(kind));
    }
    vec![block]
}

/// `ToString`: `{TypeName} { F1 = v1, F2 = v2 }` folded left through
/// string-concat calls.
pub fn record_to_string(
    module: &mut Module,
    type_display_name: &str,
    fields: &[IrField],
) -> Vec<BasicBlock> {
    let named = record_fields(fields);
    let mut insts = Vec::new();
    let mut temp = 0usize;
    let mut next = |temp: &mut usize| {
        let name = format!("__t{temp}");
        *temp += 1;
        name
    };

    let head = module.register_string_literal(&format!("{type_display_name} {{ "));
    let mut acc = next(&mut temp);
    insts.push(InstKind::Assign {
        target: acc.clone(),
        value: head,
    });

    for (index, (display, mangled, _ty)) in named.iter().enumerate() {
        let label = if index == 0 {
            format!("{display} = ")
        } else {
            format!(", {display} = ")
        };
        let label_id = module.register_string_literal(&label);
        let with_label = next(&mut temp);
        insts.push(InstKind::Call {
            callee: "cil2cpp::string_concat".into(),
            is_virtual: false,
            vtable_slot: -1,
            is_interface_call: false,
            receiver: None,
            args: vec![acc.clone(), label_id],
            result: Some(with_label.clone()),
            result_type: Some("cil2cpp::String*".into()),
        });
        let value = next(&mut temp);
        insts.push(InstKind::LoadField {
            object: "__this".into(),
            field: mangled.clone(),
            result: value.clone(),
        });
        let appended = next(&mut temp);
        insts.push(InstKind::Call {
            callee: "cil2cpp::string_concat".into(),
            is_virtual: false,
            vtable_slot: -1,
            is_interface_call: false,
            receiver: None,
            args: vec![with_label, value],
            result: Some(appended.clone()),
            result_type: Some("cil2cpp::String*".into()),
        });
        acc = appended;
    }

    let tail_id = module.register_string_literal(" }");
    let done = next(&mut temp);
    insts.push(InstKind::Call {
        callee: "cil2cpp::string_concat".into(),
        is_virtual: false,
        vtable_slot: -1,
        is_interface_call: false,
        receiver: None,
        args: vec![acc, tail_id],
        result: Some(done.clone()),
        result_type: Some("cil2cpp::String*".into()),
    });
    insts.push(InstKind::Return { value: Some(done) });
    block_with(insts)
}

/// Field-wise equality. Reference records check the other operand for
/// null first; record structs compare by value with no null check.
pub fn record_equals(
    fields: &[IrField],
    other_param: &str,
    is_reference: bool,
) -> Vec<BasicBlock> {
    let named = record_fields(fields);
    let mut insts = Vec::new();
    let mut temp = 0usize;
    let mut next = |temp: &mut usize| {
        let name = format!("__t{temp}");
        *temp += 1;
        name
    };
    let access = if is_reference { "->" } else { "." };

    let mut acc = next(&mut temp);
    if is_reference {
        insts.push(InstKind::BinaryOp {
            op: "!=".into(),
            left: other_param.to_string(),
            right: "nullptr".into(),
            result: acc.clone(),
            result_type: "int32_t".into(),
        });
    } else {
        insts.push(InstKind::Assign {
            target: acc.clone(),
            value: "1".into(),
        });
    }

    for (_, mangled, ty) in &named {
        let mine = next(&mut temp);
        insts.push(InstKind::LoadField {
            object: "__this".into(),
            field: mangled.clone(),
            result: mine.clone(),
        });
        let theirs = next(&mut temp);
        insts.push(InstKind::RawTargetCode {
            code: format!("{theirs} = {other_param}{access}{mangled};"),
            result: Some(theirs.clone()),
            result_type: None,
        });
        let same = next(&mut temp);
        if ty == "System.String" {
            insts.push(InstKind::Call {
                callee: "cil2cpp::string_equals".into(),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver: None,
                args: vec![mine, theirs],
                result: Some(same.clone()),
                result_type: Some("int32_t".into()),
            });
        } else {
            insts.push(InstKind::BinaryOp {
                op: "==".into(),
                left: mine,
                right: theirs,
                result: same.clone(),
                result_type: "int32_t".into(),
            });
        }
        let folded = next(&mut temp);
        insts.push(InstKind::BinaryOp {
            op: "&&".into(),
            left: acc,
            right: same,
            result: folded.clone(),
            result_type: "int32_t".into(),
        });
        acc = folded;
    }

    insts.push(InstKind::Return { value: Some(acc) });
    block_with(insts)
}

/// Hash-combine over the fields, seeded by the type-id hash; every
/// synthesized hash uses the same mixing primitive.
pub fn record_get_hash_code(type_mangled: &str, fields: &[IrField]) -> Vec<BasicBlock> {
    let named = record_fields(fields);
    let mut insts = Vec::new();
    let mut temp = 0usize;
    let mut next = |temp: &mut usize| {
        let name = format!("__t{temp}");
        *temp += 1;
        name
    };

    let mut acc = next(&mut temp);
    insts.push(InstKind::Call {
        callee: "cil2cpp::type_hash".into(),
        is_virtual: false,
        vtable_slot: -1,
        is_interface_call: false,
        receiver: None,
        args: vec![format!("&{type_mangled}_typeinfo")],
        result: Some(acc.clone()),
        result_type: Some("int32_t".into()),
    });

    for (_, mangled, _) in &named {
        let value = next(&mut temp);
        insts.push(InstKind::LoadField {
            object: "__this".into(),
            field: mangled.clone(),
            result: value.clone(),
        });
        let mixed = next(&mut temp);
        insts.push(InstKind::Call {
            callee: "cil2cpp::hash_combine".into(),
            is_virtual: false,
            vtable_slot: -1,
            is_interface_call: false,
            receiver: None,
            args: vec![acc, value],
            result: Some(mixed.clone()),
            result_type: Some("int32_t".into()),
        });
        acc = mixed;
    }

    insts.push(InstKind::Return { value: Some(acc) });
    block_with(insts)
}

/// `<Clone>$`: field-wise copy through the runtime.
pub fn record_clone(type_target: &str) -> Vec<BasicBlock> {
    block_with(vec![
        InstKind::Call {
            callee: "object_memberwise_clone".into(),
            is_virtual: false,
            vtable_slot: -1,
            is_interface_call: false,
            receiver: None,
            args: vec!["__this".into()],
            result: Some("__t0".into()),
            result_type: Some("cil2cpp::Object*".into()),
        },
        InstKind::Cast {
            value: "__t0".into(),
            target_type: type_target.to_string(),
            safe: false,
            result: "__t1".into(),
        },
        InstKind::Return {
            value: Some("__t1".into()),
        },
    ])
}

/// Record-struct `op_Equality(a, b)`: field-wise comparison of the two
/// by-value operands.
pub fn record_struct_op_equality(fields: &[IrField]) -> Vec<BasicBlock> {
    let named = record_fields(fields);
    let mut insts = Vec::new();
    let mut temp = 0usize;
    let mut next = |temp: &mut usize| {
        let name = format!("__t{temp}");
        *temp += 1;
        name
    };

    let mut acc = next(&mut temp);
    insts.push(InstKind::Assign {
        target: acc.clone(),
        value: "1".into(),
    });
    for (_, mangled, ty) in &named {
        let same = next(&mut temp);
        if ty == "System.String" {
            insts.push(InstKind::Call {
                callee: "cil2cpp::string_equals".into(),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver: None,
                args: vec![format!("left.{mangled}"), format!("right.{mangled}")],
                result: Some(same.clone()),
                result_type: Some("int32_t".into()),
            });
        } else {
            insts.push(InstKind::BinaryOp {
                op: "==".into(),
                left: format!("left.{mangled}"),
                right: format!("right.{mangled}"),
                result: same.clone(),
                result_type: "int32_t".into(),
            });
        }
        let folded = next(&mut temp);
        insts.push(InstKind::BinaryOp {
            op: "&&".into(),
            left: acc,
            right: same,
            result: folded.clone(),
            result_type: "int32_t".into(),
        });
        acc = folded;
    }
    insts.push(InstKind::Return { value: Some(acc) });
    block_with(insts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::text::instruction_text;

    fn field(name: &str, ty: &str) -> IrField {
        IrField {
            owner: "R".into(),
            cil_name: name.into(),
            mangled_name: format!("f_{}", name.trim_start_matches('_')),
            field_type: ty.into(),
            is_static: false,
            attributes: 0,
            literal: None,
            custom_attributes: vec![],
        }
    }

    #[test]
    fn to_string_concatenates_through_the_runtime() {
        let mut module = Module::new();
        let fields = vec![field("Name", "System.String"), field("Age", "System.Int32")];
        let blocks = record_to_string(&mut module, "PersonRecord", &fields);
        let rendered: Vec<String> = blocks[0]
            .insts
            .iter()
            .map(|i| instruction_text(&i.kind))
            .collect();
        let text = rendered.join("\n");
        assert!(text.contains("cil2cpp::string_concat"));
        // Literals were interned for the frame and separators.
        assert!(module
            .string_literals()
            .iter()
            .any(|l| l.value.contains("PersonRecord")));
    }

    #[test]
    fn reference_equals_null_checks_then_compares() {
        let fields = vec![field("Age", "System.Int32")];
        let blocks = record_equals(&fields, "other", true);
        let first = &blocks[0].insts[1].kind;
        match first {
            InstKind::BinaryOp { op, right, .. } => {
                assert_eq!(op, "!=");
                assert_eq!(right, "nullptr");
            }
            other => panic!("expected null check, got {other:?}"),
        }
        assert!(matches!(
            blocks[0].insts.last().unwrap().kind,
            InstKind::Return { value: Some(_) }
        ));
    }

    #[test]
    fn struct_equality_skips_the_null_check() {
        let fields = vec![field("X", "System.Int32")];
        let blocks = record_struct_op_equality(&fields);
        let text: String = blocks[0]
            .insts
            .iter()
            .map(|i| instruction_text(&i.kind))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(!text.contains("nullptr"));
        assert!(text.contains("left.f_X == right.f_X"));
    }

    #[test]
    fn clone_routes_through_memberwise_clone() {
        let blocks = record_clone("PersonRecord*");
        let text: String = blocks[0]
            .insts
            .iter()
            .map(|i| instruction_text(&i.kind))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(text.contains("object_memberwise_clone"));
    }

    #[test]
    fn hashes_share_the_mixing_primitive() {
        let fields = vec![field("A", "System.Int32"), field("B", "System.Int32")];
        let blocks = record_get_hash_code("R", &fields);
        let text: String = blocks[0]
            .insts
            .iter()
            .map(|i| instruction_text(&i.kind))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(text.matches("cil2cpp::hash_combine").count(), 2);
        assert!(text.contains("cil2cpp::type_hash"));
    }
}
