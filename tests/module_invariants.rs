//! Universal module invariants checked over built pipelines.

mod common;

use cil2cpp::config::BuildConfig;
use cil2cpp::ir::InstKind;
use cil2cpp::metadata::cil::CilOp;
use cil2cpp::metadata::model::*;

use common::*;

fn sample_app() -> RawAssembly {
    let mut base = RawType::new("", "Base");
    base.flags |= TypeFlags::PUBLIC;
    base.methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    base.methods.push(virtual_method(
        "Describe",
        sig("System.String", vec![]),
        true,
        vec![CilOp::Ldstr("base".into()), CilOp::Ret],
    ));
    base.methods.push(virtual_method(
        "Tag",
        void_sig(vec![]),
        true,
        vec![CilOp::Ret],
    ));

    let mut derived = RawType::new("", "Derived");
    derived.flags |= TypeFlags::PUBLIC;
    derived.base = Some("Base".into());
    derived
        .methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    derived.methods.push(virtual_method(
        "Describe",
        sig("System.String", vec![]),
        false,
        vec![CilOp::Ldstr("derived".into()), CilOp::Ret],
    ));
    // NewSlot shadow of an inherited name.
    derived.methods.push(virtual_method(
        "Tag",
        void_sig(vec![]),
        true,
        vec![CilOp::Ret],
    ));

    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    program.fields.push(RawField::new("_last", "Base"));
    program.methods.push(method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Newobj(call_ref("Derived", ".ctor", vec![], "System.Void")),
            CilOp::CallVirt(call_ref("Base", "Describe", vec![], "System.String")),
            CilOp::Pop,
            CilOp::Ret,
        ],
    ));

    entry_assembly("App", "Program", vec![program, base, derived])
}

#[test]
fn closed_module_every_referenced_type_resolves() {
    let outcome = compile(sample_app(), BuildConfig::release());
    let module = &outcome.module;

    for ty in module.types() {
        if let Some(base) = &ty.base {
            assert!(
                module.find_type(base).is_some(),
                "base {base} of {} missing",
                ty.cil_name
            );
        }
        for interface in &ty.interfaces {
            assert!(module.find_type(interface).is_some());
        }
        for field in ty.fields.iter().chain(ty.static_fields.iter()) {
            let element = field
                .field_type
                .trim_end_matches("[]")
                .trim_end_matches('&');
            assert!(
                module.find_type(element).is_some(),
                "field type {} of {}.{} missing",
                field.field_type,
                ty.cil_name,
                field.cil_name
            );
        }
        for method in &ty.methods {
            for param in &method.params {
                let element = param.cil_type.trim_end_matches("[]").trim_end_matches('&');
                assert!(
                    module.find_type(element).is_some(),
                    "param type {} of {} missing",
                    param.cil_type,
                    method.fullname()
                );
            }
        }
    }
}

#[test]
fn vtable_monotonicity_and_slot_rules() {
    let outcome = compile(sample_app(), BuildConfig::release());
    let module = &outcome.module;

    let base = module.find_type("Base").unwrap();
    let derived = module.find_type("Derived").unwrap();

    // Monotone prefix.
    assert!(derived.vtable.len() >= base.vtable.len());
    for (i, slot) in base.vtable.iter().enumerate() {
        assert_eq!(derived.vtable[i].slot, i);
        assert_eq!(derived.vtable[i].method_name, slot.method_name);
    }

    // Override reuse: Derived::Describe sits in Base::Describe's slot.
    let base_describe = base.find_method("Describe").unwrap().vtable_slot;
    let derived_describe = derived.find_method("Describe").unwrap().vtable_slot;
    assert_eq!(base_describe, derived_describe);

    // NewSlot distinctness: Derived::Tag shadows Base::Tag.
    let base_tag = base.find_method("Tag").unwrap().vtable_slot;
    let derived_tag = derived.find_method("Tag").unwrap().vtable_slot;
    assert_ne!(base_tag, derived_tag);
}

#[test]
fn debug_attaches_locations_release_attaches_none() {
    let make = || {
        let mut program = RawType::new("", "Program");
        program.flags |= TypeFlags::PUBLIC;
        let mut main = method(
            "Main",
            static_sig("System.Void", vec![]),
            vec![CilOp::LdcI4(1), CilOp::Pop, CilOp::Ret],
        );
        main.sequence_points = vec![
            SequencePoint {
                source_file: "Program.cs".into(),
                start_line: 10,
                start_column: 5,
                end_line: 10,
                end_column: 20,
                il_offset: 0,
            },
            SequencePoint {
                source_file: "Program.cs".into(),
                start_line: HIDDEN_SEQUENCE_POINT_LINE,
                start_column: 0,
                end_line: HIDDEN_SEQUENCE_POINT_LINE,
                end_column: 0,
                il_offset: 2,
            },
        ];
        program.methods.push(main);
        entry_assembly("App", "Program", vec![program])
    };

    let debug = compile(make(), BuildConfig::debug());
    let main = debug.module.entry_method().unwrap();
    let with_debug: Vec<_> = main
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter(|i| i.debug.is_some())
        .collect();
    assert!(!with_debug.is_empty(), "debug build must carry locations");
    assert!(with_debug.iter().all(|i| i.debug.as_ref().unwrap().line == 10));

    let release = compile(make(), BuildConfig::release());
    let main = release.module.entry_method().unwrap();
    assert!(main
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .all(|i| i.debug.is_none()));
}

#[test]
fn pass4_leaves_no_generic_leftovers() {
    let mut wrapper = RawType::new("", "Holder`1");
    wrapper.flags |= TypeFlags::PUBLIC;
    wrapper.generic_params.push(GenericParam {
        name: "T".into(),
        variance: Variance::Invariant,
    });
    wrapper.fields.push(RawField::new("_value", "T"));
    wrapper.methods.push(method(
        "Get",
        sig("T", vec![]),
        vec![
            CilOp::Ldarg(0),
            CilOp::Ldfld(field_ref("Holder`1", "_value", "T")),
            CilOp::Ret,
        ],
    ));
    wrapper
        .methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));

    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    program.methods.push(method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Newobj(call_ref(
                "Holder`1<System.Int32>",
                ".ctor",
                vec![],
                "System.Void",
            )),
            // Call-site signatures arrive with the owner's instantiation
            // already substituted, the way the metadata reader renders them.
            CilOp::Call(call_ref(
                "Holder`1<System.Int32>",
                "Get",
                vec![],
                "System.Int32",
            )),
            CilOp::Pop,
            CilOp::Ret,
        ],
    ));

    let outcome = compile(
        entry_assembly("App", "Program", vec![program, wrapper]),
        BuildConfig::release(),
    );
    let instance = outcome.module.find_type("Holder`1<System.Int32>").unwrap();
    let get = instance.find_method("Get").unwrap();
    assert!(get.stub.is_none(), "{:?}", get.stub_detail);
    assert_eq!(get.return_cil_type, "System.Int32");
    // Operand types in the lowered body carry no unsubstituted parameters.
    let view = cil2cpp::codegen::ModuleView::new(&outcome.module);
    let rendered = view.render_method(get);
    assert!(!rendered.contains("!!"));
    assert!(!rendered.contains('`'));
}

#[test]
fn gate_completeness_no_silent_empty_bodies() {
    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    // A reachable method with no IL body and no extern marker.
    let mut broken = RawMethod::new("Broken", static_sig("System.Int32", vec![]));
    broken.flags |= MethodFlags::PUBLIC | MethodFlags::STATIC;
    program.methods.push(broken);
    program.methods.push(method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Call(static_ref("Program", "Broken", vec![], "System.Int32")),
            CilOp::Pop,
            CilOp::Ret,
        ],
    ));

    let outcome = compile(
        entry_assembly("App", "Program", vec![program]),
        BuildConfig::release(),
    );

    for method in outcome.module.all_methods() {
        if method.requires_body() {
            assert!(
                !method.blocks.is_empty() || method.stub.is_some(),
                "{} is neither lowered nor stubbed",
                method.fullname()
            );
        }
    }
    assert!(outcome
        .stub_report
        .entries
        .iter()
        .any(|e| e.method == "Program::Broken"));
    // A stub still renders as a body returning the default value.
    let broken = outcome
        .module
        .find_type("Program")
        .unwrap()
        .find_method("Broken")
        .unwrap();
    assert!(matches!(
        broken.blocks[0].insts.last().unwrap().kind,
        InstKind::Return { value: Some(_) }
    ));
}

#[test]
fn no_unsupported_instruction_warnings_in_reachable_bodies() {
    let outcome = compile(sample_app(), BuildConfig::release());
    let view = cil2cpp::codegen::ModuleView::new(&outcome.module);
    for method in outcome.module.all_methods() {
        let rendered = view.render_method(method);
        assert!(
            !rendered.contains("WARNING: Unsupported IL instruction"),
            "{} carries an unsupported-instruction marker",
            method.fullname()
        );
    }
}
