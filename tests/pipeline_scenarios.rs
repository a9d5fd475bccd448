//! End-to-end pipeline scenarios over in-memory assemblies.

mod common;

use cil2cpp::codegen::ModuleView;
use cil2cpp::config::BuildConfig;
use cil2cpp::ir::InstKind;
use cil2cpp::metadata::cil::CilOp;
use cil2cpp::metadata::model::*;

use common::*;

// ---- Scenario A: Hello Calculator --------------------------------------

fn hello_calculator() -> RawAssembly {
    let mut calculator = RawType::new("", "Calculator");
    calculator.flags |= TypeFlags::PUBLIC;
    calculator.fields.push(RawField::new("_result", "System.Int32"));
    calculator
        .methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    calculator.methods.push(method(
        "Add",
        sig(
            "System.Int32",
            vec![("a", "System.Int32"), ("b", "System.Int32")],
        ),
        vec![CilOp::Ldarg(1), CilOp::Ldarg(2), CilOp::Add, CilOp::Ret],
    ));
    calculator.methods.push(method(
        "SetResult",
        void_sig(vec![("value", "System.Int32")]),
        vec![
            CilOp::Ldarg(0),
            CilOp::Ldarg(1),
            CilOp::Stfld(field_ref("Calculator", "_result", "System.Int32")),
            CilOp::Ret,
        ],
    ));
    calculator.methods.push(method(
        "GetResult",
        sig("System.Int32", vec![]),
        vec![
            CilOp::Ldarg(0),
            CilOp::Ldfld(field_ref("Calculator", "_result", "System.Int32")),
            CilOp::Ret,
        ],
    ));

    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    let mut counter = RawField::new("Counter", "System.Int32");
    counter.flags |= FieldFlags::STATIC;
    program.fields.push(counter);
    program
        .methods
        .push(method(".cctor", static_sig("System.Void", vec![]), vec![CilOp::Ret]));
    program.methods.push(method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Newobj(call_ref("Calculator", ".ctor", vec![], "System.Void")),
            CilOp::LdcI4(2),
            CilOp::LdcI4(3),
            CilOp::CallVirt(call_ref(
                "Calculator",
                "Add",
                vec!["System.Int32", "System.Int32"],
                "System.Int32",
            )),
            CilOp::Pop,
            CilOp::Ldstr("Hello, CIL2CPP!".into()),
            CilOp::Call(static_ref(
                "System.Console",
                "WriteLine",
                vec!["System.String"],
                "System.Void",
            )),
            CilOp::Ldsfld(field_ref("Program", "Counter", "System.Int32")),
            CilOp::Pop,
            CilOp::Ret,
        ],
    ));

    entry_assembly("App", "Program", vec![program, calculator])
}

#[test]
fn scenario_a_entry_point_and_binary_op() {
    let outcome = compile(hello_calculator(), BuildConfig::release());
    let module = &outcome.module;

    let entry = module.entry_method().expect("entry point");
    assert_eq!(entry.fullname(), "Program::Main");
    assert!(entry.is_static);
    assert!(entry.is_entry_point);

    let calculator = module.find_type("Calculator").unwrap();
    let add = calculator.find_method("Add").unwrap();
    assert_ordered_subsequence(
        add,
        &[
            ("binary add", &|k| {
                matches!(k, InstKind::BinaryOp { op, .. } if op == "+")
            }),
            ("return with value", &|k| {
                matches!(k, InstKind::Return { value: Some(_) })
            }),
        ],
    );

    let result_field = calculator.find_field("_result").unwrap();
    assert_eq!(result_field.mangled_name, "f_result");
    assert_eq!(result_field.field_type, "System.Int32");
}

#[test]
fn scenario_a_string_literal_and_cctor_guard() {
    let outcome = compile(hello_calculator(), BuildConfig::release());
    let module = &outcome.module;

    assert_eq!(
        module.string_literal_id("Hello, CIL2CPP!"),
        Some("__str_0"),
        "first literal gets the first id"
    );

    let main = module.entry_method().unwrap();
    assert_ordered_subsequence(
        main,
        &[
            ("cctor guard", &|k| {
                matches!(k, InstKind::StaticCtorGuard { type_name } if type_name == "Program")
            }),
            ("static field load", &|k| {
                matches!(k, InstKind::LoadStaticField { field, .. } if field == "f_Counter")
            }),
        ],
    );

    // The WriteLine call-site went through the ICall registry.
    assert!(all_insts(main).iter().any(|k| matches!(
        k,
        InstKind::Call { callee, .. } if callee == "cil2cpp::icall::Console_WriteLine_String"
    )));
}

// ---- Scenario B: virtual dispatch ---------------------------------------

#[test]
fn scenario_b_virtual_dispatch_shares_the_slot() {
    let mut animal = RawType::new("", "Animal");
    animal.flags |= TypeFlags::PUBLIC;
    animal
        .methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    animal
        .methods
        .push(virtual_method("Speak", void_sig(vec![]), true, vec![CilOp::Ret]));

    let mut dog = RawType::new("", "Dog");
    dog.flags |= TypeFlags::PUBLIC;
    dog.base = Some("Animal".into());
    dog.methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    dog.methods
        .push(virtual_method("Speak", void_sig(vec![]), false, vec![CilOp::Ret]));

    let mut cat = RawType::new("", "Cat");
    cat.flags |= TypeFlags::PUBLIC;
    cat.base = Some("Animal".into());
    cat.methods
        .push(method(".ctor", void_sig(vec![]), vec![CilOp::Ret]));
    cat.methods
        .push(virtual_method("Speak", void_sig(vec![]), false, vec![CilOp::Ret]));

    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    program.methods.push(method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Newobj(call_ref("Dog", ".ctor", vec![], "System.Void")),
            CilOp::CallVirt(call_ref("Animal", "Speak", vec![], "System.Void")),
            CilOp::Newobj(call_ref("Cat", ".ctor", vec![], "System.Void")),
            CilOp::CallVirt(call_ref("Animal", "Speak", vec![], "System.Void")),
            CilOp::Ret,
        ],
    ));

    let outcome = compile(
        entry_assembly("App", "Program", vec![program, animal, dog, cat]),
        BuildConfig::release(),
    );
    let module = &outcome.module;

    let animal_slot = module
        .find_type("Animal")
        .unwrap()
        .find_method("Speak")
        .unwrap()
        .vtable_slot;
    assert!(animal_slot >= 0);
    for name in ["Dog", "Cat"] {
        let speak = module.find_type(name).unwrap().find_method("Speak").unwrap();
        assert_eq!(speak.vtable_slot, animal_slot, "{name} shares Animal's slot");
    }

    let main = module.entry_method().unwrap();
    assert!(all_insts(main).iter().any(|k| matches!(
        k,
        InstKind::Call { is_virtual: true, vtable_slot, .. } if *vtable_slot == animal_slot
    )));
}

// ---- Scenario C: exception with filter ----------------------------------

#[test]
fn scenario_c_filter_and_finally_sequence() {
    let mut thrower = RawType::new("", "Program");
    thrower.flags |= TypeFlags::PUBLIC;

    let mut risky = method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            // try body
            CilOp::Newobj(call_ref(
                "System.InvalidOperationException",
                ".ctor",
                vec![],
                "System.Void",
            )),
            CilOp::Throw,
            // filter expression
            CilOp::LdcI4(1),
            CilOp::EndFilter,
            // filter handler
            CilOp::Pop,
            CilOp::Leave(8),
            // finally
            CilOp::Nop,
            CilOp::EndFinally,
            // after the protected region
            CilOp::Ret,
        ],
    );
    let raw_body = risky.body.as_mut().unwrap();
    raw_body.eh.push(EhClause {
        kind: EhKind::Filter { filter_offset: 2 },
        try_offset: 0,
        try_length: 2,
        handler_offset: 4,
        handler_length: 2,
    });
    raw_body.eh.push(EhClause {
        kind: EhKind::Finally,
        try_offset: 0,
        try_length: 6,
        handler_offset: 6,
        handler_length: 2,
    });
    thrower.methods.push(risky);

    let outcome = compile(
        entry_assembly("App", "Program", vec![thrower]),
        BuildConfig::release(),
    );
    let main = outcome.module.entry_method().unwrap();
    assert!(main.stub.is_none(), "filter method must lower: {:?}", main.stub_detail);

    assert_ordered_subsequence(
        main,
        &[
            ("try begin", &|k| matches!(k, InstKind::TryBegin)),
            ("throw", &|k| matches!(k, InstKind::Throw { .. })),
            ("filter begin", &|k| matches!(k, InstKind::FilterBegin)),
            ("filter local", &|k| {
                matches!(k, InstKind::DeclareLocal { name, .. } if name == "__filter_result")
            }),
            ("filter verdict", &|k| {
                matches!(k, InstKind::Assign { target, .. } if target == "__filter_result")
            }),
            ("end filter", &|k| {
                matches!(k, InstKind::EndFilter { result } if result == "__filter_result")
            }),
            ("filter handler begin", &|k| {
                matches!(k, InstKind::FilterHandlerBegin)
            }),
            ("finally begin", &|k| matches!(k, InstKind::FinallyBegin)),
            ("try end", &|k| matches!(k, InstKind::TryEnd)),
        ],
    );

    // The textual rendering of EndFilter references the synthesized local.
    let view = ModuleView::new(&outcome.module);
    assert!(view.render_method(main).contains("CIL2CPP_ENDFILTER(__filter_result)"));
    // The leave inside the finally-protected try emits no goto.
    assert!(!all_insts(main).iter().any(|k| matches!(
        k,
        InstKind::Branch { target } if target == "BB_0"
    )));
}

// ---- Scenario D: generic monomorphization -------------------------------

#[test]
fn scenario_d_generic_instance_replaces_the_open_type() {
    let mut wrapper = RawType::new("", "Wrapper`1");
    wrapper.flags |= TypeFlags::PUBLIC;
    wrapper.generic_params.push(GenericParam {
        name: "T".into(),
        variance: Variance::Invariant,
    });
    wrapper.fields.push(RawField::new("_value", "T"));
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
                "Wrapper`1<System.Int32>",
                ".ctor",
                vec![],
                "System.Void",
            )),
            CilOp::Pop,
            CilOp::Ret,
        ],
    ));

    let outcome = compile(
        entry_assembly("App", "Program", vec![program, wrapper]),
        BuildConfig::release(),
    );
    let module = &outcome.module;

    assert!(module.find_type("Wrapper`1").is_none());
    let instance = module.find_type("Wrapper`1<System.Int32>").expect("instance");
    assert!(instance.is_generic_instance);
    assert_eq!(instance.generic_args, vec!["System.Int32"]);
    let value = instance.find_field("_value").unwrap();
    assert_eq!(value.field_type, "System.Int32");
    for forbidden in ['<', '>', '`'] {
        assert!(
            !instance.mangled_name.contains(forbidden),
            "mangled name {} contains {forbidden}",
            instance.mangled_name
        );
    }
}

// ---- Scenario E: record synthesis ---------------------------------------

#[test]
fn scenario_e_record_members_have_bodies() {
    let mut record = RawType::new("", "PersonRecord");
    record.flags |= TypeFlags::PUBLIC;
    record.is_record = true;
    record.fields.push(RawField::new("Name", "System.String"));
    record.fields.push(RawField::new("Age", "System.Int32"));
    let mut clone = RawMethod::new(
        "<Clone>$",
        sig("PersonRecord", vec![]),
    );
    clone.flags |= MethodFlags::PUBLIC;
    record.methods.push(clone);

    let mut assembly = RawAssembly::new("App");
    assembly.types.push(record);
    let outcome = compile(assembly, BuildConfig::release());
    let module = &outcome.module;

    let record = module.find_type("PersonRecord").unwrap();
    let view = ModuleView::new(module);
    for name in ["ToString", "GetHashCode", "Equals", "<Clone>$"] {
        let member = record
            .methods
            .iter()
            .find(|m| m.cil_name == name)
            .unwrap_or_else(|| panic!("missing {name}"));
        assert!(!member.blocks.is_empty(), "{name} has no body");
    }
    let to_string = record.find_method("ToString").unwrap();
    assert!(view.render_method(to_string).contains("cil2cpp::string_concat"));
    let clone = record.find_method("<Clone>$").unwrap();
    assert!(view.render_method(clone).contains("object_memberwise_clone"));
}

// ---- Scenario F: nullable box -------------------------------------------

#[test]
fn scenario_f_nullable_box_branches_on_has_value() {
    let mut program = RawType::new("", "Program");
    program.flags |= TypeFlags::PUBLIC;
    let mut main = method(
        "Main",
        static_sig("System.Void", vec![]),
        vec![
            CilOp::Ldloc(0),
            CilOp::Box("System.Nullable`1<System.Int32>".into()),
            CilOp::Pop,
            CilOp::Ret,
        ],
    );
    main.body.as_mut().unwrap().locals.push(LocalVar {
        name: None,
        local_type: "System.Nullable`1<System.Int32>".into(),
    });
    program.methods.push(main);

    let outcome = compile(
        entry_assembly("App", "Program", vec![program]),
        BuildConfig::release(),
    );
    let main = outcome.module.entry_method().unwrap();

    for kind in all_insts(main) {
        if let InstKind::Box {
            value_type_cpp_name,
            ..
        } = kind
        {
            assert!(
                !value_type_cpp_name.contains("Nullable"),
                "nullable must not box as a whole struct"
            );
        }
    }

    let view = ModuleView::new(&outcome.module);
    let rendered = view.render_method(main);
    assert!(rendered.contains("f_hasValue"));
    assert!(rendered.contains("f_value"));
    assert!(rendered.contains("nullptr"));
}
