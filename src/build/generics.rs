//! Pass 4: generic monomorphization.
//!
//! Every instantiation tuple recorded by reachability becomes a concrete
//! Type: fields and method signatures of the open definition are rewritten
//! under the argument substitution, variance is recorded, and the process
//! repeats until no signature mentions an unmaterialized instantiation.
//! Nullable, ValueTuple, Span and Task-like generics take the same path as
//! user generics; when their defining assembly is not loaded the instance
//! is synthesized as a runtime-provided shell.

use std::collections::{HashSet, VecDeque};

use log::debug;

use crate::assemblies::AssemblyKind;
use crate::ir::{IrField, IrType, TypeSource};
use crate::reach::names::{peel_composite, split_instantiation, substitute};
use crate::reach::TypeInstantiation;

use super::layout;
use super::methods::build_method_shell;
use super::session::BuildSession;
use super::BuildPass;

pub struct MonomorphizePass;

impl BuildPass for MonomorphizePass {
    fn id(&self) -> &'static str {
        "monomorphize"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let mut queue: VecDeque<TypeInstantiation> =
            session.reach.type_instantiations.iter().cloned().collect();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(inst) = queue.pop_front() {
            let name = inst.instance_name();
            if !seen.insert(name.clone()) || session.module.find_type(&name).is_some() {
                continue;
            }
            materialize_type(session, &inst, &mut queue);
        }

        let method_instances = session.reach.method_instantiations.clone();
        for mref in &method_instances {
            materialize_method(session, mref, &mut queue);
        }

        // Method signatures may have uncovered further type instantiations.
        while let Some(inst) = queue.pop_front() {
            let name = inst.instance_name();
            if !seen.insert(name.clone()) || session.module.find_type(&name).is_some() {
                continue;
            }
            materialize_type(session, &inst, &mut queue);
        }
    }
}

fn materialize_type(
    session: &mut BuildSession<'_>,
    inst: &TypeInstantiation,
    queue: &mut VecDeque<TypeInstantiation>,
) {
    let name = inst.instance_name();
    debug!("materializing {name}");

    let Some(raw) = session.raw_type(&inst.open).cloned() else {
        synthesize_runtime_instance(session, inst);
        return;
    };

    let params: Vec<String> = raw.generic_params.iter().map(|p| p.name.clone()).collect();
    let args = &inst.args;
    let kind = session
        .raw_type_kind(&inst.open)
        .unwrap_or(AssemblyKind::RuntimeProvided);

    let mangled = session.names.mangle_type(&name);
    let mut ty = IrType::new(name.clone(), mangled);
    ty.namespace = raw.namespace.clone();
    ty.source = match kind {
        AssemblyKind::User => TypeSource::User,
        AssemblyKind::ThirdParty => TypeSource::ThirdParty,
        AssemblyKind::RuntimeProvided => TypeSource::RuntimeProvided,
    };
    ty.is_runtime_provided = kind == AssemblyKind::RuntimeProvided;
    ty.is_value_type = raw.is_value_type;
    ty.is_enum = raw.is_enum;
    ty.is_interface = raw.is_interface();
    ty.is_abstract = raw.is_abstract();
    ty.is_delegate = raw.is_delegate;
    ty.is_record = raw.is_record;
    ty.base = raw.base.as_ref().map(|b| substitute(b, &params, args));
    ty.interfaces = raw
        .interfaces
        .iter()
        .map(|i| substitute(i, &params, args))
        .collect();
    ty.enum_underlying = raw.enum_underlying.clone();
    ty.custom_attributes = raw.custom_attributes.clone();
    ty.has_cctor = raw.has_cctor();
    ty.is_generic_instance = true;
    ty.generic_definition = Some(inst.open.clone());
    ty.generic_args = args.clone();
    ty.generic_variance = raw.generic_params.iter().map(|p| p.variance).collect();

    let (instance_fields, static_fields) =
        layout::build_fields(session, &raw, &name, &params, args);
    ty.fields = instance_fields;
    ty.static_fields = static_fields;
    ty.instance_size = layout::compute_instance_size(session, &name);

    session.module.add_type(ty);

    // Method shells under substitution, mirroring pass 3.
    let indices = session.reachable_method_indices(&inst.open);
    for source_index in indices {
        let Some(raw_method) = raw.methods.get(source_index) else {
            continue;
        };
        if !raw_method.generic_params.is_empty() {
            continue;
        }
        let shell = build_method_shell(session, raw_method, &name, source_index, &params, args);
        let ty = session
            .module
            .find_type_mut(&name)
            .expect("instance added above");
        let ir_index = ty.methods.len();
        if shell.is_finalizer {
            ty.finalizer = Some(ir_index);
        }
        ty.methods.push(shell);
        session.record_method_index(&name, source_index, ir_index);
    }

    scan_for_instantiations(session, &name, queue);
}

/// A generic instance whose open definition lives in an unloaded BCL
/// assembly: synthesize the shell the emitter and later passes need.
fn synthesize_runtime_instance(session: &mut BuildSession<'_>, inst: &TypeInstantiation) {
    let name = inst.instance_name();
    debug!("synthesizing runtime generic instance {name}");
    let mangled = session.names.mangle_type(&name);
    let mut ty = IrType::new(name.clone(), mangled);
    ty.source = TypeSource::RuntimeProvided;
    ty.is_runtime_provided = true;
    ty.is_generic_instance = true;
    ty.generic_definition = Some(inst.open.clone());
    ty.generic_args = inst.args.clone();

    let open = inst.open.as_str();
    ty.is_value_type = matches!(
        open,
        "System.Nullable`1" | "System.Span`1" | "System.ReadOnlySpan`1"
    ) || open.starts_with("System.ValueTuple`");

    if open == "System.Nullable`1" {
        // The lowerer's nullable-box interception reads these two fields.
        let arg = inst.args.first().cloned().unwrap_or_default();
        ty.fields.push(IrField {
            owner: name.clone(),
            cil_name: "hasValue".into(),
            mangled_name: "f_hasValue".into(),
            field_type: "System.Boolean".into(),
            is_static: false,
            attributes: 0,
            literal: None,
            custom_attributes: vec![],
        });
        ty.fields.push(IrField {
            owner: name.clone(),
            cil_name: "value".into(),
            mangled_name: "f_value".into(),
            field_type: arg,
            is_static: false,
            attributes: 0,
            literal: None,
            custom_attributes: vec![],
        });
    } else if let Some(arity) = open
        .strip_prefix("System.ValueTuple`")
        .and_then(|n| n.parse::<usize>().ok())
    {
        for position in 0..arity.min(inst.args.len()) {
            ty.fields.push(IrField {
                owner: name.clone(),
                cil_name: format!("Item{}", position + 1),
                mangled_name: format!("f_Item{}", position + 1),
                field_type: inst.args[position].clone(),
                is_static: false,
                attributes: 0,
                literal: None,
                custom_attributes: vec![],
            });
        }
    }

    session.module.add_type(ty);
}

/// An instantiated generic method becomes an extra method on its owner
/// with the argument tuple folded into signature and name.
fn materialize_method(
    session: &mut BuildSession<'_>,
    mref: &crate::metadata::model::MethodRef,
    queue: &mut VecDeque<TypeInstantiation>,
) {
    let owner_name = mref.owner.clone();
    let owner_open = split_instantiation(&owner_name)
        .map(|(open, _)| open)
        .unwrap_or_else(|| owner_name.clone());
    let Some(raw_owner) = session.raw_type(&owner_open).cloned() else {
        return;
    };
    let Some((source_index, raw_method)) = raw_owner
        .methods
        .iter()
        .enumerate()
        .find(|(_, m)| {
            m.name == mref.name
                && m.sig.params.len() == mref.arity()
                && m.generic_params.len() == mref.generic_args.len()
                && !m.generic_params.is_empty()
        })
        .map(|(i, m)| (i, m.clone()))
    else {
        return;
    };

    if session.module.find_type(&owner_name).is_none() {
        return;
    }

    // Combined substitution: owner's type arguments plus the method's own.
    let mut params: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some((_, owner_args)) = split_instantiation(&owner_name) {
        let owner_params: Vec<String> = raw_owner
            .generic_params
            .iter()
            .map(|p| p.name.clone())
            .collect();
        params.extend(owner_params);
        args.extend(owner_args);
    }
    params.extend(raw_method.generic_params.iter().cloned());
    args.extend(mref.generic_args.iter().cloned());

    let mut shell =
        build_method_shell(session, &raw_method, &owner_name, source_index, &params, &args);
    shell.is_generic_instance = true;
    shell.generic_args = mref.generic_args.clone();
    let arg_suffix: Vec<String> = mref
        .generic_args
        .iter()
        .map(|a| session.names.mangle_method(a))
        .collect();
    shell.mangled_name = format!("{}_{}", shell.mangled_name, arg_suffix.join("_"));

    let already_present = {
        let ty = session.module.find_type(&owner_name).unwrap();
        ty.methods
            .iter()
            .any(|m| m.cil_name == shell.cil_name && m.generic_args == shell.generic_args)
    };
    if already_present {
        return;
    }

    let ty = session.module.find_type_mut(&owner_name).unwrap();
    let ir_index = ty.methods.len();
    ty.methods.push(shell);
    session
        .generic_method_instances
        .push((owner_name.clone(), ir_index));

    scan_for_instantiations(session, &owner_name, queue);
}

/// Queue every instantiated name the freshly-built type mentions; pass 4
/// repeats until this discovers nothing new.
fn scan_for_instantiations(
    session: &BuildSession<'_>,
    type_name: &str,
    queue: &mut VecDeque<TypeInstantiation>,
) {
    let Some(ty) = session.module.find_type(type_name) else {
        return;
    };
    let mut mentioned: Vec<String> = Vec::new();
    if let Some(base) = &ty.base {
        mentioned.push(base.clone());
    }
    mentioned.extend(ty.interfaces.iter().cloned());
    for field in ty.fields.iter().chain(ty.static_fields.iter()) {
        mentioned.push(field.field_type.clone());
    }
    for method in &ty.methods {
        mentioned.push(method.return_cil_type.clone());
        for p in &method.params {
            mentioned.push(p.cil_type.clone());
        }
    }
    for name in mentioned {
        let element = peel_composite(&name).element;
        if let Some((open, args)) = split_instantiation(&element) {
            if session.module.find_type(&element).is_none() {
                queue.push_back(TypeInstantiation { open, args });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblies::{AssemblySet, LoadOptions};
    use crate::config::BuildConfig;
    use crate::metadata::cil::{CilInst, CilOp};
    use crate::metadata::model::*;
    use crate::metadata::reader::MemorySource;
    use crate::reach;
    use std::path::Path;

    fn build_through_pass4(app: RawAssembly) -> crate::ir::Module {
        let name = app.name.clone();
        let mut source = MemorySource::new();
        source.add(app);
        let set = AssemblySet::load(
            &source,
            Path::new(&format!("/x/{name}.dll")),
            &LoadOptions::default(),
        )
        .unwrap();
        let reach = reach::analyze(&set);
        let config = BuildConfig::release();
        let mut session = BuildSession::new(&set, &reach, &config);
        crate::build::shells::TypeShellPass.run(&mut session);
        crate::build::layout::FieldLayoutPass.run(&mut session);
        crate::build::methods::MethodShellPass.run(&mut session);
        MonomorphizePass.run(&mut session);
        session.finish().0
    }

    #[test]
    fn instantiation_substitutes_fields_and_hides_the_open_definition() {
        let mut app = RawAssembly::new("App");

        let mut wrapper = RawType::new("", "Wrapper`1");
        wrapper.generic_params.push(GenericParam {
            name: "T".into(),
            variance: Variance::Invariant,
        });
        wrapper.fields.push(RawField::new("_value", "T"));
        wrapper
            .methods
            .push(RawMethod::new(
                ".ctor",
                MethodSig {
                    has_this: true,
                    return_type: "System.Void".into(),
                    params: vec![],
                },
            ));

        let mut program = RawType::new("", "Program");
        let mut main = RawMethod::new(
            "Main",
            MethodSig {
                has_this: false,
                return_type: "System.Void".into(),
                params: vec![],
            },
        );
        main.flags |= MethodFlags::STATIC;
        main.body = Some(RawBody {
            ops: vec![
                CilInst::new(
                    0,
                    CilOp::Newobj(MethodRef {
                        owner: "Wrapper`1<System.Int32>".into(),
                        name: ".ctor".into(),
                        has_this: true,
                        return_type: "System.Void".into(),
                        params: vec![],
                        generic_args: vec![],
                    }),
                ),
                CilInst::new(5, CilOp::Ret),
            ],
            ..Default::default()
        });
        program.methods.push(main);
        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });
        app.types.push(program);
        app.types.push(wrapper);

        let module = build_through_pass4(app);

        assert!(module.find_type("Wrapper`1").is_none());
        let inst = module.find_type("Wrapper`1<System.Int32>").expect("instance");
        assert!(inst.is_generic_instance);
        assert_eq!(inst.generic_definition.as_deref(), Some("Wrapper`1"));
        assert_eq!(inst.generic_args, vec!["System.Int32"]);
        assert_eq!(inst.fields[0].field_type, "System.Int32");
        assert!(!inst.mangled_name.contains('<'));
        assert!(!inst.mangled_name.contains('`'));
    }

    #[test]
    fn unloaded_bcl_generics_synthesize_runtime_shells() {
        let mut app = RawAssembly::new("App");
        let mut program = RawType::new("", "Program");
        let mut main = RawMethod::new(
            "Main",
            MethodSig {
                has_this: false,
                return_type: "System.Void".into(),
                params: vec![],
            },
        );
        main.flags |= MethodFlags::STATIC;
        main.body = Some(RawBody {
            ops: vec![
                CilInst::new(0, CilOp::Box("System.Nullable`1<System.Int32>".into())),
                CilInst::new(5, CilOp::Ret),
            ],
            ..Default::default()
        });
        program.methods.push(main);
        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });
        app.types.push(program);

        let module = build_through_pass4(app);
        let nullable = module
            .find_type("System.Nullable`1<System.Int32>")
            .expect("synthesized shell");
        assert!(nullable.is_value_type);
        assert_eq!(nullable.fields.len(), 2);
        assert_eq!(nullable.fields[0].mangled_name, "f_hasValue");
        assert_eq!(nullable.fields[1].field_type, "System.Int32");
    }
}
