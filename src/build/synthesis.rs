//! Pass 8: synthesis of compiler-implicit members.
//!
//! Record classes get deterministic `ToString` / `Equals` / `GetHashCode`
//! / `<Clone>$` bodies in place of the compiler-generated ones (which lean
//! on `EqualityComparer` machinery that cannot be lowered); record structs
//! and ValueTuple instances get by-value equality. Bodies come from the
//! `synth` module; this pass wires them onto the right method records and
//! keeps v-table slots intact.

use log::debug;

use crate::ir::{BasicBlock, IrMethod, Parameter};
use crate::synth;

use super::session::BuildSession;
use super::BuildPass;

pub struct SynthesisPass;

impl BuildPass for SynthesisPass {
    fn id(&self) -> &'static str {
        "synthesis"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let type_names: Vec<String> = session.module.type_names().map(String::from).collect();
        for type_name in &type_names {
            let (is_record, is_value, is_value_tuple) = {
                let ty = session.module.find_type(type_name).unwrap();
                (
                    ty.is_record,
                    ty.is_value_type,
                    ty.generic_definition
                        .as_deref()
                        .is_some_and(|d| d.starts_with("System.ValueTuple`")),
                )
            };
            if is_record {
                synthesize_record(session, type_name, is_value);
            } else if is_value_tuple {
                synthesize_value_tuple(session, type_name);
            }
        }
    }
}

fn synthesize_record(session: &mut BuildSession<'_>, type_name: &str, is_struct: bool) {
    debug!("synthesizing record members for {type_name}");
    let (fields, mangled, short_name) = {
        let ty = session.module.find_type(type_name).unwrap();
        let short = ty
            .cil_name
            .rsplit(['.', '+'])
            .next()
            .unwrap_or(&ty.cil_name)
            .to_string();
        (ty.fields.clone(), ty.mangled_name.clone(), short)
    };
    let self_target = if is_struct {
        mangled.clone()
    } else {
        format!("{mangled}*")
    };

    let to_string = synth::record_to_string(&mut session.module, &short_name, &fields);
    install(session, type_name, "ToString", vec![], "System.String", false, to_string);

    let hash = synth::record_get_hash_code(&mangled, &fields);
    install(session, type_name, "GetHashCode", vec![], "System.Int32", false, hash);

    let equals = synth::record_equals(&fields, "other", !is_struct);
    install(
        session,
        type_name,
        "Equals",
        vec![("other".to_string(), type_name.to_string(), self_target.clone())],
        "System.Boolean",
        false,
        equals,
    );

    if is_struct {
        let op_eq = synth::record_struct_op_equality(&fields);
        install(
            session,
            type_name,
            "op_Equality",
            vec![
                ("left".to_string(), type_name.to_string(), self_target.clone()),
                ("right".to_string(), type_name.to_string(), self_target.clone()),
            ],
            "System.Boolean",
            true,
            op_eq,
        );
    } else {
        let clone = synth::record_clone(&self_target);
        install(session, type_name, "<Clone>$", vec![], type_name, false, clone);
    }
}

fn synthesize_value_tuple(session: &mut BuildSession<'_>, type_name: &str) {
    let fields = {
        let ty = session.module.find_type(type_name).unwrap();
        ty.fields.clone()
    };
    if fields.is_empty() {
        return;
    }
    let mangled = session.module.find_type(type_name).unwrap().mangled_name.clone();
    let equals = synth::record_equals(&fields, "other", false);
    install(
        session,
        type_name,
        "Equals",
        vec![("other".to_string(), type_name.to_string(), mangled.clone())],
        "System.Boolean",
        false,
        equals,
    );
    let op_eq = synth::record_struct_op_equality(&fields);
    install(
        session,
        type_name,
        "op_Equality",
        vec![
            ("left".to_string(), type_name.to_string(), mangled.clone()),
            ("right".to_string(), type_name.to_string(), mangled),
        ],
        "System.Boolean",
        true,
        op_eq,
    );
}

/// Replace the body of an existing member, or append a fresh shell when
/// the metadata never carried one. Existing v-table slots stay put; a new
/// override of a seeded slot (`ToString`, `Equals`, `GetHashCode`) claims
/// the slot it matches.
fn install(
    session: &mut BuildSession<'_>,
    type_name: &str,
    method_name: &str,
    params: Vec<(String, String, String)>,
    return_cil: &str,
    is_static: bool,
    blocks: Vec<BasicBlock>,
) {
    let return_target = session.target_type(return_cil);
    let mangled_method = session.names.mangle_method(method_name);

    let ty = session.module.find_type_mut(type_name).unwrap();
    let arity = params.len();
    if let Some(index) = ty.find_method_index(method_name, arity) {
        let method = &mut ty.methods[index];
        method.blocks = blocks;
        method.stub = None;
        method.stub_detail = None;
        return;
    }

    let mut method = IrMethod::new(type_name, method_name);
    method.mangled_name = mangled_method;
    method.is_static = is_static;
    method.return_cil_type = return_cil.to_string();
    method.return_type = return_target;
    method.params = params
        .into_iter()
        .map(|(name, cil_type, target_type)| Parameter {
            name,
            cil_type,
            target_type,
        })
        .collect();
    method.blocks = blocks;

    // Claim the canonical object slot when this member overrides one.
    let signature: Vec<String> = method.params.iter().map(|p| p.cil_type.clone()).collect();
    let index = ty.methods.len();
    if let Some(entry) = ty
        .vtable
        .iter_mut()
        .find(|e| e.method_name == method.cil_name && e.signature == signature)
    {
        method.is_virtual = true;
        method.vtable_slot = entry.slot as i32;
        entry.impl_type = Some(type_name.to_string());
        entry.impl_method = Some(index);
    }
    ty.methods.push(method);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblies::{AssemblySet, LoadOptions};
    use crate::codegen::ModuleView;
    use crate::config::BuildConfig;
    use crate::metadata::model::*;
    use crate::metadata::reader::MemorySource;
    use crate::reach;
    use std::path::Path;

    #[test]
    fn record_members_are_synthesized_with_bodies() {
        let mut app = RawAssembly::new("App");
        let mut record = RawType::new("", "PersonRecord");
        record.flags |= TypeFlags::PUBLIC;
        record.is_record = true;
        record.fields.push(RawField::new("Name", "System.String"));
        record.fields.push(RawField::new("Age", "System.Int32"));
        let mut clone = RawMethod::new(
            "<Clone>$",
            MethodSig {
                has_this: true,
                return_type: "PersonRecord".into(),
                params: vec![],
            },
        );
        clone.flags |= MethodFlags::PUBLIC;
        record.methods.push(clone);
        app.types.push(record);

        let mut source = MemorySource::new();
        source.add(app);
        let set =
            AssemblySet::load(&source, Path::new("/x/App.dll"), &LoadOptions::default()).unwrap();
        let reach = reach::analyze(&set);
        let config = BuildConfig::release();
        let (module, _diags) = crate::build::IrBuilder::build(&set, &reach, &config);

        let record = module.find_type("PersonRecord").unwrap();
        for name in ["ToString", "GetHashCode", "Equals", "<Clone>$"] {
            let m = record
                .methods
                .iter()
                .find(|m| m.cil_name == name)
                .unwrap_or_else(|| panic!("missing synthesized member {name}"));
            assert!(!m.blocks.is_empty(), "{name} should have a body");
        }
        let view = ModuleView::new(&module);
        let to_string = record.find_method("ToString").unwrap();
        assert!(view.render_method(to_string).contains("cil2cpp::string_concat"));
    }
}
