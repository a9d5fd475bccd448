//! Pass 3: method shells.
//!
//! Creates a Method record for every reachable method: names, role flags,
//! dispatch flags, parameters, return type, P/Invoke data. ICall-mapped
//! methods are marked externally provided and keep no blocks. No bodies
//! yet; call-sites lowered in pass 7 must be able to resolve these shells.

use log::debug;

use crate::icalls;
use crate::ir::{IrMethod, Parameter};
use crate::metadata::model::{MethodFlags, RawMethod};
use crate::reach::names::substitute;

use super::session::BuildSession;
use super::BuildPass;

pub struct MethodShellPass;

impl BuildPass for MethodShellPass {
    fn id(&self) -> &'static str {
        "method-shells"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let entry_point = session
            .set
            .entry_assembly()
            .raw
            .entry_point
            .clone();

        let type_names: Vec<String> = session.module.type_names().map(String::from).collect();
        for fullname in &type_names {
            let Some(raw) = session.raw_type(fullname).cloned() else {
                continue;
            };
            let indices = session.reachable_method_indices(fullname);
            for source_index in indices {
                let Some(raw_method) = raw.methods.get(source_index) else {
                    continue;
                };
                if !raw_method.generic_params.is_empty() {
                    // Open generic method: instantiations only (pass 4).
                    debug!("skipping open generic method {}::{}", fullname, raw_method.name);
                    continue;
                }
                let mut shell =
                    build_method_shell(session, raw_method, fullname, source_index, &[], &[]);

                if let Some(entry) = &entry_point {
                    if entry.type_fullname == *fullname && entry.method_name == raw_method.name {
                        shell.is_entry_point = true;
                    }
                }

                let ty = session
                    .module
                    .find_type_mut(fullname)
                    .expect("pass 1 created the shell");
                let ir_index = ty.methods.len();
                if shell.is_finalizer {
                    ty.finalizer = Some(ir_index);
                }
                let is_entry = shell.is_entry_point;
                ty.methods.push(shell);
                session.record_method_index(fullname, source_index, ir_index);
                if is_entry {
                    session.module.entry_point = Some((fullname.clone(), ir_index));
                }
            }
        }
    }
}

/// Build one method shell; pass 4 reuses this with a substitution in
/// effect for generic instantiations.
pub fn build_method_shell(
    session: &mut BuildSession<'_>,
    raw_method: &RawMethod,
    owner: &str,
    source_index: usize,
    generic_params: &[String],
    generic_args: &[String],
) -> IrMethod {
    let subst = |name: &str| -> String {
        if generic_params.is_empty() {
            name.to_string()
        } else {
            substitute(name, generic_params, generic_args)
        }
    };

    let mut method = IrMethod::new(owner, raw_method.name.clone());
    method.source_index = Some(source_index);
    method.mangled_name = session.names.mangle_method(&raw_method.name);
    method.attributes = raw_method.flags.bits();
    method.is_static = raw_method.is_static();
    method.is_virtual = raw_method.is_virtual();
    method.is_abstract = raw_method.is_abstract();
    method.is_newslot = raw_method.is_newslot();
    method.custom_attributes = raw_method.custom_attributes.clone();
    method.explicit_overrides = raw_method.explicit_overrides.clone();
    method.pinvoke = raw_method.pinvoke.clone();

    let special = raw_method.flags.contains(MethodFlags::SPECIAL_NAME);
    if special && raw_method.name.starts_with("op_") {
        method.is_operator = true;
        method.operator_name = Some(raw_method.name.clone());
    }
    if special
        && (raw_method.name.starts_with("get_") || raw_method.name.starts_with("set_"))
    {
        method.is_property_accessor = true;
    }

    method.return_cil_type = subst(&raw_method.sig.return_type);
    method.return_type = session.target_type(&method.return_cil_type.clone());

    for (position, param) in raw_method.sig.params.iter().enumerate() {
        let cil_type = subst(&param.param_type);
        let target_type = session.target_type(&cil_type);
        method.params.push(Parameter {
            name: param
                .name
                .clone()
                .unwrap_or_else(|| format!("arg{position}")),
            cil_type,
            target_type,
        });
    }

    if raw_method.is_internal_call() {
        method.is_icall = true;
    }
    let first_param = method.params.first().map(|p| p.cil_type.clone());
    if let Some(entry) = icalls::lookup(
        owner,
        &raw_method.name,
        method.params.len(),
        first_param.as_deref(),
    ) {
        method.is_icall = true;
        method.icall_symbol = Some(icalls::qualified_symbol(entry));
    }

    method
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblies::{AssemblySet, LoadOptions};
    use crate::config::BuildConfig;
    use crate::metadata::model::*;
    use crate::metadata::reader::MemorySource;
    use crate::reach;
    use std::path::Path;

    fn session_for(assembly: RawAssembly) -> (AssemblySet, crate::reach::Reachability) {
        let name = assembly.name.clone();
        let mut source = MemorySource::new();
        source.add(assembly);
        let set = AssemblySet::load(
            &source,
            Path::new(&format!("/x/{name}.dll")),
            &LoadOptions::default(),
        )
        .unwrap();
        let reach = reach::analyze(&set);
        (set, reach)
    }

    #[test]
    fn operator_and_accessor_roles_come_from_special_names() {
        let mut app = RawAssembly::new("App");
        let mut ty = RawType::new("", "Vec");
        ty.flags |= TypeFlags::PUBLIC;

        let sig = MethodSig {
            has_this: false,
            return_type: "System.Int32".into(),
            params: vec![RawParam {
                name: Some("a".into()),
                param_type: "System.Int32".into(),
            }],
        };
        let mut op = RawMethod::new("op_Addition", sig.clone());
        op.flags |= MethodFlags::SPECIAL_NAME | MethodFlags::STATIC;
        ty.methods.push(op);
        let mut getter = RawMethod::new("get_Length", sig);
        getter.flags |= MethodFlags::SPECIAL_NAME;
        ty.methods.push(getter);
        app.types.push(ty);

        let (set, reach) = session_for(app);
        let config = BuildConfig::release();
        let mut session = BuildSession::new(&set, &reach, &config);
        crate::build::shells::TypeShellPass.run(&mut session);
        MethodShellPass.run(&mut session);

        let ty = session.module.find_type("Vec").unwrap();
        let op = ty.find_method("op_Addition").unwrap();
        assert!(op.is_operator);
        assert_eq!(op.operator_name.as_deref(), Some("op_Addition"));
        assert_eq!(op.return_type, "int32_t");
        let getter = ty.find_method("get_Length").unwrap();
        assert!(getter.is_property_accessor);
    }

    #[test]
    fn icall_mapped_methods_keep_no_body_requirement() {
        let mut app = RawAssembly::new("App");
        let mut math = RawType::new("System", "Math");
        math.flags |= TypeFlags::PUBLIC;
        let sig = MethodSig {
            has_this: false,
            return_type: "System.Double".into(),
            params: vec![RawParam {
                name: Some("value".into()),
                param_type: "System.Double".into(),
            }],
        };
        let mut sqrt = RawMethod::new("Sqrt", sig);
        sqrt.flags |= MethodFlags::STATIC;
        math.methods.push(sqrt);
        app.types.push(math);

        let (set, reach) = session_for(app);
        let config = BuildConfig::release();
        let mut session = BuildSession::new(&set, &reach, &config);
        crate::build::shells::TypeShellPass.run(&mut session);
        MethodShellPass.run(&mut session);

        let math = session.module.find_type("System.Math").unwrap();
        let sqrt = math.find_method("Sqrt").unwrap();
        assert!(sqrt.is_icall);
        assert_eq!(sqrt.icall_symbol.as_deref(), Some("cil2cpp::icall::Math_Sqrt"));
        assert!(!sqrt.requires_body());
    }
}
