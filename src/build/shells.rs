//! Pass 1: type shells.
//!
//! Creates the `IrType` record for every reachable non-generic type, with
//! names, kind flags and the base-type reference *by name only*. Open
//! generic definitions never enter the module (pass 4 materializes their
//! instantiations); runtime-provided names referenced by reachable code
//! but defined in no loaded assembly get synthesized shells, interfaces
//! among them as BCL proxies.

use std::collections::HashSet;

use log::debug;

use crate::assemblies::AssemblyKind;
use crate::ir::{IrType, Module, TypeSource};
use crate::metadata::model::RawType;

use super::session::BuildSession;
use super::BuildPass;

pub struct TypeShellPass;

impl BuildPass for TypeShellPass {
    fn id(&self) -> &'static str {
        "type-shells"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let reachable: Vec<String> = session.reach.types.clone();
        for fullname in &reachable {
            let Some(raw) = session.raw_type(fullname).cloned() else {
                continue;
            };
            if !raw.generic_params.is_empty() {
                // Open generic definition: only instantiations are types.
                debug!("skipping open generic {fullname}");
                continue;
            }
            let kind = session
                .raw_type_kind(fullname)
                .unwrap_or(AssemblyKind::RuntimeProvided);
            let shell = build_shell(session, &raw, kind);
            session.module.add_type(shell);
        }

        synthesize_external_shells(session);
    }
}

/// Shell for a loaded raw type. Shared with pass 4, which runs it against
/// substituted clones of open definitions.
pub fn build_shell(session: &mut BuildSession<'_>, raw: &RawType, kind: AssemblyKind) -> IrType {
    let fullname = raw.fullname();
    let mangled = session.names.mangle_type(&fullname);
    let mut ty = IrType::new(fullname, mangled);
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
    ty.base = raw.base.clone();
    ty.interfaces = raw.interfaces.clone();
    ty.enum_underlying = raw.enum_underlying.clone();
    ty.custom_attributes = raw.custom_attributes.clone();
    ty.has_cctor = raw.has_cctor();
    ty
}

/// Names reachable code references but no loaded assembly defines:
/// runtime-provided BCL surface and array composites. Interfaces that a
/// reachable type implements become BCL proxies so later passes can look
/// them up by name.
fn synthesize_external_shells(session: &mut BuildSession<'_>) {
    let implemented_interfaces: HashSet<String> = session
        .reach
        .types
        .iter()
        .filter_map(|t| session.raw_type(t))
        .flat_map(|t| t.interfaces.iter().cloned())
        .collect();

    let externals: Vec<String> = session.reach.external_types.clone();
    for fullname in externals {
        if session.module.find_type(&fullname).is_some() {
            continue;
        }
        if fullname.contains('`') && !fullname.contains('<') {
            // Open generic definition of an unloaded assembly; only its
            // instantiations become types (pass 4).
            continue;
        }
        let mangled = session.names.mangle_type(&fullname);
        let mut ty = IrType::new(fullname.clone(), mangled);
        ty.is_runtime_provided = true;
        if implemented_interfaces.contains(&fullname) {
            debug!("synthesizing BCL proxy for interface {fullname}");
            ty.source = TypeSource::BclProxy;
            ty.is_interface = true;
        } else {
            ty.source = TypeSource::RuntimeProvided;
            ty.is_value_type = Module::is_primitive(&fullname);
        }
        session.module.add_type(ty);
    }
}
