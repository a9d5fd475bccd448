//! Pass 6: interface-impl mapping.
//!
//! For each class and each interface it lists, a slot table sized to the
//! interface's non-ctor method order. Resolution per slot: explicit
//! override, then name+signature match on the class's own methods, then
//! the base class's table for the same interface, then the interface's own
//! default body. Whatever stays unfilled is flagged for the gate.

use std::collections::HashSet;

use log::debug;

use crate::diagnostics::{Diagnostic, DiagnosticCode};
use crate::ir::{InterfaceImpl, MethodSlotRef};

use super::session::BuildSession;
use super::BuildPass;

pub struct InterfaceImplPass;

impl BuildPass for InterfaceImplPass {
    fn id(&self) -> &'static str {
        "interface-impls"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let names: Vec<String> = session.module.type_names().map(String::from).collect();
        let mut done = HashSet::new();
        for name in names {
            build_impls(session, &name, &mut done);
        }
    }
}

/// Interface methods that occupy dispatch slots, in declaration order.
fn interface_slot_methods(session: &BuildSession<'_>, interface: &str) -> Vec<(usize, String, Vec<String>, bool)> {
    let Some(iface) = session.module.find_type(interface) else {
        return Vec::new();
    };
    iface
        .methods
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_ctor && !m.is_cctor)
        .map(|(index, m)| {
            let has_body = !m.blocks.is_empty() || m.source_index.is_some_and(|si| {
                session
                    .raw_type(interface)
                    .and_then(|rt| rt.methods.get(si))
                    .map(|rm| rm.body.is_some())
                    .unwrap_or(false)
            });
            (
                index,
                m.cil_name.clone(),
                m.params.iter().map(|p| p.cil_type.clone()).collect(),
                has_body,
            )
        })
        .collect()
}

fn build_impls(session: &mut BuildSession<'_>, fullname: &str, done: &mut HashSet<String>) {
    if !done.insert(fullname.to_string()) {
        return;
    }
    let Some(ty) = session.module.find_type(fullname) else {
        return;
    };
    if ty.is_interface {
        return;
    }
    let base = ty.base.clone();
    let interfaces = ty.interfaces.clone();
    if let Some(base_name) = &base {
        build_impls(session, &base_name.clone(), done);
    }

    let mut impls = Vec::new();
    for interface in &interfaces {
        let slots = interface_slot_methods(session, interface);
        let mut method_impls: Vec<Option<MethodSlotRef>> = vec![None; slots.len()];
        let mut defective = false;

        for (position, (iface_index, slot_name, slot_sig, has_default)) in
            slots.iter().enumerate()
        {
            // (a) explicit override binding.
            let ty = session.module.find_type(fullname).unwrap();
            let explicit = ty.methods.iter().enumerate().find(|(_, m)| {
                m.explicit_overrides.iter().any(|o| {
                    o.interface_type == *interface && o.method_name == *slot_name
                })
            });
            if let Some((index, m)) = explicit {
                method_impls[position] = Some(MethodSlotRef {
                    type_name: fullname.to_string(),
                    method_index: index,
                    method_name: m.cil_name.clone(),
                });
                continue;
            }

            // (b) name + signature match on the class's own methods.
            let own = ty.methods.iter().enumerate().find(|(_, m)| {
                m.cil_name == *slot_name
                    && m.params.iter().map(|p| p.cil_type.as_str()).collect::<Vec<_>>()
                        == slot_sig.iter().map(String::as_str).collect::<Vec<_>>()
            });
            if let Some((index, m)) = own {
                method_impls[position] = Some(MethodSlotRef {
                    type_name: fullname.to_string(),
                    method_index: index,
                    method_name: m.cil_name.clone(),
                });
                continue;
            }

            // (c) inherited implementation from the base chain.
            if let Some(inherited) = inherited_impl(session, base.as_deref(), interface, position)
            {
                method_impls[position] = Some(inherited);
                continue;
            }

            // (d) default interface method.
            if *has_default {
                method_impls[position] = Some(MethodSlotRef {
                    type_name: interface.clone(),
                    method_index: *iface_index,
                    method_name: slot_name.clone(),
                });
                continue;
            }

            defective = true;
            session.diagnostics.add(
                Diagnostic::warning(
                    DiagnosticCode::InterfaceSlotUnfilled,
                    format!("no implementation of {interface}::{slot_name} on {fullname}"),
                )
                .with_subject(fullname.to_string()),
            );
        }

        debug!(
            "{fullname} implements {interface}: {}/{} slots filled",
            method_impls.iter().filter(|s| s.is_some()).count(),
            method_impls.len()
        );
        impls.push(InterfaceImpl {
            interface_name: interface.clone(),
            method_impls,
            defective,
        });
    }

    session.module.find_type_mut(fullname).unwrap().interface_impls = impls;
}

fn inherited_impl(
    session: &BuildSession<'_>,
    mut base: Option<&str>,
    interface: &str,
    position: usize,
) -> Option<MethodSlotRef> {
    let mut hops = 0;
    let mut current: Option<String> = base.map(|s| s.to_string());
    while let Some(base_name) = current.as_deref() {
        let base_ty = session.module.find_type(base_name)?;
        if let Some(found) = base_ty
            .interface_impls
            .iter()
            .find(|i| i.interface_name == interface)
        {
            return found.method_impls.get(position).cloned().flatten();
        }
        current = base_ty.base.clone();
        hops += 1;
        if hops > 64 {
            return None;
        }
    }
    None
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

    fn sig0() -> MethodSig {
        MethodSig {
            has_this: true,
            return_type: "System.Void".into(),
            params: vec![],
        }
    }

    fn build(app: RawAssembly) -> (crate::ir::Module, crate::diagnostics::DiagnosticCollection) {
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
        crate::build::vtable::VTablePass.run(&mut session);
        InterfaceImplPass.run(&mut session);
        session.finish()
    }

    #[test]
    fn explicit_override_beats_name_match_and_dim_fills_gaps() {
        let mut app = RawAssembly::new("App");

        let mut iface = RawType::new("", "IThing");
        iface.flags |= TypeFlags::INTERFACE | TypeFlags::ABSTRACT | TypeFlags::PUBLIC;
        let mut act = RawMethod::new("Act", sig0());
        act.flags |= MethodFlags::VIRTUAL | MethodFlags::ABSTRACT | MethodFlags::NEW_SLOT;
        iface.methods.push(act);
        let mut helper = RawMethod::new("Helper", sig0());
        helper.flags |= MethodFlags::VIRTUAL | MethodFlags::NEW_SLOT;
        helper.body = Some(RawBody::default()); // default interface method
        iface.methods.push(helper);

        let mut thing = RawType::new("", "Thing");
        thing.flags |= TypeFlags::PUBLIC;
        thing.interfaces.push("IThing".into());
        // Decoy with matching name, plus an explicit override elsewhere.
        let mut decoy = RawMethod::new("Act", sig0());
        decoy.body = Some(RawBody::default());
        thing.methods.push(decoy);
        let mut bound = RawMethod::new("IThing.Act", sig0());
        bound.flags |= MethodFlags::VIRTUAL | MethodFlags::NEW_SLOT;
        bound.body = Some(RawBody::default());
        bound.explicit_overrides.push(ExplicitOverride {
            interface_type: "IThing".into(),
            method_name: "Act".into(),
        });
        thing.methods.push(bound);

        app.types.push(iface);
        app.types.push(thing);

        let (module, diags) = build(app);
        assert!(!diags.has_errors());

        let thing = module.find_type("Thing").unwrap();
        let impls = &thing.interface_impls;
        assert_eq!(impls.len(), 1);
        let table = &impls[0];
        assert!(!table.defective);
        assert_eq!(table.method_impls.len(), 2);
        // Slot 0 bound by the explicit override, not the decoy.
        assert_eq!(
            table.method_impls[0].as_ref().unwrap().method_name,
            "IThing.Act"
        );
        // Slot 1 falls back to the interface's own default body.
        let helper = table.method_impls[1].as_ref().unwrap();
        assert_eq!(helper.type_name, "IThing");
    }

    #[test]
    fn missing_slots_are_defective_and_reported() {
        let mut app = RawAssembly::new("App");
        let mut iface = RawType::new("", "IGone");
        iface.flags |= TypeFlags::INTERFACE | TypeFlags::ABSTRACT | TypeFlags::PUBLIC;
        let mut act = RawMethod::new("Act", sig0());
        act.flags |= MethodFlags::VIRTUAL | MethodFlags::ABSTRACT | MethodFlags::NEW_SLOT;
        iface.methods.push(act);

        let mut lacking = RawType::new("", "Lacking");
        lacking.flags |= TypeFlags::PUBLIC;
        lacking.interfaces.push("IGone".into());
        app.types.push(iface);
        app.types.push(lacking);

        let (module, diags) = build(app);
        let lacking = module.find_type("Lacking").unwrap();
        assert!(lacking.interface_impls[0].defective);
        assert!(diags
            .warnings()
            .any(|d| d.code == DiagnosticCode::InterfaceSlotUnfilled));
    }

    #[test]
    fn inherited_implementations_fill_derived_tables() {
        let mut app = RawAssembly::new("App");
        let mut iface = RawType::new("", "IAct");
        iface.flags |= TypeFlags::INTERFACE | TypeFlags::ABSTRACT | TypeFlags::PUBLIC;
        let mut act = RawMethod::new("Act", sig0());
        act.flags |= MethodFlags::VIRTUAL | MethodFlags::ABSTRACT | MethodFlags::NEW_SLOT;
        iface.methods.push(act);

        let mut base = RawType::new("", "BaseImpl");
        base.flags |= TypeFlags::PUBLIC;
        base.interfaces.push("IAct".into());
        let mut act_impl = RawMethod::new("Act", sig0());
        act_impl.flags |= MethodFlags::VIRTUAL | MethodFlags::NEW_SLOT;
        act_impl.body = Some(RawBody::default());
        base.methods.push(act_impl);

        let mut derived = RawType::new("", "DerivedImpl");
        derived.flags |= TypeFlags::PUBLIC;
        derived.base = Some("BaseImpl".into());
        derived.interfaces.push("IAct".into());

        app.types.push(iface);
        app.types.push(base);
        app.types.push(derived);

        let (module, _) = build(app);
        let derived = module.find_type("DerivedImpl").unwrap();
        let slot = derived.interface_impls[0].method_impls[0].as_ref().unwrap();
        assert_eq!(slot.type_name, "BaseImpl");
        assert_eq!(slot.method_name, "Act");
    }
}
