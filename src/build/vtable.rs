//! Pass 5: v-table construction.
//!
//! Walks each inheritance chain parents-first. A class starts from its
//! base's table (or from the canonical `System.Object` seed), then its own
//! virtual declarations either append (`NewSlot`) or replace the matching
//! base slot in place. An override with no matching base slot is an
//! invariant violation, fatal for that method only.

use std::collections::HashSet;

use log::debug;

use crate::diagnostics::{Diagnostic, DiagnosticCode, StubReason};
use crate::ir::VTableEntry;

use super::session::BuildSession;
use super::BuildPass;

/// Canonical virtual slots every object carries, in seed order.
pub const OBJECT_SLOTS: &[(&str, &[&str])] = &[
    ("ToString", &[]),
    ("Equals", &["System.Object"]),
    ("GetHashCode", &[]),
    ("Finalize", &[]),
];

pub struct VTablePass;

impl BuildPass for VTablePass {
    fn id(&self) -> &'static str {
        "vtables"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let names: Vec<String> = session.module.type_names().map(String::from).collect();
        let mut done = HashSet::new();
        for name in names {
            build_vtable(session, &name, &mut done);
        }
    }
}

fn object_seed() -> Vec<VTableEntry> {
    OBJECT_SLOTS
        .iter()
        .enumerate()
        .map(|(slot, (name, params))| VTableEntry {
            slot,
            method_name: (*name).to_string(),
            signature: params.iter().map(|p| (*p).to_string()).collect(),
            impl_type: None,
            impl_method: None,
        })
        .collect()
}

fn build_vtable(session: &mut BuildSession<'_>, fullname: &str, done: &mut HashSet<String>) {
    if !done.insert(fullname.to_string()) {
        return;
    }
    let Some(ty) = session.module.find_type(fullname) else {
        return;
    };
    // Interfaces dispatch through interface-impl tables; value types and
    // enums are called directly.
    if ty.is_interface || ty.is_value_type {
        return;
    }
    let base = ty.base.clone();

    let mut table = match &base {
        Some(base_name) if session.module.find_type(base_name).is_some() => {
            build_vtable(session, &base_name.clone(), done);
            let base_ty = session.module.find_type(base_name).unwrap();
            if base_ty.vtable.is_empty() && base_ty.is_runtime_provided {
                object_seed()
            } else if base_ty.is_interface || base_ty.is_value_type {
                object_seed()
            } else {
                base_ty.vtable.clone()
            }
        }
        _ => object_seed(),
    };

    let method_count = session.module.find_type(fullname).unwrap().methods.len();
    for method_index in 0..method_count {
        let (is_virtual, is_newslot, is_abstract, name, signature) = {
            let ty = session.module.find_type(fullname).unwrap();
            let m = &ty.methods[method_index];
            (
                m.is_virtual,
                m.is_newslot,
                m.is_abstract,
                m.cil_name.clone(),
                m.params.iter().map(|p| p.cil_type.clone()).collect::<Vec<_>>(),
            )
        };
        if !is_virtual {
            continue;
        }

        let slot = if is_newslot {
            let slot = table.len();
            table.push(VTableEntry {
                slot,
                method_name: name.clone(),
                signature: signature.clone(),
                impl_type: (!is_abstract).then(|| fullname.to_string()),
                impl_method: (!is_abstract).then_some(method_index),
            });
            slot
        } else {
            match table
                .iter()
                .position(|e| e.method_name == name && e.signature == signature)
            {
                Some(slot) => {
                    table[slot].impl_type = Some(fullname.to_string());
                    table[slot].impl_method = Some(method_index);
                    slot
                }
                None => {
                    // Override with no base slot: fatal for this method.
                    session.diagnostics.add(
                        Diagnostic::error(
                            DiagnosticCode::InvariantViolation,
                            format!(
                                "override '{fullname}::{name}' matches no virtual slot in its base chain"
                            ),
                        )
                        .with_subject(format!("{fullname}::{name}")),
                    );
                    let ty = session.module.find_type_mut(fullname).unwrap();
                    ty.methods[method_index].stub = Some(StubReason::InvariantViolation);
                    ty.methods[method_index].stub_detail =
                        Some("override without a matching base slot".to_string());
                    // Give it a fresh slot so the table stays dense.
                    let slot = table.len();
                    table.push(VTableEntry {
                        slot,
                        method_name: name.clone(),
                        signature: signature.clone(),
                        impl_type: Some(fullname.to_string()),
                        impl_method: Some(method_index),
                    });
                    slot
                }
            }
        };

        let ty = session.module.find_type_mut(fullname).unwrap();
        ty.methods[method_index].vtable_slot = slot as i32;
    }

    debug!("vtable of {fullname}: {} slots", table.len());
    session.module.find_type_mut(fullname).unwrap().vtable = table;
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

    fn virtual_method(name: &str, newslot: bool) -> RawMethod {
        let mut m = RawMethod::new(
            name,
            MethodSig {
                has_this: true,
                return_type: "System.Void".into(),
                params: vec![],
            },
        );
        m.flags |= MethodFlags::VIRTUAL;
        if newslot {
            m.flags |= MethodFlags::NEW_SLOT;
        }
        m.body = Some(RawBody::default());
        m
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
        VTablePass.run(&mut session);
        session.finish()
    }

    fn app_with(types: Vec<RawType>) -> RawAssembly {
        let mut app = RawAssembly::new("App");
        for mut t in types {
            t.flags |= TypeFlags::PUBLIC;
            app.types.push(t);
        }
        app
    }

    #[test]
    fn override_reuses_the_base_slot() {
        let mut animal = RawType::new("", "Animal");
        animal.methods.push(virtual_method("Speak", true));
        let mut dog = RawType::new("", "Dog");
        dog.base = Some("Animal".into());
        dog.methods.push(virtual_method("Speak", false));
        let mut cat = RawType::new("", "Cat");
        cat.base = Some("Animal".into());
        cat.methods.push(virtual_method("Speak", false));

        let (module, diags) = build(app_with(vec![animal, dog, cat]));
        assert!(!diags.has_errors());

        let animal_slot = module
            .find_type("Animal")
            .unwrap()
            .find_method("Speak")
            .unwrap()
            .vtable_slot;
        assert!(animal_slot >= OBJECT_SLOTS.len() as i32);
        for name in ["Dog", "Cat"] {
            let ty = module.find_type(name).unwrap();
            assert_eq!(ty.find_method("Speak").unwrap().vtable_slot, animal_slot);
            // Monotone table: base prefix preserved.
            let base = module.find_type("Animal").unwrap();
            assert!(ty.vtable.len() >= base.vtable.len());
            for (i, slot) in base.vtable.iter().enumerate() {
                assert_eq!(ty.vtable[i].slot, i);
                assert_eq!(ty.vtable[i].method_name, slot.method_name);
            }
        }
    }

    #[test]
    fn newslot_shadows_get_distinct_slots() {
        let mut base = RawType::new("", "Base");
        base.methods.push(virtual_method("M", true));
        let mut derived = RawType::new("", "Derived");
        derived.base = Some("Base".into());
        derived.methods.push(virtual_method("M", true)); // shadowing newslot

        let (module, _) = build(app_with(vec![base, derived]));
        let base_slot = module
            .find_type("Base")
            .unwrap()
            .find_method("M")
            .unwrap()
            .vtable_slot;
        let derived_slot = module
            .find_type("Derived")
            .unwrap()
            .find_method("M")
            .unwrap()
            .vtable_slot;
        assert_ne!(base_slot, derived_slot);
    }

    #[test]
    fn orphan_override_is_an_invariant_violation() {
        let mut lone = RawType::new("", "Lone");
        lone.methods.push(virtual_method("Nowhere", false));

        let (module, diags) = build(app_with(vec![lone]));
        assert!(diags.has_errors());
        let ty = module.find_type("Lone").unwrap();
        let m = ty.find_method("Nowhere").unwrap();
        assert_eq!(m.stub, Some(StubReason::InvariantViolation));
    }

    #[test]
    fn object_seed_slots_are_canonical() {
        let mut plain = RawType::new("", "Plain");
        plain.methods.push(virtual_method("ToString", false));
        let (module, diags) = build(app_with(vec![plain]));
        assert!(!diags.has_errors());
        let ty = module.find_type("Plain").unwrap();
        // ToString overrides seed slot 0.
        assert_eq!(ty.find_method("ToString").unwrap().vtable_slot, 0);
        assert_eq!(ty.vtable[1].method_name, "Equals");
        assert_eq!(ty.vtable[3].method_name, "Finalize");
    }
}
