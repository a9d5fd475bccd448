//! Reachability analysis.
//!
//! Fixed-point worklist over the assembly set: starting from the
//! entry-point (or from every publicly visible user type when building a
//! static library), walk call-sites, object creations, delegate loads,
//! field accesses, explicit overrides, and custom-attribute constructors
//! until the set closes. Virtual call-sites conservatively pull in every
//! matching override on reachable descendants. Generic instantiation
//! tuples encountered along the way are recorded for monomorphization.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use crate::assemblies::AssemblySet;
use crate::metadata::model::{FieldRef, MethodRef, RawMethod, RawType};

pub mod names;

use names::{mentions_any, peel_composite, split_instantiation};

/// A reachable method, addressed by its open declaring type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub type_fullname: String,
    pub method_index: usize,
}

/// A generic type instantiation discovered in reachable code.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeInstantiation {
    pub open: String,
    pub args: Vec<String>,
}

impl TypeInstantiation {
    pub fn instance_name(&self) -> String {
        format!("{}<{}>", self.open, self.args.join(","))
    }
}

/// Closed reachable sets, in deterministic discovery order.
#[derive(Debug, Default)]
pub struct Reachability {
    pub types: Vec<String>,
    pub methods: Vec<MethodId>,
    /// Referenced names that no loaded assembly defines (runtime-provided
    /// BCL surface, array composites); the builder synthesizes shells.
    pub external_types: Vec<String>,
    pub type_instantiations: Vec<TypeInstantiation>,
    pub method_instantiations: Vec<MethodRef>,
    type_set: HashSet<String>,
    method_set: HashSet<MethodId>,
    external_set: HashSet<String>,
    instantiation_set: HashSet<TypeInstantiation>,
}

impl Reachability {
    pub fn is_type_reachable(&self, fullname: &str) -> bool {
        self.type_set.contains(fullname) || self.external_set.contains(fullname)
    }

    pub fn is_method_reachable(&self, id: &MethodId) -> bool {
        self.method_set.contains(id)
    }

    pub fn methods_of(&self, type_fullname: &str) -> Vec<&MethodId> {
        self.methods
            .iter()
            .filter(|m| m.type_fullname == type_fullname)
            .collect()
    }
}

/// A recorded virtual call-site, matched against descendants as they
/// become reachable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct VirtualSite {
    owner: String,
    name: String,
    arity: usize,
}

pub struct ReachabilityAnalyzer<'a> {
    set: &'a AssemblySet,
    reach: Reachability,
    type_queue: VecDeque<String>,
    method_queue: VecDeque<MethodId>,
    virtual_sites: HashSet<VirtualSite>,
    /// base/interface -> known reachable descendants, for override closure.
    descendants: HashMap<String, Vec<String>>,
}

impl<'a> ReachabilityAnalyzer<'a> {
    pub fn new(set: &'a AssemblySet) -> Self {
        Self {
            set,
            reach: Reachability::default(),
            type_queue: VecDeque::new(),
            method_queue: VecDeque::new(),
            virtual_sites: HashSet::new(),
            descendants: HashMap::new(),
        }
    }

    pub fn analyze(mut self) -> Reachability {
        self.seed_roots();
        self.run_to_fixpoint();
        info!(
            "reachability: {} types, {} methods, {} instantiations",
            self.reach.types.len(),
            self.reach.methods.len(),
            self.reach.type_instantiations.len()
        );
        self.reach
    }

    fn seed_roots(&mut self) {
        let entry = self.set.entry_assembly();
        if let Some(entry_point) = &entry.raw.entry_point {
            debug!(
                "rooting at entry point {}::{}",
                entry_point.type_fullname, entry_point.method_name
            );
            self.mark_type(&entry_point.type_fullname);
            if let Some((ty, _)) = self.set.find_type(&entry_point.type_fullname) {
                for (index, method) in ty.methods.iter().enumerate() {
                    if method.name == entry_point.method_name {
                        self.mark_method(MethodId {
                            type_fullname: entry_point.type_fullname.clone(),
                            method_index: index,
                        });
                    }
                }
            }
            return;
        }

        // No entry point: static-library output roots every publicly
        // visible type of the user assemblies.
        debug!("no entry point; rooting all public user types");
        let public_types: Vec<String> = self
            .set
            .assemblies()
            .iter()
            .filter(|a| a.kind == crate::assemblies::AssemblyKind::User)
            .flat_map(|a| {
                a.raw
                    .types
                    .iter()
                    .filter(|t| {
                        t.flags
                            .contains(crate::metadata::model::TypeFlags::PUBLIC)
                    })
                    .map(|t| t.fullname())
            })
            .collect();
        for fullname in public_types {
            self.mark_type(&fullname);
            if let Some((ty, _)) = self.set.find_type(&fullname) {
                for index in 0..ty.methods.len() {
                    self.mark_method(MethodId {
                        type_fullname: fullname.clone(),
                        method_index: index,
                    });
                }
            }
        }
    }

    fn run_to_fixpoint(&mut self) {
        loop {
            if let Some(fullname) = self.type_queue.pop_front() {
                self.expand_type(&fullname);
                continue;
            }
            if let Some(id) = self.method_queue.pop_front() {
                self.expand_method(&id);
                continue;
            }
            break;
        }
    }

    // ---- marking --------------------------------------------------------

    fn mark_type(&mut self, name: &str) {
        self.mark_type_in(name, &HashSet::new());
    }

    /// Mark a type name, ignoring anything that still mentions a generic
    /// parameter of the enclosing scope: only concrete names and tuples
    /// make it into the reachable sets.
    fn mark_type_in(&mut self, name: &str, scope_params: &HashSet<String>) {
        if mentions_any(name, scope_params) {
            let element = peel_composite(name).element;
            if let Some((open, args)) = split_instantiation(&element) {
                for arg in &args {
                    self.mark_type_in(arg, scope_params);
                }
                self.mark_type_in(&open, scope_params);
            }
            return;
        }
        let peeled = peel_composite(name);
        if peeled.composite {
            // The composed form (arrays) is emitted as a runtime shell; the
            // element type continues through normal resolution.
            self.mark_external(name);
        }
        let element = peeled.element;
        if element.is_empty() || element.starts_with('!') {
            return;
        }

        if let Some((open, args)) = split_instantiation(&element) {
            for arg in &args {
                self.mark_type_in(arg, scope_params);
            }
            let inst = TypeInstantiation {
                open: open.clone(),
                args,
            };
            if self.reach.instantiation_set.insert(inst.clone()) {
                self.reach.type_instantiations.push(inst);
            }
            self.mark_type_in(&open, scope_params);
            return;
        }

        if self.reach.type_set.contains(&element) {
            return;
        }
        match self.set.find_type(&element) {
            Some(_) => {
                self.reach.type_set.insert(element.clone());
                self.reach.types.push(element.clone());
                self.type_queue.push_back(element);
            }
            None => self.mark_external(&element),
        }
    }

    fn mark_external(&mut self, name: &str) {
        if self.reach.external_set.insert(name.to_string()) {
            self.reach.external_types.push(name.to_string());
        }
    }

    fn mark_method(&mut self, id: MethodId) {
        if self.reach.method_set.contains(&id) {
            return;
        }
        self.mark_type(&id.type_fullname);
        self.reach.method_set.insert(id.clone());
        self.reach.methods.push(id.clone());
        self.method_queue.push_back(id);
    }

    // ---- expansion ------------------------------------------------------

    fn expand_type(&mut self, fullname: &str) {
        let Some((ty, _)) = self.set.find_type(fullname) else {
            return;
        };
        let ty = ty.clone();
        let scope: HashSet<String> = ty.generic_params.iter().map(|p| p.name.clone()).collect();

        if let Some(base) = &ty.base {
            self.mark_type_in(base, &scope);
        }
        for interface in &ty.interfaces {
            self.mark_type_in(interface, &scope);
        }
        for field in &ty.fields {
            self.mark_type_in(&field.field_type, &scope);
        }
        for attr in &ty.custom_attributes {
            self.mark_attribute(&attr.attribute_type);
        }

        // Static initialization and finalization run whenever the type is
        // alive, so their methods are reachable with it.
        for (index, method) in ty.methods.iter().enumerate() {
            if method.is_cctor() || method.name == "Finalize" {
                self.mark_method(MethodId {
                    type_fullname: fullname.to_string(),
                    method_index: index,
                });
            }
        }

        self.register_descendant(&ty, fullname);
        self.match_pending_virtual_sites(fullname, &ty);
    }

    fn register_descendant(&mut self, ty: &RawType, fullname: &str) {
        let mut ancestors = Vec::new();
        let mut current_base = ty.base.clone();
        while let Some(base) = current_base {
            ancestors.push(base.clone());
            current_base = self
                .set
                .find_type(&base)
                .and_then(|(t, _)| t.base.clone());
        }
        for interface in &ty.interfaces {
            ancestors.push(interface.clone());
        }
        for ancestor in ancestors {
            self.descendants
                .entry(ancestor)
                .or_default()
                .push(fullname.to_string());
        }
    }

    fn match_pending_virtual_sites(&mut self, fullname: &str, ty: &RawType) {
        let sites: Vec<VirtualSite> = self.virtual_sites.iter().cloned().collect();
        for site in sites {
            if site.owner == fullname || self.derives_from(fullname, &site.owner) {
                self.mark_matching_method(ty, fullname, &site.name, site.arity);
            }
        }
    }

    fn derives_from(&self, derived: &str, base: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = vec![derived.to_string()];
        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some((ty, _)) = self.set.find_type(&current) else {
                continue;
            };
            if let Some(b) = &ty.base {
                if b == base {
                    return true;
                }
                queue.push(b.clone());
            }
            for i in &ty.interfaces {
                if i == base {
                    return true;
                }
                queue.push(i.clone());
            }
        }
        false
    }

    fn mark_matching_method(&mut self, ty: &RawType, fullname: &str, name: &str, arity: usize) {
        for (index, method) in ty.methods.iter().enumerate() {
            if method.name == name && method.sig.params.len() == arity {
                self.mark_method(MethodId {
                    type_fullname: fullname.to_string(),
                    method_index: index,
                });
            }
        }
    }

    fn expand_method(&mut self, id: &MethodId) {
        let Some((ty, _)) = self.set.find_type(&id.type_fullname) else {
            return;
        };
        let Some(method) = ty.methods.get(id.method_index) else {
            return;
        };
        let method = method.clone();
        let mut scope: HashSet<String> = ty
            .generic_params
            .iter()
            .map(|p| p.name.clone())
            .collect();
        scope.extend(method.generic_params.iter().cloned());

        self.mark_type_in(&method.sig.return_type, &scope);
        for param in &method.sig.params {
            self.mark_type_in(&param.param_type, &scope);
        }
        for attr in &method.custom_attributes {
            self.mark_attribute(&attr.attribute_type);
        }
        for explicit in &method.explicit_overrides {
            self.mark_interface_method(&explicit.interface_type, &explicit.method_name);
        }

        let Some(body) = &method.body else {
            return;
        };
        for local in &body.locals {
            self.mark_type_in(&local.local_type, &scope);
        }
        for clause in &body.eh {
            if let crate::metadata::model::EhKind::Catch { catch_type } = &clause.kind {
                self.mark_type_in(catch_type, &scope);
            }
        }

        use crate::metadata::cil::CilOp;
        for inst in &body.ops {
            match &inst.op {
                CilOp::Call(m) | CilOp::Jmp(m) => self.mark_call(m, false, &scope),
                CilOp::CallVirt(m) => self.mark_call(m, true, &scope),
                CilOp::Newobj(m) => self.mark_call(m, false, &scope),
                CilOp::Ldftn(m) => self.mark_call(m, false, &scope),
                CilOp::Ldvirtftn(m) => self.mark_call(m, true, &scope),
                CilOp::Ldfld(f) | CilOp::Ldflda(f) | CilOp::Stfld(f) | CilOp::Ldsfld(f)
                | CilOp::Ldsflda(f) | CilOp::Stsfld(f) => self.mark_field(f, &scope),
                CilOp::Castclass(t) | CilOp::Isinst(t) | CilOp::Box(t) | CilOp::Unbox(t)
                | CilOp::UnboxAny(t) | CilOp::Newarr(t) | CilOp::Ldelema(t)
                | CilOp::Ldelem(t) | CilOp::Stelem(t) | CilOp::InitObj(t) | CilOp::LdObj(t)
                | CilOp::StObj(t) | CilOp::CpObj(t) | CilOp::SizeOf(t) | CilOp::MkRefAny(t)
                | CilOp::RefAnyVal(t) | CilOp::Constrained(t) => self.mark_type_in(t, &scope),
                CilOp::Ldtoken(token) => match token {
                    crate::metadata::model::TokenRef::Type(t) => self.mark_type_in(t, &scope),
                    crate::metadata::model::TokenRef::Method(m) => self.mark_call(m, false, &scope),
                    crate::metadata::model::TokenRef::Field(f) => self.mark_field(f, &scope),
                },
                _ => {}
            }
        }
    }

    fn mark_attribute(&mut self, attribute_type: &str) {
        self.mark_type(attribute_type);
        if let Some((ty, _)) = self.set.find_type(attribute_type) {
            let ctor_indices: Vec<usize> = ty
                .methods
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_ctor())
                .map(|(i, _)| i)
                .collect();
            for index in ctor_indices {
                self.mark_method(MethodId {
                    type_fullname: attribute_type.to_string(),
                    method_index: index,
                });
            }
        }
    }

    fn mark_interface_method(&mut self, interface: &str, method_name: &str) {
        self.mark_type(interface);
        if let Some((ty, _)) = self.set.find_type(interface) {
            let matches: Vec<usize> = ty
                .methods
                .iter()
                .enumerate()
                .filter(|(_, m)| m.name == method_name)
                .map(|(i, _)| i)
                .collect();
            for index in matches {
                self.mark_method(MethodId {
                    type_fullname: interface.to_string(),
                    method_index: index,
                });
            }
        }
    }

    fn mark_call(&mut self, mref: &MethodRef, virtual_dispatch: bool, scope: &HashSet<String>) {
        self.mark_type_in(&mref.owner, scope);
        for arg in &mref.generic_args {
            self.mark_type_in(arg, scope);
        }
        let concrete_args = !mref.generic_args.is_empty()
            && !mref.generic_args.iter().any(|a| mentions_any(a, scope))
            && !mentions_any(&mref.owner, scope);
        if concrete_args {
            self.reach.method_instantiations.push(mref.clone());
        }

        // Methods are owned by the open definition; an instantiated owner
        // routes to it.
        let owner_open = split_instantiation(&mref.owner)
            .map(|(open, _)| open)
            .unwrap_or_else(|| mref.owner.clone());

        self.resolve_in_chain(&owner_open, &mref.name, mref.arity());

        if virtual_dispatch {
            let site = VirtualSite {
                owner: owner_open.clone(),
                name: mref.name.clone(),
                arity: mref.arity(),
            };
            if self.virtual_sites.insert(site.clone()) {
                // Sweep types that were already reachable before this site
                // appeared.
                let known: Vec<String> = self.reach.types.clone();
                for fullname in known {
                    if fullname != site.owner && self.derives_from(&fullname, &site.owner) {
                        if let Some((ty, _)) = self.set.find_type(&fullname) {
                            let ty = ty.clone();
                            self.mark_matching_method(&ty, &fullname, &site.name, site.arity);
                        }
                    }
                }
            }
        }
    }

    /// Resolve name+arity on the type or its base chain and mark it.
    fn resolve_in_chain(&mut self, type_fullname: &str, name: &str, arity: usize) {
        let mut current = Some(type_fullname.to_string());
        let mut guard = HashSet::new();
        while let Some(fullname) = current {
            if !guard.insert(fullname.clone()) {
                break;
            }
            let Some((ty, _)) = self.set.find_type(&fullname) else {
                break;
            };
            let matches: Vec<usize> = ty
                .methods
                .iter()
                .enumerate()
                .filter(|(_, m)| m.name == name && m.sig.params.len() == arity)
                .map(|(i, _)| i)
                .collect();
            if !matches.is_empty() {
                for index in matches {
                    self.mark_method(MethodId {
                        type_fullname: fullname.clone(),
                        method_index: index,
                    });
                }
                return;
            }
            current = ty.base.clone();
        }
    }

    fn mark_field(&mut self, fref: &FieldRef, scope: &HashSet<String>) {
        self.mark_type_in(&fref.owner, scope);
        self.mark_type_in(&fref.field_type, scope);

        // A read of a delegate-typed field keeps the delegate callable.
        let element = peel_composite(&fref.field_type).element;
        if let Some((ty, _)) = self.set.find_type(&element) {
            if ty.is_delegate {
                let fullname = ty.fullname();
                let indices: Vec<usize> = ty
                    .methods
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.name == "Invoke" || m.is_ctor())
                    .map(|(i, _)| i)
                    .collect();
                for index in indices {
                    self.mark_method(MethodId {
                        type_fullname: fullname.clone(),
                        method_index: index,
                    });
                }
            }
        }
    }
}

/// Convenience entry point.
pub fn analyze(set: &AssemblySet) -> Reachability {
    ReachabilityAnalyzer::new(set).analyze()
}

#[allow(unused_imports)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemblies::{AssemblySet, LoadOptions};
    use crate::metadata::cil::{CilInst, CilOp};
    use crate::metadata::model::*;
    use crate::metadata::reader::MemorySource;
    use std::path::Path;

    fn void_sig() -> MethodSig {
        MethodSig {
            has_this: true,
            return_type: "System.Void".into(),
            params: vec![],
        }
    }

    fn method_with_ops(name: &str, ops: Vec<CilOp>) -> RawMethod {
        let mut m = RawMethod::new(name, void_sig());
        m.body = Some(RawBody {
            ops: ops
                .into_iter()
                .enumerate()
                .map(|(i, op)| CilInst::new(i as u32, op))
                .collect(),
            ..Default::default()
        });
        m
    }

    fn call_ref(owner: &str, name: &str) -> MethodRef {
        MethodRef {
            owner: owner.into(),
            name: name.into(),
            has_this: true,
            return_type: "System.Void".into(),
            params: vec![],
            generic_args: vec![],
        }
    }

    fn load(assembly: RawAssembly) -> AssemblySet {
        let mut source = MemorySource::new();
        let name = assembly.name.clone();
        source.add(assembly);
        AssemblySet::load(
            &source,
            Path::new(&format!("/x/{name}.dll")),
            &LoadOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn unreachable_methods_are_pruned() {
        let mut app = RawAssembly::new("App");
        let mut program = RawType::new("", "Program");
        let mut main = method_with_ops("Main", vec![CilOp::Call(call_ref("Used", "Go")), CilOp::Ret]);
        main.flags |= MethodFlags::STATIC;
        program.methods.push(main);
        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });

        let mut used = RawType::new("", "Used");
        used.methods.push(method_with_ops("Go", vec![CilOp::Ret]));
        used.methods
            .push(method_with_ops("Unused", vec![CilOp::Ret]));

        let mut dead = RawType::new("", "Dead");
        dead.methods.push(method_with_ops("Gone", vec![CilOp::Ret]));

        app.types.push(program);
        app.types.push(used);
        app.types.push(dead);

        let set = load(app);
        let reach = analyze(&set);

        assert!(reach.is_type_reachable("Program"));
        assert!(reach.is_type_reachable("Used"));
        assert!(!reach.is_type_reachable("Dead"));
        assert!(reach.is_method_reachable(&MethodId {
            type_fullname: "Used".into(),
            method_index: 0
        }));
        assert!(!reach.is_method_reachable(&MethodId {
            type_fullname: "Used".into(),
            method_index: 1
        }));
    }

    #[test]
    fn virtual_calls_reach_overrides_on_reachable_descendants() {
        let mut app = RawAssembly::new("App");

        let mut animal = RawType::new("", "Animal");
        let mut speak = method_with_ops("Speak", vec![CilOp::Ret]);
        speak.flags |= MethodFlags::VIRTUAL;
        animal.methods.push(speak);

        let mut dog = RawType::new("", "Dog");
        dog.base = Some("Animal".into());
        let mut dog_speak = method_with_ops("Speak", vec![CilOp::Ret]);
        dog_speak.flags |= MethodFlags::VIRTUAL;
        dog.methods.push(dog_speak);
        dog.methods.push(method_with_ops(".ctor", vec![CilOp::Ret]));

        let mut program = RawType::new("", "Program");
        let mut main = method_with_ops(
            "Main",
            vec![
                CilOp::Newobj(call_ref("Dog", ".ctor")),
                CilOp::CallVirt(call_ref("Animal", "Speak")),
                CilOp::Ret,
            ],
        );
        main.flags |= MethodFlags::STATIC;
        program.methods.push(main);

        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });
        app.types.push(program);
        app.types.push(animal);
        app.types.push(dog);

        let set = load(app);
        let reach = analyze(&set);

        // Dog::Speak (index 0) must be swept in by the virtual site even
        // though no call names it directly.
        assert!(reach.is_method_reachable(&MethodId {
            type_fullname: "Dog".into(),
            method_index: 0
        }));
        assert!(reach.is_method_reachable(&MethodId {
            type_fullname: "Animal".into(),
            method_index: 0
        }));
    }

    #[test]
    fn generic_instantiations_are_recorded() {
        let mut app = RawAssembly::new("App");

        let mut wrapper = RawType::new("", "Wrapper`1");
        wrapper.generic_params.push(GenericParam {
            name: "T".into(),
            variance: Variance::Invariant,
        });
        wrapper.fields.push(RawField::new("_value", "T"));
        wrapper.methods.push(method_with_ops(".ctor", vec![CilOp::Ret]));

        let mut program = RawType::new("", "Program");
        let mut main = method_with_ops(
            "Main",
            vec![
                CilOp::Newobj(call_ref("Wrapper`1<System.Int32>", ".ctor")),
                CilOp::Ret,
            ],
        );
        main.flags |= MethodFlags::STATIC;
        program.methods.push(main);

        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });
        app.types.push(program);
        app.types.push(wrapper);

        let set = load(app);
        let reach = analyze(&set);

        assert!(reach.is_type_reachable("Wrapper`1"));
        assert_eq!(reach.type_instantiations.len(), 1);
        assert_eq!(reach.type_instantiations[0].open, "Wrapper`1");
        assert_eq!(reach.type_instantiations[0].args, vec!["System.Int32"]);
        // System.Int32 is not defined in the set, so it lands in externals.
        assert!(reach.external_types.contains(&"System.Int32".to_string()));
    }

    #[test]
    fn no_entry_point_roots_public_types() {
        let mut app = RawAssembly::new("App");
        let mut public_type = RawType::new("Lib", "Api");
        public_type.flags |= TypeFlags::PUBLIC;
        public_type.methods.push(method_with_ops("Use", vec![CilOp::Ret]));
        let internal_type = RawType::new("Lib", "Hidden");
        app.types.push(public_type);
        app.types.push(internal_type);

        let set = load(app);
        let reach = analyze(&set);
        assert!(reach.is_type_reachable("Lib.Api"));
        assert!(!reach.is_type_reachable("Lib.Hidden"));
    }
}
