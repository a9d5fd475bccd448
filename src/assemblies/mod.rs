//! The assembly set: the entry assembly plus the transitive closure of its
//! references, each classified, with a global type index and type-forwarder
//! resolution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticCollection};
use crate::error::Result;
use crate::metadata::model::{RawAssembly, RawType};
use crate::metadata::reader::MetadataSource;

/// Where an assembly comes from, which decides how its types are emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyKind {
    User,
    ThirdParty,
    RuntimeProvided,
}

#[derive(Debug)]
pub struct LoadedAssembly {
    pub raw: RawAssembly,
    pub kind: AssemblyKind,
}

/// Probing configuration for reference resolution.
#[derive(Debug, Default, Clone)]
pub struct LoadOptions {
    pub search_paths: Vec<PathBuf>,
    pub bcl_dir: Option<PathBuf>,
    pub read_debug: bool,
}

/// A resolved type plus the index of the assembly that defines it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeLocation {
    pub assembly: usize,
    pub type_index: usize,
}

#[derive(Debug)]
pub struct AssemblySet {
    assemblies: Vec<LoadedAssembly>,
    by_name: HashMap<String, usize>,
    type_index: HashMap<String, TypeLocation>,
    /// type fullname -> assembly that forwarded it, for diagnostics.
    forwarding_sources: HashMap<String, String>,
    /// References that stayed unresolved after probing.
    missing: Vec<String>,
    pub diagnostics: DiagnosticCollection,
}

/// Simple names that mark an assembly as part of the runtime-provided BCL.
fn is_bcl_name(name: &str) -> bool {
    name == "mscorlib"
        || name == "netstandard"
        || name == "System"
        || name == "WindowsBase"
        || name.starts_with("System.")
        || name.starts_with("Microsoft.CSharp")
}

impl AssemblySet {
    /// Load the entry assembly and the transitive closure of its references.
    ///
    /// Reference cycles are tolerated (the visited set breaks them) and
    /// reported; unresolved references become warnings here and escalate in
    /// the driver only if reachable code needs them.
    pub fn load(
        source: &dyn MetadataSource,
        entry_path: &Path,
        options: &LoadOptions,
    ) -> Result<Self> {
        let entry = source.load_path(entry_path, options.read_debug)?;
        info!(
            "loaded entry assembly '{}' ({} types)",
            entry.name,
            entry.types.len()
        );

        let mut probe_dirs = options.search_paths.clone();
        if let Some(parent) = entry_path.parent() {
            probe_dirs.push(parent.to_path_buf());
        }
        if let Some(bcl) = &options.bcl_dir {
            probe_dirs.push(bcl.clone());
        }

        let mut set = Self {
            assemblies: Vec::new(),
            by_name: HashMap::new(),
            type_index: HashMap::new(),
            forwarding_sources: HashMap::new(),
            missing: Vec::new(),
            diagnostics: DiagnosticCollection::new(),
        };

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut graph_nodes: HashMap<String, NodeIndex> = HashMap::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        visited.insert(entry.name.clone());
        let entry_index = set.push_assembly(entry, AssemblyKind::User);
        queue.push_back(entry_index);

        while let Some(current) = queue.pop_front() {
            let (current_name, references) = {
                let raw = &set.assemblies[current].raw;
                (raw.name.clone(), raw.references.clone())
            };
            let current_node = *graph_nodes
                .entry(current_name.clone())
                .or_insert_with(|| graph.add_node(current_name.clone()));

            for reference in references {
                let node = *graph_nodes
                    .entry(reference.name.clone())
                    .or_insert_with(|| graph.add_node(reference.name.clone()));
                graph.add_edge(current_node, node, ());

                if !visited.insert(reference.name.clone()) {
                    continue;
                }
                match source.resolve_reference(&reference.name, &probe_dirs, options.read_debug)? {
                    Some(raw) => {
                        let kind = if is_bcl_name(&raw.name) {
                            AssemblyKind::RuntimeProvided
                        } else {
                            AssemblyKind::ThirdParty
                        };
                        debug!("loaded reference '{}' as {:?}", raw.name, kind);
                        let index = set.push_assembly(raw, kind);
                        queue.push_back(index);
                    }
                    None => {
                        warn!("reference '{}' not found on any probing path", reference.name);
                        set.diagnostics.add(
                            Diagnostic::warning(
                                DiagnosticCode::UnresolvedReference,
                                format!(
                                    "assembly '{}' referenced by '{}' was not found",
                                    reference.name, current_name
                                ),
                            )
                            .with_subject(reference.name.clone()),
                        );
                        set.missing.push(reference.name.clone());
                    }
                }
            }
        }

        for component in tarjan_scc(&graph) {
            if component.len() > 1 {
                let names: Vec<&str> =
                    component.iter().map(|&n| graph[n].as_str()).collect();
                set.diagnostics.add(Diagnostic::warning(
                    DiagnosticCode::ReferenceCycle,
                    format!("assembly reference cycle: {}", names.join(" -> ")),
                ));
            }
        }

        Ok(set)
    }

    fn push_assembly(&mut self, raw: RawAssembly, kind: AssemblyKind) -> usize {
        let index = self.assemblies.len();
        self.by_name.insert(raw.name.clone(), index);
        for (type_index, ty) in raw.types.iter().enumerate() {
            self.type_index
                .entry(ty.fullname())
                .or_insert(TypeLocation {
                    assembly: index,
                    type_index,
                });
        }
        self.assemblies.push(LoadedAssembly { raw, kind });
        index
    }

    pub fn assemblies(&self) -> &[LoadedAssembly] {
        &self.assemblies
    }

    pub fn entry_assembly(&self) -> &LoadedAssembly {
        &self.assemblies[0]
    }

    pub fn by_name(&self, name: &str) -> Option<&LoadedAssembly> {
        self.by_name.get(name).map(|&i| &self.assemblies[i])
    }

    pub fn unresolved_references(&self) -> &[String] {
        &self.missing
    }

    /// Resolve a type by full name, traversing type-forwarders. The
    /// forwarding source is remembered for diagnostics.
    pub fn resolve_type(&mut self, fullname: &str) -> Option<(&RawType, AssemblyKind)> {
        let location = self.locate_type(fullname)?;
        let assembly = &self.assemblies[location.assembly];
        Some((&assembly.raw.types[location.type_index], assembly.kind))
    }

    /// Non-mutating resolution for callers that do not care about the
    /// forwarding bookkeeping.
    pub fn find_type(&self, fullname: &str) -> Option<(&RawType, AssemblyKind)> {
        let location = self.type_index.get(fullname)?;
        let assembly = &self.assemblies[location.assembly];
        Some((&assembly.raw.types[location.type_index], assembly.kind))
    }

    fn locate_type(&mut self, fullname: &str) -> Option<TypeLocation> {
        if let Some(location) = self.type_index.get(fullname) {
            return Some(*location);
        }
        // Follow forwarder chains with a visited guard; compilers emit
        // single hops but nothing in the format forbids chains.
        let mut seen = HashSet::new();
        let mut current = fullname.to_string();
        while seen.insert(current.clone()) {
            let forward = self.assemblies.iter().find_map(|a| {
                a.raw
                    .forwarders
                    .iter()
                    .find(|f| f.type_fullname == current)
                    .map(|f| (a.raw.name.clone(), f.target_assembly.clone()))
            });
            let Some((source_assembly, target)) = forward else {
                return None;
            };
            self.forwarding_sources
                .entry(fullname.to_string())
                .or_insert_with(|| source_assembly.clone());
            let target_index = self.by_name.get(&target)?;
            let assembly = &self.assemblies[*target_index];
            if let Some(type_index) = assembly
                .raw
                .types
                .iter()
                .position(|t| t.fullname() == current)
            {
                let location = TypeLocation {
                    assembly: *target_index,
                    type_index,
                };
                self.type_index.insert(fullname.to_string(), location);
                return Some(location);
            }
            // The target may forward again.
        }
        None
    }

    pub fn forwarding_source_of(&self, fullname: &str) -> Option<&str> {
        self.forwarding_sources.get(fullname).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::model::{AssemblyRef, TypeForwarder};
    use crate::metadata::reader::MemorySource;

    fn assembly_with_types(name: &str, types: &[&str]) -> RawAssembly {
        let mut raw = RawAssembly::new(name);
        for t in types {
            raw.types.push(RawType::new("", *t));
        }
        raw
    }

    fn reference(name: &str) -> AssemblyRef {
        AssemblyRef {
            name: name.into(),
            version: None,
        }
    }

    #[test]
    fn transitive_references_load_and_classify() {
        let mut app = assembly_with_types("App", &["Program"]);
        app.references.push(reference("Lib"));
        let mut lib = assembly_with_types("Lib", &["Helper"]);
        lib.references.push(reference("System.Runtime"));
        let bcl = assembly_with_types("System.Runtime", &["System.Object"]);

        let mut source = MemorySource::new();
        source.add(app).add(lib).add(bcl);

        let set = AssemblySet::load(
            &source,
            Path::new("/proj/App.dll"),
            &LoadOptions::default(),
        )
        .unwrap();

        assert_eq!(set.assemblies().len(), 3);
        assert_eq!(set.entry_assembly().kind, AssemblyKind::User);
        assert_eq!(set.by_name("Lib").unwrap().kind, AssemblyKind::ThirdParty);
        assert_eq!(
            set.by_name("System.Runtime").unwrap().kind,
            AssemblyKind::RuntimeProvided
        );
        assert!(set.find_type("Helper").is_some());
    }

    #[test]
    fn missing_reference_is_a_warning_not_a_failure() {
        let mut app = assembly_with_types("App", &["Program"]);
        app.references.push(reference("Gone"));
        let mut source = MemorySource::new();
        source.add(app);

        let set = AssemblySet::load(
            &source,
            Path::new("/proj/App.dll"),
            &LoadOptions::default(),
        )
        .unwrap();
        assert_eq!(set.unresolved_references(), &["Gone".to_string()]);
        assert!(!set.diagnostics.has_errors());
        assert_eq!(set.diagnostics.warnings().count(), 1);
    }

    #[test]
    fn reference_cycles_are_reported_but_loaded() {
        let mut a = assembly_with_types("A", &["TA"]);
        a.references.push(reference("B"));
        let mut b = assembly_with_types("B", &["TB"]);
        b.references.push(reference("A"));
        let mut source = MemorySource::new();
        source.add(a).add(b);

        let set =
            AssemblySet::load(&source, Path::new("/x/A.dll"), &LoadOptions::default()).unwrap();
        assert_eq!(set.assemblies().len(), 2);
        assert!(set
            .diagnostics
            .warnings()
            .any(|d| d.code == DiagnosticCode::ReferenceCycle));
    }

    #[test]
    fn forwarded_types_resolve_and_remember_the_source() {
        let mut app = assembly_with_types("App", &["Program"]);
        app.references.push(reference("Facade"));
        let mut facade = assembly_with_types("Facade", &[]);
        facade.references.push(reference("Impl"));
        facade.forwarders.push(TypeForwarder {
            type_fullname: "Shared.Thing".into(),
            target_assembly: "Impl".into(),
        });
        let impl_asm = assembly_with_types("Impl", &["Shared.Thing"]);

        let mut source = MemorySource::new();
        source.add(app).add(facade).add(impl_asm);

        let mut set =
            AssemblySet::load(&source, Path::new("/x/App.dll"), &LoadOptions::default()).unwrap();

        // Wipe the direct index entry to force the forwarder path.
        set.type_index.remove("Shared.Thing");
        let (ty, _) = set.resolve_type("Shared.Thing").expect("forwarded type");
        assert_eq!(ty.fullname(), "Shared.Thing");
        assert_eq!(set.forwarding_source_of("Shared.Thing"), Some("Facade"));
    }
}
