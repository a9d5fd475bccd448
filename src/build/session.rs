//! Per-build state shared by the passes.

use std::collections::HashMap;

use crate::assemblies::{AssemblyKind, AssemblySet};
use crate::config::BuildConfig;
use crate::diagnostics::DiagnosticCollection;
use crate::ir::Module;
use crate::metadata::model::RawType;
use crate::naming::NameMapper;
use crate::reach::{MethodId, Reachability};

pub struct BuildSession<'a> {
    pub set: &'a AssemblySet,
    pub reach: &'a Reachability,
    pub config: &'a BuildConfig,
    pub module: Module,
    pub names: NameMapper,
    pub diagnostics: DiagnosticCollection,
    /// Generic-method instantiations queued by pass 4 for pass 7:
    /// (owner type canonical name, method index in the IrType).
    pub generic_method_instances: Vec<(String, usize)>,
    /// Method-index map from (type, source_index) at shell-creation time,
    /// so later passes can find the IR method for a reachable MethodId.
    method_index: HashMap<(String, usize), usize>,
}

impl<'a> BuildSession<'a> {
    pub fn new(set: &'a AssemblySet, reach: &'a Reachability, config: &'a BuildConfig) -> Self {
        Self {
            set,
            reach,
            config,
            module: Module::new(),
            names: NameMapper::new(),
            diagnostics: DiagnosticCollection::new(),
            generic_method_instances: Vec::new(),
            method_index: HashMap::new(),
        }
    }

    pub fn raw_type(&self, fullname: &str) -> Option<&RawType> {
        self.set.find_type(fullname).map(|(t, _)| t)
    }

    pub fn raw_type_kind(&self, fullname: &str) -> Option<AssemblyKind> {
        self.set.find_type(fullname).map(|(_, k)| k)
    }

    /// Reachable methods of a type, as (source index into RawType.methods).
    pub fn reachable_method_indices(&self, fullname: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .reach
            .methods_of(fullname)
            .iter()
            .map(|id| id.method_index)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    pub fn record_method_index(&mut self, type_name: &str, source_index: usize, ir_index: usize) {
        self.method_index
            .insert((type_name.to_string(), source_index), ir_index);
    }

    pub fn ir_method_index(&self, id: &MethodId) -> Option<usize> {
        self.method_index
            .get(&(id.type_fullname.clone(), id.method_index))
            .copied()
    }

    /// Rendered target-language type for a CIL type-name.
    ///
    /// Scalars map through the primitive table; value types render by
    /// mangled name, reference types as pointers. Arrays map to the
    /// runtime's array object, byrefs and pointers to raw pointers of the
    /// element rendering.
    pub fn target_type(&mut self, cil_name: &str) -> String {
        if cil_name == "System.Void" {
            return "void".into();
        }
        if let Some(info) = Module::primitive_info(cil_name) {
            return info.scalar;
        }
        if cil_name.ends_with("[]") {
            return "cil2cpp::Array*".into();
        }
        if cil_name.ends_with(']') {
            // Multi-dimensional arrays route through the runtime MdArray.
            return "cil2cpp::MdArray*".into();
        }
        if let Some(element) = cil_name.strip_suffix('&').or_else(|| cil_name.strip_suffix('*')) {
            let inner = self.target_type(element);
            return format!("{inner}*");
        }
        if cil_name == "System.String" {
            return "cil2cpp::String*".into();
        }
        if cil_name == "System.Object" {
            return "cil2cpp::Object*".into();
        }
        // Enums render as their underlying scalar.
        let underlying = self
            .module
            .find_type(cil_name)
            .filter(|t| t.is_enum)
            .and_then(|t| t.enum_underlying.clone())
            .or_else(|| {
                self.raw_type(cil_name)
                    .filter(|t| t.is_enum)
                    .and_then(|t| t.enum_underlying.clone())
            });
        if let Some(underlying) = underlying {
            return self.target_type(&underlying);
        }
        let mangled = self.names.mangle_type(cil_name);
        let is_value = self
            .module
            .find_type(cil_name)
            .map(|t| t.is_value_type)
            .or_else(|| self.raw_type(cil_name).map(|t| t.is_value_type))
            .unwrap_or(false);
        if is_value {
            mangled
        } else {
            format!("{mangled}*")
        }
    }

    /// Hand the finished module to the caller; the session dissolves.
    pub fn finish(self) -> (Module, DiagnosticCollection) {
        (self.module, self.diagnostics)
    }
}
