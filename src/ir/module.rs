//! The module: every type the build emits, plus the interning tables the
//! emitter reads (string literals, array-initializer blobs, primitive
//! scalar names).

use std::collections::HashMap;

use serde::Serialize;

use super::method::IrMethod;
use super::types::IrType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StringLiteral {
    pub id: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArrayInitBlob {
    pub id: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrimitiveInfo {
    pub mangled: String,
    pub scalar: String,
}

/// Primitive CIL type -> `{mangled, target scalar}`. Static data consulted
/// by the builder and exposed through the module handle.
pub const PRIMITIVE_TYPES: &[(&str, &str, &str)] = &[
    ("System.Void", "System_Void", "void"),
    ("System.Boolean", "System_Boolean", "bool"),
    ("System.Char", "System_Char", "char16_t"),
    ("System.SByte", "System_SByte", "int8_t"),
    ("System.Byte", "System_Byte", "uint8_t"),
    ("System.Int16", "System_Int16", "int16_t"),
    ("System.UInt16", "System_UInt16", "uint16_t"),
    ("System.Int32", "System_Int32", "int32_t"),
    ("System.UInt32", "System_UInt32", "uint32_t"),
    ("System.Int64", "System_Int64", "int64_t"),
    ("System.UInt64", "System_UInt64", "uint64_t"),
    ("System.Single", "System_Single", "float"),
    ("System.Double", "System_Double", "double"),
    ("System.IntPtr", "System_IntPtr", "intptr_t"),
    ("System.UIntPtr", "System_UIntPtr", "uintptr_t"),
];

#[derive(Debug, Default, Serialize)]
pub struct Module {
    types: Vec<IrType>,
    #[serde(skip)]
    type_index: HashMap<String, usize>,
    /// Entry point as (type canonical name, method index).
    pub entry_point: Option<(String, usize)>,
    strings: Vec<StringLiteral>,
    #[serde(skip)]
    string_index: HashMap<String, usize>,
    blobs: Vec<ArrayInitBlob>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- types ----------------------------------------------------------

    pub fn add_type(&mut self, ty: IrType) {
        let name = ty.cil_name.clone();
        let index = self.types.len();
        self.types.push(ty);
        self.type_index.entry(name).or_insert(index);
    }

    pub fn types(&self) -> &[IrType] {
        &self.types
    }

    pub fn find_type(&self, fullname: &str) -> Option<&IrType> {
        self.type_index.get(fullname).map(|&i| &self.types[i])
    }

    pub fn find_type_mut(&mut self, fullname: &str) -> Option<&mut IrType> {
        let index = *self.type_index.get(fullname)?;
        Some(&mut self.types[index])
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|t| t.cil_name.as_str())
    }

    /// Apply `f` to every type in insertion order, with mutable access.
    pub fn for_each_type_mut(&mut self, mut f: impl FnMut(&mut IrType)) {
        for ty in &mut self.types {
            f(ty);
        }
    }

    pub fn all_methods(&self) -> impl Iterator<Item = &IrMethod> {
        self.types.iter().flat_map(|t| t.methods.iter())
    }

    pub fn entry_method(&self) -> Option<&IrMethod> {
        let (type_name, index) = self.entry_point.as_ref()?;
        self.find_type(type_name)?.methods.get(*index)
    }

    // ---- interning ------------------------------------------------------

    /// Intern a string literal; idempotent, ids assigned in insertion order
    /// as `__str_0`, `__str_1`, ...
    pub fn register_string_literal(&mut self, value: &str) -> String {
        if let Some(&index) = self.string_index.get(value) {
            return self.strings[index].id.clone();
        }
        let id = format!("__str_{}", self.strings.len());
        self.string_index.insert(value.to_string(), self.strings.len());
        self.strings.push(StringLiteral {
            id: id.clone(),
            value: value.to_string(),
        });
        id
    }

    pub fn string_literals(&self) -> &[StringLiteral] {
        &self.strings
    }

    /// Read-only id lookup for an already-interned literal.
    pub fn string_literal_id(&self, value: &str) -> Option<&str> {
        self.string_index
            .get(value)
            .map(|&i| self.strings[i].id.as_str())
    }

    /// Register an array-initializer blob; the id is `__arr_init_<k>` with
    /// k the zero-based pre-insert count. Bytes are preserved exactly.
    pub fn register_array_init_data(&mut self, bytes: &[u8]) -> String {
        let id = format!("__arr_init_{}", self.blobs.len());
        self.blobs.push(ArrayInitBlob {
            id: id.clone(),
            bytes: bytes.to_vec(),
        });
        id
    }

    pub fn array_init_blobs(&self) -> &[ArrayInitBlob] {
        &self.blobs
    }

    // ---- primitives -----------------------------------------------------

    pub fn primitive_info(fullname: &str) -> Option<PrimitiveInfo> {
        PRIMITIVE_TYPES
            .iter()
            .find(|(cil, _, _)| *cil == fullname)
            .map(|(_, mangled, scalar)| PrimitiveInfo {
                mangled: (*mangled).to_string(),
                scalar: (*scalar).to_string(),
            })
    }

    pub fn is_primitive(fullname: &str) -> bool {
        PRIMITIVE_TYPES.iter().any(|(cil, _, _)| *cil == fullname)
    }

    /// Rendered target type for a CIL type-name: scalars map through the
    /// primitive table, everything else is a pointer to the mangled struct.
    pub fn target_type_of(&self, cil_name: &str, mangled: &str) -> String {
        match Self::primitive_info(cil_name) {
            Some(info) => info.scalar,
            None => {
                if self
                    .find_type(cil_name)
                    .map(|t| t.is_value_type)
                    .unwrap_or(false)
                {
                    mangled.to_string()
                } else {
                    format!("{mangled}*")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_interning_is_idempotent_and_ordered() {
        let mut module = Module::new();
        assert_eq!(module.register_string_literal("hello"), "__str_0");
        assert_eq!(module.register_string_literal("world"), "__str_1");
        assert_eq!(module.register_string_literal("hello"), "__str_0");
        assert_eq!(module.string_literals().len(), 2);
        assert_eq!(module.string_literals()[1].value, "world");
    }

    #[test]
    fn blob_ids_use_the_pre_insert_count() {
        let mut module = Module::new();
        assert_eq!(module.register_array_init_data(&[1, 2, 3]), "__arr_init_0");
        assert_eq!(module.register_array_init_data(&[4]), "__arr_init_1");
        assert_eq!(module.array_init_blobs()[0].bytes, vec![1, 2, 3]);
    }

    #[test]
    fn primitive_table_matches_the_emitter_contract() {
        let info = Module::primitive_info("System.Int32").unwrap();
        assert_eq!(info.mangled, "System_Int32");
        assert_eq!(info.scalar, "int32_t");
        assert!(Module::primitive_info("Some.Type").is_none());
    }

    #[test]
    fn find_type_sees_inserted_types() {
        let mut module = Module::new();
        module.add_type(IrType::new("Demo.A", "Demo_A"));
        assert!(module.find_type("Demo.A").is_some());
        assert!(module.find_type("Demo.B").is_none());
    }
}
