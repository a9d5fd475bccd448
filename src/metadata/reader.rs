//! Assembly readers.
//!
//! [`MetadataSource`] is the seam between the pipeline and the on-disk
//! format: the compiler only ever asks a source for `RawAssembly` values.
//! [`DotscopeSource`] maps ECMA-335 PE images through the `dotscope`
//! object model; [`MemorySource`] serves pre-built models and is what the
//! test suites drive the pipeline with.
//!
//! Token resolution is best-effort: a call-site operand that
//! cannot be resolved does not abort the load. The affected method records
//! a body error and the safety-net gate later turns it into a stub, which
//! keeps a single exotic BCL method from blocking whole-program builds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dotscope::metadata::cilobject::CilObject;
use dotscope::prelude as ds;
use log::{debug, warn};

use crate::error::{CompileError, Result};

use super::cil::{CilInst, CilOp, OperandValue};
use super::model::{
    AssemblyRef, ConstantValue, CustomAttribute, EhClause, EhKind, EntryPointRef, FieldFlags,
    FieldRef, GenericParam, LocalVar, MethodFlags, MethodImplFlags, MethodRef, MethodSig,
    PInvokeInfo, RawAssembly, RawBody, RawField, RawMethod, RawParam, RawType, TokenRef,
    TypeFlags, TypeForwarder, Variance,
};
use super::pdb;
use super::sig::{self, GenericScope};

/// Loads assemblies for the assembly-set builder.
pub trait MetadataSource {
    /// Load the assembly at `path`.
    fn load_path(&self, path: &Path, read_debug: bool) -> Result<RawAssembly>;

    /// Probe for a referenced assembly by simple name. `Ok(None)` means the
    /// reference stayed unresolved after all probing directories.
    fn resolve_reference(
        &self,
        name: &str,
        probe_dirs: &[PathBuf],
        read_debug: bool,
    ) -> Result<Option<RawAssembly>>;
}

/// In-memory source backed by pre-built [`RawAssembly`] models.
#[derive(Debug, Default)]
pub struct MemorySource {
    assemblies: HashMap<String, RawAssembly>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, assembly: RawAssembly) -> &mut Self {
        self.assemblies.insert(assembly.name.clone(), assembly);
        self
    }
}

impl MetadataSource for MemorySource {
    fn load_path(&self, path: &Path, _read_debug: bool) -> Result<RawAssembly> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        self.assemblies.get(stem).cloned().ok_or_else(|| {
            CompileError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no in-memory assembly named '{stem}'"),
            ))
        })
    }

    fn resolve_reference(
        &self,
        name: &str,
        _probe_dirs: &[PathBuf],
        _read_debug: bool,
    ) -> Result<Option<RawAssembly>> {
        Ok(self.assemblies.get(name).cloned())
    }
}

/// Disk-backed source over `dotscope`.
#[derive(Debug, Default)]
pub struct DotscopeSource;

impl DotscopeSource {
    pub fn new() -> Self {
        Self
    }
}

impl MetadataSource for DotscopeSource {
    fn load_path(&self, path: &Path, read_debug: bool) -> Result<RawAssembly> {
        let mut file = AssemblyFile::open(path)?;
        let assembly = file.read(read_debug)?;
        file.close();
        Ok(assembly)
    }

    fn resolve_reference(
        &self,
        name: &str,
        probe_dirs: &[PathBuf],
        read_debug: bool,
    ) -> Result<Option<RawAssembly>> {
        for dir in probe_dirs {
            for ext in ["dll", "exe"] {
                let candidate = dir.join(format!("{name}.{ext}"));
                if candidate.is_file() {
                    debug!("resolved reference '{}' at {}", name, candidate.display());
                    return self.load_path(&candidate, read_debug).map(Some);
                }
            }
        }
        Ok(None)
    }
}

/// One opened PE image. Resources release on [`close`](Self::close) (or
/// drop); closing twice is a no-op.
pub struct AssemblyFile {
    path: PathBuf,
    object: Option<CilObject>,
}

impl AssemblyFile {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CompileError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("assembly not found: {}", path.display()),
            )));
        }
        let canon = path.canonicalize()?;
        let object = CilObject::from_file(&canon).map_err(CompileError::Metadata)?;
        Ok(Self {
            path: canon,
            object: Some(object),
        })
    }

    pub fn is_open(&self) -> bool {
        self.object.is_some()
    }

    /// Release the mapped image. Idempotent.
    pub fn close(&mut self) {
        self.object = None;
    }

    pub fn read(&mut self, read_debug: bool) -> Result<RawAssembly> {
        let object = self.object.as_ref().ok_or_else(|| {
            CompileError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "assembly file already closed",
            ))
        })?;
        let mapper = Mapper::new(object, &self.path);
        mapper.map_assembly(read_debug)
    }
}

impl Drop for AssemblyFile {
    fn drop(&mut self) {
        self.close();
    }
}

// Metadata table ids used for operand resolution.
const TT_TYPE_REF: u32 = 0x01;
const TT_TYPE_DEF: u32 = 0x02;
const TT_FIELD: u32 = 0x04;
const TT_METHOD_DEF: u32 = 0x06;
const TT_MEMBER_REF: u32 = 0x0A;
const TT_TYPE_SPEC: u32 = 0x1B;
const TT_METHOD_SPEC: u32 = 0x2B;
const TT_USER_STRING: u32 = 0x70;

struct Mapper<'a> {
    obj: &'a CilObject,
    path: &'a Path,
    /// token value -> CIL full name, for TypeDef, TypeRef and TypeSpec.
    type_names: HashMap<u32, String>,
    /// MethodDef token -> call-site reference.
    method_refs: HashMap<u32, MethodRef>,
    /// Field token -> reference.
    field_refs: HashMap<u32, FieldRef>,
    /// MemberRef token -> method or field reference.
    member_refs: HashMap<u32, MemberRefEntry>,
    /// MethodSpec token -> instantiated method reference.
    method_specs: HashMap<u32, MethodRef>,
}

#[derive(Clone)]
enum MemberRefEntry {
    Method(MethodRef),
    Field(FieldRef),
}

impl<'a> Mapper<'a> {
    fn new(obj: &'a CilObject, path: &'a Path) -> Self {
        Self {
            obj,
            path,
            type_names: HashMap::new(),
            method_refs: HashMap::new(),
            field_refs: HashMap::new(),
            member_refs: HashMap::new(),
            method_specs: HashMap::new(),
        }
    }

    fn assembly_simple_name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("assembly")
            .to_string()
    }

    fn string_at(&self, index: u32) -> Option<String> {
        let heap = self.obj.strings()?;
        heap.get(index as usize).ok().map(|s| s.to_string())
    }

    fn blob_at(&self, index: u32) -> Option<Vec<u8>> {
        let heap = self.obj.blob()?;
        heap.get(index as usize).ok().map(|b| b.to_vec())
    }

    fn map_assembly(mut self, read_debug: bool) -> Result<RawAssembly> {
        let name = self.assembly_simple_name();
        debug!("mapping assembly '{}'", name);

        self.index_type_defs();
        self.index_type_refs();
        self.index_type_specs();
        self.index_members();
        self.index_member_refs();
        self.index_method_specs();

        let mut assembly = RawAssembly::new(name);
        assembly.path = Some(self.path.to_path_buf());

        let pdb_path = pdb::companion_pdb_path(self.path);
        let pdb_data = if read_debug && pdb_path.is_file() {
            match pdb::read_portable_pdb(&pdb_path) {
                Ok(data) => {
                    assembly.has_debug_symbols = true;
                    Some(data)
                }
                Err(err) => {
                    warn!("ignoring malformed pdb {}: {err}", pdb_path.display());
                    None
                }
            }
        } else {
            None
        };

        let types = self.obj.types();
        for ty in types.all_types().iter() {
            if ty.name == "<Module>" {
                continue;
            }
            assembly.types.push(self.map_type(ty, pdb_data.as_ref()));
        }

        assembly.entry_point = self.find_entry_point();
        assembly.references = self.collect_references();
        assembly.forwarders = self.collect_forwarders();
        Ok(assembly)
    }

    fn index_type_defs(&mut self) {
        let types = self.obj.types();
        for ty in types.all_types().iter() {
            let fullname = fullname_of(&ty.namespace, &ty.name);
            self.type_names.insert(ty.token.value(), fullname);
        }
    }

    fn index_type_refs(&mut self) {
        let Some(tables) = self.obj.tables() else {
            return;
        };
        let Some(table) = tables.table::<ds::TypeRefRaw>() else {
            return;
        };
        for row in table.iter() {
            let name = self.string_at(row.type_name).unwrap_or_default();
            let namespace = self.string_at(row.type_namespace).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            self.type_names
                .insert(row.token.value(), fullname_of(&namespace, &name));
        }
    }

    fn index_type_specs(&mut self) {
        let Some(tables) = self.obj.tables() else {
            return;
        };
        let Some(table) = tables.table::<ds::TypeSpecRaw>() else {
            return;
        };
        let lookup = {
            let names = self.type_names.clone();
            move |token: u32| names.get(&token).cloned()
        };
        for row in table.iter() {
            let Some(blob) = self.blob_at(row.signature) else {
                continue;
            };
            match sig::parse_type_spec(&blob, &lookup, GenericScope::default()) {
                Ok(rendered) => {
                    self.type_names.insert(row.token.value(), rendered);
                }
                Err(err) => warn!("skipping malformed TypeSpec: {err}"),
            }
        }
    }

    /// Build MethodDef and Field token maps from the loaded types.
    fn index_members(&mut self) {
        let types = self.obj.types();
        for ty in types.all_types().iter() {
            let owner = fullname_of(&ty.namespace, &ty.name);
            let type_params: Vec<String> = ty
                .generic_params
                .iter()
                .map(|(_, p)| p.name.clone())
                .collect();
            for (_, method_ref) in ty.methods.iter() {
                let Some(method) = method_ref.upgrade() else {
                    continue;
                };
                let method_params: Vec<String> = method
                    .generic_params
                    .iter()
                    .map(|(_, p)| p.name.clone())
                    .collect();
                let scope = GenericScope {
                    type_params: &type_params,
                    method_params: &method_params,
                };
                let parsed = self.parse_method_def_sig(method.token.value(), scope);
                let (has_this, return_type, params) = match parsed {
                    Some(p) => (p.has_this, p.return_type, p.params),
                    None => (true, "System.Object".to_string(), Vec::new()),
                };
                self.method_refs.insert(
                    method.token.value(),
                    MethodRef {
                        owner: owner.clone(),
                        name: method.name.clone(),
                        has_this,
                        return_type,
                        params,
                        generic_args: Vec::new(),
                    },
                );
            }
            for (_, field) in ty.fields.iter() {
                let scope = GenericScope {
                    type_params: &type_params,
                    method_params: &[],
                };
                let field_type = self
                    .parse_field_def_sig(field.token.value(), scope)
                    .unwrap_or_else(|| "System.Object".to_string());
                self.field_refs.insert(
                    field.token.value(),
                    FieldRef {
                        owner: owner.clone(),
                        name: field.name.clone(),
                        field_type,
                    },
                );
            }
        }
    }

    fn parse_method_def_sig(
        &self,
        token: u32,
        scope: GenericScope<'_>,
    ) -> Option<sig::ParsedMethodSig> {
        let tables = self.obj.tables()?;
        let table = tables.table::<ds::MethodDefRaw>()?;
        let row = table.get(token & 0x00FF_FFFF)?;
        let blob = self.blob_at(row.signature)?;
        let lookup = |tok: u32| self.type_names.get(&tok).cloned();
        sig::parse_method_sig(&blob, &lookup, scope).ok()
    }

    fn parse_field_def_sig(&self, token: u32, scope: GenericScope<'_>) -> Option<String> {
        let tables = self.obj.tables()?;
        let table = tables.table::<ds::FieldRaw>()?;
        let row = table.get(token & 0x00FF_FFFF)?;
        let blob = self.blob_at(row.signature)?;
        let lookup = |tok: u32| self.type_names.get(&tok).cloned();
        sig::parse_field_sig(&blob, &lookup, scope).ok()
    }

    fn index_member_refs(&mut self) {
        let Some(tables) = self.obj.tables() else {
            return;
        };
        let Some(table) = tables.table::<ds::MemberRefRaw>() else {
            return;
        };
        for row in table.iter() {
            let Some(name) = self.string_at(row.name) else {
                continue;
            };
            let owner_token = row.class.token.value();
            let owner = match self.type_names.get(&owner_token) {
                Some(owner) => owner.clone(),
                None => continue,
            };
            let Some(blob) = self.blob_at(row.signature) else {
                continue;
            };
            // Generic positions in a member-ref signature index the owner's
            // instantiation when the owner is a TypeSpec.
            let owner_args = generic_args_of(&owner);
            let scope = GenericScope {
                type_params: &owner_args,
                method_params: &[],
            };
            let lookup = |tok: u32| self.type_names.get(&tok).cloned();
            let entry = if blob.first().map(|b| b & 0x0F) == Some(0x06) {
                match sig::parse_field_sig(&blob, &lookup, scope) {
                    Ok(field_type) => MemberRefEntry::Field(FieldRef {
                        owner,
                        name,
                        field_type,
                    }),
                    Err(_) => continue,
                }
            } else {
                match sig::parse_method_sig(&blob, &lookup, scope) {
                    Ok(parsed) => MemberRefEntry::Method(MethodRef {
                        owner,
                        name,
                        has_this: parsed.has_this,
                        return_type: parsed.return_type,
                        params: parsed.params,
                        generic_args: Vec::new(),
                    }),
                    Err(_) => continue,
                }
            };
            self.member_refs.insert(row.token.value(), entry);
        }
    }

    fn index_method_specs(&mut self) {
        let Some(tables) = self.obj.tables() else {
            return;
        };
        let Some(table) = tables.table::<ds::MethodSpecRaw>() else {
            return;
        };
        for row in table.iter() {
            let base_token = row.method.token.value();
            let base = match base_token >> 24 {
                TT_METHOD_DEF => self.method_refs.get(&base_token).cloned(),
                TT_MEMBER_REF => match self.member_refs.get(&base_token) {
                    Some(MemberRefEntry::Method(m)) => Some(m.clone()),
                    _ => None,
                },
                _ => None,
            };
            let Some(mut base) = base else {
                continue;
            };
            let Some(blob) = self.blob_at(row.instantiation) else {
                continue;
            };
            let lookup = |tok: u32| self.type_names.get(&tok).cloned();
            match sig::parse_method_spec_sig(&blob, &lookup, GenericScope::default()) {
                Ok(args) => {
                    base.generic_args = args;
                    self.method_specs.insert(row.token.value(), base);
                }
                Err(err) => warn!("skipping malformed MethodSpec: {err}"),
            }
        }
    }

    fn find_entry_point(&self) -> Option<EntryPointRef> {
        let token = self.obj.cor20header().entry_point_token;
        if token >> 24 != TT_METHOD_DEF {
            return None;
        }
        let method = self.method_refs.get(&token)?;
        Some(EntryPointRef {
            type_fullname: method.owner.clone(),
            method_name: method.name.clone(),
        })
    }

    fn collect_references(&self) -> Vec<AssemblyRef> {
        let mut refs = Vec::new();
        let Some(tables) = self.obj.tables() else {
            return refs;
        };
        let Some(table) = tables.table::<ds::AssemblyRefRaw>() else {
            return refs;
        };
        for row in table.iter() {
            if let Some(name) = self.string_at(row.name) {
                refs.push(AssemblyRef {
                    name,
                    version: None,
                });
            }
        }
        refs
    }

    fn collect_forwarders(&self) -> Vec<TypeForwarder> {
        // ExportedType rows flagged as forwarders (II.22.14).
        const FORWARDER_FLAG: u32 = 0x0020_0000;
        let mut forwarders = Vec::new();
        let Some(tables) = self.obj.tables() else {
            return forwarders;
        };
        let Some(table) = tables.table::<ds::ExportedTypeRaw>() else {
            return forwarders;
        };
        let assembly_names: HashMap<u32, String> = tables
            .table::<ds::AssemblyRefRaw>()
            .map(|t| {
                t.iter()
                    .filter_map(|row| {
                        self.string_at(row.name)
                            .map(|name| (row.token.value(), name))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for row in table.iter() {
            if row.flags & FORWARDER_FLAG == 0 {
                continue;
            }
            let name = self.string_at(row.name).unwrap_or_default();
            let namespace = self.string_at(row.namespace).unwrap_or_default();
            let target = assembly_names
                .get(&row.implementation.token.value())
                .cloned()
                .unwrap_or_default();
            if !name.is_empty() && !target.is_empty() {
                forwarders.push(TypeForwarder {
                    type_fullname: fullname_of(&namespace, &name),
                    target_assembly: target,
                });
            }
        }
        forwarders
    }

    /// Custom-attribute applications on any metadata entity; only the
    /// constructor's declaring type survives.
    fn custom_attributes_of(&self, parent_token: u32) -> Vec<CustomAttribute> {
        let mut attrs = Vec::new();
        let Some(tables) = self.obj.tables() else {
            return attrs;
        };
        let Some(table) = tables.table::<ds::CustomAttributeRaw>() else {
            return attrs;
        };
        for row in table.iter() {
            if row.parent.token.value() != parent_token {
                continue;
            }
            let ctor_token = row.constructor.token.value();
            let owner = match ctor_token >> 24 {
                TT_METHOD_DEF => self.method_refs.get(&ctor_token).map(|m| m.owner.clone()),
                TT_MEMBER_REF => match self.member_refs.get(&ctor_token) {
                    Some(MemberRefEntry::Method(m)) => Some(m.owner.clone()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(attribute_type) = owner {
                attrs.push(CustomAttribute {
                    attribute_type,
                    fixed_args: Vec::new(),
                });
            }
        }
        attrs
    }

    fn map_type(&self, ty: &ds::CilType, pdb_data: Option<&pdb::PdbData>) -> RawType {
        let mut raw = RawType::new(ty.namespace.clone(), ty.name.clone());
        raw.custom_attributes = self.custom_attributes_of(ty.token.value());

        let flags_bits = self.type_def_flags(ty.token.value());
        raw.flags = TypeFlags::from_bits_truncate(flags_bits);

        let base = ty.base().map(|b| fullname_of(&b.namespace, &b.name));
        raw.is_value_type = matches!(*ty.flavor(), ds::CilFlavor::ValueType)
            || base.as_deref() == Some("System.ValueType")
            || base.as_deref() == Some("System.Enum");
        raw.is_enum = base.as_deref() == Some("System.Enum");
        raw.is_delegate = matches!(
            base.as_deref(),
            Some("System.MulticastDelegate") | Some("System.Delegate")
        );
        raw.base = base;

        raw.interfaces = self.interfaces_of(ty.token.value());
        raw.generic_params = ty
            .generic_params
            .iter()
            .map(|(_, p)| GenericParam {
                name: p.name.clone(),
                variance: variance_from_flags(p.flags),
            })
            .collect();

        let type_params: Vec<String> =
            raw.generic_params.iter().map(|p| p.name.clone()).collect();

        for (_, field) in ty.fields.iter() {
            let mut raw_field = RawField::new(field.name.clone(), String::new());
            raw_field.flags = FieldFlags::from_bits_truncate(field.flags);
            let scope = GenericScope {
                type_params: &type_params,
                method_params: &[],
            };
            raw_field.field_type = self
                .parse_field_def_sig(field.token.value(), scope)
                .unwrap_or_else(|| "System.Object".to_string());
            raw_field.literal = self.constant_of(field.token.value());
            raw.fields.push(raw_field);
        }

        if raw.is_enum {
            raw.enum_underlying = raw
                .fields
                .iter()
                .find(|f| !f.is_static())
                .map(|f| f.field_type.clone());
        }

        for (_, method_ref) in ty.methods.iter() {
            let Some(method) = method_ref.upgrade() else {
                continue;
            };
            raw.methods
                .push(self.map_method(&method, &type_params, pdb_data));
        }

        raw.is_record = raw.methods.iter().any(|m| m.name == "<Clone>$");
        raw
    }

    fn type_def_flags(&self, token: u32) -> u32 {
        self.obj
            .tables()
            .and_then(|tables| tables.table::<ds::TypeDefRaw>())
            .and_then(|table| table.get(token & 0x00FF_FFFF))
            .map(|row| row.flags)
            .unwrap_or(0)
    }

    fn interfaces_of(&self, type_token: u32) -> Vec<String> {
        let mut interfaces = Vec::new();
        let Some(tables) = self.obj.tables() else {
            return interfaces;
        };
        let Some(table) = tables.table::<ds::InterfaceImplRaw>() else {
            return interfaces;
        };
        for row in table.iter() {
            if (row.class | 0x0200_0000) != type_token {
                continue;
            }
            if let Some(name) = self.type_names.get(&row.interface.token.value()) {
                interfaces.push(name.clone());
            }
        }
        interfaces
    }

    fn constant_of(&self, parent_token: u32) -> Option<ConstantValue> {
        let tables = self.obj.tables()?;
        let table = tables.table::<ds::ConstantRaw>()?;
        for row in table.iter() {
            if row.parent.token.value() != parent_token {
                continue;
            }
            let blob = self.blob_at(row.value)?;
            return decode_constant(row.base, &blob);
        }
        None
    }

    fn map_method(
        &self,
        method: &ds::Method,
        type_params: &[String],
        pdb_data: Option<&pdb::PdbData>,
    ) -> RawMethod {
        let token = method.token.value();
        let method_params: Vec<String> = method
            .generic_params
            .iter()
            .map(|(_, p)| p.name.clone())
            .collect();
        let scope = GenericScope {
            type_params,
            method_params: &method_params,
        };
        let parsed = self.parse_method_def_sig(token, scope);

        let mut param_names: Vec<(u32, Option<String>)> = method
            .params
            .iter()
            .filter(|(_, p)| p.sequence > 0)
            .map(|(_, p)| (p.sequence, p.name.clone()))
            .collect();
        param_names.sort_by_key(|(sequence, _)| *sequence);

        let (has_this, return_type, param_types) = match parsed {
            Some(p) => (p.has_this, p.return_type, p.params),
            None => (true, "System.Void".to_string(), Vec::new()),
        };
        let params = param_types
            .into_iter()
            .enumerate()
            .map(|(i, param_type)| RawParam {
                name: param_names.get(i).and_then(|(_, n)| n.clone()),
                param_type,
            })
            .collect();

        let mut raw = RawMethod::new(
            method.name.clone(),
            MethodSig {
                has_this,
                return_type,
                params,
            },
        );
        raw.generic_params = method_params;
        raw.custom_attributes = self.custom_attributes_of(token);

        let (flags, impl_flags) = self.method_def_flags(token);
        raw.flags = MethodFlags::from_bits_truncate(flags);
        raw.impl_flags = MethodImplFlags::from_bits_truncate(impl_flags);

        raw.pinvoke = self.pinvoke_of(token);
        raw.explicit_overrides = self.explicit_overrides_of(token);

        if let Some(data) = pdb_data {
            let rid = token & 0x00FF_FFFF;
            raw.sequence_points = data.sequence_points_for(rid);
        }

        if !raw.is_abstract() && raw.pinvoke.is_none() && !raw.is_internal_call() {
            match self.map_body(method, type_params) {
                Ok(Some(body)) => raw.body = Some(body),
                Ok(None) => {}
                Err(detail) => {
                    debug!("body of {} not lowered: {detail}", method.name);
                    raw.body_error = Some(detail);
                }
            }
        }
        raw
    }

    fn method_def_flags(&self, token: u32) -> (u32, u32) {
        self.obj
            .tables()
            .and_then(|tables| tables.table::<ds::MethodDefRaw>())
            .and_then(|table| table.get(token & 0x00FF_FFFF))
            .map(|row| (row.flags, row.impl_flags))
            .unwrap_or((0, 0))
    }

    fn pinvoke_of(&self, method_token: u32) -> Option<PInvokeInfo> {
        let tables = self.obj.tables()?;
        let table = tables.table::<ds::ImplMapRaw>()?;
        for row in table.iter() {
            if row.member_forwarded.token.value() != method_token {
                continue;
            }
            let entry_point = self.string_at(row.import_name).unwrap_or_default();
            let module = tables
                .table::<ds::ModuleRefRaw>()
                .and_then(|t| t.get(row.import_scope))
                .and_then(|module_row| self.string_at(module_row.name))
                .unwrap_or_default();
            return Some(PInvokeInfo {
                module,
                entry_point,
                calling_convention: calling_convention_name(row.mapping_flags),
                charset: charset_name(row.mapping_flags),
                set_last_error: row.mapping_flags & 0x0040 != 0,
            });
        }
        None
    }

    fn explicit_overrides_of(&self, method_token: u32) -> Vec<super::model::ExplicitOverride> {
        let mut overrides = Vec::new();
        let Some(tables) = self.obj.tables() else {
            return overrides;
        };
        let Some(table) = tables.table::<ds::MethodImplRaw>() else {
            return overrides;
        };
        for row in table.iter() {
            if row.method_body.token.value() != method_token {
                continue;
            }
            let declaration = row.method_declaration.token.value();
            let declared = match declaration >> 24 {
                TT_METHOD_DEF => self.method_refs.get(&declaration).cloned(),
                TT_MEMBER_REF => match self.member_refs.get(&declaration) {
                    Some(MemberRefEntry::Method(m)) => Some(m.clone()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(declared) = declared {
                overrides.push(super::model::ExplicitOverride {
                    interface_type: declared.owner,
                    method_name: declared.name,
                });
            }
        }
        overrides
    }

    fn map_body(
        &self,
        method: &ds::Method,
        type_params: &[String],
    ) -> std::result::Result<Option<RawBody>, String> {
        let Some(body) = method.body.get() else {
            return Ok(None);
        };

        let mut raw = RawBody {
            max_stack: body.max_stack as u16,
            init_locals: true,
            locals: self.locals_of(body.local_var_sig_token, type_params),
            ops: Vec::new(),
            eh: Vec::new(),
        };

        for handler in &body.exception_handlers {
            raw.eh.push(self.map_eh_clause(handler));
        }

        let mut blocks: Vec<_> = method.blocks().collect();
        blocks.sort_by_key(|(offset, _)| *offset);
        for (_, block) in blocks {
            for ins in &block.instructions {
                let offset = ins.offset as u32;
                let op = self
                    .map_instruction(ins)
                    .map_err(|detail| format!("at IL_{offset:04x}: {detail}"))?;
                raw.ops.push(CilInst::new(offset, op));
            }
        }
        raw.ops.sort_by_key(|i| i.offset);
        Ok(Some(raw))
    }

    fn locals_of(&self, sig_token: u32, type_params: &[String]) -> Vec<LocalVar> {
        if sig_token == 0 {
            return Vec::new();
        }
        let Some(tables) = self.obj.tables() else {
            return Vec::new();
        };
        let Some(table) = tables.table::<ds::StandAloneSigRaw>() else {
            return Vec::new();
        };
        let Some(row) = table.get(sig_token & 0x00FF_FFFF) else {
            return Vec::new();
        };
        let Some(blob) = self.blob_at(row.signature) else {
            return Vec::new();
        };
        let lookup = |tok: u32| self.type_names.get(&tok).cloned();
        let scope = GenericScope {
            type_params,
            method_params: &[],
        };
        match sig::parse_local_var_sig(&blob, &lookup, scope) {
            Ok(types) => types
                .into_iter()
                .map(|local_type| LocalVar {
                    name: None,
                    local_type,
                })
                .collect(),
            Err(err) => {
                warn!("malformed local-var signature: {err}");
                Vec::new()
            }
        }
    }

    fn map_eh_clause(&self, handler: &ds::ExceptionHandler) -> EhClause {
        let kind = match handler.flags {
            ds::ExceptionHandlerFlags::FILTER => EhKind::Filter {
                filter_offset: handler.filter_offset,
            },
            ds::ExceptionHandlerFlags::FINALLY => EhKind::Finally,
            ds::ExceptionHandlerFlags::FAULT => EhKind::Fault,
            _ => EhKind::Catch {
                catch_type: handler
                    .handler
                    .as_ref()
                    .and_then(|ty| self.type_names.get(&ty.token.value()).cloned())
                    .unwrap_or_else(|| "System.Object".to_string()),
            },
        };
        EhClause {
            kind,
            try_offset: handler.try_offset,
            try_length: handler.try_length,
            handler_offset: handler.handler_offset,
            handler_length: handler.handler_length,
        }
    }

    fn map_instruction(&self, ins: &ds::Instruction) -> std::result::Result<CilOp, String> {
        let operand = self.map_operand(ins)?;
        CilOp::from_mnemonic(ins.mnemonic, operand).map_err(|e| e.to_string())
    }

    fn map_operand(&self, ins: &ds::Instruction) -> std::result::Result<OperandValue, String> {
        let mnemonic = ins.mnemonic;
        let value = match &ins.operand {
            ds::Operand::None => OperandValue::None,
            ds::Operand::Target(target) => OperandValue::Target(*target as u32),
            ds::Operand::Switch(targets) => {
                OperandValue::Switch(targets.iter().map(|t| *t as u32).collect())
            }
            ds::Operand::Local(index) => OperandValue::Var(*index),
            ds::Operand::Argument(index) => OperandValue::Var(*index),
            ds::Operand::Immediate(immediate) => map_immediate(immediate),
            ds::Operand::Token(token) => self.resolve_token_operand(mnemonic, token.value())?,
            _ => OperandValue::None,
        };
        Ok(value)
    }

    fn resolve_token_operand(
        &self,
        mnemonic: &str,
        token: u32,
    ) -> std::result::Result<OperandValue, String> {
        let table = token >> 24;
        if table == TT_USER_STRING {
            return self
                .user_string(token)
                .map(OperandValue::Str)
                .ok_or_else(|| format!("unresolved user string {token:#010x}"));
        }
        match mnemonic {
            "call" | "callvirt" | "newobj" | "jmp" | "ldftn" | "ldvirtftn" => self
                .method_of_token(token)
                .map(OperandValue::Method)
                .ok_or_else(|| format!("unresolved method token {token:#010x}")),
            "ldfld" | "ldflda" | "stfld" | "ldsfld" | "ldsflda" | "stsfld" => self
                .field_of_token(token)
                .map(OperandValue::Field)
                .ok_or_else(|| format!("unresolved field token {token:#010x}")),
            "ldtoken" => self
                .any_of_token(token)
                .map(OperandValue::Token)
                .ok_or_else(|| format!("unresolved token {token:#010x}")),
            "calli" => Err("calli through token signatures is not modeled".to_string()),
            _ => self
                .type_names
                .get(&token)
                .cloned()
                .map(OperandValue::Type)
                .ok_or_else(|| format!("unresolved type token {token:#010x}")),
        }
    }

    fn user_string(&self, token: u32) -> Option<String> {
        let heap = self.obj.userstrings()?;
        heap.get((token & 0x00FF_FFFF) as usize)
            .ok()
            .map(|s| s.to_string_lossy())
    }

    fn method_of_token(&self, token: u32) -> Option<MethodRef> {
        match token >> 24 {
            TT_METHOD_DEF => self.method_refs.get(&token).cloned(),
            TT_MEMBER_REF => match self.member_refs.get(&token)? {
                MemberRefEntry::Method(m) => Some(m.clone()),
                MemberRefEntry::Field(_) => None,
            },
            TT_METHOD_SPEC => self.method_specs.get(&token).cloned(),
            _ => None,
        }
    }

    fn field_of_token(&self, token: u32) -> Option<FieldRef> {
        match token >> 24 {
            TT_FIELD => self.field_refs.get(&token).cloned(),
            TT_MEMBER_REF => match self.member_refs.get(&token)? {
                MemberRefEntry::Field(f) => Some(f.clone()),
                MemberRefEntry::Method(_) => None,
            },
            _ => None,
        }
    }

    fn any_of_token(&self, token: u32) -> Option<TokenRef> {
        match token >> 24 {
            TT_TYPE_DEF | TT_TYPE_REF | TT_TYPE_SPEC => {
                self.type_names.get(&token).cloned().map(TokenRef::Type)
            }
            TT_METHOD_DEF | TT_METHOD_SPEC => self.method_of_token(token).map(TokenRef::Method),
            TT_FIELD => self.field_of_token(token).map(TokenRef::Field),
            TT_MEMBER_REF => match self.member_refs.get(&token)? {
                MemberRefEntry::Method(m) => Some(TokenRef::Method(m.clone())),
                MemberRefEntry::Field(f) => Some(TokenRef::Field(f.clone())),
            },
            _ => None,
        }
    }
}

fn fullname_of(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Extract the rendered argument list of `Open`1<A,B>`, used as the generic
/// scope when parsing member-ref signatures against an instantiated owner.
fn generic_args_of(owner: &str) -> Vec<String> {
    let Some(open) = owner.find('<') else {
        return Vec::new();
    };
    let inner = &owner[open + 1..owner.len().saturating_sub(1)];
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(inner[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < inner.len() {
        args.push(inner[start..].to_string());
    }
    args
}

fn variance_from_flags(flags: u32) -> Variance {
    match flags & 0x0003 {
        0x0001 => Variance::Covariant,
        0x0002 => Variance::Contravariant,
        _ => Variance::Invariant,
    }
}

fn calling_convention_name(mapping_flags: u32) -> String {
    match mapping_flags & 0x0700 {
        0x0200 => "cdecl",
        0x0300 => "stdcall",
        0x0400 => "thiscall",
        0x0500 => "fastcall",
        _ => "winapi",
    }
    .to_string()
}

fn charset_name(mapping_flags: u32) -> String {
    match mapping_flags & 0x0006 {
        0x0002 => "ansi",
        0x0004 => "unicode",
        0x0006 => "auto",
        _ => "none",
    }
    .to_string()
}

fn decode_constant(c_type: u8, blob: &[u8]) -> Option<ConstantValue> {
    let value = match c_type {
        0x02 => ConstantValue::Bool(*blob.first()? != 0),
        0x03 => ConstantValue::Char(u16::from_le_bytes([*blob.first()?, *blob.get(1)?])),
        0x04 => ConstantValue::I1(*blob.first()? as i8),
        0x05 => ConstantValue::U1(*blob.first()?),
        0x06 => ConstantValue::I2(i16::from_le_bytes(blob.get(..2)?.try_into().ok()?)),
        0x07 => ConstantValue::U2(u16::from_le_bytes(blob.get(..2)?.try_into().ok()?)),
        0x08 => ConstantValue::I4(i32::from_le_bytes(blob.get(..4)?.try_into().ok()?)),
        0x09 => ConstantValue::U4(u32::from_le_bytes(blob.get(..4)?.try_into().ok()?)),
        0x0a => ConstantValue::I8(i64::from_le_bytes(blob.get(..8)?.try_into().ok()?)),
        0x0b => ConstantValue::U8(u64::from_le_bytes(blob.get(..8)?.try_into().ok()?)),
        0x0c => ConstantValue::R4(f32::from_le_bytes(blob.get(..4)?.try_into().ok()?)),
        0x0d => ConstantValue::R8(f64::from_le_bytes(blob.get(..8)?.try_into().ok()?)),
        0x0e => {
            let units: Vec<u16> = blob
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            ConstantValue::Str(String::from_utf16_lossy(&units))
        }
        0x12 => ConstantValue::Null,
        _ => return None,
    };
    Some(value)
}

fn map_immediate(immediate: &ds::Immediate) -> OperandValue {
    match immediate {
        ds::Immediate::Int8(v) => OperandValue::I32(i32::from(*v)),
        ds::Immediate::UInt8(v) => OperandValue::Byte(*v),
        ds::Immediate::Int16(v) => OperandValue::I32(i32::from(*v)),
        ds::Immediate::UInt16(v) => OperandValue::Var(*v),
        ds::Immediate::Int32(v) => OperandValue::I32(*v),
        ds::Immediate::UInt32(v) => OperandValue::I32(*v as i32),
        ds::Immediate::Int64(v) => OperandValue::I64(*v),
        ds::Immediate::UInt64(v) => OperandValue::I64(*v as i64),
        ds::Immediate::Float32(v) => OperandValue::R4(*v),
        ds::Immediate::Float64(v) => OperandValue::R8(*v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_resolves_by_name() {
        let mut source = MemorySource::new();
        source.add(RawAssembly::new("App"));
        let found = source
            .resolve_reference("App", &[], false)
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "App");
        assert!(source.resolve_reference("Missing", &[], false).unwrap().is_none());
    }

    #[test]
    fn memory_source_load_path_uses_the_stem() {
        let mut source = MemorySource::new();
        source.add(RawAssembly::new("App"));
        assert!(source.load_path(Path::new("/tmp/App.dll"), false).is_ok());
        assert!(matches!(
            source.load_path(Path::new("/tmp/Other.dll"), false),
            Err(CompileError::Io(_))
        ));
    }

    #[test]
    fn opening_a_missing_path_is_an_io_error() {
        match AssemblyFile::open(Path::new("/definitely/not/here.dll")) {
            Err(CompileError::Io(_)) => {}
            other => panic!("expected io error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn generic_owner_args_split_at_top_level() {
        assert_eq!(
            generic_args_of("Dict`2<System.String,List`1<System.Int32>>"),
            vec!["System.String".to_string(), "List`1<System.Int32>".to_string()]
        );
        assert!(generic_args_of("Plain").is_empty());
    }

    #[test]
    fn pinvoke_flag_decoding() {
        assert_eq!(calling_convention_name(0x0200), "cdecl");
        assert_eq!(charset_name(0x0004), "unicode");
        assert!(super::decode_constant(0x08, &5i32.to_le_bytes()).is_some());
    }
}
