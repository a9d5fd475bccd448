//! Shared builders for pipeline tests: assemble in-memory assemblies and
//! run them through the whole compiler.

use std::path::Path;

use cil2cpp::compiler::{BuildOutcome, Compiler};
use cil2cpp::config::BuildConfig;
use cil2cpp::ir::InstKind;
use cil2cpp::metadata::cil::{CilInst, CilOp};
use cil2cpp::metadata::model::*;
use cil2cpp::metadata::reader::MemorySource;

pub fn void_sig(params: Vec<(&str, &str)>) -> MethodSig {
    sig("System.Void", params)
}

pub fn sig(return_type: &str, params: Vec<(&str, &str)>) -> MethodSig {
    MethodSig {
        has_this: true,
        return_type: return_type.into(),
        params: params
            .into_iter()
            .map(|(name, ty)| RawParam {
                name: Some(name.into()),
                param_type: ty.into(),
            })
            .collect(),
    }
}

pub fn static_sig(return_type: &str, params: Vec<(&str, &str)>) -> MethodSig {
    let mut s = sig(return_type, params);
    s.has_this = false;
    s
}

/// Sequential offsets, one per op.
pub fn body(ops: Vec<CilOp>) -> RawBody {
    RawBody {
        ops: ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| CilInst::new(i as u32, op))
            .collect(),
        ..Default::default()
    }
}

pub fn method(name: &str, signature: MethodSig, ops: Vec<CilOp>) -> RawMethod {
    let mut m = RawMethod::new(name, signature);
    m.flags |= MethodFlags::PUBLIC;
    if !m.sig.has_this {
        m.flags |= MethodFlags::STATIC;
    }
    m.body = Some(body(ops));
    m
}

pub fn virtual_method(name: &str, signature: MethodSig, newslot: bool, ops: Vec<CilOp>) -> RawMethod {
    let mut m = method(name, signature, ops);
    m.flags |= MethodFlags::VIRTUAL;
    if newslot {
        m.flags |= MethodFlags::NEW_SLOT;
    }
    m
}

pub fn call_ref(owner: &str, name: &str, params: Vec<&str>, return_type: &str) -> MethodRef {
    MethodRef {
        owner: owner.into(),
        name: name.into(),
        has_this: true,
        return_type: return_type.into(),
        params: params.into_iter().map(String::from).collect(),
        generic_args: vec![],
    }
}

pub fn static_ref(owner: &str, name: &str, params: Vec<&str>, return_type: &str) -> MethodRef {
    let mut m = call_ref(owner, name, params, return_type);
    m.has_this = false;
    m
}

pub fn field_ref(owner: &str, name: &str, ty: &str) -> FieldRef {
    FieldRef {
        owner: owner.into(),
        name: name.into(),
        field_type: ty.into(),
    }
}

pub fn entry_assembly(name: &str, entry_type: &str, types: Vec<RawType>) -> RawAssembly {
    let mut assembly = RawAssembly::new(name);
    assembly.entry_point = Some(EntryPointRef {
        type_fullname: entry_type.into(),
        method_name: "Main".into(),
    });
    assembly.types = types;
    assembly
}

pub fn compile(assembly: RawAssembly, config: BuildConfig) -> BuildOutcome {
    let name = assembly.name.clone();
    let mut source = MemorySource::new();
    source.add(assembly);
    Compiler::new(config)
        .with_source(Box::new(source))
        .compile(Path::new(&format!("/virtual/{name}.dll")))
        .expect("compilation should succeed")
}

/// All instruction kinds of a method, flattened in block order.
pub fn all_insts(method: &cil2cpp::ir::IrMethod) -> Vec<&InstKind> {
    method
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter().map(|i| &i.kind))
        .collect()
}

/// Assert `predicates` match some subsequence of the method body, in order.
pub fn assert_ordered_subsequence(
    method: &cil2cpp::ir::IrMethod,
    predicates: &[(&str, &dyn Fn(&InstKind) -> bool)],
) {
    let insts = all_insts(method);
    let mut position = 0usize;
    for (label, predicate) in predicates {
        let found = insts[position..].iter().position(|kind| predicate(*kind));
        match found {
            Some(offset) => position += offset + 1,
            None => panic!(
                "instruction '{label}' not found in order; body:\n{}",
                insts
                    .iter()
                    .map(|k| format!("{k:?}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        }
    }
}
