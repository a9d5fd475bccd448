//! Pass 2: fields, base wiring, cctor detection, instance layout.
//!
//! Field lists keep metadata order; the size computation lays fields out
//! with natural alignment, widest-alignment groups first and the tightest
//! member first inside a group, after an object header for reference
//! types. Enums drop their `value__` backing field and hoist the constants
//! into typed static fields.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::diagnostics::{Diagnostic, DiagnosticCode};
use crate::ir::{IrField, Module};
use crate::metadata::model::RawType;
use crate::reach::names::substitute;

use super::session::BuildSession;
use super::BuildPass;

/// Object header bytes prepended to every reference type: v-table pointer
/// plus GC/sync word on a 64-bit target.
pub const OBJECT_HEADER_SIZE: u32 = 16;

pub struct FieldLayoutPass;

impl BuildPass for FieldLayoutPass {
    fn id(&self) -> &'static str {
        "fields-and-layout"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let type_names: Vec<String> = session.module.type_names().map(String::from).collect();
        for fullname in &type_names {
            let Some(raw) = session.raw_type(fullname).cloned() else {
                continue;
            };

            let (instance, statics) = build_fields(session, &raw, fullname, &[], &[]);
            let size = compute_instance_size(session, fullname);

            if let Some(base) = raw.base.clone() {
                if session.module.find_type(&base).is_none() && session.raw_type(&base).is_none() {
                    warn!("base type '{base}' of '{fullname}' is not loaded");
                    session.diagnostics.add(
                        Diagnostic::warning(
                            DiagnosticCode::UnresolvedReference,
                            format!("base type '{base}' of '{fullname}' was not resolved"),
                        )
                        .with_subject(fullname.clone()),
                    );
                }
            }

            let ty = session
                .module
                .find_type_mut(fullname)
                .expect("pass 1 created the shell");
            ty.fields = instance;
            ty.static_fields = statics;
            ty.instance_size = size;
            ty.has_cctor = raw.has_cctor();
        }
    }
}

/// Split raw fields into (instance, static) IR field lists, substituting
/// generic parameters when pass 4 materializes an instantiation.
pub fn build_fields(
    session: &mut BuildSession<'_>,
    raw: &RawType,
    owner: &str,
    generic_params: &[String],
    generic_args: &[String],
) -> (Vec<IrField>, Vec<IrField>) {
    let mut instance = Vec::new();
    let mut statics = Vec::new();

    for field in &raw.fields {
        // Enum backing field is layout-only; constants carry the values.
        if raw.is_enum && !field.is_static() && field.name == "value__" {
            continue;
        }
        let field_type = if generic_params.is_empty() {
            field.field_type.clone()
        } else {
            substitute(&field.field_type, generic_params, generic_args)
        };
        let field_type = if raw.is_enum && field.is_literal() {
            raw.enum_underlying.clone().unwrap_or(field_type)
        } else {
            field_type
        };
        let ir_field = IrField {
            owner: owner.to_string(),
            cil_name: field.name.clone(),
            mangled_name: session.names.mangle_field(&field.name),
            field_type,
            is_static: field.is_static() || field.is_literal(),
            attributes: field.flags.bits(),
            literal: field.literal.clone(),
            custom_attributes: field.custom_attributes.clone(),
        };
        if ir_field.is_static {
            statics.push(ir_field);
        } else {
            instance.push(ir_field);
        }
    }
    (instance, statics)
}

/// Raw definition behind a (possibly instantiated) type name, with the
/// substitution pair that maps its field types to the instance.
fn raw_with_subst(
    session: &BuildSession<'_>,
    fullname: &str,
) -> Option<(RawType, Vec<String>, Vec<String>)> {
    if let Some(raw) = session.raw_type(fullname) {
        return Some((raw.clone(), Vec::new(), Vec::new()));
    }
    let (open, args) = crate::reach::names::split_instantiation(fullname)?;
    let raw = session.raw_type(&open)?.clone();
    let params: Vec<String> = raw.generic_params.iter().map(|p| p.name.clone()).collect();
    Some((raw, params, args))
}

/// Deterministic instance size for a type already present as a raw
/// definition (possibly a generic instantiation name). Value types report
/// their struct size, reference types header plus fields.
pub fn compute_instance_size(session: &BuildSession<'_>, fullname: &str) -> u32 {
    let is_value = raw_with_subst(session, fullname)
        .map(|(raw, _, _)| raw.is_value_type)
        .unwrap_or(false);
    if is_value {
        let mut memo = HashMap::new();
        let mut visiting = HashSet::new();
        let (size, _align) = size_align_of_composite(session, fullname, &mut memo, &mut visiting);
        size
    } else {
        reference_type_size(session, fullname)
    }
}

fn primitive_size_align(fullname: &str) -> Option<(u32, u32)> {
    let size = match fullname {
        "System.Void" => 0,
        "System.Boolean" | "System.SByte" | "System.Byte" => 1,
        "System.Char" | "System.Int16" | "System.UInt16" => 2,
        "System.Int32" | "System.UInt32" | "System.Single" => 4,
        "System.Int64" | "System.UInt64" | "System.Double" | "System.IntPtr"
        | "System.UIntPtr" => 8,
        _ => return None,
    };
    Some((size, size.max(1)))
}

fn size_align_of_composite(
    session: &BuildSession<'_>,
    name: &str,
    memo: &mut HashMap<String, (u32, u32)>,
    visiting: &mut HashSet<String>,
) -> (u32, u32) {
    if let Some(found) = memo.get(name) {
        return *found;
    }
    if let Some(primitive) = primitive_size_align(name) {
        return primitive;
    }
    // References, pointers, byrefs and arrays are all pointer-sized fields.
    if name.ends_with('&') || name.ends_with('*') || name.ends_with(']') {
        return (8, 8);
    }

    let (open, params, args) = match crate::reach::names::split_instantiation(name) {
        Some((open, args)) => {
            let params = session
                .raw_type(&open)
                .map(|t| {
                    t.generic_params
                        .iter()
                        .map(|p| p.name.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            (open, params, args)
        }
        None => (name.to_string(), Vec::new(), Vec::new()),
    };

    let Some(raw) = session.raw_type(&open).cloned() else {
        // Unloaded runtime type: assume a pointer-sized slot.
        return (8, 8);
    };
    if !raw.is_value_type {
        return (8, 8);
    }
    if raw.is_enum {
        return raw
            .enum_underlying
            .as_deref()
            .and_then(primitive_size_align)
            .unwrap_or((4, 4));
    }
    if !visiting.insert(name.to_string()) {
        // Value-type cycle: illegal IL, but never loop on it.
        return (8, 8);
    }

    let mut members: Vec<(u32, u32)> = raw
        .fields
        .iter()
        .filter(|f| !f.is_static() && !f.is_literal())
        .map(|f| {
            let field_type = if params.is_empty() {
                f.field_type.clone()
            } else {
                substitute(&f.field_type, &params, &args)
            };
            size_align_of_composite(session, &field_type, memo, visiting)
        })
        .collect();
    visiting.remove(name);

    let (size, align) = pack(&mut members, 0);
    let result = (size.max(1), align);
    memo.insert(name.to_string(), result);
    result
}

/// Lay members out grouped by alignment (widest first), tightest member
/// first inside a group; returns (aligned size, struct alignment).
fn pack(members: &mut [(u32, u32)], base_offset: u32) -> (u32, u32) {
    members.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut offset = base_offset;
    let mut max_align = 1u32;
    for &mut (size, align) in members.iter_mut() {
        let align = align.max(1);
        max_align = max_align.max(align);
        offset = (offset + align - 1) / align * align;
        offset += size;
    }
    let size = (offset + max_align - 1) / max_align * max_align;
    (size, max_align)
}

/// Reference types carry the object header in front of their own fields;
/// inherited instance fields count toward the size.
pub fn reference_type_size(session: &BuildSession<'_>, fullname: &str) -> u32 {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    let mut members: Vec<(u32, u32)> = Vec::new();

    let mut current = Some(fullname.to_string());
    let mut seen = HashSet::new();
    while let Some(name) = current {
        if !seen.insert(name.clone()) {
            break;
        }
        let Some((raw, params, args)) = raw_with_subst(session, &name) else {
            break;
        };
        for field in raw.fields.iter().filter(|f| !f.is_static() && !f.is_literal()) {
            let field_type = if params.is_empty() {
                field.field_type.clone()
            } else {
                substitute(&field.field_type, &params, &args)
            };
            members.push(size_align_of_composite(
                session,
                &field_type,
                &mut memo,
                &mut visiting,
            ));
        }
        current = raw.base.as_ref().map(|b| {
            if params.is_empty() {
                b.clone()
            } else {
                substitute(b, &params, &args)
            }
        });
    }

    let (size, _) = pack(&mut members, OBJECT_HEADER_SIZE);
    size.max(OBJECT_HEADER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_orders_by_alignment_then_size() {
        // i8, i64, i16 -> i64 first, then i16, then i8: 8 + 2 + 1 -> 16.
        let mut members = vec![(1, 1), (8, 8), (2, 2)];
        let (size, align) = pack(&mut members, 0);
        assert_eq!(align, 8);
        assert_eq!(size, 16);
    }

    #[test]
    fn empty_struct_still_occupies_a_byte() {
        let mut members: Vec<(u32, u32)> = vec![];
        let (size, align) = pack(&mut members, 0);
        assert_eq!((size, align), (0, 1));
        // size_align_of_composite clamps to 1 for empty value types.
    }
}
