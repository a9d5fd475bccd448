//! Pass 7: method-body lowering.
//!
//! Couples control-flow recovery with stack-to-variable rewriting; the
//! per-opcode table lives in [`body`]. The pass itself only collects work,
//! interns string literals and array-initializer blobs up front (so the
//! module tables stay read-only while bodies lower), runs the lowerer over
//! every method (in parallel under the `parallel` feature, each task
//! owning exactly one method) and attaches results. A method that fails
//! to lower is stubbed, never fatal for the build.

pub mod body;

use std::collections::HashMap;

use log::{debug, info};

use crate::diagnostics::{Diagnostic, DiagnosticCode, StubReason};
use crate::metadata::cil::CilOp;
use crate::metadata::model::TokenRef;

use super::session::BuildSession;
use super::BuildPass;

use body::{lower_body, Fault, LowerCtx, WorkItem};

pub struct BodyLoweringPass;

impl BuildPass for BodyLoweringPass {
    fn id(&self) -> &'static str {
        "lower-bodies"
    }

    fn run(&self, session: &mut BuildSession<'_>) {
        let work = collect_work(session);
        info!("lowering {} method bodies", work.len());

        let blob_ids = intern_literals(session, &work);

        let results: Vec<(String, usize, Result<Vec<crate::ir::BasicBlock>, Fault>)> = {
            let ctx = LowerCtx {
                module: &session.module,
                set: session.set,
                names: &session.names,
                config: session.config,
                blob_ids: &blob_ids,
            };

            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                work.par_iter()
                    .map(|item| {
                        (
                            item.type_name.clone(),
                            item.method_index,
                            lower_body(&ctx, item),
                        )
                    })
                    .collect()
            }
            #[cfg(not(feature = "parallel"))]
            {
                work.iter()
                    .map(|item| {
                        (
                            item.type_name.clone(),
                            item.method_index,
                            lower_body(&ctx, item),
                        )
                    })
                    .collect()
            }
        };

        for (type_name, method_index, result) in results {
            let Some(ty) = session.module.find_type_mut(&type_name) else {
                continue;
            };
            let method = &mut ty.methods[method_index];
            match result {
                Ok(blocks) => {
                    debug!("{}::{}: {} blocks", type_name, method.cil_name, blocks.len());
                    method.blocks = blocks;
                }
                Err(fault) => {
                    let fullname = method.fullname();
                    method.stub = Some(fault.reason);
                    method.stub_detail = Some(fault.detail.clone());
                    session.diagnostics.add(
                        Diagnostic::warning(
                            DiagnosticCode::LoweringFailure,
                            format!("body of {fullname} not lowered: {}", fault.detail),
                        )
                        .with_subject(fullname),
                    );
                }
            }
        }
    }
}

fn collect_work(session: &mut BuildSession<'_>) -> Vec<WorkItem> {
    let mut work = Vec::new();
    let type_names: Vec<String> = session.module.type_names().map(String::from).collect();

    for type_name in type_names {
        let (raw_owner_name, generic_args, owner_is_value, method_count) = {
            let ty = session.module.find_type(&type_name).unwrap();
            (
                ty.generic_definition
                    .clone()
                    .unwrap_or_else(|| ty.cil_name.clone()),
                ty.generic_args.clone(),
                ty.is_value_type,
                ty.methods.len(),
            )
        };
        let Some(raw_owner) = session.raw_type(&raw_owner_name).cloned() else {
            continue;
        };
        let type_params: Vec<String> = raw_owner
            .generic_params
            .iter()
            .map(|p| p.name.clone())
            .collect();

        for method_index in 0..method_count {
            let (requires, stubbed, source_index, method_generic_args, fullname, has_this) = {
                let ty = session.module.find_type(&type_name).unwrap();
                let m = &ty.methods[method_index];
                (
                    m.requires_body(),
                    m.stub.is_some(),
                    m.source_index,
                    m.generic_args.clone(),
                    m.fullname(),
                    !m.is_static,
                )
            };
            if !requires || stubbed {
                continue;
            }
            let Some(source_index) = source_index else {
                continue;
            };
            let Some(raw_method) = raw_owner.methods.get(source_index).cloned() else {
                continue;
            };

            if let Some(detail) = &raw_method.body_error {
                let ty = session.module.find_type_mut(&type_name).unwrap();
                ty.methods[method_index].stub = Some(StubReason::LoweringFailure);
                ty.methods[method_index].stub_detail = Some(detail.clone());
                session.diagnostics.add(
                    Diagnostic::warning(
                        DiagnosticCode::LoweringFailure,
                        format!("body of {fullname} not lowered: {detail}"),
                    )
                    .with_subject(fullname),
                );
                continue;
            }
            if raw_method.body.is_none() {
                // Compiler-implicit bodies (records) arrive in pass 8; the
                // gate flags anything still empty after that.
                continue;
            }

            let mut subst_params = type_params.clone();
            let mut subst_args = generic_args.clone();
            subst_params.extend(raw_method.generic_params.iter().cloned());
            subst_args.extend(method_generic_args);

            let (param_names, param_types, return_cil) = {
                let ty = session.module.find_type(&type_name).unwrap();
                let m = &ty.methods[method_index];
                (
                    m.params.iter().map(|p| p.name.clone()).collect(),
                    m.params.iter().map(|p| p.cil_type.clone()).collect(),
                    m.return_cil_type.clone(),
                )
            };

            work.push(WorkItem {
                type_name: type_name.clone(),
                method_index,
                raw: raw_method,
                subst_params,
                subst_args,
                fullname,
                has_this,
                param_names,
                param_types,
                return_cil,
                owner_is_value,
            });
        }
    }
    work
}

/// Intern every string literal and array-initializer blob the bodies will
/// mention, in deterministic work order, before lowering begins. The
/// lowerer then only reads the tables.
fn intern_literals(
    session: &mut BuildSession<'_>,
    work: &[WorkItem],
) -> HashMap<(String, String), String> {
    let mut blob_ids = HashMap::new();
    for item in work {
        let Some(raw_body) = &item.raw.body else {
            continue;
        };
        for inst in &raw_body.ops {
            match &inst.op {
                CilOp::Ldstr(value) => {
                    session.module.register_string_literal(value);
                }
                CilOp::Ldtoken(TokenRef::Field(fref)) => {
                    let key = (fref.owner.clone(), fref.name.clone());
                    if blob_ids.contains_key(&key) {
                        continue;
                    }
                    let data = session
                        .raw_type(&fref.owner)
                        .and_then(|t| t.fields.iter().find(|f| f.name == fref.name))
                        .and_then(|f| f.rva_data.clone());
                    if let Some(bytes) = data {
                        let id = session.module.register_array_init_data(&bytes);
                        blob_ids.insert(key, id);
                    }
                }
                _ => {}
            }
        }
    }
    blob_ids
}
