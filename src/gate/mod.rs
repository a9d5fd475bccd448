//! The safety-net gate.
//!
//! After pass 8 every reachable non-abstract, non-extern, non-ICall method
//! is classified: emit the lowered body, substitute a default-value stub,
//! or (for invariant breaches already recorded) keep the per-method fatal
//! marker. Stubs never drop silently: each lands in the stub report with
//! its reason, sorted by canonical name, for the external emitter and the
//! build log.

use std::collections::HashSet;

use log::{info, warn};
use serde::Serialize;

use crate::codegen::text::{default_value, instruction_text};
use crate::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticCollection, StubReason};
use crate::ir::{BasicBlock, Inst, InstKind, Module};

/// Type names that mark a body as depending on CLR internals no AOT
/// runtime provides. Fixed, read-only data.
pub const CLR_INTERNAL_TYPES: &[&str] = &[
    "System.Runtime.CompilerServices.QCallTypeHandle",
    "System.Runtime.CompilerServices.ObjectHandleOnStack",
    "System.Runtime.CompilerServices.QCallAssembly",
    "System.Runtime.CompilerServices.StackCrawlMark",
    "System.Reflection.MetadataImport",
    "System.Reflection.RuntimeCustomAttributeData",
    "System.Runtime.Loader.AssemblyLoadContext",
];

/// Intrinsic namespaces that only exist under the JIT; scalar fallbacks
/// are lowered, the vector families are stubbed.
const UNSUPPORTED_INTRINSIC_PREFIXES: &[&str] = &[
    "System.Runtime.Intrinsics.X86",
    "System.Runtime.Intrinsics.Arm",
    "System.Runtime.Intrinsics.Vector",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StubEntry {
    pub method: String,
    pub reason: StubReason,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StubReport {
    pub entries: Vec<StubEntry>,
}

impl StubReport {
    /// `stubbed_methods.txt` content: `{method}  {reason}` per line,
    /// sorted by canonical name.
    pub fn render_text(&self) -> String {
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| match &e.detail {
                Some(detail) => format!("{}  {}  ({detail})", e.method, e.reason),
                None => format!("{}  {}", e.method, e.reason),
            })
            .collect();
        lines.sort();
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    pub fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "[]".into())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classify every method, replace condemned bodies with stubs, return the
/// report. The module is final after this.
pub fn apply(module: &mut Module, diagnostics: &mut DiagnosticCollection) -> StubReport {
    let declared_symbols = collect_declared_symbols(module);
    let mut verdicts: Vec<(String, usize, StubReason, String)> = Vec::new();

    for ty in module.types() {
        for (index, method) in ty.methods.iter().enumerate() {
            if !method.requires_body() {
                continue;
            }
            if let Some(reason) = method.stub {
                // Recorded by an earlier pass (invariant violation or
                // lowering failure); body replacement still happens here.
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    reason,
                    method
                        .stub_detail
                        .clone()
                        .unwrap_or_else(|| "recorded by an earlier pass".into()),
                ));
                continue;
            }

            if let Some(internal) = references_clr_internal(method) {
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    StubReason::ClrInternalDependency,
                    format!("references {internal}"),
                ));
                continue;
            }
            if let Some(intrinsic) = uses_unsupported_intrinsic(method) {
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    StubReason::UnsupportedIntrinsic,
                    format!("uses {intrinsic}"),
                ));
                continue;
            }
            if method.blocks.is_empty() {
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    StubReason::LoweringFailure,
                    "no lowered body was produced".into(),
                ));
                continue;
            }
            if let Some(leftover) = rendered_body_error(method) {
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    StubReason::RenderedBodyError,
                    leftover,
                ));
                continue;
            }
            if let Some(symbol) = undeclared_reference(method, &declared_symbols) {
                verdicts.push((
                    ty.cil_name.clone(),
                    index,
                    StubReason::UndeclaredReference,
                    format!("dangling identifier {symbol}"),
                ));
                continue;
            }
        }
    }

    let mut report = StubReport::default();
    for (type_name, index, reason, detail) in verdicts {
        let ty = module.find_type_mut(&type_name).expect("type exists");
        let method = &mut ty.methods[index];
        let fullname = method.fullname();
        warn!("stubbing {fullname}: {reason} ({detail})");

        method.blocks = stub_body(&method.return_type);
        method.stub = Some(reason);
        method.stub_detail = Some(detail.clone());

        diagnostics.add(
            Diagnostic::warning(
                DiagnosticCode::MethodStubbed,
                format!("{fullname} replaced by a default-value stub: {reason}"),
            )
            .with_subject(fullname.clone()),
        );
        report.entries.push(StubEntry {
            method: fullname,
            reason,
            detail: Some(detail),
        });
    }
    report.entries.sort_by(|a, b| a.method.cmp(&b.method));
    info!("gate: {} methods stubbed", report.entries.len());
    report
}

/// A stub returns the default value for its return type; void stubs are
/// empty bodies.
fn stub_body(return_type: &str) -> Vec<BasicBlock> {
    let mut block = BasicBlock::new(0);
    block.push(Inst::new(InstKind::Label {
        name: "BB_0".into(),
    }));
    let default = default_value(return_type);
    let value = (!default.is_empty()).then_some(default);
    block.push(Inst::new(InstKind::Return { value }));
    vec![block]
}

fn references_clr_internal(method: &crate::ir::IrMethod) -> Option<String> {
    let mentions = |name: &str| CLR_INTERNAL_TYPES.iter().find(|t| name.contains(*t));
    if let Some(found) = mentions(&method.return_cil_type) {
        return Some((*found).to_string());
    }
    for param in &method.params {
        if let Some(found) = mentions(&param.cil_type) {
            return Some((*found).to_string());
        }
    }
    for block in &method.blocks {
        for inst in &block.insts {
            let text = instruction_text(&inst.kind);
            if let Some(found) = CLR_INTERNAL_TYPES
                .iter()
                .find(|t| text.contains(&t.replace('.', "_")))
            {
                return Some((*found).to_string());
            }
        }
    }
    None
}

fn uses_unsupported_intrinsic(method: &crate::ir::IrMethod) -> Option<String> {
    let check = |name: &str| {
        UNSUPPORTED_INTRINSIC_PREFIXES
            .iter()
            .find(|p| name.starts_with(*p) || name.contains(&p.replace('.', "_")))
    };
    if let Some(found) = check(&method.owner) {
        return Some((*found).to_string());
    }
    for block in &method.blocks {
        for inst in &block.insts {
            if let InstKind::Call { callee, .. } = &inst.kind {
                if let Some(found) = check(callee) {
                    return Some((*found).to_string());
                }
            }
        }
    }
    None
}

/// Syntactic patterns known to fail compilation downstream: generic
/// parameters that survived pass 4, or operand tokens that never resolved.
fn rendered_body_error(method: &crate::ir::IrMethod) -> Option<String> {
    for block in &method.blocks {
        for inst in &block.insts {
            let text = instruction_text(&inst.kind);
            if text.contains("<unresolved:") {
                return Some("unresolved metadata token in body".into());
            }
            if text.contains("!!") || text.contains('`') {
                return Some("unresolved generic parameter in body".into());
            }
        }
    }
    None
}

fn collect_declared_symbols(module: &Module) -> HashSet<String> {
    let mut symbols = HashSet::new();
    for ty in module.types() {
        symbols.insert(ty.mangled_name.clone());
        for method in &ty.methods {
            symbols.insert(format!("{}_{}", ty.mangled_name, method.mangled_name));
        }
    }
    symbols
}

/// Residual dangling call target after fixpoint: a direct callee that is
/// neither a module symbol nor a runtime-namespace symbol.
fn undeclared_reference(
    method: &crate::ir::IrMethod,
    declared: &HashSet<String>,
) -> Option<String> {
    for block in &method.blocks {
        for inst in &block.insts {
            if let InstKind::Call {
                callee, is_virtual, ..
            } = &inst.kind
            {
                if *is_virtual {
                    continue;
                }
                if callee.starts_with("cil2cpp::")
                    || callee.starts_with("object_memberwise_clone")
                    || callee.contains('<')
                {
                    continue;
                }
                if !declared.contains(callee) {
                    return Some(callee.clone());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrMethod, IrType, Parameter};

    fn module_with_method(mut method: IrMethod) -> Module {
        let mut module = Module::new();
        let mut ty = IrType::new("T", "T");
        method.owner = "T".into();
        ty.methods.push(method);
        module.add_type(ty);
        module
    }

    #[test]
    fn clr_internal_parameters_force_a_stub() {
        let mut m = IrMethod::new("T", "GetSignature");
        m.mangled_name = "GetSignature".into();
        m.params.push(Parameter {
            name: "handle".into(),
            cil_type: "System.Runtime.CompilerServices.QCallTypeHandle".into(),
            target_type: "void*".into(),
        });
        m.blocks = vec![BasicBlock::new(0)];
        let mut module = module_with_method(m);
        let mut diags = DiagnosticCollection::new();
        let report = apply(&mut module, &mut diags);

        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].reason, StubReason::ClrInternalDependency);
        let method = &module.find_type("T").unwrap().methods[0];
        assert_eq!(method.stub, Some(StubReason::ClrInternalDependency));
        // Stub body: label + default return.
        assert!(matches!(
            method.blocks[0].insts.last().unwrap().kind,
            InstKind::Return { .. }
        ));
    }

    #[test]
    fn empty_required_bodies_are_reported() {
        let mut m = IrMethod::new("T", "NoBody");
        m.mangled_name = "NoBody".into();
        m.return_type = "int32_t".into();
        let mut module = module_with_method(m);
        let mut diags = DiagnosticCollection::new();
        let report = apply(&mut module, &mut diags);
        assert_eq!(report.entries[0].reason, StubReason::LoweringFailure);
        // Non-void stub returns the scalar default.
        let method = &module.find_type("T").unwrap().methods[0];
        match &method.blocks[0].insts.last().unwrap().kind {
            InstKind::Return { value } => assert_eq!(value.as_deref(), Some("0")),
            other => panic!("expected return, got {other:?}"),
        }
    }

    #[test]
    fn report_text_is_sorted_by_method_name() {
        let report = StubReport {
            entries: vec![
                StubEntry {
                    method: "B::m".into(),
                    reason: StubReason::LoweringFailure,
                    detail: None,
                },
                StubEntry {
                    method: "A::m".into(),
                    reason: StubReason::ClrInternalDependency,
                    detail: None,
                },
            ],
        };
        let text = report.render_text();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("A::m"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn healthy_methods_pass_untouched() {
        let mut m = IrMethod::new("T", "Ok");
        m.mangled_name = "Ok".into();
        let mut block = BasicBlock::new(0);
        block.push(Inst::new(InstKind::Return { value: None }));
        m.blocks = vec![block.clone()];
        let mut module = module_with_method(m);
        let mut diags = DiagnosticCollection::new();
        let report = apply(&mut module, &mut diags);
        assert!(report.is_empty());
        assert_eq!(module.find_type("T").unwrap().methods[0].blocks, vec![block]);
    }
}
