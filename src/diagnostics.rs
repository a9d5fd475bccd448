use std::fmt;

use serde::{Deserialize, Serialize};

/// Diagnostic severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Stable diagnostic codes surfaced to the CLI and report artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    UnresolvedReference,
    ReferenceCycle,
    TypeForwarder,
    InvariantViolation,
    LoweringFailure,
    InterfaceSlotUnfilled,
    MethodStubbed,
    MissingDebugSymbols,
}

/// Why a method body was replaced by a default-value stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StubReason {
    ClrInternalDependency,
    UnsupportedIntrinsic,
    UndeclaredTypeInfo,
    RenderedBodyError,
    UndeclaredReference,
    LoweringFailure,
    InvariantViolation,
}

impl fmt::Display for StubReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StubReason::ClrInternalDependency => "clr-internal-dependency",
            StubReason::UnsupportedIntrinsic => "unsupported-intrinsic",
            StubReason::UndeclaredTypeInfo => "undeclared-type-info",
            StubReason::RenderedBodyError => "rendered-body-error",
            StubReason::UndeclaredReference => "undeclared-reference",
            StubReason::LoweringFailure => "lowering-failure",
            StubReason::InvariantViolation => "invariant-violation",
        };
        write!(f, "{text}")
    }
}

/// A single diagnostic tied to an assembly, type, or method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,
    /// Canonical name of the entity the diagnostic is about, when known.
    pub subject: Option<String>,
}

impl Diagnostic {
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            subject: None,
        }
    }

    pub fn warning(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{}: {} ({})", self.severity, self.message, subject),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Collection of diagnostics accumulated across passes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticCollection {
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d.severity, Severity::Error))
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d.severity, Severity::Warning))
    }

    pub fn has_errors(&self) -> bool {
        self.errors().count() > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn extend(&mut self, other: DiagnosticCollection) {
        self.diagnostics.extend(other.diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_partitions_by_severity() {
        let mut diags = DiagnosticCollection::new();
        diags.add(Diagnostic::error(
            DiagnosticCode::InvariantViolation,
            "override without base slot",
        ));
        diags.add(
            Diagnostic::warning(DiagnosticCode::ReferenceCycle, "A -> B -> A")
                .with_subject("A"),
        );
        assert!(diags.has_errors());
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.warnings().count(), 1);
    }

    #[test]
    fn stub_reasons_render_kebab_case() {
        assert_eq!(StubReason::ClrInternalDependency.to_string(), "clr-internal-dependency");
        assert_eq!(StubReason::LoweringFailure.to_string(), "lowering-failure");
    }
}
