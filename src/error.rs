use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompileError>;

/// Build-terminating and per-method error kinds.
///
/// `InvariantViolation` and `LoweringFailure` are fatal for a single method
/// only; the passes convert them into diagnostics and stubs instead of
/// letting them cross a pass boundary.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] dotscope::Error),

    #[error("malformed metadata in {path}: {detail}")]
    MetadataFormat { path: String, detail: String },

    #[error("unknown build configuration '{0}'")]
    Configuration(String),

    #[error("unresolved reference '{reference}' required by {required_by}")]
    UnresolvedReference {
        reference: String,
        required_by: String,
    },

    #[error("invariant violation in {method}: {detail}")]
    InvariantViolation { method: String, detail: String },

    #[error("unhandled CIL instruction '{mnemonic}' in {method}")]
    LoweringFailure { method: String, mnemonic: String },
}

impl CompileError {
    /// Errors scoped to one method; the build continues around these.
    pub fn is_method_local(&self) -> bool {
        matches!(
            self,
            CompileError::InvariantViolation { .. } | CompileError::LoweringFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_local_errors_do_not_kill_the_build() {
        let err = CompileError::LoweringFailure {
            method: "A.B::C".into(),
            mnemonic: "jmp".into(),
        };
        assert!(err.is_method_local());
        assert!(!CompileError::Configuration("weird".into()).is_method_local());
    }
}
