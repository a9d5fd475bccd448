use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// Per-build switches consumed by the IR builder and the emitter contract.
///
/// `Debug` turns everything on, `Release` everything off; individual flags
/// can still be toggled by hand after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub is_debug: bool,
    pub emit_line_directives: bool,
    pub emit_il_offset_comments: bool,
    pub enable_stack_traces: bool,
    pub read_debug_symbols: bool,
}

impl BuildConfig {
    pub fn debug() -> Self {
        Self {
            is_debug: true,
            emit_line_directives: true,
            emit_il_offset_comments: true,
            enable_stack_traces: true,
            read_debug_symbols: true,
        }
    }

    pub fn release() -> Self {
        Self {
            is_debug: false,
            emit_line_directives: false,
            emit_il_offset_comments: false,
            enable_stack_traces: false,
            read_debug_symbols: false,
        }
    }

    /// Case-insensitive preset lookup.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::debug()),
            "release" => Ok(Self::release()),
            _ => Err(CompileError::Configuration(name.to_string())),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_case_insensitively() {
        assert_eq!(BuildConfig::from_name("DEBUG").unwrap(), BuildConfig::debug());
        assert_eq!(BuildConfig::from_name("Release").unwrap(), BuildConfig::release());
    }

    #[test]
    fn unknown_preset_is_a_configuration_error() {
        match BuildConfig::from_name("fastdebug") {
            Err(CompileError::Configuration(name)) => assert_eq!(name, "fastdebug"),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn debug_sets_every_flag() {
        let cfg = BuildConfig::debug();
        assert!(cfg.is_debug && cfg.emit_line_directives && cfg.read_debug_symbols);
        let cfg = BuildConfig::release();
        assert!(!cfg.is_debug && !cfg.emit_line_directives && !cfg.read_debug_symbols);
    }
}
