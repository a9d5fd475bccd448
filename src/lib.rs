//! cil2cpp compiler core library

pub mod assemblies;
pub mod build;
pub mod cli;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gate;
pub mod icalls;
pub mod ir;
pub mod metadata;
pub mod naming;
pub mod reach;
pub mod synth;

pub use compiler::Compiler;
pub use config::BuildConfig;
pub use error::{CompileError, Result};
