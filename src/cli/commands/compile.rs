use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::compiler::{self, Compiler};
use crate::config::BuildConfig;

#[derive(clap::Args)]
#[clap(author, version, about, long_about = None)]
pub struct CompileArgs {
    /// The entry assembly (.dll or .exe)
    #[arg(value_name = "ASSEMBLY")]
    pub assembly: PathBuf,

    /// Additional probing directories for referenced assemblies
    #[arg(long = "search-path", value_name = "DIR")]
    pub search_paths: Vec<PathBuf>,

    /// Directory holding the platform BCL assemblies
    #[arg(long, value_name = "DIR")]
    pub bcl_dir: Option<PathBuf>,

    /// Build configuration preset (debug/release, case-insensitive)
    #[arg(long, default_value = "release")]
    pub config: String,

    /// Output directory for report artifacts
    #[arg(short, long, default_value = "cil2cpp-out")]
    pub output: PathBuf,
}

pub fn execute(args: CompileArgs) -> Result<()> {
    let config = BuildConfig::from_name(&args.config)
        .with_context(|| format!("unknown configuration '{}'", args.config))?;

    let mut compiler = Compiler::new(config);
    for path in args.search_paths {
        compiler.add_search_path(path);
    }
    if let Some(bcl) = args.bcl_dir {
        compiler.set_bcl_dir(bcl);
    }

    let outcome = compiler
        .compile(&args.assembly)
        .with_context(|| format!("failed to compile {}", args.assembly.display()))?;

    for diagnostic in &outcome.diagnostics.diagnostics {
        eprintln!("{diagnostic}");
    }
    compiler::write_stub_report(&outcome, &args.output)?;

    println!(
        "compiled {} types, {} methods ({} stubbed)",
        outcome.module.types().len(),
        outcome.module.all_methods().count(),
        outcome.stub_report.entries.len()
    );

    if outcome.diagnostics.has_errors() {
        bail!(
            "{} error(s) during compilation",
            outcome.diagnostics.error_count()
        );
    }
    Ok(())
}
