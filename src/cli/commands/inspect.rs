use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use crate::codegen::ModuleView;
use crate::compiler::Compiler;
use crate::config::BuildConfig;

#[derive(clap::Args)]
#[clap(author, version, about, long_about = None)]
pub struct InspectArgs {
    /// The assembly to inspect
    #[arg(value_name = "ASSEMBLY")]
    pub assembly: PathBuf,

    /// Additional probing directories for referenced assemblies
    #[arg(long = "search-path", value_name = "DIR")]
    pub search_paths: Vec<PathBuf>,

    /// Emit the summary as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn execute(args: InspectArgs) -> Result<()> {
    let mut compiler = Compiler::new(BuildConfig::release());
    for path in args.search_paths {
        compiler.add_search_path(path);
    }
    let outcome = compiler
        .compile(&args.assembly)
        .with_context(|| format!("failed to load {}", args.assembly.display()))?;

    let view = ModuleView::new(&outcome.module);
    if args.json {
        let types: Vec<_> = view
            .types()
            .iter()
            .map(|t| {
                json!({
                    "name": t.cil_name,
                    "mangled": t.mangled_name,
                    "kind": format!("{:?}", t.source),
                    "valueType": t.is_value_type,
                    "interface": t.is_interface,
                    "methods": t.methods.len(),
                    "vtableSlots": t.vtable.len(),
                    "instanceSize": t.instance_size,
                })
            })
            .collect();
        let summary = json!({
            "types": types,
            "stringLiterals": view.string_literals().len(),
            "arrayInitBlobs": view.array_init_blobs().len(),
            "entryPoint": view.entry_point().map(|m| m.fullname()),
            "stubs": outcome.stub_report.entries,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{} types", view.types().len());
    for ty in view.types() {
        println!(
            "  {} ({:?}, {} methods, {} vtable slots)",
            ty.cil_name,
            ty.source,
            ty.methods.len(),
            ty.vtable.len()
        );
    }
    if let Some(entry) = view.entry_point() {
        println!("entry point: {}", entry.fullname());
    }
    if !outcome.stub_report.is_empty() {
        println!("stubbed methods:");
        print!("{}", outcome.stub_report.render_text());
    }
    Ok(())
}
