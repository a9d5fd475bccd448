use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::assemblies::{AssemblySet, LoadOptions};
use crate::build::IrBuilder;
use crate::config::BuildConfig;
use crate::diagnostics::DiagnosticCollection;
use crate::error::Result;
use crate::gate::{self, StubReport};
use crate::ir::Module;
use crate::metadata::reader::{DotscopeSource, MetadataSource};
use crate::reach;

/// Everything a build produces: the immutable module, the merged
/// diagnostic list, and the stub report.
pub struct BuildOutcome {
    pub module: Module,
    pub diagnostics: DiagnosticCollection,
    pub stub_report: StubReport,
}

pub struct Compiler {
    source: Box<dyn MetadataSource>,
    config: BuildConfig,
    search_paths: Vec<PathBuf>,
    bcl_dir: Option<PathBuf>,
}

impl Compiler {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            source: Box::new(DotscopeSource::new()),
            config,
            search_paths: Vec::new(),
            bcl_dir: None,
        }
    }

    /// Swap the assembly source; tests feed in-memory models this way.
    pub fn with_source(mut self, source: Box<dyn MetadataSource>) -> Self {
        self.source = source;
        self
    }

    pub fn add_search_path(&mut self, path: PathBuf) -> &mut Self {
        self.search_paths.push(path);
        self
    }

    pub fn set_bcl_dir(&mut self, path: PathBuf) -> &mut Self {
        self.bcl_dir = Some(path);
        self
    }

    /// Run the whole core: load, prune, build the IR, gate.
    pub fn compile(&self, entry: &Path) -> Result<BuildOutcome> {
        info!("compiling {}", entry.display());

        let options = LoadOptions {
            search_paths: self.search_paths.clone(),
            bcl_dir: self.bcl_dir.clone(),
            read_debug: self.config.read_debug_symbols,
        };
        let set = AssemblySet::load(self.source.as_ref(), entry, &options)?;
        debug!("{} assemblies in the set", set.assemblies().len());

        let reachability = reach::analyze(&set);

        let (mut module, mut diagnostics) = IrBuilder::build(&set, &reachability, &self.config);
        diagnostics.extend(set.diagnostics.clone());

        let stub_report = gate::apply(&mut module, &mut diagnostics);

        if diagnostics.has_errors() {
            for diagnostic in diagnostics.errors() {
                error!("{diagnostic}");
            }
        }
        info!(
            "build finished: {} types, {} stubs, {} errors",
            module.types().len(),
            stub_report.entries.len(),
            diagnostics.error_count()
        );
        Ok(BuildOutcome {
            module,
            diagnostics,
            stub_report,
        })
    }
}

/// Write the stub-diagnostics artifacts next to the emitter output.
pub fn write_stub_report(outcome: &BuildOutcome, output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir)?;
    let text_path = output_dir.join("stubbed_methods.txt");
    fs::write(&text_path, outcome.stub_report.render_text())?;
    fs::write(
        output_dir.join("stubbed_methods.json"),
        outcome.stub_report.render_json(),
    )?;
    info!("stub report written to {}", text_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::cil::{CilInst, CilOp};
    use crate::metadata::model::*;
    use crate::metadata::reader::MemorySource;

    #[test]
    fn compile_runs_end_to_end_over_a_memory_source() {
        let mut app = RawAssembly::new("App");
        let mut program = RawType::new("", "Program");
        let mut main = RawMethod::new(
            "Main",
            MethodSig {
                has_this: false,
                return_type: "System.Void".into(),
                params: vec![],
            },
        );
        main.flags |= MethodFlags::STATIC;
        main.body = Some(RawBody {
            ops: vec![CilInst::new(0, CilOp::Ret)],
            ..Default::default()
        });
        program.methods.push(main);
        app.entry_point = Some(EntryPointRef {
            type_fullname: "Program".into(),
            method_name: "Main".into(),
        });
        app.types.push(program);

        let mut source = MemorySource::new();
        source.add(app);
        let compiler =
            Compiler::new(BuildConfig::release()).with_source(Box::new(source));
        let outcome = compiler.compile(Path::new("/x/App.dll")).unwrap();

        assert!(outcome.module.entry_method().is_some());
        assert!(!outcome.diagnostics.has_errors());
    }
}
