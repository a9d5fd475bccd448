//! The eight-pass IR builder.
//!
//! Passes run strictly in order; each depends on artifacts laid down by the
//! previous ones. A pass never propagates an error across the pass
//! boundary: per-method faults become diagnostics (and, later, stubs), so
//! one un-lowerable method cannot abort a whole-program build.

pub mod generics;
pub mod interfaces;
pub mod layout;
pub mod lower;
pub mod methods;
pub mod session;
pub mod shells;
pub mod synthesis;
pub mod vtable;

use log::info;

use crate::assemblies::AssemblySet;
use crate::config::BuildConfig;
use crate::diagnostics::DiagnosticCollection;
use crate::ir::Module;
use crate::reach::Reachability;

pub use session::BuildSession;

/// One pass of the builder pipeline.
pub trait BuildPass {
    fn id(&self) -> &'static str;
    fn run(&self, session: &mut BuildSession<'_>);
}

pub struct IrBuilder;

impl IrBuilder {
    /// Run all eight passes and return the finished module together with
    /// the accumulated diagnostics. The module is immutable from here on.
    pub fn build(
        set: &AssemblySet,
        reach: &Reachability,
        config: &BuildConfig,
    ) -> (Module, DiagnosticCollection) {
        let mut session = BuildSession::new(set, reach, config);

        let passes: Vec<Box<dyn BuildPass>> = vec![
            Box::new(shells::TypeShellPass),
            Box::new(layout::FieldLayoutPass),
            Box::new(methods::MethodShellPass),
            Box::new(generics::MonomorphizePass),
            Box::new(vtable::VTablePass),
            Box::new(interfaces::InterfaceImplPass),
            Box::new(lower::BodyLoweringPass),
            Box::new(synthesis::SynthesisPass),
        ];

        for pass in passes {
            info!("pass {}", pass.id());
            pass.run(&mut session);
        }

        session.finish()
    }
}
