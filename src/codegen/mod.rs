//! Core → codegen consumer contract.
//!
//! External emitters receive a [`ModuleView`]: a purely observational
//! handle over the finished module. Nothing here mutates; the emitter
//! partitions, renders (via [`text::instruction_text`]) and writes files
//! on its own side of the boundary.

pub mod text;

use crate::diagnostics::StubReason;
use crate::ir::{ArrayInitBlob, IrMethod, IrType, Module, PrimitiveInfo, StringLiteral};

/// Read-only module handle handed to codegen consumers.
pub struct ModuleView<'a> {
    module: &'a Module,
}

impl<'a> ModuleView<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    /// Ordered types, insertion order of the builder.
    pub fn types(&self) -> &'a [IrType] {
        self.module.types()
    }

    pub fn find_type(&self, fullname: &str) -> Option<&'a IrType> {
        self.module.find_type(fullname)
    }

    pub fn all_methods(&self) -> impl Iterator<Item = &'a IrMethod> {
        self.module.all_methods()
    }

    pub fn entry_point(&self) -> Option<&'a IrMethod> {
        self.module.entry_method()
    }

    pub fn string_literals(&self) -> &'a [StringLiteral] {
        self.module.string_literals()
    }

    pub fn array_init_blobs(&self) -> &'a [ArrayInitBlob] {
        self.module.array_init_blobs()
    }

    pub fn primitive_info(&self, fullname: &str) -> Option<PrimitiveInfo> {
        Module::primitive_info(fullname)
    }

    /// Stub flag + reason for a method, `None` when the body is real.
    pub fn stub_of<'b>(&self, method: &'b IrMethod) -> Option<(StubReason, Option<&'b str>)> {
        method
            .stub
            .map(|reason| (reason, method.stub_detail.as_deref()))
    }

    /// Full rendered text of a method body, mostly for tooling and tests;
    /// real emitters walk the blocks themselves.
    pub fn render_method(&self, method: &IrMethod) -> String {
        let mut lines = Vec::new();
        for block in &method.blocks {
            for inst in &block.insts {
                lines.push(text::instruction_text(&inst.kind));
            }
        }
        lines.join("\n")
    }
}
