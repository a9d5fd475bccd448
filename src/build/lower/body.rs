//! The stack-simulating instruction lowerer.
//!
//! One pass over the IL stream per method: basic blocks are cut at branch
//! targets, after terminators and at exception-region boundaries; a typed
//! evaluation stack rewrites stack slots into `__tN` temps; exception
//! clauses unroll into balanced TryBegin/handler/TryEnd sequences. CIL
//! requires an empty evaluation stack at block joins, so the simulation
//! needs no phi nodes; a non-empty join is a lowering failure for the
//! method, which the gate then stubs.

use std::collections::{BTreeSet, HashMap};

use crate::assemblies::AssemblySet;
use crate::codegen::text::default_value;
use crate::config::BuildConfig;
use crate::diagnostics::StubReason;
use crate::icalls;
use crate::ir::{BasicBlock, DebugInfo, Inst, InstKind, Module};
use crate::metadata::cil::CilOp;
use crate::metadata::model::{EhClause, EhKind, FieldRef, MethodRef, RawBody, RawMethod, TokenRef};
use crate::naming::NameMapper;
use crate::reach::names::{peel_composite, split_instantiation, substitute};

pub(crate) struct LowerCtx<'a> {
    pub module: &'a Module,
    pub set: &'a AssemblySet,
    pub names: &'a NameMapper,
    pub config: &'a BuildConfig,
    /// (owner, field) -> pre-registered array-initializer blob id.
    pub blob_ids: &'a HashMap<(String, String), String>,
}

pub(crate) struct WorkItem {
    pub type_name: String,
    pub method_index: usize,
    pub raw: RawMethod,
    pub subst_params: Vec<String>,
    pub subst_args: Vec<String>,
    pub fullname: String,
    pub has_this: bool,
    pub param_names: Vec<String>,
    pub param_types: Vec<String>,
    pub return_cil: String,
    pub owner_is_value: bool,
}

#[derive(Debug)]
pub(crate) struct Fault {
    pub reason: StubReason,
    pub detail: String,
}

impl Fault {
    fn lowering(detail: impl Into<String>) -> Self {
        Self {
            reason: StubReason::LoweringFailure,
            detail: detail.into(),
        }
    }
}

impl LowerCtx<'_> {
    /// Read-only rendering of a CIL type-name into target text.
    fn target_type(&self, cil_name: &str) -> String {
        if cil_name == "System.Void" {
            return "void".into();
        }
        if let Some(info) = Module::primitive_info(cil_name) {
            return info.scalar;
        }
        if cil_name.ends_with("[]") {
            return "cil2cpp::Array*".into();
        }
        if cil_name.ends_with(']') {
            return "cil2cpp::MdArray*".into();
        }
        if let Some(element) = cil_name
            .strip_suffix('&')
            .or_else(|| cil_name.strip_suffix('*'))
        {
            return format!("{}*", self.target_type(element));
        }
        if cil_name == "System.String" {
            return "cil2cpp::String*".into();
        }
        if cil_name == "System.Object" {
            return "cil2cpp::Object*".into();
        }
        if let Some(ty) = self.module.find_type(cil_name) {
            if ty.is_enum {
                let underlying = ty
                    .enum_underlying
                    .as_deref()
                    .unwrap_or("System.Int32");
                return self.target_type(underlying);
            }
            if ty.is_value_type {
                return ty.mangled_name.clone();
            }
            return format!("{}*", ty.mangled_name);
        }
        format!("{}*", self.names.peek_type(cil_name))
    }

    fn is_value_type(&self, cil_name: &str) -> bool {
        if Module::is_primitive(cil_name) {
            return true;
        }
        self.module
            .find_type(cil_name)
            .map(|t| t.is_value_type)
            .or_else(|| {
                let open = split_instantiation(cil_name).map(|(o, _)| o);
                open.and_then(|o| self.set.find_type(&o).map(|(t, _)| t.is_value_type))
            })
            .unwrap_or(false)
    }

    fn is_interface(&self, cil_name: &str) -> bool {
        self.module
            .find_type(cil_name)
            .map(|t| t.is_interface)
            .unwrap_or(false)
    }

    fn is_delegate(&self, cil_name: &str) -> bool {
        self.module
            .find_type(cil_name)
            .map(|t| t.is_delegate)
            .unwrap_or(false)
    }

    fn has_cctor(&self, cil_name: &str) -> bool {
        self.module
            .find_type(cil_name)
            .map(|t| t.has_cctor)
            .unwrap_or(false)
    }

    /// Mangled name + CIL type of a referenced field.
    fn field_info(&self, fref: &FieldRef) -> (String, String) {
        if let Some(ty) = self.module.find_type(&fref.owner) {
            if let Some(field) = ty.find_field(&fref.name) {
                return (field.mangled_name.clone(), field.field_type.clone());
            }
        }
        (
            NameMapper::new().mangle_field(&fref.name),
            fref.field_type.clone(),
        )
    }

    fn vtable_slot_of(&self, owner: &str, name: &str, arity: usize) -> i32 {
        self.module
            .find_type(owner)
            .and_then(|t| t.find_method_index(name, arity))
            .and_then(|i| {
                self.module
                    .find_type(owner)
                    .map(|t| t.methods[i].vtable_slot)
            })
            .unwrap_or(-1)
    }

    /// Dense slot inside the interface's dispatch order.
    fn interface_slot_of(&self, owner: &str, name: &str, arity: usize) -> i32 {
        let Some(iface) = self.module.find_type(owner) else {
            return -1;
        };
        iface
            .methods
            .iter()
            .filter(|m| !m.is_ctor && !m.is_cctor)
            .position(|m| m.cil_name == name && m.params.len() == arity)
            .map(|p| p as i32)
            .unwrap_or(-1)
    }

    fn method_symbol(&self, owner: &str, mref: &MethodRef) -> String {
        let owner_mangled = self.names.peek_type(owner);
        let method = NameMapper::new().mangle_method(&mref.name);
        if mref.generic_args.is_empty() {
            format!("{owner_mangled}_{method}")
        } else {
            let suffix: Vec<String> = mref
                .generic_args
                .iter()
                .map(|a| NameMapper::new().mangle_method(a))
                .collect();
            format!("{owner_mangled}_{method}_{}", suffix.join("_"))
        }
    }
}

/// Scheduled exception-region event.
#[derive(Clone, Debug, PartialEq)]
enum EhEvent {
    TryBegin,
    CatchBegin(String),
    FinallyBegin,
    FaultBegin,
    FilterBegin,
    FilterHandlerBegin,
    TryEnd,
}

#[derive(Clone, Debug)]
struct StackEntry {
    name: String,
    ty: String,
}

struct Lowerer<'a, 'b> {
    ctx: &'a LowerCtx<'b>,
    item: &'a WorkItem,
    body: &'a RawBody,
    blocks: Vec<BasicBlock>,
    current: usize,
    stack: Vec<StackEntry>,
    temp_counter: usize,
    label_by_offset: HashMap<u32, String>,
    leaders: BTreeSet<u32>,
    /// (offset, order, event); emitted once, in order.
    events: Vec<(u32, usize, EhEvent)>,
    next_event: usize,
    constrained: Option<String>,
    exc_counter: usize,
    visible_points: HashMap<u32, (String, u32, u32)>,
    dead: bool,
}

pub(crate) fn lower_body(ctx: &LowerCtx<'_>, item: &WorkItem) -> Result<Vec<BasicBlock>, Fault> {
    let body = item
        .raw
        .body
        .as_ref()
        .ok_or_else(|| Fault::lowering("method has no IL body"))?;
    Lowerer::new(ctx, item, body).run()
}

impl<'a, 'b> Lowerer<'a, 'b> {
    fn new(ctx: &'a LowerCtx<'b>, item: &'a WorkItem, body: &'a RawBody) -> Self {
        Self {
            ctx,
            item,
            body,
            blocks: Vec::new(),
            current: 0,
            stack: Vec::new(),
            temp_counter: 0,
            label_by_offset: HashMap::new(),
            leaders: BTreeSet::new(),
            events: Vec::new(),
            next_event: 0,
            constrained: None,
            exc_counter: 0,
            visible_points: HashMap::new(),
            dead: false,
        }
    }

    fn subst(&self, name: &str) -> String {
        if self.item.subst_params.is_empty() {
            name.to_string()
        } else {
            substitute(name, &self.item.subst_params, &self.item.subst_args)
        }
    }

    fn run(mut self) -> Result<Vec<BasicBlock>, Fault> {
        self.collect_sequence_points();
        self.collect_leaders();
        self.schedule_eh_events();

        let leader_list: Vec<u32> = self.leaders.iter().copied().collect();
        for (id, offset) in leader_list.iter().enumerate() {
            self.blocks.push(BasicBlock::new(id));
            self.label_by_offset.insert(*offset, format!("BB_{id}"));
        }

        self.blocks[0].push(Inst::new(InstKind::Label {
            name: "BB_0".into(),
        }));
        self.declare_locals();

        let body = self.body;
        for (index, inst) in body.ops.iter().enumerate() {
            let offset = inst.offset;

            self.emit_events_before(offset);

            if offset != 0 && self.leaders.contains(&offset) {
                self.enter_block(offset)?;
            }

            self.emit_events_at(offset);

            if self.dead {
                continue;
            }
            let next_offset = body
                .ops
                .get(index + 1)
                .map(|i| i.offset)
                .unwrap_or(offset + 1);
            self.lower_op(&inst.op, offset, next_offset)?;
        }

        self.flush_events();

        Ok(self.blocks)
    }

    // ---- setup ----------------------------------------------------------

    fn collect_sequence_points(&mut self) {
        if !self.ctx.config.read_debug_symbols {
            return;
        }
        for sp in &self.item.raw.sequence_points {
            if !sp.is_hidden() {
                self.visible_points.insert(
                    sp.il_offset,
                    (sp.source_file.clone(), sp.start_line, sp.start_column),
                );
            }
        }
    }

    fn collect_leaders(&mut self) {
        self.leaders.insert(0);
        let body = self.body;
        for (index, inst) in body.ops.iter().enumerate() {
            for target in inst.op.branch_targets() {
                self.leaders.insert(target);
            }
            if inst.op.ends_block() {
                if let Some(next) = body.ops.get(index + 1) {
                    self.leaders.insert(next.offset);
                }
            }
        }
        for clause in &body.eh {
            self.leaders.insert(clause.try_offset);
            self.leaders.insert(clause.handler_offset);
            self.leaders.insert(clause.try_end());
            if let EhKind::Filter { filter_offset } = &clause.kind {
                self.leaders.insert(*filter_offset);
            }
        }
        // Only offsets that start an instruction can head a block.
        let valid: BTreeSet<u32> = body.ops.iter().map(|i| i.offset).collect();
        self.leaders = self.leaders.intersection(&valid).copied().collect();
        if self.leaders.is_empty() {
            self.leaders.insert(0);
        }
    }

    /// Unroll EH clauses into scheduled begin/end events. Clauses sharing a
    /// try range form one region: one TryBegin, handlers in clause order,
    /// one TryEnd after the last handler.
    fn schedule_eh_events(&mut self) {
        let mut regions: Vec<((u32, u32), Vec<&EhClause>)> = Vec::new();
        for clause in &self.body.eh {
            let key = (clause.try_offset, clause.try_length);
            match regions.iter_mut().find(|(k, _)| *k == key) {
                Some((_, list)) => list.push(clause),
                None => regions.push((key, vec![clause])),
            }
        }
        // Outer regions open first at a shared offset.
        regions.sort_by(|a, b| a.0 .0.cmp(&b.0 .0).then(b.0 .1.cmp(&a.0 .1)));

        let mut order = 0usize;
        let mut push = |events: &mut Vec<(u32, usize, EhEvent)>, offset: u32, event: EhEvent| {
            events.push((offset, order, event));
            order += 1;
        };

        let mut events = Vec::new();
        for ((try_offset, _try_length), clauses) in &regions {
            push(&mut events, *try_offset, EhEvent::TryBegin);
            let mut region_end = 0u32;
            for clause in clauses {
                match &clause.kind {
                    EhKind::Catch { catch_type } => push(
                        &mut events,
                        clause.handler_offset,
                        EhEvent::CatchBegin(catch_type.clone()),
                    ),
                    EhKind::Finally => {
                        push(&mut events, clause.handler_offset, EhEvent::FinallyBegin)
                    }
                    EhKind::Fault => {
                        push(&mut events, clause.handler_offset, EhEvent::FaultBegin)
                    }
                    EhKind::Filter { filter_offset } => {
                        push(&mut events, *filter_offset, EhEvent::FilterBegin);
                        push(&mut events, clause.handler_offset, EhEvent::FilterHandlerBegin);
                    }
                }
                region_end = region_end.max(clause.handler_end());
            }
            push(&mut events, region_end, EhEvent::TryEnd);
        }
        events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        self.events = events;
    }

    fn declare_locals(&mut self) {
        let locals: Vec<(String, String, Option<String>)> = self
            .body
            .locals
            .iter()
            .enumerate()
            .map(|(index, local)| {
                let cil = self.subst(&local.local_type);
                let target = self.ctx.target_type(&cil);
                let init = self
                    .body
                    .init_locals
                    .then(|| default_value(&target))
                    .filter(|v| !v.is_empty());
                (format!("loc{index}"), target, init)
            })
            .collect();
        for (name, var_type, init) in locals {
            self.blocks[0].push(Inst::new(InstKind::DeclareLocal {
                name,
                var_type,
                init,
            }));
        }
    }

    // ---- plumbing -------------------------------------------------------

    fn emit_raw(&mut self, kind: InstKind, offset: u32) {
        let debug = self
            .visible_points
            .get(&offset)
            .map(|(file, line, column)| DebugInfo {
                file: file.clone(),
                line: *line,
                column: *column,
                il_offset: offset,
            });
        self.blocks[self.current].push(Inst::with_debug(kind, debug));
    }

    fn temp(&mut self) -> String {
        let name = format!("__t{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }

    fn push(&mut self, name: String, ty: String) {
        self.stack.push(StackEntry { name, ty });
    }

    fn pop(&mut self) -> Result<StackEntry, Fault> {
        self.stack
            .pop()
            .ok_or_else(|| Fault::lowering("evaluation stack underflow"))
    }

    fn label_of(&self, target: u32) -> Result<String, Fault> {
        self.label_by_offset
            .get(&target)
            .cloned()
            .ok_or_else(|| Fault::lowering(format!("branch target IL_{target:04x} is not a block")))
    }

    fn enter_block(&mut self, offset: u32) -> Result<(), Fault> {
        if !self.dead && !self.stack.is_empty() {
            return Err(Fault::lowering(
                "evaluation stack not empty at basic-block join",
            ));
        }
        self.stack.clear();
        self.dead = false;
        let label = self.label_of(offset)?;
        let id: usize = label
            .strip_prefix("BB_")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.current = id;
        self.emit_raw(InstKind::Label { name: label }, offset);
        Ok(())
    }

    /// Events strictly before `offset` (TryEnd of regions whose last
    /// handler ended earlier).
    fn emit_events_before(&mut self, offset: u32) {
        while self.next_event < self.events.len() && self.events[self.next_event].0 < offset {
            let event = self.events[self.next_event].2.clone();
            let at = self.events[self.next_event].0;
            self.next_event += 1;
            self.emit_event(event, at);
        }
    }

    fn emit_events_at(&mut self, offset: u32) {
        while self.next_event < self.events.len() && self.events[self.next_event].0 == offset {
            let event = self.events[self.next_event].2.clone();
            self.next_event += 1;
            self.emit_event(event, offset);
        }
    }

    fn flush_events(&mut self) {
        while self.next_event < self.events.len() {
            let (at, _, event) = self.events[self.next_event].clone();
            self.next_event += 1;
            self.emit_event(event, at);
        }
    }

    fn emit_event(&mut self, event: EhEvent, offset: u32) {
        match event {
            EhEvent::TryBegin => self.emit_raw(InstKind::TryBegin, offset),
            EhEvent::CatchBegin(catch_type) => {
                // Handler entries are reached by runtime dispatch, never by
                // fallthrough: dead-code suppression resets here.
                self.dead = false;
                self.stack.clear();
                let cil = self.subst(&catch_type);
                let variable = format!("__exc{}", self.exc_counter);
                self.exc_counter += 1;
                self.emit_raw(
                    InstKind::CatchBegin {
                        exception_type: self.ctx.target_type(&cil),
                        variable: Some(variable.clone()),
                    },
                    offset,
                );
                self.push(variable, cil);
            }
            EhEvent::FinallyBegin => {
                self.dead = false;
                self.stack.clear();
                self.emit_raw(InstKind::FinallyBegin, offset);
            }
            EhEvent::FaultBegin => {
                self.dead = false;
                self.stack.clear();
                self.emit_raw(InstKind::Comment("fault handler".into()), offset);
                self.emit_raw(InstKind::FinallyBegin, offset);
            }
            EhEvent::FilterBegin => {
                self.dead = false;
                self.stack.clear();
                self.emit_raw(InstKind::FilterBegin, offset);
                self.emit_raw(
                    InstKind::DeclareLocal {
                        name: "__filter_result".into(),
                        var_type: "int32_t".into(),
                        init: Some("0".into()),
                    },
                    offset,
                );
                self.push("cil2cpp::current_exception()".into(), "System.Object".into());
            }
            EhEvent::FilterHandlerBegin => {
                self.dead = false;
                self.stack.clear();
                self.emit_raw(InstKind::FilterHandlerBegin, offset);
                self.push("cil2cpp::current_exception()".into(), "System.Object".into());
            }
            EhEvent::TryEnd => self.emit_raw(InstKind::TryEnd, offset),
        }
    }

    /// True when a `leave` from `offset` to `target` exits a region whose
    /// handler is a finally; the emitter inserts the finally epilogue on
    /// the natural exit path, so no goto is emitted.
    fn leave_suppressed(&self, offset: u32, target: u32) -> bool {
        self.body.eh.iter().any(|clause| {
            matches!(clause.kind, EhKind::Finally)
                && clause.try_offset <= offset
                && offset < clause.try_end()
                && target >= clause.try_end()
        })
    }

    // ---- type helpers ---------------------------------------------------

    fn arg_entry(&self, index: usize) -> Result<(String, String), Fault> {
        if self.item.has_this {
            if index == 0 {
                return Ok(("__this".into(), self.item.type_name.clone()));
            }
            let position = index - 1;
            let name = self
                .item
                .param_names
                .get(position)
                .cloned()
                .ok_or_else(|| Fault::lowering(format!("argument {index} out of range")))?;
            let ty = self.item.param_types[position].clone();
            Ok((name, ty))
        } else {
            let name = self
                .item
                .param_names
                .get(index)
                .cloned()
                .ok_or_else(|| Fault::lowering(format!("argument {index} out of range")))?;
            let ty = self.item.param_types[index].clone();
            Ok((name, ty))
        }
    }

    fn local_type(&self, index: usize) -> String {
        self.body
            .locals
            .get(index)
            .map(|l| self.subst(&l.local_type))
            .unwrap_or_else(|| "System.Object".into())
    }

    fn wider(&self, a: &str, b: &str) -> String {
        fn rank(name: &str) -> u32 {
            match name {
                "System.Double" => 10,
                "System.Single" => 9,
                "System.UInt64" => 8,
                "System.Int64" => 7,
                "System.UIntPtr" => 6,
                "System.IntPtr" => 5,
                "System.UInt32" => 4,
                "System.Int32" => 3,
                "System.UInt16" | "System.Char" => 2,
                "System.Int16" => 2,
                "System.Byte" | "System.SByte" | "System.Boolean" => 1,
                _ => 0,
            }
        }
        if name_is_pointer_like(a) || name_is_pointer_like(b) {
            return "System.IntPtr".into();
        }
        if rank(a) >= rank(b) {
            a.to_string()
        } else {
            b.to_string()
        }
    }

    // ---- op helpers -----------------------------------------------------

    fn binop(&mut self, op: &str, offset: u32) -> Result<(), Fault> {
        let right = self.pop()?;
        let left = self.pop()?;
        let ty = self.wider(&left.ty, &right.ty);
        let result = self.temp();
        self.emit_raw(
            InstKind::BinaryOp {
                op: op.into(),
                left: left.name,
                right: right.name,
                result: result.clone(),
                result_type: self.ctx.target_type(&ty),
            },
            offset,
        );
        self.push(result, ty);
        Ok(())
    }

    fn checked_binop(&mut self, symbol: &str, offset: u32) -> Result<(), Fault> {
        let right = self.pop()?;
        let left = self.pop()?;
        let ty = self.wider(&left.ty, &right.ty);
        let result = self.temp();
        self.emit_raw(
            InstKind::Call {
                callee: symbol.into(),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver: None,
                args: vec![left.name, right.name],
                result: Some(result.clone()),
                result_type: Some(self.ctx.target_type(&ty)),
            },
            offset,
        );
        self.push(result, ty);
        Ok(())
    }

    fn compare(&mut self, op: &str, offset: u32) -> Result<(), Fault> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = self.temp();
        self.emit_raw(
            InstKind::BinaryOp {
                op: op.into(),
                left: left.name,
                right: right.name,
                result: result.clone(),
                result_type: "int32_t".into(),
            },
            offset,
        );
        self.push(result, "System.Int32".into());
        Ok(())
    }

    fn unop(&mut self, op: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let result = self.temp();
        let ty = value.ty.clone();
        self.emit_raw(
            InstKind::UnaryOp {
                op: op.into(),
                operand: value.name,
                result: result.clone(),
                result_type: self.ctx.target_type(&ty),
            },
            offset,
        );
        self.push(result, ty);
        Ok(())
    }

    fn convert(&mut self, cil_target: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let result = self.temp();
        self.emit_raw(
            InstKind::Convert {
                value: value.name,
                target_scalar: self.ctx.target_type(cil_target),
                result: result.clone(),
            },
            offset,
        );
        self.push(result, cil_target.to_string());
        Ok(())
    }

    fn checked_convert(&mut self, cil_target: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let result = self.temp();
        let scalar = self.ctx.target_type(cil_target);
        self.emit_raw(
            InstKind::Call {
                callee: format!("cil2cpp::checked_conv<{scalar}>"),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver: None,
                args: vec![value.name],
                result: Some(result.clone()),
                result_type: Some(scalar),
            },
            offset,
        );
        self.push(result, cil_target.to_string());
        Ok(())
    }

    fn cond_branch(&mut self, op: &str, target: u32, offset: u32) -> Result<(), Fault> {
        let right = self.pop()?;
        let left = self.pop()?;
        let condition = self.temp();
        self.emit_raw(
            InstKind::BinaryOp {
                op: op.into(),
                left: left.name,
                right: right.name,
                result: condition.clone(),
                result_type: "int32_t".into(),
            },
            offset,
        );
        let true_target = self.label_of(target)?;
        self.emit_raw(
            InstKind::ConditionalBranch {
                condition,
                true_target,
                false_target: None,
            },
            offset,
        );
        if !self.stack.is_empty() {
            return Err(Fault::lowering(
                "evaluation stack not empty at basic-block join",
            ));
        }
        Ok(())
    }

    fn load_indirect(&mut self, cil_type: &str, offset: u32) -> Result<(), Fault> {
        let address = self.pop()?;
        let result = self.temp();
        self.emit_raw(
            InstKind::LoadIndirect {
                address: address.name,
                value_type: self.ctx.target_type(cil_type),
                result: result.clone(),
            },
            offset,
        );
        self.push(result, cil_type.to_string());
        Ok(())
    }

    fn store_indirect(&mut self, cil_type: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let address = self.pop()?;
        self.emit_raw(
            InstKind::StoreIndirect {
                address: address.name,
                value_type: self.ctx.target_type(cil_type),
                value: value.name,
            },
            offset,
        );
        Ok(())
    }

    fn load_element(&mut self, cil_type: &str, offset: u32) -> Result<(), Fault> {
        let index = self.pop()?;
        let array = self.pop()?;
        let result = self.temp();
        self.emit_raw(
            InstKind::LoadArrayElement {
                array: array.name,
                index: index.name,
                element_type: self.ctx.target_type(cil_type),
                result: result.clone(),
            },
            offset,
        );
        self.push(result, cil_type.to_string());
        Ok(())
    }

    fn store_element(&mut self, cil_type: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let index = self.pop()?;
        let array = self.pop()?;
        self.emit_raw(
            InstKind::StoreArrayElement {
                array: array.name,
                index: index.name,
                element_type: self.ctx.target_type(cil_type),
                value: value.name,
            },
            offset,
        );
        Ok(())
    }

    fn assign_literal(&mut self, value: String, ty: &str, offset: u32) {
        let result = self.temp();
        self.emit_raw(
            InstKind::Assign {
                target: result.clone(),
                value,
            },
            offset,
        );
        self.push(result, ty.to_string());
    }

    // ---- the per-opcode table ------------------------------------------

    fn lower_op(&mut self, op: &CilOp, offset: u32, next_offset: u32) -> Result<(), Fault> {
        use CilOp::*;
        match op {
            Nop => self.emit_raw(InstKind::Comment("nop".into()), offset),
            Break => self.emit_raw(
                InstKind::RawTargetCode {
                    code: "cil2cpp::debug_break();".into(),
                    result: None,
                    result_type: None,
                },
                offset,
            ),

            Ldarg(n) => {
                let (name, ty) = self.arg_entry(*n as usize)?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::LoadArg {
                        arg: name,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, ty);
            }
            Ldarga(n) => {
                let (name, ty) = self.arg_entry(*n as usize)?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::UnaryOp {
                        op: "&".into(),
                        operand: name,
                        result: result.clone(),
                        result_type: format!("{}*", self.ctx.target_type(&ty)),
                    },
                    offset,
                );
                self.push(result, format!("{ty}&"));
            }
            Starg(n) => {
                let value = self.pop()?;
                let (name, _) = self.arg_entry(*n as usize)?;
                self.emit_raw(
                    InstKind::StoreArg {
                        arg: name,
                        value: value.name,
                    },
                    offset,
                );
            }
            Ldloc(n) => {
                let ty = self.local_type(*n as usize);
                let result = self.temp();
                self.emit_raw(
                    InstKind::LoadLocal {
                        local: format!("loc{n}"),
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, ty);
            }
            Ldloca(n) => {
                let ty = self.local_type(*n as usize);
                let result = self.temp();
                self.emit_raw(
                    InstKind::UnaryOp {
                        op: "&".into(),
                        operand: format!("loc{n}"),
                        result: result.clone(),
                        result_type: format!("{}*", self.ctx.target_type(&ty)),
                    },
                    offset,
                );
                self.push(result, format!("{ty}&"));
            }
            Stloc(n) => {
                let value = self.pop()?;
                self.emit_raw(
                    InstKind::StoreLocal {
                        local: format!("loc{n}"),
                        value: value.name,
                    },
                    offset,
                );
            }

            Ldnull => self.assign_literal("nullptr".into(), "System.Object", offset),
            LdcI4(v) => self.assign_literal(v.to_string(), "System.Int32", offset),
            LdcI8(v) => self.assign_literal(format!("{v}LL"), "System.Int64", offset),
            LdcR4(v) => self.assign_literal(format!("{v:?}f"), "System.Single", offset),
            LdcR8(v) => self.assign_literal(format!("{v:?}"), "System.Double", offset),
            Ldstr(value) => {
                let id = self
                    .ctx
                    .module
                    .string_literal_id(value)
                    .map(str::to_string)
                    .ok_or_else(|| Fault::lowering("string literal not interned"))?;
                self.assign_literal(id, "System.String", offset);
            }

            Dup => {
                let top = self.pop()?;
                self.stack.push(top.clone());
                self.stack.push(top);
            }
            Pop => {
                self.pop()?;
            }

            Jmp(mref) => {
                self.lower_call(mref, CallKind::Normal, offset)?;
                let value = if self.item.return_cil != "System.Void" {
                    Some(self.pop()?.name)
                } else {
                    None
                };
                self.emit_raw(InstKind::Return { value }, offset);
                self.dead = true;
            }
            Call(mref) => self.lower_call(mref, CallKind::Normal, offset)?,
            CallVirt(mref) => self.lower_call(mref, CallKind::Virtual, offset)?,
            Calli(sig) => {
                let function = self.pop()?;
                let mut args = Vec::with_capacity(sig.params.len());
                for _ in 0..sig.params.len() {
                    args.push(self.pop()?.name);
                }
                args.reverse();
                let ret_cil = self.subst(&sig.return_type);
                let ret = self.ctx.target_type(&ret_cil);
                let param_list: Vec<String> = sig
                    .params
                    .iter()
                    .map(|p| self.ctx.target_type(&self.subst(p)))
                    .collect();
                let (result, result_name) = if ret_cil == "System.Void" {
                    (None, None)
                } else {
                    let t = self.temp();
                    (Some(t.clone()), Some(t))
                };
                let assign = result
                    .as_ref()
                    .map(|r| format!("{r} = "))
                    .unwrap_or_default();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "{assign}(({ret}(*)({}))({}))({});",
                            param_list.join(", "),
                            function.name,
                            args.join(", ")
                        ),
                        result: result.clone(),
                        result_type: result.as_ref().map(|_| ret),
                    },
                    offset,
                );
                if let Some(name) = result_name {
                    self.push(name, ret_cil);
                }
            }
            Ret => {
                let value = if self.item.return_cil != "System.Void" {
                    Some(self.pop()?.name)
                } else {
                    None
                };
                self.emit_raw(InstKind::Return { value }, offset);
                self.dead = true;
            }

            Br(target) => {
                let label = self.label_of(*target)?;
                self.emit_raw(InstKind::Branch { target: label }, offset);
                if !self.stack.is_empty() {
                    return Err(Fault::lowering(
                        "evaluation stack not empty at basic-block join",
                    ));
                }
                self.dead = true;
            }
            BrTrue(target) => {
                let condition = self.pop()?;
                let true_target = self.label_of(*target)?;
                self.emit_raw(
                    InstKind::ConditionalBranch {
                        condition: condition.name,
                        true_target,
                        false_target: None,
                    },
                    offset,
                );
            }
            BrFalse(target) => {
                let value = self.pop()?;
                let condition = self.temp();
                self.emit_raw(
                    InstKind::UnaryOp {
                        op: "!".into(),
                        operand: value.name,
                        result: condition.clone(),
                        result_type: "int32_t".into(),
                    },
                    offset,
                );
                let true_target = self.label_of(*target)?;
                self.emit_raw(
                    InstKind::ConditionalBranch {
                        condition,
                        true_target,
                        false_target: None,
                    },
                    offset,
                );
            }
            Beq(t) => self.cond_branch("==", *t, offset)?,
            Bge(t) => self.cond_branch(">=", *t, offset)?,
            Bgt(t) => self.cond_branch(">", *t, offset)?,
            Ble(t) => self.cond_branch("<=", *t, offset)?,
            Blt(t) => self.cond_branch("<", *t, offset)?,
            BneUn(t) => self.cond_branch("!=", *t, offset)?,
            BgeUn(t) => self.cond_branch(">=", *t, offset)?,
            BgtUn(t) => self.cond_branch(">", *t, offset)?,
            BleUn(t) => self.cond_branch("<=", *t, offset)?,
            BltUn(t) => self.cond_branch("<", *t, offset)?,
            Switch(targets) => {
                let value = self.pop()?;
                let mut labels = Vec::with_capacity(targets.len());
                for target in targets {
                    labels.push(self.label_of(*target)?);
                }
                let default = self.label_of(next_offset).ok();
                self.emit_raw(
                    InstKind::Switch {
                        value: value.name,
                        targets: labels,
                        default,
                    },
                    offset,
                );
                if !self.stack.is_empty() {
                    return Err(Fault::lowering(
                        "evaluation stack not empty at basic-block join",
                    ));
                }
            }
            Leave(target) => {
                self.stack.clear();
                if self.leave_suppressed(offset, *target) {
                    // The finally epilogue runs on the natural exit path;
                    // an explicit goto would bypass it.
                    self.emit_raw(
                        InstKind::Comment(format!("leave -> IL_{target:04x}")),
                        offset,
                    );
                } else {
                    let label = self.label_of(*target)?;
                    self.emit_raw(InstKind::Branch { target: label }, offset);
                }
                self.dead = true;
            }

            LdindI1 => self.load_indirect("System.SByte", offset)?,
            LdindU1 => self.load_indirect("System.Byte", offset)?,
            LdindI2 => self.load_indirect("System.Int16", offset)?,
            LdindU2 => self.load_indirect("System.UInt16", offset)?,
            LdindI4 => self.load_indirect("System.Int32", offset)?,
            LdindU4 => self.load_indirect("System.UInt32", offset)?,
            LdindI8 => self.load_indirect("System.Int64", offset)?,
            LdindI => self.load_indirect("System.IntPtr", offset)?,
            LdindR4 => self.load_indirect("System.Single", offset)?,
            LdindR8 => self.load_indirect("System.Double", offset)?,
            LdindRef => self.load_indirect("System.Object", offset)?,
            StindRef => self.store_indirect("System.Object", offset)?,
            StindI1 => self.store_indirect("System.SByte", offset)?,
            StindI2 => self.store_indirect("System.Int16", offset)?,
            StindI4 => self.store_indirect("System.Int32", offset)?,
            StindI8 => self.store_indirect("System.Int64", offset)?,
            StindR4 => self.store_indirect("System.Single", offset)?,
            StindR8 => self.store_indirect("System.Double", offset)?,
            StindI => self.store_indirect("System.IntPtr", offset)?,

            Add => self.binop("+", offset)?,
            Sub => self.binop("-", offset)?,
            Mul => self.binop("*", offset)?,
            Div | DivUn => self.binop("/", offset)?,
            Rem | RemUn => self.binop("%", offset)?,
            And => self.binop("&", offset)?,
            Or => self.binop("|", offset)?,
            Xor => self.binop("^", offset)?,
            Shl => self.binop("<<", offset)?,
            Shr | ShrUn => self.binop(">>", offset)?,
            Neg => self.unop("-", offset)?,
            Not => self.unop("~", offset)?,
            AddOvf | AddOvfUn => self.checked_binop("cil2cpp::checked_add", offset)?,
            SubOvf | SubOvfUn => self.checked_binop("cil2cpp::checked_sub", offset)?,
            MulOvf | MulOvfUn => self.checked_binop("cil2cpp::checked_mul", offset)?,

            Ceq => self.compare("==", offset)?,
            Cgt | CgtUn => self.compare(">", offset)?,
            Clt | CltUn => self.compare("<", offset)?,

            ConvI1 => self.convert("System.SByte", offset)?,
            ConvI2 => self.convert("System.Int16", offset)?,
            ConvI4 => self.convert("System.Int32", offset)?,
            ConvI8 => self.convert("System.Int64", offset)?,
            ConvR4 => self.convert("System.Single", offset)?,
            ConvR8 => self.convert("System.Double", offset)?,
            ConvU1 => self.convert("System.Byte", offset)?,
            ConvU2 => self.convert("System.UInt16", offset)?,
            ConvU4 => self.convert("System.UInt32", offset)?,
            ConvU8 => self.convert("System.UInt64", offset)?,
            ConvI => self.convert("System.IntPtr", offset)?,
            ConvU => self.convert("System.UIntPtr", offset)?,
            ConvRUn => {
                // Unsigned-to-float: re-interpret at the source width first
                // so sign extension cannot leak into the widening.
                let source_ty = self
                    .stack
                    .last()
                    .map(|e| e.ty.clone())
                    .unwrap_or_else(|| "System.UInt32".into());
                if let Some(unsigned) = unsigned_of_same_width(&source_ty) {
                    self.convert(unsigned, offset)?;
                }
                self.convert("System.Double", offset)?;
            }
            ConvOvfI1 | ConvOvfI1Un => self.checked_convert("System.SByte", offset)?,
            ConvOvfI2 | ConvOvfI2Un => self.checked_convert("System.Int16", offset)?,
            ConvOvfI4 | ConvOvfI4Un => self.checked_convert("System.Int32", offset)?,
            ConvOvfI8 | ConvOvfI8Un => self.checked_convert("System.Int64", offset)?,
            ConvOvfU1 | ConvOvfU1Un => self.checked_convert("System.Byte", offset)?,
            ConvOvfU2 | ConvOvfU2Un => self.checked_convert("System.UInt16", offset)?,
            ConvOvfU4 | ConvOvfU4Un => self.checked_convert("System.UInt32", offset)?,
            ConvOvfU8 | ConvOvfU8Un => self.checked_convert("System.UInt64", offset)?,
            ConvOvfI | ConvOvfIUn => self.checked_convert("System.IntPtr", offset)?,
            ConvOvfU | ConvOvfUUn => self.checked_convert("System.UIntPtr", offset)?,

            Ldfld(fref) => {
                let object = self.pop()?;
                let fref = self.subst_field(fref);
                let (mangled, field_ty) = self.ctx.field_info(&fref);
                let result = self.temp();
                self.emit_raw(
                    InstKind::LoadField {
                        object: object.name,
                        field: mangled,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, field_ty);
            }
            Ldflda(fref) => {
                let object = self.pop()?;
                let fref = self.subst_field(fref);
                let (mangled, field_ty) = self.ctx.field_info(&fref);
                let result = self.temp();
                let target = self.ctx.target_type(&field_ty);
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("{result} = &{}->{mangled};", object.name),
                        result: Some(result.clone()),
                        result_type: Some(format!("{target}*")),
                    },
                    offset,
                );
                self.push(result, format!("{field_ty}&"));
            }
            Stfld(fref) => {
                let value = self.pop()?;
                let object = self.pop()?;
                let fref = self.subst_field(fref);
                let (mangled, _) = self.ctx.field_info(&fref);
                self.emit_raw(
                    InstKind::StoreField {
                        object: object.name,
                        field: mangled,
                        value: value.name,
                    },
                    offset,
                );
            }
            Ldsfld(fref) => {
                let fref = self.subst_field(fref);
                self.static_guard(&fref.owner, offset);
                let (mangled, field_ty) = self.ctx.field_info(&fref);
                let owner = self.ctx.names.peek_type(&fref.owner);
                let result = self.temp();
                self.emit_raw(
                    InstKind::LoadStaticField {
                        owner,
                        field: mangled,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, field_ty);
            }
            Ldsflda(fref) => {
                let fref = self.subst_field(fref);
                self.static_guard(&fref.owner, offset);
                let (mangled, field_ty) = self.ctx.field_info(&fref);
                let owner = self.ctx.names.peek_type(&fref.owner);
                let result = self.temp();
                let target = self.ctx.target_type(&field_ty);
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("{result} = &{owner}_statics.{mangled};"),
                        result: Some(result.clone()),
                        result_type: Some(format!("{target}*")),
                    },
                    offset,
                );
                self.push(result, format!("{field_ty}&"));
            }
            Stsfld(fref) => {
                let value = self.pop()?;
                let fref = self.subst_field(fref);
                self.static_guard(&fref.owner, offset);
                let (mangled, _) = self.ctx.field_info(&fref);
                let owner = self.ctx.names.peek_type(&fref.owner);
                self.emit_raw(
                    InstKind::StoreStaticField {
                        owner,
                        field: mangled,
                        value: value.name,
                    },
                    offset,
                );
            }

            Newobj(mref) => self.lower_call(mref, CallKind::NewObj, offset)?,
            Castclass(t) => {
                let value = self.pop()?;
                let cil = self.subst(t);
                let result = self.temp();
                self.emit_raw(
                    InstKind::Cast {
                        value: value.name,
                        target_type: self.ctx.target_type(&cil),
                        safe: false,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, cil);
            }
            Isinst(t) => {
                let value = self.pop()?;
                let cil = self.subst(t);
                let result = self.temp();
                self.emit_raw(
                    InstKind::Cast {
                        value: value.name,
                        target_type: self.ctx.target_type(&cil),
                        safe: true,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, cil);
            }
            Unbox(t) | UnboxAny(t) => {
                let cil = self.subst(t);
                if !self.ctx.is_value_type(&cil) {
                    // unbox.any on a reference type is exactly castclass.
                    let value = self.pop()?;
                    let result = self.temp();
                    self.emit_raw(
                        InstKind::Cast {
                            value: value.name,
                            target_type: self.ctx.target_type(&cil),
                            safe: false,
                            result: result.clone(),
                        },
                        offset,
                    );
                    self.push(result, cil);
                } else {
                    let value = self.pop()?;
                    let result = self.temp();
                    self.emit_raw(
                        InstKind::Unbox {
                            value: value.name,
                            value_type_cpp_name: self.ctx.target_type(&cil),
                            result: result.clone(),
                        },
                        offset,
                    );
                    let pushed = if matches!(op, Unbox(_)) {
                        format!("{cil}&")
                    } else {
                        cil
                    };
                    self.push(result, pushed);
                }
            }
            Box(t) => {
                let cil = self.subst(t);
                if let Some(inner) = nullable_argument(&cil) {
                    self.lower_nullable_box(&cil, &inner, offset)?;
                } else {
                    let value = self.pop()?;
                    let result = self.temp();
                    self.emit_raw(
                        InstKind::Box {
                            value: value.name,
                            value_type_cpp_name: self.ctx.target_type(&cil),
                            result: result.clone(),
                        },
                        offset,
                    );
                    self.push(result, "System.Object".into());
                }
            }

            Throw => {
                let exception = self.pop()?;
                self.emit_raw(
                    InstKind::Throw {
                        exception: exception.name,
                    },
                    offset,
                );
                self.dead = true;
            }
            Rethrow => {
                self.emit_raw(InstKind::Rethrow, offset);
                self.dead = true;
            }

            StObj(t) => {
                let cil = self.subst(t);
                self.store_indirect(&cil, offset)?;
            }
            LdObj(t) => {
                let cil = self.subst(t);
                self.load_indirect(&cil, offset)?;
            }
            CpObj(t) => {
                let cil = self.subst(t);
                let source = self.pop()?;
                let dest = self.pop()?;
                let target = self.ctx.target_type(&cil);
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "*({target}*){} = *({target}*){};",
                            dest.name, source.name
                        ),
                        result: None,
                        result_type: None,
                    },
                    offset,
                );
            }
            InitObj(t) => {
                let cil = self.subst(t);
                let address = self.pop()?;
                let target = self.ctx.target_type(&cil);
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("std::memset({}, 0, sizeof({target}));", address.name),
                        result: None,
                        result_type: None,
                    },
                    offset,
                );
            }

            Newarr(t) => {
                let cil = self.subst(t);
                let length = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::NewArray {
                        element_type: self.ctx.target_type(&cil),
                        length: length.name,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, format!("{cil}[]"));
            }
            Ldlen => {
                let array = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::Call {
                        callee: "cil2cpp::array_length".into(),
                        is_virtual: false,
                        vtable_slot: -1,
                        is_interface_call: false,
                        receiver: None,
                        args: vec![array.name],
                        result: Some(result.clone()),
                        result_type: Some("intptr_t".into()),
                    },
                    offset,
                );
                self.push(result, "System.IntPtr".into());
            }
            Ldelema(t) => {
                let cil = self.subst(t);
                let index = self.pop()?;
                let array = self.pop()?;
                let target = self.ctx.target_type(&cil);
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "{result} = cil2cpp::array_data<{target}>({}) + {};",
                            array.name, index.name
                        ),
                        result: Some(result.clone()),
                        result_type: Some(format!("{target}*")),
                    },
                    offset,
                );
                self.push(result, format!("{cil}&"));
            }
            LdelemI1 => self.load_element("System.SByte", offset)?,
            LdelemU1 => self.load_element("System.Byte", offset)?,
            LdelemI2 => self.load_element("System.Int16", offset)?,
            LdelemU2 => self.load_element("System.UInt16", offset)?,
            LdelemI4 => self.load_element("System.Int32", offset)?,
            LdelemU4 => self.load_element("System.UInt32", offset)?,
            LdelemI8 => self.load_element("System.Int64", offset)?,
            LdelemI => self.load_element("System.IntPtr", offset)?,
            LdelemR4 => self.load_element("System.Single", offset)?,
            LdelemR8 => self.load_element("System.Double", offset)?,
            LdelemRef => self.load_element("System.Object", offset)?,
            StelemI => self.store_element("System.IntPtr", offset)?,
            StelemI1 => self.store_element("System.SByte", offset)?,
            StelemI2 => self.store_element("System.Int16", offset)?,
            StelemI4 => self.store_element("System.Int32", offset)?,
            StelemI8 => self.store_element("System.Int64", offset)?,
            StelemR4 => self.store_element("System.Single", offset)?,
            StelemR8 => self.store_element("System.Double", offset)?,
            StelemRef => self.store_element("System.Object", offset)?,
            Ldelem(t) => {
                let cil = self.subst(t);
                self.load_element(&cil, offset)?;
            }
            Stelem(t) => {
                let cil = self.subst(t);
                self.store_element(&cil, offset)?;
            }

            RefAnyVal(t) => {
                let cil = self.subst(t);
                let typedref = self.pop()?;
                let target = self.ctx.target_type(&cil);
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "{result} = cil2cpp::typedref_value<{target}>({});",
                            typedref.name
                        ),
                        result: Some(result.clone()),
                        result_type: Some(format!("{target}*")),
                    },
                    offset,
                );
                self.push(result, format!("{cil}&"));
            }
            MkRefAny(t) => {
                let cil = self.subst(t);
                let address = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "{result} = cil2cpp::typedref_make({}, &{}_typeinfo);",
                            address.name,
                            self.ctx.names.peek_type(&cil)
                        ),
                        result: Some(result.clone()),
                        result_type: Some("cil2cpp::TypedReference".into()),
                    },
                    offset,
                );
                self.push(result, "System.TypedReference".into());
            }
            RefAnyType => {
                let typedref = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("{result} = cil2cpp::typedref_type({});", typedref.name),
                        result: Some(result.clone()),
                        result_type: Some("cil2cpp::TypeInfo*".into()),
                    },
                    offset,
                );
                self.push(result, "System.RuntimeTypeHandle".into());
            }
            CkFinite => {
                let value = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::Call {
                        callee: "cil2cpp::ckfinite".into(),
                        is_virtual: false,
                        vtable_slot: -1,
                        is_interface_call: false,
                        receiver: None,
                        args: vec![value.name],
                        result: Some(result.clone()),
                        result_type: Some("double".into()),
                    },
                    offset,
                );
                self.push(result, "System.Double".into());
            }
            ArgList => {
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("{result} = cil2cpp::arglist_handle();"),
                        result: Some(result.clone()),
                        result_type: Some("cil2cpp::ArgIterator".into()),
                    },
                    offset,
                );
                self.push(result, "System.RuntimeArgumentHandle".into());
            }

            Ldtoken(token) => match token {
                TokenRef::Type(t) => {
                    let cil = self.subst(t);
                    let mangled = self.ctx.names.peek_type(&cil);
                    self.assign_literal(
                        format!("&{mangled}_typeinfo"),
                        "System.RuntimeTypeHandle",
                        offset,
                    );
                }
                TokenRef::Method(m) => {
                    let symbol = self.ctx.method_symbol(&self.subst(&m.owner), m);
                    self.assign_literal(
                        format!("(void*)&{symbol}"),
                        "System.RuntimeMethodHandle",
                        offset,
                    );
                }
                TokenRef::Field(f) => {
                    let key = (self.subst(&f.owner), f.name.clone());
                    let value = match self.ctx.blob_ids.get(&key) {
                        Some(id) => id.clone(),
                        None => format!(
                            "&{}_{}_field",
                            self.ctx.names.peek_type(&key.0),
                            f.name
                        ),
                    };
                    self.assign_literal(value, "System.RuntimeFieldHandle", offset);
                }
            },

            EndFinally => {
                self.emit_raw(InstKind::Comment("end finally".into()), offset);
                self.stack.clear();
                self.dead = true;
            }
            EndFilter => {
                let verdict = self.pop()?;
                self.emit_raw(
                    InstKind::Assign {
                        target: "__filter_result".into(),
                        value: verdict.name,
                    },
                    offset,
                );
                self.emit_raw(
                    InstKind::EndFilter {
                        result: "__filter_result".into(),
                    },
                    offset,
                );
                self.stack.clear();
                self.dead = true;
            }

            Ldftn(mref) => self.lower_call(mref, CallKind::LoadFn, offset)?,
            Ldvirtftn(mref) => self.lower_call(mref, CallKind::LoadVirtualFn, offset)?,

            LocAlloc => {
                let size = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!("{result} = cil2cpp::stack_alloc({});", size.name),
                        result: Some(result.clone()),
                        result_type: Some("uint8_t*".into()),
                    },
                    offset,
                );
                self.push(result, "System.IntPtr".into());
            }
            CpBlk => {
                let size = self.pop()?;
                let source = self.pop()?;
                let dest = self.pop()?;
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "std::memcpy({}, {}, {});",
                            dest.name, source.name, size.name
                        ),
                        result: None,
                        result_type: None,
                    },
                    offset,
                );
            }
            InitBlk => {
                let size = self.pop()?;
                let value = self.pop()?;
                let dest = self.pop()?;
                self.emit_raw(
                    InstKind::RawTargetCode {
                        code: format!(
                            "std::memset({}, {}, {});",
                            dest.name, value.name, size.name
                        ),
                        result: None,
                        result_type: None,
                    },
                    offset,
                );
            }
            SizeOf(t) => {
                let cil = self.subst(t);
                let target = self.ctx.target_type(&cil);
                self.assign_literal(format!("sizeof({target})"), "System.UInt32", offset);
            }

            Constrained(t) => self.constrained = Some(self.subst(t)),
            Volatile | Tail | Readonly => {}
            Unaligned(_) | NoCheck(_) => {}
        }
        Ok(())
    }

    fn subst_field(&self, fref: &FieldRef) -> FieldRef {
        FieldRef {
            owner: self.subst(&fref.owner),
            name: fref.name.clone(),
            field_type: self.subst(&fref.field_type),
        }
    }

    fn static_guard(&mut self, owner: &str, offset: u32) {
        if self.ctx.has_cctor(owner) {
            let type_name = self.ctx.names.peek_type(owner);
            self.emit_raw(InstKind::StaticCtorGuard { type_name }, offset);
        }
    }

    /// `box Nullable<T>` never boxes the whole struct: the runtime object
    /// exists only when `hasValue` is set, otherwise the result is null.
    fn lower_nullable_box(&mut self, _nullable: &str, inner: &str, offset: u32) -> Result<(), Fault> {
        let value = self.pop()?;
        let has_value = self.temp();
        self.emit_raw(
            InstKind::LoadField {
                object: value.name.clone(),
                field: "f_hasValue".into(),
                result: has_value.clone(),
            },
            offset,
        );
        let payload = self.temp();
        self.emit_raw(
            InstKind::LoadField {
                object: value.name,
                field: "f_value".into(),
                result: payload.clone(),
            },
            offset,
        );
        let mangled = self.ctx.names.peek_type(inner);
        let result = self.temp();
        self.emit_raw(
            InstKind::RawTargetCode {
                code: format!(
                    "{result} = {has_value} ? cil2cpp::box(&{payload}, &{mangled}_typeinfo) : nullptr;"
                ),
                result: Some(result.clone()),
                result_type: Some("cil2cpp::Object*".into()),
            },
            offset,
        );
        self.push(result, "System.Object".into());
        Ok(())
    }

    // ---- call lowering --------------------------------------------------

    fn lower_call(&mut self, mref: &MethodRef, kind: CallKind, offset: u32) -> Result<(), Fault> {
        let constrained = self.constrained.take();

        // Substitute the whole reference once.
        let mref = MethodRef {
            owner: self.subst(&mref.owner),
            name: mref.name.clone(),
            has_this: mref.has_this,
            return_type: self.subst(&mref.return_type),
            params: mref.params.iter().map(|p| self.subst(p)).collect(),
            generic_args: mref.generic_args.iter().map(|a| self.subst(a)).collect(),
        };
        let arity = mref.params.len();

        // `constrained.` + a static abstract interface member is not
        // modeled; fail the method instead of guessing dispatch.
        if constrained.is_some()
            && !mref.has_this
            && self.ctx.is_interface(&peel_composite(&mref.owner).element)
        {
            return Err(Fault::lowering(
                "constrained call to a static abstract interface member",
            ));
        }

        // Multi-dimensional array accessors route through MdArray icalls,
        // rank as the first operand.
        if let Some(rank) = md_array_rank(&mref.owner) {
            return self.lower_mdarray_call(&mref, kind, rank, offset);
        }

        // Delegates: creation and invocation have dedicated instructions.
        if self.ctx.is_delegate(&mref.owner) {
            if kind == CallKind::NewObj {
                let function = self.pop()?;
                let object = self.pop()?;
                let result = self.temp();
                self.emit_raw(
                    InstKind::DelegateCreate {
                        delegate_type: self.ctx.names.peek_type(&mref.owner),
                        object: object.name,
                        function: function.name,
                        result: result.clone(),
                    },
                    offset,
                );
                self.push(result, mref.owner.clone());
                return Ok(());
            }
            if mref.name == "Invoke" {
                let mut args = Vec::with_capacity(arity);
                for _ in 0..arity {
                    args.push(self.pop()?.name);
                }
                args.reverse();
                let delegate = self.pop()?;
                let (result, push_ty) = self.call_result(&mref);
                self.emit_raw(
                    InstKind::DelegateInvoke {
                        delegate: delegate.name,
                        args,
                        result: result.clone(),
                        result_type: result
                            .as_ref()
                            .map(|_| self.ctx.target_type(&mref.return_type)),
                    },
                    offset,
                );
                if let (Some(name), Some(ty)) = (result, push_ty) {
                    self.push(name, ty);
                }
                return Ok(());
            }
        }

        // Function-pointer loads.
        if matches!(kind, CallKind::LoadFn | CallKind::LoadVirtualFn) {
            let symbol = self.ctx.method_symbol(&mref.owner, &mref);
            let result = self.temp();
            self.emit_raw(
                InstKind::LoadFunctionPointer {
                    method: symbol,
                    is_virtual: kind == CallKind::LoadVirtualFn,
                    result: result.clone(),
                },
                offset,
            );
            self.push(result, "System.IntPtr".into());
            return Ok(());
        }

        // ICall registry: redirect to the runtime primitive.
        let first_param = mref.params.first().map(String::as_str);
        let owner_element = peel_composite(&mref.owner).element;
        if let Some(entry) = icalls::lookup(&owner_element, &mref.name, arity, first_param) {
            return self.lower_icall(entry, &mref, kind, offset);
        }

        if kind == CallKind::NewObj {
            return self.lower_newobj(&mref, offset);
        }

        // Dispatch decision. `callvirt` on a value-type receiver is a
        // direct call; a constrained value-type receiver likewise.
        let owner_is_value = self.ctx.is_value_type(&owner_element);
        let owner_is_interface = self.ctx.is_interface(&owner_element);
        let mut is_virtual = kind == CallKind::Virtual && !owner_is_value;
        if let Some(constraint) = &constrained {
            if self.ctx.is_value_type(constraint) {
                is_virtual = false;
            }
        }
        let (vtable_slot, is_interface_call) = if is_virtual {
            if owner_is_interface {
                (
                    self.ctx.interface_slot_of(&mref.owner, &mref.name, arity),
                    true,
                )
            } else {
                (
                    self.ctx.vtable_slot_of(&mref.owner, &mref.name, arity),
                    false,
                )
            }
        } else {
            (-1, false)
        };
        let is_virtual = is_virtual && (vtable_slot >= 0 || is_interface_call);

        // Static access guards initialization.
        if !mref.has_this {
            self.static_guard(&owner_element, offset);
        }

        let mut args = Vec::with_capacity(arity);
        for _ in 0..arity {
            args.push(self.pop()?.name);
        }
        args.reverse();
        let receiver = if mref.has_this {
            Some(self.pop()?.name)
        } else {
            None
        };

        let (result, push_ty) = self.call_result(&mref);
        let callee = self.ctx.method_symbol(&mref.owner, &mref);
        self.emit_raw(
            InstKind::Call {
                callee,
                is_virtual,
                vtable_slot,
                is_interface_call,
                receiver,
                args,
                result: result.clone(),
                result_type: result
                    .as_ref()
                    .map(|_| self.ctx.target_type(&mref.return_type)),
            },
            offset,
        );
        if let (Some(name), Some(ty)) = (result, push_ty) {
            self.push(name, ty);
        }
        Ok(())
    }

    fn call_result(&mut self, mref: &MethodRef) -> (Option<String>, Option<String>) {
        if mref.return_type == "System.Void" {
            (None, None)
        } else {
            let t = self.temp();
            (Some(t), Some(mref.return_type.clone()))
        }
    }

    fn lower_newobj(&mut self, mref: &MethodRef, offset: u32) -> Result<(), Fault> {
        let arity = mref.params.len();
        let mut args = Vec::with_capacity(arity);
        for _ in 0..arity {
            args.push(self.pop()?.name);
        }
        args.reverse();
        let type_name = self.ctx.names.peek_type(&mref.owner);
        let ctor = self.ctx.method_symbol(&mref.owner, mref);
        let result = self.temp();
        self.emit_raw(
            InstKind::NewObj {
                type_name,
                ctor,
                args,
                result: result.clone(),
            },
            offset,
        );
        self.push(result, mref.owner.clone());
        Ok(())
    }

    fn lower_icall(
        &mut self,
        entry: &crate::icalls::ICallEntry,
        mref: &MethodRef,
        kind: CallKind,
        offset: u32,
    ) -> Result<(), Fault> {
        let arity = mref.params.len();
        let mut args = Vec::with_capacity(arity);
        for _ in 0..arity {
            args.push(self.pop()?.name);
        }
        args.reverse();
        // For RuntimeHelpers_InitializeArray the second argument's temp
        // already carries the blob id the field token resolved to.

        let receiver = if mref.has_this && kind != CallKind::NewObj {
            Some(self.pop()?.name)
        } else {
            None
        };
        let (result, push_ty) = self.call_result(mref);
        self.emit_raw(
            InstKind::Call {
                callee: icalls::qualified_symbol(entry),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver,
                args,
                result: result.clone(),
                result_type: result
                    .as_ref()
                    .map(|_| self.ctx.target_type(&mref.return_type)),
            },
            offset,
        );
        if let (Some(name), Some(ty)) = (result, push_ty) {
            self.push(name, ty);
        }
        Ok(())
    }

    fn lower_mdarray_call(
        &mut self,
        mref: &MethodRef,
        kind: CallKind,
        rank: usize,
        offset: u32,
    ) -> Result<(), Fault> {
        let arity = mref.params.len();
        let mut popped = Vec::with_capacity(arity);
        for _ in 0..arity {
            popped.push(self.pop()?.name);
        }
        popped.reverse();

        let (symbol, needs_receiver, returns) = if kind == CallKind::NewObj {
            ("mdarray_create", false, true)
        } else {
            match mref.name.as_str() {
                "Get" => ("mdarray_get", true, true),
                "Set" => ("mdarray_set", true, false),
                "Address" => ("mdarray_address", true, true),
                _ => ("mdarray_get", true, true),
            }
        };
        let receiver = if needs_receiver {
            Some(self.pop()?.name)
        } else {
            None
        };

        let mut args = vec![rank.to_string()];
        args.extend(popped);

        let result = returns.then(|| self.temp());
        self.emit_raw(
            InstKind::Call {
                callee: format!("{}::{}", icalls::ICALL_NAMESPACE, symbol),
                is_virtual: false,
                vtable_slot: -1,
                is_interface_call: false,
                receiver,
                args,
                result: result.clone(),
                result_type: result.as_ref().map(|_| {
                    if kind == CallKind::NewObj {
                        "cil2cpp::MdArray*".into()
                    } else {
                        self.ctx.target_type(&mref.return_type)
                    }
                }),
            },
            offset,
        );
        if let Some(name) = result {
            let ty = if kind == CallKind::NewObj {
                mref.owner.clone()
            } else {
                mref.return_type.clone()
            };
            self.push(name, ty);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Normal,
    Virtual,
    NewObj,
    LoadFn,
    LoadVirtualFn,
}

fn name_is_pointer_like(name: &str) -> bool {
    name.ends_with('*') || name.ends_with('&') || name == "System.IntPtr" || name == "System.UIntPtr"
}

/// `System.Nullable`1<T>` -> `T`.
fn nullable_argument(name: &str) -> Option<String> {
    let (open, args) = split_instantiation(name)?;
    (open == "System.Nullable`1").then(|| args.into_iter().next()).flatten()
}

fn unsigned_of_same_width(name: &str) -> Option<&'static str> {
    match name {
        "System.SByte" | "System.Byte" => Some("System.Byte"),
        "System.Int16" | "System.UInt16" => Some("System.UInt16"),
        "System.Int32" | "System.UInt32" => Some("System.UInt32"),
        _ => None,
    }
}

/// Rank of a multi-dimensional array name (`T[,]` -> 2); `None` for
/// single-dimension or non-arrays.
fn md_array_rank(name: &str) -> Option<usize> {
    let open = name.rfind('[')?;
    if !name.ends_with(']') {
        return None;
    }
    let inner = &name[open + 1..name.len() - 1];
    if inner.is_empty() || !inner.chars().all(|c| c == ',') {
        return None;
    }
    Some(inner.len() + 1)
}
