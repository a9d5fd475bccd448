//! The ECMA-335 CIL opcode set.
//!
//! Opcodes are held in normalized form: the short (`.s`) encodings and the
//! macro forms (`ldarg.0`…`ldarg.3`, `ldc.i4.m1`…`ldc.i4.8`) collapse into
//! the canonical variant at construction, so the lowerer's per-opcode table
//! matches one variant per semantic operation while [`from_mnemonic`]
//! still accounts for every mnemonic of partition III. Branch operands are
//! absolute IL offsets; the binary reader resolves relative displacements
//! before handing instructions to the model.
//!
//! [`from_mnemonic`]: CilOp::from_mnemonic

use std::fmt;

use super::model::{CallSig, FieldRef, MethodRef, TokenRef};

/// One decoded instruction with its IL offset.
#[derive(Clone, Debug, PartialEq)]
pub struct CilInst {
    pub offset: u32,
    pub op: CilOp,
}

impl CilInst {
    pub fn new(offset: u32, op: CilOp) -> Self {
        Self { offset, op }
    }
}

/// Operand payload used when constructing an op from a mnemonic.
#[derive(Clone, Debug, PartialEq)]
pub enum OperandValue {
    None,
    I32(i32),
    I64(i64),
    R4(f32),
    R8(f64),
    Var(u16),
    Target(u32),
    Switch(Vec<u32>),
    Method(MethodRef),
    Field(FieldRef),
    Type(String),
    Str(String),
    Sig(CallSig),
    Token(TokenRef),
    Byte(u8),
}

/// A mnemonic the table does not know, or a mnemonic paired with the wrong
/// operand kind. Surfaces as a `LoweringFailure` for the affected method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownOpcode {
    pub mnemonic: String,
}

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported IL instruction '{}'", self.mnemonic)
    }
}

impl std::error::Error for UnknownOpcode {}

/// Normalized CIL operation.
#[derive(Clone, Debug, PartialEq)]
pub enum CilOp {
    Nop,
    Break,
    Ldarg(u16),
    Ldarga(u16),
    Starg(u16),
    Ldloc(u16),
    Ldloca(u16),
    Stloc(u16),
    Ldnull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Dup,
    Pop,
    Jmp(MethodRef),
    Call(MethodRef),
    CallVirt(MethodRef),
    Calli(CallSig),
    Ret,
    Br(u32),
    BrFalse(u32),
    BrTrue(u32),
    Beq(u32),
    Bge(u32),
    Bgt(u32),
    Ble(u32),
    Blt(u32),
    BneUn(u32),
    BgeUn(u32),
    BgtUn(u32),
    BleUn(u32),
    BltUn(u32),
    Switch(Vec<u32>),
    LdindI1,
    LdindU1,
    LdindI2,
    LdindU2,
    LdindI4,
    LdindU4,
    LdindI8,
    LdindI,
    LdindR4,
    LdindR8,
    LdindRef,
    StindRef,
    StindI1,
    StindI2,
    StindI4,
    StindI8,
    StindR4,
    StindR8,
    StindI,
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,
    ConvU4,
    ConvU8,
    ConvU2,
    ConvU1,
    ConvI,
    ConvU,
    ConvRUn,
    ConvOvfI1,
    ConvOvfI2,
    ConvOvfI4,
    ConvOvfI8,
    ConvOvfU1,
    ConvOvfU2,
    ConvOvfU4,
    ConvOvfU8,
    ConvOvfI,
    ConvOvfU,
    ConvOvfI1Un,
    ConvOvfI2Un,
    ConvOvfI4Un,
    ConvOvfI8Un,
    ConvOvfU1Un,
    ConvOvfU2Un,
    ConvOvfU4Un,
    ConvOvfU8Un,
    ConvOvfIUn,
    ConvOvfUUn,
    CpObj(String),
    LdObj(String),
    Ldstr(String),
    Newobj(MethodRef),
    Castclass(String),
    Isinst(String),
    Unbox(String),
    UnboxAny(String),
    Box(String),
    Throw,
    Rethrow,
    Ldfld(FieldRef),
    Ldflda(FieldRef),
    Stfld(FieldRef),
    Ldsfld(FieldRef),
    Ldsflda(FieldRef),
    Stsfld(FieldRef),
    StObj(String),
    Newarr(String),
    Ldlen,
    Ldelema(String),
    LdelemI1,
    LdelemU1,
    LdelemI2,
    LdelemU2,
    LdelemI4,
    LdelemU4,
    LdelemI8,
    LdelemI,
    LdelemR4,
    LdelemR8,
    LdelemRef,
    StelemI,
    StelemI1,
    StelemI2,
    StelemI4,
    StelemI8,
    StelemR4,
    StelemR8,
    StelemRef,
    Ldelem(String),
    Stelem(String),
    RefAnyVal(String),
    CkFinite,
    MkRefAny(String),
    RefAnyType,
    Ldtoken(TokenRef),
    AddOvf,
    AddOvfUn,
    MulOvf,
    MulOvfUn,
    SubOvf,
    SubOvfUn,
    EndFinally,
    Leave(u32),
    EndFilter,
    ArgList,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    Ldftn(MethodRef),
    Ldvirtftn(MethodRef),
    LocAlloc,
    InitObj(String),
    CpBlk,
    InitBlk,
    SizeOf(String),
    // Prefixes; each modifies the instruction that follows it.
    Constrained(String),
    Volatile,
    Tail,
    Unaligned(u8),
    Readonly,
    NoCheck(u8),
}

impl CilOp {
    /// Canonical mnemonic for the normalized form.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CilOp::Nop => "nop",
            CilOp::Break => "break",
            CilOp::Ldarg(_) => "ldarg",
            CilOp::Ldarga(_) => "ldarga",
            CilOp::Starg(_) => "starg",
            CilOp::Ldloc(_) => "ldloc",
            CilOp::Ldloca(_) => "ldloca",
            CilOp::Stloc(_) => "stloc",
            CilOp::Ldnull => "ldnull",
            CilOp::LdcI4(_) => "ldc.i4",
            CilOp::LdcI8(_) => "ldc.i8",
            CilOp::LdcR4(_) => "ldc.r4",
            CilOp::LdcR8(_) => "ldc.r8",
            CilOp::Dup => "dup",
            CilOp::Pop => "pop",
            CilOp::Jmp(_) => "jmp",
            CilOp::Call(_) => "call",
            CilOp::CallVirt(_) => "callvirt",
            CilOp::Calli(_) => "calli",
            CilOp::Ret => "ret",
            CilOp::Br(_) => "br",
            CilOp::BrFalse(_) => "brfalse",
            CilOp::BrTrue(_) => "brtrue",
            CilOp::Beq(_) => "beq",
            CilOp::Bge(_) => "bge",
            CilOp::Bgt(_) => "bgt",
            CilOp::Ble(_) => "ble",
            CilOp::Blt(_) => "blt",
            CilOp::BneUn(_) => "bne.un",
            CilOp::BgeUn(_) => "bge.un",
            CilOp::BgtUn(_) => "bgt.un",
            CilOp::BleUn(_) => "ble.un",
            CilOp::BltUn(_) => "blt.un",
            CilOp::Switch(_) => "switch",
            CilOp::LdindI1 => "ldind.i1",
            CilOp::LdindU1 => "ldind.u1",
            CilOp::LdindI2 => "ldind.i2",
            CilOp::LdindU2 => "ldind.u2",
            CilOp::LdindI4 => "ldind.i4",
            CilOp::LdindU4 => "ldind.u4",
            CilOp::LdindI8 => "ldind.i8",
            CilOp::LdindI => "ldind.i",
            CilOp::LdindR4 => "ldind.r4",
            CilOp::LdindR8 => "ldind.r8",
            CilOp::LdindRef => "ldind.ref",
            CilOp::StindRef => "stind.ref",
            CilOp::StindI1 => "stind.i1",
            CilOp::StindI2 => "stind.i2",
            CilOp::StindI4 => "stind.i4",
            CilOp::StindI8 => "stind.i8",
            CilOp::StindR4 => "stind.r4",
            CilOp::StindR8 => "stind.r8",
            CilOp::StindI => "stind.i",
            CilOp::Add => "add",
            CilOp::Sub => "sub",
            CilOp::Mul => "mul",
            CilOp::Div => "div",
            CilOp::DivUn => "div.un",
            CilOp::Rem => "rem",
            CilOp::RemUn => "rem.un",
            CilOp::And => "and",
            CilOp::Or => "or",
            CilOp::Xor => "xor",
            CilOp::Shl => "shl",
            CilOp::Shr => "shr",
            CilOp::ShrUn => "shr.un",
            CilOp::Neg => "neg",
            CilOp::Not => "not",
            CilOp::ConvI1 => "conv.i1",
            CilOp::ConvI2 => "conv.i2",
            CilOp::ConvI4 => "conv.i4",
            CilOp::ConvI8 => "conv.i8",
            CilOp::ConvR4 => "conv.r4",
            CilOp::ConvR8 => "conv.r8",
            CilOp::ConvU4 => "conv.u4",
            CilOp::ConvU8 => "conv.u8",
            CilOp::ConvU2 => "conv.u2",
            CilOp::ConvU1 => "conv.u1",
            CilOp::ConvI => "conv.i",
            CilOp::ConvU => "conv.u",
            CilOp::ConvRUn => "conv.r.un",
            CilOp::ConvOvfI1 => "conv.ovf.i1",
            CilOp::ConvOvfI2 => "conv.ovf.i2",
            CilOp::ConvOvfI4 => "conv.ovf.i4",
            CilOp::ConvOvfI8 => "conv.ovf.i8",
            CilOp::ConvOvfU1 => "conv.ovf.u1",
            CilOp::ConvOvfU2 => "conv.ovf.u2",
            CilOp::ConvOvfU4 => "conv.ovf.u4",
            CilOp::ConvOvfU8 => "conv.ovf.u8",
            CilOp::ConvOvfI => "conv.ovf.i",
            CilOp::ConvOvfU => "conv.ovf.u",
            CilOp::ConvOvfI1Un => "conv.ovf.i1.un",
            CilOp::ConvOvfI2Un => "conv.ovf.i2.un",
            CilOp::ConvOvfI4Un => "conv.ovf.i4.un",
            CilOp::ConvOvfI8Un => "conv.ovf.i8.un",
            CilOp::ConvOvfU1Un => "conv.ovf.u1.un",
            CilOp::ConvOvfU2Un => "conv.ovf.u2.un",
            CilOp::ConvOvfU4Un => "conv.ovf.u4.un",
            CilOp::ConvOvfU8Un => "conv.ovf.u8.un",
            CilOp::ConvOvfIUn => "conv.ovf.i.un",
            CilOp::ConvOvfUUn => "conv.ovf.u.un",
            CilOp::CpObj(_) => "cpobj",
            CilOp::LdObj(_) => "ldobj",
            CilOp::Ldstr(_) => "ldstr",
            CilOp::Newobj(_) => "newobj",
            CilOp::Castclass(_) => "castclass",
            CilOp::Isinst(_) => "isinst",
            CilOp::Unbox(_) => "unbox",
            CilOp::UnboxAny(_) => "unbox.any",
            CilOp::Box(_) => "box",
            CilOp::Throw => "throw",
            CilOp::Rethrow => "rethrow",
            CilOp::Ldfld(_) => "ldfld",
            CilOp::Ldflda(_) => "ldflda",
            CilOp::Stfld(_) => "stfld",
            CilOp::Ldsfld(_) => "ldsfld",
            CilOp::Ldsflda(_) => "ldsflda",
            CilOp::Stsfld(_) => "stsfld",
            CilOp::StObj(_) => "stobj",
            CilOp::Newarr(_) => "newarr",
            CilOp::Ldlen => "ldlen",
            CilOp::Ldelema(_) => "ldelema",
            CilOp::LdelemI1 => "ldelem.i1",
            CilOp::LdelemU1 => "ldelem.u1",
            CilOp::LdelemI2 => "ldelem.i2",
            CilOp::LdelemU2 => "ldelem.u2",
            CilOp::LdelemI4 => "ldelem.i4",
            CilOp::LdelemU4 => "ldelem.u4",
            CilOp::LdelemI8 => "ldelem.i8",
            CilOp::LdelemI => "ldelem.i",
            CilOp::LdelemR4 => "ldelem.r4",
            CilOp::LdelemR8 => "ldelem.r8",
            CilOp::LdelemRef => "ldelem.ref",
            CilOp::StelemI => "stelem.i",
            CilOp::StelemI1 => "stelem.i1",
            CilOp::StelemI2 => "stelem.i2",
            CilOp::StelemI4 => "stelem.i4",
            CilOp::StelemI8 => "stelem.i8",
            CilOp::StelemR4 => "stelem.r4",
            CilOp::StelemR8 => "stelem.r8",
            CilOp::StelemRef => "stelem.ref",
            CilOp::Ldelem(_) => "ldelem",
            CilOp::Stelem(_) => "stelem",
            CilOp::RefAnyVal(_) => "refanyval",
            CilOp::CkFinite => "ckfinite",
            CilOp::MkRefAny(_) => "mkrefany",
            CilOp::RefAnyType => "refanytype",
            CilOp::Ldtoken(_) => "ldtoken",
            CilOp::AddOvf => "add.ovf",
            CilOp::AddOvfUn => "add.ovf.un",
            CilOp::MulOvf => "mul.ovf",
            CilOp::MulOvfUn => "mul.ovf.un",
            CilOp::SubOvf => "sub.ovf",
            CilOp::SubOvfUn => "sub.ovf.un",
            CilOp::EndFinally => "endfinally",
            CilOp::Leave(_) => "leave",
            CilOp::EndFilter => "endfilter",
            CilOp::ArgList => "arglist",
            CilOp::Ceq => "ceq",
            CilOp::Cgt => "cgt",
            CilOp::CgtUn => "cgt.un",
            CilOp::Clt => "clt",
            CilOp::CltUn => "clt.un",
            CilOp::Ldftn(_) => "ldftn",
            CilOp::Ldvirtftn(_) => "ldvirtftn",
            CilOp::LocAlloc => "localloc",
            CilOp::InitObj(_) => "initobj",
            CilOp::CpBlk => "cpblk",
            CilOp::InitBlk => "initblk",
            CilOp::SizeOf(_) => "sizeof",
            CilOp::Constrained(_) => "constrained.",
            CilOp::Volatile => "volatile.",
            CilOp::Tail => "tail.",
            CilOp::Unaligned(_) => "unaligned.",
            CilOp::Readonly => "readonly.",
            CilOp::NoCheck(_) => "no.",
        }
    }

    /// Absolute IL offsets this op may transfer control to.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            CilOp::Br(t)
            | CilOp::BrFalse(t)
            | CilOp::BrTrue(t)
            | CilOp::Beq(t)
            | CilOp::Bge(t)
            | CilOp::Bgt(t)
            | CilOp::Ble(t)
            | CilOp::Blt(t)
            | CilOp::BneUn(t)
            | CilOp::BgeUn(t)
            | CilOp::BgtUn(t)
            | CilOp::BleUn(t)
            | CilOp::BltUn(t)
            | CilOp::Leave(t) => vec![*t],
            CilOp::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// True when control never falls through to the following instruction.
    pub fn ends_block_unconditionally(&self) -> bool {
        matches!(
            self,
            CilOp::Br(_)
                | CilOp::Ret
                | CilOp::Throw
                | CilOp::Rethrow
                | CilOp::Leave(_)
                | CilOp::EndFinally
                | CilOp::EndFilter
                | CilOp::Jmp(_)
        )
    }

    /// True for any control-transfer op, conditional ones included.
    pub fn ends_block(&self) -> bool {
        self.ends_block_unconditionally()
            || !self.branch_targets().is_empty()
            || matches!(self, CilOp::Switch(_))
    }

    pub fn is_prefix(&self) -> bool {
        matches!(
            self,
            CilOp::Constrained(_)
                | CilOp::Volatile
                | CilOp::Tail
                | CilOp::Unaligned(_)
                | CilOp::Readonly
                | CilOp::NoCheck(_)
        )
    }

    /// Build the normalized op for any standard mnemonic, short and macro
    /// encodings included. This is the complete opcode table; a mnemonic it
    /// rejects is a lowering failure for the containing method.
    pub fn from_mnemonic(mnemonic: &str, operand: OperandValue) -> Result<CilOp, UnknownOpcode> {
        use CilOp::*;
        use OperandValue as V;

        let unknown = || UnknownOpcode {
            mnemonic: mnemonic.to_string(),
        };

        let op = match (mnemonic, operand) {
            ("nop", V::None) => Nop,
            ("break", V::None) => Break,

            ("ldarg.0", V::None) => Ldarg(0),
            ("ldarg.1", V::None) => Ldarg(1),
            ("ldarg.2", V::None) => Ldarg(2),
            ("ldarg.3", V::None) => Ldarg(3),
            ("ldarg.s", V::Var(n)) | ("ldarg", V::Var(n)) => Ldarg(n),
            ("ldarga.s", V::Var(n)) | ("ldarga", V::Var(n)) => Ldarga(n),
            ("starg.s", V::Var(n)) | ("starg", V::Var(n)) => Starg(n),
            ("ldloc.0", V::None) => Ldloc(0),
            ("ldloc.1", V::None) => Ldloc(1),
            ("ldloc.2", V::None) => Ldloc(2),
            ("ldloc.3", V::None) => Ldloc(3),
            ("ldloc.s", V::Var(n)) | ("ldloc", V::Var(n)) => Ldloc(n),
            ("ldloca.s", V::Var(n)) | ("ldloca", V::Var(n)) => Ldloca(n),
            ("stloc.0", V::None) => Stloc(0),
            ("stloc.1", V::None) => Stloc(1),
            ("stloc.2", V::None) => Stloc(2),
            ("stloc.3", V::None) => Stloc(3),
            ("stloc.s", V::Var(n)) | ("stloc", V::Var(n)) => Stloc(n),

            ("ldnull", V::None) => Ldnull,
            ("ldc.i4.m1", V::None) => LdcI4(-1),
            ("ldc.i4.0", V::None) => LdcI4(0),
            ("ldc.i4.1", V::None) => LdcI4(1),
            ("ldc.i4.2", V::None) => LdcI4(2),
            ("ldc.i4.3", V::None) => LdcI4(3),
            ("ldc.i4.4", V::None) => LdcI4(4),
            ("ldc.i4.5", V::None) => LdcI4(5),
            ("ldc.i4.6", V::None) => LdcI4(6),
            ("ldc.i4.7", V::None) => LdcI4(7),
            ("ldc.i4.8", V::None) => LdcI4(8),
            ("ldc.i4.s", V::I32(v)) | ("ldc.i4", V::I32(v)) => LdcI4(v),
            ("ldc.i8", V::I64(v)) => LdcI8(v),
            ("ldc.r4", V::R4(v)) => LdcR4(v),
            ("ldc.r8", V::R8(v)) => LdcR8(v),

            ("dup", V::None) => Dup,
            ("pop", V::None) => Pop,
            ("jmp", V::Method(m)) => Jmp(m),
            ("call", V::Method(m)) => Call(m),
            ("callvirt", V::Method(m)) => CallVirt(m),
            ("calli", V::Sig(s)) => Calli(s),
            ("ret", V::None) => Ret,

            ("br.s", V::Target(t)) | ("br", V::Target(t)) => Br(t),
            ("brfalse.s", V::Target(t)) | ("brfalse", V::Target(t)) => BrFalse(t),
            ("brnull", V::Target(t)) | ("brzero", V::Target(t)) => BrFalse(t),
            ("brtrue.s", V::Target(t)) | ("brtrue", V::Target(t)) => BrTrue(t),
            ("brinst", V::Target(t)) => BrTrue(t),
            ("beq.s", V::Target(t)) | ("beq", V::Target(t)) => Beq(t),
            ("bge.s", V::Target(t)) | ("bge", V::Target(t)) => Bge(t),
            ("bgt.s", V::Target(t)) | ("bgt", V::Target(t)) => Bgt(t),
            ("ble.s", V::Target(t)) | ("ble", V::Target(t)) => Ble(t),
            ("blt.s", V::Target(t)) | ("blt", V::Target(t)) => Blt(t),
            ("bne.un.s", V::Target(t)) | ("bne.un", V::Target(t)) => BneUn(t),
            ("bge.un.s", V::Target(t)) | ("bge.un", V::Target(t)) => BgeUn(t),
            ("bgt.un.s", V::Target(t)) | ("bgt.un", V::Target(t)) => BgtUn(t),
            ("ble.un.s", V::Target(t)) | ("ble.un", V::Target(t)) => BleUn(t),
            ("blt.un.s", V::Target(t)) | ("blt.un", V::Target(t)) => BltUn(t),
            ("switch", V::Switch(targets)) => Switch(targets),
            ("leave.s", V::Target(t)) | ("leave", V::Target(t)) => Leave(t),

            ("ldind.i1", V::None) => LdindI1,
            ("ldind.u1", V::None) => LdindU1,
            ("ldind.i2", V::None) => LdindI2,
            ("ldind.u2", V::None) => LdindU2,
            ("ldind.i4", V::None) => LdindI4,
            ("ldind.u4", V::None) => LdindU4,
            ("ldind.i8", V::None) | ("ldind.u8", V::None) => LdindI8,
            ("ldind.i", V::None) => LdindI,
            ("ldind.r4", V::None) => LdindR4,
            ("ldind.r8", V::None) => LdindR8,
            ("ldind.ref", V::None) => LdindRef,
            ("stind.ref", V::None) => StindRef,
            ("stind.i1", V::None) => StindI1,
            ("stind.i2", V::None) => StindI2,
            ("stind.i4", V::None) => StindI4,
            ("stind.i8", V::None) => StindI8,
            ("stind.r4", V::None) => StindR4,
            ("stind.r8", V::None) => StindR8,
            ("stind.i", V::None) => StindI,

            ("add", V::None) => Add,
            ("sub", V::None) => Sub,
            ("mul", V::None) => Mul,
            ("div", V::None) => Div,
            ("div.un", V::None) => DivUn,
            ("rem", V::None) => Rem,
            ("rem.un", V::None) => RemUn,
            ("and", V::None) => And,
            ("or", V::None) => Or,
            ("xor", V::None) => Xor,
            ("shl", V::None) => Shl,
            ("shr", V::None) => Shr,
            ("shr.un", V::None) => ShrUn,
            ("neg", V::None) => Neg,
            ("not", V::None) => Not,
            ("add.ovf", V::None) => AddOvf,
            ("add.ovf.un", V::None) => AddOvfUn,
            ("mul.ovf", V::None) => MulOvf,
            ("mul.ovf.un", V::None) => MulOvfUn,
            ("sub.ovf", V::None) => SubOvf,
            ("sub.ovf.un", V::None) => SubOvfUn,

            ("conv.i1", V::None) => ConvI1,
            ("conv.i2", V::None) => ConvI2,
            ("conv.i4", V::None) => ConvI4,
            ("conv.i8", V::None) => ConvI8,
            ("conv.r4", V::None) => ConvR4,
            ("conv.r8", V::None) => ConvR8,
            ("conv.u1", V::None) => ConvU1,
            ("conv.u2", V::None) => ConvU2,
            ("conv.u4", V::None) => ConvU4,
            ("conv.u8", V::None) => ConvU8,
            ("conv.i", V::None) => ConvI,
            ("conv.u", V::None) => ConvU,
            ("conv.r.un", V::None) => ConvRUn,
            ("conv.ovf.i1", V::None) => ConvOvfI1,
            ("conv.ovf.i2", V::None) => ConvOvfI2,
            ("conv.ovf.i4", V::None) => ConvOvfI4,
            ("conv.ovf.i8", V::None) => ConvOvfI8,
            ("conv.ovf.u1", V::None) => ConvOvfU1,
            ("conv.ovf.u2", V::None) => ConvOvfU2,
            ("conv.ovf.u4", V::None) => ConvOvfU4,
            ("conv.ovf.u8", V::None) => ConvOvfU8,
            ("conv.ovf.i", V::None) => ConvOvfI,
            ("conv.ovf.u", V::None) => ConvOvfU,
            ("conv.ovf.i1.un", V::None) => ConvOvfI1Un,
            ("conv.ovf.i2.un", V::None) => ConvOvfI2Un,
            ("conv.ovf.i4.un", V::None) => ConvOvfI4Un,
            ("conv.ovf.i8.un", V::None) => ConvOvfI8Un,
            ("conv.ovf.u1.un", V::None) => ConvOvfU1Un,
            ("conv.ovf.u2.un", V::None) => ConvOvfU2Un,
            ("conv.ovf.u4.un", V::None) => ConvOvfU4Un,
            ("conv.ovf.u8.un", V::None) => ConvOvfU8Un,
            ("conv.ovf.i.un", V::None) => ConvOvfIUn,
            ("conv.ovf.u.un", V::None) => ConvOvfUUn,

            ("cpobj", V::Type(t)) => CpObj(t),
            ("ldobj", V::Type(t)) => LdObj(t),
            ("ldstr", V::Str(s)) => Ldstr(s),
            ("newobj", V::Method(m)) => Newobj(m),
            ("castclass", V::Type(t)) => Castclass(t),
            ("isinst", V::Type(t)) => Isinst(t),
            ("unbox", V::Type(t)) => Unbox(t),
            ("unbox.any", V::Type(t)) => UnboxAny(t),
            ("box", V::Type(t)) => Box(t),
            ("throw", V::None) => Throw,
            ("rethrow", V::None) => Rethrow,
            ("ldfld", V::Field(f)) => Ldfld(f),
            ("ldflda", V::Field(f)) => Ldflda(f),
            ("stfld", V::Field(f)) => Stfld(f),
            ("ldsfld", V::Field(f)) => Ldsfld(f),
            ("ldsflda", V::Field(f)) => Ldsflda(f),
            ("stsfld", V::Field(f)) => Stsfld(f),
            ("stobj", V::Type(t)) => StObj(t),
            ("initobj", V::Type(t)) => InitObj(t),

            ("newarr", V::Type(t)) => Newarr(t),
            ("ldlen", V::None) => Ldlen,
            ("ldelema", V::Type(t)) => Ldelema(t),
            ("ldelem.i1", V::None) => LdelemI1,
            ("ldelem.u1", V::None) => LdelemU1,
            ("ldelem.i2", V::None) => LdelemI2,
            ("ldelem.u2", V::None) => LdelemU2,
            ("ldelem.i4", V::None) => LdelemI4,
            ("ldelem.u4", V::None) => LdelemU4,
            ("ldelem.i8", V::None) | ("ldelem.u8", V::None) => LdelemI8,
            ("ldelem.i", V::None) => LdelemI,
            ("ldelem.r4", V::None) => LdelemR4,
            ("ldelem.r8", V::None) => LdelemR8,
            ("ldelem.ref", V::None) => LdelemRef,
            ("stelem.i", V::None) => StelemI,
            ("stelem.i1", V::None) => StelemI1,
            ("stelem.i2", V::None) => StelemI2,
            ("stelem.i4", V::None) => StelemI4,
            ("stelem.i8", V::None) => StelemI8,
            ("stelem.r4", V::None) => StelemR4,
            ("stelem.r8", V::None) => StelemR8,
            ("stelem.ref", V::None) => StelemRef,
            ("ldelem", V::Type(t)) | ("ldelem.any", V::Type(t)) => Ldelem(t),
            ("stelem", V::Type(t)) | ("stelem.any", V::Type(t)) => Stelem(t),

            ("refanyval", V::Type(t)) => RefAnyVal(t),
            ("ckfinite", V::None) => CkFinite,
            ("mkrefany", V::Type(t)) => MkRefAny(t),
            ("refanytype", V::None) => RefAnyType,
            ("ldtoken", V::Token(t)) => Ldtoken(t),

            ("endfinally", V::None) | ("endfault", V::None) => EndFinally,
            ("endfilter", V::None) => EndFilter,

            ("arglist", V::None) => ArgList,
            ("ceq", V::None) => Ceq,
            ("cgt", V::None) => Cgt,
            ("cgt.un", V::None) => CgtUn,
            ("clt", V::None) => Clt,
            ("clt.un", V::None) => CltUn,
            ("ldftn", V::Method(m)) => Ldftn(m),
            ("ldvirtftn", V::Method(m)) => Ldvirtftn(m),
            ("localloc", V::None) => LocAlloc,
            ("cpblk", V::None) => CpBlk,
            ("initblk", V::None) => InitBlk,
            ("sizeof", V::Type(t)) => SizeOf(t),

            ("constrained.", V::Type(t)) => Constrained(t),
            ("volatile.", V::None) => Volatile,
            ("tail.", V::None) => Tail,
            ("unaligned.", V::Byte(b)) => Unaligned(b),
            ("readonly.", V::None) => Readonly,
            ("no.", V::Byte(b)) => NoCheck(b),

            _ => return Err(unknown()),
        };
        Ok(op)
    }
}

/// Every standard mnemonic of ECMA-335 partition III, in opcode order.
/// Coverage tests enumerate this table against [`CilOp::from_mnemonic`].
pub const ALL_MNEMONICS: &[&str] = &[
    "nop", "break", "ldarg.0", "ldarg.1", "ldarg.2", "ldarg.3", "ldloc.0", "ldloc.1", "ldloc.2",
    "ldloc.3", "stloc.0", "stloc.1", "stloc.2", "stloc.3", "ldarg.s", "ldarga.s", "starg.s",
    "ldloc.s", "ldloca.s", "stloc.s", "ldnull", "ldc.i4.m1", "ldc.i4.0", "ldc.i4.1", "ldc.i4.2",
    "ldc.i4.3", "ldc.i4.4", "ldc.i4.5", "ldc.i4.6", "ldc.i4.7", "ldc.i4.8", "ldc.i4.s", "ldc.i4",
    "ldc.i8", "ldc.r4", "ldc.r8", "dup", "pop", "jmp", "call", "calli", "ret", "br.s",
    "brfalse.s", "brtrue.s", "beq.s", "bge.s", "bgt.s", "ble.s", "blt.s", "bne.un.s", "bge.un.s",
    "bgt.un.s", "ble.un.s", "blt.un.s", "br", "brfalse", "brtrue", "beq", "bge", "bgt", "ble",
    "blt", "bne.un", "bge.un", "bgt.un", "ble.un", "blt.un", "switch", "ldind.i1", "ldind.u1",
    "ldind.i2", "ldind.u2", "ldind.i4", "ldind.u4", "ldind.i8", "ldind.i", "ldind.r4",
    "ldind.r8", "ldind.ref", "stind.ref", "stind.i1", "stind.i2", "stind.i4", "stind.i8",
    "stind.r4", "stind.r8", "add", "sub", "mul", "div", "div.un", "rem", "rem.un", "and", "or",
    "xor", "shl", "shr", "shr.un", "neg", "not", "conv.i1", "conv.i2", "conv.i4", "conv.i8",
    "conv.r4", "conv.r8", "conv.u4", "conv.u8", "callvirt", "cpobj", "ldobj", "ldstr", "newobj",
    "castclass", "isinst", "conv.r.un", "unbox", "throw", "ldfld", "ldflda", "stfld", "ldsfld",
    "ldsflda", "stsfld", "stobj", "conv.ovf.i1.un", "conv.ovf.i2.un", "conv.ovf.i4.un",
    "conv.ovf.i8.un", "conv.ovf.u1.un", "conv.ovf.u2.un", "conv.ovf.u4.un", "conv.ovf.u8.un",
    "conv.ovf.i.un", "conv.ovf.u.un", "box", "newarr", "ldlen", "ldelema", "ldelem.i1",
    "ldelem.u1", "ldelem.i2", "ldelem.u2", "ldelem.i4", "ldelem.u4", "ldelem.i8", "ldelem.i",
    "ldelem.r4", "ldelem.r8", "ldelem.ref", "stelem.i", "stelem.i1", "stelem.i2", "stelem.i4",
    "stelem.i8", "stelem.r4", "stelem.r8", "stelem.ref", "ldelem", "stelem", "unbox.any",
    "conv.ovf.i1", "conv.ovf.u1", "conv.ovf.i2", "conv.ovf.u2", "conv.ovf.i4", "conv.ovf.u4",
    "conv.ovf.i8", "conv.ovf.u8", "refanyval", "ckfinite", "mkrefany", "ldtoken", "conv.u2",
    "conv.u1", "conv.i", "conv.ovf.i", "conv.ovf.u", "add.ovf", "add.ovf.un", "mul.ovf",
    "mul.ovf.un", "sub.ovf", "sub.ovf.un", "endfinally", "leave", "leave.s", "stind.i",
    "conv.u", "arglist", "ceq", "cgt", "cgt.un", "clt", "clt.un", "ldftn", "ldvirtftn", "ldarg",
    "ldarga", "starg", "ldloc", "ldloca", "stloc", "localloc", "endfilter", "unaligned.",
    "volatile.", "tail.", "initobj", "constrained.", "cpblk", "initblk", "no.", "rethrow",
    "sizeof", "refanytype", "readonly.",
];

#[cfg(test)]
mod tests {
    use super::*;

    /// A representative operand for each mnemonic, so the coverage test can
    /// drive `from_mnemonic` across the whole table.
    fn operand_for(mnemonic: &str) -> OperandValue {
        let method = || MethodRef {
            owner: "System.Object".into(),
            name: "ToString".into(),
            has_this: true,
            return_type: "System.String".into(),
            params: vec![],
            generic_args: vec![],
        };
        let field = || FieldRef {
            owner: "T".into(),
            name: "f".into(),
            field_type: "System.Int32".into(),
        };
        match mnemonic {
            "jmp" | "call" | "callvirt" | "newobj" | "ldftn" | "ldvirtftn" => {
                OperandValue::Method(method())
            }
            "calli" => OperandValue::Sig(CallSig {
                has_this: false,
                return_type: "System.Void".into(),
                params: vec![],
            }),
            "ldfld" | "ldflda" | "stfld" | "ldsfld" | "ldsflda" | "stsfld" => {
                OperandValue::Field(field())
            }
            "ldstr" => OperandValue::Str("x".into()),
            "ldtoken" => OperandValue::Token(TokenRef::Type("System.Int32".into())),
            "switch" => OperandValue::Switch(vec![0]),
            "ldc.i4" | "ldc.i4.s" => OperandValue::I32(42),
            "ldc.i8" => OperandValue::I64(42),
            "ldc.r4" => OperandValue::R4(1.0),
            "ldc.r8" => OperandValue::R8(1.0),
            "unaligned." | "no." => OperandValue::Byte(1),
            m if m.starts_with("ldarg") && (m.ends_with(".s") || m == "ldarg" || m == "ldarga") => {
                OperandValue::Var(0)
            }
            "starg.s" | "starg" | "ldloc.s" | "ldloca.s" | "stloc.s" | "ldloc" | "ldloca"
            | "stloc" => OperandValue::Var(0),
            m if m.starts_with('b') && m != "break" && m != "box" => OperandValue::Target(0),
            "leave" | "leave.s" => OperandValue::Target(0),
            "cpobj" | "ldobj" | "stobj" | "castclass" | "isinst" | "unbox" | "unbox.any"
            | "box" | "newarr" | "ldelema" | "ldelem" | "stelem" | "refanyval" | "mkrefany"
            | "initobj" | "sizeof" | "constrained." => OperandValue::Type("System.Int32".into()),
            _ => OperandValue::None,
        }
    }

    #[test]
    fn every_standard_mnemonic_is_in_the_table() {
        for mnemonic in ALL_MNEMONICS {
            let op = CilOp::from_mnemonic(mnemonic, operand_for(mnemonic));
            assert!(op.is_ok(), "mnemonic '{mnemonic}' missing from the opcode table");
        }
    }

    #[test]
    fn macro_forms_normalize() {
        assert_eq!(
            CilOp::from_mnemonic("ldarg.2", OperandValue::None).unwrap(),
            CilOp::Ldarg(2)
        );
        assert_eq!(
            CilOp::from_mnemonic("ldc.i4.m1", OperandValue::None).unwrap(),
            CilOp::LdcI4(-1)
        );
        assert_eq!(
            CilOp::from_mnemonic("br.s", OperandValue::Target(8)).unwrap(),
            CilOp::Br(8)
        );
    }

    #[test]
    fn unknown_mnemonics_are_rejected() {
        let err = CilOp::from_mnemonic("frobnicate", OperandValue::None).unwrap_err();
        assert_eq!(err.mnemonic, "frobnicate");
    }

    #[test]
    fn block_boundaries() {
        assert!(CilOp::Ret.ends_block_unconditionally());
        assert!(CilOp::Leave(4).ends_block_unconditionally());
        assert!(CilOp::Beq(4).ends_block());
        assert!(!CilOp::Beq(4).ends_block_unconditionally());
        assert_eq!(CilOp::Switch(vec![4, 8]).branch_targets(), vec![4, 8]);
        assert!(CilOp::Constrained("T".into()).is_prefix());
    }
}
