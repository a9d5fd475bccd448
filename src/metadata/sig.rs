//! ECMA-335 II.23.2 signature-blob parsing.
//!
//! Renders signatures straight into the canonical type-name strings the
//! rest of the pipeline keys on (`System.Int32`, `T[]`, `List`1<T>`),
//! resolving `TypeDefOrRefEncoded` tokens through a caller-supplied lookup
//! and generic positions through the declaring scopes' parameter names.

use std::fmt;

/// Calling-convention byte masks (II.23.2.1).
const SIG_HAS_THIS: u8 = 0x20;
const SIG_GENERIC: u8 = 0x10;
const SIG_FIELD: u8 = 0x06;
const SIG_LOCAL: u8 = 0x07;
const SIG_GENERIC_INST: u8 = 0x0A;

// Element-type constants (II.23.1.16).
const ET_VOID: u8 = 0x01;
const ET_BOOLEAN: u8 = 0x02;
const ET_CHAR: u8 = 0x03;
const ET_I1: u8 = 0x04;
const ET_U1: u8 = 0x05;
const ET_I2: u8 = 0x06;
const ET_U2: u8 = 0x07;
const ET_I4: u8 = 0x08;
const ET_U4: u8 = 0x09;
const ET_I8: u8 = 0x0a;
const ET_U8: u8 = 0x0b;
const ET_R4: u8 = 0x0c;
const ET_R8: u8 = 0x0d;
const ET_STRING: u8 = 0x0e;
const ET_PTR: u8 = 0x0f;
const ET_BYREF: u8 = 0x10;
const ET_VALUETYPE: u8 = 0x11;
const ET_CLASS: u8 = 0x12;
const ET_VAR: u8 = 0x13;
const ET_ARRAY: u8 = 0x14;
const ET_GENERICINST: u8 = 0x15;
const ET_TYPEDBYREF: u8 = 0x16;
const ET_I: u8 = 0x18;
const ET_U: u8 = 0x19;
const ET_FNPTR: u8 = 0x1b;
const ET_OBJECT: u8 = 0x1c;
const ET_SZARRAY: u8 = 0x1d;
const ET_MVAR: u8 = 0x1e;
const ET_CMOD_REQD: u8 = 0x1f;
const ET_CMOD_OPT: u8 = 0x20;
const ET_SENTINEL: u8 = 0x41;
const ET_PINNED: u8 = 0x45;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigError {
    pub detail: String,
}

impl fmt::Display for SigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed signature blob: {}", self.detail)
    }
}

impl std::error::Error for SigError {}

type SigResult<T> = Result<T, SigError>;

/// Resolves a `TypeDefOrRefEncoded` metadata token to a CIL full name.
pub trait TypeNameLookup {
    fn type_name_of(&self, token: u32) -> Option<String>;
}

impl<F> TypeNameLookup for F
where
    F: Fn(u32) -> Option<String>,
{
    fn type_name_of(&self, token: u32) -> Option<String> {
        self(token)
    }
}

/// Generic parameter names in scope while rendering (`!n` falls back when a
/// position has no recorded name).
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericScope<'a> {
    pub type_params: &'a [String],
    pub method_params: &'a [String],
}

impl GenericScope<'_> {
    fn type_param(&self, index: usize) -> String {
        self.type_params
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("!{index}"))
    }

    fn method_param(&self, index: usize) -> String {
        self.method_params
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("!!{index}"))
    }
}

/// A parsed MethodDefSig / MethodRefSig.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMethodSig {
    pub has_this: bool,
    pub generic_param_count: u32,
    pub return_type: String,
    pub params: Vec<String>,
}

struct SigReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SigReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn fail<T>(&self, detail: impl Into<String>) -> SigResult<T> {
        Err(SigError {
            detail: detail.into(),
        })
    }

    fn byte(&mut self) -> SigResult<u8> {
        let b = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| SigError {
                detail: format!("unexpected end of blob at {}", self.pos),
            })?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// II.23.2 compressed unsigned integer.
    fn compressed_u32(&mut self) -> SigResult<u32> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(u32::from(first));
        }
        if first & 0xC0 == 0x80 {
            let second = self.byte()?;
            return Ok((u32::from(first & 0x3F) << 8) | u32::from(second));
        }
        if first & 0xE0 == 0xC0 {
            let b2 = self.byte()?;
            let b3 = self.byte()?;
            let b4 = self.byte()?;
            return Ok((u32::from(first & 0x1F) << 24)
                | (u32::from(b2) << 16)
                | (u32::from(b3) << 8)
                | u32::from(b4));
        }
        self.fail(format!("invalid compressed integer lead byte {first:#x}"))
    }

    /// II.23.2.8 `TypeDefOrRefOrSpecEncoded`: tag in the low 2 bits.
    fn type_def_or_ref(&mut self) -> SigResult<u32> {
        let encoded = self.compressed_u32()?;
        let rid = encoded >> 2;
        let table = match encoded & 0x03 {
            0 => 0x02u32, // TypeDef
            1 => 0x01u32, // TypeRef
            2 => 0x1Bu32, // TypeSpec
            _ => return self.fail("invalid TypeDefOrRef tag"),
        };
        Ok((table << 24) | rid)
    }
}

fn resolve(lookup: &dyn TypeNameLookup, token: u32) -> String {
    lookup
        .type_name_of(token)
        .unwrap_or_else(|| format!("<unresolved:{token:#010x}>"))
}

fn parse_type(
    reader: &mut SigReader<'_>,
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<String> {
    let code = reader.byte()?;
    let name = match code {
        ET_VOID => "System.Void".to_string(),
        ET_BOOLEAN => "System.Boolean".to_string(),
        ET_CHAR => "System.Char".to_string(),
        ET_I1 => "System.SByte".to_string(),
        ET_U1 => "System.Byte".to_string(),
        ET_I2 => "System.Int16".to_string(),
        ET_U2 => "System.UInt16".to_string(),
        ET_I4 => "System.Int32".to_string(),
        ET_U4 => "System.UInt32".to_string(),
        ET_I8 => "System.Int64".to_string(),
        ET_U8 => "System.UInt64".to_string(),
        ET_R4 => "System.Single".to_string(),
        ET_R8 => "System.Double".to_string(),
        ET_STRING => "System.String".to_string(),
        ET_OBJECT => "System.Object".to_string(),
        ET_I => "System.IntPtr".to_string(),
        ET_U => "System.UIntPtr".to_string(),
        ET_TYPEDBYREF => "System.TypedReference".to_string(),
        ET_PTR => format!("{}*", parse_type(reader, lookup, scope)?),
        ET_BYREF => format!("{}&", parse_type(reader, lookup, scope)?),
        ET_SZARRAY => format!("{}[]", parse_type(reader, lookup, scope)?),
        ET_PINNED => parse_type(reader, lookup, scope)?,
        ET_CMOD_REQD | ET_CMOD_OPT => {
            // Custom modifiers name a token, then the real type follows.
            reader.type_def_or_ref()?;
            parse_type(reader, lookup, scope)?
        }
        ET_VALUETYPE | ET_CLASS => {
            let token = reader.type_def_or_ref()?;
            resolve(lookup, token)
        }
        ET_VAR => {
            let index = reader.compressed_u32()? as usize;
            scope.type_param(index)
        }
        ET_MVAR => {
            let index = reader.compressed_u32()? as usize;
            scope.method_param(index)
        }
        ET_GENERICINST => {
            // Kind byte (class/valuetype) then the open type and arguments.
            let _kind = reader.byte()?;
            let open_token = reader.type_def_or_ref()?;
            let open = resolve(lookup, open_token);
            let argc = reader.compressed_u32()?;
            let mut args = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                args.push(parse_type(reader, lookup, scope)?);
            }
            format!("{open}<{}>", args.join(","))
        }
        ET_ARRAY => {
            let element = parse_type(reader, lookup, scope)?;
            let rank = reader.compressed_u32()?;
            let sizes = reader.compressed_u32()?;
            for _ in 0..sizes {
                reader.compressed_u32()?;
            }
            let lo_bounds = reader.compressed_u32()?;
            for _ in 0..lo_bounds {
                reader.compressed_u32()?;
            }
            let commas = ",".repeat(rank.saturating_sub(1) as usize);
            format!("{element}[{commas}]")
        }
        ET_FNPTR => {
            // A full method signature follows; the pipeline models function
            // pointers as native ints.
            let _ = parse_method_sig_inner(reader, lookup, scope)?;
            "System.IntPtr".to_string()
        }
        other => return reader.fail(format!("unexpected element type {other:#x}")),
    };
    Ok(name)
}

fn parse_method_sig_inner(
    reader: &mut SigReader<'_>,
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<ParsedMethodSig> {
    let conv = reader.byte()?;
    let generic_param_count = if conv & SIG_GENERIC != 0 {
        reader.compressed_u32()?
    } else {
        0
    };
    let param_count = reader.compressed_u32()?;
    let return_type = parse_type(reader, lookup, scope)?;
    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        if reader.peek() == Some(ET_SENTINEL) {
            // Vararg sentinel; the fixed part ends here.
            reader.byte()?;
        }
        params.push(parse_type(reader, lookup, scope)?);
    }
    Ok(ParsedMethodSig {
        has_this: conv & SIG_HAS_THIS != 0,
        generic_param_count,
        return_type,
        params,
    })
}

/// MethodDefSig / MethodRefSig (II.23.2.1, II.23.2.2).
pub fn parse_method_sig(
    blob: &[u8],
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<ParsedMethodSig> {
    parse_method_sig_inner(&mut SigReader::new(blob), lookup, scope)
}

/// FieldSig (II.23.2.4).
pub fn parse_field_sig(
    blob: &[u8],
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<String> {
    let mut reader = SigReader::new(blob);
    let tag = reader.byte()?;
    if tag & 0x0F != SIG_FIELD {
        return reader.fail(format!("not a field signature (tag {tag:#x})"));
    }
    parse_type(&mut reader, lookup, scope)
}

/// LocalVarSig (II.23.2.6).
pub fn parse_local_var_sig(
    blob: &[u8],
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<Vec<String>> {
    let mut reader = SigReader::new(blob);
    let tag = reader.byte()?;
    if tag != SIG_LOCAL {
        return reader.fail(format!("not a local-var signature (tag {tag:#x})"));
    }
    let count = reader.compressed_u32()?;
    let mut locals = Vec::with_capacity(count as usize);
    for _ in 0..count {
        locals.push(parse_type(&mut reader, lookup, scope)?);
    }
    Ok(locals)
}

/// MethodSpec instantiation blob (II.23.2.15).
pub fn parse_method_spec_sig(
    blob: &[u8],
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<Vec<String>> {
    let mut reader = SigReader::new(blob);
    let tag = reader.byte()?;
    if tag != SIG_GENERIC_INST {
        return reader.fail(format!("not a method-spec signature (tag {tag:#x})"));
    }
    let count = reader.compressed_u32()?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(parse_type(&mut reader, lookup, scope)?);
    }
    Ok(args)
}

/// TypeSpec blob (II.23.2.14): a single type.
pub fn parse_type_spec(
    blob: &[u8],
    lookup: &dyn TypeNameLookup,
    scope: GenericScope<'_>,
) -> SigResult<String> {
    parse_type(&mut SigReader::new(blob), lookup, scope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tokens(_: u32) -> Option<String> {
        None
    }

    #[test]
    fn compressed_integers_decode_all_widths() {
        let mut r = SigReader::new(&[0x03, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00]);
        assert_eq!(r.compressed_u32().unwrap(), 3);
        assert_eq!(r.compressed_u32().unwrap(), 0x80);
        assert_eq!(r.compressed_u32().unwrap(), 0x4000);
    }

    #[test]
    fn simple_static_method_sig() {
        // default cc, 2 params, void(int32, string)
        let blob = [0x00, 0x02, ET_VOID, ET_I4, ET_STRING];
        let sig = parse_method_sig(&blob, &no_tokens, GenericScope::default()).unwrap();
        assert!(!sig.has_this);
        assert_eq!(sig.return_type, "System.Void");
        assert_eq!(sig.params, vec!["System.Int32", "System.String"]);
    }

    #[test]
    fn instance_sig_sets_has_this() {
        let blob = [SIG_HAS_THIS, 0x00, ET_I4];
        let sig = parse_method_sig(&blob, &no_tokens, GenericScope::default()).unwrap();
        assert!(sig.has_this);
        assert_eq!(sig.return_type, "System.Int32");
    }

    #[test]
    fn field_sig_with_szarray() {
        let blob = [SIG_FIELD, ET_SZARRAY, ET_I4];
        let ty = parse_field_sig(&blob, &no_tokens, GenericScope::default()).unwrap();
        assert_eq!(ty, "System.Int32[]");
    }

    #[test]
    fn generic_instance_renders_angle_form() {
        // valuetype Nullable`1<int32> via TypeRef token rid 5
        let lookup = |token: u32| {
            (token == 0x0100_0005).then(|| "System.Nullable`1".to_string())
        };
        // GENERICINST, valuetype kind, typeref rid 5 => (5 << 2) | 1 = 21, 1 arg, I4
        let blob = [SIG_FIELD, ET_GENERICINST, ET_VALUETYPE, 21, 0x01, ET_I4];
        let ty = parse_field_sig(&blob, &lookup, GenericScope::default()).unwrap();
        assert_eq!(ty, "System.Nullable`1<System.Int32>");
    }

    #[test]
    fn generic_positions_use_scope_names() {
        let type_params = vec!["T".to_string()];
        let scope = GenericScope {
            type_params: &type_params,
            method_params: &[],
        };
        let blob = [SIG_FIELD, ET_VAR, 0x00];
        assert_eq!(parse_field_sig(&blob, &no_tokens, scope).unwrap(), "T");
        // Out-of-range positions keep the positional rendering.
        let blob = [SIG_FIELD, ET_MVAR, 0x02];
        assert_eq!(parse_field_sig(&blob, &no_tokens, scope).unwrap(), "!!2");
    }

    #[test]
    fn local_var_sig_lists_slots() {
        let blob = [SIG_LOCAL, 0x02, ET_I4, ET_STRING];
        let locals = parse_local_var_sig(&blob, &no_tokens, GenericScope::default()).unwrap();
        assert_eq!(locals, vec!["System.Int32", "System.String"]);
    }

    #[test]
    fn multi_dim_array_renders_rank_commas() {
        // int32[,]: ARRAY, I4, rank 2, 0 sizes, 0 lobounds
        let blob = [SIG_FIELD, ET_ARRAY, ET_I4, 0x02, 0x00, 0x00];
        let ty = parse_field_sig(&blob, &no_tokens, GenericScope::default()).unwrap();
        assert_eq!(ty, "System.Int32[,]");
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let blob = [SIG_FIELD, ET_SZARRAY];
        assert!(parse_field_sig(&blob, &no_tokens, GenericScope::default()).is_err());
    }
}
