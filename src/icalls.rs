//! The ICall registry: CIL methods whose bodies the native runtime
//! provides. Consulted by pass 3 (to leave the body external) and by the
//! pass-7 lowerer (to redirect call-sites to the runtime symbol).
//!
//! An entry is keyed by declaring type, method name and arity; where BCL
//! overloads collide on arity, a first-parameter-type qualifier
//! disambiguates. The table is fixed, read-only data.

/// One registered internal call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ICallEntry {
    pub type_fullname: &'static str,
    pub method_name: &'static str,
    pub arity: usize,
    /// First-parameter CIL type, when needed to split same-arity overloads.
    pub first_param: Option<&'static str>,
    /// Runtime-primitive symbol, without the `cil2cpp::icall::` prefix.
    pub symbol: &'static str,
}

const fn entry(
    type_fullname: &'static str,
    method_name: &'static str,
    arity: usize,
    symbol: &'static str,
) -> ICallEntry {
    ICallEntry {
        type_fullname,
        method_name,
        arity,
        first_param: None,
        symbol,
    }
}

const fn entry_q(
    type_fullname: &'static str,
    method_name: &'static str,
    arity: usize,
    first_param: &'static str,
    symbol: &'static str,
) -> ICallEntry {
    ICallEntry {
        type_fullname,
        method_name,
        arity,
        first_param: Some(first_param),
        symbol,
    }
}

/// The registry. Arity counts declared parameters (no `this`).
pub const ICALLS: &[ICallEntry] = &[
    // Console
    entry_q("System.Console", "WriteLine", 1, "System.String", "Console_WriteLine_String"),
    entry_q("System.Console", "WriteLine", 1, "System.Int32", "Console_WriteLine_I4"),
    entry_q("System.Console", "WriteLine", 1, "System.Int64", "Console_WriteLine_I8"),
    entry_q("System.Console", "WriteLine", 1, "System.Double", "Console_WriteLine_R8"),
    entry_q("System.Console", "WriteLine", 1, "System.Boolean", "Console_WriteLine_Bool"),
    entry_q("System.Console", "WriteLine", 1, "System.Object", "Console_WriteLine_Object"),
    entry("System.Console", "WriteLine", 0, "Console_WriteLine"),
    entry_q("System.Console", "Write", 1, "System.String", "Console_Write_String"),
    entry_q("System.Console", "Write", 1, "System.Int32", "Console_Write_I4"),
    entry_q("System.Console", "Write", 1, "System.Char", "Console_Write_Char"),
    entry("System.Console", "ReadLine", 0, "Console_ReadLine"),
    // String
    entry_q("System.String", "Concat", 2, "System.String", "String_Concat2"),
    entry_q("System.String", "Concat", 3, "System.String", "String_Concat3"),
    entry_q("System.String", "Concat", 2, "System.Object", "String_ConcatObj2"),
    entry_q("System.String", "Concat", 3, "System.Object", "String_ConcatObj3"),
    entry("System.String", "get_Length", 0, "String_get_Length"),
    entry("System.String", "get_Chars", 1, "String_get_Chars"),
    entry_q("System.String", "Equals", 2, "System.String", "String_EqualsStatic"),
    entry_q("System.String", "op_Equality", 2, "System.String", "String_op_Equality"),
    entry_q("System.String", "op_Inequality", 2, "System.String", "String_op_Inequality"),
    entry("System.String", "Substring", 2, "String_Substring"),
    entry("System.String", "IndexOf", 1, "String_IndexOf"),
    entry("System.String", "IsNullOrEmpty", 1, "String_IsNullOrEmpty"),
    entry("System.String", "Format", 2, "String_Format2"),
    // Object
    entry("System.Object", "GetHashCode", 0, "Object_GetHashCode"),
    entry("System.Object", "GetType", 0, "Object_GetType"),
    entry("System.Object", "ReferenceEquals", 2, "Object_ReferenceEquals"),
    entry("System.Object", "MemberwiseClone", 0, "Object_MemberwiseClone"),
    // Math
    entry_q("System.Math", "Abs", 1, "System.Double", "Math_Abs_R8"),
    entry_q("System.Math", "Abs", 1, "System.Int32", "Math_Abs_I4"),
    entry_q("System.Math", "Abs", 1, "System.Int64", "Math_Abs_I8"),
    entry("System.Math", "Sqrt", 1, "Math_Sqrt"),
    entry("System.Math", "Pow", 2, "Math_Pow"),
    entry("System.Math", "Floor", 1, "Math_Floor"),
    entry("System.Math", "Ceiling", 1, "Math_Ceiling"),
    entry_q("System.Math", "Max", 2, "System.Int32", "Math_Max_I4"),
    entry_q("System.Math", "Max", 2, "System.Double", "Math_Max_R8"),
    entry_q("System.Math", "Min", 2, "System.Int32", "Math_Min_I4"),
    entry_q("System.Math", "Min", 2, "System.Double", "Math_Min_R8"),
    // Environment / GC / interop surface
    entry("System.Environment", "get_TickCount", 0, "Environment_get_TickCount"),
    entry("System.Environment", "get_NewLine", 0, "Environment_get_NewLine"),
    entry("System.Environment", "Exit", 1, "Environment_Exit"),
    entry("System.GC", "Collect", 0, "GC_Collect"),
    entry("System.GC", "SuppressFinalize", 1, "GC_SuppressFinalize"),
    // Array + runtime helpers
    entry("System.Array", "get_Length", 0, "Array_get_Length"),
    entry("System.Array", "Copy", 3, "Array_Copy"),
    entry("System.Array", "Clear", 3, "Array_Clear"),
    entry(
        "System.Runtime.CompilerServices.RuntimeHelpers",
        "InitializeArray",
        2,
        "RuntimeHelpers_InitializeArray",
    ),
    // Multi-dimensional arrays (rank carried as an operand by the caller)
    entry("cil2cpp.MdArray", "Create", 2, "mdarray_create"),
    entry("cil2cpp.MdArray", "Get", 2, "mdarray_get"),
    entry("cil2cpp.MdArray", "Set", 3, "mdarray_set"),
    // Type/reflection minimum
    entry("System.Type", "GetTypeFromHandle", 1, "Type_GetTypeFromHandle"),
    entry("System.String", "Intern", 1, "String_Intern"),
];

/// Namespace every registered symbol lives in.
pub const ICALL_NAMESPACE: &str = "cil2cpp::icall";

/// Look up an internal call. `first_param` is the CIL type of the first
/// declared parameter at the call-site, used only when entries collide on
/// arity.
pub fn lookup(type_fullname: &str, method_name: &str, arity: usize, first_param: Option<&str>) -> Option<&'static ICallEntry> {
    let candidates: Vec<&'static ICallEntry> = ICALLS
        .iter()
        .filter(|e| {
            e.type_fullname == type_fullname && e.method_name == method_name && e.arity == arity
        })
        .collect();
    match candidates.len() {
        0 => None,
        1 if candidates[0].first_param.is_none() => Some(candidates[0]),
        _ => {
            let wanted = first_param?;
            candidates
                .into_iter()
                .find(|e| e.first_param == Some(wanted))
        }
    }
}

/// Fully qualified runtime symbol for an entry.
pub fn qualified_symbol(entry: &ICallEntry) -> String {
    format!("{ICALL_NAMESPACE}::{}", entry.symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_discrimination() {
        assert!(lookup("System.Console", "WriteLine", 0, None).is_some());
        assert!(lookup("System.Console", "WriteLine", 2, None).is_none());
    }

    #[test]
    fn first_param_splits_colliding_overloads() {
        let abs_f = lookup("System.Math", "Abs", 1, Some("System.Double")).unwrap();
        assert_eq!(abs_f.symbol, "Math_Abs_R8");
        let abs_i = lookup("System.Math", "Abs", 1, Some("System.Int32")).unwrap();
        assert_eq!(abs_i.symbol, "Math_Abs_I4");
        // Colliding arity without a qualifier cannot resolve.
        assert!(lookup("System.Math", "Abs", 1, None).is_none());
    }

    #[test]
    fn qualified_symbols_use_the_runtime_namespace() {
        let entry = lookup("System.Math", "Sqrt", 1, None).unwrap();
        assert_eq!(qualified_symbol(entry), "cil2cpp::icall::Math_Sqrt");
    }

    #[test]
    fn unique_entries_resolve_without_qualifier_even_if_tagged() {
        // String_get_Length is unique at its arity.
        assert!(lookup("System.String", "get_Length", 0, None).is_some());
    }
}
