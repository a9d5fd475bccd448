//! CIL fully-qualified names to C++ identifiers.
//!
//! The mapping only goes one way; the IR keeps the CIL name next to the
//! mangled form wherever a reader might need to correlate the two.

use std::collections::{HashMap, HashSet};

/// Deterministic, collision-free mangling for one module.
#[derive(Debug, Default)]
pub struct NameMapper {
    cache: HashMap<String, String>,
    used: HashSet<String>,
}

impl NameMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mangled identifier for a concrete (instantiable) type name.
    ///
    /// Trailing underscores are stripped so `List`1<T>`-style names do not
    /// leave a dangling separator once the argument list is folded in.
    pub fn mangle_type(&mut self, cil_name: &str) -> String {
        if let Some(found) = self.cache.get(cil_name) {
            return found.clone();
        }
        let raw = mangle_fragment(cil_name);
        let stripped = raw.trim_end_matches('_').to_string();
        let unique = self.reserve(if stripped.is_empty() { raw } else { stripped });
        self.cache.insert(cil_name.to_string(), unique.clone());
        unique
    }

    /// Read-only lookup used once every module type has been registered:
    /// returns the cached mangling, or the stateless fragment form for
    /// names that never went through registration.
    pub fn peek_type(&self, cil_name: &str) -> String {
        if let Some(found) = self.cache.get(cil_name) {
            return found.clone();
        }
        let raw = mangle_fragment(cil_name);
        let stripped = raw.trim_end_matches('_');
        if stripped.is_empty() {
            raw.clone()
        } else {
            stripped.to_string()
        }
    }

    /// Mangled identifier for an open generic template name.
    ///
    /// Unlike the instance form, trailing underscores stay: the template
    /// form is a prefix other names are appended to.
    pub fn mangle_open_type(&mut self, cil_name: &str) -> String {
        let key = format!("open:{cil_name}");
        if let Some(found) = self.cache.get(&key) {
            return found.clone();
        }
        let unique = self.reserve(mangle_fragment(cil_name));
        self.cache.insert(key, unique.clone());
        unique
    }

    /// Method names keep no prefix; compiler-generated brackets are escaped.
    pub fn mangle_method(&self, cil_name: &str) -> String {
        mangle_fragment(cil_name)
    }

    /// Fields get an `f` prefix; `_result` becomes `f_result`.
    pub fn mangle_field(&self, cil_name: &str) -> String {
        let trimmed = cil_name.trim_start_matches('_');
        let body = if trimmed.is_empty() { cil_name } else { trimmed };
        format!("f_{}", mangle_fragment(body))
    }

    fn reserve(&mut self, candidate: String) -> String {
        if self.used.insert(candidate.clone()) {
            return candidate;
        }
        let mut n = 2usize;
        loop {
            let alt = format!("{candidate}_{n}");
            if self.used.insert(alt.clone()) {
                return alt;
            }
            n += 1;
        }
    }
}

/// One name component: separators and the generic arity marker fold to `_`,
/// generic argument lists recurse, synthesized-member brackets escape to
/// `___`.
fn mangle_fragment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '.' | '+' | '/' | '`' | ',' | ' ' => out.push('_'),
            '<' => {
                // A generic argument list runs to the matching '>'; a
                // compiler-generated member name ('<Clone>$', '<M>b__0')
                // starts with the bracket and escapes bracket-by-bracket.
                let after_arity = name[..idx]
                    .chars()
                    .next_back()
                    .is_some_and(|p| p.is_ascii_digit());
                if let Some(args) = generic_argument_list(&name[idx..], after_arity) {
                    let inner: Vec<String> =
                        split_top_level(args).into_iter().map(mangle_fragment).collect();
                    out.push('_');
                    out.push_str(&inner.join("_"));
                    // Skip what we just consumed, including both brackets.
                    for _ in 0..args.len() + 1 {
                        chars.next();
                    }
                } else {
                    out.push_str("___");
                }
            }
            '>' => out.push_str("___"),
            '$' => out.push('_'),
            '&' | '*' => out.push_str("_ptr"),
            '[' | ']' => out.push_str("_arr"),
            _ if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

/// If `s` starts a balanced `<...>` group, return the text between the
/// brackets. Only positions right after a generic arity marker (`\`N<`) or
/// with dotted/comma-separated content qualify; `<Clone>$`-style member
/// names fail both checks and fall back to the bracket escape.
fn generic_argument_list(s: &str, after_arity: bool) -> Option<&str> {
    debug_assert!(s.starts_with('<'));
    if s.len() < 2 {
        return None;
    }
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth -= 1;
                if depth == 0 {
                    let inner = &s[1..i];
                    if after_arity || inner.contains('.') || inner.contains(',') {
                        return Some(inner);
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Split `A,B<C,D>,E` into top-level comma-separated parts.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_fold_separators() {
        let mut mapper = NameMapper::new();
        assert_eq!(mapper.mangle_type("System.Int32"), "System_Int32");
        assert_eq!(mapper.mangle_type("Outer+Inner"), "Outer_Inner");
    }

    #[test]
    fn generic_instances_fold_arguments_recursively() {
        let mut mapper = NameMapper::new();
        let mangled = mapper.mangle_type("Wrapper`1<System.Int32>");
        assert_eq!(mangled, "Wrapper_1_System_Int32");
        assert!(!mangled.contains('<') && !mangled.contains('>') && !mangled.contains('`'));

        let nested = mapper.mangle_type("Dict`2<System.String,List`1<System.Int32>>");
        assert!(!nested.contains('<') && !nested.contains(','));
    }

    #[test]
    fn open_template_keeps_trailing_underscore() {
        let mut mapper = NameMapper::new();
        assert_eq!(mapper.mangle_open_type("Wrapper`1"), "Wrapper_1");
        // The instance form of a name ending in a separator strips it.
        assert_eq!(mapper.mangle_type("Weird."), "Weird");
    }

    #[test]
    fn synthesized_member_names_escape_brackets() {
        let mapper = NameMapper::new();
        assert_eq!(mapper.mangle_method("<Clone>$"), "___Clone____");
        assert_eq!(mapper.mangle_method("<TestLambda>b__0"), "___TestLambda___b__0");
    }

    #[test]
    fn field_prefix_matches_emitter_expectations() {
        let mapper = NameMapper::new();
        assert_eq!(mapper.mangle_field("_result"), "f_result");
        assert_eq!(mapper.mangle_field("Name"), "f_Name");
    }

    #[test]
    fn collisions_get_deterministic_suffixes() {
        let mut mapper = NameMapper::new();
        let a = mapper.mangle_type("A.B");
        let b = mapper.mangle_type("A+B");
        assert_eq!(a, "A_B");
        assert_eq!(b, "A_B_2");
        // Idempotent per input name.
        assert_eq!(mapper.mangle_type("A+B"), "A_B_2");
    }
}
