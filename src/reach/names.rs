//! Type-name utilities shared by reachability and the IR builder.

/// Result of stripping array/byref/pointer decorations off a name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeeledName {
    /// The innermost element name.
    pub element: String,
    /// True when the input carried array decorations (the composed form is
    /// itself emitted as a runtime shell).
    pub composite: bool,
}

/// `System.Int32[][]` -> element `System.Int32`; `T&`/`T*` -> `T`.
pub fn peel_composite(name: &str) -> PeeledName {
    let mut element = name.trim().to_string();
    let mut composite = false;
    loop {
        if let Some(stripped) = element.strip_suffix("&").or_else(|| element.strip_suffix('*')) {
            element = stripped.trim_end().to_string();
            continue;
        }
        if element.ends_with(']') {
            if let Some(open) = element.rfind('[') {
                // Only treat trailing `[...]` groups made of commas as array
                // decorations; generic argument lists use angle brackets.
                let inner = &element[open + 1..element.len() - 1];
                if inner.chars().all(|c| c == ',') {
                    element = element[..open].trim_end().to_string();
                    composite = true;
                    continue;
                }
            }
        }
        break;
    }
    PeeledName { element, composite }
}

/// `List`1<System.Int32>` -> (`List`1`, [`System.Int32`]); plain names
/// return `None`.
pub fn split_instantiation(name: &str) -> Option<(String, Vec<String>)> {
    let open_at = name.find('<')?;
    if !name.ends_with('>') {
        return None;
    }
    let open = name[..open_at].to_string();
    let inner = &name[open_at + 1..name.len() - 1];
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(inner[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = inner[start..].trim();
    if last.is_empty() {
        return None;
    }
    args.push(last.to_string());
    Some((open, args))
}

/// True when the name mentions any of the given generic parameters, at any
/// nesting depth. Reachability skips such names: only concrete tuples seed
/// monomorphization.
pub fn mentions_any(name: &str, params: &std::collections::HashSet<String>) -> bool {
    let element = peel_composite(name).element;
    if params.contains(&element) || element.starts_with('!') {
        return true;
    }
    if let Some((_, args)) = split_instantiation(&element) {
        return args.iter().any(|a| mentions_any(a, params));
    }
    false
}

/// Substitute generic parameter names in a rendered type name.
///
/// `params` and `args` are positionally paired; whole-name matches and
/// occurrences inside instantiation argument lists both substitute, so
/// `List`1<T>[]` with `T -> System.Int32` becomes
/// `List`1<System.Int32>[]`.
pub fn substitute(name: &str, params: &[String], args: &[String]) -> String {
    let peeled = peel_composite(name);
    let suffix = &name[peeled.element.len()..];

    // Whole-name parameter reference.
    if let Some(position) = params.iter().position(|p| p == &peeled.element) {
        if let Some(replacement) = args.get(position) {
            return format!("{replacement}{suffix}");
        }
    }

    // Instantiated name: substitute inside the argument list.
    if let Some((open, inner_args)) = split_instantiation(&peeled.element) {
        let substituted: Vec<String> = inner_args
            .iter()
            .map(|a| substitute(a, params, args))
            .collect();
        return format!("{open}<{}>{suffix}", substituted.join(","));
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_names_peel_to_elements() {
        assert_eq!(
            peel_composite("System.Int32[]"),
            PeeledName {
                element: "System.Int32".into(),
                composite: true
            }
        );
        assert_eq!(peel_composite("System.Int32[,]").element, "System.Int32");
        assert_eq!(peel_composite("T&").element, "T");
        assert!(!peel_composite("Plain").composite);
    }

    #[test]
    fn instantiations_split_at_top_level() {
        let (open, args) = split_instantiation("Dict`2<A,List`1<B>>").unwrap();
        assert_eq!(open, "Dict`2");
        assert_eq!(args, vec!["A", "List`1<B>"]);
        assert!(split_instantiation("Plain").is_none());
    }

    #[test]
    fn substitution_reaches_nested_arguments() {
        let params = vec!["T".to_string()];
        let args = vec!["System.Int32".to_string()];
        assert_eq!(substitute("T", &params, &args), "System.Int32");
        assert_eq!(substitute("T[]", &params, &args), "System.Int32[]");
        assert_eq!(
            substitute("List`1<T>", &params, &args),
            "List`1<System.Int32>"
        );
        assert_eq!(substitute("U", &params, &args), "U");
    }
}
