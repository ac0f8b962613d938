//! `{placeholder}` substitution for stage prompts.

use std::collections::{HashMap, HashSet};

/// Render a template against the known values.
///
/// Placeholders are `{key}`; there is no escaping. A missing key that
/// names an earlier stage's output (the stage may have been skipped or
/// failed while optional) renders as `(unavailable)`. A missing key
/// outside that set is an error listing every unresolved placeholder.
pub fn render(
    template: &str,
    values: &HashMap<String, String>,
    optional_keys: &HashSet<String>,
) -> Result<String, Vec<String>> {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // Unbalanced brace: emit literally.
            out.push('{');
            rest = after;
            continue;
        };
        let key = &after[..close];
        if let Some(value) = values.get(key) {
            out.push_str(value);
        } else if optional_keys.contains(key) {
            out.push_str("(unavailable)");
        } else if !missing.contains(&key.to_string()) {
            missing.push(key.to_string());
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    if missing.is_empty() { Ok(out) } else { Err(missing) }
}

/// Placeholder keys referenced by a template.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else { break };
        let key = &after[..close];
        if !key.is_empty() && !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        rest = &after[close + 1..];
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_keys() {
        let rendered = render(
            "Review {target} using {context}",
            &values(&[("target", "the diff"), ("context", "the summary")]),
            &HashSet::new(),
        )
        .unwrap();
        assert_eq!(rendered, "Review the diff using the summary");
    }

    #[test]
    fn missing_required_keys_error_with_names() {
        let missing = render("{a} and {b}", &values(&[("a", "x")]), &HashSet::new()).unwrap_err();
        assert_eq!(missing, vec!["b".to_string()]);
    }

    #[test]
    fn skipped_optional_outputs_render_as_unavailable() {
        let optional: HashSet<String> = ["style".to_string()].into();
        let rendered = render("Style: {style}", &values(&[]), &optional).unwrap();
        assert_eq!(rendered, "Style: (unavailable)");
    }

    #[test]
    fn unbalanced_braces_pass_through() {
        let rendered = render("a { b", &values(&[]), &HashSet::new()).unwrap();
        assert_eq!(rendered, "a { b");
    }

    #[test]
    fn placeholders_are_listed_once() {
        assert_eq!(
            placeholders("{a} {b} {a}"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
