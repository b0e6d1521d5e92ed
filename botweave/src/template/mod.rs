//! Reply template renderer.
//!
//! The dialect is deliberately non-Turing-complete: `{{name}}` scalar
//! substitution and a single level of `{{#each list}}…{{/each}}` iteration.
//! No conditionals, no nested loops. That keeps the implementation a two-pass
//! string scanner: pass one finds block structure, pass two substitutes
//! scalars, so values injected from user input can never introduce new
//! directives.

use serde_json::Value;
use thiserror::Error;

/// Variable scope for rendering and SQL binds: name → JSON scalar or list.
pub type Scope = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateErrorKind {
    UnknownDirective,
    NestedEach,
    UnclosedEach,
    NotAList,
}

impl std::fmt::Display for TemplateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TemplateErrorKind::UnknownDirective => "unknown directive",
            TemplateErrorKind::NestedEach => "nested each blocks are not supported",
            TemplateErrorKind::UnclosedEach => "each block without {{/each}}",
            TemplateErrorKind::NotAList => "each target is not a list",
        };
        f.write_str(s)
    }
}

/// Render failure. `fallback` is the literal template with the offending
/// directives removed; callers surface it instead of the rendered text and
/// record the failure in the `action_reply` event.
#[derive(Debug, Error)]
#[error("template error: {kind}")]
pub struct TemplateError {
    pub kind: TemplateErrorKind,
    pub fallback: String,
}

impl TemplateError {
    fn new(kind: TemplateErrorKind, template: &str) -> Self {
        TemplateError {
            kind,
            fallback: strip_directives(template),
        }
    }
}

/// Render `template` against `scope`.
///
/// When the template iterates a list that is empty (or absent) and the caller
/// provides `empty_text`, the renderer returns `empty_text` verbatim with no
/// further rendering.
pub fn render(
    template: &str,
    scope: &Scope,
    empty_text: Option<&str>,
) -> Result<String, TemplateError> {
    let segments = parse_blocks(template)?;
    let mut out = String::with_capacity(template.len());
    for seg in segments {
        match seg {
            Segment::Text(t) => out.push_str(&substitute(t, &[scope])),
            Segment::Each { list_name, body } => {
                let list = scope.get(list_name);
                let items = match list {
                    Some(Value::Array(items)) => items.as_slice(),
                    None | Some(Value::Null) => &[],
                    Some(_) => return Err(TemplateError::new(TemplateErrorKind::NotAList, template)),
                };
                if items.is_empty() {
                    if let Some(text) = empty_text {
                        return Ok(text.to_string());
                    }
                    continue;
                }
                for item in items {
                    out.push_str(&render_item(body, item, scope));
                }
            }
        }
    }
    Ok(out)
}

enum Segment<'a> {
    Text(&'a str),
    Each { list_name: &'a str, body: &'a str },
}

/// Pass one: split the template into plain text and each-blocks. Any `{{#…}}`
/// other than `each`, any stray `{{/…}}`, and any nesting is an error.
fn parse_blocks(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0usize;

    while let Some(pos) = find_directive(&template[offset..]) {
        let abs = offset + pos;
        let (name, tag_len) = directive_at(&template[abs..])
            .ok_or_else(|| TemplateError::new(TemplateErrorKind::UnknownDirective, template))?;
        match name {
            Directive::EachOpen(list_name) => {
                segments.push(Segment::Text(&template[offset..abs]));
                let body_start = abs + tag_len;
                let close = find_each_close(&template[body_start..]).map_err(|k| TemplateError::new(k, template))?;
                segments.push(Segment::Each {
                    list_name,
                    body: &template[body_start..body_start + close.0],
                });
                offset = body_start + close.0 + close.1;
            }
            Directive::EachClose => {
                return Err(TemplateError::new(TemplateErrorKind::UnknownDirective, template));
            }
            Directive::Other => {
                return Err(TemplateError::new(TemplateErrorKind::UnknownDirective, template));
            }
        }
        rest = &template[offset..];
    }
    segments.push(Segment::Text(rest));
    Ok(segments)
}

enum Directive<'a> {
    EachOpen(&'a str),
    EachClose,
    Other,
}

/// Byte offset of the next `{{#` or `{{/` in `s`.
fn find_directive(s: &str) -> Option<usize> {
    let hash = s.find("{{#");
    let slash = s.find("{{/");
    match (hash, slash) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Parse the directive starting at the beginning of `s`; returns the directive
/// and its token length.
fn directive_at(s: &str) -> Option<(Directive<'_>, usize)> {
    let end = s.find("}}")?;
    let inner = &s[2..end];
    let tag_len = end + 2;
    if let Some(arg) = inner.strip_prefix("#each ") {
        let name = arg.trim();
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Some((Directive::EachOpen(name), tag_len));
        }
        return Some((Directive::Other, tag_len));
    }
    if inner == "/each" {
        return Some((Directive::EachClose, tag_len));
    }
    Some((Directive::Other, tag_len))
}

/// Find the `{{/each}}` closing the block whose body starts at the beginning
/// of `s`. Returns (body length, close tag length). A nested `{{#each` before
/// the close is an error.
fn find_each_close(s: &str) -> Result<(usize, usize), TemplateErrorKind> {
    let close = s.find("{{/each}}").ok_or(TemplateErrorKind::UnclosedEach)?;
    if let Some(nested) = s.find("{{#each") {
        if nested < close {
            return Err(TemplateErrorKind::NestedEach);
        }
    }
    Ok((close, "{{/each}}".len()))
}

/// Pass two: substitute `{{name}}` scalars. `chain` is the lookup order:
/// innermost scope first.
fn substitute(text: &str, chain: &[&Scope]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if name.chars().all(|c| c.is_alphanumeric() || c == '_') && !name.is_empty() {
                    if let Some(v) = chain.iter().find_map(|s| s.get(name)) {
                        out.push_str(&scalar_to_string(v));
                    }
                    // unknown name renders as empty string
                } else {
                    // not a variable token; keep literally
                    out.push_str(&rest[start..start + 2 + end + 2]);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_item(body: &str, item: &Value, outer: &Scope) -> String {
    let mut item_scope = Scope::new();
    match item {
        Value::Object(map) => {
            for (k, v) in map {
                item_scope.insert(k.clone(), v.clone());
            }
        }
        other => {
            item_scope.insert("this".to_string(), other.clone());
        }
    }
    substitute(body, &[&item_scope, outer])
}

/// Booleans render as Python-style `True`/`False`, nulls as empty string.
pub fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// The literal template with every `{{#…}}` / `{{/…}}` token removed; used as
/// the fallback text on render errors.
fn strip_directives(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = find_directive(rest) {
        out.push_str(&rest[..pos]);
        match rest[pos..].find("}}") {
            Some(end) => rest = &rest[pos + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(v: serde_json::Value) -> Scope {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn scalar_substitution() {
        let s = scope(json!({"name": "Ann", "n": 3, "ok": true, "bad": false}));
        assert_eq!(
            render("{{name}} has {{n}} ({{ok}}/{{bad}})", &s, None).unwrap(),
            "Ann has 3 (True/False)"
        );
    }

    #[test]
    fn missing_name_is_empty() {
        let s = scope(json!({}));
        assert_eq!(render("[{{nope}}]", &s, None).unwrap(), "[]");
    }

    #[test]
    fn each_iterates_with_item_keys_before_outer() {
        let s = scope(json!({
            "items": [{"name": "a"}, {"name": "b"}],
            "name": "outer",
            "sep": ";"
        }));
        assert_eq!(
            render("{{#each items}}{{name}}{{sep}}{{/each}}", &s, None).unwrap(),
            "a;b;"
        );
    }

    #[test]
    fn each_over_scalars_binds_this() {
        let s = scope(json!({"vals": [1, 2, 3]}));
        assert_eq!(
            render("{{#each vals}}<{{this}}>{{/each}}", &s, None).unwrap(),
            "<1><2><3>"
        );
    }

    #[test]
    fn empty_list_with_empty_text_returns_it_verbatim() {
        let s = scope(json!({"items": []}));
        assert_eq!(
            render("head {{#each items}}x{{/each}} tail", &s, Some("nothing {{here}}")).unwrap(),
            "nothing {{here}}"
        );
    }

    #[test]
    fn empty_list_without_empty_text_renders_nothing() {
        let s = scope(json!({"items": []}));
        assert_eq!(
            render("head {{#each items}}x{{/each}} tail", &s, None).unwrap(),
            "head  tail"
        );
    }

    #[test]
    fn each_over_non_list_is_error_with_fallback() {
        let s = scope(json!({"items": "oops"}));
        let err = render("a {{#each items}}x{{/each}} b", &s, None).unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::NotAList);
        assert_eq!(err.fallback, "a x b");
    }

    #[test]
    fn unknown_directive_is_error_with_stripped_fallback() {
        let s = scope(json!({"x": 1}));
        let err = render("a {{#if x}}b{{/if}} c", &s, None).unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::UnknownDirective);
        assert_eq!(err.fallback, "a b c");
    }

    #[test]
    fn nested_each_rejected() {
        let s = scope(json!({"a": [], "b": []}));
        let err = render("{{#each a}}{{#each b}}x{{/each}}{{/each}}", &s, None).unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::NestedEach);
    }

    #[test]
    fn unclosed_each_rejected() {
        let s = scope(json!({"a": []}));
        let err = render("{{#each a}}x", &s, None).unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::UnclosedEach);
    }

    #[test]
    fn values_cannot_inject_directives() {
        let s = scope(json!({"v": "{{#each items}}"}));
        assert_eq!(render("{{v}}", &s, None).unwrap(), "{{#each items}}");
    }
}
