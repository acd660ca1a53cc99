//! Command templating.
//!
//! Commands and their input are rendered through a [`Templating`]
//! implementation before they reach the shell. [`PlaceholderTemplating`]
//! covers the small syntax the scripts need:
//!
//! - `{{ name }}` substitutes a context value verbatim
//! - `{{ name|quote }}` substitutes a shell-quoted value
//! - `{% quote %}...{% endquote %}` renders the body, then shell-quotes it
//!   (`{% end_quote %}` is accepted too)
//!
//! Dotted names (`{{ build.target }}`) look up nested objects.

use std::borrow::Cow;

use serde_json::Value;
use thiserror::Error;

/// Values available to a template.
pub type Context = serde_json::Map<String, Value>;

/// Errors that can occur while rendering a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    #[error("unterminated {0}")]
    Unterminated(String),
}

/// Renders command templates and quotes shell words.
pub trait Templating {
    fn render(&self, template: &str, context: &Context) -> Result<String, TemplateError>;

    /// Quotes `value` so the shell reads it as one word.
    fn quote(&self, value: &str) -> String;
}

/// The built-in placeholder renderer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderTemplating;

const QUOTE_END_TAGS: &[&str] = &["endquote", "end_quote"];

impl Templating for PlaceholderTemplating {
    fn render(&self, template: &str, context: &Context) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = next_opening(rest) {
            out.push_str(&rest[..start]);
            let opening = &rest[start..start + 2];
            let after = &rest[start + 2..];

            if opening == "{{" {
                let end = after
                    .find("}}")
                    .ok_or_else(|| TemplateError::Unterminated("'{{'".to_string()))?;
                out.push_str(&self.expression(&after[..end], context)?);
                rest = &after[end + 2..];
            } else {
                let end = after
                    .find("%}")
                    .ok_or_else(|| TemplateError::Unterminated("'{%'".to_string()))?;
                let tag = after[..end].trim();
                let body = &after[end + 2..];

                if tag != "quote" {
                    return Err(TemplateError::UnknownTag(tag.to_string()));
                }

                let (inner, remaining) = split_quote_block(body)?;
                let rendered = self.render(inner, context)?;
                out.push_str(&self.quote(&rendered));
                rest = remaining;
            }
        }

        out.push_str(rest);
        Ok(out)
    }

    fn quote(&self, value: &str) -> String {
        shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
    }
}

impl PlaceholderTemplating {
    fn expression(&self, expr: &str, context: &Context) -> Result<String, TemplateError> {
        let mut parts = expr.split('|').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let mut value = lookup(context, name)
            .map(stringify)
            .ok_or_else(|| TemplateError::UndefinedVariable(name.to_string()))?;

        for filter in parts {
            value = match filter {
                "quote" => self.quote(&value),
                other => return Err(TemplateError::UnknownFilter(other.to_string())),
            };
        }
        Ok(value)
    }
}

fn next_opening(text: &str) -> Option<usize> {
    match (text.find("{{"), text.find("{%")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Splits `text` at the end tag closing a quote block.
fn split_quote_block(text: &str) -> Result<(&str, &str), TemplateError> {
    let mut offset = 0;
    while let Some(start) = text[offset..].find("{%") {
        let start = offset + start;
        let Some(end) = text[start + 2..].find("%}") else {
            break;
        };
        let tag = text[start + 2..start + 2 + end].trim();
        if QUOTE_END_TAGS.contains(&tag) {
            return Ok((&text[..start], &text[start + 2 + end + 2..]));
        }
        offset = start + 2 + end + 2;
    }
    Err(TemplateError::Unterminated("quote block".to_string()))
}

fn lookup<'a>(context: &'a Context, name: &str) -> Option<&'a Value> {
    let mut segments = name.split('.');
    let mut value = context.get(segments.next()?)?;
    for segment in segments {
        value = value.get(segment)?;
    }
    Some(value)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    fn render(template: &str, value: Value) -> Result<String, TemplateError> {
        PlaceholderTemplating.render(template, &context(value))
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(render("ls -la", json!({})).unwrap(), "ls -la");
        assert_eq!(render("", json!({})).unwrap(), "");
    }

    #[test]
    fn test_substitution() {
        let out = render("echo {{ name }} {{count}}", json!({"name": "world", "count": 3})).unwrap();
        assert_eq!(out, "echo world 3");
    }

    #[test]
    fn test_quote_filter() {
        let out = render("echo {{ msg|quote }}", json!({"msg": "it's here"})).unwrap();
        assert_eq!(out, "echo 'it'\\''s here'");

        let out = render("cat {{ path | quote }}", json!({"path": "plain"})).unwrap();
        assert_eq!(out, "cat plain");
    }

    #[test]
    fn test_quote_block() {
        let out = render(
            "sh -c {% quote %}echo {{ a }} && echo b{% endquote %}",
            json!({"a": "x"}),
        )
        .unwrap();
        assert_eq!(out, "sh -c 'echo x && echo b'");

        let out = render("{% quote %}a b{% end_quote %}!", json!({})).unwrap();
        assert_eq!(out, "'a b'!");
    }

    #[test]
    fn test_nested_lookup_and_scalars() {
        let out = render(
            "{{ build.target }} {{ flag }} {{ missing_ok }}",
            json!({"build": {"target": "release"}, "flag": true, "missing_ok": null}),
        )
        .unwrap();
        assert_eq!(out, "release true ");
    }

    #[test]
    fn test_undefined_variable() {
        assert_eq!(
            render("echo {{ nope }}", json!({})),
            Err(TemplateError::UndefinedVariable("nope".to_string()))
        );
    }

    #[test]
    fn test_unknown_filter() {
        assert_eq!(
            render("{{ a|upper }}", json!({"a": "x"})),
            Err(TemplateError::UnknownFilter("upper".to_string()))
        );
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            render("{% for x in y %}", json!({})),
            Err(TemplateError::UnknownTag("for x in y".to_string()))
        );
    }

    #[test]
    fn test_unterminated() {
        assert!(matches!(
            render("echo {{ a", json!({"a": 1})),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            render("{% quote %}never closed", json!({})),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            render("{% quote", json!({})),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn test_quote_empty_string() {
        assert_eq!(PlaceholderTemplating.quote(""), "''");
    }
}
