//! Per-node command and path templates.
//!
//! Placeholders are `{name}` or `{name:0N}` (numeric value, zero-padded to
//! width N). `{{` and `}}` produce literal braces. Built-ins are `host`,
//! `user`, `index` and `node`; the last two are the 1-based position of the
//! node within the invocation set. Anything else must come from a caller
//! substitution vector holding exactly one value per node.

use std::collections::BTreeMap;

use cbench_core::Node;

use crate::error::{RemoteError, RemoteResult};

const BUILTINS: [&str; 4] = ["host", "user", "index", "node"];

/// Built-in values for one node of an invocation.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub node: &'a Node,
    /// Zero-based position within the invocation set.
    pub position: usize,
}

impl<'a> NodeContext<'a> {
    pub fn new(node: &'a Node, position: usize) -> Self {
        Self { node, position }
    }

    fn builtin(&self, name: &str) -> Option<String> {
        match name {
            "host" => Some(self.node.host.clone()),
            "user" => Some(self.node.user.clone()),
            "index" | "node" => Some((self.position + 1).to_string()),
            _ => None,
        }
    }
}

/// Caller-supplied per-node values, keyed by placeholder name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    values: BTreeMap<String, Vec<String>>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.values.insert(name.into(), values);
        self
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn get(&self, name: &str, position: usize) -> Option<&str> {
        self.values.get(name).and_then(|v| v.get(position)).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Every vector must hold exactly one value per node.
    pub fn validate(&self, node_count: usize) -> RemoteResult<()> {
        for (name, values) in &self.values {
            if BUILTINS.contains(&name.as_str()) {
                return Err(RemoteError::ReservedName(name.clone()));
            }
            if values.len() != node_count {
                return Err(RemoteError::LengthMismatch {
                    name: name.clone(),
                    expected: node_count,
                    actual: values.len(),
                });
            }
        }
        Ok(())
    }
}

/// Escape literal text so it survives rendering unchanged.
pub fn escape(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// Render `template` for one node.
pub fn render(template: &str, ctx: &NodeContext<'_>, subs: &Substitutions) -> RemoteResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(RemoteError::UnbalancedBrace(template.to_string())),
            '{' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => {
                            return Err(RemoteError::UnbalancedBrace(template.to_string()));
                        }
                        Some(ch) => inner.push(ch),
                    }
                }
                out.push_str(&expand(&inner, template, ctx, subs)?);
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn expand(
    inner: &str,
    template: &str,
    ctx: &NodeContext<'_>,
    subs: &Substitutions,
) -> RemoteResult<String> {
    let (name, spec) = match inner.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec)),
        None => (inner.trim(), None),
    };

    let value = ctx
        .builtin(name)
        .or_else(|| subs.get(name, ctx.position).map(str::to_string))
        .ok_or_else(|| RemoteError::UnknownPlaceholder {
            name: name.to_string(),
            template: template.to_string(),
        })?;

    let Some(spec) = spec else {
        return Ok(value);
    };

    let bad = || RemoteError::BadFormat {
        name: name.to_string(),
        spec: spec.to_string(),
    };
    let width: usize = spec
        .strip_prefix('0')
        .ok_or_else(|| bad())?
        .parse()
        .map_err(|_| bad())?;
    let number: i64 = value.parse().map_err(|_| bad())?;
    Ok(format!("{number:0width$}"))
}

/// Render `template` for every node, in order.
pub fn render_all(
    template: &str,
    nodes: &[Node],
    subs: &Substitutions,
) -> RemoteResult<Vec<String>> {
    subs.validate(nodes.len())?;
    nodes
        .iter()
        .enumerate()
        .map(|(position, node)| render(template, &NodeContext::new(node, position), subs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<Node> {
        vec![Node::new("meru", "n01", 1), Node::new("meru", "n02", 2)]
    }

    #[test]
    fn renders_builtins() {
        let out = render_all("{user}@{host} #{index}", &nodes(), &Substitutions::new()).unwrap();
        assert_eq!(out, vec!["meru@n01 #1", "meru@n02 #2"]);
    }

    #[test]
    fn zero_padding() {
        let out = render_all("trace-{node:04}.txt", &nodes(), &Substitutions::new()).unwrap();
        assert_eq!(out[1], "trace-0002.txt");
    }

    #[test]
    fn caller_vectors_substitute_by_position() {
        let subs = Substitutions::new().with("binary", vec!["cbr".into(), "oh".into()]);
        let out = render_all("./{binary} --id={index}", &nodes(), &subs).unwrap();
        assert_eq!(out, vec!["./cbr --id=1", "./oh --id=2"]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let subs = Substitutions::new().with("binary", vec!["cbr".into()]);
        let err = render_all("{binary}", &nodes(), &subs).unwrap_err();
        assert_eq!(
            err,
            RemoteError::LengthMismatch {
                name: "binary".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let err = render_all("{nope}", &nodes(), &Substitutions::new()).unwrap_err();
        assert!(matches!(err, RemoteError::UnknownPlaceholder { .. }));
    }

    #[test]
    fn escaped_braces_pass_through() {
        let text = "awk '{print $1}' {host}";
        let template = escape("awk '{print $1}' ") + "{host}";
        let out = render_all(&template, &nodes(), &Substitutions::new()).unwrap();
        assert_eq!(out[0], text.replace("{host}", "n01"));
    }

    #[test]
    fn unbalanced_braces_fail() {
        assert!(render_all("{host", &nodes(), &Substitutions::new()).is_err());
        assert!(render_all("host}", &nodes(), &Substitutions::new()).is_err());
    }

    #[test]
    fn padding_non_numeric_fails() {
        let err = render_all("{host:04}", &nodes(), &Substitutions::new()).unwrap_err();
        assert!(matches!(err, RemoteError::BadFormat { .. }));
    }

    #[test]
    fn builtin_names_are_reserved() {
        let subs = Substitutions::new().with("host", vec!["x".into(), "y".into()]);
        assert_eq!(
            render_all("{host}", &nodes(), &subs).unwrap_err(),
            RemoteError::ReservedName("host".into())
        );
    }
}
