//! Deterministic YAML writer.
//!
//! serde_yaml cannot emit comments or anchors, both of which the target
//! output needs, so documents are built as an ordered [`Node`] tree and
//! written here. Scalars are still rendered by serde_yaml so quoting follows
//! the YAML rules exactly.

use std::fmt::Write as _;

/// An ordered YAML node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Str(String),
    /// A number, kept in its textual form
    Number(String),
    Bool(bool),
    Null,
    Seq(Vec<Node>),
    Map(Vec<(String, Node)>),
    /// `*name`
    Alias(String),
    /// `&name` followed by the node
    Anchor(String, Box<Node>),
    /// Comment lines written before the node's key or sequence dash
    Commented(Vec<String>, Box<Node>),
}

/// A whole document: header comments plus the root mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub header: Vec<String>,
    pub root: Vec<(String, Node)>,
}

impl Node {
    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    pub fn number(value: impl std::fmt::Display) -> Self {
        Self::Number(value.to_string())
    }

    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Seq(items.into_iter().map(|s| Self::Str(s.into())).collect())
    }

    /// Attaches comment lines; no-op for an empty list.
    #[must_use]
    pub fn with_comments(self, comments: Vec<String>) -> Self {
        if comments.is_empty() {
            self
        } else {
            Self::Commented(comments, Box::new(self))
        }
    }

    /// Converts a parsed YAML value, dropping tags.
    pub fn from_value(value: &serde_yaml::Value) -> Self {
        use serde_yaml::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.to_string()),
            Value::String(s) => Self::Str(s.clone()),
            Value::Sequence(items) => Self::Seq(items.iter().map(Self::from_value).collect()),
            Value::Mapping(mapping) => Self::Map(
                mapping
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::String(s) => s.clone(),
                            other => serde_yaml::to_string(other)
                                .map(|s| s.trim_end().to_string())
                                .unwrap_or_default(),
                        };
                        (key, Self::from_value(v))
                    })
                    .collect(),
            ),
            Value::Tagged(tagged) => Self::from_value(&tagged.value),
        }
    }

    fn is_block(&self) -> bool {
        match self {
            Self::Seq(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
            _ => false,
        }
    }

    fn peel(&self) -> (&[String], &Node) {
        match self {
            Self::Commented(comments, inner) => (comments, inner),
            other => (&[], other),
        }
    }
}

/// Renders `document` as YAML text ending in a newline.
///
/// # Errors
///
/// Returns an error if serde_yaml cannot render a scalar.
pub fn render(document: &Document) -> Result<String, serde_yaml::Error> {
    let mut writer = Writer::default();
    for line in &document.header {
        writer.comment(line, 0);
    }
    for (position, entry) in document.root.iter().enumerate() {
        if position > 0 || !document.header.is_empty() {
            writer.out.push('\n');
        }
        writer.entries(std::slice::from_ref(entry), 0)?;
    }
    Ok(writer.out)
}

#[derive(Default)]
struct Writer {
    out: String,
}

impl Writer {
    fn comment(&mut self, text: &str, indent: usize) {
        for line in text.lines() {
            let _ = writeln!(self.out, "{:indent$}# {line}", "");
        }
        if text.is_empty() {
            let _ = writeln!(self.out, "{:indent$}#", "");
        }
    }

    fn entries(&mut self, entries: &[(String, Node)], indent: usize) -> Result<(), serde_yaml::Error> {
        for (key, value) in entries {
            let (comments, value) = value.peel();
            for line in comments {
                self.comment(line, indent);
            }
            let lead = format!("{:indent$}{}:", "", scalar_text(key)?);
            self.value(&lead, value, indent + 2)?;
        }
        Ok(())
    }

    fn items(&mut self, items: &[Node], indent: usize) -> Result<(), serde_yaml::Error> {
        for item in items {
            let (comments, item) = item.peel();
            for line in comments {
                self.comment(line, indent);
            }
            match item {
                Node::Map(entries) if !entries.is_empty() => {
                    let (key, first) = &entries[0];
                    let (first_comments, first) = first.peel();
                    for line in first_comments {
                        self.comment(line, indent);
                    }
                    let lead = format!("{:indent$}- {}:", "", scalar_text(key)?);
                    self.value(&lead, first, indent + 4)?;
                    self.entries(&entries[1..], indent + 2)?;
                }
                other => {
                    let lead = format!("{:indent$}-", "");
                    self.value(&lead, other, indent + 2)?;
                }
            }
        }
        Ok(())
    }

    /// Writes `node` after `lead`, with block content at `indent`.
    fn value(&mut self, lead: &str, node: &Node, indent: usize) -> Result<(), serde_yaml::Error> {
        match node {
            Node::Commented(_, inner) => self.value(lead, inner, indent),
            Node::Map(entries) if !entries.is_empty() => {
                let _ = writeln!(self.out, "{lead}");
                self.entries(entries, indent)
            }
            Node::Seq(items) if !items.is_empty() => {
                let _ = writeln!(self.out, "{lead}");
                self.items(items, indent)
            }
            Node::Anchor(name, inner) if inner.is_block() => {
                let _ = writeln!(self.out, "{lead} &{name}");
                match inner.as_ref() {
                    Node::Map(entries) => self.entries(entries, indent),
                    Node::Seq(items) => self.items(items, indent),
                    _ => Ok(()),
                }
            }
            Node::Anchor(name, inner) => {
                let text = inline(inner)?;
                let _ = writeln!(self.out, "{lead} &{name} {text}");
                Ok(())
            }
            Node::Str(text) if is_literal_block(text) => {
                let _ = writeln!(self.out, "{lead} |-");
                for line in text.lines() {
                    if line.is_empty() {
                        self.out.push('\n');
                    } else {
                        let _ = writeln!(self.out, "{:indent$}{line}", "");
                    }
                }
                Ok(())
            }
            other => {
                let text = inline(other)?;
                let _ = writeln!(self.out, "{lead} {text}");
                Ok(())
            }
        }
    }
}

/// Multi-line text that survives a `|-` block unchanged.
fn is_literal_block(text: &str) -> bool {
    text.contains('\n')
        && !text.starts_with([' ', '\t', '\n'])
        && !text.ends_with('\n')
        && !text.lines().any(|line| line.ends_with([' ', '\t']))
        && !text.contains('\r')
}

/// Inline rendering of a scalar, alias or empty collection.
fn inline(node: &Node) -> Result<String, serde_yaml::Error> {
    Ok(match node {
        Node::Str(text) => scalar_text(text)?,
        Node::Number(text) => text.clone(),
        Node::Bool(value) => value.to_string(),
        Node::Null => "null".to_string(),
        Node::Alias(name) => format!("*{name}"),
        Node::Seq(_) => "[]".to_string(),
        Node::Map(_) => "{}".to_string(),
        Node::Anchor(name, inner) => format!("&{name} {}", inline(inner)?),
        Node::Commented(_, inner) => inline(inner)?,
    })
}

fn scalar_text(text: &str) -> Result<String, serde_yaml::Error> {
    let rendered = serde_yaml::to_string(text)?;
    Ok(rendered.trim_end_matches('\n').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(root: Vec<(&str, Node)>) -> Document {
        Document {
            header: Vec::new(),
            root: root.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    #[test]
    fn test_sequence_of_maps_uses_compact_form() {
        let steps = Node::Seq(vec![Node::Map(vec![
            ("label".to_string(), Node::str("build")),
            ("command".to_string(), Node::str("make")),
        ])]);
        let text = render(&doc(vec![("steps", steps)])).unwrap();
        assert_eq!(text, "steps:\n  - label: build\n    command: make\n");
    }

    #[test]
    fn test_comments_precede_items() {
        let steps = Node::Seq(vec![Node::Map(vec![("key".to_string(), Node::str("a"))])
            .with_comments(vec!["manual: do this".to_string()])]);
        let text = render(&doc(vec![("steps", steps)])).unwrap();
        assert_eq!(text, "steps:\n  # manual: do this\n  - key: a\n");
    }

    #[test]
    fn test_anchor_and_alias() {
        let plugin = Node::Map(vec![("docker".to_string(), Node::Map(vec![("image".to_string(), Node::str("node"))]))]);
        let document = doc(vec![
            (
                "x-anchors",
                Node::Map(vec![("docker-build".to_string(), Node::Anchor("docker-build".to_string(), Box::new(plugin)))]),
            ),
            ("steps", Node::Seq(vec![Node::Map(vec![(
                "plugins".to_string(),
                Node::Seq(vec![Node::Alias("docker-build".to_string())]),
            )])])),
        ]);
        let text = render(&document).unwrap();
        assert_eq!(
            text,
            "x-anchors:\n  docker-build: &docker-build\n    docker:\n      image: node\n\nsteps:\n  - plugins:\n      - *docker-build\n"
        );
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).expect("Should be valid YAML");
        assert_eq!(parsed["steps"][0]["plugins"][0]["docker"]["image"].as_str(), Some("node"));
    }

    #[test]
    fn test_multiline_string_is_literal_block() {
        let text = render(&doc(vec![("command", Node::str("echo a\necho b"))])).unwrap();
        assert_eq!(text, "command: |-\n  echo a\n  echo b\n");
    }

    #[test]
    fn test_scalars_are_quoted_when_needed() {
        let text = render(&doc(vec![
            ("a", Node::str("true")),
            ("b", Node::str("build.branch == \"main\"")),
            ("c", Node::Seq(Vec::new())),
        ]))
        .unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).expect("Should be valid YAML");
        assert_eq!(parsed["a"].as_str(), Some("true"));
        assert_eq!(parsed["b"].as_str(), Some("build.branch == \"main\""));
        assert!(parsed["c"].as_sequence().is_some_and(Vec::is_empty));
    }
}
