//! Placeholder substitution and document splitting

use std::collections::BTreeMap;

/// Literal placeholder → value replacements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    entries: BTreeMap<String, String>,
}

impl Substitutions {
    /// No replacements
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the literal `placeholder` with `value`
    pub fn insert(mut self, placeholder: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(placeholder.into(), value.into());
        self
    }

    /// Replace both `${name}` and bare `name` with `value`
    pub fn variable(self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.insert(format!("${{{}}}", name), value.clone())
            .insert(name, value)
    }

    /// Whether there is nothing to replace
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every replacement to `text`.
    ///
    /// Longer placeholders go first, so `${TOKEN}` is consumed before a bare
    /// `TOKEN` entry could split it. Placeholders absent from the text are
    /// no-ops.
    pub fn apply(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }
        let mut ordered: Vec<(&String, &String)> = self.entries.iter().collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        ordered
            .into_iter()
            .filter(|(placeholder, _)| !placeholder.is_empty())
            .fold(text.to_string(), |acc, (placeholder, value)| {
                acc.replace(placeholder.as_str(), value)
            })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Substitutions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Split a manifest into documents.
///
/// Only the exact sequence `\n---` separates documents, so a `---` on the
/// very first line stays part of the first segment. Segments are trimmed;
/// blank ones and ones starting with `#` are dropped.
pub fn split_documents(content: &str) -> Vec<&str> {
    content
        .split("\n---")
        .map(str::trim)
        .filter(|doc| !doc.is_empty() && !doc.starts_with('#'))
        .collect()
}
