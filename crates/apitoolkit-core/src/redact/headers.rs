use super::REDACTED;
use std::collections::{BTreeMap, HashSet};

/// Replaces the values of configured headers with [`REDACTED`].
///
/// Names are matched case-insensitively. The configured spelling is also
/// kept as-is, so a lookup by the exact configured name always hits.
#[derive(Debug, Clone, Default)]
pub struct HeaderRedactor {
    names: HashSet<String>,
}

impl HeaderRedactor {
    /// Create a redactor for the given header names.
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut set = HashSet::new();
        for name in names {
            let name = name.into();
            set.insert(name.to_lowercase());
            set.insert(name);
        }
        Self { names: set }
    }

    /// Check if a header should be redacted.
    pub fn is_redacted(&self, name: &str) -> bool {
        self.names.contains(&name.to_lowercase()) || self.names.contains(name)
    }

    /// Check if no header will ever be redacted.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Redact a header map.
    ///
    /// Every key is kept with its original casing; only values change.
    pub fn redact(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if self.is_redacted(name) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (name.clone(), value)
            })
            .collect()
    }
}
