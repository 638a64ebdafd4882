//! Output label lookup (spec section 9 / 4.6)
//!
//! Label lookup is an external collaborator the spec excludes as a feature,
//! but `original_source/label_provider.h` shows it's still part of the
//! ambient surface a serving system carries: a trivial index-to-string
//! table loaded once per model, consulted by nothing in this crate but
//! available to whatever wire layer eventually sits in front of it.

use multiserve_common::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// Maps an output class index to a human-readable label.
pub trait LabelProvider: Send + Sync {
    fn label(&self, index: usize) -> Option<&str>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Labels loaded from a newline-delimited text file, one label per line,
/// indexed by line number.
pub struct FileLabelProvider {
    labels: Vec<String>,
}

impl FileLabelProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let labels = contents.lines().map(|l| l.to_string()).collect();
        Ok(Self { labels })
    }

    pub fn from_lines(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl LabelProvider for FileLabelProvider {
    fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(|s| s.as_str())
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Per-model label providers, keyed by model name.
#[derive(Default)]
pub struct LabelRegistry {
    providers: HashMap<String, Box<dyn LabelProvider>>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model_name: impl Into<String>, provider: Box<dyn LabelProvider>) {
        self.providers.insert(model_name.into(), provider);
    }

    pub fn label_for(&self, model_name: &str, index: usize) -> Result<&str> {
        self.providers
            .get(model_name)
            .ok_or_else(|| Error::not_found(format!("no label file registered for model '{model_name}'")))?
            .label(index)
            .ok_or_else(|| Error::invalid_argument(format!("label index {index} out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_label_provider_indexes_by_line() {
        let provider = FileLabelProvider::from_lines(vec!["cat".into(), "dog".into()]);
        assert_eq!(provider.label(0), Some("cat"));
        assert_eq!(provider.label(1), Some("dog"));
        assert_eq!(provider.label(2), None);
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn registry_looks_up_by_model_name() {
        let mut registry = LabelRegistry::new();
        registry.register(
            "resnet50",
            Box::new(FileLabelProvider::from_lines(vec!["cat".into()])),
        );

        assert_eq!(registry.label_for("resnet50", 0).unwrap(), "cat");
        assert!(registry.label_for("unknown", 0).is_err());
        assert!(registry.label_for("resnet50", 5).is_err());
    }
}
