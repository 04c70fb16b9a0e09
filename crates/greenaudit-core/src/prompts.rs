//! Prompt sets loaded from JSON data files.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GreenAuditError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: u32,
    pub category: String,
    pub text: String,
}

/// On-disk shapes. `Blocks` lists prompts in contiguous category blocks of
/// `per_category` each; `Entries` spells every prompt out.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptFile {
    Blocks {
        name: String,
        categories: Vec<String>,
        per_category: usize,
        prompts: Vec<String>,
    },
    Entries {
        name: String,
        entries: Vec<Prompt>,
    },
}

/// Category of the prompt at `index` in a contiguous block layout.
///
/// Indices past the last full block stay in the last category.
pub fn category_for_index(index: usize, per_category: usize, categories: &[String]) -> Option<&str> {
    if per_category == 0 || categories.is_empty() {
        return None;
    }
    let block = (index / per_category).min(categories.len() - 1);
    Some(categories[block].as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    pub name: String,
    pub prompts: Vec<Prompt>,
}

impl PromptSet {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GreenAuditError::PromptSet(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: PromptFile = serde_json::from_str(content)
            .map_err(|e| GreenAuditError::PromptSet(format!("invalid prompt file: {}", e)))?;

        let set = match file {
            PromptFile::Blocks {
                name,
                categories,
                per_category,
                prompts,
            } => Self::from_blocks(name, &categories, per_category, prompts)?,
            PromptFile::Entries { name, entries } => Self {
                name,
                prompts: entries,
            },
        };

        set.validate()?;
        Ok(set)
    }

    pub fn from_blocks(
        name: impl Into<String>,
        categories: &[String],
        per_category: usize,
        texts: Vec<String>,
    ) -> Result<Self> {
        if categories.is_empty() {
            return Err(GreenAuditError::PromptSet("no categories given".into()));
        }
        if per_category == 0 {
            return Err(GreenAuditError::PromptSet("per_category must be at least 1".into()));
        }

        let prompts = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Prompt {
                id: i as u32 + 1,
                // categories is non-empty and per_category > 0, checked above
                category: category_for_index(i, per_category, categories)
                    .unwrap_or_default()
                    .to_string(),
                text,
            })
            .collect();

        Ok(Self {
            name: name.into(),
            prompts,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(GreenAuditError::PromptSet(format!(
                "prompt set '{}' is empty",
                self.name
            )));
        }

        let mut seen = HashSet::with_capacity(self.prompts.len());
        for p in &self.prompts {
            if !seen.insert(p.id) {
                return Err(GreenAuditError::PromptSet(format!("duplicate prompt id {}", p.id)));
            }
            if p.text.trim().is_empty() {
                return Err(GreenAuditError::PromptSet(format!("prompt {} has no text", p.id)));
            }
        }
        Ok(())
    }

    /// Keep only the first `n` prompts.
    pub fn limit(mut self, n: usize) -> Self {
        self.prompts.truncate(n);
        self
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Category labels with their prompt counts, in first-appearance order.
    pub fn category_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for p in &self.prompts {
            match counts.iter_mut().find(|(c, _)| *c == p.category) {
                Some((_, n)) => *n += 1,
                None => counts.push((p.category.clone(), 1)),
            }
        }
        counts
    }
}
