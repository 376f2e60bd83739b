//! Prioritized context fragments for prompt assembly.

use serde::{Deserialize, Serialize};

/// Inclusion priority for a [`ContextItem`].
///
/// The derive order is the sort order: `Essential` packs first and is never
/// dropped, `Low` packs last and is dropped first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Always included, even when the budget overflows.
    Essential,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank used for sorting (`Essential` = 0).
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Essential => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// One labeled, prioritized unit of text considered for inclusion in a prompt.
///
/// Items are created per call site and consumed by a single context build;
/// they are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub content: String,
    pub priority: Priority,
    /// Caller-supplied token count. When absent the context manager estimates.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tokens: Option<u32>,
    /// Whether the item may be truncated to fit instead of being dropped.
    #[serde(default)]
    pub summarizable: bool,
}

impl ContextItem {
    #[must_use]
    pub fn new(id: impl Into<String>, content: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            priority,
            tokens: None,
            summarizable: false,
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    #[must_use]
    pub fn summarizable(mut self) -> Self {
        self.summarizable = true;
        self
    }
}
