//! Token-budget context packing.
//!
//! Token counts here are **estimates** from a characters-per-token ratio, not
//! a real tokenizer. The default ratio (3.5 chars/token) tracks English prose
//! on modern BPE vocabularies; the conservative ratio (3.0) overestimates on
//! purpose for callers that would rather waste budget than overflow it.
//! Estimates are memoized in a bounded map keyed by the text's first/last 100
//! characters plus its length.
//!
//! Packing is greedy in priority order: an item that fits is included, an
//! `Essential` item is force-included even past the budget, a `summarizable`
//! item is truncated into whatever budget remains, anything else is dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use ballast_types::{ContextItem, Message, Priority};

/// Default chars-per-token ratio.
const CHARS_PER_TOKEN: f64 = 3.5;
/// Conservative ratio; overestimates token usage.
const CHARS_PER_TOKEN_CONSERVATIVE: f64 = 3.0;
/// Estimate-cache capacity; the whole map is cleared on overflow.
const ESTIMATE_CACHE_MAX: usize = 1000;
/// Minimum leftover budget worth truncating a summarizable item into.
const MIN_TRUNCATION_BUDGET: u32 = 100;

/// Token budget configuration for a model.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// The model's combined input+output token window.
    pub max_tokens: u32,
    /// Tokens reserved for the model's response.
    pub reserved_for_response: u32,
    /// Estimated overhead of the system message.
    pub system_message_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            reserved_for_response: 2000,
            system_message_tokens: 500,
        }
    }
}

impl ContextConfig {
    /// Config for a model window, keeping the default reservations.
    #[must_use]
    pub fn for_window(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }
}

/// Outcome of a [`ContextManager::build_context`] call.
#[derive(Debug, Clone)]
pub struct ContextBuildResult {
    /// Items that made it into the context, in packing order. Truncated
    /// items carry their truncated content.
    pub selected_items: Vec<ContextItem>,
    /// Estimated tokens of the selected items.
    pub total_tokens: u32,
    /// Whether anything was truncated or dropped to fit.
    pub truncated: bool,
    /// Human-readable packing report.
    pub summary: String,
}

/// Packs prioritized text fragments into a model's token budget.
#[derive(Debug)]
pub struct ContextManager {
    config: ContextConfig,
    estimate_cache: Mutex<HashMap<String, u32>>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl ContextManager {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            estimate_cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Estimate the token count of `text`.
    ///
    /// `conservative` uses the lower chars-per-token ratio, overestimating
    /// usage. Results are memoized.
    #[must_use]
    pub fn estimate_tokens(&self, text: &str, conservative: bool) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let key = estimate_cache_key(text, conservative);
        {
            let cache = self.estimate_cache.lock().expect("estimate cache poisoned");
            if let Some(&tokens) = cache.get(&key) {
                return tokens;
            }
        }

        let ratio = if conservative {
            CHARS_PER_TOKEN_CONSERVATIVE
        } else {
            CHARS_PER_TOKEN
        };
        let tokens = (text.chars().count() as f64 / ratio).ceil() as u32;

        let mut cache = self.estimate_cache.lock().expect("estimate cache poisoned");
        if cache.len() >= ESTIMATE_CACHE_MAX {
            cache.clear();
        }
        cache.insert(key, tokens);
        tokens
    }

    /// Tokens available for context items after reservations and any
    /// already-committed messages.
    #[must_use]
    pub fn available_tokens(&self, additional_messages: &[Message]) -> u32 {
        let committed: u32 = additional_messages
            .iter()
            .map(|m| self.estimate_tokens(&m.content, false))
            .sum();
        self.config
            .max_tokens
            .saturating_sub(self.config.reserved_for_response)
            .saturating_sub(self.config.system_message_tokens)
            .saturating_sub(committed)
    }

    /// Select and pack `items` into the available budget.
    ///
    /// Items are considered in priority order (`Essential` first; ties keep
    /// caller order). `Essential` items are always selected, even when that
    /// overflows the budget.
    #[must_use]
    pub fn build_context(
        &self,
        items: &[ContextItem],
        additional_messages: &[Message],
    ) -> ContextBuildResult {
        let available = self.available_tokens(additional_messages);

        let mut ordered: Vec<&ContextItem> = items.iter().collect();
        ordered.sort_by_key(|item| item.priority.rank());

        let mut selected: Vec<ContextItem> = Vec::new();
        let mut total: u32 = 0;
        let mut truncated = false;
        let mut truncated_count: usize = 0;
        let mut dropped_count: usize = 0;

        for item in ordered {
            let tokens = item
                .tokens
                .unwrap_or_else(|| self.estimate_tokens(&item.content, false));

            if total.saturating_add(tokens) <= available {
                let mut chosen = item.clone();
                chosen.tokens = Some(tokens);
                total += tokens;
                selected.push(chosen);
                continue;
            }

            if item.priority == Priority::Essential {
                // Essential content is never dropped, even past the budget.
                let mut chosen = item.clone();
                chosen.tokens = Some(tokens);
                total = total.saturating_add(tokens);
                selected.push(chosen);
                continue;
            }

            let remaining = available.saturating_sub(total);
            if item.summarizable && remaining > MIN_TRUNCATION_BUDGET {
                let mut chosen = item.clone();
                chosen.content = truncate_to_tokens(&item.content, remaining);
                chosen.tokens = Some(remaining);
                total += remaining;
                selected.push(chosen);
                truncated = true;
                truncated_count += 1;
            } else {
                tracing::debug!(id = %item.id, tokens, remaining, "Dropping context item");
                truncated = true;
                dropped_count += 1;
            }
        }

        let summary = format!(
            "Included {included} of {offered} items ({total} of {available} tokens); \
             {truncated_count} truncated, {dropped_count} dropped",
            included = selected.len(),
            offered = items.len(),
        );

        ContextBuildResult {
            selected_items: selected,
            total_tokens: total,
            truncated,
            summary,
        }
    }

    /// Assemble the final message list: the system prompt, one user message
    /// per selected item, then the user prompt.
    ///
    /// One-message-per-item granularity is load-bearing: downstream prompt
    /// formatting and provider-side caching both key off message boundaries.
    #[must_use]
    pub fn build_messages(
        &self,
        system_prompt: &str,
        items: &[ContextItem],
        user_prompt: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(items.len() + 2);
        messages.push(Message::system(system_prompt));
        for item in items {
            messages.push(Message::user(item.content.clone()));
        }
        messages.push(Message::user(user_prompt));
        messages
    }

    /// Split oversized text into chunks of at most `max_tokens_per_chunk`
    /// estimated tokens, overlapping consecutive chunks by `overlap` tokens.
    ///
    /// Chunk boundaries prefer the last space inside the window; when no
    /// space exists the chunk is cut mid-word so progress is still made.
    #[must_use]
    pub fn chunk_content(
        &self,
        text: &str,
        max_tokens_per_chunk: u32,
        overlap: u32,
    ) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }

        let chars_per_chunk =
            ((f64::from(max_tokens_per_chunk) * CHARS_PER_TOKEN) as usize).max(1);
        let overlap_chars = (f64::from(overlap) * CHARS_PER_TOKEN) as usize;

        let mut chunks = Vec::new();
        let mut start: usize = 0;
        loop {
            let hard_end = (start + chars_per_chunk).min(chars.len());
            let end = if hard_end < chars.len() {
                // Break at the last space in the window when there is one.
                match chars[start..hard_end].iter().rposition(|c| *c == ' ') {
                    Some(offset) if offset > 0 => start + offset,
                    _ => hard_end,
                }
            } else {
                hard_end
            };

            chunks.push(chars[start..end].iter().collect());
            if end >= chars.len() {
                break;
            }

            // Step back for overlap, but always move forward overall.
            let next = end.saturating_sub(overlap_chars);
            start = if next > start { next } else { end };
        }
        chunks
    }

    #[cfg(test)]
    fn estimate_cache_len(&self) -> usize {
        self.estimate_cache.lock().expect("estimate cache poisoned").len()
    }
}

fn estimate_cache_key(text: &str, conservative: bool) -> String {
    let head: String = text.chars().take(100).collect();
    let tail: String = text
        .chars()
        .rev()
        .take(100)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{conservative}:{head}:{tail}:{}", text.chars().count())
}

/// Truncate `text` to roughly `max_tokens`, preferring a word boundary, and
/// append an ellipsis.
#[must_use]
pub fn truncate_to_tokens(text: &str, max_tokens: u32) -> String {
    let budget_chars = (f64::from(max_tokens) * CHARS_PER_TOKEN) as usize;
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget_chars {
        return text.to_string();
    }

    // Leave room for the ellipsis itself.
    let cut = budget_chars.saturating_sub(3).max(1);
    let boundary = chars[..cut]
        .iter()
        .rposition(|c| *c == ' ')
        .filter(|&p| p > 0)
        .unwrap_or(cut);

    let mut truncated: String = chars[..boundary].iter().collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::{ContextConfig, ContextManager, truncate_to_tokens};
    use ballast_types::{ContextItem, Message, Priority};

    fn manager(max_tokens: u32) -> ContextManager {
        ContextManager::new(ContextConfig::for_window(max_tokens))
    }

    /// An item whose token count is fixed so budget math is exact.
    fn item(id: &str, tokens: u32, priority: Priority) -> ContextItem {
        ContextItem::new(id, "x".repeat(tokens as usize * 4), priority).with_tokens(tokens)
    }

    #[test]
    fn estimate_uses_default_and_conservative_ratios() {
        let manager = ContextManager::default();
        let text = "a".repeat(35);

        // 35 / 3.5 = 10, 35 / 3.0 = 11.67 -> 12
        assert_eq!(manager.estimate_tokens(&text, false), 10);
        assert_eq!(manager.estimate_tokens(&text, true), 12);
        assert_eq!(manager.estimate_tokens("", false), 0);
    }

    #[test]
    fn estimate_cache_clears_on_overflow() {
        let manager = ContextManager::default();
        for i in 0..1000 {
            let _ = manager.estimate_tokens(&format!("text number {i}"), false);
        }
        assert_eq!(manager.estimate_cache_len(), 1000);

        // The next distinct estimate clears the full cache first.
        let _ = manager.estimate_tokens("one more", false);
        assert_eq!(manager.estimate_cache_len(), 1);
    }

    #[test]
    fn available_tokens_subtracts_reservations() {
        let manager = manager(10_000);
        // 10000 - 2000 (response) - 500 (system) = 7500
        assert_eq!(manager.available_tokens(&[]), 7500);

        let committed = vec![Message::user("y".repeat(350))]; // 100 tokens
        assert_eq!(manager.available_tokens(&committed), 7400);
    }

    #[test]
    fn packs_in_priority_order() {
        let manager = manager(10_000);
        let items = vec![
            item("low", 100, Priority::Low),
            item("essential", 100, Priority::Essential),
            item("medium", 100, Priority::Medium),
            item("high", 100, Priority::High),
        ];

        let result = manager.build_context(&items, &[]);
        let ids: Vec<&str> = result
            .selected_items
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(ids, vec!["essential", "high", "medium", "low"]);
        assert_eq!(result.total_tokens, 400);
        assert!(!result.truncated);
    }

    #[test]
    fn essential_items_survive_overflow() {
        let manager = manager(3000); // available = 500
        let items = vec![
            item("e1", 400, Priority::Essential),
            item("e2", 400, Priority::Essential),
            item("filler", 400, Priority::High),
        ];

        let result = manager.build_context(&items, &[]);
        let ids: Vec<&str> = result
            .selected_items
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert!(ids.contains(&"e1"));
        assert!(ids.contains(&"e2"));
        assert!(result.total_tokens > manager.available_tokens(&[]));
    }

    #[test]
    fn non_essential_overflow_truncates_or_drops() {
        let manager = manager(3000); // available = 500

        // Summarizable item gets truncated into the remaining budget.
        let items = vec![
            item("first", 300, Priority::High),
            item("big", 1000, Priority::Medium).summarizable(),
        ];
        let result = manager.build_context(&items, &[]);
        assert_eq!(result.selected_items.len(), 2);
        assert!(result.truncated);
        assert!(result.total_tokens <= 500);
        assert!(result.selected_items[1].content.ends_with("..."));

        // Non-summarizable overflow is dropped.
        let items = vec![
            item("first", 300, Priority::High),
            item("big", 1000, Priority::Medium),
        ];
        let result = manager.build_context(&items, &[]);
        assert_eq!(result.selected_items.len(), 1);
        assert!(result.truncated);
        assert!(result.total_tokens <= 500);
    }

    #[test]
    fn tiny_remaining_budget_drops_summarizable_items() {
        let manager = manager(3000); // available = 500
        let items = vec![
            item("first", 450, Priority::High),
            // remaining = 50 < 100, so truncation is not worth it
            item("big", 1000, Priority::Medium).summarizable(),
        ];

        let result = manager.build_context(&items, &[]);
        assert_eq!(result.selected_items.len(), 1);
        assert!(result.truncated);
    }

    #[test]
    fn build_messages_one_user_message_per_item() {
        let manager = ContextManager::default();
        let items = vec![
            ContextItem::new("a", "first fragment", Priority::High),
            ContextItem::new("b", "second fragment", Priority::High),
        ];

        let messages = manager.build_messages("system prompt", &items, "do the thing");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system("system prompt"));
        assert_eq!(messages[1], Message::user("first fragment"));
        assert_eq!(messages[2], Message::user("second fragment"));
        assert_eq!(messages[3], Message::user("do the thing"));
    }

    #[test]
    fn chunking_covers_text_with_overlap() {
        let manager = ContextManager::default();
        let words: Vec<String> = (0..200).map(|i| format!("word{i}")).collect();
        let text = words.join(" ");

        // 100 tokens/chunk = 350 chars, 10 token overlap = 35 chars
        let chunks = manager.chunk_content(&text, 100, 10);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 350);
        }
        // Every word appears somewhere.
        let joined = chunks.join(" ");
        for word in &words {
            assert!(joined.contains(word.as_str()), "{word} missing");
        }
    }

    #[test]
    fn chunking_makes_progress_without_spaces() {
        let manager = ContextManager::default();
        let text = "x".repeat(2000);

        // 100 tokens/chunk = 350 chars; overlap larger than the chunk would
        // stall a naive implementation.
        let chunks = manager.chunk_content(&text, 100, 200);
        assert!(!chunks.is_empty());
        let covered: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(covered >= 2000);
    }

    #[test]
    fn chunking_short_text_is_single_chunk() {
        let manager = ContextManager::default();
        assert_eq!(
            manager.chunk_content("short text", 100, 10),
            vec!["short text".to_string()]
        );
        assert!(manager.chunk_content("", 100, 10).is_empty());
    }

    #[test]
    fn chunking_is_utf8_safe() {
        let manager = ContextManager::default();
        let text = "héllo wörld ".repeat(100);
        let chunks = manager.chunk_content(&text, 10, 2);
        // Reassembly must not have lost or mangled any multibyte char.
        assert!(chunks.iter().all(|c| c.is_char_boundary(c.len())));
        assert!(chunks.concat().contains('ö'));
    }

    #[test]
    fn truncate_prefers_word_boundary() {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(10);
        let truncated = truncate_to_tokens(&text, 10); // ~35 chars
        assert!(truncated.ends_with("..."));
        assert!(truncated.chars().count() <= 38);
        // Cut lands after a whole word, not inside one.
        let body = truncated.trim_end_matches("...");
        assert!(text.starts_with(body));
    }

    #[test]
    fn truncate_short_text_is_identity() {
        assert_eq!(truncate_to_tokens("short", 100), "short");
    }
}
