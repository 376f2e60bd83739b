//! Token and cost accounting per model and per session.
//!
//! Exactly one session is current at a time; `end_session` archives it into
//! history and opens a fresh one. Budget evaluation is observational only: a
//! crossed threshold logs a warning and never blocks a call.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ballast_types::{BudgetConfig, GenerateResult, ModelPricing, resolve_pricing};

/// Accumulated usage for one model within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl ModelUsage {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            estimated_cost: 0.0,
        }
    }
}

/// Accumulated usage for one session.
///
/// `total_cost` is always the sum of the per-model `estimated_cost` values;
/// both are updated in the same lock scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<DateTime<Utc>>,
    pub models: HashMap<String, ModelUsage>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_calls: u64,
}

impl SessionUsage {
    fn start_new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            models: HashMap::new(),
            total_cost: 0.0,
            total_tokens: 0,
            total_calls: 0,
        }
    }
}

/// Budget position of the current session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetStatus {
    /// No session budget configured.
    Unlimited { spent: f64 },
    /// Under the warn threshold.
    Within { spent: f64, limit: f64, percent: f64 },
    /// At or past the warn threshold but under the limit.
    Warning { spent: f64, limit: f64, percent: f64 },
    /// At or past the limit.
    Exceeded { spent: f64, limit: f64, percent: f64 },
}

/// Structured per-session report.
#[derive(Debug, Clone)]
pub struct CostReport {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    /// Per-model usage, most expensive first.
    pub models: Vec<ModelUsage>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_calls: u64,
    pub budget: BudgetStatus,
}

/// Serialized tracker state for persistence; storage medium is the caller's
/// choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostExport {
    pub current_session: SessionUsage,
    pub session_history: Vec<SessionUsage>,
}

#[derive(Debug)]
struct TrackerState {
    budget: BudgetConfig,
    pricing_overrides: Vec<(String, ModelPricing)>,
    current: SessionUsage,
    history: Vec<SessionUsage>,
}

/// Accounts tokens and cost per model and per session.
///
/// State lives behind a `Mutex` never held across an `await`; one tracker
/// can be shared via `Arc`. Independent trackers do not coordinate; keep one
/// per logical session.
#[derive(Debug)]
pub struct CostTracker {
    state: Mutex<TrackerState>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

impl CostTracker {
    #[must_use]
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                budget,
                pricing_overrides: Vec::new(),
                current: SessionUsage::start_new(),
                history: Vec::new(),
            }),
        }
    }

    /// Record one generation result against the current session.
    ///
    /// Evaluates the session budget afterwards and logs a warning at the
    /// warn threshold and at or past 100%; neither blocks anything.
    pub fn track_usage(&self, result: &GenerateResult) {
        let prompt = result.prompt_tokens.unwrap_or(0);
        let completion = result.completion_tokens.unwrap_or(0);
        let total = result.total_tokens();

        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        let cost = resolve_pricing(&result.model, &state.pricing_overrides)
            .pricing
            .cost(prompt, completion);

        let bucket = state
            .current
            .models
            .entry(result.model.clone())
            .or_insert_with(|| ModelUsage::new(&result.model));
        bucket.calls += 1;
        bucket.prompt_tokens += prompt;
        bucket.completion_tokens += completion;
        bucket.total_tokens += total;
        bucket.estimated_cost += cost;

        state.current.total_calls += 1;
        state.current.total_tokens += total;
        state.current.total_cost += cost;

        match budget_status(&state.budget, state.current.total_cost) {
            BudgetStatus::Exceeded { spent, limit, percent } => {
                tracing::warn!(
                    session = %state.current.session_id,
                    spent,
                    limit,
                    percent,
                    "Session budget exceeded"
                );
            }
            BudgetStatus::Warning { spent, limit, percent } => {
                tracing::warn!(
                    session = %state.current.session_id,
                    spent,
                    limit,
                    percent,
                    "Approaching session budget"
                );
            }
            BudgetStatus::Unlimited { .. } | BudgetStatus::Within { .. } => {}
        }
    }

    /// Cost in USD for a hypothetical call, using the tracker's pricing
    /// (overrides first, then the built-in table, then the fallback rate).
    #[must_use]
    pub fn calculate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let state = self.state.lock().expect("cost tracker lock poisoned");
        resolve_pricing(model, &state.pricing_overrides)
            .pricing
            .cost(prompt_tokens, completion_tokens)
    }

    /// Install a per-tracker pricing override for `model` (prefix-matched,
    /// consulted before the built-in table).
    pub fn update_pricing(&self, model: impl Into<String>, pricing: ModelPricing) {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        let model = model.into();
        if let Some(existing) = state
            .pricing_overrides
            .iter_mut()
            .find(|(name, _)| *name == model)
        {
            existing.1 = pricing;
        } else {
            state.pricing_overrides.push((model, pricing));
        }
    }

    /// Replace the budget configuration.
    pub fn set_budget(&self, budget: BudgetConfig) {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        state.budget = budget;
    }

    /// Budget position of the current session.
    #[must_use]
    pub fn budget_status(&self) -> BudgetStatus {
        let state = self.state.lock().expect("cost tracker lock poisoned");
        budget_status(&state.budget, state.current.total_cost)
    }

    /// Structured report for the current session.
    #[must_use]
    pub fn report(&self) -> CostReport {
        let state = self.state.lock().expect("cost tracker lock poisoned");
        let mut models: Vec<ModelUsage> = state.current.models.values().cloned().collect();
        models.sort_by(|a, b| {
            b.estimated_cost
                .partial_cmp(&a.estimated_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        CostReport {
            session_id: state.current.session_id.clone(),
            start_time: state.current.start_time,
            models,
            total_cost: state.current.total_cost,
            total_tokens: state.current.total_tokens,
            total_calls: state.current.total_calls,
            budget: budget_status(&state.budget, state.current.total_cost),
        }
    }

    /// One-line summary of the current session, for log/UI surfaces.
    #[must_use]
    pub fn summary(&self) -> String {
        let state = self.state.lock().expect("cost tracker lock poisoned");
        let budget = match state.budget.max_cost_per_session {
            Some(limit) => format!(" (budget ${limit:.2})"),
            None => String::new(),
        };
        format!(
            "{calls} calls, {tokens} tokens across {models} models, ${cost:.4}{budget}",
            calls = state.current.total_calls,
            tokens = state.current.total_tokens,
            models = state.current.models.len(),
            cost = state.current.total_cost,
        )
    }

    /// Archive the current session into history and open a fresh one.
    /// Returns the archived session.
    pub fn end_session(&self) -> SessionUsage {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        let mut ended = std::mem::replace(&mut state.current, SessionUsage::start_new());
        ended.end_time = Some(Utc::now());
        state.history.push(ended.clone());
        ended
    }

    /// Discard the current session without archiving it.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        state.current = SessionUsage::start_new();
    }

    /// Snapshot current session and history for persistence.
    #[must_use]
    pub fn export(&self) -> CostExport {
        let state = self.state.lock().expect("cost tracker lock poisoned");
        CostExport {
            current_session: state.current.clone(),
            session_history: state.history.clone(),
        }
    }

    /// Restore tracker state from a previous [`export`](Self::export).
    /// Budget and pricing overrides are configuration, not state, and are
    /// kept as-is.
    pub fn import(&self, export: CostExport) {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        state.current = export.current_session;
        state.history = export.session_history;
    }
}

fn budget_status(budget: &BudgetConfig, spent: f64) -> BudgetStatus {
    let Some(limit) = budget.max_cost_per_session else {
        return BudgetStatus::Unlimited { spent };
    };

    let percent = if limit > 0.0 {
        spent / limit * 100.0
    } else {
        100.0
    };

    if percent >= 100.0 {
        BudgetStatus::Exceeded { spent, limit, percent }
    } else if percent >= budget.warn_threshold {
        BudgetStatus::Warning { spent, limit, percent }
    } else {
        BudgetStatus::Within { spent, limit, percent }
    }
}
