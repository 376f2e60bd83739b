//! Resilience and resource governance for LLM-backed pipelines.
//!
//! Every call to an LLM backend is expensive, rate limited, and can fail
//! transiently. This crate is the layer between an automation pipeline and
//! the provider adapters that makes those calls survivable and accountable:
//!
//! - [`RateLimiter`] - sliding-window admission control plus retry with
//!   backoff; wraps any [`Provider`] transparently via [`RateLimited`]
//! - [`ResponseCache`] - content-addressed, TTL-based cache of provider
//!   results, keyed by a canonical hash of the request
//! - [`ContextManager`] - packs prioritized text fragments into a model's
//!   token budget via greedy selection, truncation, and chunking
//! - [`CheckpointManager`] - persists per-phase progress of a multi-step
//!   pipeline and resumes it after a crash
//! - [`CostTracker`] - accounts tokens and cost per model and per session,
//!   raising (observational) budget warnings
//!
//! # Architecture
//!
//! ```text
//! caller
//! ├── ContextManager::build_context  (pack items into the token budget)
//! ├── ResponseCache::get             (skip the call on a hit)
//! ├── RateLimited<P>::generate       (admission control + retry)
//! ├── ResponseCache::set / CostTracker::track_usage
//! └── CheckpointManager::execute     (drive multi-phase pipelines)
//! ```
//!
//! # Concurrency
//!
//! Components hold their mutable state behind `std::sync::Mutex`, never held
//! across an `await`, so shared `Arc` instances are sound on a multithreaded
//! scheduler. Instances do not coordinate with each other: keep exactly one
//! `RateLimiter`/`CostTracker` per logical provider/session or windows and
//! totals will double-count.

mod cache;
mod checkpoint;
mod context;
mod cost;
mod provider;
mod rate_limit;

pub use cache::{
    CacheConfig, CacheEntry, CacheExport, CacheStats, ExportedStats, ResponseCache, cache_key,
};
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointManager, PipelinePhase,
};
pub use context::{ContextBuildResult, ContextConfig, ContextManager, truncate_to_tokens};
pub use cost::{BudgetStatus, CostExport, CostReport, CostTracker, ModelUsage, SessionUsage};
pub use provider::Provider;
pub use rate_limit::{
    RateLimitConfig, RateLimited, RateLimiter, RetryOptions, WindowUsage,
    estimate_request_tokens,
};

pub use ballast_types as types;
