//! Sliding-window admission control and retry with exponential backoff.
//!
//! The limiter keeps a 60-second window of issued requests and their
//! estimated token counts. A request is admitted only when both the request
//! count and the cumulative token sum (window plus candidate) stay under the
//! configured per-minute limits; an unset limit is unbounded.
//!
//! Retry policy: only failures classified as rate limits
//! ([`GenerateError::is_rate_limit`]) are retried, up to `max_retries` times,
//! sleeping for the provider-suggested `retry_after` when present and
//! otherwise for `min(initial * multiplier^attempt, max)` with ±25% uniform
//! jitter. All other errors propagate to the caller unchanged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use ballast_types::{GenerateError, GenerateOptions, GenerateResult, Message};

use crate::provider::Provider;

/// Length of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);

/// How often `wait_for_capacity` re-checks the window.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tokens reserved for the response when the caller did not set `max_tokens`.
const DEFAULT_RESPONSE_TOKENS: u64 = 2000;

/// Rate limit and retry configuration.
///
/// `None` limits are unbounded. Use the named constructors for per-backend
/// presets; `default()` is the unbounded "custom" preset.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
    /// Maximum number of retries (not counting the initial attempt).
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Backoff growth factor per retry.
    pub backoff_multiplier: f64,
    /// Backoff ceiling, applied before jitter.
    pub max_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            tokens_per_minute: None,
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Preset for OpenAI-compatible backends.
    #[must_use]
    pub fn openai() -> Self {
        Self {
            requests_per_minute: Some(60),
            tokens_per_minute: Some(90_000),
            ..Self::default()
        }
    }

    /// Preset for Anthropic backends.
    #[must_use]
    pub fn anthropic() -> Self {
        Self {
            requests_per_minute: Some(50),
            tokens_per_minute: Some(100_000),
            ..Self::default()
        }
    }

    /// Preset for local Ollama backends: no provider-side limits, retries
    /// still apply (a loaded local server can shed requests too).
    #[must_use]
    pub fn ollama() -> Self {
        Self::default()
    }
}

/// One issued request in the sliding window.
#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    at: Instant,
    tokens: u64,
}

/// Current window occupancy, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: usize,
    pub tokens: u64,
}

/// Options for [`RateLimiter::execute_with_retry`].
pub struct RetryOptions {
    /// Token estimate charged against the window per attempt.
    pub estimated_tokens: u64,
    /// Invoked before each retry sleep with the upcoming attempt number
    /// (1-based) and the classified error.
    pub on_retry: Option<Box<dyn Fn(u32, &GenerateError) + Send + Sync>>,
}

impl RetryOptions {
    #[must_use]
    pub fn new(estimated_tokens: u64) -> Self {
        Self {
            estimated_tokens,
            on_retry: None,
        }
    }

    #[must_use]
    pub fn on_retry(mut self, callback: impl Fn(u32, &GenerateError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }
}

/// Sliding-window rate limiter with retry.
///
/// Window state lives behind a `Mutex` that is never held across an `await`,
/// so one limiter can be shared via `Arc` across tasks. Independent limiter
/// instances do not coordinate; keep one per logical provider.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Vec<RequestRecord>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Replace the limit configuration. Window history is kept.
    pub fn update_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }

    /// Whether a request with `estimated_tokens` would be admitted right now.
    #[must_use]
    pub fn can_make_request(&self, estimated_tokens: u64) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock().expect("rate limiter lock poisoned");
        prune(&mut window, now);
        has_capacity(&window, &self.config, estimated_tokens)
    }

    /// Window occupancy after pruning stale records.
    #[must_use]
    pub fn current_usage(&self) -> WindowUsage {
        let now = Instant::now();
        let mut window = self.window.lock().expect("rate limiter lock poisoned");
        prune(&mut window, now);
        WindowUsage {
            requests: window.len(),
            tokens: window.iter().map(|r| r.tokens).sum(),
        }
    }

    /// Poll until the window admits a request with `estimated_tokens`.
    pub async fn wait_for_capacity(&self, estimated_tokens: u64) {
        loop {
            if self.can_make_request(estimated_tokens) {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Charge a request against the window.
    ///
    /// Called optimistically before the request is issued, so concurrent
    /// callers cannot admit past the limit while one is in flight.
    pub fn record_request(&self, tokens: u64) {
        let now = Instant::now();
        let mut window = self.window.lock().expect("rate limiter lock poisoned");
        prune(&mut window, now);
        window.push(RequestRecord { at: now, tokens });
    }

    /// Backoff delay before retry number `attempt` (0-based), with ±25%
    /// uniform jitter.
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_secs_f64()
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff.as_secs_f64());
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * 0.25;
        Duration::from_secs_f64(capped * jitter)
    }

    /// Run `operation` under admission control, retrying rate-limit failures.
    ///
    /// Each attempt waits for window capacity and is charged optimistically.
    /// At most `max_retries + 1` attempts are made; non-rate-limit errors
    /// propagate immediately, and after retries are exhausted the last error
    /// is returned.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        options: RetryOptions,
    ) -> Result<T, GenerateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerateError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.wait_for_capacity(options.estimated_tokens).await;
            self.record_request(options.estimated_tokens);

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_rate_limit() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.calculate_backoff(attempt));
                    attempt += 1;
                    if let Some(callback) = &options.on_retry {
                        callback(attempt, &err);
                    }
                    tracing::debug!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Retrying after rate limit"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Decorate a provider so every `generate` call goes through this
    /// limiter. `is_configured` and `model_for_phase` pass through unchanged.
    #[must_use]
    pub fn wrap<P: Provider>(self: Arc<Self>, provider: P) -> RateLimited<P> {
        RateLimited {
            inner: provider,
            limiter: self,
        }
    }
}

fn prune(window: &mut Vec<RequestRecord>, now: Instant) {
    window.retain(|record| now.duration_since(record.at) < WINDOW);
}

fn has_capacity(window: &[RequestRecord], config: &RateLimitConfig, candidate_tokens: u64) -> bool {
    if let Some(rpm) = config.requests_per_minute
        && window.len() + 1 > rpm as usize
    {
        return false;
    }

    if let Some(tpm) = config.tokens_per_minute {
        let used: u64 = window.iter().map(|r| r.tokens).sum();
        if used + candidate_tokens > tpm {
            return false;
        }
    }

    true
}

/// Estimate the window charge for a request: `ceil(chars / 4)` per message
/// plus the reserved response size.
#[must_use]
pub fn estimate_request_tokens(messages: &[Message], options: &GenerateOptions) -> u64 {
    let input: u64 = messages
        .iter()
        .map(|m| (m.content.chars().count() as u64).div_ceil(4))
        .sum();
    let response = options
        .max_tokens
        .map_or(DEFAULT_RESPONSE_TOKENS, u64::from);
    input + response
}

/// A provider decorated with rate limiting and retry.
///
/// Transparent for everything except `generate`: the wrapped call estimates
/// its token charge, waits for window capacity, and retries rate-limit
/// failures per the limiter's configuration.
#[derive(Debug)]
pub struct RateLimited<P> {
    inner: P,
    limiter: Arc<RateLimiter>,
}

impl<P> RateLimited<P> {
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: Provider> Provider for RateLimited<P> {
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<GenerateResult, GenerateError> {
        let estimated = estimate_request_tokens(messages, options);
        self.limiter
            .execute_with_retry(
                || self.inner.generate(messages, options),
                RetryOptions::new(estimated),
            )
            .await
    }

    fn is_configured(&self) -> bool {
        self.inner.is_configured()
    }

    fn model_for_phase(&self, phase: &str) -> String {
        self.inner.model_for_phase(phase)
    }
}
