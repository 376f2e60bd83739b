//! The backend provider contract.
//!
//! Concrete adapters (OpenAI-compatible, Anthropic, Ollama, mocks) live
//! outside this crate; the runtime only consumes this trait. Decorators such
//! as [`RateLimited`](crate::RateLimited) implement it as explicit wrapper
//! types that delegate everything except the method they govern.

use std::future::Future;

use ballast_types::{GenerateError, GenerateOptions, GenerateResult, Message};

/// A chat-completion backend.
pub trait Provider: Send + Sync {
    /// Run one generation call against the backend.
    fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> impl Future<Output = Result<GenerateResult, GenerateError>> + Send;

    /// Whether the adapter has usable credentials/endpoint configuration.
    fn is_configured(&self) -> bool;

    /// The model id this adapter uses for a named pipeline phase.
    fn model_for_phase(&self, phase: &str) -> String;
}
