//! Core domain types for Ballast.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the runtime:
//! chat messages and generation options/results, prioritized context items,
//! model pricing tables, and the provider error taxonomy.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod context_item;
mod error;
mod message;
mod pricing;

pub use context_item::{ContextItem, Priority};
pub use error::GenerateError;
pub use message::{GenerateOptions, GenerateResult, Message, Role};
pub use pricing::{
    BudgetConfig, ModelPricing, PricingSource, ResolvedPricing, resolve_pricing,
};
