//! Core types and error definitions for the Switchyard orchestrator.
//!
//! This crate provides the foundational types shared across all Switchyard
//! crates: the error taxonomy, the bus [`Message`], the closed
//! [`Capability`] set, and the [`RetryPolicy`] used by workflows and agent
//! restarts.
//!
//! # Main types
//!
//! - [`SwitchyardError`] — Unified error enum for all subsystems.
//! - [`SwitchyardResult`] — Convenience alias for `Result<T, SwitchyardError>`.
//! - [`ErrorClass`] — Routing / handler / timeout / resource-limit / fatal classification.
//! - [`Message`] — Immutable unit of inter-agent communication.
//! - [`MessageKind`] — Request, response, error, status, context update, ...
//! - [`Capability`] — A named skill an agent can perform.
//! - [`RetryPolicy`] — Attempt budget with capped exponential backoff.

/// Closed capability set.
pub mod capability;
/// Error taxonomy.
pub mod error;
/// Bus message types.
pub mod message;
/// Retry and backoff policy.
pub mod retry;

pub use capability::Capability;
pub use error::{ErrorClass, SwitchyardError, SwitchyardResult};
pub use message::{Message, MessageKind};
pub use retry::RetryPolicy;
