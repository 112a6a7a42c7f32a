//! Priority publish/subscribe message bus for inter-agent communication.
//!
//! Producers publish immutable [`Message`](switchyard_core::Message)s to
//! topics; a single dispatch loop delivers them by priority (highest first)
//! and arrival order, invoking every subscribed handler concurrently.
//! Undeliverable messages are kept in a bounded dead-letter log.
//!
//! # Main types
//!
//! - [`MessageBus`] — The bus itself: publish, subscribe, metrics, health.
//! - [`MessageHandler`] — Subscriber callback trait; [`handler_fn`] adapts closures.
//! - [`SubscriptionFilter`] — Per-subscription kind and priority criteria.
//! - [`BusConfig`] — Capacity, dead-letter, size and timeout limits, snapshot directory.
//! - [`DeadLetter`] — An undeliverable message with its [`DeadLetterReason`].

/// Bus implementation and dispatch loop.
pub mod bus;
/// Bus configuration.
pub mod config;
/// Dead-letter records.
pub mod dead_letter;
/// Subscriber trait and closure adapter.
pub mod handler;
mod queue;

pub use bus::{
    BusHealth, BusMetrics, MessageBus, SubscriptionFilter, SubscriptionId, SubscriptionStats,
    SNAPSHOT_FILE,
};
pub use config::BusConfig;
pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use handler::{handler_fn, FnHandler, MessageHandler};
