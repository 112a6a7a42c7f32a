//! Sandboxed SQL execution for Switchyard.
//!
//! Every operation runs as a single statement inside its own SQLite
//! transaction, bounded by [`SandboxLimits`]. The transaction commits only
//! when the caller asked for it and every limit held; otherwise it rolls
//! back, including when the deadline fires mid-statement (the executor
//! interrupts SQLite) or the calling future is dropped.
//!
//! # Main types
//!
//! - [`SandboxExecutor`] — Owns the connection and runs operations.
//! - [`SandboxOperation`] — Statement text, parameters and [`CommitPolicy`].
//! - [`SandboxResult`] — Columns, rows, [`TransactionOutcome`] and [`ResourceUsage`].
//! - [`AuditTrail`] — Digest-keyed record of every transaction event.

/// Audit trail of sandbox transactions.
pub mod audit;
/// The executor and its request/result types.
pub mod executor;
/// Configured and per-call bounds.
pub mod limits;
/// Lexical screening of statements before they reach SQLite.
pub mod statement;

pub use audit::{AuditAction, AuditEntry, AuditOutcome, AuditTrail, AUDIT_FILE};
pub use executor::{
    ColumnInfo, CommitPolicy, ResourceUsage, SandboxExecutor, SandboxOperation, SandboxResult,
    TableInfo, TransactionOutcome,
};
pub use limits::{SandboxConfig, SandboxLimits};
pub use statement::{screen, statement_digest};
