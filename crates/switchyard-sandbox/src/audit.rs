use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

pub const AUDIT_FILE: &str = "sandbox-audit.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub transaction_id: Uuid,
    pub action: AuditAction,
    /// SHA-256 of the statement text.
    pub statement_digest: String,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Begin,
    Commit,
    Rollback,
    Timeout,
    LimitExceeded,
    Rejected,
    Seed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

enum WriterCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
}

/// Sandbox audit trail: a bounded in-memory ring, optionally mirrored to a
/// JSON-lines file by a background writer task.
pub struct AuditTrail {
    ring: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl AuditTrail {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            writer: None,
        }
    }

    /// Mirror entries to `<dir>/sandbox-audit.jsonl`. Must be called from
    /// within a tokio runtime.
    pub fn with_file(capacity: usize, dir: PathBuf) -> SwitchyardResult<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            SwitchyardError::Config(format!("audit file writer needs a tokio runtime: {e}"))
        })?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(AUDIT_FILE);
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();

        handle.spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open sandbox audit file");
                    return;
                }
            };
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Append(line) => {
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(error = %e, "Failed to append sandbox audit entry");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = file.flush().await;
                        let _ = done.send(());
                    }
                }
            }
        });

        let mut trail = Self::in_memory(capacity);
        trail.writer = Some(tx);
        Ok(trail)
    }

    pub fn record(&self, entry: AuditEntry) {
        info!(
            transaction_id = %entry.transaction_id,
            action = ?entry.action,
            outcome = ?entry.outcome,
            digest = %entry.statement_digest,
            "sandbox audit"
        );
        if let Some(writer) = &self.writer {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    let _ = writer.send(WriterCommand::Append(format!("{line}\n")));
                }
                Err(e) => warn!(error = %e, "Cannot serialize sandbox audit entry"),
            }
        }
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn record_action(
        &self,
        transaction_id: Uuid,
        action: AuditAction,
        statement_digest: &str,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.record(AuditEntry {
            timestamp: Utc::now(),
            transaction_id,
            action,
            statement_digest: statement_digest.to_string(),
            details,
            outcome,
        });
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Wait until every entry recorded so far has reached the audit file.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ring_is_bounded() {
        let trail = AuditTrail::in_memory(2);
        let tx = Uuid::new_v4();
        for action in [AuditAction::Begin, AuditAction::Rollback, AuditAction::Seed] {
            trail.record_action(tx, action, "d", json!({}), AuditOutcome::Success);
        }
        let actions: Vec<_> = trail.entries().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Rollback, AuditAction::Seed]);
    }

    #[test]
    fn test_file_writer_needs_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let err = AuditTrail::with_file(10, dir.path().to_path_buf()).err().unwrap();
        assert!(matches!(err, SwitchyardError::Config(_)));
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::with_file(10, dir.path().join("audit")).unwrap();
        let tx = Uuid::new_v4();
        trail.record_action(tx, AuditAction::Begin, "abc", json!({}), AuditOutcome::Success);
        trail.record_action(
            tx,
            AuditAction::LimitExceeded,
            "abc",
            json!({"limit": "max_rows"}),
            AuditOutcome::Denied,
        );
        trail.flush().await;

        let text = std::fs::read_to_string(dir.path().join("audit").join(AUDIT_FILE)).unwrap();
        let entries: Vec<AuditEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, AuditAction::LimitExceeded);
        assert_eq!(entries[1].outcome, AuditOutcome::Denied);
        assert_eq!(entries[0].transaction_id, tx);
    }
}
