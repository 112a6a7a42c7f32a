use crate::audit::{AuditAction, AuditEntry, AuditOutcome, AuditTrail};
use crate::limits::{SandboxConfig, SandboxLimits};
use crate::statement::{screen, statement_digest};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{ErrorClass, SwitchyardError, SwitchyardResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a successful operation keeps its effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    Commit,
    #[default]
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOperation {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub commit: CommitPolicy,
}

impl SandboxOperation {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            commit: CommitPolicy::Rollback,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn committing(mut self) -> Self {
        self.commit = CommitPolicy::Commit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub rows_returned: u64,
    pub rows_affected: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub transaction_id: Uuid,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub outcome: TransactionOutcome,
    pub usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

struct Executed {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    rows_affected: u64,
    bytes: u64,
    committed: bool,
}

/// Interrupts the running statement unless disarmed. Dropping a `run` future
/// mid-statement therefore stops the blocking worker, whose transaction
/// rolls back when it unwinds.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.interrupt();
        }
    }
}

/// Executes single SQL statements against SQLite inside a transaction that
/// is rolled back unless a commit was requested and every limit held.
///
/// The connection is held exclusively for the whole transaction, so
/// operations on one executor are serialized.
pub struct SandboxExecutor {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    limits: SandboxLimits,
    audit: AuditTrail,
}

impl SandboxExecutor {
    /// Open the configured database. With `audit_dir` set this must be
    /// called inside a tokio runtime.
    pub fn open(config: &SandboxConfig) -> SwitchyardResult<Self> {
        config.validate()?;
        let conn = match &config.database {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|e| SwitchyardError::Sandbox(format!("cannot open database: {e}")))?;
        let audit = match &config.audit_dir {
            Some(dir) => AuditTrail::with_file(config.audit_capacity, dir.clone())?,
            None => AuditTrail::in_memory(config.audit_capacity),
        };
        info!(
            database = ?config.database,
            max_duration_ms = config.limits.max_duration_ms,
            max_rows = config.limits.max_rows,
            "Sandbox executor opened"
        );
        Ok(Self::from_parts(conn, config.limits, audit))
    }

    /// Private in-memory database with default limits.
    pub fn in_memory() -> SwitchyardResult<Self> {
        Self::open(&SandboxConfig::default())
    }

    fn from_parts(conn: Connection, limits: SandboxLimits, audit: AuditTrail) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            limits,
            audit,
        }
    }

    /// Configured limits; per-call limits can only narrow these.
    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Run one operation. `requested` limits are tightened against the
    /// configured ones. Errors are returned only after the transaction has
    /// been rolled back.
    pub async fn run(
        &self,
        operation: SandboxOperation,
        requested: Option<&SandboxLimits>,
    ) -> SwitchyardResult<SandboxResult> {
        let limits = match requested {
            Some(r) => self.limits.tightened_by(r),
            None => self.limits,
        };
        let transaction_id = Uuid::new_v4();
        let digest = statement_digest(&operation.sql);

        if let Err(e) = screen(&operation.sql) {
            self.audit.record_action(
                transaction_id,
                AuditAction::Rejected,
                &digest,
                json!({"error": e.to_string()}),
                AuditOutcome::Denied,
            );
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(limits.max_duration_ms);
        let conn = match tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            Arc::clone(&self.conn).lock_owned(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                let err = SwitchyardError::Timeout(format!(
                    "sandbox connection busy for {}ms",
                    limits.max_duration_ms
                ));
                self.record_failure(transaction_id, &digest, &err, started);
                return Err(err);
            }
        };

        self.audit.record_action(
            transaction_id,
            AuditAction::Begin,
            &digest,
            json!({
                "commit": operation.commit,
                "params": operation.params.len(),
                "limits": limits,
            }),
            AuditOutcome::Success,
        );

        let params: Vec<SqlValue> = operation.params.iter().map(json_to_sql).collect();
        let sql = operation.sql;
        let commit = operation.commit;
        let mut guard = InterruptOnDrop {
            handle: Arc::clone(&self.interrupt),
            armed: true,
        };
        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            run_in_transaction(&mut conn, &sql, params, commit, &limits, deadline)
        });

        let joined = tokio::select! {
            res = &mut task => res,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                debug!(transaction_id = %transaction_id, "Sandbox deadline reached, interrupting");
                self.interrupt.interrupt();
                task.await
            }
        };
        guard.armed = false;

        let executed = joined
            .map_err(|e| SwitchyardError::Fatal(format!("sandbox worker failed: {e}")))
            .and_then(|result| result);
        let executed = match executed {
            Ok(executed) => executed,
            Err(err) => {
                self.record_failure(transaction_id, &digest, &err, started);
                return Err(err);
            }
        };

        let usage = ResourceUsage {
            duration_ms: elapsed_ms(started),
            rows_returned: executed.rows.len() as u64,
            rows_affected: executed.rows_affected,
            bytes: executed.bytes,
        };
        let (action, outcome) = if executed.committed {
            (AuditAction::Commit, TransactionOutcome::Committed)
        } else {
            (AuditAction::Rollback, TransactionOutcome::RolledBack)
        };
        self.audit.record_action(
            transaction_id,
            action,
            &digest,
            json!({ "usage": usage }),
            AuditOutcome::Success,
        );

        Ok(SandboxResult {
            transaction_id,
            columns: executed.columns,
            rows: executed.rows,
            rows_affected: executed.rows_affected,
            outcome,
            usage,
        })
    }

    /// Check that `sql` is an acceptable single statement and that SQLite can
    /// prepare it against the current schema. Nothing is executed.
    pub async fn validate(&self, sql: &str) -> SwitchyardResult<()> {
        screen(sql)?;
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let tx = conn.transaction().map_err(sandbox_error)?;
            let prepared = tx.prepare(&sql).map(|_| ()).map_err(|e| {
                SwitchyardError::Validation(format!("statement does not prepare: {e}"))
            });
            roll_back(tx);
            prepared
        })
        .await
        .map_err(|e| SwitchyardError::Fatal(format!("sandbox worker failed: {e}")))?
    }

    /// Apply an administrative batch (schema, fixtures) outside the sandbox
    /// rules. Audited as `seed`.
    pub async fn seed(&self, sql: &str) -> SwitchyardResult<()> {
        let transaction_id = Uuid::new_v4();
        let digest = statement_digest(sql);
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let batch = sql.to_string();
        let result = tokio::task::spawn_blocking(move || conn.execute_batch(&batch))
            .await
            .map_err(|e| SwitchyardError::Fatal(format!("sandbox worker failed: {e}")))?
            .map_err(sandbox_error);
        let (outcome, details) = match &result {
            Ok(()) => (AuditOutcome::Success, json!({})),
            Err(e) => (AuditOutcome::Error, json!({"error": e.to_string()})),
        };
        self.audit
            .record_action(transaction_id, AuditAction::Seed, &digest, details, outcome);
        result
    }

    /// User tables with their columns, ordered by table name.
    pub async fn schema(&self) -> SwitchyardResult<Vec<TableInfo>> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || read_schema(&conn))
            .await
            .map_err(|e| SwitchyardError::Fatal(format!("sandbox worker failed: {e}")))?
    }

    /// Oldest first, bounded by `audit_capacity`.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }

    /// Wait for the audit file writer to catch up.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    fn record_failure(
        &self,
        transaction_id: Uuid,
        digest: &str,
        err: &SwitchyardError,
        started: Instant,
    ) {
        let action = match err.class() {
            ErrorClass::Timeout => AuditAction::Timeout,
            ErrorClass::ResourceLimit => AuditAction::LimitExceeded,
            _ if matches!(err, SwitchyardError::Validation(_)) => AuditAction::Rejected,
            _ => AuditAction::Rollback,
        };
        let outcome = match action {
            AuditAction::Rollback => AuditOutcome::Error,
            _ => AuditOutcome::Denied,
        };
        warn!(transaction_id = %transaction_id, error = %err, "Sandbox operation rolled back");
        self.audit.record_action(
            transaction_id,
            action,
            digest,
            json!({
                "error": err.to_string(),
                "outcome": TransactionOutcome::from_error(err),
                "duration_ms": elapsed_ms(started),
            }),
            outcome,
        );
    }
}

impl TransactionOutcome {
    fn from_error(err: &SwitchyardError) -> Self {
        if err.class() == ErrorClass::Timeout {
            TransactionOutcome::TimedOut
        } else {
            TransactionOutcome::RolledBack
        }
    }
}

fn run_in_transaction(
    conn: &mut Connection,
    sql: &str,
    params: Vec<SqlValue>,
    commit: CommitPolicy,
    limits: &SandboxLimits,
    deadline: Instant,
) -> SwitchyardResult<Executed> {
    let tx = conn
        .transaction()
        .map_err(|e| map_sql_error(e, deadline))?;
    let mut executed = match execute_statement(&tx, sql, &params, limits, deadline) {
        Ok(executed) => executed,
        Err(e) => {
            roll_back(tx);
            return Err(e);
        }
    };
    if Instant::now() >= deadline {
        roll_back(tx);
        return Err(deadline_error(limits));
    }
    match commit {
        CommitPolicy::Commit => {
            tx.commit().map_err(|e| map_sql_error(e, deadline))?;
            executed.committed = true;
        }
        CommitPolicy::Rollback => roll_back(tx),
    }
    Ok(executed)
}

fn execute_statement(
    tx: &Transaction<'_>,
    sql: &str,
    params: &[SqlValue],
    limits: &SandboxLimits,
    deadline: Instant,
) -> SwitchyardResult<Executed> {
    let mut stmt = tx
        .prepare(sql)
        .map_err(|e| match map_sql_error(e, deadline) {
            SwitchyardError::Sandbox(msg) => SwitchyardError::Validation(msg),
            other => other,
        })?;

    if stmt.column_count() == 0 {
        let affected = stmt
            .execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| map_sql_error(e, deadline))? as u64;
        if affected > limits.max_rows {
            return Err(SwitchyardError::ResourceLimit(format!(
                "statement affected {affected} rows, limit is {}",
                limits.max_rows
            )));
        }
        return Ok(Executed {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: affected,
            bytes: 0,
            committed: false,
        });
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let readonly = stmt.readonly();
    let width = columns.len();
    let mut rows_out = Vec::new();
    let mut bytes = 0u64;
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(|e| map_sql_error(e, deadline))?;

    while let Some(row) = rows.next().map_err(|e| map_sql_error(e, deadline))? {
        if Instant::now() >= deadline {
            return Err(deadline_error(limits));
        }
        if rows_out.len() as u64 >= limits.max_rows {
            return Err(SwitchyardError::ResourceLimit(format!(
                "result exceeds {} rows",
                limits.max_rows
            )));
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            let cell = row.get_ref(i).map_err(sandbox_error)?;
            bytes += cell_bytes(&cell);
            values.push(sql_to_json(cell));
        }
        if bytes > limits.max_bytes {
            return Err(SwitchyardError::ResourceLimit(format!(
                "result exceeds {} bytes",
                limits.max_bytes
            )));
        }
        rows_out.push(values);
    }

    // RETURNING clauses yield one row per changed row.
    let rows_affected = if readonly { 0 } else { rows_out.len() as u64 };
    Ok(Executed {
        columns,
        rows: rows_out,
        rows_affected,
        bytes,
        committed: false,
    })
}

fn read_schema(conn: &Connection) -> SwitchyardResult<Vec<TableInfo>> {
    let mut tables_stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(sandbox_error)?;
    let names = tables_stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(sandbox_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sandbox_error)?;

    let mut columns_stmt = conn
        .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(sandbox_error)?;
    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let columns = columns_stmt
            .query_map([&name], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    primary_key: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(sandbox_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sandbox_error)?;
        tables.push(TableInfo { name, columns });
    }
    Ok(tables)
}

fn roll_back(tx: Transaction<'_>) {
    // An interrupted write may already have been rolled back by SQLite.
    if let Err(e) = tx.rollback() {
        debug!(error = %e, "Rollback reported an error");
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::OperationInterrupted
    )
}

fn map_sql_error(err: rusqlite::Error, deadline: Instant) -> SwitchyardError {
    if is_interrupt(&err) || Instant::now() >= deadline {
        SwitchyardError::Timeout(format!("sandbox operation interrupted: {err}"))
    } else {
        sandbox_error(err)
    }
}

fn sandbox_error(err: rusqlite::Error) -> SwitchyardError {
    SwitchyardError::Sandbox(err.to_string())
}

fn deadline_error(limits: &SandboxLimits) -> SwitchyardError {
    SwitchyardError::Timeout(format!(
        "sandbox operation exceeded {}ms",
        limits.max_duration_ms
    ))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn cell_bytes(value: &ValueRef<'_>) -> u64 {
    match value {
        ValueRef::Null => 0,
        ValueRef::Integer(_) | ValueRef::Real(_) => 8,
        ValueRef::Text(t) => t.len() as u64,
        ValueRef::Blob(b) => b.len() as u64,
    }
}
