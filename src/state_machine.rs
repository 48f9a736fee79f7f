//! SQLite replicated state machine.
//!
//! Committed log entries are executed against one SQLite file per group.
//! Each entry runs in its own transaction together with its audit rows and
//! the record of its command ID, so a redelivered entry is recognized even
//! after a restart. Every statement runs alone inside a savepoint: a failing
//! statement is rolled back and recorded without disturbing the others.
//! Payloads cannot end the entry's transaction or touch the bookkeeping
//! tables, so no payload can stop the group.
//!
//! Reads go through a pool of read-only connections.
//!
//! Snapshots are the raw SQLite file wrapped in a [`SnapshotPayload`].

use crate::command::{Command, RawCommand};
use crate::errors::StoreError;
use crate::rpc::proto::SnapshotPayload;
use bytes::Bytes;
use derivative::Derivative;
use log::{debug, error, info, warn};
use prost::Message;
use sqlite::{Connection, OpenFlags, State};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "snapshot.bin";
const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";
const BUSY_TIMEOUT_MS: usize = 5000;
const INTERNAL_PREFIX: &str = "_shard_";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _shard_audit (
    log_index INTEGER NOT NULL,
    command_id INTEGER NOT NULL,
    sql TEXT NOT NULL,
    error TEXT
);
CREATE TABLE IF NOT EXISTS _shard_applied (
    command_id INTEGER PRIMARY KEY,
    log_index INTEGER NOT NULL
);";

/// Query row.
#[derive(Debug)]
pub struct QueryRow {
    /// Column values of the row.
    pub values: Vec<String>,
}

impl QueryRow {
    fn new() -> Self {
        QueryRow { values: Vec::new() }
    }
}

/// Query results.
#[derive(Debug)]
pub struct QueryResults {
    /// Query result rows.
    pub rows: Vec<QueryRow>,
}

/// One statement executed by the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedCommand {
    /// Position in the audit trail; increases with every record.
    pub seq: u64,
    /// Log index of the entry that carried the statement.
    pub index: usize,
    /// ID of the submitted command.
    pub command_id: u64,
    /// The statement, or the raw payload if it could not be decoded.
    pub sql: String,
    /// Why the statement failed, if it did.
    pub error: Option<String>,
}

/// Outcome of applying one log entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Log index of the entry.
    pub index: usize,
    /// True if the entry had already been applied and was skipped.
    pub duplicate: bool,
    /// Errors of the statements that failed, in execution order.
    pub errors: Vec<String>,
}

impl ApplyReport {
    fn duplicate(index: usize) -> Self {
        Self {
            index,
            duplicate: true,
            errors: Vec::new(),
        }
    }
}

/// The replicated state machine of one group.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SqlStateMachine {
    group: String,
    db_path: PathBuf,
    snapshot_dir: PathBuf,
    #[derivative(Debug = "ignore")]
    writer: Option<Connection>,
    #[derivative(Debug = "ignore")]
    conn_pool: Vec<Arc<Mutex<Connection>>>,
    conn_pool_size: usize,
    conn_idx: usize,
    applied_index: usize,
    failure: Option<String>,
}

impl SqlStateMachine {
    /// Opens the state machine of `group` stored under `dir`.
    ///
    /// If the database file is missing but a snapshot was persisted, the
    /// database is restored from the snapshot first.
    pub fn open(group: &str, dir: &Path, conn_pool_size: usize) -> Result<Self, StoreError> {
        let snapshot_dir = dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)?;
        let mut fsm = SqlStateMachine {
            group: group.to_string(),
            db_path: dir.join(format!("{}.db", group)),
            snapshot_dir,
            writer: None,
            conn_pool: Vec::new(),
            conn_pool_size: conn_pool_size.max(1),
            conn_idx: 0,
            applied_index: 0,
            failure: None,
        };
        if !fsm.db_path.exists() {
            if let Some(payload) = fsm.load_snapshot()? {
                info!(
                    "[{}] database missing, restoring persisted snapshot taken at index {}",
                    group, payload.applied_index
                );
                fsm.install_database(&payload.database)?;
            }
        }
        fsm.reopen()?;
        Ok(fsm)
    }

    /// Index of the last entry applied during this engine lifetime.
    pub fn applied_index(&self) -> usize {
        self.applied_index
    }

    /// Every statement executed so far, in execution order.
    pub fn applied_commands(&self) -> Result<Vec<AppliedCommand>, StoreError> {
        self.applied_commands_since(0, usize::MAX)
    }

    /// At most `limit` audit records following the one at position `after`.
    ///
    /// Pass the `seq` of the last record seen to page through the trail.
    pub fn applied_commands_since(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AppliedCommand>, StoreError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| StoreError::GroupStopped(self.group.clone()))?;
        load_audit(writer, after, limit)
    }

    /// The storage failure that stopped this state machine, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Applies the entry at `index`.
    ///
    /// Statement failures are recorded in the report and audit trail; they
    /// never fail the entry. Entries at or below the applied index, and
    /// commands already recorded as applied, are skipped.
    pub fn apply(&mut self, index: usize, command_id: u64, command: &RawCommand) -> ApplyReport {
        if index <= self.applied_index {
            debug!(
                "[{}] skipping redelivered index {} (applied {})",
                self.group, index, self.applied_index
            );
            return ApplyReport::duplicate(index);
        }
        if let Some(failure) = &self.failure {
            return ApplyReport {
                index,
                duplicate: false,
                errors: vec![failure.clone()],
            };
        }
        match self.apply_entry(index, command_id, command) {
            Ok(report) => {
                self.applied_index = index;
                report
            }
            Err(e) => {
                error!("[{}] failed to apply index {}: {}", self.group, index, e);
                self.failure = Some(e.to_string());
                ApplyReport {
                    index,
                    duplicate: false,
                    errors: vec![e.to_string()],
                }
            }
        }
    }

    /// Advances the applied index over an engine no-op.
    pub fn apply_noop(&mut self, index: usize) {
        if index > self.applied_index {
            self.applied_index = index;
        }
    }

    fn apply_entry(
        &mut self,
        index: usize,
        command_id: u64,
        command: &RawCommand,
    ) -> Result<ApplyReport, StoreError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| StoreError::GroupStopped(self.group.clone()))?;
        if is_applied(writer, command_id)? {
            debug!(
                "[{}] command {} at index {} was applied before, skipping",
                self.group, command_id, index
            );
            return Ok(ApplyReport::duplicate(index));
        }
        let plan = plan_statements(&self.group, command);
        let applied = match execute_entry(writer, index, command_id, &plan) {
            Ok(applied) => applied,
            Err(e) => {
                // Record the entry without running it; failing again means
                // the storage itself is broken.
                let _ = writer.execute("ROLLBACK");
                warn!("[{}] entry at index {} rolled back: {}", self.group, index, e);
                let reason = format!("entry rolled back: {}", e);
                let plan = plan
                    .into_iter()
                    .map(|(sql, _)| (sql, Some(reason.clone())))
                    .collect::<Vec<_>>();
                execute_entry(writer, index, command_id, &plan).map_err(|e| {
                    let _ = writer.execute("ROLLBACK");
                    e
                })?
            }
        };
        let errors = applied
            .into_iter()
            .filter_map(|record| record.error)
            .collect::<Vec<_>>();
        for error in &errors {
            warn!("[{}] statement at index {} failed: {}", self.group, index, error);
        }
        Ok(ApplyReport {
            index,
            duplicate: false,
            errors,
        })
    }

    /// Captures the database file as a snapshot and persists it locally.
    pub fn snapshot(&mut self, engine_index: usize, engine_term: usize) -> Result<Bytes, StoreError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| StoreError::GroupStopped(self.group.clone()))?;
        // Fold any write-ahead log back into the main file.
        writer.iterate("PRAGMA wal_checkpoint(TRUNCATE)", |_| true)?;
        let database = fs::read(&self.db_path)?;
        let payload = SnapshotPayload {
            format_version: SNAPSHOT_FORMAT_VERSION,
            engine_index: engine_index as u64,
            engine_term: engine_term as u64,
            applied_index: self.applied_index as u64,
            database,
        };
        let mut buf = Vec::with_capacity(payload.encoded_len());
        payload
            .encode(&mut buf)
            .map_err(|e| StoreError::StorageError(e.to_string()))?;
        self.persist_snapshot(&buf)?;
        info!(
            "[{}] snapshot taken at index {} ({} bytes)",
            self.group,
            self.applied_index,
            buf.len()
        );
        Ok(Bytes::from(buf))
    }

    /// Replaces the database with the one in `data`.
    ///
    /// Afterwards the state machine behaves as if it had applied every entry
    /// up to the snapshot's applied index.
    pub fn restore(&mut self, data: &[u8]) -> Result<SnapshotPayload, StoreError> {
        let payload = decode_snapshot(data)?;
        self.close();
        self.install_database(&payload.database)?;
        self.reopen()
            .map_err(|e| StoreError::RestoreError(format!("cannot open restored database: {}", e)))?;
        self.applied_index = payload.applied_index as usize;
        self.persist_snapshot(data)?;
        info!(
            "[{}] restored snapshot at index {}",
            self.group, payload.applied_index
        );
        Ok(payload)
    }

    /// Returns the next read connection from the pool.
    pub fn get_connection(&mut self) -> Option<Arc<Mutex<Connection>>> {
        if self.conn_pool.is_empty() {
            return None;
        }
        let idx = self.conn_idx % self.conn_pool.len();
        self.conn_idx += 1;
        Some(self.conn_pool[idx].clone())
    }

    /// Runs a read against the locally applied state.
    pub fn query(&mut self, sql: &str) -> Result<QueryResults, StoreError> {
        let conn = self
            .get_connection()
            .ok_or_else(|| StoreError::GroupStopped(self.group.clone()))?;
        query(conn, sql)
    }

    /// Releases every database handle.
    pub fn close(&mut self) {
        self.writer = None;
        self.conn_pool.clear();
    }

    fn reopen(&mut self) -> Result<(), StoreError> {
        let writer = open_writer(&self.db_path)?;
        writer.execute(SCHEMA)?;
        let mut conn_pool = Vec::with_capacity(self.conn_pool_size);
        for _ in 0..self.conn_pool_size {
            conn_pool.push(Arc::new(Mutex::new(open_reader(&self.db_path)?)));
        }
        self.writer = Some(writer);
        self.conn_pool = conn_pool;
        Ok(())
    }

    fn install_database(&self, database: &[u8]) -> Result<(), StoreError> {
        let tmp = self.db_path.with_extension("db.restore");
        write_synced(&tmp, database)?;
        fs::rename(&tmp, &self.db_path)?;
        for suffix in ["-journal", "-wal", "-shm"] {
            let mut side = self.db_path.clone().into_os_string();
            side.push(suffix);
            let side = PathBuf::from(side);
            if side.exists() {
                fs::remove_file(side)?;
            }
        }
        Ok(())
    }

    fn persist_snapshot(&self, data: &[u8]) -> Result<(), StoreError> {
        let path = self.snapshot_dir.join(SNAPSHOT_FILE);
        let tmp = path.with_extension("tmp");
        write_synced(&tmp, data)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Loads the locally persisted snapshot, if there is one.
    pub fn load_snapshot(&self) -> Result<Option<SnapshotPayload>, StoreError> {
        let path = self.snapshot_dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        decode_snapshot(&data).map(Some)
    }
}

/// Decodes and validates a snapshot payload.
pub fn decode_snapshot(data: &[u8]) -> Result<SnapshotPayload, StoreError> {
    let payload = SnapshotPayload::decode(data)
        .map_err(|e| StoreError::RestoreError(format!("malformed snapshot: {}", e)))?;
    if payload.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(StoreError::RestoreError(format!(
            "unsupported snapshot format version {}",
            payload.format_version
        )));
    }
    if !payload.database.starts_with(SQLITE_HEADER) {
        return Err(StoreError::RestoreError(
            "snapshot does not contain an SQLite database".to_string(),
        ));
    }
    Ok(payload)
}

fn open_writer(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::new()
        .set_read_write()
        .set_create()
        .set_no_mutex();
    let mut conn = Connection::open_with_flags(path, flags)?;
    conn.set_busy_timeout(BUSY_TIMEOUT_MS)?;
    Ok(conn)
}

/// Opens a connection that cannot change the database. Only committed
/// entries may write.
fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::new().set_read_only().set_no_mutex();
    let mut conn = Connection::open_with_flags(path, flags)?;
    conn.set_busy_timeout(BUSY_TIMEOUT_MS)?;
    Ok(conn)
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Runs `sql` on `conn` and collects the rows.
pub fn query(conn: Arc<Mutex<Connection>>, sql: &str) -> Result<QueryResults, StoreError> {
    let conn = conn
        .lock()
        .map_err(|_| StoreError::StorageError("connection lock poisoned".to_string()))?;
    let mut rows = vec![];
    conn.iterate(sql, |pairs| {
        let mut row = QueryRow::new();
        for &(_, value) in pairs.iter() {
            row.values.push(value.unwrap_or("NULL").to_string());
        }
        rows.push(row);
        true
    })?;
    Ok(QueryResults { rows })
}

/// Statements to run for `command`, each paired with the reason it is
/// refused, if it is.
fn plan_statements(group: &str, command: &RawCommand) -> Vec<(String, Option<String>)> {
    match command.decode() {
        Ok(Command::Directive { ref database, .. }) if database != group => vec![(
            command.payload.clone(),
            Some(format!(
                "command targets database {} but group is {}",
                database, group
            )),
        )],
        Ok(cmd) => cmd
            .statements()
            .into_iter()
            .map(|sql| (sql.to_string(), refusal(sql)))
            .collect(),
        Err(e) => vec![(command.payload.clone(), Some(e.to_string()))],
    }
}

/// Runs `plan` as one transaction and records it as applied.
fn execute_entry(
    writer: &Connection,
    index: usize,
    command_id: u64,
    plan: &[(String, Option<String>)],
) -> Result<Vec<AppliedCommand>, StoreError> {
    writer.execute("BEGIN IMMEDIATE")?;
    let mut applied = Vec::with_capacity(plan.len());
    for (sql, refused) in plan {
        let error = match refused {
            Some(reason) => Some(reason.clone()),
            None => execute_isolated(writer, sql)?,
        };
        let record = AppliedCommand {
            seq: 0,
            index,
            command_id,
            sql: sql.clone(),
            error,
        };
        insert_audit(writer, &record)?;
        applied.push(record);
    }
    let mut statement =
        writer.prepare("INSERT INTO _shard_applied (command_id, log_index) VALUES (?, ?)")?;
    statement.bind(1, command_id as i64)?;
    statement.bind(2, index as i64)?;
    while let State::Row = statement.next()? {}
    drop(statement);
    writer.execute("COMMIT")?;
    Ok(applied)
}

/// Runs one statement inside a savepoint, undoing it if it fails.
///
/// Returns the statement's error; fails only when the savepoint itself
/// cannot be managed.
fn execute_isolated(writer: &Connection, sql: &str) -> Result<Option<String>, StoreError> {
    writer.execute("SAVEPOINT shard_statement")?;
    match run_statement(writer, sql) {
        Ok(()) => {
            writer.execute("RELEASE shard_statement")?;
            Ok(None)
        }
        Err(e) => {
            writer.execute("ROLLBACK TO shard_statement")?;
            writer.execute("RELEASE shard_statement")?;
            Ok(Some(e.to_string()))
        }
    }
}

/// Prepares and steps the first statement of `sql` to completion.
fn run_statement(conn: &Connection, sql: &str) -> Result<(), sqlite::Error> {
    let mut statement = conn.prepare(sql)?;
    while let State::Row = statement.next()? {}
    Ok(())
}

fn insert_audit(conn: &Connection, record: &AppliedCommand) -> Result<(), StoreError> {
    let mut statement = conn.prepare(
        "INSERT INTO _shard_audit (log_index, command_id, sql, error) VALUES (?, ?, ?, ?)",
    )?;
    statement.bind(1, record.index as i64)?;
    statement.bind(2, record.command_id as i64)?;
    statement.bind(3, record.sql.as_str())?;
    match &record.error {
        Some(error) => statement.bind(4, error.as_str())?,
        None => statement.bind(4, ())?,
    }
    while let State::Row = statement.next()? {}
    Ok(())
}

fn is_applied(conn: &Connection, command_id: u64) -> Result<bool, StoreError> {
    let mut found = false;
    conn.iterate(
        format!(
            "SELECT 1 FROM _shard_applied WHERE command_id = {}",
            command_id as i64
        ),
        |_| {
            found = true;
            true
        },
    )?;
    Ok(found)
}

fn load_audit(conn: &Connection, after: u64, limit: usize) -> Result<Vec<AppliedCommand>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(-1);
    let mut audit = vec![];
    conn.iterate(
        format!(
            "SELECT rowid, log_index, command_id, sql, error FROM _shard_audit \
             WHERE rowid > {} ORDER BY rowid LIMIT {}",
            after as i64, limit
        ),
        |row| {
            let value = |i: usize| row.get(i).and_then(|&(_, v)| v);
            audit.push(AppliedCommand {
                seq: value(0).and_then(|v| v.parse().ok()).unwrap_or_default(),
                index: value(1).and_then(|v| v.parse().ok()).unwrap_or_default(),
                command_id: value(2)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or_default() as u64,
                sql: value(3).unwrap_or_default().to_string(),
                error: value(4).map(String::from),
            });
            true
        },
    )?;
    Ok(audit)
}

/// Why `sql` may not run as part of an entry, if it may not.
fn refusal(sql: &str) -> Option<String> {
    let keyword = match leading_keyword(sql) {
        Ok(keyword) => keyword,
        Err(reason) => return Some(reason),
    };
    if matches!(
        keyword.as_str(),
        "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE"
    ) {
        return Some("transaction control is not allowed in replicated commands".to_string());
    }
    if matches!(keyword.as_str(), "ATTACH" | "DETACH" | "VACUUM") {
        return Some(format!("{} is not allowed in replicated commands", keyword));
    }
    if sql.to_ascii_lowercase().contains(INTERNAL_PREFIX) {
        return Some(format!("tables prefixed {} are reserved", INTERNAL_PREFIX));
    }
    None
}

/// Returns the first keyword of the single statement in `sql`.
///
/// Comments and quoted text are skipped. Fails if `sql` is empty or holds
/// more than one statement.
fn leading_keyword(sql: &str) -> Result<String, String> {
    let bytes = sql.as_bytes();
    let skip_to = |from: usize, pattern: &[u8]| {
        bytes[from..]
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map_or(bytes.len(), |n| from + n + pattern.len())
    };
    let mut keyword: Option<String> = None;
    let mut ended = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if bytes[i..].starts_with(b"--") {
            i = skip_to(i + 2, b"\n");
            continue;
        }
        if bytes[i..].starts_with(b"/*") {
            i = skip_to(i + 2, b"*/");
            continue;
        }
        if ended {
            return Err("only one statement is allowed per command".to_string());
        }
        match c {
            b';' => {
                ended = true;
                i += 1;
            }
            b'\'' | b'"' | b'`' => i = skip_to(i + 1, &[c]),
            b'[' => i = skip_to(i + 1, b"]"),
            _ if keyword.is_none() => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| !b.is_ascii_alphanumeric() && *b != b'_')
                    .map_or(bytes.len(), |n| i + n);
                let end = end.max(i + 1);
                keyword = Some(
                    std::str::from_utf8(&bytes[i..end])
                        .unwrap_or_default()
                        .to_ascii_uppercase(),
                );
                i = end;
            }
            _ => i += 1,
        }
    }
    keyword.ok_or_else(|| "empty statement".to_string())
}
