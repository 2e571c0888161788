//! Persistent `EntityStore` backed by redb.
//!
//! # Table design
//!
//! Row tables map an id string to a JSON-encoded row:
//! `users`, `leads`, `jobs`, `invoices`, `stall_detections`, `next_actions`.
//!
//! Two index tables map `"<entity_type>:<entity_id>"` to a row id:
//!
//! - `open_stalls`: the unresolved detection for the entity
//! - `active_actions`: the most recent unclosed next action for the entity
//!
//! Every check-and-insert reads the index and writes both the row and the
//! index inside one write transaction, so two writers cannot both claim a key.
//!
//! `execution_log` uses a 24-byte composite key:
//! ```text
//! [ executed_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! so key order is time order and the latest row for an entity is the first
//! match of a reverse scan.
//!
//! # Sharing the file
//!
//! redb takes an exclusive lock on the file for as long as a `Database` is
//! open. The store therefore opens the file per operation and drops it right
//! after, so a running engine and one-off CLI commands can take turns. An
//! open that finds the file busy is retried with backoff for up to the busy
//! timeout. Operations from one `RedbStore` (and its clones) queue on an
//! in-process gate instead of racing for the lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{ensure_active, EntityStore};
use crate::entity::{Dataset, Invoice, Job, Lead, User};
use crate::error::{GigError, Result};
use crate::orchestrator::records::{AutoExecutionLog, NextAction, StallDetection};
use crate::types::EntityKey;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;
type IndexTable = TableDefinition<'static, &'static str, &'static str>;

const USERS: RowTable = TableDefinition::new("users");
const LEADS: RowTable = TableDefinition::new("leads");
const JOBS: RowTable = TableDefinition::new("jobs");
const INVOICES: RowTable = TableDefinition::new("invoices");
const DETECTIONS: RowTable = TableDefinition::new("stall_detections");
const ACTIONS: RowTable = TableDefinition::new("next_actions");
const OPEN_STALLS: IndexTable = TableDefinition::new("open_stalls");
const ACTIVE_ACTIONS: IndexTable = TableDefinition::new("active_actions");

/// Key: 24-byte composite (executed_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded AutoExecutionLog
const EXECUTION_LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("execution_log");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store_err(e: impl std::fmt::Display) -> GigError {
    GigError::Store(e.to_string())
}

fn log_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn read_row<T, R>(table: &R, id: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id).map_err(store_err)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn write_row<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    id: &str,
    row: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(row)?;
    table.insert(id, bytes.as_slice()).map_err(store_err)?;
    Ok(())
}

fn read_index<R>(table: &R, key: &EntityKey) -> Result<Option<Uuid>>
where
    R: ReadableTable<&'static str, &'static str>,
{
    let key = key.to_string();
    match table.get(key.as_str()).map_err(store_err)? {
        Some(guard) => Uuid::parse_str(guard.value())
            .map(Some)
            .map_err(store_err),
        None => Ok(None),
    }
}

/// Drop the index entry for `key` if it still points at `id`.
fn release_index(
    table: &mut Table<'_, &'static str, &'static str>,
    key: &EntityKey,
    id: Uuid,
) -> Result<()> {
    if read_index(&*table, key)? == Some(id) {
        table.remove(key.to_string().as_str()).map_err(store_err)?;
    }
    Ok(())
}

/// Read every row of `def`, keeping those that pass `keep`.
fn scan<T: DeserializeOwned>(
    db: &Database,
    def: RowTable,
    mut keep: impl FnMut(&T) -> bool,
) -> Result<Vec<T>> {
    let rt = db.begin_read().map_err(store_err)?;
    let table = rt.open_table(def).map_err(store_err)?;
    let mut result = Vec::new();
    for entry in table.iter().map_err(store_err)? {
        let (_, v) = entry.map_err(store_err)?;
        let row: T = serde_json::from_slice(v.value())?;
        if keep(&row) {
            result.push(row);
        }
    }
    Ok(result)
}

fn get_one<T: DeserializeOwned>(db: &Database, def: RowTable, id: &str) -> Result<Option<T>> {
    let rt = db.begin_read().map_err(store_err)?;
    let table = rt.open_table(def).map_err(store_err)?;
    read_row(&table, id)
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// How long an operation waits for another process to release the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Open the file, retrying while another process holds it.
fn connect(path: &Path) -> Result<Database> {
    let deadline = Instant::now() + BUSY_TIMEOUT;
    let mut backoff = Duration::from_millis(5);
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(store_err(e)),
        }
    }
}

#[derive(Clone)]
pub struct RedbStore {
    path: PathBuf,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table up front
    /// so read transactions never see a missing table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = connect(path)?;
        let wt = db.begin_write().map_err(store_err)?;
        for def in [USERS, LEADS, JOBS, INVOICES, DETECTIONS, ACTIONS] {
            wt.open_table(def).map_err(store_err)?;
        }
        for def in [OPEN_STALLS, ACTIVE_ACTIONS] {
            wt.open_table(def).map_err(store_err)?;
        }
        wt.open_table(EXECUTION_LOG).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Run a blocking redb operation off the async executor. The file is
    /// open only for the duration of `f`.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let turn = Arc::clone(&self.gate).lock_owned().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _turn = turn;
            let db = connect(&path)?;
            f(&db)
        })
        .await
        .map_err(|e| GigError::Store(format!("{op}: {e}")))?
    }

    /// Insert or replace entity rows by id. Returns the number of rows written.
    pub async fn import(&self, dataset: Dataset) -> Result<usize> {
        self.run("import", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            let mut count = 0;
            {
                let mut users = wt.open_table(USERS).map_err(store_err)?;
                for u in &dataset.users {
                    write_row(&mut users, &u.id, u)?;
                    count += 1;
                }
                let mut leads = wt.open_table(LEADS).map_err(store_err)?;
                for l in &dataset.leads {
                    write_row(&mut leads, &l.id, l)?;
                    count += 1;
                }
                let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
                for j in &dataset.jobs {
                    write_row(&mut jobs, &j.id, j)?;
                    count += 1;
                }
                let mut invoices = wt.open_table(INVOICES).map_err(store_err)?;
                for i in &dataset.invoices {
                    write_row(&mut invoices, &i.id, i)?;
                    count += 1;
                }
            }
            wt.commit().map_err(store_err)?;
            Ok(count)
        })
        .await
    }
}

#[async_trait]
impl EntityStore for RedbStore {
    async fn list_users(&self) -> Result<Vec<User>> {
        self.run("list_users", |db| scan(db, USERS, |_: &User| true))
            .await
    }

    async fn get_leads(&self, user_id: &str) -> Result<Vec<Lead>> {
        let user_id = user_id.to_owned();
        self.run("get_leads", move |db| {
            scan(db, LEADS, |l: &Lead| l.user_id == user_id)
        })
        .await
    }

    async fn get_jobs(&self, user_id: &str) -> Result<Vec<Job>> {
        let user_id = user_id.to_owned();
        self.run("get_jobs", move |db| {
            scan(db, JOBS, |j: &Job| j.user_id == user_id)
        })
        .await
    }

    async fn get_invoices(&self, user_id: &str) -> Result<Vec<Invoice>> {
        let user_id = user_id.to_owned();
        self.run("get_invoices", move |db| {
            scan(db, INVOICES, |i: &Invoice| i.user_id == user_id)
        })
        .await
    }

    async fn record_respond_tap(&self, lead_id: &str) -> Result<u32> {
        let lead_id = lead_id.to_owned();
        self.run("record_respond_tap", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            let count = {
                let mut leads = wt.open_table(LEADS).map_err(store_err)?;
                let mut lead: Lead = read_row(&leads, &lead_id)?
                    .ok_or_else(|| GigError::not_found("lead", &lead_id))?;
                lead.respond_tap_count += 1;
                write_row(&mut leads, &lead_id, &lead)?;
                lead.respond_tap_count
            };
            wt.commit().map_err(store_err)?;
            Ok(count)
        })
        .await
    }

    // -- stall detections ---------------------------------------------------

    async fn get_active_stall_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<StallDetection>> {
        let key = key.clone();
        self.run("get_active_stall_for_entity", move |db| {
            let rt = db.begin_read().map_err(store_err)?;
            let index = rt.open_table(OPEN_STALLS).map_err(store_err)?;
            let Some(id) = read_index(&index, &key)? else {
                return Ok(None);
            };
            let rows = rt.open_table(DETECTIONS).map_err(store_err)?;
            read_row(&rows, &id.to_string())
        })
        .await
    }

    async fn list_open_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        let user_id = user_id.to_owned();
        self.run("list_open_stall_detections", move |db| {
            scan(db, DETECTIONS, |d: &StallDetection| {
                d.user_id == user_id && d.is_open()
            })
        })
        .await
    }

    async fn list_stall_detections(&self, user_id: &str) -> Result<Vec<StallDetection>> {
        let user_id = user_id.to_owned();
        self.run("list_stall_detections", move |db| {
            let mut rows = scan(db, DETECTIONS, |d: &StallDetection| d.user_id == user_id)?;
            rows.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
            Ok(rows)
        })
        .await
    }

    async fn get_stall_detection(&self, id: Uuid) -> Result<Option<StallDetection>> {
        self.run("get_stall_detection", move |db| {
            get_one(db, DETECTIONS, &id.to_string())
        })
        .await
    }

    async fn create_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        let detection = detection.clone();
        self.run("create_stall_detection", move |db| {
            let key = detection.key();
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut index = wt.open_table(OPEN_STALLS).map_err(store_err)?;
                if read_index(&index, &key)?.is_some() {
                    return Err(GigError::Conflict {
                        kind: "stall detection",
                        key: key.to_string(),
                    });
                }
                let mut rows = wt.open_table(DETECTIONS).map_err(store_err)?;
                let id = detection.id.to_string();
                write_row(&mut rows, &id, &detection)?;
                if detection.is_open() {
                    index
                        .insert(key.to_string().as_str(), id.as_str())
                        .map_err(store_err)?;
                }
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn update_stall_detection(&self, detection: &StallDetection) -> Result<()> {
        let detection = detection.clone();
        self.run("update_stall_detection", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut rows = wt.open_table(DETECTIONS).map_err(store_err)?;
                let id = detection.id.to_string();
                if read_row::<StallDetection, _>(&rows, &id)?.is_none() {
                    return Err(GigError::not_found("stall detection", &id));
                }
                write_row(&mut rows, &id, &detection)?;
                if !detection.is_open() {
                    let mut index = wt.open_table(OPEN_STALLS).map_err(store_err)?;
                    release_index(&mut index, &detection.key(), detection.id)?;
                }
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn resolve_stall_detection(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.run("resolve_stall_detection", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut rows = wt.open_table(DETECTIONS).map_err(store_err)?;
                let row_id = id.to_string();
                let mut detection: StallDetection = read_row(&rows, &row_id)?
                    .ok_or_else(|| GigError::not_found("stall detection", id))?;
                if detection.resolved_at.is_some() {
                    return Ok(());
                }
                detection.resolved_at = Some(at);
                write_row(&mut rows, &row_id, &detection)?;
                let mut index = wt.open_table(OPEN_STALLS).map_err(store_err)?;
                release_index(&mut index, &detection.key(), id)?;
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    // -- next actions -------------------------------------------------------

    async fn get_active_next_action_for_entity(
        &self,
        key: &EntityKey,
        now: DateTime<Utc>,
    ) -> Result<Option<NextAction>> {
        let key = key.clone();
        self.run("get_active_next_action_for_entity", move |db| {
            let rt = db.begin_read().map_err(store_err)?;
            let index = rt.open_table(ACTIVE_ACTIONS).map_err(store_err)?;
            let Some(id) = read_index(&index, &key)? else {
                return Ok(None);
            };
            let rows = rt.open_table(ACTIONS).map_err(store_err)?;
            let action: Option<NextAction> = read_row(&rows, &id.to_string())?;
            Ok(action.filter(|a| a.is_active(now)))
        })
        .await
    }

    async fn get_next_action(&self, id: Uuid) -> Result<Option<NextAction>> {
        self.run("get_next_action", move |db| {
            get_one(db, ACTIONS, &id.to_string())
        })
        .await
    }

    async fn list_next_actions_for_user(&self, user_id: &str) -> Result<Vec<NextAction>> {
        let user_id = user_id.to_owned();
        self.run("list_next_actions_for_user", move |db| {
            let mut rows = scan(db, ACTIONS, |a: &NextAction| a.user_id == user_id)?;
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(rows)
        })
        .await
    }

    async fn create_next_action(&self, action: &NextAction, now: DateTime<Utc>) -> Result<()> {
        let action = action.clone();
        self.run("create_next_action", move |db| {
            let key = action.key();
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut index = wt.open_table(ACTIVE_ACTIONS).map_err(store_err)?;
                let mut rows = wt.open_table(ACTIONS).map_err(store_err)?;
                if let Some(existing) = read_index(&index, &key)? {
                    let current: Option<NextAction> = read_row(&rows, &existing.to_string())?;
                    if current.is_some_and(|a| a.is_active(now)) {
                        return Err(GigError::Conflict {
                            kind: "next action",
                            key: key.to_string(),
                        });
                    }
                }
                let id = action.id.to_string();
                write_row(&mut rows, &id, &action)?;
                index
                    .insert(key.to_string().as_str(), id.as_str())
                    .map_err(store_err)?;
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn update_next_action(&self, action: &NextAction) -> Result<()> {
        let action = action.clone();
        self.run("update_next_action", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut rows = wt.open_table(ACTIONS).map_err(store_err)?;
                let id = action.id.to_string();
                if read_row::<NextAction, _>(&rows, &id)?.is_none() {
                    return Err(GigError::not_found("next action", &id));
                }
                write_row(&mut rows, &id, &action)?;
                if action.is_closed() {
                    let mut index = wt.open_table(ACTIVE_ACTIONS).map_err(store_err)?;
                    release_index(&mut index, &action.key(), action.id)?;
                }
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn act_on_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        self.run("act_on_next_action", move |db| {
            close_action(db, id, now, NextAction::mark_acted)
        })
        .await
    }

    async fn dismiss_next_action(&self, id: Uuid, now: DateTime<Utc>) -> Result<NextAction> {
        self.run("dismiss_next_action", move |db| {
            close_action(db, id, now, NextAction::mark_dismissed)
        })
        .await
    }

    async fn expire_next_actions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.run("expire_next_actions", move |db| {
            let wt = db.begin_write().map_err(store_err)?;
            let count = {
                let mut rows = wt.open_table(ACTIONS).map_err(store_err)?;
                let mut expired = Vec::new();
                for entry in rows.iter().map_err(store_err)? {
                    let (_, v) = entry.map_err(store_err)?;
                    let action: NextAction = serde_json::from_slice(v.value())?;
                    if !action.is_closed() && action.expires_at <= now {
                        expired.push((action.id, action.key()));
                    }
                }
                let mut index = wt.open_table(ACTIVE_ACTIONS).map_err(store_err)?;
                for (id, key) in &expired {
                    rows.remove(id.to_string().as_str()).map_err(store_err)?;
                    release_index(&mut index, key, *id)?;
                }
                expired.len()
            };
            wt.commit().map_err(store_err)?;
            Ok(count)
        })
        .await
    }

    // -- execution log ------------------------------------------------------

    async fn get_last_auto_execution_for_entity(
        &self,
        key: &EntityKey,
    ) -> Result<Option<AutoExecutionLog>> {
        let key = key.clone();
        self.run("get_last_auto_execution_for_entity", move |db| {
            let rt = db.begin_read().map_err(store_err)?;
            let table = rt.open_table(EXECUTION_LOG).map_err(store_err)?;
            for entry in table.iter().map_err(store_err)?.rev() {
                let (_, v) = entry.map_err(store_err)?;
                let log: AutoExecutionLog = serde_json::from_slice(v.value())?;
                if log.key() == key {
                    return Ok(Some(log));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn create_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        let log = log.clone();
        self.run("create_auto_execution_log", move |db| {
            let key = log_key(log.executed_at, log.id);
            let value = serde_json::to_vec(&log)?;
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut table = wt.open_table(EXECUTION_LOG).map_err(store_err)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(store_err)?;
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn update_auto_execution_log(&self, log: &AutoExecutionLog) -> Result<()> {
        let log = log.clone();
        self.run("update_auto_execution_log", move |db| {
            let key = log_key(log.executed_at, log.id);
            let value = serde_json::to_vec(&log)?;
            let wt = db.begin_write().map_err(store_err)?;
            {
                let mut table = wt.open_table(EXECUTION_LOG).map_err(store_err)?;
                if table.get(key.as_slice()).map_err(store_err)?.is_none() {
                    return Err(GigError::not_found("auto execution log", log.id));
                }
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(store_err)?;
            }
            wt.commit().map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn list_auto_execution_logs(&self, user_id: &str) -> Result<Vec<AutoExecutionLog>> {
        let user_id = user_id.to_owned();
        self.run("list_auto_execution_logs", move |db| {
            let rt = db.begin_read().map_err(store_err)?;
            let table = rt.open_table(EXECUTION_LOG).map_err(store_err)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(store_err)?.rev() {
                let (_, v) = entry.map_err(store_err)?;
                let log: AutoExecutionLog = serde_json::from_slice(v.value())?;
                if log.user_id == user_id {
                    result.push(log);
                }
            }
            Ok(result)
        })
        .await
    }
}

/// Apply a closing transition to an active action and free its index slot.
fn close_action(
    db: &Database,
    id: Uuid,
    now: DateTime<Utc>,
    mark: fn(&mut NextAction, DateTime<Utc>),
) -> Result<NextAction> {
    let wt = db.begin_write().map_err(store_err)?;
    let action = {
        let mut rows = wt.open_table(ACTIONS).map_err(store_err)?;
        let row_id = id.to_string();
        let mut action: NextAction = read_row(&rows, &row_id)?
            .ok_or_else(|| GigError::not_found("next action", id))?;
        ensure_active(&action, now)?;
        mark(&mut action, now);
        write_row(&mut rows, &row_id, &action)?;
        let mut index = wt.open_table(ACTIVE_ACTIONS).map_err(store_err)?;
        release_index(&mut index, &action.key(), id)?;
        action
    };
    wt.commit().map_err(store_err)?;
    Ok(action)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
