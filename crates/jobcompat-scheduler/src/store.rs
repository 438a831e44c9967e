use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use jobcompat_core::{BackendKind, Extras, JobId, NetworkType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{ExecutionConstraint, JobRequest},
};

const SELECT_COLUMNS: &str = "SELECT id, tag, schedule_kind, start_ms, end_ms, exact,
        interval_ms, flex_ms, persisted_extras, required_backend, requires_charging,
        requires_device_idle, network_type, backend, failure_count, scheduled_at_ms,
        last_run_ms, created_at
     FROM job_requests";

/// A pending job and the backend that owns its registration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub request: JobRequest,
    pub backend: BackendKind,
    /// ISO-8601 timestamp of the first schedule.
    pub created_at: String,
    /// Wall-clock ms of the latest (re-)registration; windows are relative to it.
    pub scheduled_at_ms: i64,
    pub failure_count: u32,
    pub last_run_ms: Option<i64>,
}

/// Durable table of pending job requests, keyed by id.
///
/// Every mutation is a single statement under one connection lock, so an
/// entry is either fully written or absent. A cache in front of SQLite
/// keeps the transient extras of requests scheduled by this process; they
/// are never written to disk.
pub struct JobStore {
    conn: Mutex<Connection>,
    cache: Mutex<HashMap<JobId, StoreEntry>>,
    last_id: AtomicI32,
}

impl JobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        let max_id: i32 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM job_requests", [], |row| {
                row.get(0)
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
            last_id: AtomicI32::new(max_id),
        })
    }

    /// Hand out an id not used by any stored entry.
    pub fn allocate_id(&self) -> Result<JobId> {
        self.last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| last.checked_add(1))
            .map(|last| JobId(last + 1))
            .map_err(|last| SchedulerError::IdSpaceExhausted { last: JobId(last) })
    }

    /// Insert or overwrite the entry for `entry.request.id()`.
    pub fn put(&self, entry: &StoreEntry) -> Result<()> {
        let conn = self.conn.lock().expect("job store poisoned");
        let req = &entry.request;
        let (kind, start, end, exact, interval, flex) = constraint_columns(req.constraint());
        let extras = serde_json::to_string(req.persisted_extras())?;

        conn.execute(
            "INSERT OR REPLACE INTO job_requests
             (id, tag, schedule_kind, start_ms, end_ms, exact, interval_ms, flex_ms,
              persisted_extras, required_backend, requires_charging, requires_device_idle,
              network_type, backend, failure_count, scheduled_at_ms, last_run_ms, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                req.id().get(),
                req.tag(),
                kind,
                start,
                end,
                exact,
                interval,
                flex,
                extras,
                req.required_backend().map(|k| k.to_string()),
                req.requires_charging(),
                req.requires_device_idle(),
                req.network_type().to_string(),
                entry.backend.to_string(),
                entry.failure_count,
                entry.scheduled_at_ms,
                entry.last_run_ms,
                entry.created_at,
            ],
        )?;

        // Cache only after the row committed.
        self.cache
            .lock()
            .expect("job store cache poisoned")
            .insert(req.id(), entry.clone());
        debug!(job_id = %req.id(), backend = %entry.backend, "store entry written");
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<Option<StoreEntry>> {
        let conn = self.conn.lock().expect("job store poisoned");
        if let Some(entry) = self.cache.lock().expect("job store cache poisoned").get(&id) {
            return Ok(Some(entry.clone()));
        }
        let entry = conn
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id.get()], read_row)
            .optional()?
            .and_then(decode_row);
        if let Some(ref e) = entry {
            self.cache
                .lock()
                .expect("job store cache poisoned")
                .insert(id, e.clone());
        }
        Ok(entry)
    }

    /// Delete the entry. Returns whether one existed.
    pub fn remove(&self, id: JobId) -> Result<bool> {
        let conn = self.conn.lock().expect("job store poisoned");
        let n = conn.execute("DELETE FROM job_requests WHERE id = ?1", [id.get()])?;
        self.cache
            .lock()
            .expect("job store cache poisoned")
            .remove(&id);
        if n > 0 {
            debug!(job_id = %id, "store entry removed");
        }
        Ok(n > 0)
    }

    /// All pending entries ordered by id.
    pub fn all_pending(&self) -> Result<Vec<StoreEntry>> {
        self.query(&format!("{SELECT_COLUMNS} ORDER BY id"), None)
    }

    pub fn for_tag(&self, tag: &str) -> Result<Vec<StoreEntry>> {
        self.query(&format!("{SELECT_COLUMNS} WHERE tag = ?1 ORDER BY id"), Some(tag))
    }

    fn query(&self, sql: &str, tag: Option<&str>) -> Result<Vec<StoreEntry>> {
        let conn = self.conn.lock().expect("job store poisoned");
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<RawRow> = match tag {
            Some(tag) => stmt.query_map([tag], read_row)?.collect::<rusqlite::Result<_>>()?,
            None => stmt.query_map([], read_row)?.collect::<rusqlite::Result<_>>()?,
        };

        // Rows on disk carry no transient extras; prefer the cached copy.
        let cache = self.cache.lock().expect("job store cache poisoned");
        Ok(rows
            .into_iter()
            .filter_map(decode_row)
            .map(|e| cache.get(&e.request.id()).cloned().unwrap_or(e))
            .collect())
    }
}

type ConstraintColumns = (
    &'static str,
    Option<i64>,
    Option<i64>,
    bool,
    Option<i64>,
    Option<i64>,
);

fn constraint_columns(constraint: ExecutionConstraint) -> ConstraintColumns {
    match constraint {
        ExecutionConstraint::OneShot {
            start_ms,
            end_ms,
            exact,
        } => (
            "one_shot",
            Some(ms_column(start_ms)),
            Some(ms_column(end_ms)),
            exact,
            None,
            None,
        ),
        ExecutionConstraint::Periodic {
            interval_ms,
            flex_ms,
        } => (
            "periodic",
            None,
            None,
            false,
            Some(ms_column(interval_ms)),
            Some(ms_column(flex_ms)),
        ),
    }
}

fn ms_column(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn ms_from_column(id: JobId, column: &str, value: i64) -> Option<u64> {
    match u64::try_from(value) {
        Ok(ms) => Some(ms),
        Err(_) => {
            warn!(job_id = %id, column, value, "negative duration in store, skipping");
            None
        }
    }
}

/// Columns exactly as stored, decoded in a second step so one bad row
/// does not fail the whole query.
struct RawRow {
    id: i32,
    tag: String,
    schedule_kind: String,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    exact: bool,
    interval_ms: Option<i64>,
    flex_ms: Option<i64>,
    persisted_extras: String,
    required_backend: Option<String>,
    requires_charging: bool,
    requires_device_idle: bool,
    network_type: String,
    backend: String,
    failure_count: u32,
    scheduled_at_ms: i64,
    last_run_ms: Option<i64>,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        tag: row.get(1)?,
        schedule_kind: row.get(2)?,
        start_ms: row.get(3)?,
        end_ms: row.get(4)?,
        exact: row.get(5)?,
        interval_ms: row.get(6)?,
        flex_ms: row.get(7)?,
        persisted_extras: row.get(8)?,
        required_backend: row.get(9)?,
        requires_charging: row.get(10)?,
        requires_device_idle: row.get(11)?,
        network_type: row.get(12)?,
        backend: row.get(13)?,
        failure_count: row.get(14)?,
        scheduled_at_ms: row.get(15)?,
        last_run_ms: row.get(16)?,
        created_at: row.get(17)?,
    })
}

fn decode_row(raw: RawRow) -> Option<StoreEntry> {
    let id = JobId(raw.id);
    let constraint = match raw.schedule_kind.as_str() {
        "one_shot" => match (raw.start_ms, raw.end_ms) {
            (Some(start), Some(end)) => ExecutionConstraint::OneShot {
                start_ms: ms_from_column(id, "start_ms", start)?,
                end_ms: ms_from_column(id, "end_ms", end)?,
                exact: raw.exact,
            },
            _ => {
                warn!(job_id = %id, "one-shot row without a window, skipping");
                return None;
            }
        },
        "periodic" => match (raw.interval_ms, raw.flex_ms) {
            (Some(interval), Some(flex)) => ExecutionConstraint::Periodic {
                interval_ms: ms_from_column(id, "interval_ms", interval)?,
                flex_ms: ms_from_column(id, "flex_ms", flex)?,
            },
            _ => {
                warn!(job_id = %id, "periodic row without an interval, skipping");
                return None;
            }
        },
        other => {
            warn!(job_id = %id, kind = other, "unknown schedule kind in store, skipping");
            return None;
        }
    };

    let backend: BackendKind = match raw.backend.parse() {
        Ok(b) => b,
        Err(e) => {
            warn!(job_id = %id, "bad owning backend in store: {e}");
            return None;
        }
    };
    let persisted_extras: Extras = match serde_json::from_str(&raw.persisted_extras) {
        Ok(x) => x,
        Err(e) => {
            warn!(job_id = %id, "bad persisted extras JSON: {e}");
            return None;
        }
    };
    let required_backend = raw.required_backend.and_then(|s| s.parse().ok());
    let network_type: NetworkType = raw.network_type.parse().unwrap_or_default();

    Some(StoreEntry {
        request: JobRequest::from_parts(
            id,
            raw.tag,
            constraint,
            persisted_extras,
            required_backend,
            raw.requires_charging,
            raw.requires_device_idle,
            network_type,
        ),
        backend,
        created_at: raw.created_at,
        scheduled_at_ms: raw.scheduled_at_ms,
        failure_count: raw.failure_count,
        last_run_ms: raw.last_run_ms,
    })
}
