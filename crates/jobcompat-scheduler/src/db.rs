use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job request schema in `conn`.
///
/// Creates the `job_requests` table (idempotent). Transient extras have no
/// column: they never reach durable storage.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_requests (
            id                   INTEGER NOT NULL PRIMARY KEY,
            tag                  TEXT    NOT NULL,
            schedule_kind        TEXT    NOT NULL,   -- 'one_shot' | 'periodic'
            start_ms             INTEGER,            -- one-shot window start
            end_ms               INTEGER,            -- one-shot window end
            exact                INTEGER NOT NULL DEFAULT 0,
            interval_ms          INTEGER,            -- periodic interval
            flex_ms              INTEGER,            -- periodic flex
            persisted_extras     TEXT    NOT NULL,   -- JSON-encoded Extras
            required_backend     TEXT,
            requires_charging    INTEGER NOT NULL DEFAULT 0,
            requires_device_idle INTEGER NOT NULL DEFAULT 0,
            network_type         TEXT    NOT NULL DEFAULT 'any',
            backend              TEXT    NOT NULL,   -- owning backend
            failure_count        INTEGER NOT NULL DEFAULT 0,
            scheduled_at_ms      INTEGER NOT NULL,
            last_run_ms          INTEGER,
            created_at           TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_requests_tag ON job_requests (tag);
        ",
    )?;
    Ok(())
}
