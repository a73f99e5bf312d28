use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// The job definition + mutable state are stored as a single JSON blob
/// (`doc`) — the shape mirrors the on-disk cron store in `§6` of the spec —
/// with `next_run_at_ms` denormalized into its own column so the polling
/// query stays an index scan even with thousands of jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cron_jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            doc             TEXT    NOT NULL,   -- JSON-encoded CronJob
            next_run_at_ms  INTEGER,            -- denormalized from doc.state
            running         INTEGER NOT NULL DEFAULT 0,
            created_at_ms   INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_cron_jobs_next_run
            ON cron_jobs (next_run_at_ms);
        ",
    )?;
    Ok(())
}
