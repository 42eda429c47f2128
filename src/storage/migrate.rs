//! Schema migrations for the relational backend.
//!
//! Migrations are embedded, ordered and idempotent: each runs at most once,
//! tracked in a `schema_migrations` bookkeeping table. The server applies
//! pending migrations at startup, before the listener accepts traffic.

use crate::error::Error;

/// Every migration the schema has ever had, oldest first.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_metrics",
        "CREATE TABLE IF NOT EXISTS metrics (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            delta BIGINT,
            value DOUBLE PRECISION
        )",
    ),
    (
        "0002_metrics_display",
        "ALTER TABLE metrics ADD COLUMN IF NOT EXISTS display TEXT",
    ),
];

/// Apply every migration that has not run yet.
///
/// Each pending migration executes inside its own transaction together with
/// its bookkeeping row, so a failure leaves the schema at a clean boundary.
pub fn apply_pending_migrations(client: &mut postgres::Client) -> Result<(), Error> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .map_err(|e| Error::from_db(&e))?;

    for (version, sql) in MIGRATIONS {
        let version: &str = version;
        let seen = client
            .query_opt(
                "SELECT version FROM schema_migrations WHERE version = $1",
                &[&version],
            )
            .map_err(|e| Error::from_db(&e))?;
        if seen.is_some() {
            continue;
        }

        let mut tx = client.transaction().map_err(|e| Error::from_db(&e))?;
        tx.batch_execute(sql).map_err(|e| Error::from_db(&e))?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES ($1)",
            &[&version],
        )
        .map_err(|e| Error::from_db(&e))?;
        tx.commit().map_err(|e| Error::from_db(&e))?;
        info!("applied migration {}", version);
    }
    Ok(())
}
