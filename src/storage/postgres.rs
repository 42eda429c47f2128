//! Relational storage backend.
//!
//! Every operation verifies connectivity with a bounded ping, then runs
//! through the shared retry policy. Writes are upserts keyed by metric name
//! with counter accumulation happening in SQL, so concurrent writers get
//! serialized by the database rather than by callers. `set_all` wraps the
//! whole batch in one transaction: commit everything or roll back
//! everything.

use crate::error::Error;
use crate::metric::{Metric, MetricKind};
use crate::retry::retry;
use crate::storage::Storage;
use postgres::types::ToSql;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

/// Bound on connection establishment and on every statement.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT: &str = "INSERT INTO metrics (name, kind, delta, value, display)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (name) DO UPDATE SET
         kind = EXCLUDED.kind,
         delta = CASE
             WHEN EXCLUDED.kind = 'counter' AND metrics.kind = 'counter'
                 THEN COALESCE(metrics.delta, 0) + EXCLUDED.delta
             ELSE EXCLUDED.delta
         END,
         value = EXCLUDED.value,
         display = EXCLUDED.display";

const SELECT_ONE: &str =
    "SELECT name, kind, delta, value, display FROM metrics WHERE name = $1";

const SELECT_ALL: &str = "SELECT name, kind, delta, value, display FROM metrics";

/// Applies the statement timeout to every fresh pool connection.
#[derive(Debug)]
struct SessionDefaults;

impl r2d2::CustomizeConnection<postgres::Client, postgres::Error> for SessionDefaults {
    fn on_acquire(&self, conn: &mut postgres::Client) -> Result<(), postgres::Error> {
        conn.batch_execute("SET statement_timeout = 5000")
    }
}

/// Metric storage on a PostgreSQL connection pool.
pub struct PostgresStorage {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PostgresStorage {
    /// Connect to `dsn`, build the pool and apply pending migrations.
    ///
    /// An unreachable database here is a startup failure; the caller is
    /// expected to treat it as fatal.
    pub fn connect(dsn: &str) -> Result<PostgresStorage, Error> {
        let mut config: postgres::Config = dsn
            .parse()
            .map_err(|e: postgres::Error| Error::Storage(e.to_string()))?;
        config.connect_timeout(OP_TIMEOUT);

        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(16)
            .connection_timeout(OP_TIMEOUT)
            .connection_customizer(Box::new(SessionDefaults))
            .build(manager)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let storage = PostgresStorage { pool };
        {
            let mut conn = storage.conn()?;
            crate::storage::migrate::apply_pending_migrations(&mut conn)?;
        }
        Ok(storage)
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<NoTls>>, Error> {
        // pool exhaustion and connect failures both clear on retry
        self.pool
            .get()
            .map_err(|e| Error::Transient(e.to_string()))
    }

    fn checked_conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<NoTls>>, Error> {
        self.ping()?;
        self.conn()
    }
}

fn kind_as_str(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Gauge => "gauge",
        MetricKind::Counter => "counter",
    }
}

fn kind_from_str(s: &str) -> Result<MetricKind, Error> {
    match s {
        "gauge" => Ok(MetricKind::Gauge),
        "counter" => Ok(MetricKind::Counter),
        other => Err(Error::InvalidKind(other.to_string())),
    }
}

fn row_to_metric(row: &postgres::Row) -> Result<Metric, Error> {
    let kind: String = row.get(1);
    Ok(Metric {
        name: row.get(0),
        kind: kind_from_str(&kind)?,
        delta: row.get(2),
        value: row.get(3),
        display: row.get(4),
    })
}

fn upsert<C>(client: &mut C, metric: &Metric) -> Result<(), Error>
where
    C: postgres::GenericClient,
{
    let kind = kind_as_str(metric.kind);
    let params: [&(dyn ToSql + Sync); 5] = [
        &metric.name,
        &kind,
        &metric.delta,
        &metric.value,
        &metric.display,
    ];
    client
        .execute(UPSERT, &params)
        .map_err(|e| Error::from_db(&e))?;
    Ok(())
}

impl Storage for PostgresStorage {
    fn get(&self, name: &str) -> Result<Metric, Error> {
        let mut conn = self.checked_conn()?;
        retry("db.get", || {
            let row = conn
                .query_opt(SELECT_ONE, &[&name])
                .map_err(|e| Error::from_db(&e))?;
            match row {
                Some(row) => row_to_metric(&row),
                None => Err(Error::NotFound),
            }
        })
    }

    fn set(&self, metric: Metric) -> Result<(), Error> {
        let mut conn = self.checked_conn()?;
        retry("db.set", || upsert(&mut *conn, &metric))
    }

    fn set_all(&self, metrics: HashMap<String, Metric>) -> Result<(), Error> {
        let mut conn = self.checked_conn()?;
        retry("db.set_all", || {
            let mut tx = conn.transaction().map_err(|e| Error::from_db(&e))?;
            for metric in metrics.values() {
                upsert(&mut tx, metric)?;
            }
            tx.commit().map_err(|e| Error::from_db(&e))?;
            Ok(())
        })
    }

    fn get_all(&self) -> Result<HashMap<String, Metric>, Error> {
        let mut conn = self.checked_conn()?;
        retry("db.get_all", || {
            let rows = conn
                .query(SELECT_ALL, &[])
                .map_err(|e| Error::from_db(&e))?;
            let mut out = HashMap::with_capacity(rows.len());
            for row in &rows {
                let metric = row_to_metric(row)?;
                out.insert(metric.name.clone(), metric);
            }
            Ok(out)
        })
    }

    fn clear(&self) -> Result<(), Error> {
        let mut conn = self.checked_conn()?;
        retry("db.clear", || {
            conn.batch_execute("TRUNCATE metrics")
                .map_err(|e| Error::from_db(&e))?;
            Ok(())
        })
    }

    fn ping(&self) -> Result<(), Error> {
        retry("db.ping", || {
            let mut conn = self.conn()?;
            conn.batch_execute("SELECT 1")
                .map_err(|e| Error::from_db(&e))
        })
    }

    fn close(&self) {
        // r2d2 tears the pool down on drop; nothing to flush
        debug!("closing postgres storage");
    }
}
