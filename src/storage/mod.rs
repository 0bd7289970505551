use crate::models::{IngestRun, Market, NewObservation, PriceObservation};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS seq_market_id;
CREATE SEQUENCE IF NOT EXISTS seq_observation_id;
CREATE SEQUENCE IF NOT EXISTS seq_ingest_run_id;

CREATE TABLE IF NOT EXISTS markets (
    id            BIGINT PRIMARY KEY DEFAULT nextval('seq_market_id'),
    state         VARCHAR NOT NULL,
    district      VARCHAR NOT NULL,
    market_name   VARCHAR NOT NULL,
    -- Contact metadata is never populated by ingestion; reserved for manual
    -- enrichment.
    address       VARCHAR,
    contact_phone VARCHAR,
    last_seen_at  TIMESTAMP NOT NULL,
    UNIQUE (state, district, market_name)
);

CREATE TABLE IF NOT EXISTS price_observations (
    id              BIGINT PRIMARY KEY DEFAULT nextval('seq_observation_id'),
    -- Non-owning reference to markets.id; observations never outlive the
    -- dimension row but the pipeline never deletes either.
    market_id       BIGINT NOT NULL,
    commodity       VARCHAR NOT NULL,
    variety         VARCHAR NOT NULL DEFAULT '',
    min_price       DOUBLE,
    modal_price     DOUBLE,
    max_price       DOUBLE,
    arrivals_tonnes DOUBLE NOT NULL DEFAULT 0,
    -- Canonical YYYY-MM-DD string. VARCHAR on purpose: the normalizer does
    -- not validate calendars, and a DATE column would reject what the feed
    -- contract says must pass through.
    observed_on     VARCHAR,
    created_at      TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    id          BIGINT PRIMARY KEY DEFAULT nextval('seq_ingest_run_id'),
    started_at  TIMESTAMP NOT NULL,
    finished_at TIMESTAMP,
    status      VARCHAR NOT NULL DEFAULT 'running',
    attempted   BIGINT DEFAULT 0,
    succeeded   BIGINT DEFAULT 0,
    failed      BIGINT DEFAULT 0,
    error_msg   VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_obs_market    ON price_observations (market_id);
CREATE INDEX IF NOT EXISTS idx_obs_commodity ON price_observations (commodity);
CREATE INDEX IF NOT EXISTS idx_obs_date      ON price_observations (observed_on);
CREATE INDEX IF NOT EXISTS idx_markets_district ON markets (district);
"#;

// ── Store contract ────────────────────────────────────────────────────────────

/// The storage operations the ingestion pipeline needs. A trait so tests can
/// wrap the real repository and inject faults at specific steps.
pub trait MarketStore: Send + Sync {
    /// Cheap connectivity probe; a failure here means every per-record call
    /// would fail identically, so callers abort instead of looping.
    fn ping(&self) -> Result<()>;

    /// Point lookup by the identity triple.
    fn find_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>>;

    /// Insert a market row for the triple, returning its new id, or `None`
    /// when the unique constraint reports the row already exists (a
    /// concurrent resolver won the race; callers re-query).
    fn insert_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>>;

    /// Refresh last_seen_at on repeat sighting.
    fn touch_market(&self, id: i64) -> Result<()>;

    /// Append one fact row, returning its id.
    fn insert_observation(&self, market_id: i64, obs: &NewObservation) -> Result<i64>;

    fn begin_run(&self) -> Result<i64>;

    fn finish_run(
        &self,
        run_id: i64,
        attempted: usize,
        succeeded: usize,
        failed: usize,
        error: Option<&str>,
    ) -> Result<()>;
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    // DuckDB connections are not Sync; the mutex lets the scheduler share one
    // repository across spawned run tasks.
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("storage connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Read paths ────────────────────────────────────────────────────────────

    pub fn market_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM markets")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn observation_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM price_observations")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    /// Observation date coverage. ISO strings order correctly, so MIN/MAX on
    /// the VARCHAR column is sound.
    pub fn observation_date_range(&self) -> Result<(Option<String>, Option<String>)> {
        let conn = self.conn()?;
        let mut s = conn.prepare(
            "SELECT MIN(observed_on), MAX(observed_on) FROM price_observations
             WHERE observed_on IS NOT NULL",
        )?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    pub fn list_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, state, district, market_name, address, contact_phone, last_seen_at
             FROM markets ORDER BY district, market_name",
        )?;
        let markets = stmt
            .query_map([], market_from_row)?
            .collect::<Result<Vec<_>, duckdb::Error>>()?;
        Ok(markets)
    }

    pub fn get_market(&self, id: i64) -> Result<Option<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, state, district, market_name, address, contact_phone, last_seen_at
             FROM markets WHERE id = ?",
        )?;
        match stmt.query_row(params![id], market_from_row) {
            Ok(m) => Ok(Some(m)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("get market {}", id)),
        }
    }

    pub fn find_markets_by_name(&self, market_name: &str) -> Result<Vec<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, state, district, market_name, address, contact_phone, last_seen_at
             FROM markets WHERE market_name = ? ORDER BY district",
        )?;
        let markets = stmt
            .query_map(params![market_name], market_from_row)?
            .collect::<Result<Vec<_>, duckdb::Error>>()?;
        Ok(markets)
    }

    /// Latest observation per commodity for one market. Duplicate fact rows
    /// for the same day are allowed by design, so the newest created_at wins
    /// within a date.
    pub fn latest_prices(&self, market_id: i64) -> Result<Vec<PriceObservation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, market_id, commodity, variety, min_price, modal_price, max_price,
                      arrivals_tonnes, observed_on, created_at
               FROM price_observations
               WHERE market_id = ?
               QUALIFY row_number() OVER (
                   PARTITION BY commodity
                   ORDER BY observed_on DESC NULLS LAST, created_at DESC
               ) = 1
               ORDER BY commodity"#,
        )?;
        let rows = stmt
            .query_map(params![market_id], observation_from_row)?
            .collect::<Result<Vec<_>, duckdb::Error>>()?;
        Ok(rows)
    }

    /// Distinct districts with at least one resolved market in a state.
    pub fn list_districts(&self, state: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT district FROM markets WHERE state = ? ORDER BY district")?;
        let districts = stmt
            .query_map(params![state], |r| r.get(0))?
            .collect::<Result<Vec<String>, duckdb::Error>>()?;
        Ok(districts)
    }

    pub fn last_run(&self) -> Result<Option<IngestRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, status, attempted, succeeded, failed, error_msg
             FROM ingest_runs ORDER BY started_at DESC, id DESC LIMIT 1",
        )?;
        match stmt.query_row([], |r| {
            Ok(IngestRun {
                id: r.get(0)?,
                started_at: r.get(1)?,
                finished_at: r.get(2)?,
                status: r.get(3)?,
                attempted: r.get(4)?,
                succeeded: r.get(5)?,
                failed: r.get(6)?,
                error_msg: r.get(7)?,
            })
        }) {
            Ok(run) => Ok(Some(run)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("read last ingest run"),
        }
    }
}

fn market_from_row(r: &duckdb::Row<'_>) -> Result<Market, duckdb::Error> {
    Ok(Market {
        id: r.get(0)?,
        state: r.get(1)?,
        district: r.get(2)?,
        market_name: r.get(3)?,
        address: r.get(4)?,
        contact_phone: r.get(5)?,
        last_seen_at: r.get(6)?,
    })
}

fn observation_from_row(r: &duckdb::Row<'_>) -> Result<PriceObservation, duckdb::Error> {
    Ok(PriceObservation {
        id: r.get(0)?,
        market_id: r.get(1)?,
        commodity: r.get(2)?,
        variety: r.get(3)?,
        min_price: r.get(4)?,
        modal_price: r.get(5)?,
        max_price: r.get(6)?,
        arrivals_tonnes: r.get(7)?,
        observed_on: r.get(8)?,
        created_at: r.get(9)?,
    })
}

// ── Pipeline-facing operations ────────────────────────────────────────────────

impl MarketStore for Repository {
    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT 1")?;
        let _: i64 = s.query_row([], |r| r.get(0))?;
        Ok(())
    }

    fn find_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM markets WHERE state = ? AND district = ? AND market_name = ?",
        )?;
        match stmt.query_row(params![state, district, market], |r| r.get(0)) {
            Ok(id) => Ok(Some(id)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("lookup market {}/{}/{}", state, district, market))
            }
        }
    }

    fn insert_market(&self, state: &str, district: &str, market: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"INSERT INTO markets (state, district, market_name, last_seen_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (state, district, market_name) DO NOTHING
               RETURNING id"#,
        )?;
        match stmt.query_row(params![state, district, market, Utc::now().naive_utc()], |r| {
            r.get(0)
        }) {
            Ok(id) => Ok(Some(id)),
            // Conflict: the row already exists, nothing was returned.
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("insert market {}/{}/{}", state, district, market))
            }
        }
    }

    fn touch_market(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE markets SET last_seen_at = ? WHERE id = ?",
            params![Utc::now().naive_utc(), id],
        )
        .with_context(|| format!("touch market {}", id))?;
        Ok(())
    }

    fn insert_observation(&self, market_id: i64, obs: &NewObservation) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"INSERT INTO price_observations
                   (market_id, commodity, variety, min_price, modal_price, max_price,
                    arrivals_tonnes, observed_on, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )?;
        let id = stmt
            .query_row(
                params![
                    market_id,
                    obs.commodity,
                    obs.variety,
                    obs.min_price,
                    obs.modal_price,
                    obs.max_price,
                    obs.arrivals_tonnes,
                    obs.observed_on,
                    Utc::now().naive_utc(),
                ],
                |r| r.get(0),
            )
            .with_context(|| format!("insert observation {} @ market {}", obs.commodity, market_id))?;
        Ok(id)
    }

    fn begin_run(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "INSERT INTO ingest_runs (started_at, status) VALUES (?, 'running') RETURNING id",
        )?;
        let id = stmt.query_row(params![Utc::now().naive_utc()], |r| r.get(0))?;
        Ok(id)
    }

    fn finish_run(
        &self,
        run_id: i64,
        attempted: usize,
        succeeded: usize,
        failed: usize,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE ingest_runs SET
               finished_at = ?, status = ?,
               attempted = ?, succeeded = ?, failed = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                attempted as i64,
                succeeded as i64,
                failed as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
