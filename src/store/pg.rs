//! Postgres-backed measurement store.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::{Client, NoTls, Row};
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;

use crate::config::DatabaseConfig;
use crate::db;
use crate::model::{CoverageFraction, MeasurementRecord, ZipCoverage};
use crate::store::{
    CatalogWriter, MeasurementStore, NewMeasurement, NewWaterSystem, RowCounts, StoreError,
    StoreOpener,
};

const MEASUREMENT_COLUMNS: &str = "
    SELECT m.id, p.name, c.name, m.year, m.value_ppb, m.basis, m.source_url, m.last_updated
    FROM measurement m
    JOIN pws p ON p.id = m.pws_id
    JOIN contaminant c ON c.id = m.contaminant_id
";

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        let message = err.to_string();

        if let Some(code) = err.code() {
            if *code == SqlState::QUERY_CANCELED {
                return StoreError::Unavailable(format!("statement timed out or was cancelled: {}", message));
            }
            // Class 08: connection exception. Class 57: operator intervention
            // (admin shutdown, cannot connect now).
            if code.code().starts_with("08") || code.code().starts_with("57") {
                return StoreError::Unavailable(message);
            }
            if code.code().starts_with("23") {
                return StoreError::Integrity(message);
            }
            return StoreError::Query(message);
        }

        let io_failure = std::error::Error::source(&err)
            .map(|source| source.is::<std::io::Error>())
            .unwrap_or(false);
        if err.is_closed() || io_failure || message.starts_with("error connecting") {
            StoreError::Unavailable(message)
        } else {
            StoreError::Query(message)
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type Manager = PostgresConnectionManager<NoTls>;

/// A dedicated connection, or one borrowed from the server's pool and
/// returned to it on drop.
enum Session {
    Owned(Client),
    Pooled(PooledConnection<Manager>),
}

impl Deref for Session {
    type Target = Client;

    fn deref(&self) -> &Client {
        match self {
            Session::Owned(client) => client,
            Session::Pooled(conn) => conn,
        }
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Client {
        match self {
            Session::Owned(client) => client,
            Session::Pooled(conn) => conn,
        }
    }
}

pub struct PgStore {
    client: Session,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Session::Owned(client),
        }
    }

    pub fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        Ok(Self::new(db::connect(config)?))
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

fn measurement_from_row(row: &Row) -> MeasurementRecord {
    MeasurementRecord {
        id: row.get(0),
        pws_name: row.get(1),
        contaminant: row.get(2),
        year: row.get(3),
        value_ppb: row.get(4),
        basis: row.get(5),
        source_url: row.get(6),
        last_updated: row.get::<_, DateTime<Utc>>(7),
    }
}

fn coverage_from_row(row: &Row) -> ZipCoverage {
    ZipCoverage {
        zip: row.get(0),
        pwsid: row.get(1),
        pws_name: row.get(2),
        coverage_fraction: CoverageFraction::from(row.get::<_, Option<f64>>(3)),
    }
}

impl MeasurementStore for PgStore {
    fn zip_coverage(&mut self, zip: &str) -> Result<Vec<ZipCoverage>, StoreError> {
        let rows = self.client.query(
            "SELECT zip, pwsid, pws_name, coverage_fraction
             FROM zip_pws
             WHERE zip = $1
             ORDER BY coverage_fraction DESC NULLS LAST, pws_name ASC",
            &[&zip],
        )?;
        Ok(rows.iter().map(coverage_from_row).collect())
    }

    fn measurements_for_systems(
        &mut self,
        pws_names: &[String],
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        if pws_names.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!("{} WHERE p.name = ANY($1) ORDER BY m.id", MEASUREMENT_COLUMNS);
        let rows = self.client.query(query.as_str(), &[&pws_names])?;
        Ok(rows.iter().map(measurement_from_row).collect())
    }

    fn measurements_for_pair(
        &mut self,
        pws_name: &str,
        contaminant: &str,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let query = format!(
            "{} WHERE p.name = $1 AND c.name = $2 ORDER BY m.id",
            MEASUREMENT_COLUMNS
        );
        let rows = self.client.query(query.as_str(), &[&pws_name, &contaminant])?;
        Ok(rows.iter().map(measurement_from_row).collect())
    }

    fn row_counts(&mut self) -> Result<RowCounts, StoreError> {
        let row = self.client.query_one(
            "SELECT
                (SELECT COUNT(*) FROM pws),
                (SELECT COUNT(*) FROM contaminant),
                (SELECT COUNT(*) FROM measurement),
                (SELECT COUNT(*) FROM zip_pws)",
            &[],
        )?;
        Ok(RowCounts {
            water_systems: row.get(0),
            contaminants: row.get(1),
            measurements: row.get(2),
            zip_coverage: row.get(3),
        })
    }

    fn crosswalk(&mut self) -> Result<Vec<ZipCoverage>, StoreError> {
        let rows = self.client.query(
            "SELECT zip, pwsid, pws_name, coverage_fraction
             FROM zip_pws
             ORDER BY zip, pws_name",
            &[],
        )?;
        Ok(rows.iter().map(coverage_from_row).collect())
    }

    fn measured_systems(&mut self) -> Result<Vec<String>, StoreError> {
        let rows = self.client.query(
            "SELECT DISTINCT p.name
             FROM measurement m
             JOIN pws p ON p.id = m.pws_id
             ORDER BY p.name",
            &[],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn cancel_token(&self) -> Option<postgres::CancelToken> {
        Some(self.client.cancel_token())
    }
}

impl CatalogWriter for PgStore {
    fn upsert_water_system(&mut self, system: &NewWaterSystem) -> Result<i32, StoreError> {
        // Identity and location never change once set; notes may be refreshed.
        let row = self.client.query_one(
            "INSERT INTO pws (name, pwsid, state, notes)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE SET
               pwsid = COALESCE(pws.pwsid, EXCLUDED.pwsid),
               state = COALESCE(pws.state, EXCLUDED.state),
               notes = COALESCE(EXCLUDED.notes, pws.notes)
             RETURNING id",
            &[&system.name, &system.pwsid, &system.state, &system.notes],
        )?;
        Ok(row.get(0))
    }

    fn upsert_contaminant(&mut self, name: &str) -> Result<i32, StoreError> {
        // DO UPDATE (rather than DO NOTHING) so RETURNING yields the existing id.
        let row = self.client.query_one(
            "INSERT INTO contaminant (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id",
            &[&name],
        )?;
        Ok(row.get(0))
    }

    fn replace_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, StoreError> {
        let mut tx = self.client.transaction()?;
        tx.execute("DELETE FROM measurement", &[])?;
        let insert = tx.prepare(
            "INSERT INTO measurement (pws_id, contaminant_id, year, value_ppb, basis, source_url)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )?;
        for row in rows {
            tx.execute(
                &insert,
                &[
                    &row.pws_id,
                    &row.contaminant_id,
                    &row.year,
                    &row.value_ppb,
                    &row.basis,
                    &row.source_url,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn replace_zip_coverage(&mut self, rows: &[ZipCoverage]) -> Result<usize, StoreError> {
        let mut tx = self.client.transaction()?;
        tx.execute("DELETE FROM zip_pws", &[])?;
        let insert = tx.prepare(
            "INSERT INTO zip_pws (zip, pwsid, pws_name, coverage_fraction)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (zip, pws_name) DO NOTHING",
        )?;
        let mut inserted = 0;
        for row in rows {
            let fraction = row.coverage_fraction.known();
            inserted += tx.execute(&insert, &[&row.zip, &row.pwsid, &row.pws_name, &fraction])?;
        }
        tx.commit()?;
        Ok(inserted as usize)
    }
}

// ---------------------------------------------------------------------------
// Opener
// ---------------------------------------------------------------------------

/// Hands out sessions from a bounded pool. At most `pool_size`
/// connections exist at once; a caller finding them all busy waits up to
/// the connect timeout and then gets `Unavailable`. Connections are pinged
/// on checkout, so one the server dropped is replaced, not handed out.
pub struct PgOpener {
    pool: r2d2::Pool<Manager>,
}

impl PgOpener {
    /// Builds the pool without connecting; the first `open` dials.
    pub fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let manager = PostgresConnectionManager::new(db::client_config(config)?, NoTls);
        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(0))
            .test_on_check_out(true)
            .max_lifetime(Some(Duration::from_secs(config.pool_max_lifetime_secs.max(1))))
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build_unchecked(manager);
        Ok(Self { pool })
    }

    /// Upper bound on sessions open at the same time.
    pub fn max_sessions(&self) -> u32 {
        self.pool.max_size()
    }

    /// Sessions currently checked out.
    pub fn sessions_in_use(&self) -> u32 {
        let state = self.pool.state();
        state.connections - state.idle_connections
    }
}

impl StoreOpener for PgOpener {
    fn open(&self) -> Result<Box<dyn MeasurementStore + Send>, StoreError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Unavailable(format!("no pooled connection: {}", e)))?;
        Ok(Box::new(PgStore {
            client: Session::Pooled(conn),
        }))
    }
}
