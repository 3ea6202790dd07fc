//! Query contract between the ranking core and the measurement store.
//!
//! Submodules:
//! - `pg`: the Postgres-backed store used in production.
//! - `memory`: an in-process store for tests and dry-run ingestion.
//!
//! The core never talks to a database directly; it reads through
//! [`MeasurementStore`] and ingestion writes through [`CatalogWriter`].

pub mod memory;
pub mod pg;

use serde::Serialize;
use thiserror::Error;

use crate::model::{MeasurementRecord, ZipCoverage};

pub use memory::MemoryStore;
pub use pg::{PgOpener, PgStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Connection refused, dropped, or a statement timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error.
    #[error("query failed: {0}")]
    Query(String),
    /// A write violated a uniqueness, range, or reference constraint.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

// ---------------------------------------------------------------------------
// Read contract
// ---------------------------------------------------------------------------

/// Table sizes, used by readiness checks and verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
    pub water_systems: i64,
    pub contaminants: i64,
    pub measurements: i64,
    pub zip_coverage: i64,
}

pub trait MeasurementStore {
    /// Crosswalk rows for one zip. Order is not significant.
    fn zip_coverage(&mut self, zip: &str) -> Result<Vec<ZipCoverage>, StoreError>;

    /// Every measurement for any of the named systems, in one round trip.
    fn measurements_for_systems(
        &mut self,
        pws_names: &[String],
    ) -> Result<Vec<MeasurementRecord>, StoreError>;

    /// Every measurement for one (system, contaminant) pair.
    fn measurements_for_pair(
        &mut self,
        pws_name: &str,
        contaminant: &str,
    ) -> Result<Vec<MeasurementRecord>, StoreError>;

    fn row_counts(&mut self) -> Result<RowCounts, StoreError>;

    /// The whole crosswalk, for verification.
    fn crosswalk(&mut self) -> Result<Vec<ZipCoverage>, StoreError>;

    /// Names of systems with at least one measurement.
    fn measured_systems(&mut self) -> Result<Vec<String>, StoreError>;

    /// Token that aborts whatever query this session is running.
    fn cancel_token(&self) -> Option<postgres::CancelToken> {
        None
    }
}

// ---------------------------------------------------------------------------
// Write contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NewWaterSystem {
    pub name: String,
    pub pwsid: Option<String>,
    pub state: Option<String>,
    pub notes: Option<String>,
}

/// A validated measurement row ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasurement {
    pub pws_id: i32,
    pub contaminant_id: i32,
    pub year: Option<i32>,
    pub value_ppb: f64,
    pub basis: Option<String>,
    pub source_url: Option<String>,
}

pub trait CatalogWriter {
    /// Inserts the system or fills in missing attributes of an existing one
    /// with the same name. Returns the internal id.
    fn upsert_water_system(&mut self, system: &NewWaterSystem) -> Result<i32, StoreError>;

    fn upsert_contaminant(&mut self, name: &str) -> Result<i32, StoreError>;

    /// Atomically replaces every stored measurement with `rows`.
    fn replace_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, StoreError>;

    /// Atomically replaces the whole crosswalk with `rows`.
    fn replace_zip_coverage(&mut self, rows: &[ZipCoverage]) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// Per-request sessions
// ---------------------------------------------------------------------------

/// Opens an independent store session. The HTTP layer takes one per request
/// so concurrent requests share no mutable state; the Postgres opener draws
/// them from a bounded pool.
pub trait StoreOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn MeasurementStore + Send>, StoreError>;
}
