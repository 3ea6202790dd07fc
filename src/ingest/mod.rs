//! Bulk loading of the measurement file and the zip-to-system crosswalk.
//!
//! Both files are parsed and validated in full before anything is written,
//! so a malformed crosswalk never leaves a half-replaced measurement table
//! behind. Rows that fail validation are dropped and reported with their
//! source line; they never abort the load.

pub mod csv;
pub mod measurements;
pub mod zipmap;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::IngestConfig;
use crate::logging::{self, LogSource};
use crate::store::{CatalogWriter, NewMeasurement, NewWaterSystem, StoreError};
use crate::systems;

pub const MEASUREMENTS_DATASET: &str = "measurements";
pub const ZIPMAP_DATASET: &str = "zipmap";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{dataset} line {line}: {message}")]
    Csv {
        dataset: &'static str,
        line: usize,
        message: String,
    },
    #[error("{dataset} file has no header row")]
    Empty { dataset: &'static str },
    #[error("{dataset} file is missing required columns: {}", columns.join(", "))]
    MissingColumns {
        dataset: &'static str,
        columns: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: String,
}

/// Outcome of validating one file's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub clamped: usize,
    pub rejected: Vec<RejectedRow>,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            clamped: 0,
            rejected: Vec::new(),
        }
    }
}

/// Per-row validation result used by the dataset parsers.
pub(crate) enum RowOutcome<T> {
    Accepted(T),
    Clamped(T),
    Rejected(String),
}

impl<T> Parsed<T> {
    pub(crate) fn record(&mut self, line: usize, outcome: RowOutcome<T>) {
        match outcome {
            RowOutcome::Accepted(row) => self.rows.push(row),
            RowOutcome::Clamped(row) => {
                self.clamped += 1;
                self.rows.push(row);
            }
            RowOutcome::Rejected(reason) => self.rejected.push(RejectedRow { line, reason }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetReport {
    pub total_rows: usize,
    pub loaded: usize,
    /// Rows loaded after a value was pulled back into range.
    pub clamped: usize,
    /// Crosswalk rows dropped because the (zip, system) pair already appeared.
    pub duplicates: usize,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub water_systems: usize,
    pub contaminants: usize,
    pub measurements: DatasetReport,
    pub zip_coverage: DatasetReport,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub fn ingest_files<W>(
    store: &mut W,
    data_path: &Path,
    zipmap_path: &Path,
    config: &IngestConfig,
) -> Result<IngestReport, IngestError>
where
    W: CatalogWriter + ?Sized,
{
    let data_csv = read_file(data_path)?;
    let zipmap_csv = read_file(zipmap_path)?;
    ingest(store, &data_csv, &zipmap_csv, config)
}

fn read_file(path: &Path) -> Result<String, IngestError> {
    std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads both datasets, replacing every stored measurement and crosswalk row.
///
/// Water systems named by either file are upserted by name, so ids survive
/// reloads. Systems are upserted in name order and contaminants likewise,
/// which keeps id assignment stable across runs of the same input.
pub fn ingest<W>(
    store: &mut W,
    data_csv: &str,
    zipmap_csv: &str,
    config: &IngestConfig,
) -> Result<IngestReport, IngestError>
where
    W: CatalogWriter + ?Sized,
{
    let data_table = csv::CsvTable::parse(MEASUREMENTS_DATASET, data_csv)?;
    let zip_table = csv::CsvTable::parse(ZIPMAP_DATASET, zipmap_csv)?;
    let measurement_rows = measurements::parse_rows(&data_table, config.out_of_range)?;
    let coverage_rows = zipmap::parse_rows(&zip_table, config)?;

    // -- Water systems ------------------------------------------------------

    let mut system_attrs: BTreeMap<String, NewWaterSystem> = BTreeMap::new();
    for row in &measurement_rows.rows {
        let entry = system_attrs
            .entry(row.pws.clone())
            .or_insert_with(|| bare_system(&row.pws));
        if entry.pwsid.is_none() {
            entry.pwsid = row.pwsid.clone();
        }
        if entry.state.is_none() {
            entry.state = row.state.clone();
        }
    }
    for row in &coverage_rows.rows {
        let entry = system_attrs
            .entry(row.pws_name.clone())
            .or_insert_with(|| bare_system(&row.pws_name));
        if entry.pwsid.is_none() {
            entry.pwsid = row.pwsid.clone();
        }
    }

    let mut system_ids = HashMap::new();
    for (name, mut system) in system_attrs {
        if let Some(known) = systems::find_system(&name) {
            system.state.get_or_insert_with(|| known.state.to_string());
            system.notes.get_or_insert_with(|| known.service_area.to_string());
        }
        let id = store.upsert_water_system(&system)?;
        system_ids.insert(name, id);
    }

    // -- Contaminants -------------------------------------------------------

    let contaminant_names: BTreeSet<&str> = measurement_rows
        .rows
        .iter()
        .map(|row| row.contaminant.as_str())
        .collect();
    let mut contaminant_ids = HashMap::new();
    for name in &contaminant_names {
        contaminant_ids.insert(*name, store.upsert_contaminant(name)?);
    }

    // -- Measurements -------------------------------------------------------

    let mut new_measurements = Vec::with_capacity(measurement_rows.rows.len());
    for row in &measurement_rows.rows {
        let (Some(&pws_id), Some(&contaminant_id)) = (
            system_ids.get(&row.pws),
            contaminant_ids.get(row.contaminant.as_str()),
        ) else {
            return Err(StoreError::Integrity(format!(
                "no id assigned for {} / {}",
                row.pws, row.contaminant
            ))
            .into());
        };
        new_measurements.push(NewMeasurement {
            pws_id,
            contaminant_id,
            year: row.year,
            value_ppb: row.value_ppb,
            basis: row.basis.clone(),
            source_url: row.source_url.clone(),
        });
    }
    let loaded_measurements = store.replace_measurements(&new_measurements)?;

    // -- Crosswalk ----------------------------------------------------------

    let mut seen = BTreeSet::new();
    let mut unique_coverage = Vec::with_capacity(coverage_rows.rows.len());
    let mut duplicates = 0;
    for row in coverage_rows.rows {
        if seen.insert((row.zip.clone(), row.pws_name.clone())) {
            unique_coverage.push(row);
        } else {
            duplicates += 1;
        }
    }
    let loaded_coverage = store.replace_zip_coverage(&unique_coverage)?;

    let report = IngestReport {
        water_systems: system_ids.len(),
        contaminants: contaminant_ids.len(),
        measurements: DatasetReport {
            total_rows: data_table.records.len(),
            loaded: loaded_measurements,
            clamped: measurement_rows.clamped,
            duplicates: 0,
            rejected: measurement_rows.rejected,
        },
        zip_coverage: DatasetReport {
            total_rows: zip_table.records.len(),
            loaded: loaded_coverage,
            clamped: coverage_rows.clamped,
            duplicates,
            rejected: coverage_rows.rejected,
        },
    };

    log_report(&report);
    Ok(report)
}

fn bare_system(name: &str) -> NewWaterSystem {
    NewWaterSystem {
        name: name.to_string(),
        pwsid: None,
        state: None,
        notes: None,
    }
}

fn log_report(report: &IngestReport) {
    for (dataset, summary) in [
        (MEASUREMENTS_DATASET, &report.measurements),
        (ZIPMAP_DATASET, &report.zip_coverage),
    ] {
        logging::log_ingest_summary(
            dataset,
            summary.total_rows,
            summary.loaded,
            summary.rejected.len(),
        );
        for rejected in &summary.rejected {
            logging::debug(
                LogSource::Ingest,
                None,
                &format!("{} line {} rejected: {}", dataset, rejected.line, rejected.reason),
            );
        }
    }
    logging::info(
        LogSource::Ingest,
        None,
        &format!(
            "catalog holds {} water systems and {} contaminants from this load",
            report.water_systems, report.contaminants
        ),
    );
}
