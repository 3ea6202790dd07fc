//! In-process measurement store.
//!
//! Behaves like the Postgres store for everything the core relies on:
//! serial ids, upsert-by-name, whole-table replacement and the
//! `(zip, pws_name)` uniqueness of the crosswalk. Used by the test suites
//! and by `zipwater ingest --dry-run`.

use chrono::{DateTime, Utc};

use crate::model::{Contaminant, CoverageFraction, MeasurementRecord, WaterSystem, ZipCoverage};
use crate::store::{
    CatalogWriter, MeasurementStore, NewMeasurement, NewWaterSystem, RowCounts, StoreError,
    StoreOpener,
};

#[derive(Debug, Clone, PartialEq)]
struct StoredMeasurement {
    id: i64,
    pws_id: i32,
    contaminant_id: i32,
    year: Option<i32>,
    value_ppb: f64,
    basis: Option<String>,
    source_url: Option<String>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    systems: Vec<WaterSystem>,
    contaminants: Vec<Contaminant>,
    measurements: Vec<StoredMeasurement>,
    coverage: Vec<ZipCoverage>,
    next_measurement_id: i64,
    offline: bool,
    measurements_offline: bool,
    reads: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails as if the database were down.
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Coverage reads succeed but measurement reads fail, as when the
    /// database goes away partway through a request.
    pub fn failing_measurement_reads(mut self) -> Self {
        self.measurements_offline = true;
        self
    }

    /// Number of read calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads
    }

    pub fn find_water_system(&self, name: &str) -> Option<&WaterSystem> {
        self.systems.iter().find(|s| s.name == name)
    }

    // -- Seeding helpers ----------------------------------------------------

    /// Adds a crosswalk row, replacing any existing row for the same
    /// `(zip, pws_name)`.
    pub fn add_coverage(&mut self, zip: &str, pws_name: &str, fraction: Option<f64>) {
        self.coverage.retain(|row| !(row.zip == zip && row.pws_name == pws_name));
        self.coverage.push(ZipCoverage {
            zip: zip.to_string(),
            pwsid: None,
            pws_name: pws_name.to_string(),
            coverage_fraction: CoverageFraction::from(fraction),
        });
    }

    /// Adds a measurement stamped with the current time. Returns its id.
    pub fn add_measurement(
        &mut self,
        pws_name: &str,
        contaminant: &str,
        year: Option<i32>,
        value_ppb: f64,
    ) -> i64 {
        self.add_measurement_at(pws_name, contaminant, year, value_ppb, Utc::now())
    }

    pub fn add_measurement_at(
        &mut self,
        pws_name: &str,
        contaminant: &str,
        year: Option<i32>,
        value_ppb: f64,
        last_updated: DateTime<Utc>,
    ) -> i64 {
        let pws_id = self.system_id_for(&NewWaterSystem {
            name: pws_name.to_string(),
            pwsid: None,
            state: None,
            notes: None,
        });
        let contaminant_id = self.contaminant_id_for(contaminant);
        self.push_measurement(
            &NewMeasurement {
                pws_id,
                contaminant_id,
                year,
                value_ppb,
                basis: Some("running annual average".to_string()),
                source_url: Some(format!("memory://{}/{}", pws_name, contaminant)),
            },
            last_updated,
        )
    }

    // -- Internals ----------------------------------------------------------

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn begin_read(&mut self) -> Result<(), StoreError> {
        self.reads += 1;
        self.check_online()
    }

    fn system_id_for(&mut self, system: &NewWaterSystem) -> i32 {
        if let Some(existing) = self.systems.iter_mut().find(|s| s.name == system.name) {
            if existing.pwsid.is_none() {
                existing.pwsid = system.pwsid.clone();
            }
            if existing.state.is_none() {
                existing.state = system.state.clone();
            }
            if system.notes.is_some() {
                existing.notes = system.notes.clone();
            }
            return existing.id;
        }
        let id = self.systems.len() as i32 + 1;
        self.systems.push(WaterSystem {
            id,
            pwsid: system.pwsid.clone(),
            name: system.name.clone(),
            state: system.state.clone(),
            notes: system.notes.clone(),
        });
        id
    }

    fn contaminant_id_for(&mut self, name: &str) -> i32 {
        if let Some(existing) = self.contaminants.iter().find(|c| c.name == name) {
            return existing.id;
        }
        let id = self.contaminants.len() as i32 + 1;
        self.contaminants.push(Contaminant {
            id,
            name: name.to_string(),
        });
        id
    }

    fn push_measurement(&mut self, row: &NewMeasurement, last_updated: DateTime<Utc>) -> i64 {
        self.next_measurement_id += 1;
        let id = self.next_measurement_id;
        self.measurements.push(StoredMeasurement {
            id,
            pws_id: row.pws_id,
            contaminant_id: row.contaminant_id,
            year: row.year,
            value_ppb: row.value_ppb,
            basis: row.basis.clone(),
            source_url: row.source_url.clone(),
            last_updated,
        });
        id
    }

    fn system_name(&self, id: i32) -> Option<&str> {
        self.systems.iter().find(|s| s.id == id).map(|s| s.name.as_str())
    }

    fn contaminant_name(&self, id: i32) -> Option<&str> {
        self.contaminants.iter().find(|c| c.id == id).map(|c| c.name.as_str())
    }

    fn records_where<F>(&self, keep: F) -> Vec<MeasurementRecord>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut records: Vec<MeasurementRecord> = self
            .measurements
            .iter()
            .filter_map(|m| {
                let pws_name = self.system_name(m.pws_id)?;
                let contaminant = self.contaminant_name(m.contaminant_id)?;
                if !keep(pws_name, contaminant) {
                    return None;
                }
                Some(MeasurementRecord {
                    id: m.id,
                    pws_name: pws_name.to_string(),
                    contaminant: contaminant.to_string(),
                    year: m.year,
                    value_ppb: m.value_ppb,
                    basis: m.basis.clone(),
                    source_url: m.source_url.clone(),
                    last_updated: m.last_updated,
                })
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

impl MeasurementStore for MemoryStore {
    fn zip_coverage(&mut self, zip: &str) -> Result<Vec<ZipCoverage>, StoreError> {
        self.begin_read()?;
        Ok(self.coverage.iter().filter(|row| row.zip == zip).cloned().collect())
    }

    fn measurements_for_systems(
        &mut self,
        pws_names: &[String],
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.begin_read()?;
        if self.measurements_offline {
            return Err(StoreError::Unavailable("measurement read dropped".to_string()));
        }
        Ok(self.records_where(|pws, _| pws_names.iter().any(|name| name == pws)))
    }

    fn measurements_for_pair(
        &mut self,
        pws_name: &str,
        contaminant: &str,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.begin_read()?;
        Ok(self.records_where(|pws, c| pws == pws_name && c == contaminant))
    }

    fn row_counts(&mut self) -> Result<RowCounts, StoreError> {
        self.begin_read()?;
        Ok(RowCounts {
            water_systems: self.systems.len() as i64,
            contaminants: self.contaminants.len() as i64,
            measurements: self.measurements.len() as i64,
            zip_coverage: self.coverage.len() as i64,
        })
    }

    fn crosswalk(&mut self) -> Result<Vec<ZipCoverage>, StoreError> {
        self.begin_read()?;
        let mut rows = self.coverage.clone();
        rows.sort_by(|a, b| (&a.zip, &a.pws_name).cmp(&(&b.zip, &b.pws_name)));
        Ok(rows)
    }

    fn measured_systems(&mut self) -> Result<Vec<String>, StoreError> {
        self.begin_read()?;
        let mut names: Vec<String> = self
            .measurements
            .iter()
            .filter_map(|m| self.system_name(m.pws_id).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

impl CatalogWriter for MemoryStore {
    fn upsert_water_system(&mut self, system: &NewWaterSystem) -> Result<i32, StoreError> {
        self.check_online()?;
        Ok(self.system_id_for(system))
    }

    fn upsert_contaminant(&mut self, name: &str) -> Result<i32, StoreError> {
        self.check_online()?;
        Ok(self.contaminant_id_for(name))
    }

    fn replace_measurements(&mut self, rows: &[NewMeasurement]) -> Result<usize, StoreError> {
        self.check_online()?;
        for row in rows {
            if self.system_name(row.pws_id).is_none() {
                return Err(StoreError::Integrity(format!("unknown pws id {}", row.pws_id)));
            }
            if self.contaminant_name(row.contaminant_id).is_none() {
                return Err(StoreError::Integrity(format!(
                    "unknown contaminant id {}",
                    row.contaminant_id
                )));
            }
        }
        self.measurements.clear();
        let now = Utc::now();
        for row in rows {
            self.push_measurement(row, now);
        }
        Ok(rows.len())
    }

    fn replace_zip_coverage(&mut self, rows: &[ZipCoverage]) -> Result<usize, StoreError> {
        self.check_online()?;
        self.coverage.clear();
        let mut inserted = 0;
        for row in rows {
            let duplicate = self
                .coverage
                .iter()
                .any(|existing| existing.zip == row.zip && existing.pws_name == row.pws_name);
            if !duplicate {
                self.coverage.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// Every session sees a snapshot of this store.
impl StoreOpener for MemoryStore {
    fn open(&self) -> Result<Box<dyn MeasurementStore + Send>, StoreError> {
        self.check_online()?;
        Ok(Box::new(self.clone()))
    }
}
