//! Data Verification Module
//!
//! Checks a loaded store for gaps that make rankings less useful without
//! making them wrong: crosswalk systems that have no measurements at all,
//! and zips whose known coverage fractions add up to more than the whole
//! zip. Nothing here corrects data; the report is informational.
//!
//! Run after every ingest, before pointing the service at a new database.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::Serialize;

use crate::model::ZipCoverage;
use crate::store::{MeasurementStore, RowCounts, StoreError};

/// Fraction sums within this distance of 1.0 are rounding, not overlap.
const FRACTION_SUM_TOLERANCE: f64 = 1e-6;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub counts: RowCounts,
    /// Systems named in the crosswalk with no measurement rows.
    pub unmeasured_systems: Vec<String>,
    pub overcovered_zips: Vec<OvercoveredZip>,
    pub status: VerificationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OvercoveredZip {
    pub zip: String,
    pub fraction_sum: f64,
    pub systems: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub enum VerificationStatus {
    Success,
    PartialSuccess,
    Failed,
}

// ============================================================================
// Checks
// ============================================================================

/// Crosswalk systems absent from `measured`, sorted and deduplicated.
pub fn unmeasured_systems(crosswalk: &[ZipCoverage], measured: &[String]) -> Vec<String> {
    let measured: BTreeSet<&str> = measured.iter().map(String::as_str).collect();
    crosswalk
        .iter()
        .map(|row| row.pws_name.as_str())
        .filter(|name| !measured.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Zips whose known fractions sum above 1. Unknown fractions are ignored.
pub fn overcovered_zips(crosswalk: &[ZipCoverage]) -> Vec<OvercoveredZip> {
    let mut by_zip: BTreeMap<&str, (f64, Vec<String>)> = BTreeMap::new();
    for row in crosswalk {
        if let Some(fraction) = row.coverage_fraction.known() {
            let entry = by_zip.entry(row.zip.as_str()).or_default();
            entry.0 += fraction;
            entry.1.push(row.pws_name.clone());
        }
    }

    by_zip
        .into_iter()
        .filter(|(_, (sum, _))| *sum > 1.0 + FRACTION_SUM_TOLERANCE)
        .map(|(zip, (fraction_sum, mut systems))| {
            systems.sort();
            OvercoveredZip {
                zip: zip.to_string(),
                fraction_sum,
                systems,
            }
        })
        .collect()
}

fn overall_status(counts: &RowCounts, unmeasured: &[String], overcovered: &[OvercoveredZip]) -> VerificationStatus {
    if counts.measurements == 0 || counts.zip_coverage == 0 {
        VerificationStatus::Failed
    } else if unmeasured.is_empty() && overcovered.is_empty() {
        VerificationStatus::Success
    } else {
        VerificationStatus::PartialSuccess
    }
}

// ============================================================================
// Full Verification Runner
// ============================================================================

pub fn run_verification<S>(store: &mut S) -> Result<VerificationReport, StoreError>
where
    S: MeasurementStore + ?Sized,
{
    let counts = store.row_counts()?;
    let crosswalk = store.crosswalk()?;
    let measured = store.measured_systems()?;

    let unmeasured_systems = unmeasured_systems(&crosswalk, &measured);
    let overcovered_zips = overcovered_zips(&crosswalk);
    let status = overall_status(&counts, &unmeasured_systems, &overcovered_zips);

    Ok(VerificationReport {
        timestamp: Utc::now().to_rfc3339(),
        counts,
        unmeasured_systems,
        overcovered_zips,
        status,
    })
}

pub fn print_summary(report: &VerificationReport) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("📊 VERIFICATION SUMMARY");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Water systems:    {}", report.counts.water_systems);
    println!("Contaminants:     {}", report.counts.contaminants);
    println!("Measurements:     {}", report.counts.measurements);
    println!("Crosswalk rows:   {}", report.counts.zip_coverage);
    println!();

    if report.unmeasured_systems.is_empty() {
        println!("✓ Every crosswalk system has measurements");
    } else {
        println!("⚠ {} crosswalk system(s) without measurements:", report.unmeasured_systems.len());
        for name in &report.unmeasured_systems {
            println!("    {}", name);
        }
    }

    if report.overcovered_zips.is_empty() {
        println!("✓ No zip has known coverage above 100%");
    } else {
        println!("⚠ {} zip(s) with coverage fractions summing above 1:", report.overcovered_zips.len());
        for zip in &report.overcovered_zips {
            println!("    {}  sum {:.3}  ({})", zip.zip, zip.fraction_sum, zip.systems.join(", "));
        }
    }

    println!();
    let verdict = match report.status {
        VerificationStatus::Success => "✓ OK",
        VerificationStatus::PartialSuccess => "⚠ Usable with gaps",
        VerificationStatus::Failed => "✗ FAILED: store has no measurements or no crosswalk",
    };
    println!("Status: {}", verdict);
    println!("═══════════════════════════════════════════════════════════");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_clean_store_passes() {
        let mut store = MemoryStore::new();
        store.add_coverage("21201", "Baltimore City DPW", Some(0.99));
        store.add_measurement("Baltimore City DPW", "TTHM", Some(2023), 72.0);

        let report = run_verification(&mut store).unwrap();
        assert_eq!(report.status, VerificationStatus::Success);
        assert_eq!(report.counts.zip_coverage, 1);
        assert!(report.unmeasured_systems.is_empty());
    }

    #[test]
    fn test_unmeasured_systems_reported_once() {
        let mut store = MemoryStore::new();
        store.add_coverage("20850", "WSSC", Some(0.7));
        store.add_coverage("20852", "WSSC", Some(0.9));
        store.add_coverage("20850", "Rockville", None);
        store.add_measurement("Rockville", "Lead", Some(2023), 1.0);

        let report = run_verification(&mut store).unwrap();
        assert_eq!(report.unmeasured_systems, ["WSSC"]);
        assert_eq!(report.status, VerificationStatus::PartialSuccess);
    }

    #[test]
    fn test_overcovered_zip_ignores_unknown_fractions() {
        let mut store = MemoryStore::new();
        store.add_coverage("20850", "WSSC", Some(0.8));
        store.add_coverage("20850", "Rockville", Some(0.4));
        store.add_coverage("20850", "Aqua", None);
        store.add_coverage("21201", "Baltimore City DPW", Some(0.99));
        store.add_coverage("21201", "Aqua", None);

        let crosswalk = store.crosswalk().unwrap();
        let flagged = overcovered_zips(&crosswalk);
        assert_eq!(flagged.len(), 1, "only 20850 exceeds 1: {:?}", flagged);
        assert_eq!(flagged[0].zip, "20850");
        assert!((flagged[0].fraction_sum - 1.2).abs() < 1e-9);
        assert_eq!(flagged[0].systems, ["Rockville", "WSSC"]);
    }

    #[test]
    fn test_rounding_above_one_is_not_flagged() {
        let mut store = MemoryStore::new();
        store.add_coverage("10001", "A", Some(0.1));
        store.add_coverage("10001", "B", Some(0.2));
        store.add_coverage("10001", "C", Some(0.7));
        let crosswalk = store.crosswalk().unwrap();
        assert!(overcovered_zips(&crosswalk).is_empty());
    }

    #[test]
    fn test_empty_store_fails() {
        let mut store = MemoryStore::new();
        let report = run_verification(&mut store).unwrap();
        assert_eq!(report.status, VerificationStatus::Failed);
    }

    #[test]
    fn test_offline_store_is_an_error() {
        let mut store = MemoryStore::offline();
        assert!(matches!(run_verification(&mut store), Err(StoreError::Unavailable(_))));
    }
}
