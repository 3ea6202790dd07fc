//! Core data types for the zip code contaminant service.
//!
//! This module defines the shared domain model imported by all other modules:
//! catalog entities, crosswalk rows, selected measurements, ranked estimates
//! and the lookup error taxonomy. It performs no I/O.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// Earliest reporting year accepted for a measurement.
pub const YEAR_MIN: i32 = 1900;

/// Latest reporting year accepted for a measurement.
pub const YEAR_MAX: i32 = 2100;

/// Number of digits in a US zip code.
pub const ZIP_LEN: usize = 5;

/// Returns `true` if `zip` is exactly five ASCII digits.
pub fn is_valid_zip(zip: &str) -> bool {
    zip.len() == ZIP_LEN && zip.bytes().all(|b| b.is_ascii_digit())
}

/// Rejects malformed zips before anything touches the store.
pub fn validate_zip(zip: &str) -> Result<(), LookupError> {
    if is_valid_zip(zip) {
        Ok(())
    } else {
        Err(LookupError::InvalidInput(format!(
            "ZIP must be 5 digits, got '{}'",
            zip
        )))
    }
}

pub fn is_valid_year(year: i32) -> bool {
    (YEAR_MIN..=YEAR_MAX).contains(&year)
}

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

/// A public water system (PWS).
///
/// `name` is the de facto join key: crosswalk rows reference systems by
/// display name because many systems have no stable `pwsid`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaterSystem {
    pub id: i32,
    pub pwsid: Option<String>,
    pub name: String,
    pub state: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contaminant {
    pub id: i32,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// Share of a zip code's population served by one water system.
///
/// `Unknown` is a real state of the crosswalk data, not a stand-in for
/// zero or one. Serialized as the number itself or the string `"unknown"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoverageFraction {
    Known(f64),
    Unknown,
}

impl CoverageFraction {
    pub fn known(self) -> Option<f64> {
        match self {
            CoverageFraction::Known(fraction) => Some(fraction),
            CoverageFraction::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, CoverageFraction::Known(_))
    }
}

impl From<Option<f64>> for CoverageFraction {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(fraction) => CoverageFraction::Known(fraction),
            None => CoverageFraction::Unknown,
        }
    }
}

impl Serialize for CoverageFraction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CoverageFraction::Known(fraction) => serializer.serialize_f64(*fraction),
            CoverageFraction::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// One row of the zip-to-system crosswalk. Unique on `(zip, pws_name)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZipCoverage {
    pub zip: String,
    pub pwsid: Option<String>,
    pub pws_name: String,
    pub coverage_fraction: CoverageFraction,
}

/// A water system serving a zip, as returned by the coverage resolver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServingSystem {
    pub pws_name: String,
    pub pwsid: Option<String>,
    pub coverage_fraction: CoverageFraction,
}

impl From<ZipCoverage> for ServingSystem {
    fn from(row: ZipCoverage) -> Self {
        ServingSystem {
            pws_name: row.pws_name,
            pwsid: row.pwsid,
            coverage_fraction: row.coverage_fraction,
        }
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// A stored measurement joined with its system and contaminant names.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub id: i64,
    pub pws_name: String,
    pub contaminant: String,
    pub year: Option<i32>,
    pub value_ppb: f64,
    pub basis: Option<String>,
    pub source_url: Option<String>,
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ranked output
// ---------------------------------------------------------------------------

/// How a per-zip estimate was derived from its contributors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMethod {
    /// Coverage-fraction weighted mean over contributors with known fractions.
    Weighted,
    /// Plain mean, used when no contributor carries a usable weight.
    UnweightedFallback,
}

/// Provenance for one water system's share of an estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contribution {
    pub pws_name: String,
    pub pwsid: Option<String>,
    pub value_ppb: f64,
    pub coverage_fraction: CoverageFraction,
    /// Whether this value carried weight in the estimate. Systems with an
    /// unknown or zero fraction are listed but not weighted.
    pub weighted: bool,
    pub year: Option<i32>,
    pub basis: Option<String>,
    pub source_url: Option<String>,
}

/// Combined estimate for one contaminant across every system serving a zip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContaminantEstimate {
    pub contaminant: String,
    pub estimate_ppb: f64,
    pub method: CombinationMethod,
    pub low_confidence: bool,
    pub contributions: Vec<Contribution>,
}

/// Full ranking result for one zip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZipRanking {
    pub zip: String,
    pub systems: Vec<ServingSystem>,
    pub contaminants: Vec<ContaminantEstimate>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures surfaced by the lookup and ranking operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    /// Malformed zip, non-positive result count, or another bad argument.
    /// Always raised before the store is touched.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No water system serves the zip. An expected outcome.
    #[error("not found: {0}")]
    NotFound(String),
    /// The store could not be reached or a query timed out.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    /// The store answered with an error that is not an availability problem.
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for LookupError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LookupError::DependencyUnavailable(msg),
            other => LookupError::Store(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_digit_zips_are_valid() {
        assert!(is_valid_zip("21201"));
        assert!(is_valid_zip("00000"));
    }

    #[test]
    fn test_malformed_zips_are_rejected() {
        for zip in ["1234", "123456", "2120a", "", " 2120", "２１２０１"] {
            assert!(!is_valid_zip(zip), "'{}' should not be a valid zip", zip);
            assert!(matches!(validate_zip(zip), Err(LookupError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_year_range_is_inclusive() {
        assert!(is_valid_year(YEAR_MIN));
        assert!(is_valid_year(YEAR_MAX));
        assert!(!is_valid_year(YEAR_MIN - 1));
        assert!(!is_valid_year(YEAR_MAX + 1));
    }

    #[test]
    fn test_coverage_fraction_serializes_unknown_as_string() {
        let known = serde_json::to_value(CoverageFraction::Known(0.25)).unwrap();
        let unknown = serde_json::to_value(CoverageFraction::Unknown).unwrap();
        assert_eq!(known, serde_json::json!(0.25));
        assert_eq!(unknown, serde_json::json!("unknown"));
    }

    #[test]
    fn test_missing_fraction_maps_to_unknown_not_zero() {
        assert_eq!(CoverageFraction::from(None), CoverageFraction::Unknown);
        assert_eq!(CoverageFraction::from(Some(0.0)), CoverageFraction::Known(0.0));
        assert_eq!(CoverageFraction::Unknown.known(), None);
    }

    #[test]
    fn test_store_unavailability_maps_to_dependency_unavailable() {
        let err: LookupError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, LookupError::DependencyUnavailable(_)));

        let err: LookupError = StoreError::Query("relation does not exist".into()).into();
        assert!(matches!(err, LookupError::Store(_)));
    }

    #[test]
    fn test_combination_method_wire_names() {
        assert_eq!(
            serde_json::to_value(CombinationMethod::UnweightedFallback).unwrap(),
            serde_json::json!("unweighted_fallback")
        );
        assert_eq!(
            serde_json::to_value(CombinationMethod::Weighted).unwrap(),
            serde_json::json!("weighted")
        );
    }
}
