//! Crosswalk file rows: which water systems serve which zip.
//!
//! Required columns: `zip`, `pws`. Optional: `pwsid`, `coverage_fraction`.
//! A missing or empty fraction is loaded as unknown.

use crate::config::{IngestConfig, OutOfRangePolicy};
use crate::ingest::csv::{CsvRecord, CsvTable};
use crate::ingest::{IngestError, Parsed, RowOutcome, ZIPMAP_DATASET};
use crate::model::{CoverageFraction, ZIP_LEN, ZipCoverage, is_valid_zip};

pub const REQUIRED_COLUMNS: &[&str] = &["zip", "pws"];

/// Canonical five-digit form of `raw`, or `None` if it cannot be one.
///
/// Spreadsheets strip leading zeros from New England and New Jersey zips,
/// so with `pad_short` a 3 or 4 digit value is left-padded.
pub fn normalize_zip(raw: &str, pad_short: bool) -> Option<String> {
    let raw = raw.trim();
    if is_valid_zip(raw) {
        return Some(raw.to_string());
    }
    let all_digits = !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());
    if pad_short && all_digits && (3..ZIP_LEN).contains(&raw.len()) {
        return Some(format!("{:0>width$}", raw, width = ZIP_LEN));
    }
    None
}

pub fn parse_rows(table: &CsvTable, config: &IngestConfig) -> Result<Parsed<ZipCoverage>, IngestError> {
    table.require_columns(ZIPMAP_DATASET, REQUIRED_COLUMNS)?;

    let mut parsed = Parsed::default();
    for record in &table.records {
        parsed.record(record.line, parse_row(table, record, config));
    }
    Ok(parsed)
}

fn parse_row(table: &CsvTable, record: &CsvRecord, config: &IngestConfig) -> RowOutcome<ZipCoverage> {
    if record.fields.len() > table.headers.len() {
        return RowOutcome::Rejected(format!(
            "expected {} fields, found {}",
            table.headers.len(),
            record.fields.len()
        ));
    }

    let Some(raw_zip) = table.get(record, "zip") else {
        return RowOutcome::Rejected("zip is blank".to_string());
    };
    let Some(zip) = normalize_zip(raw_zip, config.pad_short_zips) else {
        return RowOutcome::Rejected(format!("zip '{}' is not a 5-digit code", raw_zip));
    };
    let Some(pws_name) = table.get(record, "pws") else {
        return RowOutcome::Rejected("pws is blank".to_string());
    };

    let mut clamped = false;
    let coverage_fraction = match table.get(record, "coverage_fraction") {
        None => CoverageFraction::Unknown,
        Some(cell) => match cell.parse::<f64>() {
            Ok(f) if f.is_nan() => {
                return RowOutcome::Rejected("coverage_fraction is not a number".to_string());
            }
            Ok(f) if (0.0..=1.0).contains(&f) => CoverageFraction::Known(f),
            Ok(f) => match config.out_of_range {
                OutOfRangePolicy::Reject => {
                    return RowOutcome::Rejected(format!(
                        "coverage_fraction {} outside [0, 1]",
                        cell
                    ));
                }
                OutOfRangePolicy::Clamp => {
                    clamped = true;
                    CoverageFraction::Known(f.clamp(0.0, 1.0))
                }
            },
            Err(_) => {
                return RowOutcome::Rejected(format!("coverage_fraction '{}' is not a number", cell));
            }
        },
    };

    let row = ZipCoverage {
        zip,
        pwsid: table.get(record, "pwsid").map(str::to_string),
        pws_name: pws_name.to_string(),
        coverage_fraction,
    };

    if clamped {
        RowOutcome::Clamped(row)
    } else {
        RowOutcome::Accepted(row)
    }
}
