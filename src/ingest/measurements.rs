//! Measurement file rows: one reading per (system, contaminant, year).
//!
//! Required columns: `pws`, `contaminant`, `value_ppb`, `basis`, `year`,
//! `source_url`. Optional: `pwsid`, `state`.

use crate::config::OutOfRangePolicy;
use crate::ingest::csv::{CsvRecord, CsvTable};
use crate::ingest::{IngestError, MEASUREMENTS_DATASET, Parsed, RowOutcome};
use crate::model::{YEAR_MAX, YEAR_MIN, is_valid_year};

pub const REQUIRED_COLUMNS: &[&str] = &["pws", "contaminant", "value_ppb", "basis", "year", "source_url"];

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub pws: String,
    pub pwsid: Option<String>,
    pub state: Option<String>,
    pub contaminant: String,
    pub year: Option<i32>,
    pub value_ppb: f64,
    pub basis: Option<String>,
    pub source_url: Option<String>,
}

pub fn parse_rows(table: &CsvTable, policy: OutOfRangePolicy) -> Result<Parsed<MeasurementRow>, IngestError> {
    table.require_columns(MEASUREMENTS_DATASET, REQUIRED_COLUMNS)?;

    let mut parsed = Parsed::default();
    for record in &table.records {
        parsed.record(record.line, parse_row(table, record, policy));
    }
    Ok(parsed)
}

fn parse_row(table: &CsvTable, record: &CsvRecord, policy: OutOfRangePolicy) -> RowOutcome<MeasurementRow> {
    if record.fields.len() > table.headers.len() {
        return RowOutcome::Rejected(format!(
            "expected {} fields, found {}",
            table.headers.len(),
            record.fields.len()
        ));
    }

    let Some(pws) = table.get(record, "pws") else {
        return RowOutcome::Rejected("pws is blank".to_string());
    };
    let Some(contaminant) = table.get(record, "contaminant") else {
        return RowOutcome::Rejected("contaminant is blank".to_string());
    };

    let value_ppb = match table.get(record, "value_ppb").map(str::parse::<f64>) {
        None => return RowOutcome::Rejected("value_ppb is missing".to_string()),
        Some(Ok(v)) if v.is_finite() => v,
        Some(_) => return RowOutcome::Rejected("value_ppb is not a number".to_string()),
    };

    let state = match table.get(record, "state") {
        None => None,
        Some(s) if s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(s.to_ascii_uppercase())
        }
        Some(s) => return RowOutcome::Rejected(format!("state '{}' is not a two-letter code", s)),
    };

    let mut clamped = false;

    let value_ppb = if value_ppb < 0.0 {
        match policy {
            OutOfRangePolicy::Reject => {
                return RowOutcome::Rejected(format!("value_ppb {} is negative", value_ppb));
            }
            OutOfRangePolicy::Clamp => {
                clamped = true;
                0.0
            }
        }
    } else {
        value_ppb
    };

    let year = match table.get(record, "year").and_then(parse_year) {
        Some(y) if !is_valid_year(y) => match policy {
            OutOfRangePolicy::Reject => {
                return RowOutcome::Rejected(format!(
                    "year {} outside {}..={}",
                    y, YEAR_MIN, YEAR_MAX
                ));
            }
            OutOfRangePolicy::Clamp => {
                clamped = true;
                None
            }
        },
        other => other,
    };

    let row = MeasurementRow {
        pws: pws.to_string(),
        pwsid: table.get(record, "pwsid").map(str::to_string),
        state,
        contaminant: contaminant.to_string(),
        year,
        value_ppb,
        basis: table.get(record, "basis").map(str::to_string),
        source_url: table.get(record, "source_url").map(str::to_string),
    };

    if clamped {
        RowOutcome::Clamped(row)
    } else {
        RowOutcome::Accepted(row)
    }
}

/// Integer years, tolerating spreadsheet exports like `2023.0`. Anything
/// else reads as an undated row.
fn parse_year(cell: &str) -> Option<i32> {
    if let Ok(year) = cell.parse::<i32>() {
        return Some(year);
    }
    let value = cell.parse::<f64>().ok()?;
    if value.fract() == 0.0 && value.abs() < i32::MAX as f64 {
        Some(value as i32)
    } else {
        None
    }
}
