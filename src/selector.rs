//! Measurement selection: the single reading that represents current
//! exposure for one (water system, contaminant) pair.
//!
//! Multiple rows may exist for a pair (one per reporting year, plus
//! duplicate entries from repeated loads). The winner is decided by a
//! total order so the same store contents always yield the same pick:
//!
//!   1. dated before undated, later year before earlier year
//!   2. most recent `last_updated`
//!   3. smallest internal id

use std::cmp::Ordering;

use crate::model::{LookupError, MeasurementRecord};
use crate::store::MeasurementStore;

/// `Less` means `a` is more authoritative than `b`.
pub fn authority_order(a: &MeasurementRecord, b: &MeasurementRecord) -> Ordering {
    // Option orders None below Some, so reversing puts undated rows last.
    b.year
        .cmp(&a.year)
        .then_with(|| b.last_updated.cmp(&a.last_updated))
        .then_with(|| a.id.cmp(&b.id))
}

/// Picks the most authoritative candidate, or `None` if there are none.
pub fn select_latest<'a, I>(candidates: I) -> Option<&'a MeasurementRecord>
where
    I: IntoIterator<Item = &'a MeasurementRecord>,
{
    candidates.into_iter().min_by(|a, b| authority_order(a, b))
}

/// Looks up and selects the measurement for one pair. Absence is a normal
/// result, not an error.
pub fn select<S>(
    store: &mut S,
    pws_name: &str,
    contaminant: &str,
) -> Result<Option<MeasurementRecord>, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    let candidates = store.measurements_for_pair(pws_name, contaminant)?;
    Ok(select_latest(&candidates).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn record(id: i64, year: Option<i32>, last_updated: DateTime<Utc>) -> MeasurementRecord {
        MeasurementRecord {
            id,
            pws_name: "Baltimore City DPW".to_string(),
            contaminant: "TTHM".to_string(),
            year,
            value_ppb: id as f64,
            basis: None,
            source_url: None,
            last_updated,
        }
    }

    #[test]
    fn test_latest_year_wins() {
        let rows = [
            record(1, Some(2021), at(12)),
            record(2, Some(2023), at(9)),
            record(3, Some(2022), at(15)),
        ];
        assert_eq!(select_latest(&rows).unwrap().id, 2);
    }

    #[test]
    fn test_duplicate_year_falls_back_to_last_updated() {
        let rows = [record(1, Some(2023), at(9)), record(2, Some(2023), at(11))];
        assert_eq!(select_latest(&rows).unwrap().id, 2);
    }

    #[test]
    fn test_full_tie_picks_smallest_id() {
        let rows = [
            record(7, Some(2023), at(9)),
            record(3, Some(2023), at(9)),
            record(5, Some(2023), at(9)),
        ];
        assert_eq!(select_latest(&rows).unwrap().id, 3);
        // Input order must not matter.
        let reversed: Vec<_> = rows.iter().rev().cloned().collect();
        assert_eq!(select_latest(&reversed).unwrap().id, 3);
    }

    #[test]
    fn test_undated_rows_rank_below_any_dated_row() {
        let rows = [record(1, None, at(23)), record(2, Some(1990), at(1))];
        assert_eq!(select_latest(&rows).unwrap().id, 2);
    }

    #[test]
    fn test_undated_row_selected_when_nothing_is_dated() {
        let rows = [record(4, None, at(8)), record(9, None, at(10))];
        assert_eq!(select_latest(&rows).unwrap().id, 9);
    }

    #[test]
    fn test_no_candidates_is_absent() {
        let rows: [MeasurementRecord; 0] = [];
        assert!(select_latest(&rows).is_none());
    }

    #[test]
    fn test_select_reads_through_store() {
        let mut store = MemoryStore::new();
        store.add_measurement_at("Miami-Dade", "TTHM", Some(2022), 48.0, at(1));
        let latest = store.add_measurement_at("Miami-Dade", "TTHM", Some(2023), 51.0, at(1));
        store.add_measurement_at("Miami-Dade", "HAA5", Some(2024), 44.0, at(1));

        let picked = select(&mut store, "Miami-Dade", "TTHM").unwrap().unwrap();
        assert_eq!(picked.id, latest);
        assert_eq!(picked.value_ppb, 51.0);

        assert!(select(&mut store, "Miami-Dade", "Lead").unwrap().is_none());
        assert!(select(&mut store, "Houston", "TTHM").unwrap().is_none());
    }
}
