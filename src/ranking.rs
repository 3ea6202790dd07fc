//! Coverage-weighted contaminant aggregation and ranking.
//!
//! For a zip served by several water systems, each contaminant's estimate is
//! the coverage-weighted mean of the systems' selected measurements:
//!
//!   estimate = Σ(value_i × fraction_i) / Σ(fraction_i)
//!
//! over contributing systems with a known fraction. Systems whose fraction
//! is unknown are reported in the provenance but never weighted. When no
//! contributor carries weight, the plain mean of all contributing values is
//! reported instead and flagged low-confidence.
//!
//! A contaminant nobody measured is left out entirely. Missing data is
//! never reported as a zero concentration.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::coverage;
use crate::logging::{self, LogSource};
use crate::model::{
    CombinationMethod, ContaminantEstimate, Contribution, CoverageFraction, LookupError,
    MeasurementRecord, ServingSystem, ZipRanking, is_valid_year, validate_zip,
};
use crate::selector;
use crate::store::MeasurementStore;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RankRequest {
    pub zip: String,
    pub top_n: i64,
    /// Restrict selection to measurements reported for this year.
    pub year: Option<i32>,
    /// Rank for this one system only, by exact display name.
    pub pws: Option<String>,
}

impl RankRequest {
    pub fn new(zip: &str, top_n: i64) -> Self {
        Self {
            zip: zip.to_string(),
            top_n,
            year: None,
            pws: None,
        }
    }

    pub fn for_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn for_system(mut self, pws_name: &str) -> Self {
        self.pws = Some(pws_name.to_string());
        self
    }

    /// Argument checks, done before the store is touched.
    pub fn validate(&self) -> Result<(), LookupError> {
        validate_zip(&self.zip)?;
        if self.top_n < 1 {
            return Err(LookupError::InvalidInput(format!(
                "top_n must be at least 1, got {}",
                self.top_n
            )));
        }
        if let Some(year) = self.year {
            if !is_valid_year(year) {
                return Err(LookupError::InvalidInput(format!("year {} is out of range", year)));
            }
        }
        if self.pws.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(LookupError::InvalidInput("pws must not be blank".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Highest estimate first; equal estimates by contaminant name.
pub fn estimate_order(a: &ContaminantEstimate, b: &ContaminantEstimate) -> Ordering {
    b.estimate_ppb
        .total_cmp(&a.estimate_ppb)
        .then_with(|| a.contaminant.cmp(&b.contaminant))
}

/// The `top_n` highest-ranked contaminants for `zip`.
pub fn rank<S>(store: &mut S, zip: &str, top_n: i64) -> Result<Vec<ContaminantEstimate>, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    rank_zip(store, &RankRequest::new(zip, top_n)).map(|ranking| ranking.contaminants)
}

/// The systems a request ranks over.
///
/// With `pws` set, only that system is kept. A system the zip's crosswalk
/// does not list is still used, with its coverage unknown.
fn resolve_systems<S>(store: &mut S, request: &RankRequest) -> Result<Vec<ServingSystem>, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    let zip = request.zip.as_str();
    let systems = coverage::resolve(store, zip)?;

    let Some(pinned) = request.pws.as_deref() else {
        if systems.is_empty() {
            return Err(LookupError::NotFound(format!("No PWS mapping found for ZIP {}.", zip)));
        }
        return Ok(systems);
    };

    match systems.into_iter().find(|s| s.pws_name == pinned) {
        Some(system) => Ok(vec![system]),
        None => {
            logging::debug(
                LogSource::Engine,
                Some(zip),
                &format!("{} is not mapped to this zip; coverage unknown", pinned),
            );
            Ok(vec![ServingSystem {
                pws_name: pinned.to_string(),
                pwsid: None,
                coverage_fraction: CoverageFraction::Unknown,
            }])
        }
    }
}

/// Full ranking, including the resolved systems.
///
/// Two store round trips: one for coverage, one batched read of every
/// candidate measurement for the resolved systems.
pub fn rank_zip<S>(store: &mut S, request: &RankRequest) -> Result<ZipRanking, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    request.validate()?;
    let zip = request.zip.as_str();

    let systems = resolve_systems(store, request)?;

    let names: Vec<String> = systems.iter().map(|s| s.pws_name.clone()).collect();
    let records = store.measurements_for_systems(&names)?;

    // contaminant -> system -> candidates. BTreeMap keeps iteration stable.
    let mut candidates: BTreeMap<&str, BTreeMap<&str, Vec<&MeasurementRecord>>> = BTreeMap::new();
    for record in &records {
        if request.year.is_some() && record.year != request.year {
            continue;
        }
        candidates
            .entry(record.contaminant.as_str())
            .or_default()
            .entry(record.pws_name.as_str())
            .or_default()
            .push(record);
    }

    let mut estimates: Vec<ContaminantEstimate> = candidates
        .iter()
        .filter_map(|(contaminant, by_system)| {
            let picks: Vec<(&ServingSystem, &MeasurementRecord)> = systems
                .iter()
                .filter_map(|system| {
                    let rows = by_system.get(system.pws_name.as_str())?;
                    selector::select_latest(rows.iter().copied()).map(|m| (system, m))
                })
                .collect();
            combine(contaminant, &picks)
        })
        .collect();

    let qualifying = estimates.len();
    estimates.sort_by(estimate_order);
    estimates.truncate(request.top_n as usize);

    logging::debug(
        LogSource::Engine,
        Some(zip),
        &format!(
            "ranked {} of {} contaminants across {} systems ({} measurements read)",
            estimates.len(),
            qualifying,
            systems.len(),
            records.len()
        ),
    );

    Ok(ZipRanking {
        zip: zip.to_string(),
        systems,
        contaminants: estimates,
    })
}

// ---------------------------------------------------------------------------
// Combination
// ---------------------------------------------------------------------------

/// Combines one contaminant's selected measurements, given in coverage
/// order. Returns `None` when nothing contributes.
pub fn combine(
    contaminant: &str,
    picks: &[(&ServingSystem, &MeasurementRecord)],
) -> Option<ContaminantEstimate> {
    if picks.is_empty() {
        return None;
    }

    let weighted: Vec<(f64, f64)> = picks
        .iter()
        .filter_map(|(system, m)| system.coverage_fraction.known().map(|f| (m.value_ppb, f)))
        .collect();
    let denominator: f64 = weighted.iter().map(|(_, f)| f).sum();

    let (estimate_ppb, method) = if denominator > 0.0 {
        let estimate = match weighted.as_slice() {
            // A lone contributor is reported exactly, without a rounding trip.
            [(value, _)] => *value,
            _ => weighted.iter().map(|(v, f)| v * f).sum::<f64>() / denominator,
        };
        (estimate, CombinationMethod::Weighted)
    } else {
        let sum: f64 = picks.iter().map(|(_, m)| m.value_ppb).sum();
        (sum / picks.len() as f64, CombinationMethod::UnweightedFallback)
    };

    let contributions = picks
        .iter()
        .map(|(system, m)| Contribution {
            pws_name: system.pws_name.clone(),
            pwsid: system.pwsid.clone(),
            value_ppb: m.value_ppb,
            coverage_fraction: system.coverage_fraction,
            weighted: method == CombinationMethod::Weighted
                && system.coverage_fraction.known().is_some_and(|f| f > 0.0),
            year: m.year,
            basis: m.basis.clone(),
            source_url: m.source_url.clone(),
        })
        .collect();

    Some(ContaminantEstimate {
        contaminant: contaminant.to_string(),
        estimate_ppb,
        method,
        low_confidence: method == CombinationMethod::UnweightedFallback,
        contributions,
    })
}
