//! Coverage resolution: which water systems serve a zip, and how much of it.

use std::cmp::Ordering;

use crate::model::{LookupError, ServingSystem, validate_zip};
use crate::store::MeasurementStore;

/// Orders serving systems by coverage fraction descending, unknown
/// fractions last, then by display name.
pub fn coverage_order(a: &ServingSystem, b: &ServingSystem) -> Ordering {
    let by_fraction = match (a.coverage_fraction.known(), b.coverage_fraction.known()) {
        (Some(fa), Some(fb)) => fb.total_cmp(&fa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_fraction.then_with(|| a.pws_name.cmp(&b.pws_name))
}

/// Every system serving `zip`, in [`coverage_order`].
///
/// An empty result means no crosswalk row exists for the zip; deciding
/// whether that is a `NotFound` is left to the caller.
pub fn resolve<S>(store: &mut S, zip: &str) -> Result<Vec<ServingSystem>, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    validate_zip(zip)?;
    let mut systems: Vec<ServingSystem> = store
        .zip_coverage(zip)?
        .into_iter()
        .map(ServingSystem::from)
        .collect();
    systems.sort_by(coverage_order);
    Ok(systems)
}

/// The lookup operation: up to `limit` systems serving `zip`, or
/// `NotFound` if there are none.
pub fn lookup<S>(store: &mut S, zip: &str, limit: usize) -> Result<Vec<ServingSystem>, LookupError>
where
    S: MeasurementStore + ?Sized,
{
    validate_zip(zip)?;
    if limit == 0 {
        return Err(LookupError::InvalidInput("limit must be at least 1".to_string()));
    }
    let mut systems = resolve(store, zip)?;
    if systems.is_empty() {
        return Err(LookupError::NotFound(format!("No PWS mapping found for ZIP {}.", zip)));
    }
    systems.truncate(limit);
    Ok(systems)
}
