//! Drinking-water contaminant estimates by US zip code.
//!
//! A zip is served by one or more public water systems, each covering some
//! fraction of it. Each system reports contaminant measurements. The engine
//! picks the most authoritative measurement per (system, contaminant),
//! combines systems by coverage weight, and ranks contaminants by estimated
//! concentration.
//!
//! Modules:
//! - `model`: shared types and the lookup error taxonomy
//! - `store`: store contracts, Postgres and in-memory implementations
//! - `coverage`, `selector`, `ranking`: the engine
//! - `ingest`: CSV loading for measurements and the zip crosswalk
//! - `api`: axum HTTP boundary
//! - `verify`: post-load data checks

pub mod api;
pub mod config;
pub mod coverage;
pub mod db;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod ranking;
pub mod selector;
pub mod store;
pub mod systems;
pub mod verify;
