//! Shared test utilities for the bundle-sync workspace.
//!
//! A dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`dataset`]: [`TestDataset`] builder for flat dataset directories

pub mod dataset;

pub use dataset::TestDataset;
