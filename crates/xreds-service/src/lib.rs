//! # XREDS dataset service
//!
//! Serves large gridded environmental datasets to a request/response layer without reopening
//! them for every request. The interesting part lives in [`caching`]: a load coordinator that
//! deduplicates concurrent loads of the same dataset, backed by a bounded in-process cache and an
//! optional cache shared between worker processes.
//!
//! Everything else is plumbing around that core:
//!
//! - [`registry`] reads the static mapping from dataset identifier to [`DatasetSpec`](registry::DatasetSpec).
//! - [`loader`] turns a spec into a [`Dataset`](dataset::Dataset), dispatching on the format.
//! - [`transforms`] applies the named post-load transforms configured per dataset.
//! - [`services`] wires all of the above together from a [`Config`](config::Config).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod dataset;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod services;
pub mod transforms;
