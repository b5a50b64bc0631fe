//! Metrics for herald.
//!
//! Metric names live in [`definitions`]; recording goes through the `metrics`
//! crate facade, so nothing is collected unless a recorder is installed.
//! With the `prometheus` feature, [`init_metrics`] installs a Prometheus
//! recorder whose [`MetricsHandle::render`] output backs the `/metrics` endpoint.
//!
//! ```rust,ignore
//! use herald_metrics::{counter, outbox};
//!
//! counter!(outbox::SENDS_TOTAL, "fragment" => "whole").increment(1);
//! ```

mod definitions;
pub mod error;
mod recorder;

pub use {
    definitions::*,
    error::{Error, Result},
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
