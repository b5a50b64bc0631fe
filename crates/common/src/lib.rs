//! Shared types, error definitions, and text helpers used across all herald crates.

pub mod error;
pub mod markdown;
pub mod types;

pub use {
    error::{Error, FromMessage, Result},
    types::ChatTarget,
};
