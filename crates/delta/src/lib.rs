//! JSON helpers for change events: a changed-keys-only diff and a field redactor.

pub mod diff;
pub mod redact;

pub use {
    diff::{apply, diff},
    redact::{DEFAULT_MAX_FIELD_LEN, redact, redacted},
};
