//! # Error Handling
//!
//! Error types for the rotation engine, built on `thiserror`.
//!
//! Errors raised before a secret is committed to the store leave rotation
//! metadata untouched; errors raised after the commit (`Render`,
//! `ReloadFailed`) mark the descriptor as pending and are retried by
//! artifact reconciliation on later ticks.

pub mod types;

pub use types::{Result, RotationError};
