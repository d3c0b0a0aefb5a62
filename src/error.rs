//! Crate-level error type.
//!
//! Only invalid *inputs* are errors. Results that are numerically undefined
//! (zero visits, zero baseline rate, a non-positive Fieller discriminant) are
//! returned as NaN / non-finite values instead, so a live experiment with
//! almost no data never interrupts the simulation loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    /// Distribution parameter outside its domain (degrees of freedom, probability).
    #[error("domain error: {0}")]
    Domain(String),

    /// Contingency table is empty or not rectangular.
    #[error("invalid contingency table: {0}")]
    InvalidTable(String),

    /// A variant reports more conversions than visits.
    #[error("invalid observation: {conversions} conversions exceed {visits} visits")]
    InvalidObservation { visits: u64, conversions: u64 },

    #[error("variant index {index} out of range ({count} variants)")]
    UnknownVariant { index: usize, count: usize },

    #[error("experiment index {index} out of range ({count} experiments)")]
    UnknownExperiment { index: usize, count: usize },

    /// Lifecycle operation not allowed in the experiment's current phase.
    #[error("cannot {action}: experiment is {phase}")]
    InvalidTransition {
        phase: crate::experiment::Phase,
        action: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StatsError>;
