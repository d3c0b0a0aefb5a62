//! # Stage: Contingency Test
//!
//! ## Responsibility
//! The G-test statistic `G = 2 Σ O·ln(O/E)` for an r×c table of counts.
//!
//! ## Guarantees
//! - Tables are rectangular and non-empty by construction
//! - Zero-observation cells contribute exactly 0 (the limit of `x·ln x`)
//! - A table whose grand total is 0 yields NaN, never a panic
//!
//! ## NOT Responsible For
//! - Converting G into a p-value (see [`crate::distributions`])

use crate::error::{Result, StatsError};
use crate::experiment::VariantObservation;

// ---------------------------------------------------------------------------
// ContingencyTable
// ---------------------------------------------------------------------------

/// Rectangular table of non-negative counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContingencyTable {
    rows: Vec<Vec<u64>>,
}

impl ContingencyTable {
    pub fn new(rows: Vec<Vec<u64>>) -> Result<Self> {
        let width = match rows.first() {
            Some(first) if !first.is_empty() => first.len(),
            _ => return Err(StatsError::InvalidTable("table has no cells".into())),
        };
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(StatsError::InvalidTable(format!(
                "row {} has {} columns, expected {}",
                i,
                row.len(),
                width
            )));
        }
        Ok(Self { rows })
    }

    /// One row per variant: `[non-conversions, conversions]`.
    pub fn from_observations(observations: &[VariantObservation]) -> Result<Self> {
        Self::new(
            observations
                .iter()
                .map(|o| vec![o.visits() - o.conversions(), o.conversions()])
                .collect(),
        )
    }

    pub fn rows(&self) -> &[Vec<u64>] { &self.rows }

    pub fn row_count(&self) -> usize { self.rows.len() }

    pub fn column_count(&self) -> usize { self.rows[0].len() }

    pub fn row_totals(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.iter().map(|&c| c as f64).sum()).collect()
    }

    pub fn column_totals(&self) -> Vec<f64> {
        (0..self.column_count())
            .map(|j| self.rows.iter().map(|r| r[j] as f64).sum())
            .collect()
    }

    pub fn grand_total(&self) -> f64 {
        self.rows.iter().flatten().map(|&c| c as f64).sum()
    }
}

// ---------------------------------------------------------------------------
// G-test
// ---------------------------------------------------------------------------

/// G statistic of the table; NaN when every cell is zero.
pub fn g_test(table: &ContingencyTable) -> f64 {
    let total = table.grand_total();
    if total == 0.0 {
        return f64::NAN;
    }
    let row_totals = table.row_totals();
    let column_totals = table.column_totals();

    let mut g = 0.0;
    for (row, row_total) in table.rows().iter().zip(&row_totals) {
        for (&observed, column_total) in row.iter().zip(&column_totals) {
            g += cell_contribution(observed as f64, row_total * column_total / total);
        }
    }
    g
}

fn cell_contribution(observed: f64, expected: f64) -> f64 {
    // 0·ln(0/E) → 0
    if observed == 0.0 {
        return 0.0;
    }
    2.0 * observed * (observed / expected).ln()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
