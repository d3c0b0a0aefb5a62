//! Serializable experiment reports and their terminal rendering.
//!
//! Undefined numbers stay NaN inside the report; `serde_json` writes them as
//! `null` and [`render_table`] prints them as "—".

use colored::*;
use serde::Serialize;

use crate::error::Result;
use crate::estimator::{EffectEstimate, EffectEstimator, SampleRatioCheck};
use crate::experiment::Phase;
use crate::portfolio::Portfolio;

const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub index: usize,
    pub label: String,
    pub visits: u64,
    pub conversions: u64,
    pub conversion: EffectEstimate,
    /// Absent for the baseline.
    pub absolute_effect: Option<EffectEstimate>,
    pub relative_effect: Option<EffectEstimate>,
    pub sample_ratio: Option<SampleRatioCheck>,
    /// Projected over the variant's own visits; needs an average order value.
    pub revenue_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub schema_version: u8,
    pub phase: Phase,
    pub days: u32,
    pub p_value_threshold: f64,
    pub cutoff: f64,
    pub g_test: f64,
    pub p_value: f64,
    pub certainty: f64,
    pub significant: bool,
    pub variants: Vec<VariantReport>,
}

impl ExperimentReport {
    pub fn build(estimator: &EffectEstimator<'_>) -> Result<Self> {
        let state = estimator.state();
        let variants = (0..state.variant_count())
            .map(|i| variant_report(estimator, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            phase: state.phase(),
            days: state.days(),
            p_value_threshold: state.p_value(),
            cutoff: state.cutoff(),
            g_test: estimator.g_test(),
            p_value: estimator.p_value(),
            certainty: estimator.certainty(),
            significant: estimator.is_significant(),
            variants,
        })
    }
}

fn variant_report(estimator: &EffectEstimator<'_>, index: usize) -> Result<VariantReport> {
    let obs = estimator.state().observation(index)?;
    let treatment = index > 0;
    Ok(VariantReport {
        index,
        label: if treatment { format!("variant {}", index) } else { "baseline".to_string() },
        visits: obs.visits(),
        conversions: obs.conversions(),
        conversion: estimator.conversion_mean(index)?,
        absolute_effect: if treatment { Some(estimator.absolute_effect(index)?) } else { None },
        relative_effect: if treatment { Some(estimator.relative_effect(index)?) } else { None },
        sample_ratio: if treatment { Some(estimator.sample_ratio_mismatch(index)?) } else { None },
        revenue_delta: if treatment { estimator.revenue_delta(index, obs.visits())? } else { None },
    })
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioReport {
    pub schema_version: u8,
    pub day: u32,
    pub base_rate: f64,
    pub visitors: u64,
    pub conversions: u64,
    pub experiments: Vec<ExperimentReport>,
}

impl PortfolioReport {
    pub fn build<R: rand::Rng>(portfolio: &Portfolio<R>) -> Result<Self> {
        let experiments = portfolio
            .experiments()
            .iter()
            .map(|e| ExperimentReport::build(&EffectEstimator::new(e.state(), portfolio.analysis())?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            day: portfolio.day(),
            base_rate: portfolio.base_rate(),
            visitors: portfolio.visitors(),
            conversions: portfolio.conversions(),
            experiments,
        })
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn number(x: f64, decimals: usize) -> String {
    if x.is_finite() { format!("{:.*}", decimals, x) } else { "—".to_string() }
}

fn percent(x: f64) -> String {
    if x.is_finite() { format!("{:+.2}%", x * 100.0) } else { "—".to_string() }
}

fn interval(e: &EffectEstimate) -> String {
    format!("[{}, {}]", percent(e.lower()), percent(e.upper()))
}

fn verdict(report: &ExperimentReport) -> ColoredString {
    if report.significant {
        "SIGNIFICANT".green().bold()
    } else {
        "not significant".yellow()
    }
}

/// Multi-line terminal table for one experiment.
pub fn render_table(report: &ExperimentReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}  phase={} days={}\n",
        "EXPERIMENT".bright_cyan().bold(),
        report.phase,
        report.days
    ));
    out.push_str(&format!(
        "{:<10} {:>10} {:>8} {:>8} {:>22} {:>9} {:>22} {:>9}\n",
        "variant", "visits", "conv", "rate", "rate interval", "relative", "relative interval", "srm p"
    ));
    for v in &report.variants {
        let (rel, rel_ci) = match &v.relative_effect {
            Some(e) => (percent(e.estimate), interval(e)),
            None => (String::new(), String::new()),
        };
        let srm = match &v.sample_ratio {
            Some(c) if c.mismatch => number(c.p_value, 4).red().bold().to_string(),
            Some(c) => number(c.p_value, 4),
            None => String::new(),
        };
        out.push_str(&format!(
            "{:<10} {:>10} {:>8} {:>8} {:>22} {:>9} {:>22} {:>9}\n",
            v.label,
            v.visits,
            v.conversions,
            number(v.conversion.estimate * 100.0, 3),
            interval(&v.conversion),
            rel,
            rel_ci,
            srm
        ));
        if let Some(delta) = v.revenue_delta {
            out.push_str(&format!("{:<10} revenue delta {}\n", "", number(delta, 2)));
        }
    }
    out.push_str(&format!(
        "G = {}  cutoff = {}  p = {}  certainty = {}%  {}\n",
        number(report.g_test, 4),
        number(report.cutoff, 4),
        number(report.p_value, 4),
        number(report.certainty, 2),
        verdict(report)
    ));
    out
}

/// One line per experiment plus the portfolio totals.
pub fn render_portfolio(report: &PortfolioReport) -> String {
    let mut out = format!(
        "{}  day={} visitors={} conversions={} base rate={}%\n",
        "PORTFOLIO".bright_cyan().bold(),
        report.day,
        report.visitors,
        report.conversions,
        number(report.base_rate * 100.0, 4)
    );
    for (i, e) in report.experiments.iter().enumerate() {
        let lift = e
            .variants
            .get(1)
            .and_then(|v| v.relative_effect)
            .map(|r| percent(r.estimate))
            .unwrap_or_default();
        out.push_str(&format!(
            "#{:<3} {:<8} days={:<3} lift={:>9} certainty={:>7}%  {}\n",
            i,
            e.phase.to_string(),
            e.days,
            lift,
            number(e.certainty, 2),
            verdict(e)
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
