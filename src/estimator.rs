//! # Stage: Effect Estimation
//!
//! ## Responsibility
//! Point estimates and two-sided intervals for one experiment's variants:
//! conversion means (Wald), absolute effects (unpooled Wald), relative
//! effects (Fieller), plus the experiment-wide G-test verdict and a sample
//! ratio mismatch check per variant.
//!
//! ## Guarantees
//! - Read-only: borrows an [`ExperimentState`], never mutates it
//! - Undefined quantities (zero visits, zero baseline rate, a non-positive
//!   Fieller discriminant) come back as NaN, not as errors
//! - Only an out-of-range variant index is an error
//!
//! ## NOT Responsible For
//! - Accumulating counts (see [`crate::simulator`])
//! - Formatting (see [`crate::report`])

use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::contingency::{g_test, ContingencyTable};
use crate::distributions::{chi_square_tail, normal_critical, round_significant, round_to_decimals, upper_normal};
use crate::error::{Result, StatsError};
use crate::experiment::{ExperimentState, VariantObservation};

// ---------------------------------------------------------------------------
// EffectEstimate
// ---------------------------------------------------------------------------

/// A point estimate with its `[lower, upper]` interval. Any component may be
/// NaN or infinite; callers check [`EffectEstimate::is_finite`] before
/// drawing a confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectEstimate {
    pub estimate: f64,
    pub interval: [f64; 2],
}

impl EffectEstimate {
    pub fn new(estimate: f64, interval: [f64; 2]) -> Self {
        Self { estimate, interval }
    }

    /// `estimate ± margin`.
    pub fn symmetric(estimate: f64, margin: f64) -> Self {
        Self::new(estimate, [estimate - margin, estimate + margin])
    }

    /// Nothing can be said: NaN everywhere.
    pub fn undefined() -> Self {
        Self::new(f64::NAN, [f64::NAN, f64::NAN])
    }

    pub fn lower(&self) -> f64 { self.interval[0] }

    pub fn upper(&self) -> f64 { self.interval[1] }

    pub fn is_finite(&self) -> bool {
        self.estimate.is_finite() && self.interval.iter().all(|b| b.is_finite())
    }

    /// Whether `value` lies inside the interval; false for an undefined interval.
    pub fn contains(&self, value: f64) -> bool {
        self.lower() <= value && value <= self.upper()
    }
}

// ---------------------------------------------------------------------------
// SampleRatioCheck
// ---------------------------------------------------------------------------

/// Two-proportion z-test of the baseline's share of traffic against the
/// configured allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleRatioCheck {
    /// `visits[0] / (visits[0] + visits[i])`.
    pub observed_fraction: f64,
    /// Same fraction under the configured allocation.
    pub expected_fraction: f64,
    pub z_score: f64,
    /// Two-sided p-value, capped at 1.
    pub p_value: f64,
    /// `p_value` fell below the configured SRM threshold.
    pub mismatch: bool,
}

// ---------------------------------------------------------------------------
// Fieller interval
// ---------------------------------------------------------------------------

/// Fieller interval for `variant_mean / base_mean - 1`.
///
/// With `x = mb·mv`, `y = mb² − z²·sb²`, `c = mv² − z²·sv²` and
/// `q = x² − y·c`, the interval is `x/y ± √q/y − 1`. It is unbounded (and
/// reported as `[NaN, NaN]`) when `q ≤ 0` or `y ≤ 0`. A negative base mean
/// flips the interval.
pub fn fieller_relative_interval(
    base_mean: f64,
    base_se: f64,
    variant_mean: f64,
    variant_se: f64,
    z: f64,
) -> [f64; 2] {
    let z2 = z * z;
    let x = base_mean * variant_mean;
    let y = base_mean * base_mean - z2 * base_se * base_se;
    let c = variant_mean * variant_mean - z2 * variant_se * variant_se;
    let q = x * x - y * c;

    // Written negated so NaN inputs also land here.
    if !(q > 0.0) || !(y > 0.0) {
        return [f64::NAN, f64::NAN];
    }
    let centre = x / y;
    let half_width = q.sqrt() / y;
    let (lower, upper) = (centre - half_width - 1.0, centre + half_width - 1.0);
    if base_mean < 0.0 { [-upper, -lower] } else { [lower, upper] }
}

// ---------------------------------------------------------------------------
// EffectEstimator
// ---------------------------------------------------------------------------

/// Statistics over a borrowed [`ExperimentState`]. Variant 0 is the baseline.
#[derive(Debug, Clone)]
pub struct EffectEstimator<'a> {
    state: &'a ExperimentState,
    config: &'a AnalysisConfig,
    allocation: Vec<f64>,
    z: f64,
}

impl<'a> EffectEstimator<'a> {
    /// Fails with [`StatsError::Config`] when `config.p_value` differs from
    /// the threshold `state` was built with.
    pub fn new(state: &'a ExperimentState, config: &'a AnalysisConfig) -> Result<Self> {
        config.validate()?;
        if config.p_value != state.p_value() {
            return Err(StatsError::Config(format!(
                "p_value {} does not match the experiment's threshold {}",
                config.p_value,
                state.p_value()
            )));
        }
        let allocation = config.allocation_for(state.variant_count())?;
        Ok(Self {
            state,
            config,
            allocation,
            z: normal_critical(state.p_value() / 2.0),
        })
    }

    pub fn state(&self) -> &ExperimentState { self.state }

    pub fn config(&self) -> &AnalysisConfig { self.config }

    /// Two-sided critical value `z_{p/2}` used by every interval.
    pub fn critical_value(&self) -> f64 { self.z }

    fn pair(&self, index: usize) -> Result<(&VariantObservation, &VariantObservation)> {
        Ok((self.state.observation(0)?, self.state.observation(index)?))
    }

    // -----------------------------------------------------------------------
    // Per-variant estimates
    // -----------------------------------------------------------------------

    /// Conversion rate of variant `index` with a Wald interval.
    pub fn conversion_mean(&self, index: usize) -> Result<EffectEstimate> {
        let obs = self.state.observation(index)?;
        Ok(EffectEstimate::symmetric(obs.conversion_rate(), self.z * obs.standard_error()))
    }

    /// `rate[i] − rate[0]` with an unpooled Wald margin.
    pub fn absolute_effect(&self, index: usize) -> Result<EffectEstimate> {
        let (base, variant) = self.pair(index)?;
        let margin = self.z * base.standard_error().hypot(variant.standard_error());
        Ok(EffectEstimate::symmetric(variant.conversion_rate() - base.conversion_rate(), margin))
    }

    /// `(rate[i] − rate[0]) / |rate[0]|` with a Fieller interval.
    pub fn relative_effect(&self, index: usize) -> Result<EffectEstimate> {
        let (base, variant) = self.pair(index)?;
        let (mb, mv) = (base.conversion_rate(), variant.conversion_rate());
        if base.visits() == 0 || variant.visits() == 0 || mb.is_nan() || mv.is_nan() || mb == 0.0 {
            return Ok(EffectEstimate::undefined());
        }
        let interval = fieller_relative_interval(mb, base.standard_error(), mv, variant.standard_error(), self.z);
        Ok(EffectEstimate::new((mv - mb) / mb.abs(), interval))
    }

    // -----------------------------------------------------------------------
    // Experiment-wide verdict
    // -----------------------------------------------------------------------

    /// G statistic over every variant; NaN before any visitor arrives.
    pub fn g_test(&self) -> f64 {
        ContingencyTable::from_observations(self.state.observations())
            .map(|t| g_test(&t))
            .unwrap_or(f64::NAN)
    }

    fn degrees_of_freedom(&self) -> u32 {
        (self.state.variant_count() - 1) as u32
    }

    /// Upper-tail chi-square probability of the G statistic.
    pub fn p_value(&self) -> f64 {
        round_significant(chi_square_tail(self.degrees_of_freedom(), self.g_test()))
    }

    /// `G ≥ cutoff`. An undefined statistic is never significant.
    pub fn is_significant(&self) -> bool {
        self.g_test() >= self.state.cutoff()
    }

    /// `100·(1 − p)`, to two decimals.
    pub fn certainty(&self) -> f64 {
        let p = chi_square_tail(self.degrees_of_freedom(), self.g_test());
        round_to_decimals(100.0 * (1.0 - p), 2)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Compare the baseline/variant traffic split against the allocation.
    pub fn sample_ratio_mismatch(&self, index: usize) -> Result<SampleRatioCheck> {
        let (base, variant) = self.pair(index)?;
        let n = base.visits() as f64 + variant.visits() as f64;
        let expected = self.allocation[0] / (self.allocation[0] + self.allocation[index]);
        let observed = base.visits() as f64 / n;
        let z = (observed - expected) / (expected * (1.0 - expected) / n).sqrt();
        let p = round_significant(2.0 * upper_normal(z.abs()));
        let p_value = if p > 1.0 { 1.0 } else { p };
        Ok(SampleRatioCheck {
            observed_fraction: observed,
            expected_fraction: expected,
            z_score: z,
            p_value,
            mismatch: p_value < self.config.srm_p_value,
        })
    }

    /// Revenue gained (or lost) over `visitors` by shipping variant `index`,
    /// at the configured average order value. `None` without an order value.
    pub fn revenue_delta(&self, index: usize, visitors: u64) -> Result<Option<f64>> {
        let effect = self.absolute_effect(index)?;
        Ok(self
            .config
            .average_order_value
            .map(|aov| effect.estimate * visitors as f64 * aov))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn state(visits: &[u64], conversions: &[u64]) -> ExperimentState {
        ExperimentState::from_counts(visits, conversions, &AnalysisConfig::default()).unwrap()
    }

    // ===== EffectEstimate =====

    #[test]
    fn test_effect_estimate_undefined() {
        let e = EffectEstimate::undefined();
        assert!(e.estimate.is_nan());
        assert!(!e.is_finite());
        assert!(!e.contains(0.0));
    }

    #[test]
    fn test_effect_estimate_symmetric() {
        let e = EffectEstimate::symmetric(0.5, 0.1);
        assert!((e.lower() - 0.4).abs() < 1e-12);
        assert!((e.upper() - 0.6).abs() < 1e-12);
        assert!(e.contains(0.5));
    }

    // ===== Fieller =====

    #[test]
    fn test_fieller_known_interval() {
        let se = |p: f64, n: f64| (p * (1.0 - p) / n).sqrt();
        let [lo, hi] = fieller_relative_interval(0.05, se(0.05, 1e4), 0.055, se(0.055, 1e4), 1.644853);
        assert!((lo + 0.00358).abs() < 1e-4, "lo={}", lo);
        assert!((hi - 0.21495).abs() < 1e-4, "hi={}", hi);
    }

    #[test]
    fn test_fieller_non_positive_denominator_is_nan() {
        // base mean barely above its own noise
        let [lo, hi] = fieller_relative_interval(0.1, 0.1, 0.2, 0.01, 1.644853);
        assert!(lo.is_nan() && hi.is_nan());
    }

    #[test]
    fn test_fieller_negative_base_flips() {
        let pos = fieller_relative_interval(2.0, 0.1, 3.0, 0.1, 1.96);
        let neg = fieller_relative_interval(-2.0, 0.1, -3.0, 0.1, 1.96);
        assert!((neg[0] + pos[1]).abs() < 1e-12);
        assert!((neg[1] + pos[0]).abs() < 1e-12);
    }

    #[test]
    fn test_fieller_nan_input_is_nan() {
        let [lo, hi] = fieller_relative_interval(f64::NAN, 0.1, 0.2, 0.01, 1.96);
        assert!(lo.is_nan() && hi.is_nan());
    }

    // ===== Construction =====

    #[test]
    fn test_mismatched_p_value_rejected() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let strict = AnalysisConfig::with_p_value(0.01);
        assert!(matches!(EffectEstimator::new(&s, &strict), Err(StatsError::Config(_))));
    }

    #[test]
    fn test_critical_value_follows_threshold() {
        let cfg = AnalysisConfig::with_p_value(0.01);
        let s = ExperimentState::from_counts(&[10_000, 10_000], &[500, 550], &cfg).unwrap();
        let z = EffectEstimator::new(&s, &cfg).unwrap().critical_value();
        assert!((z - 2.5758).abs() < 1e-3, "z={}", z);
    }

    // ===== Estimates =====

    #[test]
    fn test_conversion_mean_wald() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let cfg = AnalysisConfig::default();
        let est = EffectEstimator::new(&s, &cfg).unwrap();
        let m = est.conversion_mean(0).unwrap();
        let margin = 1.644853 * (0.05f64 * 0.95 / 10_000.0).sqrt();
        assert!((m.estimate - 0.05).abs() < 1e-12);
        assert!((m.upper() - 0.05 - margin).abs() < 1e-5, "upper={}", m.upper());
    }

    #[test]
    fn test_absolute_effect() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let cfg = AnalysisConfig::default();
        let a = EffectEstimator::new(&s, &cfg).unwrap().absolute_effect(1).unwrap();
        assert!((a.estimate - 0.005).abs() < 1e-12);
        assert!((a.upper() - a.estimate - 0.0051878).abs() < 1e-5, "margin={}", a.upper() - a.estimate);
        assert!(a.contains(0.0));
    }

    #[test]
    fn test_relative_effect_fixture() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let cfg = AnalysisConfig::default();
        let r = EffectEstimator::new(&s, &cfg).unwrap().relative_effect(1).unwrap();
        assert!((r.estimate - 0.1).abs() < 1e-9, "estimate={}", r.estimate);
        assert!(r.contains(r.estimate));
        assert!(r.lower() < 0.0 && r.upper() > 0.2);
    }

    #[test]
    fn test_relative_effect_zero_baseline_rate_undefined() {
        let s = state(&[100, 100], &[0, 5]);
        let cfg = AnalysisConfig::default();
        let r = EffectEstimator::new(&s, &cfg).unwrap().relative_effect(1).unwrap();
        assert!(r.estimate.is_nan());
        assert!(r.lower().is_nan() && r.upper().is_nan());
    }

    #[test]
    fn test_relative_effect_small_sample_estimate_without_interval() {
        let s = state(&[10, 10], &[1, 2]);
        let cfg = AnalysisConfig::default();
        let r = EffectEstimator::new(&s, &cfg).unwrap().relative_effect(1).unwrap();
        assert!((r.estimate - 1.0).abs() < 1e-12);
        assert!(r.lower().is_nan() && r.upper().is_nan());
    }

    #[test]
    fn test_unknown_variant_is_error() {
        let s = state(&[10, 10], &[1, 2]);
        let cfg = AnalysisConfig::default();
        let est = EffectEstimator::new(&s, &cfg).unwrap();
        assert!(matches!(est.relative_effect(2), Err(StatsError::UnknownVariant { index: 2, count: 2 })));
    }

    // ===== Verdict =====

    #[test]
    fn test_significance_fixture() {
        let cfg = AnalysisConfig::default();
        let small = state(&[10_000, 10_000], &[500, 550]);
        let large = state(&[100_000, 100_000], &[5_000, 5_500]);
        assert!(!EffectEstimator::new(&small, &cfg).unwrap().is_significant());
        assert!(EffectEstimator::new(&large, &cfg).unwrap().is_significant());
    }

    #[test]
    fn test_p_value_and_certainty_agree() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let cfg = AnalysisConfig::default();
        let est = EffectEstimator::new(&s, &cfg).unwrap();
        let p = est.p_value();
        assert!(p > 0.1 && p < 0.12, "p={}", p);
        assert!((est.certainty() - 100.0 * (1.0 - p)).abs() < 0.01, "certainty={}", est.certainty());
    }

    #[test]
    fn test_no_visitors_not_significant() {
        let s = state(&[0, 0], &[0, 0]);
        let cfg = AnalysisConfig::default();
        let est = EffectEstimator::new(&s, &cfg).unwrap();
        assert!(est.g_test().is_nan());
        assert!(!est.is_significant());
        assert!(est.certainty().is_nan());
    }

    // ===== Diagnostics =====

    #[test]
    fn test_srm_balanced_traffic() {
        let s = state(&[5_000, 5_000], &[250, 250]);
        let cfg = AnalysisConfig { allocation: Some(vec![0.5, 0.5]), ..Default::default() };
        let c = EffectEstimator::new(&s, &cfg).unwrap().sample_ratio_mismatch(1).unwrap();
        assert!((c.p_value - 1.0).abs() < 1e-9, "p={}", c.p_value);
        assert!(!c.mismatch);
    }

    #[test]
    fn test_srm_skewed_traffic_flagged() {
        let s = state(&[5_500, 4_500], &[250, 250]);
        let cfg = AnalysisConfig::default();
        let c = EffectEstimator::new(&s, &cfg).unwrap().sample_ratio_mismatch(1).unwrap();
        assert!((c.observed_fraction - 0.55).abs() < 1e-12);
        assert!(c.z_score > 9.0, "z={}", c.z_score);
        assert!(c.mismatch);
    }

    #[test]
    fn test_srm_uses_configured_allocation() {
        let s = state(&[2_000, 8_000], &[100, 400]);
        let cfg = AnalysisConfig { allocation: Some(vec![1.0, 4.0]), ..Default::default() };
        let c = EffectEstimator::new(&s, &cfg).unwrap().sample_ratio_mismatch(1).unwrap();
        assert!((c.expected_fraction - 0.2).abs() < 1e-12);
        assert!(!c.mismatch);
    }

    #[test]
    fn test_srm_no_traffic_is_nan_not_mismatch() {
        let s = state(&[0, 0], &[0, 0]);
        let cfg = AnalysisConfig::default();
        let c = EffectEstimator::new(&s, &cfg).unwrap().sample_ratio_mismatch(1).unwrap();
        assert!(c.p_value.is_nan());
        assert!(!c.mismatch);
    }

    #[test]
    fn test_srm_extreme_counts_do_not_overflow() {
        let s = state(&[u64::MAX, 1], &[0, 0]);
        let cfg = AnalysisConfig::default();
        let c = EffectEstimator::new(&s, &cfg).unwrap().sample_ratio_mismatch(1).unwrap();
        assert!(c.observed_fraction > 0.99);
        assert!(c.mismatch, "p={}", c.p_value);
    }

    #[test]
    fn test_revenue_delta() {
        let s = state(&[10_000, 10_000], &[500, 550]);
        let cfg = AnalysisConfig::default();
        assert_eq!(EffectEstimator::new(&s, &cfg).unwrap().revenue_delta(1, 1_000).unwrap(), None);
        let cfg = AnalysisConfig { average_order_value: Some(40.0), ..Default::default() };
        let r = EffectEstimator::new(&s, &cfg).unwrap().revenue_delta(1, 1_000).unwrap().unwrap();
        assert!((r - 200.0).abs() < 1e-6, "revenue={}", r);
    }
}
