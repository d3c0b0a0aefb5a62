//! # Stage: Distribution Math
//!
//! ## Responsibility
//! Critical values (upper quantiles) and upper-tail probabilities of the
//! standard normal, chi-square, Student-t and F distributions.
//!
//! Every quantile here is an *upper* critical value: `chi_square_quantile(n, p)`
//! is the `x` with `P(X > x) = p`. Quantiles therefore decrease as `p` grows,
//! and `normal_quantile(0.05) ≈ 1.64485`.
//!
//! ## Guarantees
//! - Invalid parameters (zero or fractional degrees of freedom, probability
//!   outside the routine's interval) fail with [`StatsError::Domain`]; they are
//!   never clamped.
//! - Public results are rounded to five significant digits, the precision the
//!   approximations support.
//! - Newton refinements stop on a numeric tolerance or after
//!   [`MAX_NEWTON_ITERATIONS`]; hitting the cap logs a warning and returns the
//!   last iterate.
//!
//! ## NOT Responsible For
//! - Non-integer degrees of freedom or exact (arbitrary precision) evaluation.

use std::f64::consts::PI;

use tracing::warn;

use crate::error::{Result, StatsError};

/// Significant digits kept by the public functions.
const SIGNIFICANT: f64 = 5.0;

/// Iteration cap shared by every Newton refinement.
pub const MAX_NEWTON_ITERATIONS: usize = 100;

/// Chi-square refinement stops once a step is smaller than this.
const CHI_SQUARE_TOLERANCE: f64 = 1e-4;

/// Student-t refinement stops once `|Δ| < STUDENT_T_TOLERANCE · max(1, |x|)`.
const STUDENT_T_TOLERANCE: f64 = 1e-7;

/// F refinement stops once `|Δ| <= F_TOLERANCE`.
const F_TOLERANCE: f64 = 3e-4;

/// Starting point used when the chi-square seed collapses to zero.
const MIN_CHI_SQUARE_SEED: f64 = 1e-6;

// Rational approximation of the normal critical value in y = -ln(4p(1-p)).
const NORMAL_CRITICAL_COEFFS: [f64; 11] = [
    1.570796288,
    0.03706987906,
    -0.8364353589e-3,
    -0.2250947176e-3,
    0.6841218299e-5,
    0.5824238515e-5,
    -0.104527497e-5,
    0.8360937017e-7,
    -0.3231081277e-8,
    0.3657763036e-10,
    0.6936233982e-12,
];

// Polynomial for the central (|x| < 1.9) normal tail.
const NORMAL_TAIL_COEFFS: [f64; 6] = [
    0.049867347,
    0.0211410061,
    0.0032776263,
    0.0000380036,
    0.0000488906,
    0.000005383,
];

// ---------------------------------------------------------------------------
// Parameter validation
// ---------------------------------------------------------------------------

/// Convert a floating-point degrees-of-freedom value into the typed form,
/// rejecting non-positive, fractional and non-finite values.
pub fn degrees_of_freedom(value: f64) -> Result<u32> {
    if !value.is_finite() || value <= 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(StatsError::Domain(format!(
            "degrees of freedom must be a positive integer, got {}",
            value
        )));
    }
    Ok(value as u32)
}

fn check_df(n: u32, name: &str) -> Result<()> {
    if n == 0 {
        return Err(StatsError::Domain(format!("{} must be a positive integer, got 0", name)));
    }
    Ok(())
}

/// `p` in (0, 1].
fn check_p_half_open(p: f64) -> Result<()> {
    if p.is_nan() || p <= 0.0 || p > 1.0 {
        return Err(StatsError::Domain(format!("p must be in (0, 1], got {}", p)));
    }
    Ok(())
}

/// `p` in (0, 1).
fn check_p_open(p: f64) -> Result<()> {
    if p.is_nan() || p <= 0.0 || p >= 1.0 {
        return Err(StatsError::Domain(format!("p must be in (0, 1), got {}", p)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rounding
// ---------------------------------------------------------------------------

/// Round `x` to five significant digits (for |x| < 1e5; larger values keep
/// `|⌊log10|x|⌋ - 5|` decimals). Zero and non-finite values pass through.
pub fn round_significant(x: f64) -> f64 {
    if x == 0.0 || !x.is_finite() {
        return x;
    }
    let decimals = (x.abs().log10().trunc() - SIGNIFICANT).abs();
    round_to_decimals(x, decimals as i32)
}

/// Round `x` to a fixed number of decimal places.
pub fn round_to_decimals(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    if !scale.is_finite() || !(x * scale).is_finite() {
        return x;
    }
    (x * scale).round() / scale
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Upper critical value `u` of the standard normal: `P(Z > u) = p`, `p` in (0, 1].
pub fn normal_quantile(p: f64) -> Result<f64> {
    check_p_half_open(p)?;
    Ok(round_significant(normal_critical(p)))
}

/// `P(Z > x) = 1 - Φ(x)`. Exactly 0 for `x > 100`, 1 for `x < -100`.
pub fn normal_upper_tail(x: f64) -> f64 {
    round_significant(upper_normal(x))
}

/// Upper critical value of the chi-square distribution with `n` degrees of freedom.
pub fn chi_square_quantile(n: u32, p: f64) -> Result<f64> {
    check_df(n, "degrees of freedom")?;
    check_p_half_open(p)?;
    Ok(round_significant(chi_square_critical(n, p)))
}

/// `P(X > x)` for a chi-square variable with `n` degrees of freedom.
pub fn chi_square_upper_tail(n: u32, x: f64) -> Result<f64> {
    check_df(n, "degrees of freedom")?;
    Ok(round_significant(chi_square_tail(n, x)))
}

/// Upper critical value of Student's t with `n` degrees of freedom, `p` in (0, 1).
pub fn student_t_quantile(n: u32, p: f64) -> Result<f64> {
    check_df(n, "degrees of freedom")?;
    check_p_open(p)?;
    Ok(round_significant(student_t_critical(n, p)))
}

/// `P(T > x)` for Student's t with `n` degrees of freedom.
pub fn student_t_upper_tail(n: u32, x: f64) -> Result<f64> {
    check_df(n, "degrees of freedom")?;
    Ok(round_significant(student_t_tail(n, x)))
}

/// Upper critical value of F(n, m), `p` in (0, 1).
pub fn f_quantile(n: u32, m: u32, p: f64) -> Result<f64> {
    check_df(n, "numerator degrees of freedom")?;
    check_df(m, "denominator degrees of freedom")?;
    check_p_open(p)?;
    Ok(round_significant(f_critical(n, m, p)))
}

/// `P(F > x)` for F(n, m).
pub fn f_upper_tail(n: u32, m: u32, x: f64) -> Result<f64> {
    check_df(n, "numerator degrees of freedom")?;
    check_df(m, "denominator degrees of freedom")?;
    Ok(round_significant(f_tail(n, m, x)))
}

// ---------------------------------------------------------------------------
// Standard normal
// ---------------------------------------------------------------------------

/// `c0 + x·(c1 + x·(c2 + ...))`, seeded with the last coefficient so an
/// infinite `x` stays infinite instead of producing `0·∞`.
fn horner(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().copied().reduce(|acc, c| acc * x + c).unwrap_or(0.0)
}

/// Unrounded, unchecked normal critical value.
pub(crate) fn normal_critical(p: f64) -> f64 {
    let y = -(4.0 * p * (1.0 - p)).ln();
    let x = (y * horner(&NORMAL_CRITICAL_COEFFS, y)).sqrt();
    if p > 0.5 { -x } else { x }
}

/// Unrounded normal upper tail.
pub(crate) fn upper_normal(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let abs_x = x.abs();
    let p = if abs_x < 1.9 {
        (1.0 + abs_x * horner(&NORMAL_TAIL_COEFFS, abs_x)).powi(-16) / 2.0
    } else if abs_x <= 100.0 {
        // Continued fraction for the Mills ratio.
        let mut cf = 0.0;
        for i in (1..=18).rev() {
            cf = i as f64 / (abs_x + cf);
        }
        (-0.5 * abs_x * abs_x).exp() / (2.0 * PI).sqrt() / (abs_x + cf)
    } else {
        0.0
    };
    if x < 0.0 { 1.0 - p } else { p }
}

// ---------------------------------------------------------------------------
// Chi-square
// ---------------------------------------------------------------------------

pub(crate) fn chi_square_tail(n: u32, x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    let nf = n as f64;
    if n > 100 {
        // Wilson–Hilferty cube-root transform.
        let scale = 2.0 / 9.0 / nf;
        return upper_normal(((x / nf).powf(1.0 / 3.0) - (1.0 - scale)) / scale.sqrt());
    }
    if x > 400.0 {
        return 0.0;
    }

    let (mut p, mut term, start) = if n % 2 != 0 {
        let term = (2.0 / PI).sqrt() * (-x / 2.0).exp() / x.sqrt();
        (2.0 * upper_normal(x.sqrt()), term, 1)
    } else {
        let term = (-x / 2.0).exp();
        (term, term, 2)
    };
    let mut i = start;
    while i + 2 <= n {
        term *= x / i as f64;
        p += term;
        i += 2;
    }
    p
}

pub(crate) fn chi_square_critical(n: u32, p: f64) -> f64 {
    if p >= 1.0 {
        return 0.0;
    }
    match n {
        1 => normal_critical(p / 2.0).powi(2),
        2 => -2.0 * p.ln(),
        _ => {
            let nf = n as f64;
            let u = normal_critical(p);
            let u2 = u * u;
            let root = (2.0 * nf).sqrt();
            let seed = (nf + root * u + 2.0 / 3.0 * (u2 - 1.0) + u * (u2 - 7.0) / 9.0 / root
                - 2.0 / 405.0 / nf * (u2 * (3.0 * u2 + 7.0) - 16.0))
                .max(0.0);
            if n > 100 { seed } else { refine_chi_square(n, p, seed, MAX_NEWTON_ITERATIONS) }
        }
    }
}

/// Newton refinement of a chi-square critical value against its tail,
/// using a Stirling form of the density for the slope.
fn refine_chi_square(n: u32, p: f64, seed: f64, max_iterations: usize) -> f64 {
    let nf = n as f64;
    let mut x = if seed > 0.0 { seed } else { MIN_CHI_SQUARE_SEED };
    for _ in 0..max_iterations {
        let density = (((nf - 1.0) * (x / nf).ln() - (4.0 * PI * x).ln() + nf - x - 1.0 / nf / 6.0)
            / 2.0)
            .exp();
        let delta = (chi_square_tail(n, x) - p) / density;
        if !delta.is_finite() {
            warn!(n, p, x, "chi-square refinement produced a non-finite step");
            return x;
        }
        let mut next = x + delta;
        if next <= 0.0 {
            next = x / 2.0;
        }
        let step = (next - x).abs();
        x = next;
        if step < CHI_SQUARE_TOLERANCE {
            return x;
        }
    }
    warn!(n, p, x, "chi-square refinement hit the iteration cap");
    x
}

// ---------------------------------------------------------------------------
// Student-t
// ---------------------------------------------------------------------------

/// Exact for integer `n`: series in `cos²(atan(x/√n))`.
pub(crate) fn student_t_tail(n: u32, x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let nf = n as f64;
    let w = (x / nf.sqrt()).atan2(1.0);
    let z = w.cos().powi(2);
    let mut y = 1.0;
    let mut i = n as i64 - 2;
    while i >= 2 {
        y = 1.0 + (i - 1) as f64 / i as f64 * z * y;
        i -= 2;
    }
    let (a, b) = if n % 2 == 0 {
        (w.sin() / 2.0, 0.5)
    } else if n == 1 {
        (0.0, 0.5 + w / PI)
    } else {
        (w.sin() * w.cos() / PI, 0.5 + w / PI)
    };
    (1.0 - b - a * y).max(0.0)
}

pub(crate) fn student_t_critical(n: u32, p: f64) -> f64 {
    if p == 0.5 {
        return 0.0;
    }
    if p < 0.5 {
        return -student_t_critical(n, 1.0 - p);
    }

    // Cornish–Fisher expansion around the normal critical value.
    let nf = n as f64;
    let u = normal_critical(p);
    let u2 = u * u;
    let a = (u2 + 1.0) / 4.0;
    let b = ((5.0 * u2 + 16.0) * u2 + 3.0) / 96.0;
    let c = (((3.0 * u2 + 19.0) * u2 + 17.0) * u2 - 15.0) / 384.0;
    let d = ((((79.0 * u2 + 776.0) * u2 + 1482.0) * u2 - 1920.0) * u2 - 945.0) / 92160.0;
    let e = (((((27.0 * u2 + 339.0) * u2 + 930.0) * u2 - 1782.0) * u2 - 765.0) * u2 + 17955.0)
        / 368640.0;
    let x = u * (1.0 + (a + (b + (c + (d + e / nf) / nf) / nf) / nf) / nf);

    if nf <= p.log10().powi(2) + 3.0 {
        refine_student_t(n, p, x, MAX_NEWTON_ITERATIONS)
    } else {
        x
    }
}

fn refine_student_t(n: u32, p: f64, seed: f64, max_iterations: usize) -> f64 {
    let nf = n as f64;
    let n1 = nf + 1.0;
    let mut x = seed;
    for _ in 0..max_iterations {
        let density = ((n1 * (n1 / (nf + x * x)).ln() + (nf / n1 / 2.0 / PI).ln() - 1.0
            + (1.0 / n1 - 1.0 / nf) / 6.0)
            / 2.0)
            .exp();
        let delta = (student_t_tail(n, x) - p) / density;
        if !delta.is_finite() {
            warn!(n, p, x, "t refinement produced a non-finite step");
            return x;
        }
        x += delta;
        if x == 0.0 || delta.abs() < STUDENT_T_TOLERANCE * x.abs().max(1.0) {
            return x;
        }
    }
    warn!(n, p, x, "t refinement hit the iteration cap");
    x
}

// ---------------------------------------------------------------------------
// F
// ---------------------------------------------------------------------------

pub(crate) fn f_tail(n: u32, m: u32, x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    let (nf, mf) = (n as f64, m as f64);

    if m % 2 == 0 {
        let z = mf / (mf + nf * x);
        let mut a = 1.0;
        let mut i = m as i64 - 2;
        while i >= 2 {
            a = 1.0 + (nf + i as f64 - 2.0) / i as f64 * z * a;
            i -= 2;
        }
        (1.0 - (1.0 - z).powf(nf / 2.0) * a).max(0.0)
    } else if n % 2 == 0 {
        let z = nf * x / (mf + nf * x);
        let mut a = 1.0;
        let mut i = n as i64 - 2;
        while i >= 2 {
            a = 1.0 + (mf + i as f64 - 2.0) / i as f64 * z * a;
            i -= 2;
        }
        (1.0 - z).powf(mf / 2.0) * a
    } else {
        // Both odd: angular substitution.
        let y = (nf * x / mf).sqrt().atan2(1.0);
        let mut z = y.sin().powi(2);
        let mut a = if n == 1 { 0.0 } else { 1.0 };
        let mut i = n as i64 - 2;
        while i >= 3 {
            a = 1.0 + (mf + i as f64 - 2.0) / i as f64 * z * a;
            i -= 2;
        }
        let mut b = PI;
        let mut k = 2;
        while k < m {
            b *= (k - 1) as f64 / k as f64;
            k += 2;
        }
        let p1 = 2.0 / b * y.sin() * y.cos().powi(m as i32) * a;

        z = y.cos().powi(2);
        a = if m == 1 { 0.0 } else { 1.0 };
        let mut i = m as i64 - 2;
        while i >= 3 {
            a = 1.0 + (i - 1) as f64 / i as f64 * z * a;
            i -= 2;
        }
        (p1 + 1.0 - 2.0 * y / PI - 2.0 / PI * y.sin() * y.cos() * a).max(0.0)
    }
}

pub(crate) fn f_critical(n: u32, m: u32, p: f64) -> f64 {
    let nf = n as f64;
    if m == 1 {
        1.0 / student_t_critical(n, 0.5 - p / 2.0).powi(2)
    } else if n == 1 {
        student_t_critical(m, p / 2.0).powi(2)
    } else if m == 2 {
        // Exact inverse of the m = 2 tail, 1 − (1 − z)^{n/2} with z = 2/(2 + n·x).
        let z = -((2.0 / nf) * (-p).ln_1p()).exp_m1();
        2.0 / nf * (1.0 / z - 1.0)
    } else if n > m {
        1.0 / refine_f(m, n, 1.0 - p)
    } else {
        refine_f(n, m, p)
    }
}

/// Chi-square based seed for F(n, m), refined by Newton steps on `f_tail`.
fn refine_f(n: u32, m: u32, p: f64) -> f64 {
    newton_f(n, m, p, f_seed(n, m, p), MAX_NEWTON_ITERATIONS)
}

fn f_seed(n: u32, m: u32, p: f64) -> f64 {
    let (nf, mf) = (n as f64, m as f64);
    let u = chi_square_critical(n, p);
    let n2 = nf - 2.0;
    let x = u / nf
        * (1.0
            + ((u - n2) / 2.0
                + (((4.0 * u - 11.0 * n2) * u + n2 * (7.0 * nf - 10.0)) / 24.0
                    + (((2.0 * u - 10.0 * n2) * u + n2 * (17.0 * nf - 26.0)) * u
                        - n2 * n2 * (9.0 * nf - 6.0))
                        / 48.0
                        / mf)
                    / mf)
                / mf);
    if x <= 0.0 { MIN_CHI_SQUARE_SEED } else { x }
}

fn newton_f(n: u32, m: u32, p: f64, seed: f64, max_iterations: usize) -> f64 {
    let (nf, mf) = (n as f64, m as f64);
    let mut x = seed;
    for _ in 0..max_iterations {
        let density = (((nf + mf) * ((nf + mf) / (nf * x + mf)).ln()
            + (nf - 2.0) * x.ln()
            + (nf * mf / (nf + mf)).ln()
            - (4.0 * PI).ln()
            - (1.0 / nf + 1.0 / mf - 1.0 / (nf + mf)) / 6.0)
            / 2.0)
            .exp();
        let delta = (f_tail(n, m, x) - p) / density;
        if !delta.is_finite() {
            warn!(n, m, p, x, "F refinement produced a non-finite step");
            return x;
        }
        let next = x + delta;
        x = if next > 0.0 { next } else { x / 2.0 };
        if delta.abs() <= F_TOLERANCE {
            return x;
        }
    }
    warn!(n, m, p, x, "F refinement hit the iteration cap");
    x
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
