//! Statistical primitives over observation values.
//!
//! All functions are pure and deterministic so that a report is a function of
//! the series content alone. Fits use the zero-based observation index as `x`.

use crate::types::{
    AnomalyResult, LinearFit, LogarithmicFit, PolynomialFit, TrendResult, VolatilityResult,
};

/// Highest polynomial order fitted for a trend.
pub const MAX_POLYNOMIAL_ORDER: usize = 10;

/// Spread below this fraction of the values' root mean square is rounding noise.
const RELATIVE_TOLERANCE: f64 = 1e-12;

/// Linear, polynomial, logarithmic and percent-change fits of `values`.
///
/// Returns `None` with fewer than two values.
pub fn trend(values: &[f64]) -> Option<TrendResult> {
    let linear = linear_regression(values)?;
    let polynomial = (2..=MAX_POLYNOMIAL_ORDER)
        .map_while(|order| polynomial_regression(values, order))
        .collect();

    Some(TrendResult {
        slope: linear.slope,
        intercept: linear.intercept,
        r_squared: linear.r_squared,
        polynomial,
        logarithmic: logarithmic_regression(values),
        percent_change: linear_regression(&percent_changes(values)),
    })
}

/// Ordinary least-squares fit of `values[i]` against `i`.
///
/// Returns `None` with fewer than two values. A constant series (up to
/// rounding) fits a flat line with R² 0.
pub fn linear_regression(values: &[f64]) -> Option<LinearFit> {
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    fit_line(&xs, values)
}

/// Least-squares fit of `values[i]` against `ln(i + 1)`.
pub fn logarithmic_regression(values: &[f64]) -> Option<LogarithmicFit> {
    let xs: Vec<f64> = (0..values.len()).map(|i| (i as f64 + 1.0).ln()).collect();
    fit_line(&xs, values).map(|fit| LogarithmicFit {
        a: fit.intercept,
        b: fit.slope,
        r_squared: fit.r_squared,
    })
}

/// Least-squares polynomial of `order` through `values[i]` against `i`.
///
/// Returns `None` unless there are more observations than coefficients. The
/// fit is solved on `x` scaled to `[0, 1]` and the coefficients are mapped
/// back to powers of the unscaled index.
pub fn polynomial_regression(values: &[f64], order: usize) -> Option<PolynomialFit> {
    let n = values.len();
    if order == 0 || n <= order + 1 {
        return None;
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    if is_constant(values, mean) {
        let mut coefficients = vec![0.0; order + 1];
        coefficients[0] = mean;
        return Some(PolynomialFit {
            order,
            coefficients,
            r_squared: 0.0,
        });
    }

    let scale = (n - 1) as f64;
    let design: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let t = i as f64 / scale;
            (0..=order).map(|p| t.powi(p as i32)).collect()
        })
        .collect();
    let scaled = solve_least_squares(design.clone(), values.to_vec())?;

    let predicted: Vec<f64> = design
        .iter()
        .map(|row| row.iter().zip(&scaled).map(|(t, c)| t * c).sum())
        .collect();
    let coefficients = scaled
        .iter()
        .enumerate()
        .map(|(p, c)| c / scale.powi(p as i32))
        .collect();

    Some(PolynomialFit {
        order,
        coefficients,
        r_squared: r_squared(values, mean, &predicted),
    })
}

/// `(v[i] - v[i-1]) / v[i-1] * 100` for every period with a non-zero base.
pub fn percent_changes(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect()
}

fn fit_line(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let n = ys.len();
    if n < 2 || xs.len() != n {
        return None;
    }

    let nf = n as f64;
    let x_mean = xs.iter().sum::<f64>() / nf;
    let y_mean = ys.iter().sum::<f64>() / nf;

    if is_constant(ys, y_mean) {
        return Some(LinearFit {
            slope: 0.0,
            intercept: y_mean,
            r_squared: 0.0,
        });
    }

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let predicted: Vec<f64> = xs.iter().map(|x| intercept + slope * x).collect();

    Some(LinearFit {
        slope,
        intercept,
        r_squared: r_squared(ys, y_mean, &predicted),
    })
}

/// `1 - SS_res / SS_tot`, or 0 when the values are constant.
fn r_squared(values: &[f64], mean: f64, predicted: &[f64]) -> f64 {
    if is_constant(values, mean) {
        return 0.0;
    }
    let ss_res: f64 = values
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    let ss_tot: f64 = values.iter().map(|y| (y - mean).powi(2)).sum();
    1.0 - ss_res / ss_tot
}

/// Whether the population standard deviation is rounding noise.
fn is_constant(values: &[f64], mean: f64) -> bool {
    let n = values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    negligible_spread(variance.sqrt(), values)
}

fn negligible_spread(std_dev: f64, values: &[f64]) -> bool {
    let n = values.len() as f64;
    let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
    std_dev <= RELATIVE_TOLERANCE * rms
}

/// Least-squares solution of `a * x ≈ b` by Householder QR.
///
/// `a` is row-major and must have at least as many rows as columns. Returns
/// `None` when `a` is rank deficient.
fn solve_least_squares(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let rows = a.len();
    let cols = a.first().map_or(0, Vec::len);
    if cols == 0 || rows < cols {
        return None;
    }

    for k in 0..cols {
        let norm = a[k..].iter().map(|row| row[k] * row[k]).sum::<f64>().sqrt();
        if norm == 0.0 {
            return None;
        }
        let alpha = if a[k][k] > 0.0 { -norm } else { norm };

        let mut v: Vec<f64> = a[k..].iter().map(|row| row[k]).collect();
        v[0] -= alpha;
        let v_norm_sq = v.iter().map(|x| x * x).sum::<f64>();

        for j in k..cols {
            let dot: f64 = v.iter().zip(&a[k..]).map(|(vi, row)| vi * row[j]).sum();
            let factor = 2.0 * dot / v_norm_sq;
            for (vi, row) in v.iter().zip(&mut a[k..]) {
                row[j] -= factor * vi;
            }
        }
        let dot: f64 = v.iter().zip(&b[k..]).map(|(vi, bi)| vi * bi).sum();
        let factor = 2.0 * dot / v_norm_sq;
        for (vi, bi) in v.iter().zip(&mut b[k..]) {
            *bi -= factor * vi;
        }
    }

    let max_diag = (0..cols).map(|k| a[k][k].abs()).fold(0.0, f64::max);
    let mut x = vec![0.0; cols];
    for k in (0..cols).rev() {
        let diag = a[k][k];
        if diag.abs() <= f64::EPSILON * max_diag * rows as f64 {
            return None;
        }
        let tail: f64 = (k + 1..cols).map(|j| a[k][j] * x[j]).sum();
        x[k] = (b[k] - tail) / diag;
    }
    Some(x)
}

/// Mean, population standard deviation and range of the values.
///
/// Returns `None` for an empty slice.
pub fn volatility(values: &[f64]) -> Option<VolatilityResult> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let std_dev = variance.sqrt();

    Some(VolatilityResult {
        mean,
        std_dev: if negligible_spread(std_dev, values) {
            0.0
        } else {
            std_dev
        },
        min,
        max,
        mean_pct_change: mean_percent_change(values),
    })
}

/// Mean of [`percent_changes`].
pub fn mean_percent_change(values: &[f64]) -> Option<f64> {
    let changes = percent_changes(values);

    if changes.is_empty() {
        None
    } else {
        Some(changes.iter().sum::<f64>() / changes.len() as f64)
    }
}

/// z-score every value against `stats` and flag those with |z| > `threshold`.
///
/// A constant series (up to rounding) has every z-score 0.
pub fn anomalies(values: &[f64], stats: &VolatilityResult, threshold: f64) -> AnomalyResult {
    let constant = negligible_spread(stats.std_dev, values);
    let z_scores: Vec<f64> = values
        .iter()
        .map(|v| {
            if constant {
                0.0
            } else {
                (v - stats.mean) / stats.std_dev
            }
        })
        .collect();

    let flagged = z_scores
        .iter()
        .enumerate()
        .filter(|(_, z)| z.abs() > threshold)
        .map(|(i, _)| i)
        .collect();

    AnomalyResult {
        threshold,
        z_scores,
        flagged,
    }
}

/// Facts about a series used to phrase its summary.
pub struct SummaryInput<'a> {
    pub series_id: &'a str,
    pub observation_count: usize,
    pub first_date: String,
    pub last_date: String,
    pub latest_value: f64,
    pub trend: &'a TrendResult,
    pub volatility: &'a VolatilityResult,
    pub anomaly: &'a AnomalyResult,
}

/// Compose a human-readable summary of the trend, volatility and anomaly results.
pub fn compose_summary(input: &SummaryInput<'_>) -> String {
    let trend = input.trend;
    let vol = input.volatility;

    let direction = if trend.slope > 0.0 {
        "rising"
    } else if trend.slope < 0.0 {
        "falling"
    } else {
        "flat"
    };

    let fit = if trend.r_squared >= 0.7 {
        "strong"
    } else if trend.r_squared >= 0.3 {
        "moderate"
    } else {
        "weak"
    };

    let mut text = format!(
        "{} has {} observations from {} to {} (latest {:.4}). \
         Trend is {} at {:.4} per observation (intercept {:.4}, R² {:.3}, {} linear fit). \
         Mean {:.4}, standard deviation {:.4}, range {:.4} to {:.4}.",
        input.series_id,
        input.observation_count,
        input.first_date,
        input.last_date,
        input.latest_value,
        direction,
        trend.slope,
        trend.intercept,
        trend.r_squared,
        fit,
        vol.mean,
        vol.std_dev,
        vol.min,
        vol.max,
    );

    if let Some(best) = trend.best_polynomial() {
        text.push_str(&format!(
            " Best polynomial fit is order {} (R² {:.3}).",
            best.order, best.r_squared
        ));
    }
    if let Some(log) = &trend.logarithmic {
        text.push_str(&format!(
            " Logarithmic fit {} (R² {:.3}).",
            log, log.r_squared
        ));
    }

    if let Some(pct) = vol.mean_pct_change {
        text.push_str(&format!(" Average change per period {:+.3}%.", pct));
    }
    if let Some(pct_fit) = &trend.percent_change {
        let pace = if pct_fit.slope > 0.0 {
            "accelerating"
        } else if pct_fit.slope < 0.0 {
            "decelerating"
        } else {
            "steady"
        };
        text.push_str(&format!(
            " Percent change is {} at {:+.4} points per period (R² {:.3}).",
            pace, pct_fit.slope, pct_fit.r_squared
        ));
    }

    match input.anomaly.flagged.len() {
        0 => text.push_str(&format!(
            " No observations exceed |z| > {}.",
            input.anomaly.threshold
        )),
        n => text.push_str(&format!(
            " {} observation(s) exceed |z| > {} (positions {}).",
            n,
            input.anomaly.threshold,
            input
                .anomaly
                .flagged
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }

    text
}
