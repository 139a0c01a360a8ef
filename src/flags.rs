use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::{BaselineMode, EngineConfig, FlagThresholds};
use crate::error::{EngineError, Result};
use crate::models::{Flag, KpiMonthlyPoint, TrendSample, TrendWindow};

/// Minimum number of prior points before a z-score is defined.
pub const MIN_HISTORY: usize = 2;

/// Flags every point of a KPI series against its own trailing window.
///
/// Samples may arrive unordered; they are sorted by month and a repeated
/// month keeps the last value supplied.
pub fn compute_series(
    kpi_key: &str,
    samples: &[TrendSample],
    window: TrendWindow,
    config: &EngineConfig,
) -> Result<Vec<KpiMonthlyPoint>> {
    let series = normalize(kpi_key, samples)?;
    let buckets = window.buckets();

    let points = (0..series.len())
        .map(|idx| {
            let start = (idx + 1).saturating_sub(buckets);
            evaluate(kpi_key, &series[start..=idx], config)
        })
        .collect();

    Ok(points)
}

/// Flags only the most recent point of the series.
pub fn compute_latest(
    kpi_key: &str,
    samples: &[TrendSample],
    window: TrendWindow,
    config: &EngineConfig,
) -> Result<Option<KpiMonthlyPoint>> {
    let series = normalize(kpi_key, samples)?;
    if series.is_empty() {
        return Ok(None);
    }
    let start = series.len().saturating_sub(window.buckets());
    Ok(Some(evaluate(kpi_key, &series[start..], config)))
}

fn normalize(kpi_key: &str, samples: &[TrendSample]) -> Result<Vec<(NaiveDate, f64)>> {
    let mut by_month = BTreeMap::new();
    for sample in samples {
        if !sample.avg_value.is_finite() {
            return Err(EngineError::invalid_input(format!(
                "{kpi_key} has a non-finite value for {}",
                sample.month
            )));
        }
        by_month.insert(sample.month, sample.avg_value);
    }
    Ok(by_month.into_iter().collect())
}

/// `window` is the trailing window ending at the point being flagged.
fn evaluate(kpi_key: &str, window: &[(NaiveDate, f64)], config: &EngineConfig) -> KpiMonthlyPoint {
    let (month, current) = window[window.len() - 1];
    let prior: Vec<f64> = window[..window.len() - 1].iter().map(|(_, v)| *v).collect();
    let prev_avg = prior.last().copied();

    let delta_pct = prev_avg.and_then(|prev| delta_pct(current, prev));
    let zscore = if prior.len() < MIN_HISTORY {
        None
    } else {
        match config.baseline {
            BaselineMode::TrailingInclusive => {
                let values: Vec<f64> = window.iter().map(|(_, v)| *v).collect();
                zscore(current, &values)
            }
            BaselineMode::PriorOnly => zscore(current, &prior),
        }
    };

    let flag = if prev_avg.is_none() || prior.len() < MIN_HISTORY {
        Flag::NoRef
    } else {
        classify(zscore, delta_pct, &config.thresholds)
    };

    tracing::debug!(
        kpi_key,
        %month,
        current,
        ?delta_pct,
        ?zscore,
        flag = flag.code(),
        "flagged kpi point"
    );

    KpiMonthlyPoint {
        kpi_key: kpi_key.to_string(),
        month,
        avg_value: current,
        prev_avg,
        delta_pct,
        zscore,
        flag,
    }
}

/// Percent change from `prev` to `curr`; `None` when `prev` is zero.
pub fn delta_pct(curr: f64, prev: f64) -> Option<f64> {
    if prev == 0.0 {
        return None;
    }
    let value = (curr - prev) / prev * 100.0;
    value.is_finite().then_some(value)
}

/// Z-score of `current` against `baseline` using the sample standard
/// deviation. `None` for fewer than two baseline values or zero spread.
pub fn zscore(current: f64, baseline: &[f64]) -> Option<f64> {
    let (mean, stddev) = mean_stddev(baseline)?;
    if stddev <= f64::EPSILON {
        return None;
    }
    let value = (current - mean) / stddev;
    value.is_finite().then_some(value)
}

pub fn mean_stddev(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, variance.sqrt()))
}

/// Most severe band reached by either metric. `NoRef` if neither is defined.
pub fn classify(zscore: Option<f64>, delta_pct: Option<f64>, thresholds: &FlagThresholds) -> Flag {
    let by_z = zscore.map(|z| band(z.abs(), thresholds.z_warn, thresholds.z_alert));
    let by_delta = delta_pct.map(|d| {
        band(
            d.abs(),
            thresholds.delta_warn_pct,
            thresholds.delta_alert_pct,
        )
    });

    match (by_z, by_delta) {
        (None, None) => Flag::NoRef,
        (a, b) => a.into_iter().chain(b).max().unwrap_or(Flag::NoRef),
    }
}

fn band(magnitude: f64, warn: f64, alert: f64) -> Flag {
    if magnitude >= alert {
        Flag::Alert
    } else if magnitude >= warn {
        Flag::Warn
    } else {
        Flag::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn series(values: &[f64]) -> Vec<TrendSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TrendSample::new(month(2025, 1 + i as u32), *v))
            .collect()
    }

    #[test]
    fn completion_rate_drop_is_flagged() {
        let samples = vec![
            TrendSample::new(month(2025, 7), 80.0),
            TrendSample::new(month(2025, 8), 82.0),
            TrendSample::new(month(2025, 9), 60.0),
        ];
        let point = compute_latest(
            "kpi_completion_rate",
            &samples,
            TrendWindow::Months6,
            &EngineConfig::default(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(point.month, month(2025, 9));
        assert_eq!(point.prev_avg, Some(82.0));
        let delta = point.delta_pct.unwrap();
        assert!((delta - -26.829).abs() < 0.01, "delta was {delta}");
        let z = point.zscore.unwrap();
        assert!(z < 0.0 && z.abs() < 10.0, "zscore was {z}");
        assert!(point.flag >= Flag::Warn);
    }

    #[test]
    fn short_history_is_no_ref() {
        let config = EngineConfig::default();
        for values in [&[50.0][..], &[50.0, 70.0][..]] {
            let points =
                compute_series("kpi", &series(values), TrendWindow::Months6, &config).unwrap();
            for point in points {
                assert_eq!(point.zscore, None);
                assert_eq!(point.flag, Flag::NoRef);
            }
        }
    }

    #[test]
    fn zero_previous_value_has_no_delta() {
        let points = compute_series(
            "kpi",
            &series(&[10.0, 20.0, 0.0, 15.0]),
            TrendWindow::Months6,
            &EngineConfig::default(),
        )
        .unwrap();
        let last = points.last().unwrap();
        assert_eq!(last.prev_avg, Some(0.0));
        assert_eq!(last.delta_pct, None);
        assert!(last.zscore.is_some());
        assert_ne!(last.flag, Flag::NoRef);
    }

    #[test]
    fn flat_series_has_no_zscore_but_still_classifies() {
        let point = compute_latest(
            "kpi",
            &series(&[40.0, 40.0, 40.0, 40.0]),
            TrendWindow::Months6,
            &EngineConfig::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(point.zscore, None);
        assert_eq!(point.delta_pct, Some(0.0));
        assert_eq!(point.flag, Flag::Ok);
    }

    #[test]
    fn trailing_window_limits_history() {
        // A single early outlier drops out of a four-bucket window.
        let values = [1000.0, 50.0, 51.0, 49.0, 50.0, 50.5];
        let point = compute_latest(
            "kpi",
            &series(&values),
            TrendWindow::Quarters4,
            &EngineConfig::default(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(point.flag, Flag::Ok);
    }

    #[test]
    fn prior_only_baseline_excludes_current_point() {
        let mut config = EngineConfig::default();
        config.baseline = BaselineMode::PriorOnly;
        let point = compute_latest(
            "kpi",
            &series(&[80.0, 82.0, 60.0]),
            TrendWindow::Months6,
            &config,
        )
        .unwrap()
        .unwrap();
        // mean 81, sample stddev sqrt(2)
        let expected = (60.0 - 81.0) / 2f64.sqrt();
        assert!((point.zscore.unwrap() - expected).abs() < 1e-9);
        assert_eq!(point.flag, Flag::Alert);
    }

    #[test]
    fn unordered_and_repeated_months_are_normalized() {
        let samples = vec![
            TrendSample::new(month(2025, 3), 30.0),
            TrendSample::new(month(2025, 1), 10.0),
            TrendSample::new(month(2025, 2), 99.0),
            TrendSample::new(month(2025, 2), 20.0),
        ];
        let points =
            compute_series("kpi", &samples, TrendWindow::Months6, &EngineConfig::default())
                .unwrap();
        let months: Vec<_> = points.iter().map(|p| p.month).collect();
        assert_eq!(months, vec![month(2025, 1), month(2025, 2), month(2025, 3)]);
        assert_eq!(points[1].avg_value, 20.0);
        assert_eq!(points[2].prev_avg, Some(20.0));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let result = compute_series(
            "kpi",
            &series(&[1.0, f64::NAN]),
            TrendWindow::Months6,
            &EngineConfig::default(),
        );
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
    }

    #[test]
    fn classification_uses_configured_bands() {
        let thresholds = FlagThresholds {
            z_warn: 0.5,
            z_alert: 5.0,
            delta_warn_pct: 1.0,
            delta_alert_pct: 50.0,
        };
        assert_eq!(classify(Some(0.4), Some(0.5), &thresholds), Flag::Ok);
        assert_eq!(classify(Some(-0.6), None, &thresholds), Flag::Warn);
        assert_eq!(classify(None, Some(-55.0), &thresholds), Flag::Alert);
        assert_eq!(classify(None, None, &thresholds), Flag::NoRef);
    }

    #[test]
    fn empty_series_has_no_latest_point() {
        let point =
            compute_latest("kpi", &[], TrendWindow::Weeks12, &EngineConfig::default()).unwrap();
        assert!(point.is_none());
    }
}
