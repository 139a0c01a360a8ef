use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{Initiative, KpiQuarterSummary, KpiSummary, QuarterlyInsight};

/// First day of each month in the quarter.
pub fn quarter_months(year: i32, quarter: u32) -> Result<[NaiveDate; 3]> {
    if !(1..=4).contains(&quarter) {
        return Err(EngineError::invalid_input(format!(
            "quarter must be between 1 and 4, got {quarter}"
        )));
    }
    let first = (quarter - 1) * 3 + 1;
    let month = |m: u32| {
        NaiveDate::from_ymd_opt(year, m, 1)
            .ok_or_else(|| EngineError::invalid_input(format!("year {year} is out of range")))
    };
    Ok([month(first)?, month(first + 1)?, month(first + 2)?])
}

/// Half-open `[start, end)` date range covering the quarter.
pub fn quarter_range(year: i32, quarter: u32) -> Result<(NaiveDate, NaiveDate)> {
    let [start, _, last] = quarter_months(year, quarter)?;
    let end = if last.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, last.month() + 1, 1)
    }
    .ok_or_else(|| EngineError::invalid_input(format!("year {year} is out of range")))?;
    Ok((start, end))
}

pub fn build_insight(
    year: i32,
    quarter: u32,
    summaries: &[KpiSummary],
    initiatives: &[Initiative],
    limit: usize,
    generated_at: DateTime<Utc>,
) -> Result<QuarterlyInsight> {
    let (start, end) = quarter_range(year, quarter)?;
    let in_quarter = |month: NaiveDate| month >= start && month < end;

    let mut by_kpi: BTreeMap<&str, Vec<&KpiSummary>> = BTreeMap::new();
    for summary in summaries.iter().filter(|s| in_quarter(s.month)) {
        by_kpi.entry(summary.kpi_key.as_str()).or_default().push(summary);
    }

    let kpis = by_kpi
        .into_iter()
        .filter_map(|(kpi_key, rows)| {
            let latest = rows.iter().max_by_key(|r| r.month)?;
            let worst = rows.iter().map(|r| r.flag).max()?;
            let mean_value = rows.iter().map(|r| r.avg_value).sum::<f64>() / rows.len() as f64;
            let mut months: Vec<NaiveDate> = rows.iter().map(|r| r.month).collect();
            months.sort();
            months.dedup();
            Some(KpiQuarterSummary {
                kpi_key: kpi_key.to_string(),
                months_observed: months.len(),
                mean_value,
                latest_flag: latest.flag,
                worst_flag: worst,
            })
        })
        .collect();

    let mut top_initiatives: Vec<Initiative> = initiatives
        .iter()
        .filter(|i| in_quarter(i.month))
        .cloned()
        .collect();
    top_initiatives.sort_by(|a, b| {
        b.impact_score
            .total_cmp(&a.impact_score)
            .then_with(|| a.title.cmp(&b.title))
    });
    top_initiatives.truncate(limit.max(1));

    Ok(QuarterlyInsight {
        year,
        quarter,
        kpis,
        top_initiatives,
        generated_at,
    })
}

/// Result of regenerating one quarter. `created` is 0 and `updated` 1 when a
/// prior insight for the same period was replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightOutcome {
    pub created: usize,
    pub updated: usize,
    pub kpis_count: usize,
    pub initiatives_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Flag;
    use uuid::Uuid;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn summary(kpi: &str, month: NaiveDate, value: f64, flag: Flag) -> KpiSummary {
        KpiSummary {
            kpi_key: kpi.to_string(),
            month,
            avg_value: value,
            flag,
        }
    }

    fn initiative(title: &str, month: NaiveDate, impact: f64) -> Initiative {
        Initiative {
            id: Uuid::new_v4(),
            title: title.to_string(),
            kpi_key: None,
            impact_score: impact,
            status: "active".to_string(),
            month,
        }
    }

    #[test]
    fn quarter_months_cover_q3() {
        assert_eq!(
            quarter_months(2025, 3).unwrap(),
            [date(2025, 7), date(2025, 8), date(2025, 9)]
        );
        assert_eq!(
            quarter_range(2025, 4).unwrap(),
            (date(2025, 10), date(2026, 1))
        );
        assert!(quarter_months(2025, 5).is_err());
        assert!(quarter_months(2025, 0).is_err());
    }

    #[test]
    fn rollup_summarizes_each_kpi_in_quarter() {
        let summaries = vec![
            summary("kpi_completion_rate", date(2025, 7), 80.0, Flag::NoRef),
            summary("kpi_completion_rate", date(2025, 8), 82.0, Flag::Ok),
            summary("kpi_completion_rate", date(2025, 9), 60.0, Flag::Alert),
            summary("kpi_phish_click_rate", date(2025, 9), 4.0, Flag::Warn),
            summary("kpi_completion_rate", date(2025, 10), 61.0, Flag::Ok),
        ];
        let insight = build_insight(2025, 3, &summaries, &[], 10, Utc::now()).unwrap();

        assert_eq!(insight.kpis.len(), 2);
        let completion = &insight.kpis[0];
        assert_eq!(completion.kpi_key, "kpi_completion_rate");
        assert_eq!(completion.months_observed, 3);
        assert!((completion.mean_value - 74.0).abs() < 1e-9);
        assert_eq!(completion.latest_flag, Flag::Alert);
        assert_eq!(completion.worst_flag, Flag::Alert);
    }

    #[test]
    fn initiatives_are_ranked_and_limited() {
        let initiatives = vec![
            initiative("Phishing drill", date(2025, 8), 7.0),
            initiative("MFA rollout", date(2025, 7), 9.0),
            initiative("Badge audit", date(2025, 9), 7.0),
            initiative("Old program", date(2025, 3), 10.0),
        ];
        let insight = build_insight(2025, 3, &[], &initiatives, 2, Utc::now()).unwrap();
        let titles: Vec<_> = insight.top_initiatives.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["MFA rollout", "Badge audit"]);
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let initiatives = vec![
            initiative("A", date(2025, 7), 1.0),
            initiative("B", date(2025, 7), 2.0),
        ];
        let insight = build_insight(2025, 3, &[], &initiatives, 0, Utc::now()).unwrap();
        assert_eq!(insight.top_initiatives.len(), 1);
    }
}
