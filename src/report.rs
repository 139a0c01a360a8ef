use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{Flag, KpiMonthlyPoint, RcaContributor, Recommendation, TrendWindow};

pub fn count_by_flag(points: &[KpiMonthlyPoint]) -> Vec<(Flag, usize)> {
    let mut counts: BTreeMap<Flag, usize> = BTreeMap::new();
    for point in points {
        *counts.entry(point.flag).or_default() += 1;
    }
    // most severe first
    counts.into_iter().rev().collect()
}

fn fmt_opt(value: Option<f64>, suffix: &str) -> String {
    match value {
        Some(v) => format!("{v:+.1}{suffix}"),
        None => "n/a".to_string(),
    }
}

pub fn build_report(
    scope: &str,
    kpi_key: &str,
    window: TrendWindow,
    points: &[KpiMonthlyPoint],
    contributors: &[RcaContributor],
    recommendations: &[Recommendation],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Gate-K KPI Report: {kpi_key}");
    let _ = writeln!(output, "Generated for {scope} (trend window {window})");
    let _ = writeln!(output);

    if points.is_empty() {
        let _ = writeln!(output, "No data available.");
        return output;
    }

    let _ = writeln!(output, "## Flag Mix");
    for (flag, count) in count_by_flag(points) {
        let _ = writeln!(output, "- {flag}: {count} periods");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Trend");
    let _ = writeln!(output, "| period | value | delta | zscore | flag |");
    let _ = writeln!(output, "|---|---|---|---|---|");
    for point in points {
        let _ = writeln!(
            output,
            "| {} | {:.2} | {} | {} | {} |",
            point.month,
            point.avg_value,
            fmt_opt(point.delta_pct, "%"),
            fmt_opt(point.zscore, ""),
            point.flag
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Contributors");
    if contributors.is_empty() {
        let _ = writeln!(output, "No dimensional breakdown for the latest period.");
    } else {
        let mut sorted = contributors.to_vec();
        sorted.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| b.contribution_score.total_cmp(&a.contribution_score))
        });
        for contributor in sorted.iter().take(10) {
            let _ = writeln!(
                output,
                "- #{} {}={}: delta {:+.1}%, share {:.0}%, score {:.2}",
                contributor.rank,
                contributor.dim_key,
                contributor.dim_value,
                contributor.delta_pct,
                contributor.share_ratio * 100.0,
                contributor.contribution_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");
    let open: Vec<&Recommendation> = recommendations
        .iter()
        .filter(|r| !r.status.is_resolved())
        .collect();
    if open.is_empty() {
        let _ = writeln!(output, "No open recommendations.");
    } else {
        for rec in open {
            let _ = writeln!(
                output,
                "- **{}** [{}, impact {}, effort {}]: {}",
                rec.title,
                rec.action_type_code.code(),
                rec.impact_level.code(),
                rec.effort_estimate.code(),
                rec.body
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, EffortEstimate, ImpactLevel, RecommendationStatus};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn point(m: u32, value: f64, delta: Option<f64>, flag: Flag) -> KpiMonthlyPoint {
        KpiMonthlyPoint {
            kpi_key: "kpi_completion_rate".to_string(),
            month: NaiveDate::from_ymd_opt(2025, m, 1).unwrap(),
            avg_value: value,
            prev_avg: None,
            delta_pct: delta,
            zscore: None,
            flag,
        }
    }

    #[test]
    fn empty_series_reports_no_data() {
        let report = build_report(
            "tenant acme",
            "kpi_completion_rate",
            TrendWindow::Months6,
            &[],
            &[],
            &[],
        );
        assert!(report.contains("No data available."));
        assert!(!report.contains("## Trend"));
    }

    #[test]
    fn flag_mix_lists_most_severe_first() {
        let points = vec![
            point(7, 80.0, None, Flag::NoRef),
            point(8, 82.0, Some(2.5), Flag::Ok),
            point(9, 60.0, Some(-26.8), Flag::Alert),
        ];
        assert_eq!(
            count_by_flag(&points),
            vec![(Flag::Alert, 1), (Flag::Ok, 1), (Flag::NoRef, 1)]
        );
    }

    #[test]
    fn report_renders_trend_contributors_and_open_recommendations() {
        let sept = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        let points = vec![
            point(8, 82.0, None, Flag::NoRef),
            point(9, 60.0, Some(-26.83), Flag::Alert),
        ];
        let contributors = vec![RcaContributor {
            kpi_key: "kpi_completion_rate".to_string(),
            month: sept,
            dim_key: "department".to_string(),
            dim_value: "Sales".to_string(),
            delta_pct: -44.44,
            contribution_score: 35.55,
            share_ratio: 0.8,
            rank: 1,
        }];
        let open = Recommendation {
            id: Uuid::new_v4(),
            kpi_key: "kpi_completion_rate".to_string(),
            month: sept,
            dim_key: "department".to_string(),
            dim_value: "Sales".to_string(),
            title: "Targeted training for Sales".to_string(),
            body: "Assign a module.".to_string(),
            action_type_code: ActionType::TargetedTraining,
            impact_level: ImpactLevel::High,
            effort_estimate: EffortEstimate::Days,
            status: RecommendationStatus::Open,
            catalog_version: 1,
        };
        let mut dismissed = open.clone();
        dismissed.title = "Old advice".to_string();
        dismissed.status = RecommendationStatus::Dismissed;

        let report = build_report(
            "tenant acme",
            "kpi_completion_rate",
            TrendWindow::Months6,
            &points,
            &contributors,
            &[open, dismissed],
        );

        assert!(report.contains("| 2025-09-01 | 60.00 | -26.8% | n/a | alert |"));
        assert!(report.contains("- #1 department=Sales: delta -44.4%, share 80%, score 35.55"));
        assert!(report.contains("**Targeted training for Sales** [TARGETED_TRAINING"));
        assert!(!report.contains("Old advice"));
    }
}
