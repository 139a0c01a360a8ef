use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    ActionType, EffortEstimate, Flag, ImpactLevel, KpiMonthlyPoint, RcaContributor,
    Recommendation, RecommendationStatus,
};

/// Bumped whenever an entry of `CATALOG` changes wording or mapping.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Warn,
    Alert,
}

impl Severity {
    pub fn from_flag(flag: Flag) -> Option<Self> {
        match flag {
            Flag::Warn => Some(Severity::Warn),
            Flag::Alert => Some(Severity::Alert),
            Flag::Ok | Flag::NoRef => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Department,
    Region,
    Site,
    Role,
    Channel,
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "department" => Ok(Dimension::Department),
            "region" => Ok(Dimension::Region),
            "site" => Ok(Dimension::Site),
            "role" => Ok(Dimension::Role),
            "channel" => Ok(Dimension::Channel),
            other => Err(format!("no catalog dimension '{other}'")),
        }
    }
}

#[derive(Debug)]
pub struct CatalogEntry {
    pub severity: Severity,
    pub dimension: Dimension,
    pub title: &'static str,
    pub body: &'static str,
    pub action: ActionType,
    pub impact: ImpactLevel,
    pub effort: EffortEstimate,
}

// Placeholders: {kpi}, {dim_value}, {delta}, {month}.
pub static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        severity: Severity::Alert,
        dimension: Dimension::Department,
        title: "Targeted training for {dim_value}",
        body: "{kpi} moved {delta} in {month}, driven mostly by {dim_value}. Assign a focused training module to that department and review completion within two weeks.",
        action: ActionType::TargetedTraining,
        impact: ImpactLevel::High,
        effort: EffortEstimate::Days,
    },
    CatalogEntry {
        severity: Severity::Warn,
        dimension: Dimension::Department,
        title: "Check in with {dim_value} leadership",
        body: "{kpi} moved {delta} in {month}; {dim_value} is the largest contributor. Share the trend with the department lead and agree on a follow-up.",
        action: ActionType::ManagerEscalation,
        impact: ImpactLevel::Medium,
        effort: EffortEstimate::Hours,
    },
    CatalogEntry {
        severity: Severity::Alert,
        dimension: Dimension::Region,
        title: "Relaunch campaign in {dim_value}",
        body: "{kpi} moved {delta} in {month} with {dim_value} contributing most. Relaunch the awareness campaign for that region with localized content.",
        action: ActionType::CampaignRelaunch,
        impact: ImpactLevel::High,
        effort: EffortEstimate::Weeks,
    },
    CatalogEntry {
        severity: Severity::Warn,
        dimension: Dimension::Region,
        title: "Monitor {dim_value} closely",
        body: "{kpi} moved {delta} in {month}; {dim_value} leads the change. Keep the region on the watch list for the next period.",
        action: ActionType::Monitor,
        impact: ImpactLevel::Low,
        effort: EffortEstimate::Hours,
    },
    CatalogEntry {
        severity: Severity::Alert,
        dimension: Dimension::Site,
        title: "Review local process at {dim_value}",
        body: "{kpi} moved {delta} in {month}, concentrated at site {dim_value}. Review local procedures and tooling with the site owner.",
        action: ActionType::ProcessReview,
        impact: ImpactLevel::High,
        effort: EffortEstimate::Days,
    },
    CatalogEntry {
        severity: Severity::Warn,
        dimension: Dimension::Site,
        title: "Monitor site {dim_value}",
        body: "{kpi} moved {delta} in {month}; site {dim_value} contributes most. Track it through the next period before acting.",
        action: ActionType::Monitor,
        impact: ImpactLevel::Low,
        effort: EffortEstimate::Hours,
    },
    CatalogEntry {
        severity: Severity::Alert,
        dimension: Dimension::Role,
        title: "Role-specific training for {dim_value}",
        body: "{kpi} moved {delta} in {month}, driven by the {dim_value} role. Assign role-specific material and escalate overdue items to managers.",
        action: ActionType::TargetedTraining,
        impact: ImpactLevel::Medium,
        effort: EffortEstimate::Days,
    },
    CatalogEntry {
        severity: Severity::Warn,
        dimension: Dimension::Role,
        title: "Escalate {dim_value} follow-ups",
        body: "{kpi} moved {delta} in {month}; the {dim_value} role is the main contributor. Ask line managers to follow up on open items.",
        action: ActionType::ManagerEscalation,
        impact: ImpactLevel::Medium,
        effort: EffortEstimate::Hours,
    },
    CatalogEntry {
        severity: Severity::Alert,
        dimension: Dimension::Channel,
        title: "Rework delivery over {dim_value}",
        body: "{kpi} moved {delta} in {month}, mostly through the {dim_value} channel. Review message format and timing on that channel.",
        action: ActionType::ProcessReview,
        impact: ImpactLevel::Medium,
        effort: EffortEstimate::Days,
    },
];

pub fn lookup(severity: Severity, dimension: Dimension) -> Option<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|entry| entry.severity == severity && entry.dimension == dimension)
}

/// Builds the recommendation for a flagged point and its top contributor.
///
/// Returns `None` when the point is not flagged, the contributor belongs to a
/// different KPI period, or the catalog has nothing for the combination.
pub fn generate(point: &KpiMonthlyPoint, contributor: &RcaContributor) -> Option<Recommendation> {
    let severity = Severity::from_flag(point.flag)?;
    if contributor.kpi_key != point.kpi_key || contributor.month != point.month {
        tracing::warn!(
            kpi_key = %point.kpi_key,
            month = %point.month,
            contributor_kpi = %contributor.kpi_key,
            contributor_month = %contributor.month,
            "contributor does not match flagged period"
        );
        return None;
    }
    let dimension: Dimension = contributor.dim_key.parse().ok()?;
    let entry = lookup(severity, dimension)?;

    let delta = format!("{:+.1}%", point.delta_pct.unwrap_or(contributor.delta_pct));
    let month = point.month.format("%Y-%m").to_string();
    let render = |template: &str| {
        template
            .replace("{kpi}", &point.kpi_key)
            .replace("{dim_value}", &contributor.dim_value)
            .replace("{delta}", &delta)
            .replace("{month}", &month)
    };

    Some(Recommendation {
        id: Uuid::new_v4(),
        kpi_key: point.kpi_key.clone(),
        month: point.month,
        dim_key: contributor.dim_key.clone(),
        dim_value: contributor.dim_value.clone(),
        title: render(entry.title),
        body: render(entry.body),
        action_type_code: entry.action,
        impact_level: entry.impact,
        effort_estimate: entry.effort,
        status: RecommendationStatus::Open,
        catalog_version: CATALOG_VERSION,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Create(Recommendation),
    Update(Recommendation),
    Skip,
}

/// Decides how a freshly generated recommendation lands next to the ones
/// already stored for its (kpi_key, month).
///
/// An open recommendation with identical content is left alone, one with
/// different content is rewritten in place. A resolved one for the same
/// slice and action suppresses the candidate so it is never reopened.
pub fn reconcile(existing: &[Recommendation], candidate: Recommendation) -> Reconciliation {
    let same_period: Vec<&Recommendation> = existing
        .iter()
        .filter(|r| r.kpi_key == candidate.kpi_key && r.month == candidate.month)
        .collect();

    let open: Vec<&&Recommendation> = same_period
        .iter()
        .filter(|r| !r.status.is_resolved())
        .collect();
    if open.iter().any(|r| r.same_content(&candidate)) {
        return Reconciliation::Skip;
    }
    if let Some(current) = open.first() {
        return Reconciliation::Update(Recommendation {
            id: current.id,
            ..candidate
        });
    }

    let already_resolved = same_period.iter().any(|r| {
        r.status.is_resolved()
            && r.dim_key == candidate.dim_key
            && r.dim_value == candidate.dim_value
            && r.action_type_code == candidate.action_type_code
    });
    if already_resolved {
        Reconciliation::Skip
    } else {
        Reconciliation::Create(candidate)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl RegenerationSummary {
    pub fn record(&mut self, outcome: &Reconciliation) {
        match outcome {
            Reconciliation::Create(_) => self.created += 1,
            Reconciliation::Update(_) => self.updated += 1,
            Reconciliation::Skip => self.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn sept() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
    }

    fn point(flag: Flag) -> KpiMonthlyPoint {
        KpiMonthlyPoint {
            kpi_key: "kpi_completion_rate".to_string(),
            month: sept(),
            avg_value: 60.0,
            prev_avg: Some(82.0),
            delta_pct: Some(-26.83),
            zscore: Some(-1.15),
            flag,
        }
    }

    fn contributor(dim_key: &str, dim_value: &str) -> RcaContributor {
        RcaContributor {
            kpi_key: "kpi_completion_rate".to_string(),
            month: sept(),
            dim_key: dim_key.to_string(),
            dim_value: dim_value.to_string(),
            delta_pct: -44.4,
            contribution_score: 35.5,
            share_ratio: 0.8,
            rank: 1,
        }
    }

    #[test]
    fn catalog_has_one_entry_per_key() {
        let mut keys = HashSet::new();
        for entry in CATALOG {
            assert!(keys.insert((entry.severity, entry.dimension)));
        }
    }

    #[test]
    fn alert_on_department_renders_training_entry() {
        let rec = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        assert_eq!(rec.title, "Targeted training for Sales");
        assert!(rec.body.contains("kpi_completion_rate moved -26.8% in 2025-09"));
        assert_eq!(rec.action_type_code, ActionType::TargetedTraining);
        assert_eq!(rec.impact_level, ImpactLevel::High);
        assert_eq!(rec.status, RecommendationStatus::Open);
        assert_eq!(rec.catalog_version, CATALOG_VERSION);
    }

    #[test]
    fn unflagged_or_unknown_combinations_emit_nothing() {
        assert!(generate(&point(Flag::Ok), &contributor("department", "Sales")).is_none());
        assert!(generate(&point(Flag::NoRef), &contributor("department", "Sales")).is_none());
        assert!(generate(&point(Flag::Alert), &contributor("cost_center", "CC-9")).is_none());
        // channel has no warn entry
        assert!(generate(&point(Flag::Warn), &contributor("channel", "sms")).is_none());
    }

    #[test]
    fn contributor_from_another_month_is_ignored() {
        let mut other = contributor("department", "Sales");
        other.month = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        assert!(generate(&point(Flag::Alert), &other).is_none());
    }

    #[test]
    fn identical_open_recommendation_is_skipped() {
        let first = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        let again = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        assert_eq!(reconcile(&[first], again), Reconciliation::Skip);
    }

    #[test]
    fn changed_open_recommendation_is_updated_in_place() {
        let first = generate(&point(Flag::Warn), &contributor("department", "Sales")).unwrap();
        let escalated = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        match reconcile(&[first.clone()], escalated) {
            Reconciliation::Update(rec) => {
                assert_eq!(rec.id, first.id);
                assert_eq!(rec.action_type_code, ActionType::TargetedTraining);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn resolved_recommendation_is_not_reopened() {
        let mut done = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        done.status = RecommendationStatus::Dismissed;
        let again = generate(&point(Flag::Alert), &contributor("department", "Sales")).unwrap();
        assert_eq!(reconcile(&[done.clone()], again), Reconciliation::Skip);

        let different = generate(&point(Flag::Alert), &contributor("department", "IT")).unwrap();
        assert!(matches!(
            reconcile(&[done], different),
            Reconciliation::Create(_)
        ));
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = RegenerationSummary::default();
        summary.record(&Reconciliation::Skip);
        summary.record(&Reconciliation::Create(
            generate(&point(Flag::Alert), &contributor("region", "EU")).unwrap(),
        ));
        assert_eq!(
            summary,
            RegenerationSummary {
                created: 1,
                updated: 0,
                skipped: 1
            }
        );
    }
}
