use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Week,
    Month,
    Quarter,
}

impl Granularity {
    pub fn code(self) -> &'static str {
        match self {
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

/// Trailing period used for historical comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendWindow {
    #[serde(rename = "12w")]
    Weeks12,
    #[serde(rename = "6m")]
    Months6,
    #[serde(rename = "4q")]
    Quarters4,
}

impl TrendWindow {
    pub fn buckets(self) -> usize {
        match self {
            TrendWindow::Weeks12 => 12,
            TrendWindow::Months6 => 6,
            TrendWindow::Quarters4 => 4,
        }
    }

    pub fn granularity(self) -> Granularity {
        match self {
            TrendWindow::Weeks12 => Granularity::Week,
            TrendWindow::Months6 => Granularity::Month,
            TrendWindow::Quarters4 => Granularity::Quarter,
        }
    }

    /// Points requested from the series source so that every point inside
    /// the window has a full trailing window of its own.
    pub fn lookback(self) -> usize {
        self.buckets() * 2
    }

    pub fn code(self) -> &'static str {
        match self {
            TrendWindow::Weeks12 => "12w",
            TrendWindow::Months6 => "6m",
            TrendWindow::Quarters4 => "4q",
        }
    }
}

impl fmt::Display for TrendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TrendWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "12w" | "weeks12" => Ok(TrendWindow::Weeks12),
            "6m" | "months6" => Ok(TrendWindow::Months6),
            "4q" | "quarters4" => Ok(TrendWindow::Quarters4),
            other => Err(format!("unknown trend window '{other}' (expected 12w, 6m or 4q)")),
        }
    }
}

/// Anomaly classification of a KPI period. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    NoRef,
    Ok,
    Warn,
    Alert,
}

impl Flag {
    pub fn code(self) -> &'static str {
        match self {
            Flag::NoRef => "no_ref",
            Flag::Ok => "ok",
            Flag::Warn => "warn",
            Flag::Alert => "alert",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_ref" => Ok(Flag::NoRef),
            "ok" => Ok(Flag::Ok),
            "warn" => Ok(Flag::Warn),
            "alert" => Ok(Flag::Alert),
            other => Err(format!("unknown flag '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSample {
    pub month: NaiveDate,
    pub avg_value: f64,
}

impl TrendSample {
    pub fn new(month: NaiveDate, avg_value: f64) -> Self {
        Self { month, avg_value }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiMonthlyPoint {
    pub kpi_key: String,
    pub month: NaiveDate,
    pub avg_value: f64,
    pub prev_avg: Option<f64>,
    pub delta_pct: Option<f64>,
    pub zscore: Option<f64>,
    pub flag: Flag,
}

/// Current and previous aggregate for one dimensional slice of a KPI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceAggregate {
    pub dim_key: String,
    pub dim_value: String,
    pub current_value: f64,
    pub previous_value: Option<f64>,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaContributor {
    pub kpi_key: String,
    pub month: NaiveDate,
    pub dim_key: String,
    pub dim_value: String,
    pub delta_pct: f64,
    pub contribution_score: f64,
    pub share_ratio: f64,
    pub rank: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    TargetedTraining,
    ManagerEscalation,
    ProcessReview,
    CampaignRelaunch,
    Monitor,
}

impl ActionType {
    pub fn code(self) -> &'static str {
        match self {
            ActionType::TargetedTraining => "TARGETED_TRAINING",
            ActionType::ManagerEscalation => "MANAGER_ESCALATION",
            ActionType::ProcessReview => "PROCESS_REVIEW",
            ActionType::CampaignRelaunch => "CAMPAIGN_RELAUNCH",
            ActionType::Monitor => "MONITOR",
        }
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGETED_TRAINING" => Ok(ActionType::TargetedTraining),
            "MANAGER_ESCALATION" => Ok(ActionType::ManagerEscalation),
            "PROCESS_REVIEW" => Ok(ActionType::ProcessReview),
            "CAMPAIGN_RELAUNCH" => Ok(ActionType::CampaignRelaunch),
            "MONITOR" => Ok(ActionType::Monitor),
            other => Err(format!("unknown action type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    pub fn code(self) -> &'static str {
        match self {
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
        }
    }
}

impl FromStr for ImpactLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ImpactLevel::Low),
            "medium" => Ok(ImpactLevel::Medium),
            "high" => Ok(ImpactLevel::High),
            other => Err(format!("unknown impact level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortEstimate {
    Hours,
    Days,
    Weeks,
}

impl EffortEstimate {
    pub fn code(self) -> &'static str {
        match self {
            EffortEstimate::Hours => "hours",
            EffortEstimate::Days => "days",
            EffortEstimate::Weeks => "weeks",
        }
    }
}

impl FromStr for EffortEstimate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hours" => Ok(EffortEstimate::Hours),
            "days" => Ok(EffortEstimate::Days),
            "weeks" => Ok(EffortEstimate::Weeks),
            other => Err(format!("unknown effort estimate '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Open,
    Actioned,
    Dismissed,
}

impl RecommendationStatus {
    pub fn code(self) -> &'static str {
        match self {
            RecommendationStatus::Open => "open",
            RecommendationStatus::Actioned => "actioned",
            RecommendationStatus::Dismissed => "dismissed",
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, RecommendationStatus::Open)
    }
}

impl FromStr for RecommendationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RecommendationStatus::Open),
            "actioned" => Ok(RecommendationStatus::Actioned),
            "dismissed" => Ok(RecommendationStatus::Dismissed),
            other => Err(format!("unknown recommendation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub kpi_key: String,
    pub month: NaiveDate,
    pub dim_key: String,
    pub dim_value: String,
    pub title: String,
    pub body: String,
    pub action_type_code: ActionType,
    pub impact_level: ImpactLevel,
    pub effort_estimate: EffortEstimate,
    pub status: RecommendationStatus,
    pub catalog_version: u32,
}

impl Recommendation {
    /// True when both records would tell the reader the same thing.
    pub fn same_content(&self, other: &Recommendation) -> bool {
        self.dim_key == other.dim_key
            && self.dim_value == other.dim_value
            && self.title == other.title
            && self.body == other.body
            && self.action_type_code == other.action_type_code
            && self.impact_level == other.impact_level
            && self.effort_estimate == other.effort_estimate
            && self.catalog_version == other.catalog_version
    }
}

/// Stored flag summary for one KPI period, as read back for quarterly rollups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub kpi_key: String,
    pub month: NaiveDate,
    pub avg_value: f64,
    pub flag: Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initiative {
    pub id: Uuid,
    pub title: String,
    pub kpi_key: Option<String>,
    pub impact_score: f64,
    pub status: String,
    pub month: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiQuarterSummary {
    pub kpi_key: String,
    pub months_observed: usize,
    pub mean_value: f64,
    pub latest_flag: Flag,
    pub worst_flag: Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlyInsight {
    pub year: i32,
    pub quarter: u32,
    pub kpis: Vec<KpiQuarterSummary>,
    pub top_initiatives: Vec<Initiative>,
    pub generated_at: DateTime<Utc>,
}
