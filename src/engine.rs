use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::access::{Permission, TenantContext};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flags;
use crate::insight::{self, InsightOutcome};
use crate::models::{Flag, KpiMonthlyPoint, RcaContributor, Recommendation, TrendWindow};
use crate::rca::{self, RankedBreakdown};
use crate::recommend::{self, Reconciliation, RegenerationSummary};
use crate::store::AnalyticsStore;

#[derive(Debug, Clone, Serialize)]
pub struct FlagRun {
    pub kpi_key: String,
    pub window: TrendWindow,
    /// Points inside the trend window, oldest first.
    pub points: Vec<KpiMonthlyPoint>,
    pub written: usize,
}

impl FlagRun {
    pub fn latest(&self) -> Option<&KpiMonthlyPoint> {
        self.points.last()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RcaRun {
    pub kpi_key: String,
    pub month: NaiveDate,
    pub breakdowns: Vec<RankedBreakdown>,
    pub written: usize,
}

impl RcaRun {
    pub fn top_contributor(&self) -> Option<&RcaContributor> {
        rca::top_contributor(&self.breakdowns)
    }
}

/// Stored RCA rows and recommendations of one KPI month.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodDetail {
    pub contributors: Vec<RcaContributor>,
    pub recommendations: Vec<Recommendation>,
}

impl PeriodDetail {
    /// Best stored rank-1 contributor across dimensions.
    pub fn top_contributor(&self) -> Option<&RcaContributor> {
        rca::strongest(self.contributors.iter().filter(|c| c.rank == 1))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub kpi_key: String,
    pub month: Option<NaiveDate>,
    pub flag: Option<Flag>,
    pub flags_written: usize,
    pub contributors_written: usize,
    pub recommendations: RegenerationSummary,
}

async fn flag_points<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    config: &EngineConfig,
    kpi_key: &str,
    window: TrendWindow,
) -> Result<Vec<KpiMonthlyPoint>> {
    let samples = store.fetch_series(ctx.tenant_id, kpi_key, window).await?;
    let mut points = flags::compute_series(kpi_key, &samples, window, config)?;
    let keep_from = points.len().saturating_sub(window.buckets());
    Ok(points.split_off(keep_from))
}

/// Computes the flags of the trend window without writing them.
pub async fn preview_flags<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    config: &EngineConfig,
    kpi_key: &str,
    window: TrendWindow,
) -> Result<FlagRun> {
    ctx.require(Permission::KpiRead)?;
    let points = flag_points(ctx, store, config, kpi_key, window).await?;
    Ok(FlagRun {
        kpi_key: kpi_key.to_string(),
        window,
        points,
        written: 0,
    })
}

/// Reads what earlier runs stored for a KPI month.
pub async fn period_detail<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    kpi_key: &str,
    month: NaiveDate,
) -> Result<PeriodDetail> {
    ctx.require(Permission::KpiRead)?;
    let contributors = store
        .fetch_contributors(ctx.tenant_id, kpi_key, month)
        .await?;
    let recommendations = store
        .fetch_recommendations(ctx.tenant_id, kpi_key, month)
        .await?;
    Ok(PeriodDetail {
        contributors,
        recommendations,
    })
}

/// Recomputes and upserts the flags of every point inside the trend window.
#[instrument(
    name = "gatek.flags",
    skip_all,
    fields(tenant_id = %ctx.tenant_id, kpi_key = %kpi_key, window = %window)
)]
pub async fn refresh_flags<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    config: &EngineConfig,
    kpi_key: &str,
    window: TrendWindow,
) -> Result<FlagRun> {
    ctx.require(Permission::KpiRead)?;
    ctx.require(Permission::KpiWrite)?;

    let points = flag_points(ctx, store, config, kpi_key, window).await?;
    let written = if points.is_empty() {
        0
    } else {
        store
            .upsert_flags(ctx.tenant_id, window.granularity(), &points)
            .await?
    };

    info!(
        written,
        latest_flag = points.last().map(|p| p.flag.code()).unwrap_or("none"),
        "refreshed kpi flags"
    );
    Ok(FlagRun {
        kpi_key: kpi_key.to_string(),
        window,
        points,
        written,
    })
}

/// Ranks contributors for every catalog dimension of a KPI month and
/// replaces the stored rows of each breakdown.
#[instrument(
    name = "gatek.rca",
    skip_all,
    fields(tenant_id = %ctx.tenant_id, kpi_key = %kpi_key, month = %month)
)]
pub async fn refresh_contributors<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    config: &EngineConfig,
    kpi_key: &str,
    month: NaiveDate,
) -> Result<RcaRun> {
    ctx.require(Permission::KpiRead)?;
    ctx.require(Permission::KpiWrite)?;

    let catalog = store
        .fetch_dimension_catalog(ctx.tenant_id, kpi_key, month)
        .await?;

    let mut breakdowns = Vec::new();
    let mut written = 0;
    for dim_key in catalog.dim_keys() {
        let slices = store
            .fetch_breakdown(ctx.tenant_id, kpi_key, month, dim_key)
            .await?;
        let ranked = rca::rank_breakdown(
            kpi_key,
            month,
            dim_key,
            catalog.values(dim_key),
            &slices,
            config.rca_top_n,
        )?;
        written += store
            .replace_contributors(ctx.tenant_id, kpi_key, month, dim_key, &ranked.contributors)
            .await?;
        debug!(
            dim_key,
            slices = slices.len(),
            ranked = ranked.contributors.len(),
            "ranked breakdown"
        );
        breakdowns.push(ranked);
    }

    info!(
        dimensions = breakdowns.len(),
        written,
        "refreshed rca contributors"
    );
    Ok(RcaRun {
        kpi_key: kpi_key.to_string(),
        month,
        breakdowns,
        written,
    })
}

/// Generates the recommendation for a flagged point and its top contributor
/// and reconciles it with what is already stored for that KPI month.
pub async fn regenerate_recommendations<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    point: &KpiMonthlyPoint,
    top: Option<&RcaContributor>,
) -> Result<RegenerationSummary> {
    ctx.require(Permission::KpiRead)?;
    ctx.require(Permission::KpiWrite)?;

    let mut summary = RegenerationSummary::default();
    let Some(candidate) = top.and_then(|top| recommend::generate(point, top)) else {
        debug!(
            kpi_key = %point.kpi_key,
            month = %point.month,
            flag = point.flag.code(),
            "no catalog recommendation for this period"
        );
        return Ok(summary);
    };

    let existing = store
        .fetch_recommendations(ctx.tenant_id, &point.kpi_key, point.month)
        .await?;
    let outcome = recommend::reconcile(&existing, candidate);
    match &outcome {
        Reconciliation::Create(rec) | Reconciliation::Update(rec) => {
            store.upsert_recommendation(ctx.tenant_id, rec).await?;
        }
        Reconciliation::Skip => {}
    }
    summary.record(&outcome);

    info!(
        tenant_id = %ctx.tenant_id,
        kpi_key = %point.kpi_key,
        month = %point.month,
        created = summary.created,
        updated = summary.updated,
        skipped = summary.skipped,
        "regenerated recommendations"
    );
    Ok(summary)
}

/// Rolls up a quarter and replaces any stored insight for the same period.
#[instrument(
    name = "gatek.insight",
    skip_all,
    fields(tenant_id = %ctx.tenant_id, year = year, quarter = quarter)
)]
pub async fn generate_quarterly_insight<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    year: i32,
    quarter: u32,
    limit: usize,
) -> Result<InsightOutcome> {
    ctx.require(Permission::KpiRead)?;
    ctx.require(Permission::KpiWrite)?;
    let (from, to) = insight::quarter_range(year, quarter)?;

    let summaries = store.fetch_kpi_summaries(ctx.tenant_id, from, to).await?;
    let initiatives = store.fetch_initiatives(ctx.tenant_id, from, to).await?;
    let rollup =
        insight::build_insight(year, quarter, &summaries, &initiatives, limit, Utc::now())?;
    let replaced = store.upsert_insight(ctx.tenant_id, &rollup).await?;

    let outcome = InsightOutcome {
        created: usize::from(!replaced),
        updated: usize::from(replaced),
        kpis_count: rollup.kpis.len(),
        initiatives_count: rollup.top_initiatives.len(),
    };
    info!(
        created = outcome.created,
        updated = outcome.updated,
        kpis_count = outcome.kpis_count,
        initiatives_count = outcome.initiatives_count,
        "generated quarterly insight"
    );
    Ok(outcome)
}

/// Flags, ranks and recommends for the latest period of one KPI.
pub async fn analyze<S: AnalyticsStore>(
    ctx: &TenantContext,
    store: &S,
    config: &EngineConfig,
    kpi_key: &str,
    window: TrendWindow,
) -> Result<AnalysisSummary> {
    let flag_run = refresh_flags(ctx, store, config, kpi_key, window).await?;
    let Some(latest) = flag_run.latest().cloned() else {
        info!(tenant_id = %ctx.tenant_id, kpi_key, "no data available");
        return Ok(AnalysisSummary {
            kpi_key: kpi_key.to_string(),
            month: None,
            flag: None,
            flags_written: 0,
            contributors_written: 0,
            recommendations: RegenerationSummary::default(),
        });
    };

    let rca_run = refresh_contributors(ctx, store, config, kpi_key, latest.month).await?;
    let recommendations =
        regenerate_recommendations(ctx, store, &latest, rca_run.top_contributor()).await?;

    Ok(AnalysisSummary {
        kpi_key: kpi_key.to_string(),
        month: Some(latest.month),
        flag: Some(latest.flag),
        flags_written: flag_run.written,
        contributors_written: rca_run.written,
        recommendations,
    })
}
