use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Granularity, Initiative, KpiMonthlyPoint, KpiSummary, QuarterlyInsight, RcaContributor,
    Recommendation, RecommendationStatus, SliceAggregate, TrendSample, TrendWindow,
};
use crate::rca::DimensionCatalog;

/// Read and write collaborators the engine runs against.
///
/// Every write is an upsert keyed by tenant plus the natural period key, so a
/// repeated or concurrent run converges on the same stored state. Retries
/// for failed reads belong to the implementation, not the engine.
#[allow(async_fn_in_trait)]
pub trait AnalyticsStore {
    /// Most recent `window.lookback()` points, any order.
    async fn fetch_series(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        window: TrendWindow,
    ) -> Result<Vec<TrendSample>>;

    async fn fetch_dimension_catalog(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<DimensionCatalog>;

    async fn fetch_breakdown(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        dim_key: &str,
    ) -> Result<Vec<SliceAggregate>>;

    /// Stored monthly flags with `from <= month < to`, all KPIs.
    async fn fetch_kpi_summaries(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<KpiSummary>>;

    async fn fetch_initiatives(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Initiative>>;

    async fn fetch_contributors(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<RcaContributor>>;

    async fn fetch_recommendations(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<Recommendation>>;

    /// Flags are keyed by granularity too, so windows of different
    /// granularity never overwrite each other.
    async fn upsert_flags(
        &self,
        tenant_id: Uuid,
        granularity: Granularity,
        points: &[KpiMonthlyPoint],
    ) -> Result<usize>;

    /// Replaces every stored contributor row of one breakdown.
    async fn replace_contributors(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        dim_key: &str,
        rows: &[RcaContributor],
    ) -> Result<usize>;

    async fn upsert_recommendation(&self, tenant_id: Uuid, rec: &Recommendation) -> Result<()>;

    /// Returns true when an insight for the same (year, quarter) was replaced.
    async fn upsert_insight(&self, tenant_id: Uuid, insight: &QuarterlyInsight) -> Result<bool>;
}

type SeriesKey = (Uuid, String, Granularity);
type PeriodKey = (Uuid, String, NaiveDate);
type FlagKey = (Uuid, String, Granularity, NaiveDate);

#[derive(Default)]
struct MemoryState {
    series: HashMap<SeriesKey, BTreeMap<NaiveDate, f64>>,
    slices: HashMap<PeriodKey, Vec<SliceAggregate>>,
    initiatives: HashMap<Uuid, Vec<Initiative>>,
    flags: BTreeMap<FlagKey, KpiMonthlyPoint>,
    contributors: BTreeMap<(Uuid, String, NaiveDate, String), Vec<RcaContributor>>,
    recommendations: BTreeMap<Uuid, (Uuid, Recommendation)>,
    insights: BTreeMap<(Uuid, i32, u32), QuarterlyInsight>,
    fail_reads: bool,
}

/// In-process store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_series(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        granularity: Granularity,
        samples: &[TrendSample],
    ) {
        let mut state = self.state.lock().await;
        let series = state
            .series
            .entry((tenant_id, kpi_key.to_string(), granularity))
            .or_default();
        for sample in samples {
            series.insert(sample.month, sample.avg_value);
        }
    }

    pub async fn add_slices(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        slices: Vec<SliceAggregate>,
    ) {
        let mut state = self.state.lock().await;
        state
            .slices
            .entry((tenant_id, kpi_key.to_string(), month))
            .or_default()
            .extend(slices);
    }

    pub async fn add_initiative(&self, tenant_id: Uuid, initiative: Initiative) {
        let mut state = self.state.lock().await;
        state.initiatives.entry(tenant_id).or_default().push(initiative);
    }

    /// Makes every subsequent read fail, to exercise upstream errors.
    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    pub async fn flag_count(&self, tenant_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state.flags.keys().filter(|(t, _, _, _)| *t == tenant_id).count()
    }

    pub async fn stored_flag(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        granularity: Granularity,
        month: NaiveDate,
    ) -> Option<KpiMonthlyPoint> {
        let state = self.state.lock().await;
        state
            .flags
            .get(&(tenant_id, kpi_key.to_string(), granularity, month))
            .cloned()
    }

    pub async fn recommendation_count(&self, tenant_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .recommendations
            .values()
            .filter(|(t, _)| *t == tenant_id)
            .count()
    }

    pub async fn insight_count(&self, tenant_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .insights
            .keys()
            .filter(|(t, _, _)| *t == tenant_id)
            .count()
    }

    pub async fn set_recommendation_status(
        &self,
        rec_id: Uuid,
        status: RecommendationStatus,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state.recommendations.get_mut(&rec_id) {
            Some((_, rec)) => {
                rec.status = status;
                true
            }
            None => false,
        }
    }
}

fn check_reads(state: &MemoryState, source_name: &str) -> Result<()> {
    if state.fail_reads {
        Err(EngineError::upstream(source_name, "memory store read failure"))
    } else {
        Ok(())
    }
}

impl AnalyticsStore for MemoryStore {
    async fn fetch_series(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        window: TrendWindow,
    ) -> Result<Vec<TrendSample>> {
        let state = self.state.lock().await;
        check_reads(&state, "kpi series")?;
        let key = (tenant_id, kpi_key.to_string(), window.granularity());
        let Some(series) = state.series.get(&key) else {
            return Ok(Vec::new());
        };
        let skip = series.len().saturating_sub(window.lookback());
        Ok(series
            .iter()
            .skip(skip)
            .map(|(month, value)| TrendSample::new(*month, *value))
            .collect())
    }

    async fn fetch_dimension_catalog(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<DimensionCatalog> {
        let state = self.state.lock().await;
        check_reads(&state, "dimension catalog")?;
        let slices = state
            .slices
            .get(&(tenant_id, kpi_key.to_string(), month))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(DimensionCatalog::from_slices(slices))
    }

    async fn fetch_breakdown(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        dim_key: &str,
    ) -> Result<Vec<SliceAggregate>> {
        let state = self.state.lock().await;
        check_reads(&state, "kpi breakdown")?;
        Ok(state
            .slices
            .get(&(tenant_id, kpi_key.to_string(), month))
            .map(|slices| {
                slices
                    .iter()
                    .filter(|s| s.dim_key == dim_key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_kpi_summaries(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<KpiSummary>> {
        let state = self.state.lock().await;
        check_reads(&state, "kpi summaries")?;
        Ok(state
            .flags
            .iter()
            .filter(|((t, _, granularity, month), _)| {
                *t == tenant_id
                    && *granularity == Granularity::Month
                    && *month >= from
                    && *month < to
            })
            .map(|(_, point)| KpiSummary {
                kpi_key: point.kpi_key.clone(),
                month: point.month,
                avg_value: point.avg_value,
                flag: point.flag,
            })
            .collect())
    }

    async fn fetch_initiatives(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Initiative>> {
        let state = self.state.lock().await;
        check_reads(&state, "initiatives")?;
        Ok(state
            .initiatives
            .get(&tenant_id)
            .map(|all| {
                all.iter()
                    .filter(|i| i.month >= from && i.month < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_contributors(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<RcaContributor>> {
        let state = self.state.lock().await;
        check_reads(&state, "rca contributors")?;
        Ok(state
            .contributors
            .iter()
            .filter(|((t, key, m, _), _)| *t == tenant_id && key == kpi_key && *m == month)
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect())
    }

    async fn fetch_recommendations(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<Recommendation>> {
        let state = self.state.lock().await;
        check_reads(&state, "recommendations")?;
        Ok(state
            .recommendations
            .values()
            .filter(|(t, rec)| *t == tenant_id && rec.kpi_key == kpi_key && rec.month == month)
            .map(|(_, rec)| rec.clone())
            .collect())
    }

    async fn upsert_flags(
        &self,
        tenant_id: Uuid,
        granularity: Granularity,
        points: &[KpiMonthlyPoint],
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        for point in points {
            state.flags.insert(
                (tenant_id, point.kpi_key.clone(), granularity, point.month),
                point.clone(),
            );
        }
        Ok(points.len())
    }

    async fn replace_contributors(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        dim_key: &str,
        rows: &[RcaContributor],
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.contributors.insert(
            (tenant_id, kpi_key.to_string(), month, dim_key.to_string()),
            rows.to_vec(),
        );
        Ok(rows.len())
    }

    async fn upsert_recommendation(&self, tenant_id: Uuid, rec: &Recommendation) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .recommendations
            .insert(rec.id, (tenant_id, rec.clone()));
        Ok(())
    }

    async fn upsert_insight(&self, tenant_id: Uuid, insight: &QuarterlyInsight) -> Result<bool> {
        let mut state = self.state.lock().await;
        let replaced = state
            .insights
            .insert((tenant_id, insight.year, insight.quarter), insight.clone())
            .is_some();
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, 1).unwrap()
    }

    #[tokio::test]
    async fn series_fetch_is_limited_to_lookback() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let samples: Vec<_> = (1..=12)
            .map(|m| TrendSample::new(month(m), m as f64))
            .collect();
        store
            .add_series(tenant, "kpi", Granularity::Quarter, &samples)
            .await;

        let fetched = store
            .fetch_series(tenant, "kpi", TrendWindow::Quarters4)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 8);
        assert_eq!(fetched.last().unwrap().month, month(12));

        let other_granularity = store
            .fetch_series(tenant, "kpi", TrendWindow::Months6)
            .await
            .unwrap();
        assert!(other_granularity.is_empty());
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .add_series(a, "kpi", Granularity::Month, &[TrendSample::new(month(1), 1.0)])
            .await;
        let fetched = store.fetch_series(b, "kpi", TrendWindow::Months6).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn failing_reads_surface_as_upstream_errors() {
        let store = MemoryStore::new();
        store.fail_reads(true).await;
        let err = store
            .fetch_series(Uuid::new_v4(), "kpi", TrendWindow::Months6)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UpstreamFetch { .. }));
    }
}
