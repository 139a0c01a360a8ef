use std::str::FromStr;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Granularity, Initiative, KpiMonthlyPoint, KpiSummary, QuarterlyInsight, RcaContributor,
    Recommendation, RecommendationStatus, SliceAggregate, TrendSample, TrendWindow,
};
use crate::rca::DimensionCatalog;
use crate::store::AnalyticsStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed reads and idempotent upserts for the engine.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str, source_name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<T, _>(name)
        .map_err(|err| EngineError::upstream(source_name, format!("column {name}: {err}")))
}

fn code<T>(row: &PgRow, name: &str, source_name: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = column(row, name, source_name)?;
    raw.parse()
        .map_err(|err: String| EngineError::upstream(source_name, err))
}

/// Integer column that must not be negative.
fn unsigned(value: i32, name: &str, source_name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        EngineError::upstream(source_name, format!("column {name}: negative value {value}"))
    })
}

fn recommendation_from_row(row: &PgRow) -> Result<Recommendation> {
    const SOURCE: &str = "recommendations";
    let catalog_version: i32 = column(row, "catalog_version", SOURCE)?;
    Ok(Recommendation {
        id: column(row, "id", SOURCE)?,
        kpi_key: column(row, "kpi_key", SOURCE)?,
        month: column(row, "month", SOURCE)?,
        dim_key: column(row, "dim_key", SOURCE)?,
        dim_value: column(row, "dim_value", SOURCE)?,
        title: column(row, "title", SOURCE)?,
        body: column(row, "body", SOURCE)?,
        action_type_code: code(row, "action_type_code", SOURCE)?,
        impact_level: code(row, "impact_level", SOURCE)?,
        effort_estimate: code(row, "effort_estimate", SOURCE)?,
        status: code(row, "status", SOURCE)?,
        catalog_version: unsigned(catalog_version, "catalog_version", SOURCE)?,
    })
}

impl AnalyticsStore for PgStore {
    async fn fetch_series(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        window: TrendWindow,
    ) -> Result<Vec<TrendSample>> {
        const SOURCE: &str = "kpi series";
        let rows = sqlx::query(
            r#"
            SELECT period_start, avg_value
            FROM gatek.kpi_period_values
            WHERE tenant_id = $1 AND kpi_key = $2 AND granularity = $3
            ORDER BY period_start DESC
            LIMIT $4
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(window.granularity().code())
        .bind(window.lookback() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        rows.iter()
            .map(|row| -> Result<TrendSample> {
                Ok(TrendSample::new(
                    column(row, "period_start", SOURCE)?,
                    column(row, "avg_value", SOURCE)?,
                ))
            })
            .collect()
    }

    async fn fetch_dimension_catalog(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<DimensionCatalog> {
        const SOURCE: &str = "dimension catalog";
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT dim_key, dim_value
            FROM gatek.kpi_breakdown
            WHERE tenant_id = $1 AND kpi_key = $2 AND month = $3
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(month)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        let mut catalog = DimensionCatalog::new();
        for row in &rows {
            let dim_key: String = column(row, "dim_key", SOURCE)?;
            let dim_value: String = column(row, "dim_value", SOURCE)?;
            catalog = catalog.with_dimension(&dim_key, [dim_value]);
        }
        Ok(catalog)
    }

    async fn fetch_breakdown(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
        dim_key: &str,
    ) -> Result<Vec<SliceAggregate>> {
        const SOURCE: &str = "kpi breakdown";
        let rows = sqlx::query(
            r#"
            SELECT dim_key, dim_value, current_value, previous_value, volume
            FROM gatek.kpi_breakdown
            WHERE tenant_id = $1 AND kpi_key = $2 AND month = $3 AND dim_key = $4
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(month)
        .bind(dim_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        rows.iter()
            .map(|row| -> Result<SliceAggregate> {
                Ok(SliceAggregate {
                    dim_key: column(row, "dim_key", SOURCE)?,
                    dim_value: column(row, "dim_value", SOURCE)?,
                    current_value: column(row, "current_value", SOURCE)?,
                    previous_value: column(row, "previous_value", SOURCE)?,
                    volume: column(row, "volume", SOURCE)?,
                })
            })
            .collect()
    }

    async fn fetch_kpi_summaries(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<KpiSummary>> {
        const SOURCE: &str = "kpi summaries";
        let rows = sqlx::query(
            r#"
            SELECT kpi_key, month, avg_value, flag
            FROM gatek.kpi_flags
            WHERE tenant_id = $1 AND granularity = 'month' AND month >= $2 AND month < $3
            ORDER BY kpi_key, month
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        rows.iter()
            .map(|row| -> Result<KpiSummary> {
                Ok(KpiSummary {
                    kpi_key: column(row, "kpi_key", SOURCE)?,
                    month: column(row, "month", SOURCE)?,
                    avg_value: column(row, "avg_value", SOURCE)?,
                    flag: code(row, "flag", SOURCE)?,
                })
            })
            .collect()
    }

    async fn fetch_initiatives(
        &self,
        tenant_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Initiative>> {
        const SOURCE: &str = "initiatives";
        let rows = sqlx::query(
            r#"
            SELECT id, title, kpi_key, impact_score, status, month
            FROM gatek.initiatives
            WHERE tenant_id = $1 AND month >= $2 AND month < $3
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        rows.iter()
            .map(|row| -> Result<Initiative> {
                Ok(Initiative {
                    id: column(row, "id", SOURCE)?,
                    title: column(row, "title", SOURCE)?,
                    kpi_key: column(row, "kpi_key", SOURCE)?,
                    impact_score: column(row, "impact_score", SOURCE)?,
                    status: column(row, "status", SOURCE)?,
                    month: column(row, "month", SOURCE)?,
                })
            })
            .collect()
    }

    async fn fetch_contributors(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<RcaContributor>> {
        const SOURCE: &str = "rca contributors";
        let rows = sqlx::query(
            r#"
            SELECT kpi_key, month, dim_key, dim_value, delta_pct,
                   contribution_score, share_ratio, rank
            FROM gatek.rca_contributors
            WHERE tenant_id = $1 AND kpi_key = $2 AND month = $3
            ORDER BY dim_key, rank, dim_value
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(month)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream(SOURCE, err))?;

        rows.iter()
            .map(|row| -> Result<RcaContributor> {
                let rank: i32 = column(row, "rank", SOURCE)?;
                Ok(RcaContributor {
                    kpi_key: column(row, "kpi_key", SOURCE)?,
                    month: column(row, "month", SOURCE)?,
                    dim_key: column(row, "dim_key", SOURCE)?,
                    dim_value: column(row, "dim_value", SOURCE)?,
                    delta_pct: column(row, "delta_pct", SOURCE)?,
                    contribution_score: column(row, "contribution_score", SOURCE)?,
                    share_ratio: column(row, "share_ratio", SOURCE)?,
                    rank: unsigned(rank, "rank", SOURCE)?,
                })
            })
            .collect()
    }

    async fn fetch_recommendations(
        &self,
        tenant_id: Uuid,
        kpi_key: &str,
        month: NaiveDate,
    ) -> Result<Vec<Recommendation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kpi_key, month, dim_key, dim_value, title, body,
                   action_type_code, impact_level, effort_estimate, status, catalog_version
            FROM gatek.recommendations
            WHERE tenant_id = $1 AND kpi_key = $2 AND month = $3
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(month)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| EngineError::upstream("recommendations", err))?;

        rows.iter().map(recommendation_from_row).collect()
    }

    async fn upsert_flags(
        &self,
        tenant_id: Uuid,
        granularity: Granularity,
        points: &[KpiMonthlyPoint],
    ) -> Result<usize> {
        const TARGET: &str = "kpi flags";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;

        for point in points {
            sqlx::query(
                r#"
                INSERT INTO gatek.kpi_flags
                (tenant_id, kpi_key, granularity, month, avg_value, prev_avg, delta_pct, zscore, flag)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, kpi_key, granularity, month) DO UPDATE
                SET avg_value = EXCLUDED.avg_value,
                    prev_avg = EXCLUDED.prev_avg,
                    delta_pct = EXCLUDED.delta_pct,
                    zscore = EXCLUDED.zscore,
                    flag = EXCLUDED.flag,
                    computed_at = now()
                "#,
            )
            .bind(tenant_id)
            .bind(&point.kpi_key)
            .bind(granularity.code())
            .bind(point.month)
            .bind(point.avg_value)
            .bind(point.prev_avg)
            .bind(point.delta_pct)
            .bind(point.zscore)
            .bind(point.flag.code())
            .execute(&mut *tx)
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;
        }

        tx.commit()
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;
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
        const TARGET: &str = "rca contributors";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;

        sqlx::query(
            r#"
            DELETE FROM gatek.rca_contributors
            WHERE tenant_id = $1 AND kpi_key = $2 AND month = $3 AND dim_key = $4
            "#,
        )
        .bind(tenant_id)
        .bind(kpi_key)
        .bind(month)
        .bind(dim_key)
        .execute(&mut *tx)
        .await
        .map_err(|err| EngineError::persist(TARGET, err))?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO gatek.rca_contributors
                (tenant_id, kpi_key, month, dim_key, dim_value, delta_pct,
                 contribution_score, share_ratio, rank)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(tenant_id)
            .bind(&row.kpi_key)
            .bind(row.month)
            .bind(&row.dim_key)
            .bind(&row.dim_value)
            .bind(row.delta_pct)
            .bind(row.contribution_score)
            .bind(row.share_ratio)
            .bind(row.rank as i32)
            .execute(&mut *tx)
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;
        }

        tx.commit()
            .await
            .map_err(|err| EngineError::persist(TARGET, err))?;
        Ok(rows.len())
    }

    async fn upsert_recommendation(&self, tenant_id: Uuid, rec: &Recommendation) -> Result<()> {
        // Open rows converge on the one-open-per-period index; resolved rows by id.
        let conflict = match rec.status {
            RecommendationStatus::Open => {
                "ON CONFLICT (tenant_id, kpi_key, month) WHERE status = 'open' DO UPDATE"
            }
            RecommendationStatus::Actioned | RecommendationStatus::Dismissed => {
                "ON CONFLICT (id) DO UPDATE"
            }
        };
        let statement = format!(
            r#"
            INSERT INTO gatek.recommendations
            (id, tenant_id, kpi_key, month, dim_key, dim_value, title, body,
             action_type_code, impact_level, effort_estimate, status, catalog_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            {conflict}
            SET dim_key = EXCLUDED.dim_key,
                dim_value = EXCLUDED.dim_value,
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                action_type_code = EXCLUDED.action_type_code,
                impact_level = EXCLUDED.impact_level,
                effort_estimate = EXCLUDED.effort_estimate,
                status = EXCLUDED.status,
                catalog_version = EXCLUDED.catalog_version,
                updated_at = now()
            "#
        );

        sqlx::query(&statement)
            .bind(rec.id)
            .bind(tenant_id)
            .bind(&rec.kpi_key)
            .bind(rec.month)
            .bind(&rec.dim_key)
            .bind(&rec.dim_value)
            .bind(&rec.title)
            .bind(&rec.body)
            .bind(rec.action_type_code.code())
            .bind(rec.impact_level.code())
            .bind(rec.effort_estimate.code())
            .bind(rec.status.code())
            .bind(rec.catalog_version as i32)
            .execute(&self.pool)
            .await
            .map_err(|err| EngineError::persist("recommendations", err))?;
        Ok(())
    }

    async fn upsert_insight(&self, tenant_id: Uuid, insight: &QuarterlyInsight) -> Result<bool> {
        const TARGET: &str = "quarterly insights";
        let row = sqlx::query(
            r#"
            INSERT INTO gatek.quarterly_insights
            (tenant_id, year, quarter, payload, kpis_count, initiatives_count, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, year, quarter) DO UPDATE
            SET payload = EXCLUDED.payload,
                kpis_count = EXCLUDED.kpis_count,
                initiatives_count = EXCLUDED.initiatives_count,
                generated_at = EXCLUDED.generated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(tenant_id)
        .bind(insight.year)
        .bind(insight.quarter as i32)
        .bind(sqlx::types::Json(insight))
        .bind(insight.kpis.len() as i32)
        .bind(insight.top_initiatives.len() as i32)
        .bind(insight.generated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| EngineError::persist(TARGET, err))?;

        let inserted: bool = row
            .try_get("inserted")
            .map_err(|err| EngineError::persist(TARGET, err))?;
        Ok(!inserted)
    }
}

pub async fn seed(pool: &PgPool, tenant_id: Uuid) -> anyhow::Result<()> {
    let month = |y: i32, m: u32| NaiveDate::from_ymd_opt(y, m, 1).context("invalid date");

    let series = vec![
        ("kpi_completion_rate", month(2025, 4)?, 78.0),
        ("kpi_completion_rate", month(2025, 5)?, 81.0),
        ("kpi_completion_rate", month(2025, 6)?, 79.0),
        ("kpi_completion_rate", month(2025, 7)?, 80.0),
        ("kpi_completion_rate", month(2025, 8)?, 82.0),
        ("kpi_completion_rate", month(2025, 9)?, 60.0),
        ("kpi_phish_click_rate", month(2025, 6)?, 6.1),
        ("kpi_phish_click_rate", month(2025, 7)?, 5.8),
        ("kpi_phish_click_rate", month(2025, 8)?, 5.9),
        ("kpi_phish_click_rate", month(2025, 9)?, 5.7),
    ];

    for (kpi_key, period_start, avg_value) in series {
        upsert_period_value(pool, tenant_id, kpi_key, Granularity::Month, period_start, avg_value)
            .await?;
    }

    let sept = month(2025, 9)?;
    let slices = vec![
        ("department", "Sales", 50.0, Some(90.0), 200.0),
        ("department", "IT", 78.0, Some(80.0), 50.0),
        ("region", "EMEA", 58.0, Some(81.0), 150.0),
        ("region", "NA", 63.0, Some(83.0), 90.0),
        ("region", "APAC", 70.0, None, 10.0),
    ];

    for (dim_key, dim_value, current_value, previous_value, volume) in slices {
        let slice = SliceAggregate {
            dim_key: dim_key.to_string(),
            dim_value: dim_value.to_string(),
            current_value,
            previous_value,
            volume,
        };
        upsert_slice(pool, tenant_id, "kpi_completion_rate", sept, &slice).await?;
    }

    let initiatives = vec![
        (
            Uuid::parse_str("6a1d7a4e-0f8e-4f64-9a57-2d0f4b3c1e01")?,
            "Quarterly phishing simulation",
            Some("kpi_phish_click_rate"),
            7.5,
            month(2025, 8)?,
        ),
        (
            Uuid::parse_str("b2c4e8f1-5d3a-4b6c-8e7f-9a0b1c2d3e02")?,
            "Sales onboarding refresh",
            Some("kpi_completion_rate"),
            8.0,
            month(2025, 9)?,
        ),
    ];

    for (id, title, kpi_key, impact_score, start) in initiatives {
        sqlx::query(
            r#"
            INSERT INTO gatek.initiatives (id, tenant_id, title, kpi_key, impact_score, month)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, impact_score = EXCLUDED.impact_score
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(title)
        .bind(kpi_key)
        .bind(impact_score)
        .bind(start)
        .execute(pool)
        .await?;
    }

    tracing::info!(%tenant_id, "seeded demo kpi data");
    Ok(())
}

async fn upsert_period_value(
    pool: &PgPool,
    tenant_id: Uuid,
    kpi_key: &str,
    granularity: Granularity,
    period_start: NaiveDate,
    avg_value: f64,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO gatek.kpi_period_values
        (tenant_id, kpi_key, granularity, period_start, avg_value)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (tenant_id, kpi_key, granularity, period_start) DO UPDATE
        SET avg_value = EXCLUDED.avg_value
        "#,
    )
    .bind(tenant_id)
    .bind(kpi_key)
    .bind(granularity.code())
    .bind(period_start)
    .bind(avg_value)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_slice(
    pool: &PgPool,
    tenant_id: Uuid,
    kpi_key: &str,
    month: NaiveDate,
    slice: &SliceAggregate,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO gatek.kpi_breakdown
        (tenant_id, kpi_key, month, dim_key, dim_value, current_value, previous_value, volume)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (tenant_id, kpi_key, month, dim_key, dim_value) DO UPDATE
        SET current_value = EXCLUDED.current_value,
            previous_value = EXCLUDED.previous_value,
            volume = EXCLUDED.volume
        "#,
    )
    .bind(tenant_id)
    .bind(kpi_key)
    .bind(month)
    .bind(&slice.dim_key)
    .bind(&slice.dim_value)
    .bind(slice.current_value)
    .bind(slice.previous_value)
    .bind(slice.volume)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn import_series_csv(
    pool: &PgPool,
    tenant_id: Uuid,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        kpi_key: String,
        granularity: String,
        period_start: NaiveDate,
        avg_value: f64,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut written = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad series row {}", line + 2))?;
        let granularity: Granularity = row
            .granularity
            .parse()
            .map_err(|err| anyhow::anyhow!("{err} on row {}", line + 2))?;
        if !row.avg_value.is_finite() {
            anyhow::bail!("non-finite avg_value on row {}", line + 2);
        }
        let affected = upsert_period_value(
            pool,
            tenant_id,
            &row.kpi_key,
            granularity,
            row.period_start,
            row.avg_value,
        )
        .await?;
        if affected > 0 {
            written += 1;
        }
    }

    tracing::info!(%tenant_id, written, path = %csv_path.display(), "imported kpi series");
    Ok(written)
}

pub async fn import_slices_csv(
    pool: &PgPool,
    tenant_id: Uuid,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        kpi_key: String,
        month: NaiveDate,
        dim_key: String,
        dim_value: String,
        current_value: f64,
        previous_value: Option<f64>,
        volume: f64,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut written = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad slice row {}", line + 2))?;
        if !row.volume.is_finite() || row.volume < 0.0 {
            anyhow::bail!("invalid volume {} on row {}", row.volume, line + 2);
        }
        let slice = SliceAggregate {
            dim_key: row.dim_key,
            dim_value: row.dim_value,
            current_value: row.current_value,
            previous_value: row.previous_value,
            volume: row.volume,
        };
        if upsert_slice(pool, tenant_id, &row.kpi_key, row.month, &slice).await? > 0 {
            written += 1;
        }
    }

    tracing::info!(%tenant_id, written, path = %csv_path.display(), "imported kpi slices");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_integer_columns_are_rejected() {
        assert_eq!(unsigned(3, "rank", "rca contributors").unwrap(), 3);
        let err = unsigned(-1, "rank", "rca contributors").unwrap_err();
        assert!(matches!(err, EngineError::UpstreamFetch { .. }));
        assert!(err.to_string().contains("column rank: negative value -1"));
    }
}
