use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gatek_analytics::db::{self, PgStore};
use gatek_analytics::{engine, report, EngineConfig, TenantContext, TrendWindow};

#[derive(Parser)]
#[command(name = "gatek")]
#[command(about = "Gate-K KPI trend flags, root-cause ranking and recommendations", long_about = None)]
struct Cli {
    /// JSON file with threshold and ranking overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo KPI series and breakdowns
    Seed,
    /// Import aggregated KPI values from a CSV file
    ImportSeries {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import dimensional breakdown aggregates from a CSV file
    ImportSlices {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compute trend flags for a KPI
    Flags {
        #[arg(long)]
        kpi: String,
        #[arg(long, default_value = "6m")]
        window: TrendWindow,
        /// Print without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Rank root-cause contributors for a KPI month
    Rca {
        #[arg(long)]
        kpi: String,
        #[arg(long)]
        month: NaiveDate,
    },
    /// Regenerate the recommendation for the latest flagged period
    Recommend {
        #[arg(long)]
        kpi: String,
        #[arg(long, default_value = "6m")]
        window: TrendWindow,
    },
    /// Flag, rank and recommend in one run
    Analyze {
        #[arg(long)]
        kpi: String,
        #[arg(long, default_value = "6m")]
        window: TrendWindow,
    },
    /// Regenerate the quarterly insight rollup
    Insight {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        quarter: u32,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        kpi: String,
        #[arg(long, default_value = "6m")]
        window: TrendWindow,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("failed to load config")?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let tenant_id: Uuid = std::env::var("GATEK_TENANT_ID")
        .context("GATEK_TENANT_ID must be set to the tenant being analyzed")?
        .parse()
        .context("GATEK_TENANT_ID is not a valid UUID")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());
    let writer = TenantContext::read_write(tenant_id);
    let reader = TenantContext::read_only(tenant_id);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, tenant_id).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportSeries { csv } => {
            let written = db::import_series_csv(&pool, tenant_id, &csv).await?;
            println!("Upserted {written} KPI values from {}.", csv.display());
        }
        Commands::ImportSlices { csv } => {
            let written = db::import_slices_csv(&pool, tenant_id, &csv).await?;
            println!("Upserted {written} breakdown slices from {}.", csv.display());
        }
        Commands::Flags {
            kpi,
            window,
            dry_run,
        } => {
            let run = if dry_run {
                engine::preview_flags(&reader, &store, &config, &kpi, window).await?
            } else {
                engine::refresh_flags(&writer, &store, &config, &kpi, window).await?
            };

            if run.points.is_empty() {
                println!("No data available for {kpi}.");
                return Ok(());
            }
            for point in &run.points {
                println!(
                    "- {} value {:.2} delta {} zscore {} -> {}",
                    point.month,
                    point.avg_value,
                    point
                        .delta_pct
                        .map(|d| format!("{d:+.1}%"))
                        .unwrap_or_else(|| "n/a".to_string()),
                    point
                        .zscore
                        .map(|z| format!("{z:+.2}"))
                        .unwrap_or_else(|| "n/a".to_string()),
                    point.flag
                );
            }
            println!("Wrote {} flags.", run.written);
        }
        Commands::Rca { kpi, month } => {
            let run = engine::refresh_contributors(&writer, &store, &config, &kpi, month).await?;
            if run.breakdowns.is_empty() {
                println!("No breakdown data for {kpi} in {month}.");
                return Ok(());
            }
            for breakdown in &run.breakdowns {
                println!("{} (total volume {:.0}):", breakdown.dim_key, breakdown.total_volume);
                for c in &breakdown.contributors {
                    println!(
                        "  #{} {} delta {:+.1}% share {:.0}% score {:.2}",
                        c.rank,
                        c.dim_value,
                        c.delta_pct,
                        c.share_ratio * 100.0,
                        c.contribution_score
                    );
                }
            }
            println!("Wrote {} contributor rows.", run.written);
        }
        Commands::Recommend { kpi, window } => {
            let run = engine::preview_flags(&reader, &store, &config, &kpi, window).await?;
            let Some(latest) = run.latest() else {
                println!("No data available for {kpi}.");
                return Ok(());
            };
            let detail = engine::period_detail(&reader, &store, &kpi, latest.month).await?;
            let summary = engine::regenerate_recommendations(
                &writer,
                &store,
                latest,
                detail.top_contributor(),
            )
            .await?;
            println!(
                "Recommendations: {} created, {} updated, {} unchanged.",
                summary.created, summary.updated, summary.skipped
            );
        }
        Commands::Analyze { kpi, window } => {
            let summary = engine::analyze(&writer, &store, &config, &kpi, window).await?;
            match (summary.month, summary.flag) {
                (Some(month), Some(flag)) => println!("{kpi} {month}: {flag}"),
                _ => println!("No data available for {kpi}."),
            }
            println!(
                "Wrote {} flags, {} contributor rows; recommendations {} created, {} updated, {} unchanged.",
                summary.flags_written,
                summary.contributors_written,
                summary.recommendations.created,
                summary.recommendations.updated,
                summary.recommendations.skipped
            );
        }
        Commands::Insight {
            year,
            quarter,
            limit,
        } => {
            let outcome = engine::generate_quarterly_insight(
                &writer,
                &store,
                year,
                quarter,
                limit.unwrap_or(config.insight_limit),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Report { kpi, window, out } => {
            let run = engine::preview_flags(&reader, &store, &config, &kpi, window).await?;
            let detail = match run.latest() {
                Some(latest) => engine::period_detail(&reader, &store, &kpi, latest.month).await?,
                None => engine::PeriodDetail::default(),
            };
            let report = report::build_report(
                &format!("tenant {tenant_id}"),
                &kpi,
                window,
                &run.points,
                &detail.contributors,
                &detail.recommendations,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
