//! Gate-K KPI analytics: trend flags, root-cause contributor ranking,
//! catalog-driven recommendations and quarterly insight rollups.
//!
//! The computations in [`flags`], [`rca`], [`recommend`] and [`insight`] are
//! pure functions over plain records. [`engine`] wires them to an
//! [`store::AnalyticsStore`] behind an explicit [`access::TenantContext`].

pub mod access;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod flags;
pub mod insight;
pub mod models;
pub mod rca;
pub mod recommend;
pub mod report;
pub mod store;

pub use access::{Permission, TenantContext};
pub use config::{BaselineMode, EngineConfig, FlagThresholds};
pub use error::{EngineError, Result};
pub use models::{Flag, KpiMonthlyPoint, RcaContributor, Recommendation, TrendWindow};
