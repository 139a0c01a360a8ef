use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::flags;
use crate::models::{RcaContributor, SliceAggregate};

/// Breakdown dimensions and the slice values each one may take.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionCatalog {
    dims: BTreeMap<String, BTreeSet<String>>,
}

impl DimensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension<I, S>(mut self, dim_key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dims
            .entry(dim_key.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Catalog covering exactly the slices observed.
    pub fn from_slices(slices: &[SliceAggregate]) -> Self {
        let mut catalog = Self::new();
        for slice in slices {
            catalog
                .dims
                .entry(slice.dim_key.clone())
                .or_default()
                .insert(slice.dim_value.clone());
        }
        catalog
    }

    pub fn dim_keys(&self) -> impl Iterator<Item = &str> {
        self.dims.keys().map(String::as_str)
    }

    pub fn values(&self, dim_key: &str) -> Option<&BTreeSet<String>> {
        self.dims.get(dim_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceShare {
    pub dim_value: String,
    pub share_ratio: f64,
    /// False when the slice had no usable previous value.
    pub ranked: bool,
}

/// Ranked contributors for one (kpi, month, dim_key) breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedBreakdown {
    pub dim_key: String,
    pub total_volume: f64,
    pub shares: Vec<SliceShare>,
    pub contributors: Vec<RcaContributor>,
}

/// Ranks the slices of one breakdown by contribution to the KPI change.
///
/// Slices of other dimensions are ignored. When `allowed` is given, slices
/// outside it are dropped before the volume total is taken. Slices with a
/// missing or zero previous value are not ranked but still count towards
/// the total volume.
pub fn rank_breakdown(
    kpi_key: &str,
    month: NaiveDate,
    dim_key: &str,
    allowed: Option<&BTreeSet<String>>,
    slices: &[SliceAggregate],
    top_n: usize,
) -> Result<RankedBreakdown> {
    let mut seen = HashSet::new();
    let mut members = Vec::new();
    for slice in slices.iter().filter(|s| s.dim_key == dim_key) {
        if let Some(allowed) = allowed {
            if !allowed.contains(&slice.dim_value) {
                tracing::warn!(
                    kpi_key,
                    dim_key,
                    dim_value = %slice.dim_value,
                    "dropping slice outside dimension catalog"
                );
                continue;
            }
        }
        validate_slice(kpi_key, slice)?;
        if !seen.insert(slice.dim_value.as_str()) {
            return Err(EngineError::invalid_input(format!(
                "{kpi_key} has duplicate slice {dim_key}={}",
                slice.dim_value
            )));
        }
        members.push(slice);
    }

    let total_volume: f64 = members.iter().map(|s| s.volume).sum();
    let share_of = |volume: f64| {
        if total_volume > 0.0 {
            volume / total_volume
        } else {
            0.0
        }
    };

    let mut shares = Vec::with_capacity(members.len());
    let mut ranked = Vec::new();
    for slice in &members {
        let share_ratio = share_of(slice.volume);
        let delta = slice
            .previous_value
            .and_then(|prev| flags::delta_pct(slice.current_value, prev));
        shares.push(SliceShare {
            dim_value: slice.dim_value.clone(),
            share_ratio,
            ranked: delta.is_some(),
        });
        if let Some(delta_pct) = delta {
            ranked.push(RcaContributor {
                kpi_key: kpi_key.to_string(),
                month,
                dim_key: dim_key.to_string(),
                dim_value: slice.dim_value.clone(),
                delta_pct,
                contribution_score: delta_pct.abs() * share_ratio,
                share_ratio,
                rank: 0,
            });
        }
    }

    ranked.sort_by(compare_contributors);
    assign_dense_ranks(&mut ranked);
    ranked.truncate(top_n);

    Ok(RankedBreakdown {
        dim_key: dim_key.to_string(),
        total_volume,
        shares,
        contributors: ranked,
    })
}

/// Ranks every dimension of the catalog independently.
pub fn rank_catalog(
    kpi_key: &str,
    month: NaiveDate,
    catalog: &DimensionCatalog,
    slices: &[SliceAggregate],
    top_n: usize,
) -> Result<Vec<RankedBreakdown>> {
    catalog
        .dim_keys()
        .map(|dim_key| {
            rank_breakdown(kpi_key, month, dim_key, catalog.values(dim_key), slices, top_n)
        })
        .collect()
}

/// Strongest rank-1 contributor across breakdowns.
pub fn top_contributor(breakdowns: &[RankedBreakdown]) -> Option<&RcaContributor> {
    strongest(breakdowns.iter().filter_map(|b| b.contributors.first()))
}

/// Contributor that orders first, with dim_key as the last tie-break.
pub fn strongest<'a, I>(rows: I) -> Option<&'a RcaContributor>
where
    I: IntoIterator<Item = &'a RcaContributor>,
{
    rows.into_iter()
        .min_by(|a, b| compare_contributors(a, b).then_with(|| a.dim_key.cmp(&b.dim_key)))
}

/// Score descending, then larger |delta_pct|, then dim_value ascending.
fn compare_contributors(a: &RcaContributor, b: &RcaContributor) -> Ordering {
    b.contribution_score
        .total_cmp(&a.contribution_score)
        .then_with(|| b.delta_pct.abs().total_cmp(&a.delta_pct.abs()))
        .then_with(|| a.dim_value.cmp(&b.dim_value))
}

fn assign_dense_ranks(sorted: &mut [RcaContributor]) {
    let mut rank = 0u32;
    let mut last_score: Option<f64> = None;
    for row in sorted.iter_mut() {
        if last_score != Some(row.contribution_score) {
            rank += 1;
            last_score = Some(row.contribution_score);
        }
        row.rank = rank;
    }
}

fn validate_slice(kpi_key: &str, slice: &SliceAggregate) -> Result<()> {
    let label = format!("{kpi_key} slice {}={}", slice.dim_key, slice.dim_value);
    if !slice.volume.is_finite() || slice.volume < 0.0 {
        return Err(EngineError::invalid_input(format!(
            "{label} has invalid volume {}",
            slice.volume
        )));
    }
    if !slice.current_value.is_finite() || slice.previous_value.is_some_and(|p| !p.is_finite()) {
        return Err(EngineError::invalid_input(format!(
            "{label} has a non-finite value"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sept() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
    }

    fn slice(dim_key: &str, value: &str, prev: Option<f64>, curr: f64, volume: f64) -> SliceAggregate {
        SliceAggregate {
            dim_key: dim_key.to_string(),
            dim_value: value.to_string(),
            current_value: curr,
            previous_value: prev,
            volume,
        }
    }

    #[test]
    fn sales_outranks_it_on_department_breakdown() {
        let slices = vec![
            slice("department", "IT", Some(80.0), 78.0, 50.0),
            slice("department", "Sales", Some(90.0), 50.0, 200.0),
        ];
        let ranked =
            rank_breakdown("kpi_completion_rate", sept(), "department", None, &slices, 5).unwrap();

        let names: Vec<_> = ranked.contributors.iter().map(|c| c.dim_value.as_str()).collect();
        assert_eq!(names, vec!["Sales", "IT"]);
        assert_eq!(ranked.contributors[0].rank, 1);
        assert_eq!(ranked.contributors[1].rank, 2);
        assert!((ranked.contributors[0].share_ratio - 0.8).abs() < 1e-9);
        assert!(ranked.contributors[0].delta_pct < 0.0);
    }

    #[test]
    fn scores_are_non_increasing_and_truncated() {
        let slices: Vec<_> = (0..10)
            .map(|i| {
                slice(
                    "region",
                    &format!("r{i}"),
                    Some(100.0),
                    100.0 - (i as f64) * 3.0,
                    10.0 + i as f64,
                )
            })
            .collect();
        let ranked = rank_breakdown("kpi", sept(), "region", None, &slices, 4).unwrap();
        assert!(ranked.contributors.len() <= 4);
        for pair in ranked.contributors.windows(2) {
            assert!(pair[0].contribution_score >= pair[1].contribution_score);
        }
    }

    #[test]
    fn excluded_slices_still_count_in_share_denominator() {
        let slices = vec![
            slice("site", "north", Some(10.0), 12.0, 30.0),
            slice("site", "south", Some(0.0), 5.0, 50.0),
            slice("site", "new", None, 7.0, 20.0),
        ];
        let ranked = rank_breakdown("kpi", sept(), "site", None, &slices, 5).unwrap();

        assert_eq!(ranked.contributors.len(), 1);
        assert_eq!(ranked.contributors[0].dim_value, "north");
        assert!((ranked.contributors[0].share_ratio - 0.3).abs() < 1e-9);

        let total: f64 = ranked.shares.iter().map(|s| s.share_ratio).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(ranked.shares.iter().filter(|s| !s.ranked).count(), 2);
    }

    #[test]
    fn ties_break_on_delta_then_name_with_dense_ranks() {
        // a and b: |delta| 12.5% at share 0.25; c: |delta| 6.25% at share 0.5. All score 3.125.
        let slices = vec![
            slice("role", "b", Some(128.0), 112.0, 25.0),
            slice("role", "c", Some(128.0), 136.0, 50.0),
            slice("role", "a", Some(128.0), 144.0, 25.0),
        ];
        let ranked = rank_breakdown("kpi", sept(), "role", None, &slices, 5).unwrap();
        let order: Vec<_> = ranked
            .contributors
            .iter()
            .map(|c| (c.dim_value.as_str(), c.rank))
            .collect();
        assert_eq!(order, vec![("a", 1), ("b", 1), ("c", 1)]);
    }

    #[test]
    fn catalog_filters_unknown_values() {
        let catalog = DimensionCatalog::new()
            .with_dimension("department", ["Sales", "IT"])
            .with_dimension("region", ["EU"]);
        let slices = vec![
            slice("department", "Sales", Some(90.0), 50.0, 200.0),
            slice("department", "IT", Some(80.0), 78.0, 50.0),
            slice("department", "Legal", Some(10.0), 1.0, 750.0),
            slice("region", "EU", Some(50.0), 40.0, 100.0),
        ];
        let breakdowns = rank_catalog("kpi", sept(), &catalog, &slices, 5).unwrap();
        assert_eq!(breakdowns.len(), 2);

        let department = &breakdowns[0];
        assert_eq!(department.dim_key, "department");
        assert_eq!(department.total_volume, 250.0);
        assert!(department.contributors.iter().all(|c| c.dim_value != "Legal"));

        let top = top_contributor(&breakdowns).unwrap();
        assert_eq!(top.dim_value, "Sales");
    }

    #[test]
    fn rejects_negative_volume_and_duplicates() {
        let negative = vec![slice("department", "IT", Some(1.0), 2.0, -5.0)];
        assert!(rank_breakdown("kpi", sept(), "department", None, &negative, 5).is_err());

        let duplicate = vec![
            slice("department", "IT", Some(1.0), 2.0, 5.0),
            slice("department", "IT", Some(1.0), 3.0, 5.0),
        ];
        assert!(rank_breakdown("kpi", sept(), "department", None, &duplicate, 5).is_err());
    }

    #[test]
    fn zero_total_volume_yields_zero_shares() {
        let slices = vec![slice("channel", "email", Some(10.0), 5.0, 0.0)];
        let ranked = rank_breakdown("kpi", sept(), "channel", None, &slices, 5).unwrap();
        assert_eq!(ranked.contributors[0].share_ratio, 0.0);
        assert_eq!(ranked.contributors[0].contribution_score, 0.0);
    }
}
