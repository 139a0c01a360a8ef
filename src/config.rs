use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Threshold bands for flag classification. These are tenant policy, not
/// fixed business rules; every cutoff can be overridden from file or env.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagThresholds {
    pub z_warn: f64,
    pub z_alert: f64,
    pub delta_warn_pct: f64,
    pub delta_alert_pct: f64,
}

impl Default for FlagThresholds {
    fn default() -> Self {
        Self {
            z_warn: 1.0,
            z_alert: 2.0,
            delta_warn_pct: 10.0,
            delta_alert_pct: 25.0,
        }
    }
}

impl FlagThresholds {
    pub fn validate(&self) -> Result<()> {
        check_band("z", self.z_warn, self.z_alert)?;
        check_band("delta_pct", self.delta_warn_pct, self.delta_alert_pct)
    }
}

fn check_band(name: &str, warn: f64, alert: f64) -> Result<()> {
    if !warn.is_finite() || !alert.is_finite() || warn < 0.0 || alert < 0.0 {
        return Err(EngineError::invalid_config(format!(
            "{name} thresholds must be finite and non-negative (warn {warn}, alert {alert})"
        )));
    }
    if warn > alert {
        return Err(EngineError::invalid_config(format!(
            "{name} warn threshold {warn} exceeds alert threshold {alert}"
        )));
    }
    Ok(())
}

/// Which points feed the mean and standard deviation for a z-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    /// Trailing window including the current point.
    #[default]
    TrailingInclusive,
    /// Prior points of the trailing window only.
    PriorOnly,
}

impl std::str::FromStr for BaselineMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trailing_inclusive" | "inclusive" => Ok(BaselineMode::TrailingInclusive),
            "prior_only" | "prior" => Ok(BaselineMode::PriorOnly),
            other => Err(format!("unknown baseline mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thresholds: FlagThresholds,
    pub baseline: BaselineMode,
    pub rca_top_n: usize,
    pub insight_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: FlagThresholds::default(),
            baseline: BaselineMode::default(),
            rca_top_n: 5,
            insight_limit: 10,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then `GATEK_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            EngineError::invalid_config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| EngineError::invalid_config(format!("malformed config: {err}")))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GATEK_Z_WARN") {
            self.thresholds.z_warn = parse_var("GATEK_Z_WARN", &value)?;
        }
        if let Some(value) = lookup("GATEK_Z_ALERT") {
            self.thresholds.z_alert = parse_var("GATEK_Z_ALERT", &value)?;
        }
        if let Some(value) = lookup("GATEK_DELTA_WARN_PCT") {
            self.thresholds.delta_warn_pct = parse_var("GATEK_DELTA_WARN_PCT", &value)?;
        }
        if let Some(value) = lookup("GATEK_DELTA_ALERT_PCT") {
            self.thresholds.delta_alert_pct = parse_var("GATEK_DELTA_ALERT_PCT", &value)?;
        }
        if let Some(value) = lookup("GATEK_BASELINE") {
            self.baseline = value.parse().map_err(EngineError::invalid_config)?;
        }
        if let Some(value) = lookup("GATEK_RCA_TOP_N") {
            self.rca_top_n = parse_var("GATEK_RCA_TOP_N", &value)?;
        }
        if let Some(value) = lookup("GATEK_INSIGHT_LIMIT") {
            self.insight_limit = parse_var("GATEK_INSIGHT_LIMIT", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.rca_top_n == 0 {
            return Err(EngineError::invalid_config("rca_top_n must be at least 1"));
        }
        if self.insight_limit == 0 {
            return Err(EngineError::invalid_config("insight_limit must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::invalid_config(format!("{key} has unparseable value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thresholds.z_alert, 2.0);
        assert_eq!(config.thresholds.z_warn, 1.0);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config = EngineConfig::from_json(r#"{"thresholds": {"z_alert": 3.0}, "rca_top_n": 3}"#)
            .unwrap();
        assert_eq!(config.thresholds.z_alert, 3.0);
        assert_eq!(config.thresholds.z_warn, 1.0);
        assert_eq!(config.rca_top_n, 3);
        assert_eq!(config.baseline, BaselineMode::TrailingInclusive);
    }

    #[test]
    fn env_overrides_apply_on_top() {
        let vars: HashMap<&str, &str> = [
            ("GATEK_DELTA_ALERT_PCT", "40"),
            ("GATEK_BASELINE", "prior_only"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.thresholds.delta_alert_pct, 40.0);
        assert_eq!(config.baseline, BaselineMode::PriorOnly);
    }

    #[test]
    fn rejects_inverted_bands_and_garbage() {
        let mut config = EngineConfig::default();
        config.thresholds.z_warn = 3.0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));

        let mut config = EngineConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "GATEK_RCA_TOP_N").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }
}
