// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::miner::PriceSample;

/// Lifecycle status shared by runs, executions, details, and tasks.
///
/// Every record moves `queued -> running -> completed` with `failed` as the
/// only other terminal state. Transitions happen exclusively through
/// compare-and-set updates in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed records are never transitioned again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of an order as stored on a task and sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an execution sends real orders or synthesises fills locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Simulate,
    Real,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulate => "simulate",
            Self::Real => "real",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simulate" => Some(Self::Simulate),
            "real" => Some(Self::Real),
            _ => None,
        }
    }
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Simulate
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Run configuration
// =============================================================================

fn default_threshold_prob() -> f64 {
    0.8
}

fn default_horizontal_gaps() -> Vec<usize> {
    vec![2]
}

fn default_continuous_days() -> Vec<usize> {
    vec![3, 5, 7, 10]
}

fn default_granularity() -> String {
    "3minute".to_string()
}

/// Immutable configuration blob attached to a strategy run.
///
/// Every field has a serde default so that configs submitted by older
/// clients still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Target lower bound on the fraction of windows exceeding the
    /// vertical gap.
    #[serde(default = "default_threshold_prob")]
    pub threshold_prob: f64,

    /// Minimum index distances between the buy and sell time-of-day points.
    #[serde(default = "default_horizontal_gaps")]
    pub horizontal_gaps: Vec<usize>,

    /// Rolling-window lengths (in trading days) to evaluate.
    #[serde(default = "default_continuous_days")]
    pub continuous_days: Vec<usize>,

    /// Bar granularity used for mining.
    #[serde(default = "default_granularity")]
    pub granularity: String,

    /// Mining window start; defaults to 90 days before the run starts.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Mining window end; defaults to the day the run starts.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    #[serde(default)]
    pub nse_stocks: Vec<String>,

    #[serde(default)]
    pub bse_stocks: Vec<String>,

    /// Mine the fixed NSE top-100 allow-list instead of `nse_stocks`.
    #[serde(default)]
    pub include_all_nse: bool,

    /// Mine every BSE symbol known to the ingester instead of `bse_stocks`.
    #[serde(default)]
    pub include_all_bse: bool,

    /// Which price the miner samples from each bar.
    #[serde(default)]
    pub price_sample: PriceSample,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threshold_prob: default_threshold_prob(),
            horizontal_gaps: default_horizontal_gaps(),
            continuous_days: default_continuous_days(),
            granularity: default_granularity(),
            start_date: None,
            end_date: None,
            nse_stocks: Vec::new(),
            bse_stocks: Vec::new(),
            include_all_nse: false,
            include_all_bse: false,
            price_sample: PriceSample::default(),
        }
    }
}

impl RunConfig {
    /// Resolve the mining date range, falling back to the trailing 90 days.
    pub fn date_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => (start, end),
            _ => (today - chrono::Duration::days(90), today),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("pending"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn side_and_mode_roundtrip() {
        assert_eq!(OrderSide::parse("buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("sell"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("short"), None);
        assert_eq!(TradeMode::parse("simulate"), Some(TradeMode::Simulate));
        assert_eq!(TradeMode::parse("real"), Some(TradeMode::Real));
    }

    #[test]
    fn run_config_empty_json_uses_defaults() {
        let cfg: RunConfig = serde_json::from_str("{}").unwrap();
        assert!((cfg.threshold_prob - 0.8).abs() < f64::EPSILON);
        assert_eq!(cfg.horizontal_gaps, vec![2]);
        assert_eq!(cfg.continuous_days, vec![3, 5, 7, 10]);
        assert_eq!(cfg.granularity, "3minute");
        assert!(!cfg.include_all_nse);
        assert_eq!(cfg.price_sample, PriceSample::Open);
    }

    #[test]
    fn run_config_partial_json_fills_defaults() {
        let json = r#"{ "nse_stocks": ["RELIANCE", "TCS"], "continuous_days": [3] }"#;
        let cfg: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.nse_stocks, vec!["RELIANCE", "TCS"]);
        assert_eq!(cfg.continuous_days, vec![3]);
        assert_eq!(cfg.horizontal_gaps, vec![2]);
    }

    #[test]
    fn date_range_defaults_to_trailing_90_days() {
        let cfg = RunConfig::default();
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let (start, end) = cfg.date_range(today);
        assert_eq!(end, today);
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
    }

    #[test]
    fn date_range_uses_explicit_bounds() {
        let cfg = RunConfig {
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2026, 2, 1),
            ..RunConfig::default()
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        assert_eq!(
            cfg.date_range(today),
            (
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
            )
        );
    }
}
