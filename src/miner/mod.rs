// =============================================================================
// Pattern Miner — entry/exit time-of-day mining over daily OHLC grids
// =============================================================================
//
// The miner is pure over bar data: `build_day_grid` shapes a bar series into
// a day -> time-of-day -> OHLC grid, `score` evaluates every (x, y) pair for
// one vertical gap, and `search` bisects the vertical gap to the largest
// threshold still exceeded with the target probability.
// =============================================================================

pub mod score;
pub mod search;

pub use score::{score_pairs, ScorePoint};
pub use search::{mine_symbol, search_vertical_gap, Candidate, SearchParams};

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::bars::Bar;

/// Prices at one time-of-day of one trading day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// day -> time-of-day -> OHLC. BTreeMaps keep both axes sorted, which the
/// sliding window depends on.
pub type DayGrid = BTreeMap<NaiveDate, BTreeMap<NaiveTime, Ohlc>>;

/// Which price the miner samples from a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSample {
    /// Bar open on both legs. The pinned production choice.
    Open,
    /// (open+high+close)/3 at the buy anchor, (open+low+close)/3 at the
    /// sell anchor.
    Blended,
}

impl Default for PriceSample {
    fn default() -> Self {
        Self::Open
    }
}

impl PriceSample {
    /// Price sampled at the buy anchor x.
    pub fn entry(&self, bar: &Ohlc) -> f64 {
        match self {
            Self::Open => bar.open,
            Self::Blended => (bar.open + bar.high + bar.close) / 3.0,
        }
    }

    /// Price sampled at the sell anchor y.
    pub fn exit(&self, bar: &Ohlc) -> f64 {
        match self {
            Self::Open => bar.open,
            Self::Blended => (bar.open + bar.low + bar.close) / 3.0,
        }
    }
}

/// Group a bar series into a day grid.
pub fn build_day_grid(bars: &[Bar]) -> DayGrid {
    let mut grid = DayGrid::new();
    for bar in bars {
        grid.entry(bar.record_time.date()).or_default().insert(
            bar.record_time.time(),
            Ohlc {
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            },
        );
    }
    grid
}

/// Drop days whose time-of-day set differs from the canonical set of the
/// first day. Returns the number of dropped days. Partial days happen around
/// half sessions and ingest gaps; they are logged, never fatal.
pub fn prune_inconsistent_days(grid: &mut DayGrid) -> usize {
    let canonical: Vec<NaiveTime> = match grid.values().next() {
        Some(points) => points.keys().copied().collect(),
        None => return 0,
    };

    let inconsistent: Vec<NaiveDate> = grid
        .iter()
        .filter(|(_, points)| {
            points.len() != canonical.len() || !points.keys().eq(canonical.iter())
        })
        .map(|(day, _)| *day)
        .collect();

    if !inconsistent.is_empty() {
        warn!(days = ?inconsistent, "dropping days with inconsistent time points");
    }
    for day in &inconsistent {
        grid.remove(day);
    }
    inconsistent.len()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn bar(time: &str, open: f64) -> Bar {
        Bar {
            stock: "RELIANCE".into(),
            exchange: "NSE".into(),
            granularity: "3minute".into(),
            record_time: NaiveDateTime::parse_from_str(time, "%Y-%m-%d %H:%M:%S").unwrap(),
            open,
            high: open + 2.0,
            low: open - 2.0,
            close: open + 1.0,
            volume: 100,
        }
    }

    #[test]
    fn grid_groups_by_day_and_time() {
        let grid = build_day_grid(&[
            bar("2026-01-20 09:15:00", 100.0),
            bar("2026-01-20 09:30:00", 101.0),
            bar("2026-01-21 09:15:00", 102.0),
        ]);
        assert_eq!(grid.len(), 2);
        let first_day = grid.values().next().unwrap();
        assert_eq!(first_day.len(), 2);
    }

    #[test]
    fn prune_drops_partial_days() {
        let mut grid = build_day_grid(&[
            bar("2026-01-20 09:15:00", 100.0),
            bar("2026-01-20 09:30:00", 101.0),
            bar("2026-01-21 09:15:00", 102.0), // missing 09:30
            bar("2026-01-22 09:15:00", 103.0),
            bar("2026-01-22 09:30:00", 104.0),
        ]);
        let dropped = prune_inconsistent_days(&mut grid);
        assert_eq!(dropped, 1);
        assert_eq!(grid.len(), 2);
        assert!(!grid.contains_key(&NaiveDate::from_ymd_opt(2026, 1, 21).unwrap()));
    }

    #[test]
    fn prune_keeps_consistent_grid_intact() {
        let mut grid = build_day_grid(&[
            bar("2026-01-20 09:15:00", 100.0),
            bar("2026-01-21 09:15:00", 101.0),
        ]);
        assert_eq!(prune_inconsistent_days(&mut grid), 0);
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn price_sample_hooks() {
        let bar = Ohlc {
            open: 100.0,
            high: 106.0,
            low: 94.0,
            close: 103.0,
        };
        assert!((PriceSample::Open.entry(&bar) - 100.0).abs() < f64::EPSILON);
        assert!((PriceSample::Open.exit(&bar) - 100.0).abs() < f64::EPSILON);
        assert!((PriceSample::Blended.entry(&bar) - (100.0 + 106.0 + 103.0) / 3.0).abs() < 1e-12);
        assert!((PriceSample::Blended.exit(&bar) - (100.0 + 94.0 + 103.0) / 3.0).abs() < 1e-12);
    }
}
