// =============================================================================
// Score Computation — rolling k-day window over every (x, y) pair
// =============================================================================
//
// For a pair of time points (x, y) with y at least `horizontal_gap` indices
// after x, the per-day return is (price(d, y) / price(d, x) - 1) * 100. A
// deque holds the last k contributions so each day costs O(1); a window is
// scored only once it is full.
//
// Percentiles use the sorted-list index floor(p * n).
// =============================================================================

use std::collections::VecDeque;

use chrono::NaiveTime;

use super::{DayGrid, PriceSample};

/// Statistics for one (x, y) pair at one vertical gap.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorePoint {
    /// Buy time-of-day.
    pub x: NaiveTime,
    /// Sell time-of-day.
    pub y: NaiveTime,
    /// Full windows whose rolling sum exceeded the vertical gap.
    pub exceeded: u32,
    /// Full windows whose rolling sum was positive.
    pub profit_days: u32,
    /// Number of full windows scored.
    pub total_count: u32,
    pub exceed_prob: f64,
    pub profit_prob: f64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub p5: f64,
    pub p10: f64,
    pub p20: f64,
    pub p40: f64,
    pub p50: f64,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((p * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Score every ordered pair (x, y) with index distance >= `horizontal_gap`
/// against `vertical_gap`, over windows of `continuous_days` accepted days.
///
/// The grid must already be pruned to a consistent time-point set. Pairs
/// that never complete a full window are omitted; an empty grid or a window
/// longer than the day count yields an empty result.
pub fn score_pairs(
    grid: &DayGrid,
    vertical_gap: f64,
    horizontal_gap: usize,
    continuous_days: usize,
    sample: PriceSample,
) -> Vec<ScorePoint> {
    let time_points: Vec<NaiveTime> = match grid.values().next() {
        Some(points) => points.keys().copied().collect(),
        None => return Vec::new(),
    };
    if continuous_days == 0 {
        return Vec::new();
    }

    let mut scores = Vec::new();

    for (xi, &x) in time_points.iter().enumerate() {
        for (yi, &y) in time_points.iter().enumerate() {
            if yi < xi + horizontal_gap.max(1) {
                continue;
            }

            let mut window: VecDeque<f64> = VecDeque::with_capacity(continuous_days);
            let mut window_sum = 0.0_f64;
            let mut exceeded = 0u32;
            let mut profit_days = 0u32;
            let mut total_count = 0u32;
            let mut sum = 0.0_f64;
            let mut highest = f64::NEG_INFINITY;
            let mut lowest = f64::INFINITY;
            let mut record = Vec::new();

            for points in grid.values() {
                let (Some(x_bar), Some(y_bar)) = (points.get(&x), points.get(&y)) else {
                    continue;
                };
                let contribution = (sample.exit(y_bar) / sample.entry(x_bar) - 1.0) * 100.0;
                window.push_back(contribution);
                window_sum += contribution;

                if window.len() == continuous_days {
                    if window_sum > vertical_gap {
                        exceeded += 1;
                    }
                    if window_sum > 0.0 {
                        profit_days += 1;
                    }
                    record.push(window_sum);
                    total_count += 1;
                    sum += window_sum;
                    highest = highest.max(window_sum);
                    lowest = lowest.min(window_sum);

                    if let Some(removed) = window.pop_front() {
                        window_sum -= removed;
                    }
                }
            }

            if total_count == 0 {
                continue;
            }

            record.sort_by(f64::total_cmp);
            let n = total_count as f64;
            scores.push(ScorePoint {
                x,
                y,
                exceeded,
                profit_days,
                total_count,
                exceed_prob: f64::from(exceeded) / n,
                profit_prob: f64::from(profit_days) / n,
                average: sum / n,
                highest,
                lowest,
                p5: percentile(&record, 0.05),
                p10: percentile(&record, 0.10),
                p20: percentile(&record, 0.20),
                p40: percentile(&record, 0.40),
                p50: percentile(&record, 0.50),
            });
        }
    }

    // Stable tie-breaking: most exceeding windows first, then highest average.
    scores.sort_by(|a, b| {
        b.exceeded
            .cmp(&a.exceeded)
            .then(b.average.total_cmp(&a.average))
    });
    scores
}
