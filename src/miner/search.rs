// =============================================================================
// Vertical-Gap Search — bisection to the largest threshold still exceeded
// =============================================================================
//
// For one (symbol, horizontal_gap, continuous_days) the search bisects
// v ∈ [0, 200]: when the top-scoring point at the midpoint clears the
// exceed-probability target the midpoint becomes the new lower bound and the
// candidate is recorded; otherwise the upper bound comes down. `best_valid`
// is only ever written on a clearing iteration, so a later failing midpoint
// can never displace an earlier valid candidate.
// =============================================================================

use tracing::debug;

use super::{score_pairs, DayGrid, PriceSample, ScorePoint};

/// Lower bound of the bisection range.
const V_GAP_MIN: f64 = 0.0;
/// Upper bound of the bisection range (percent).
const V_GAP_MAX: f64 = 200.0;
/// Bisection stops once the bracket is narrower than this.
const V_GAP_RESOLUTION: f64 = 0.1;
/// Hard cap on bisection iterations.
const MAX_ITERATIONS: u32 = 100;

/// Search inputs for one (horizontal_gap, continuous_days) combination.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Required exceed probability τ.
    pub threshold_prob: f64,
    pub horizontal_gap: usize,
    pub continuous_days: usize,
    pub sample: PriceSample,
}

/// A mined pattern for one symbol: the winning (x, y) point decorated with
/// the gap configuration that produced it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub stock: String,
    pub exchange: String,
    pub vertical_gap: f64,
    pub horizontal_gap: i64,
    pub continuous_days: i64,
    pub point: ScorePoint,
}

/// Bisect the vertical gap for one parameter combination. Returns the
/// largest gap that still cleared τ together with its top point, or `None`
/// when the grid never produces a full window or no gap clears τ.
pub fn search_vertical_gap(grid: &DayGrid, params: SearchParams) -> Option<(f64, ScorePoint)> {
    let mut lo = V_GAP_MIN;
    let mut hi = V_GAP_MAX;
    let mut best_valid: Option<(f64, ScorePoint)> = None;

    for iteration in 0..MAX_ITERATIONS {
        if hi - lo <= V_GAP_RESOLUTION {
            break;
        }
        let mid = (lo + hi) / 2.0;
        let scores = score_pairs(
            grid,
            mid,
            params.horizontal_gap,
            params.continuous_days,
            params.sample,
        );
        let Some(top) = scores.into_iter().next() else {
            // No pair ever fills a window; narrowing the gap cannot fix that.
            return None;
        };

        if top.exceed_prob >= params.threshold_prob {
            debug!(
                iteration,
                vertical_gap = mid,
                exceed_prob = top.exceed_prob,
                "midpoint clears threshold — moving lower bound up"
            );
            best_valid = Some((mid, top));
            lo = mid;
        } else {
            hi = mid;
        }
    }

    best_valid
}

/// Mine one symbol for a fixed `continuous_days` across every horizontal
/// gap, keeping the candidate with the largest successful vertical gap.
pub fn mine_symbol(
    grid: &DayGrid,
    stock: &str,
    exchange: &str,
    threshold_prob: f64,
    horizontal_gaps: &[usize],
    continuous_days: usize,
    sample: PriceSample,
) -> Option<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();

    for &horizontal_gap in horizontal_gaps {
        let params = SearchParams {
            threshold_prob,
            horizontal_gap,
            continuous_days,
            sample,
        };
        if let Some((vertical_gap, point)) = search_vertical_gap(grid, params) {
            candidates.push(Candidate {
                stock: stock.to_string(),
                exchange: exchange.to_string(),
                vertical_gap,
                horizontal_gap: horizontal_gap as i64,
                continuous_days: continuous_days as i64,
                point,
            });
        }
    }

    candidates
        .into_iter()
        .max_by(|a, b| a.vertical_gap.total_cmp(&b.vertical_gap))
}
