use statrs::statistics::{Data, Median, OrderStatistics, Statistics};

use crate::config::drop_thresholds;
use crate::types::{DropReference, DropSignal, PriceObservation, PriceStats, Trend, DAY_NS};

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Drop classification
// ---------------------------------------------------------------------------

/// Volatile items get a lower bar, stable items a higher one.
/// A missing CV (fewer than two prices) uses the default.
pub fn select_threshold(cv: Option<f64>) -> f64 {
    match cv {
        Some(cv) if cv > drop_thresholds::VOLATILE_CV => drop_thresholds::VOLATILE,
        Some(cv) if cv < drop_thresholds::STABLE_CV => drop_thresholds::STABLE,
        _ => drop_thresholds::DEFAULT,
    }
}

/// Percent below `reference`, one decimal.
pub fn drop_percent(price: f64, reference: f64) -> f64 {
    round_to((1.0 - price / reference) * 100.0, 1)
}

/// A drop fires when the price sits at or below either reference scaled by
/// `(1 - threshold)`. The 30-day floor is checked first, so when both fire the
/// reported percentage is relative to the floor.
pub fn classify_drop(price: f64, floor_30d: f64, previous: Option<f64>, threshold: f64) -> DropSignal {
    let factor = 1.0 - threshold;

    if floor_30d > 0.0 && price <= floor_30d * factor {
        return DropSignal {
            is_drop: true,
            drop_percent: Some(drop_percent(price, floor_30d)),
            reference: Some(DropReference::Floor30d),
        };
    }

    if let Some(prev) = previous.filter(|p| *p > 0.0) {
        if price <= prev * factor {
            return DropSignal {
                is_drop: true,
                drop_percent: Some(drop_percent(price, prev)),
                reference: Some(DropReference::PreviousPrice),
            };
        }
    }

    DropSignal::none()
}

// ---------------------------------------------------------------------------
// Full recompute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregates {
    pub window_30d: WindowStats,
    pub cv_30d: Option<f64>,
    pub window_7d: Option<WindowStats>,
    pub trend: Option<Trend>,
}

impl Aggregates {
    pub fn apply_to(&self, stats: &mut PriceStats, now_ns: i64) {
        let w = &self.window_30d;
        stats.min_30d = w.min;
        stats.max_30d = w.max;
        stats.avg_30d = w.avg;
        stats.median_30d = w.median;
        stats.p25_30d = w.p25;
        stats.p75_30d = w.p75;
        stats.cv_30d = self.cv_30d;
        if let Some(w7) = &self.window_7d {
            stats.min_7d = w7.min;
            stats.max_7d = w7.max;
            stats.avg_7d = w7.avg;
            stats.median_7d = w7.median;
        }
        if self.trend.is_some() {
            stats.trend = self.trend;
        }
        stats.last_recompute_ns = now_ns;
    }
}

pub fn window_stats(prices: &[f64]) -> Option<WindowStats> {
    if prices.is_empty() {
        return None;
    }
    let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
    let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = Statistics::mean(prices.iter());
    let mut data = Data::new(prices.to_vec());
    Some(WindowStats {
        min,
        max,
        avg: round_to(avg, 2),
        median: round_to(data.median(), 2),
        p25: round_to(data.percentile(25), 2),
        p75: round_to(data.percentile(75), 2),
    })
}

/// Sample standard deviation over mean, three decimals.
pub fn coefficient_of_variation(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }
    let mean = Statistics::mean(prices.iter());
    if mean <= 0.0 {
        return None;
    }
    let sd = Statistics::std_dev(prices.iter());
    Some(round_to(sd / mean, 3))
}

/// Direction over the last three prices in arrival order.
pub fn trend_of(prices: &[f64]) -> Option<Trend> {
    if prices.len() < 3 {
        return None;
    }
    let last3 = &prices[prices.len() - 3..];
    let first = last3[0];
    let last = last3[2];
    Some(if last < first * 0.95 {
        Trend::Down
    } else if last > first * 1.05 {
        Trend::Up
    } else {
        Trend::Stable
    })
}

/// Recomputes every aggregate from history. `history` must be ordered by
/// arrival and include the observation being recorded.
pub fn compute_aggregates(history: &[PriceObservation], now_ns: i64) -> Option<Aggregates> {
    let cutoff_30d = now_ns - 30 * DAY_NS;
    let cutoff_7d = now_ns - 7 * DAY_NS;

    let prices_30d: Vec<f64> = history
        .iter()
        .filter(|o| o.observed_at_ns >= cutoff_30d)
        .map(|o| o.price)
        .collect();
    let prices_7d: Vec<f64> = history
        .iter()
        .filter(|o| o.observed_at_ns >= cutoff_7d)
        .map(|o| o.price)
        .collect();
    let all: Vec<f64> = history.iter().map(|o| o.price).collect();

    Some(Aggregates {
        window_30d: window_stats(&prices_30d)?,
        cv_30d: coefficient_of_variation(&prices_30d),
        window_7d: window_stats(&prices_7d),
        trend: trend_of(&all),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(price: f64, days_ago: i64, now: i64) -> PriceObservation {
        PriceObservation {
            id: 0,
            item_id: 1,
            price,
            list_price: None,
            url: None,
            observed_at_ns: now - days_ago * DAY_NS,
        }
    }

    #[test]
    fn threshold_tracks_volatility() {
        assert_eq!(select_threshold(None), 0.12);
        assert_eq!(select_threshold(Some(0.22)), 0.10);
        assert_eq!(select_threshold(Some(0.02)), 0.15);
        assert_eq!(select_threshold(Some(0.08)), 0.12);
        assert_eq!(select_threshold(Some(0.15)), 0.12);
    }

    #[test]
    fn floor_drop_with_default_threshold() {
        // floor 100, threshold 12%: 87 fires, 89 does not.
        let hit = classify_drop(87.0, 100.0, Some(100.0), 0.12);
        assert!(hit.is_drop);
        assert_eq!(hit.drop_percent, Some(13.0));
        assert_eq!(hit.reference, Some(DropReference::Floor30d));

        let miss = classify_drop(89.0, 100.0, Some(100.0), 0.12);
        assert!(!miss.is_drop);
        assert_eq!(miss.drop_percent, None);
    }

    #[test]
    fn volatile_item_drops_against_previous_price() {
        // floor well below previous: only the previous-price check can fire.
        let threshold = select_threshold(Some(0.22));
        let signal = classify_drop(89.0, 80.0, Some(100.0), threshold);
        assert!(signal.is_drop);
        assert_eq!(signal.drop_percent, Some(11.0));
        assert_eq!(signal.reference, Some(DropReference::PreviousPrice));
    }

    #[test]
    fn floor_wins_when_both_references_fire() {
        let signal = classify_drop(70.0, 90.0, Some(100.0), 0.12);
        assert_eq!(signal.reference, Some(DropReference::Floor30d));
        assert_eq!(signal.drop_percent, Some(22.2));
    }

    #[test]
    fn lower_price_never_clears_a_drop() {
        let (floor, prev, threshold) = (100.0, Some(104.0), 0.12);
        let mut seen_drop = false;
        let mut p = 100.0;
        while p > 40.0 {
            let s = classify_drop(p, floor, prev, threshold);
            if seen_drop {
                assert!(s.is_drop, "price {p} lost the drop flag");
            }
            seen_drop |= s.is_drop;
            p -= 0.5;
        }
        assert!(seen_drop);
    }

    #[test]
    fn cv_requires_two_prices() {
        assert_eq!(coefficient_of_variation(&[100.0]), None);
        assert_eq!(coefficient_of_variation(&[100.0, 100.0]), Some(0.0));
        let cv = coefficient_of_variation(&[90.0, 100.0, 110.0]).unwrap();
        assert!((cv - 0.1).abs() < 1e-9);
    }

    #[test]
    fn trend_over_last_three() {
        assert_eq!(trend_of(&[100.0, 100.0]), None);
        assert_eq!(trend_of(&[200.0, 100.0, 98.0, 90.0]), Some(Trend::Down));
        assert_eq!(trend_of(&[100.0, 103.0, 110.0]), Some(Trend::Up));
        assert_eq!(trend_of(&[100.0, 97.0, 102.0]), Some(Trend::Stable));
    }

    #[test]
    fn aggregates_respect_windows() {
        let now = 100 * DAY_NS;
        let history = vec![
            obs(50.0, 40, now), // outside 30d
            obs(80.0, 20, now),
            obs(100.0, 10, now),
            obs(120.0, 3, now),
            obs(110.0, 1, now),
        ];
        let agg = compute_aggregates(&history, now).unwrap();
        assert_eq!(agg.window_30d.min, 80.0);
        assert_eq!(agg.window_30d.max, 120.0);
        assert_eq!(agg.window_30d.avg, 102.5);
        assert_eq!(agg.window_30d.median, 105.0);
        let w7 = agg.window_7d.unwrap();
        assert_eq!(w7.min, 110.0);
        assert_eq!(w7.max, 120.0);
        assert_eq!(agg.trend, Some(Trend::Up));
        assert!(agg.cv_30d.unwrap() > 0.1);
    }

    #[test]
    fn single_price_aggregates_equal_price() {
        let now = DAY_NS;
        let agg = compute_aggregates(&[obs(100.0, 0, now)], now).unwrap();
        assert_eq!(agg.window_30d.min, 100.0);
        assert_eq!(agg.window_30d.median, 100.0);
        assert_eq!(agg.window_30d.p25, 100.0);
        assert_eq!(agg.cv_30d, None);
        assert_eq!(agg.trend, None);
    }
}
