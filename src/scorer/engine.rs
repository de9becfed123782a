use std::sync::Arc;

use crate::scorer::tables::{
    baseline_sell_days, brand_tier, classify_color, classify_size, is_off_season, BrandTier,
    ColorClass, SizeClass, UNKNOWN_BRAND_POPULARITY,
};
use crate::tracker::stats::round_to;
use crate::types::{Comparables, PriceBand, Recommendation, Score, TrackedItem};

pub const MODEL_VERSION: &str = "rules_v2";

/// Secondary-marketplace selling costs.
pub mod costs {
    pub const FEE_RATE: f64 = 0.08;
    pub const SHIPPING: f64 = 4.50;
}

/// Component weights for the overall score.
pub mod weights {
    pub const MARGIN: f64 = 0.4;
    pub const LIQUIDITY: f64 = 0.3;
    pub const POPULARITY: f64 = 0.2;
    pub const RISK: f64 = 0.1;
}

pub struct ScoringInput<'a> {
    pub item: &'a TrackedItem,
    pub comparables: &'a Comparables,
    /// Calendar month (1–12) used for seasonality.
    pub month: u32,
}

// ---------------------------------------------------------------------------
// Explanation
// ---------------------------------------------------------------------------

pub struct ExplanationContext<'a> {
    pub overall: f64,
    pub margin_score: f64,
    pub liquidity_score: f64,
    pub margin_pct: f64,
    pub listing_count: u32,
    pub action: Recommendation,
    pub risks: &'a [String],
}

/// Produces the human-readable rationale attached to a score.
pub trait Explainer: Send + Sync {
    fn explain(&self, ctx: &ExplanationContext<'_>) -> String;
}

/// Deterministic one-line rationale built from the score components.
pub struct RuleExplainer;

impl Explainer for RuleExplainer {
    fn explain(&self, ctx: &ExplanationContext<'_>) -> String {
        let margin = if ctx.margin_score >= 70.0 {
            format!("Strong margin ({:.0}%)", ctx.margin_pct)
        } else if ctx.margin_score >= 40.0 {
            format!("Fair margin ({:.0}%)", ctx.margin_pct)
        } else if ctx.margin_pct > 0.0 {
            format!("Thin margin ({:.0}%)", ctx.margin_pct)
        } else {
            format!("Negative margin ({:.0}%)", ctx.margin_pct)
        };

        let market = if ctx.liquidity_score >= 60.0 {
            format!("active market ({} listings)", ctx.listing_count)
        } else if ctx.liquidity_score >= 30.0 {
            format!("average liquidity ({} listings)", ctx.listing_count)
        } else {
            format!("few listings ({})", ctx.listing_count)
        };

        let verdict = match ctx.action {
            Recommendation::Buy => "Worth buying.",
            Recommendation::Watch => "Watch for a better entry.",
            Recommendation::Ignore => "Pass.",
        };

        let mut out = format!("{margin}, {market}. {verdict}");
        if let Some(first) = ctx.risks.first() {
            out.push_str(&format!(" Watch out: {first}."));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ScoringEngine
// ---------------------------------------------------------------------------

/// Pure scoring: the same input always yields the same score.
pub struct ScoringEngine {
    explainer: Arc<dyn Explainer>,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self { explainer: Arc::new(RuleExplainer) }
    }
}

impl ScoringEngine {
    pub fn new(explainer: Arc<dyn Explainer>) -> Self {
        Self { explainer }
    }

    pub fn score(&self, input: &ScoringInput<'_>) -> Score {
        let item = input.item;
        let comps = input.comparables;

        let (margin_abs, margin_pct) = compute_margin(item.price, comps);
        let margin_score = margin_subscore(margin_abs, margin_pct);
        let liquidity_score = liquidity_subscore(comps);
        let popularity_score = popularity_subscore(item.brand.as_deref());
        let (risk_score, risks) = assess_risk(input, margin_abs, margin_pct);

        let overall = round_to(
            (margin_score * weights::MARGIN
                + liquidity_score * weights::LIQUIDITY
                + popularity_score * weights::POPULARITY
                + risk_score * weights::RISK)
                .clamp(0.0, 100.0),
            1,
        );

        let action = recommend(overall, margin_abs, margin_pct, risk_score);
        let explanation = self.explainer.explain(&ExplanationContext {
            overall,
            margin_score,
            liquidity_score,
            margin_pct,
            listing_count: comps.listing_count,
            action,
            risks: &risks,
        });

        Score {
            overall,
            margin_score,
            liquidity_score,
            popularity_score,
            risk_score,
            margin_abs,
            margin_pct,
            action,
            confidence: confidence(overall),
            price_band: price_band(comps),
            estimated_days_to_sell: days_to_sell(item.category.as_deref(), overall, comps.liquidity_score),
            explanation,
            risks,
            model_version: MODEL_VERSION.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Net margin when reselling at the conservative (P25) price.
/// Returns `(absolute, percent of buy price)`.
pub fn compute_margin(buy_price: f64, comps: &Comparables) -> (f64, f64) {
    if comps.listing_count == 0 || comps.p25 <= 0.0 || buy_price <= 0.0 {
        return (0.0, 0.0);
    }
    let sell = comps.p25;
    let net = sell - sell * costs::FEE_RATE - costs::SHIPPING;
    let margin = net - buy_price;
    (round_to(margin, 2), round_to(margin / buy_price * 100.0, 1))
}

pub fn margin_subscore(margin_abs: f64, margin_pct: f64) -> f64 {
    if margin_pct <= 0.0 {
        return 0.0;
    }
    let mut s = (margin_pct / 50.0).min(1.0) * 100.0;
    if margin_abs >= 40.0 {
        s += 10.0;
    } else if margin_abs >= 25.0 {
        s += 5.0;
    }
    round_to(s.min(100.0), 1)
}

pub fn liquidity_subscore(comps: &Comparables) -> f64 {
    let listings = (comps.listing_count as f64 / 50.0).min(1.0) * 100.0;
    let market = comps.liquidity_score.clamp(0.0, 100.0);
    round_to((listings * 0.5 + market * 0.5).clamp(0.0, 100.0), 1)
}

pub fn popularity_subscore(brand: Option<&str>) -> f64 {
    match brand.and_then(brand_tier) {
        Some((tier, bonus)) => round_to((tier.base_popularity() * bonus).min(100.0), 1),
        None => UNKNOWN_BRAND_POPULARITY,
    }
}

/// Comparable price dispersion in percent: reported CV, else IQR over median.
pub fn comparable_dispersion(comps: &Comparables) -> Option<f64> {
    comps.cv.or_else(|| {
        (comps.median > 0.0 && comps.p75 >= comps.p25)
            .then(|| (comps.p75 - comps.p25) / comps.median * 100.0)
    })
}

/// Starts at 100 and subtracts a penalty per risk factor, floored at 0.
pub fn assess_risk(input: &ScoringInput<'_>, margin_abs: f64, margin_pct: f64) -> (f64, Vec<String>) {
    let item = input.item;
    let comps = input.comparables;
    let mut score: f64 = 100.0;
    let mut risks = Vec::new();

    if !item.sizes.is_empty() {
        let classes: Vec<SizeClass> = item.sizes.iter().map(|s| classify_size(s)).collect();
        if classes.iter().all(|c| *c == SizeClass::Atypical) {
            score -= 15.0;
            risks.push("only atypical sizes left".to_string());
        } else if !classes.contains(&SizeClass::Liquid) {
            score -= 8.0;
            risks.push("no liquid size available".to_string());
        }
    }

    if let Some(color) = item.color.as_deref() {
        match classify_color(color) {
            ColorClass::Risky => {
                score -= 20.0;
                risks.push(format!("hard-to-sell colour ({color})"));
            }
            ColorClass::Other => {
                score -= 5.0;
                risks.push(format!("non-standard colour ({color})"));
            }
            ColorClass::Safe => {}
        }
    }

    if is_off_season(&item.title, input.month) {
        score -= 25.0;
        risks.push("out of season".to_string());
    }

    match item.brand.as_deref().and_then(brand_tier) {
        Some((BrandTier::C, _)) => {
            score -= 15.0;
            risks.push("low-demand brand".to_string());
        }
        Some((BrandTier::B, _)) => {
            score -= 5.0;
            risks.push("mid-demand brand".to_string());
        }
        Some(_) => {}
        None => {
            score -= 10.0;
            risks.push("unknown brand".to_string());
        }
    }

    if comps.listing_count == 0 {
        score -= 20.0;
        risks.push("no market data".to_string());
    } else {
        if comps.listing_count < 5 {
            score -= 20.0;
            risks.push(format!("very few comparables ({})", comps.listing_count));
        } else if comps.listing_count < 15 {
            score -= 10.0;
            risks.push(format!("few comparables ({})", comps.listing_count));
        }

        match comparable_dispersion(comps) {
            Some(cv) if cv > 40.0 => {
                score -= 10.0;
                risks.push("highly dispersed resale prices".to_string());
            }
            Some(cv) if cv > 25.0 => {
                score -= 5.0;
                risks.push("dispersed resale prices".to_string());
            }
            _ => {}
        }

        if margin_abs < 0.0 {
            score -= 15.0;
            risks.push(format!("negative margin ({margin_pct:.0}%)"));
        } else if margin_abs < 10.0 {
            score -= 10.0;
            risks.push("margin under 10".to_string());
        } else if margin_abs < 20.0 {
            score -= 5.0;
        }
    }

    (score.max(0.0), risks)
}

pub fn recommend(overall: f64, margin_abs: f64, margin_pct: f64, risk: f64) -> Recommendation {
    if overall >= 75.0 && margin_pct >= 25.0 && margin_abs >= 15.0 && risk >= 50.0 {
        Recommendation::Buy
    } else if overall >= 65.0 && margin_pct >= 20.0 && margin_abs >= 10.0 {
        Recommendation::Buy
    } else if (overall >= 50.0 && margin_pct >= 15.0) || (overall >= 40.0 && margin_pct > 0.0) {
        Recommendation::Watch
    } else {
        Recommendation::Ignore
    }
}

/// Non-decreasing in score and independent of the chosen action.
pub fn confidence(overall: f64) -> f64 {
    let s = overall.clamp(0.0, 100.0);
    let c = if s >= 65.0 {
        (s / 100.0).min(0.95)
    } else if s >= 40.0 {
        0.45 + (s - 40.0) * 0.008
    } else {
        0.25 + s / 200.0
    };
    round_to(c, 3)
}

pub fn price_band(comps: &Comparables) -> Option<PriceBand> {
    if comps.median <= 0.0 {
        return None;
    }
    Some(PriceBand {
        aggressive: round_to(comps.p25 * 0.95, 2),
        optimal: round_to(comps.median * 0.95, 2),
        patient: round_to(comps.p75 * 0.95, 2),
    })
}

pub fn days_to_sell(category: Option<&str>, overall: f64, market_liquidity: f64) -> u32 {
    let base = baseline_sell_days(category);
    if overall >= 80.0 && market_liquidity >= 70.0 {
        base.saturating_sub(5).max(2)
    } else if overall >= 70.0 && market_liquidity >= 50.0 {
        base.saturating_sub(3).max(3)
    } else if overall >= 60.0 {
        base
    } else if overall >= 40.0 {
        base + 5
    } else {
        base + 10
    }
}
