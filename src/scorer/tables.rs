//! Static lookup tables for scoring: brand tiers, size liquidity, colour and
//! seasonality rules, category sell-time baselines.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrandTier {
    S,
    A,
    B,
    C,
}

impl BrandTier {
    pub fn base_popularity(&self) -> f64 {
        match self {
            BrandTier::S => 90.0,
            BrandTier::A => 75.0,
            BrandTier::B => 60.0,
            BrandTier::C => 40.0,
        }
    }
}

/// (brand, tier, resale bonus multiplier)
pub const BRAND_TIERS: &[(&str, BrandTier, f64)] = &[
    ("nike", BrandTier::S, 1.2),
    ("jordan", BrandTier::S, 1.25),
    ("adidas", BrandTier::S, 1.15),
    ("ralph lauren", BrandTier::A, 1.1),
    ("new balance", BrandTier::A, 1.1),
    ("asics", BrandTier::A, 1.05),
    ("lacoste", BrandTier::A, 1.05),
    ("puma", BrandTier::B, 1.0),
    ("reebok", BrandTier::B, 1.0),
    ("tommy hilfiger", BrandTier::B, 1.0),
    ("converse", BrandTier::B, 1.0),
    ("fila", BrandTier::C, 0.9),
    ("le coq sportif", BrandTier::C, 0.9),
];

pub const UNKNOWN_BRAND_POPULARITY: f64 = 50.0;

/// Matches on whole words, so "Nike Sportswear" and "Air Jordan" resolve to
/// their house brand.
pub fn brand_tier(brand: &str) -> Option<(BrandTier, f64)> {
    let haystack = words(brand);
    BRAND_TIERS
        .iter()
        .find(|(name, _, _)| contains_phrase(&haystack, name, |w, k| w == k))
        .map(|(_, tier, bonus)| (*tier, *bonus))
}

/// Lowercased alphanumeric runs.
fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when the words of `phrase` appear consecutively in `haystack`.
fn contains_phrase(haystack: &[String], phrase: &str, eq: impl Fn(&str, &str) -> bool) -> bool {
    let needle = words(phrase);
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|win| win.iter().zip(&needle).all(|(w, k)| eq(w, k)))
}

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

pub const LIQUID_CLOTHING_SIZES: &[&str] = &["S", "M", "L"];
pub const ATYPICAL_CLOTHING_SIZES: &[&str] = &["XXS", "XS", "XXL", "XXXL", "2XL", "3XL"];

/// EU shoe sizes that resell fastest.
pub const LIQUID_SHOE_RANGE: (f64, f64) = (41.0, 45.5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Liquid,
    Atypical,
    Neutral,
}

fn shoe_size(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok()
}

pub fn classify_size(raw: &str) -> SizeClass {
    let upper = raw.trim().to_uppercase();
    if LIQUID_CLOTHING_SIZES.contains(&upper.as_str()) {
        return SizeClass::Liquid;
    }
    if ATYPICAL_CLOTHING_SIZES.contains(&upper.as_str()) {
        return SizeClass::Atypical;
    }
    match shoe_size(&upper) {
        Some(s) if s >= LIQUID_SHOE_RANGE.0 && s <= LIQUID_SHOE_RANGE.1 => SizeClass::Liquid,
        Some(s) if s < 40.0 || s >= 46.0 => SizeClass::Atypical,
        _ => SizeClass::Neutral,
    }
}

// ---------------------------------------------------------------------------
// Colours and seasons
// ---------------------------------------------------------------------------

pub const RISKY_COLORS: &[&str] = &[
    "rose", "pink", "jaune", "yellow", "orange", "violet", "purple", "turquoise",
];

pub const SAFE_COLORS: &[&str] = &[
    "noir", "black", "blanc", "white", "gris", "grey", "gray", "navy", "beige",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorClass {
    Safe,
    Risky,
    Other,
}

pub fn classify_color(color: &str) -> ColorClass {
    let c = color.to_lowercase();
    if RISKY_COLORS.iter().any(|r| c.contains(r)) {
        ColorClass::Risky
    } else if SAFE_COLORS.iter().any(|s| c.contains(s)) {
        ColorClass::Safe
    } else {
        ColorClass::Other
    }
}

/// (title keywords, months in which they sell poorly)
pub const OFF_SEASON_RULES: &[(&[&str], &[u32])] = &[
    (&["sandale", "sandal", "tong", "flip-flop", "slide"], &[11, 12, 1, 2]),
    (&["boot", "botte", "doudoune", "puffer"], &[5, 6, 7, 8]),
];

/// Keywords match whole words, plural forms included.
pub fn is_off_season(title: &str, month: u32) -> bool {
    let t = words(title);
    OFF_SEASON_RULES.iter().any(|(keywords, months)| {
        months.contains(&month) && keywords.iter().any(|k| contains_phrase(&t, k, same_or_plural))
    })
}

fn same_or_plural(word: &str, keyword: &str) -> bool {
    match word.strip_prefix(keyword) {
        Some(rest) => matches!(rest, "" | "s" | "es"),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Sell-time baselines
// ---------------------------------------------------------------------------

pub const CATEGORY_SELL_DAYS: &[(&str, u32)] = &[
    ("sneakers_lifestyle", 7),
    ("sneakers_running", 14),
    ("textile_premium", 10),
    ("textile_streetwear", 7),
    ("accessories", 14),
];

pub const DEFAULT_SELL_DAYS: u32 = 7;

pub fn baseline_sell_days(category: Option<&str>) -> u32 {
    let Some(category) = category else {
        return DEFAULT_SELL_DAYS;
    };
    let c = category.trim().to_lowercase();
    CATEGORY_SELL_DAYS
        .iter()
        .find(|(name, _)| *name == c)
        .map(|(_, days)| *days)
        .unwrap_or(DEFAULT_SELL_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_lookup_is_case_insensitive() {
        assert_eq!(brand_tier("Nike"), Some((BrandTier::S, 1.2)));
        assert_eq!(brand_tier(" New Balance "), Some((BrandTier::A, 1.1)));
        assert_eq!(brand_tier("Unknown Co"), None);
    }

    #[test]
    fn brand_lookup_matches_sub_labels() {
        assert_eq!(brand_tier("Nike Sportswear"), Some((BrandTier::S, 1.2)));
        assert_eq!(brand_tier("Air Jordan"), Some((BrandTier::S, 1.25)));
        assert_eq!(brand_tier("adidas Originals"), Some((BrandTier::S, 1.15)));
        assert_eq!(brand_tier("Polo Ralph Lauren"), Some((BrandTier::A, 1.1)));
        assert_eq!(brand_tier("Nikes"), None);
        assert_eq!(brand_tier("Balance Studio"), None);
    }

    #[test]
    fn sizes_classify_for_shoes_and_clothing() {
        assert_eq!(classify_size("42"), SizeClass::Liquid);
        assert_eq!(classify_size("EU 44,5"), SizeClass::Liquid);
        assert_eq!(classify_size("38"), SizeClass::Atypical);
        assert_eq!(classify_size("47"), SizeClass::Atypical);
        assert_eq!(classify_size("40"), SizeClass::Neutral);
        assert_eq!(classify_size("m"), SizeClass::Liquid);
        assert_eq!(classify_size("XS"), SizeClass::Atypical);
        assert_eq!(classify_size("XL"), SizeClass::Neutral);
    }

    #[test]
    fn colours_and_seasons() {
        assert_eq!(classify_color("Pink Foam"), ColorClass::Risky);
        assert_eq!(classify_color("Triple Black"), ColorClass::Safe);
        assert_eq!(classify_color("Olive"), ColorClass::Other);
        assert!(is_off_season("Slide Sandal Summer", 12));
        assert!(!is_off_season("Slide Sandal Summer", 7));
        assert!(is_off_season("Winter Boot GTX", 6));
    }

    #[test]
    fn season_keywords_match_whole_words() {
        assert!(!is_off_season("Slider Runner", 12));
        assert!(is_off_season("Pool Slides", 12));
        assert!(is_off_season("Chelsea Boots", 6));
        assert!(is_off_season("Flip Flop Classic", 1));
        assert!(is_off_season("Tongs de plage", 1));
        assert!(!is_off_season("Bootcut Jeans", 6));
    }

    #[test]
    fn sell_day_baselines() {
        assert_eq!(baseline_sell_days(Some("sneakers_running")), 14);
        assert_eq!(baseline_sell_days(Some("unknown")), DEFAULT_SELL_DAYS);
        assert_eq!(baseline_sell_days(None), DEFAULT_SELL_DAYS);
    }
}
