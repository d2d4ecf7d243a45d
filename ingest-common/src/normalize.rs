use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Brands recognised in scraped titles when the scraper did not extract one.
const KNOWN_BRANDS: &[&str] = &[
    "Baker",
    "Thrasher",
    "Independent",
    "Spitfire",
    "Vans",
    "Nike SB",
    "Adidas",
    "Converse",
    "Emerica",
    "eS",
    "Etnies",
    "Fallen",
    "Lakai",
    "New Balance",
    "DC Shoes",
    "Supreme",
    "Palace",
    "FTC",
    "HUF",
    "Stüssy",
];

/// A price as scrapers emit it: either a JSON number or a display string like `"$1,299.99"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Amount(Decimal),
    Text(String),
}

impl From<Decimal> for RawPrice {
    fn from(amount: Decimal) -> Self {
        RawPrice::Amount(amount)
    }
}

/// Parse a scraped price, stripping currency symbols and thousands separators.
/// Returns None for blank or unparseable values.
pub fn parse_price(raw: &RawPrice) -> Option<Decimal> {
    match raw {
        RawPrice::Amount(amount) => Some(*amount),
        RawPrice::Text(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
    }
}

/// Percentage off the original price, rounded to two decimals.
/// None when there is no positive original price, or the result overflows.
pub fn discount_percentage(original: Option<Decimal>, sale: Decimal) -> Option<Decimal> {
    let original = original.filter(|o| *o > Decimal::ZERO)?;
    let pct = original
        .checked_sub(sale)?
        .checked_div(original)?
        .checked_mul(Decimal::ONE_HUNDRED)?;
    Some(pct.round_dp(2))
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// First known brand appearing as whole words in the title, case-insensitively.
pub fn extract_brand(title: &str) -> Option<&'static str> {
    let title_words = words(title);
    KNOWN_BRANDS.iter().copied().find(|brand| {
        let brand_words = words(brand);
        !brand_words.is_empty()
            && title_words
                .windows(brand_words.len())
                .any(|window| window == brand_words.as_slice())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Decks,
    Trucks,
    Wheels,
    Bearings,
    Hardware,
    Shoes,
    Apparel,
    Accessories,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ProductCategory {
    /// Maps free-form scraper labels ("Deck", "skate shoes", "WHEELS") onto the catalogue.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        let stem = label.rsplit(' ').next().unwrap_or_default();
        match stem.trim_end_matches('s') {
            "deck" => Self::Decks,
            "truck" => Self::Trucks,
            "wheel" => Self::Wheels,
            "bearing" => Self::Bearings,
            "hardware" | "bolt" => Self::Hardware,
            "shoe" | "sneaker" => Self::Shoes,
            "apparel" | "shirt" | "hoodie" | "pant" | "t-shirt" => Self::Apparel,
            "accessorie" | "accessory" => Self::Accessories,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decks => "decks",
            Self::Trucks => "trucks",
            Self::Wheels => "wheels",
            Self::Bearings => "bearings",
            Self::Hardware => "hardware",
            Self::Shoes => "shoes",
            Self::Apparel => "apparel",
            Self::Accessories => "accessories",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::*;

    #[test]
    fn parse_display_prices() {
        assert_eq!(
            parse_price(&RawPrice::Text("$1,299.99".to_string())),
            Decimal::from_str("1299.99").ok()
        );
        assert_eq!(
            parse_price(&RawPrice::Text(" 39.99 ".to_string())),
            Decimal::from_str("39.99").ok()
        );
        assert_eq!(parse_price(&RawPrice::Text("".to_string())), None);
        assert_eq!(parse_price(&RawPrice::Text("call us".to_string())), None);
        assert_eq!(
            parse_price(&RawPrice::Amount(Decimal::new(5500, 2))),
            Some(Decimal::new(5500, 2))
        );
    }

    #[test]
    fn raw_price_accepts_numbers_and_strings() {
        let number: RawPrice = serde_json::from_str("39.99").unwrap();
        assert_eq!(parse_price(&number), Decimal::from_str("39.99").ok());

        let text: RawPrice = serde_json::from_str("\"$39.99\"").unwrap();
        assert_eq!(text, RawPrice::Text("$39.99".to_string()));
    }

    #[test]
    fn discount_is_rounded() {
        let original = Decimal::from_str("59.99").ok();
        let sale = Decimal::from_str("39.99").unwrap();
        assert_eq!(
            discount_percentage(original, sale),
            Decimal::from_str("33.34").ok()
        );
        assert_eq!(discount_percentage(None, sale), None);
        assert_eq!(discount_percentage(Some(Decimal::ZERO), sale), None);
    }

    #[test]
    fn discount_overflow_is_dropped() {
        let tiny = parse_price(&RawPrice::Text("0.0000000000000000000000000001".to_string()));
        let sale = parse_price(&RawPrice::Text("1000000".to_string())).unwrap();
        assert_eq!(discount_percentage(tiny, sale), None);

        assert_eq!(discount_percentage(Some(Decimal::MAX), Decimal::MIN), None);
    }

    #[test]
    fn brand_matches_whole_words() {
        assert_eq!(extract_brand("Baker Brand Logo Deck 8.25"), Some("Baker"));
        assert_eq!(extract_brand("NIKE SB Dunk Low"), Some("Nike SB"));
        assert_eq!(extract_brand("eS Accel Slim"), Some("eS"));
        // "shoes" must not match the "eS" brand
        assert_eq!(extract_brand("Generic skate shoes"), None);
        assert_eq!(extract_brand("Stüssy Basic Tee"), Some("Stüssy"));
    }

    #[test]
    fn category_labels() {
        assert_eq!(ProductCategory::from_label("Deck"), ProductCategory::Decks);
        assert_eq!(
            ProductCategory::from_label("skate shoes"),
            ProductCategory::Shoes
        );
        assert_eq!(ProductCategory::from_label("WHEELS"), ProductCategory::Wheels);
        assert_eq!(
            ProductCategory::from_label("gift cards"),
            ProductCategory::Unknown
        );
    }
}
