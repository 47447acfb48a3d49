//! Static HTML report built from the merged product set.
//!
//! Rendering is a pure function of the [`ReportContext`] and the products, so
//! the same report can be rebuilt later from the persisted artifacts (see
//! [`regenerate`]).

mod regenerate;
mod template;

pub use regenerate::{latest_run, regenerate};

use crate::config::RunConfig;
use crate::models::EnrichedProduct;
use crate::providers::product_url;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use template::Card;
use thiserror::Error;

const PRIME_DOMESTIC: &str = "6845356051";
const PRIME_INTERNATIONAL: &str = "6845357051";
const ANY: &str = "Any";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("product {asin} has rank {found}, expected {expected}")]
    RankOrder {
        asin: String,
        expected: u32,
        found: u32,
    },
    #[error("no run directories found under {0}")]
    NoRuns(PathBuf),
}

const FALLBACK_HOST: &str = "amazon.com";

/// Header values, escaped once at construction. `link_host` stays raw; links
/// built from it are escaped with the rest of the card.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub query: String,
    pub amazon_domain: String,
    pub link_host: String,
    pub shipping_type: String,
    pub price_range: String,
    pub min_rating: String,
    pub min_reviews: String,
    pub generated_at: DateTime<Utc>,
}

impl ReportContext {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            query: html_escape(config.query.trim()),
            amazon_domain: html_escape(config.amazon_domain.trim()),
            link_host: config.amazon_domain.trim().to_string(),
            shipping_type: html_escape(&shipping_type(&config.refinements)),
            price_range: html_escape(&price_range(&config.refinements)),
            min_rating: config
                .client_filters
                .min_rating
                .map(|rating| rating.to_string())
                .unwrap_or_else(|| ANY.to_string()),
            min_reviews: config
                .client_filters
                .min_reviews
                .map(thousands)
                .unwrap_or_else(|| ANY.to_string()),
            generated_at: Utc::now(),
        }
    }

    /// Used when a run directory carries no config snapshot.
    pub fn unknown() -> Self {
        Self {
            query: "N/A".to_string(),
            amazon_domain: "N/A".to_string(),
            link_host: FALLBACK_HOST.to_string(),
            shipping_type: ANY.to_string(),
            price_range: ANY.to_string(),
            min_rating: ANY.to_string(),
            min_reviews: ANY.to_string(),
            generated_at: Utc::now(),
        }
    }
}

/// Renders one self-contained document with a card per product, in rank
/// order. Ranks must run 1..=N in slice order.
pub fn render(context: &ReportContext, products: &[EnrichedProduct]) -> Result<String, ReportError> {
    let mut cards = String::new();
    for (product, expected) in products.iter().zip(1u32..) {
        if product.rank() != expected {
            return Err(ReportError::RankOrder {
                asin: product.asin().to_string(),
                expected,
                found: product.rank(),
            });
        }
        cards.push_str(&template::card(&card(context, product)));
    }
    Ok(template::page(context, &cards))
}

fn card(context: &ReportContext, product: &EnrichedProduct) -> Card {
    let listing = &product.product.result;
    let image = product
        .detail
        .as_ref()
        .and_then(|detail| detail.image.as_deref())
        .or(listing.thumbnail.as_deref())
        .filter(|src| !src.trim().is_empty())
        .map(html_escape);
    let link = listing
        .link
        .clone()
        .filter(|link| !link.trim().is_empty())
        .unwrap_or_else(|| product_url(&context.link_host, product.asin()));
    let price = match (&listing.price_text, listing.price) {
        (Some(text), _) if !text.trim().is_empty() => html_escape(text.trim()),
        (_, Some(value)) => format!("${value:.2}"),
        _ => "N/A".to_string(),
    };
    let (strengths, concerns) = match &product.analysis {
        Some(analysis) => (findings(&analysis.strengths), findings(&analysis.concerns)),
        None => (Vec::new(), Vec::new()),
    };

    Card {
        rank: product.rank(),
        title: html_escape(product.display_title()),
        link: html_escape(&link),
        image,
        asin: html_escape(product.asin()),
        rating: listing
            .rating
            .map(|rating| format!("{rating}/5"))
            .unwrap_or_else(|| "N/A".to_string()),
        review_count: listing
            .review_count
            .map(thousands)
            .unwrap_or_else(|| "N/A".to_string()),
        price,
        collected: product.reviews().len(),
        strengths: template::finding_list(&strengths, "No strengths identified"),
        concerns: template::finding_list(&concerns, "No concerns identified"),
    }
}

fn findings(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| strong_markup(&html_escape(item)))
        .collect()
}

fn shipping_type(refinements: &BTreeMap<String, String>) -> String {
    match refinements.get("p_n_prime_domestic").map(|v| v.trim()) {
        Some(PRIME_DOMESTIC) => "Prime Domestic".to_string(),
        Some(PRIME_INTERNATIONAL) => "Prime International".to_string(),
        Some(other) if !other.is_empty() => format!("Prime ({other})"),
        _ => ANY.to_string(),
    }
}

/// `p_36` carries a `min-max` range in cents.
fn price_range(refinements: &BTreeMap<String, String>) -> String {
    let Some(raw) = refinements.get("p_36").map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return ANY.to_string();
    };
    let parsed = raw.split_once('-').and_then(|(min, max)| {
        Some((min.trim().parse::<u64>().ok()?, max.trim().parse::<u64>().ok()?))
    });
    match parsed {
        Some((min, max)) => format!("{} - {}", dollars(min), dollars(max)),
        None => raw.to_string(),
    }
}

fn dollars(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

pub(crate) fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `**text**` to `<strong>text</strong>`; an unmatched `**` is left alone.
fn strong_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("**") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("**") else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str("<strong>");
        out.push_str(&after[..end]);
        out.push_str("</strong>");
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisResult, ProductDetail, Review, SearchResult, SelectedProduct};
    use serde_json::Value;

    fn product(rank: u32, asin: &str, title: &str) -> EnrichedProduct {
        EnrichedProduct::new(SelectedProduct {
            rank,
            result: SearchResult {
                asin: asin.to_string(),
                title: title.to_string(),
                rating: Some(4.6),
                review_count: Some(12873),
                price: Some(24.5),
                price_text: None,
                link: Some(format!("https://www.amazon.com/dp/{asin}?ref=x&th=1")),
                thumbnail: Some("https://img.example/thumb.jpg".to_string()),
                raw: Value::Null,
            },
        })
    }

    fn context() -> ReportContext {
        let config = RunConfig::from_yaml(
            "query: \"mugs <large>\"\namazon_domain: amazon.com\nrefinements:\n  p_n_prime_domestic: 6845356051\n  p_36: \"2500-7999\"\nclient_filters:\n  min_rating: 4.0\n",
        )
        .unwrap();
        ReportContext::from_config(&config)
    }

    #[test]
    fn header_values() {
        let ctx = context();
        assert_eq!(ctx.query, "mugs &lt;large&gt;");
        assert_eq!(ctx.shipping_type, "Prime Domestic");
        assert_eq!(ctx.price_range, "$25.00 - $79.99");
        assert_eq!(ctx.min_rating, "4");
        assert_eq!(ctx.min_reviews, "Any");
    }

    #[test]
    fn refinement_fallbacks() {
        let mut refinements = BTreeMap::new();
        assert_eq!(shipping_type(&refinements), "Any");
        assert_eq!(price_range(&refinements), "Any");
        refinements.insert("p_n_prime_domestic".to_string(), "6845357051".to_string());
        refinements.insert("p_36".to_string(), "cheap".to_string());
        assert_eq!(shipping_type(&refinements), "Prime International");
        assert_eq!(price_range(&refinements), "cheap");
        refinements.insert("p_n_prime_domestic".to_string(), "123".to_string());
        assert_eq!(shipping_type(&refinements), "Prime (123)");
    }

    #[test]
    fn cards_follow_rank_order_and_escape_text() {
        let mut first = product(1, "B0B", "Mug <b>B</b>");
        first.attach_detail(ProductDetail {
            image: Some("https://img.example/b.jpg".to_string()),
            ..ProductDetail::default()
        });
        first.attach_analysis(AnalysisResult {
            strengths: vec!["**Keeps heat**: for hours".to_string()],
            concerns: vec![],
        });
        first.attach_reviews(vec![Review {
            asin: "B0B".into(),
            product_title: None,
            title: None,
            text: "good".into(),
            rating: Some(5.0),
            verified: true,
            posted_at: None,
        }]);
        let second = product(2, "B0A", "Mug A");

        let html = render(&context(), &[first, second]).expect("render");
        let b = html.find("B0B").unwrap();
        let a = html.find("B0A").unwrap();
        assert!(b < a);
        assert!(html.contains("Mug &lt;b&gt;B&lt;/b&gt;"));
        assert!(!html.contains("<b>B</b>"));
        assert!(html.contains("<li><strong>Keeps heat</strong>: for hours</li>"));
        assert!(html.contains("No concerns identified"));
        assert!(html.contains("https://img.example/b.jpg"));
        assert!(html.contains("12,873"));
        assert!(html.contains("$24.50"));
        assert!(html.contains("?ref=x&amp;th=1"));
        assert!(html.contains("No strengths identified"));
    }

    #[test]
    fn fallback_link_is_escaped_once() {
        let config = RunConfig::from_yaml("query: mugs\namazon_domain: shop&co.example\n").unwrap();
        let ctx = ReportContext::from_config(&config);
        let mut listing = product(1, "B0A", "Mug A");
        listing.product.result.link = None;

        let html = render(&ctx, &[listing]).expect("render");
        assert!(html.contains("href=\"https://www.shop&amp;co.example/dp/B0A\""));
        assert!(!html.contains("&amp;amp;"));

        let mut listing = product(1, "B0C", "Mug C");
        listing.product.result.link = None;
        let html = render(&ReportContext::unknown(), &[listing]).unwrap();
        assert!(html.contains("href=\"https://www.amazon.com/dp/B0C\""));
    }

    #[test]
    fn rank_gap_is_a_render_error() {
        let err = render(&context(), &[product(2, "B0A", "Mug")]).expect_err("rank");
        assert!(matches!(err, ReportError::RankOrder { expected: 1, found: 2, .. }));
    }

    #[test]
    fn helpers() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(1234567), "1,234,567");
        assert_eq!(html_escape(r#"a & "b""#), "a &amp; &quot;b&quot;");
        assert_eq!(strong_markup("**a** and **b"), "<strong>a</strong> and **b");
        assert_eq!(dollars(5), "$0.05");
    }
}
