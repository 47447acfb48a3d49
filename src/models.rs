use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Enrichment,
    Collection,
    Analysis,
    Rendering,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Enrichment => "enrichment",
            Stage::Collection => "collection",
            Stage::Analysis => "analysis",
            Stage::Rendering => "rendering",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw candidate from discovery, already normalized from the search
/// provider's payload. `raw` keeps the untouched provider object.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub asin: String,
    pub title: String,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
    pub price: Option<f64>,
    pub price_text: Option<String>,
    pub link: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedProduct {
    pub rank: u32,
    #[serde(flatten)]
    pub result: SearchResult,
}

impl SelectedProduct {
    pub fn asin(&self) -> &str {
        &self.result.asin
    }

    pub fn title(&self) -> &str {
        &self.result.title
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductDetail {
    pub title: Option<String>,
    pub brand: Option<String>,
    #[serde(default)]
    pub feature_bullets: Vec<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub rating: Option<f64>,
    pub ratings_total: Option<u64>,
    #[serde(default)]
    pub raw: Value,
}

impl ProductDetail {
    /// Feature bullets flattened into the description the analysis prompt uses.
    pub fn description(&self) -> String {
        if self.feature_bullets.is_empty() {
            return "No description available".to_string();
        }
        self.feature_bullets
            .iter()
            .map(|bullet| format!("- {bullet}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub asin: String,
    pub product_title: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub rating: Option<f64>,
    #[serde(default)]
    pub verified: bool,
    pub posted_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub strengths: Vec<String>,
    pub concerns: Vec<String>,
}

/// A selected product plus whatever later stages managed to attach.
///
/// Attachments are append-only: once a field is set, later attach calls for
/// that field are ignored, so a partially failed run still leaves a valid
/// record behind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedProduct {
    pub product: SelectedProduct,
    pub detail: Option<ProductDetail>,
    pub reviews: Option<Vec<Review>>,
    pub analysis: Option<AnalysisResult>,
}

impl EnrichedProduct {
    pub fn new(product: SelectedProduct) -> Self {
        Self {
            product,
            detail: None,
            reviews: None,
            analysis: None,
        }
    }

    pub fn asin(&self) -> &str {
        self.product.asin()
    }

    pub fn rank(&self) -> u32 {
        self.product.rank
    }

    /// Prefers the provider's product title over the search listing title.
    pub fn display_title(&self) -> &str {
        self.detail
            .as_ref()
            .and_then(|detail| detail.title.as_deref())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| self.product.title())
    }

    pub fn reviews(&self) -> &[Review] {
        self.reviews.as_deref().unwrap_or(&[])
    }

    pub fn attach_detail(&mut self, detail: ProductDetail) -> bool {
        attach_once(&mut self.detail, detail)
    }

    pub fn attach_reviews(&mut self, reviews: Vec<Review>) -> bool {
        attach_once(&mut self.reviews, reviews)
    }

    pub fn attach_analysis(&mut self, analysis: AnalysisResult) -> bool {
        attach_once(&mut self.analysis, analysis)
    }
}

fn attach_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Per-product line of `enrichment-output.json`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailRecord {
    pub rank: u32,
    pub title: String,
    pub detail: Option<ProductDetail>,
    pub error: Option<String>,
}

/// Per-product line of `analysis-output.json`. `response` is the model text
/// the findings were parsed from.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    pub asin: String,
    pub product_title: String,
    pub review_count: usize,
    pub analysis: Option<AnalysisResult>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub artifacts: Vec<String>,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    /// False when at least one artifact of the stage could not be written.
    pub saved: bool,
    pub summary: Value,
}

impl StageReport {
    pub fn new(
        stage: Stage,
        artifacts: Vec<String>,
        elapsed_ms: u128,
        saved: bool,
        summary: Value,
    ) -> Self {
        Self {
            stage,
            artifacts,
            elapsed_ms,
            timestamp: Utc::now(),
            saved,
            summary,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersistenceFault {
    pub stage: Stage,
    pub artifact: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunFailure {
    pub stage: Stage,
    pub kind: String,
    pub detail: String,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub run_directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Stages whose artifacts all reached disk, in execution order.
    pub completed: Vec<Stage>,
    pub stages: Vec<StageReport>,
    #[serde(default)]
    pub faults: Vec<PersistenceFault>,
    pub failure: Option<RunFailure>,
    pub report: Option<PathBuf>,
}

impl RunResult {
    /// True when some stage output only exists in memory.
    pub fn partially_saved(&self) -> bool {
        !self.faults.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(asin: &str) -> SelectedProduct {
        SelectedProduct {
            rank: 1,
            result: SearchResult {
                asin: asin.to_string(),
                title: "Listing title".to_string(),
                rating: Some(4.5),
                review_count: Some(10),
                price: Some(19.99),
                price_text: Some("$19.99".to_string()),
                link: None,
                thumbnail: None,
                raw: Value::Null,
            },
        }
    }

    #[test]
    fn attachments_never_overwrite() {
        let mut product = EnrichedProduct::new(selected("A1"));
        assert!(product.attach_reviews(vec![]));
        assert!(product.attach_analysis(AnalysisResult {
            strengths: vec!["sturdy".into()],
            concerns: vec![],
        }));

        // Re-running an earlier stage neither replaces nor clears later fields.
        assert!(product.attach_detail(ProductDetail::default()));
        assert!(!product.attach_detail(ProductDetail {
            title: Some("second".into()),
            ..ProductDetail::default()
        }));
        assert!(!product.attach_reviews(vec![]));
        assert_eq!(product.detail.as_ref().unwrap().title, None);
        assert_eq!(
            product.analysis.as_ref().unwrap().strengths,
            vec!["sturdy".to_string()]
        );
    }

    #[test]
    fn display_title_prefers_detail() {
        let mut product = EnrichedProduct::new(selected("A1"));
        assert_eq!(product.display_title(), "Listing title");
        product.attach_detail(ProductDetail {
            title: Some("Full product name".into()),
            ..ProductDetail::default()
        });
        assert_eq!(product.display_title(), "Full product name");
    }

    #[test]
    fn description_from_bullets() {
        let detail = ProductDetail {
            feature_bullets: vec!["Quiet".into(), "Compact".into()],
            ..ProductDetail::default()
        };
        assert_eq!(detail.description(), "- Quiet\n- Compact");
        assert_eq!(
            ProductDetail::default().description(),
            "No description available"
        );
    }
}
