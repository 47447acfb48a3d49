use super::{
    DetailProvider, ProviderError, ReviewProvider, ensure_success, loose_f64, loose_u64,
    require_env,
};
use crate::models::{ProductDetail, Review};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

const PROVIDER: &str = "rainforest";
const REQUEST_URL: &str = "https://api.rainforestapi.com/request";

/// Rainforest serves both product detail (enrichment) and, when selected as
/// the review source, paginated reviews.
pub struct RainforestClient {
    http: Client,
    api_key: String,
    base_url: String,
    max_review_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    #[serde(default)]
    product: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ReviewsEnvelope {
    #[serde(default)]
    reviews: Vec<RainforestReview>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    total_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RainforestReview {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    rating: Value,
    #[serde(default)]
    verified_purchase: bool,
    #[serde(default)]
    date: Option<ReviewDate>,
}

#[derive(Debug, Deserialize)]
struct ReviewDate {
    #[serde(default)]
    utc: Option<String>,
    #[serde(default)]
    raw: Option<String>,
}

impl RainforestClient {
    pub fn from_env(http: Client, max_review_pages: u32) -> Result<Self, ProviderError> {
        Ok(Self::new(http, require_env("RAINFOREST_API_KEY")?, max_review_pages))
    }

    fn new(http: Client, api_key: String, max_review_pages: u32) -> Self {
        Self {
            http,
            api_key,
            base_url: REQUEST_URL.to_string(),
            max_review_pages: max_review_pages.max(1),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(params)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))
    }
}

#[async_trait]
impl DetailProvider for RainforestClient {
    async fn product_detail(
        &self,
        asin: &str,
        amazon_domain: &str,
    ) -> Result<ProductDetail, ProviderError> {
        debug!(target = "insights.rainforest", asin, "fetching product detail");
        let envelope: ProductEnvelope = self
            .request(&[
                ("type", "product".to_string()),
                ("asin", asin.to_string()),
                ("amazon_domain", amazon_domain.to_string()),
            ])
            .await?;
        let product = envelope
            .product
            .filter(Value::is_object)
            .ok_or_else(|| ProviderError::invalid(PROVIDER, format!("no product for {asin}")))?;
        Ok(detail_from_value(product))
    }
}

#[async_trait]
impl ReviewProvider for RainforestClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn reviews(&self, asin: &str, amazon_domain: &str) -> Result<Vec<Review>, ProviderError> {
        let mut collected = Vec::new();
        let mut page = 1;
        loop {
            let envelope: ReviewsEnvelope = self
                .request(&[
                    ("type", "reviews".to_string()),
                    ("asin", asin.to_string()),
                    ("amazon_domain", amazon_domain.to_string()),
                    ("page", page.to_string()),
                ])
                .await?;
            if envelope.reviews.is_empty() {
                break;
            }
            collected.extend(
                envelope
                    .reviews
                    .into_iter()
                    .filter_map(|review| review.into_review(asin)),
            );
            let total_pages = envelope
                .pagination
                .and_then(|p| p.total_pages)
                .unwrap_or(1);
            debug!(target = "insights.rainforest", asin, page, total_pages, collected = collected.len(), "review page");
            if page >= total_pages || page >= self.max_review_pages {
                break;
            }
            page += 1;
        }
        info!(target = "insights.rainforest", asin, reviews = collected.len(), "reviews collected");
        Ok(collected)
    }
}

impl RainforestReview {
    fn into_review(self, asin: &str) -> Option<Review> {
        let text = self.body.map(|b| b.trim().to_string()).filter(|b| !b.is_empty())?;
        Some(Review {
            asin: asin.to_string(),
            product_title: None,
            title: self.title,
            text,
            rating: loose_f64(&self.rating),
            verified: self.verified_purchase,
            posted_at: self.date.and_then(|d| d.utc.or(d.raw)),
        })
    }
}

pub(crate) fn detail_from_value(product: Value) -> ProductDetail {
    let text = |key: &str| {
        product
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let feature_bullets = match product.get("feature_bullets") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(flat)) if !flat.trim().is_empty() => vec![flat.trim().to_string()],
        _ => Vec::new(),
    };
    let image = product
        .get("main_image")
        .and_then(|img| img.get("link"))
        .and_then(Value::as_str)
        .or_else(|| {
            product
                .get("images")
                .and_then(Value::as_array)
                .and_then(|imgs| imgs.first())
                .and_then(|img| img.get("link"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);
    let categories = product
        .get("categories")
        .and_then(Value::as_array)
        .map(|cats| {
            cats.iter()
                .filter_map(|c| c.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    ProductDetail {
        title: text("title"),
        brand: text("brand"),
        feature_bullets,
        image,
        categories,
        rating: product.get("rating").and_then(loose_f64),
        ratings_total: product.get("ratings_total").and_then(loose_u64),
        raw: product,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detail_conversion() {
        let detail = detail_from_value(json!({
            "title": "Ceramic Mug",
            "brand": "Potter",
            "feature_bullets": ["Dishwasher safe", "  ", "350ml"],
            "main_image": {"link": "https://img.example/mug.jpg"},
            "categories": [{"name": "Kitchen"}, {"name": "Mugs"}],
            "rating": 4.4,
            "ratings_total": 812
        }));
        assert_eq!(detail.title.as_deref(), Some("Ceramic Mug"));
        assert_eq!(detail.feature_bullets, vec!["Dishwasher safe", "350ml"]);
        assert_eq!(detail.image.as_deref(), Some("https://img.example/mug.jpg"));
        assert_eq!(detail.categories, vec!["Kitchen", "Mugs"]);
        assert_eq!(detail.ratings_total, Some(812));
    }

    #[test]
    fn detail_image_falls_back_to_gallery() {
        let detail = detail_from_value(json!({"images": [{"link": "https://img.example/1.jpg"}]}));
        assert_eq!(detail.image.as_deref(), Some("https://img.example/1.jpg"));
        assert!(detail.feature_bullets.is_empty());
    }

    #[test]
    fn review_conversion_skips_empty_body() {
        let envelope: ReviewsEnvelope = serde_json::from_value(json!({
            "reviews": [
                {"title": "Great", "body": "Holds heat well", "rating": 5, "verified_purchase": true,
                 "date": {"raw": "Reviewed on 2 May 2024", "utc": "2024-05-02T00:00:00.000Z"}},
                {"title": "Empty", "body": "", "rating": 1}
            ],
            "pagination": {"total_pages": 1}
        }))
        .unwrap();
        let reviews: Vec<Review> = envelope
            .reviews
            .into_iter()
            .filter_map(|r| r.into_review("B0MUG"))
            .collect();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].asin, "B0MUG");
        assert!(reviews[0].verified);
        assert_eq!(reviews[0].posted_at.as_deref(), Some("2024-05-02T00:00:00.000Z"));
    }

    mod served {
        use super::*;
        use crate::providers::test_server::{Seen, serve};
        use axum::extract::Query;
        use axum::routing::get;
        use axum::{Json, Router};
        use std::collections::HashMap;

        type Params = HashMap<String, String>;

        async fn client(total_pages: u32, max_pages: u32, seen: Seen<Params>) -> RainforestClient {
            let router = Router::new().route(
                "/request",
                get(move |Query(params): Query<Params>| {
                    let seen = seen.clone();
                    async move {
                        let kind = params.get("type").cloned().unwrap_or_default();
                        let page = params.get("page").cloned().unwrap_or_default();
                        seen.push(params);
                        Json(match kind.as_str() {
                            "reviews" => json!({
                                "reviews": [{"title": format!("Page {page}"), "body": format!("Review on page {page}"), "rating": 4}],
                                "pagination": {"total_pages": total_pages}
                            }),
                            _ => json!({"request_info": {"success": true}}),
                        })
                    }
                }),
            );
            let base = serve(router).await;
            RainforestClient::new(Client::new(), "test-key".into(), max_pages)
                .with_base_url(format!("{base}/request"))
        }

        #[tokio::test]
        async fn review_pages_stop_at_configured_cap() {
            let seen = Seen::default();
            let reviews = client(5, 2, seen.clone())
                .await
                .reviews("B0MUG", "amazon.com")
                .await
                .unwrap();
            let texts: Vec<&str> = reviews.iter().map(|r| r.text.as_str()).collect();
            assert_eq!(texts, vec!["Review on page 1", "Review on page 2"]);
            let seen = seen.all();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0]["asin"], "B0MUG");
            assert_eq!(seen[0]["api_key"], "test-key");
        }

        #[tokio::test]
        async fn review_pages_stop_at_total_pages() {
            let seen = Seen::default();
            let reviews = client(1, 3, seen.clone())
                .await
                .reviews("B0MUG", "amazon.com")
                .await
                .unwrap();
            assert_eq!(reviews.len(), 1);
            assert_eq!(seen.all().len(), 1);
        }

        #[tokio::test]
        async fn missing_product_object_is_invalid() {
            let err = client(1, 1, Seen::default())
                .await
                .product_detail("B0MUG", "amazon.com")
                .await
                .expect_err("no product");
            assert!(matches!(err, ProviderError::InvalidResponse { .. }));
        }
    }
}
