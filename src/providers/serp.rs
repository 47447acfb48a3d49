use super::{
    ProviderError, SearchProvider, SearchRequest, ensure_success, loose_f64, loose_u64,
    require_env,
};
use crate::models::SearchResult;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

const PROVIDER: &str = "serpapi";
const SEARCH_URL: &str = "https://serpapi.com/search";

pub struct SerpClient {
    http: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SerpPage {
    #[serde(default)]
    organic_results: Vec<Value>,
    #[serde(default)]
    products: Vec<Value>,
    #[serde(default)]
    serpapi_pagination: Option<SerpPagination>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpPagination {
    #[serde(default)]
    next: Option<String>,
}

impl SerpPage {
    fn into_items(self) -> (Vec<Value>, bool) {
        let has_next = self
            .serpapi_pagination
            .as_ref()
            .and_then(|p| p.next.as_ref())
            .is_some();
        let items = if self.organic_results.is_empty() {
            self.products
        } else {
            self.organic_results
        };
        (items, has_next)
    }
}

impl SerpClient {
    pub fn from_env(http: Client) -> Result<Self, ProviderError> {
        Ok(Self::new(http, require_env("SERP_API_KEY")?))
    }

    fn new(http: Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            base_url: SEARCH_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_page(&self, request: &SearchRequest, page: u32) -> Result<SerpPage, ProviderError> {
        let params = page_params(request, page);
        debug!(target = "insights.serp", page, query = %request.query, "fetching search page");
        let response = self
            .http
            .get(&self.base_url)
            .query(&params)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        let page: SerpPage = response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))?;
        if let Some(message) = page.error.as_ref()
            && page.organic_results.is_empty()
            && page.products.is_empty()
        {
            return Err(ProviderError::invalid(PROVIDER, message.clone()));
        }
        Ok(page)
    }
}

#[async_trait]
impl SearchProvider for SerpClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, ProviderError> {
        let mut collected = Vec::new();
        for page in 1..=request.pages {
            let fetched = match self.fetch_page(request, page).await {
                Ok(fetched) => fetched,
                Err(err) if page == 1 => return Err(err),
                Err(err) => {
                    warn!(target = "insights.serp", page, error = %err, "stopping pagination after page error");
                    break;
                }
            };
            let (items, has_next) = fetched.into_items();
            if items.is_empty() {
                info!(target = "insights.serp", page, "no products on page, stopping");
                break;
            }

            let before = collected.len();
            let count = items.len();
            collected.extend(items.into_iter().filter_map(search_result_from_value));
            let skipped = count - (collected.len() - before);
            if skipped > 0 {
                debug!(target = "insights.serp", page, skipped, "dropped entries without an asin");
            }
            info!(target = "insights.serp", page, found = count, total = collected.len(), "search page collected");

            if !has_next {
                info!(target = "insights.serp", page, "no further pages available");
                break;
            }
            if page < request.pages && !request.delay.is_zero() {
                tokio::time::sleep(request.delay).await;
            }
        }
        Ok(collected)
    }
}

fn page_params(request: &SearchRequest, page: u32) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("engine", "amazon".to_string()),
        ("k", request.query.clone()),
        ("amazon_domain", request.amazon_domain.clone()),
        ("page", page.to_string()),
    ];
    if let Some(language) = &request.language {
        params.push(("language", language.clone()));
    }
    if let Some(location) = &request.shipping_location {
        params.push(("shipping_location", location.clone()));
    }
    if let Some(sort) = &request.sort {
        params.push(("s", sort.clone()));
    }
    if let Some(rh) = refinement_param(request) {
        params.push(("rh", rh));
    }
    params
}

/// Joins refinements into SerpApi's `rh` syntax (`key:value,key:value`).
fn refinement_param(request: &SearchRequest) -> Option<String> {
    if request.refinements.is_empty() {
        return None;
    }
    Some(
        request
            .refinements
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

pub(crate) fn search_result_from_value(raw: Value) -> Option<SearchResult> {
    let asin = raw
        .get("asin")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|asin| !asin.is_empty())?
        .to_string();
    let text = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
    };
    let price_text = match raw.get("price") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let price = raw
        .get("extracted_price")
        .and_then(Value::as_f64)
        .or_else(|| price_text.as_deref().and_then(parse_price));

    Some(SearchResult {
        asin,
        title: text("title").unwrap_or_default(),
        rating: raw.get("rating").and_then(loose_f64),
        review_count: raw.get("reviews").and_then(loose_u64),
        price,
        price_text,
        link: text("link_clean").or_else(|| text("link")),
        thumbnail: text("thumbnail"),
        raw,
    })
}

/// Extracts the numeric part of a price label such as `"$1,299.00"`.
pub(crate) fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request() -> SearchRequest {
        SearchRequest {
            query: "desk lamp".into(),
            amazon_domain: "amazon.com.au".into(),
            language: None,
            shipping_location: Some("AU".into()),
            pages: 2,
            sort: Some("review-rank".into()),
            refinements: BTreeMap::from([
                ("p_36".to_string(), "3000-8000".to_string()),
                ("p_n_prime_domestic".to_string(), "6845356051".to_string()),
            ]),
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn refinements_become_rh() {
        let params = page_params(&request(), 2);
        let rh = params.iter().find(|(k, _)| *k == "rh").map(|(_, v)| v.as_str());
        assert_eq!(rh, Some("p_36:3000-8000,p_n_prime_domestic:6845356051"));
        assert!(params.contains(&("page", "2".to_string())));
        assert!(params.contains(&("s", "review-rank".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "language"));
    }

    #[test]
    fn converts_organic_result() {
        let raw = json!({
            "asin": "B0LAMP",
            "title": "Desk Lamp",
            "rating": 4.7,
            "reviews": 1532,
            "price": "$45.99",
            "link": "https://www.amazon.com.au/dp/B0LAMP?ref=x",
            "link_clean": "https://www.amazon.com.au/dp/B0LAMP",
            "thumbnail": "https://m.media-amazon.com/lamp.jpg"
        });
        let result = search_result_from_value(raw).expect("result");
        assert_eq!(result.asin, "B0LAMP");
        assert_eq!(result.price, Some(45.99));
        assert_eq!(result.review_count, Some(1532));
        assert_eq!(result.link.as_deref(), Some("https://www.amazon.com.au/dp/B0LAMP"));
        assert_eq!(result.raw["title"], "Desk Lamp");
    }

    #[test]
    fn skips_entries_without_asin() {
        assert!(search_result_from_value(json!({"title": "Sponsored"})).is_none());
    }

    #[test]
    fn prefers_extracted_price() {
        let raw = json!({"asin": "B1", "price": "From $10", "extracted_price": 12.5});
        assert_eq!(search_result_from_value(raw).unwrap().price, Some(12.5));
    }

    #[test]
    fn page_falls_back_to_products_key() {
        let page: SerpPage = serde_json::from_value(json!({
            "products": [{"asin": "B1"}],
            "serpapi_pagination": {"next": "https://serpapi.com/search?page=2"}
        }))
        .unwrap();
        let (items, has_next) = page.into_items();
        assert_eq!(items.len(), 1);
        assert!(has_next);
    }

    #[test]
    fn price_parsing() {
        assert_eq!(parse_price("$1,299.00"), Some(1299.0));
        assert_eq!(parse_price("N/A"), None);
    }

    mod served {
        use super::*;
        use crate::providers::test_server::{Seen, serve};
        use axum::extract::Query;
        use axum::http::StatusCode;
        use axum::response::{IntoResponse, Response};
        use axum::routing::get;
        use axum::{Json, Router};
        use std::collections::HashMap;

        type Params = HashMap<String, String>;

        fn listing(asin: &str) -> Value {
            json!({"asin": asin, "title": format!("Lamp {asin}"), "rating": 4.5, "reviews": 120})
        }

        /// Page `n` answers with `pages[n - 1]`; pages past the end are a 502.
        async fn client(pages: Vec<Option<Value>>, seen: Seen<Params>) -> SerpClient {
            let router = Router::new().route(
                "/search",
                get(move |Query(params): Query<Params>| {
                    let pages = pages.clone();
                    let seen = seen.clone();
                    async move {
                        let page: usize = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(0);
                        seen.push(params);
                        match pages.get(page.wrapping_sub(1)).cloned().flatten() {
                            Some(body) => Json(body).into_response(),
                            None => (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response(),
                        }
                    }
                }),
            );
            let base = serve(router).await;
            SerpClient::new(Client::new(), "test-key".into()).with_base_url(format!("{base}/search"))
        }

        fn with_next(items: Vec<Value>) -> Option<Value> {
            Some(json!({
                "organic_results": items,
                "serpapi_pagination": {"next": "https://serpapi.com/search?page=next"}
            }))
        }

        #[tokio::test]
        async fn first_page_failure_is_fatal() {
            let seen = Seen::default();
            let err = client(vec![None], seen.clone())
                .await
                .search(&request())
                .await
                .expect_err("page one failed");
            assert!(matches!(err, ProviderError::Status { status: 502, .. }));
            assert_eq!(seen.all().len(), 1);
        }

        #[tokio::test]
        async fn later_page_failure_keeps_collected_results() {
            let seen = Seen::default();
            let pages = vec![with_next(vec![listing("B1"), listing("B2")]), None];
            let results = client(pages, seen.clone())
                .await
                .search(&request())
                .await
                .expect("page one results survive");
            let asins: Vec<&str> = results.iter().map(|r| r.asin.as_str()).collect();
            assert_eq!(asins, vec!["B1", "B2"]);

            let seen = seen.all();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0]["api_key"], "test-key");
            assert_eq!(seen[0]["engine"], "amazon");
            assert_eq!(seen[0]["rh"], "p_36:3000-8000,p_n_prime_domestic:6845356051");
            assert_eq!(seen[1]["page"], "2");
        }

        #[tokio::test]
        async fn missing_next_link_stops_pagination() {
            let seen = Seen::default();
            let mut request = request();
            request.pages = 5;
            let pages = vec![
                Some(json!({"organic_results": [listing("B1")]})),
                with_next(vec![listing("B2")]),
            ];
            let results = client(pages, seen.clone()).await.search(&request).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(seen.all().len(), 1);
        }

        #[tokio::test]
        async fn empty_page_stops_pagination() {
            let seen = Seen::default();
            let mut request = request();
            request.pages = 5;
            let pages = vec![
                with_next(vec![listing("B1")]),
                with_next(vec![]),
                with_next(vec![listing("B3")]),
            ];
            let results = client(pages, seen.clone()).await.search(&request).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(seen.all().len(), 2);
        }
    }
}
