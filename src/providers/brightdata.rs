use super::{
    ProviderError, ReviewProvider, ensure_success, loose_f64, product_url, require_env, truncate,
};
use crate::config::ReviewSettings;
use crate::models::Review;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

const PROVIDER: &str = "brightdata";
const API_ROOT: &str = "https://api.brightdata.com/datasets/v3";
const REVIEWS_DATASET: &str = "gd_le8e811kzy4ggddlq";
const LIMIT_PER_INPUT: u32 = 1000;

/// Reviews via a BrightData dataset collection: trigger a snapshot for the
/// product URL, then poll until the snapshot body (NDJSON) is ready.
pub struct BrightDataClient {
    http: Client,
    api_key: String,
    base_url: String,
    dataset_id: String,
    max_reviews: u32,
    poll_interval: Duration,
    max_wait: Duration,
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(default)]
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    #[serde(default, alias = "review_header")]
    title: Option<String>,
    #[serde(default, alias = "review_body")]
    review_text: Option<String>,
    #[serde(default)]
    rating: Value,
    #[serde(default, alias = "verified_purchase")]
    is_verified: bool,
    #[serde(default, alias = "date")]
    review_posted_date: Option<String>,
}

impl BrightDataClient {
    pub fn from_env(http: Client, settings: &ReviewSettings) -> Result<Self, ProviderError> {
        Ok(Self::new(http, require_env("BRIGHTDATA_API_KEY")?, settings))
    }

    fn new(http: Client, api_key: String, settings: &ReviewSettings) -> Self {
        Self {
            http,
            api_key,
            base_url: API_ROOT.to_string(),
            dataset_id: REVIEWS_DATASET.to_string(),
            max_reviews: settings.max_reviews,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_wait: Duration::from_secs(settings.max_wait_secs),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[cfg(test)]
    fn with_polling(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    async fn trigger(&self, url: &str) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(format!("{}/trigger", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[
                ("dataset_id", self.dataset_id.clone()),
                ("include_errors", "true".to_string()),
                ("limit_per_input", LIMIT_PER_INPUT.to_string()),
                ("limit_multiple_results", self.max_reviews.to_string()),
            ])
            .json(&[serde_json::json!({ "url": url })])
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        let trigger: TriggerResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))?;
        trigger
            .snapshot_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "trigger returned no snapshot_id"))
    }

    async fn wait_for_snapshot(&self, snapshot_id: &str) -> Result<String, ProviderError> {
        let url = format!("{}/snapshot/{}", self.base_url, urlencoding::encode(snapshot_id));
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.api_key)
                .query(&[("format", "ndjson")])
                .send()
                .await
                .map_err(|err| ProviderError::http(PROVIDER, err))?;
            if response.status() == StatusCode::ACCEPTED {
                debug!(target = "insights.brightdata", snapshot_id, elapsed_secs = started.elapsed().as_secs(), "snapshot not ready");
            } else {
                let response = ensure_success(PROVIDER, response).await?;
                let body = response
                    .text()
                    .await
                    .map_err(|err| ProviderError::http(PROVIDER, err))?;
                if !body.trim().is_empty() {
                    return Ok(body);
                }
            }
            if started.elapsed() + self.poll_interval > self.max_wait {
                return Err(ProviderError::JobTimeout {
                    provider: PROVIDER,
                    job: snapshot_id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ReviewProvider for BrightDataClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn reviews(&self, asin: &str, amazon_domain: &str) -> Result<Vec<Review>, ProviderError> {
        let snapshot_id = self.trigger(&product_url(amazon_domain, asin)).await?;
        debug!(target = "insights.brightdata", asin, snapshot_id = %snapshot_id, "collection triggered");
        let body = self.wait_for_snapshot(&snapshot_id).await?;
        let reviews = parse_snapshot(&body, asin)?;
        info!(target = "insights.brightdata", asin, reviews = reviews.len(), "reviews collected");
        Ok(reviews)
    }
}

/// Parses a newline-delimited JSON snapshot. Error records (which BrightData
/// includes when `include_errors` is set) carry no review text and are
/// skipped.
pub(crate) fn parse_snapshot(body: &str, asin: &str) -> Result<Vec<Review>, ProviderError> {
    let mut reviews = Vec::new();
    for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let record: SnapshotRecord = serde_json::from_str(line).map_err(|err| {
            ProviderError::invalid(PROVIDER, format!("{err}: {}", truncate(line, 120)))
        })?;
        let Some(text) = record
            .review_text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
        else {
            continue;
        };
        reviews.push(Review {
            asin: asin.to_string(),
            product_title: None,
            title: record.title,
            text,
            rating: loose_f64(&record.rating),
            verified: record.is_verified,
            posted_at: record.review_posted_date,
        });
    }
    Ok(reviews)
}
