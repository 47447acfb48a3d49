//! Provider clients and the seams the pipeline talks to.
//!
//! Every client converts its provider's payload into the core entities in
//! [`crate::models`] before returning, so nothing downstream branches on a
//! provider-specific shape.

pub mod apify;
pub mod brightdata;
pub mod rainforest;
pub mod serp;
#[cfg(test)]
mod test_server;

use crate::config::{ReviewSource, RunConfig};
use crate::llm::GeminiClient;
use crate::models::{AnalysisResult, ProductDetail, Review, SearchResult};
use async_trait::async_trait;
use reqwest::Response;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing credential: set {0}")]
    MissingCredentials(&'static str),
    #[error("{provider} request failed: {message}")]
    Http {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned an invalid response: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} job {job} ended with status {status}")]
    JobFailed {
        provider: &'static str,
        job: String,
        status: String,
    },
    #[error("{provider} job {job} not ready after {waited_secs}s")]
    JobTimeout {
        provider: &'static str,
        job: String,
        waited_secs: u64,
    },
}

impl ProviderError {
    pub(crate) fn http(provider: &'static str, err: reqwest::Error) -> Self {
        Self::Http {
            provider,
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(provider: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider,
            message: message.into(),
        }
    }
}

/// Discovery parameters derived from the run configuration.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub amazon_domain: String,
    pub language: Option<String>,
    pub shipping_location: Option<String>,
    pub pages: u32,
    pub sort: Option<String>,
    pub refinements: BTreeMap<String, String>,
    pub delay: Duration,
}

impl SearchRequest {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            query: config.query.trim().to_string(),
            amazon_domain: config.amazon_domain.trim().to_string(),
            language: config.language.clone(),
            shipping_location: config.shipping_location.clone(),
            pages: config.pages,
            sort: config.sort.clone(),
            refinements: config.refinements.clone(),
            delay: config.page_delay(),
        }
    }
}

pub struct AnalysisRequest<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub reviews: &'a [Review],
}

#[derive(Debug, Clone)]
pub struct AnalysisReply {
    pub result: AnalysisResult,
    /// Model output before parsing, kept for the analysis artifact.
    pub text: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, ProviderError>;
}

#[async_trait]
pub trait DetailProvider: Send + Sync {
    async fn product_detail(
        &self,
        asin: &str,
        amazon_domain: &str,
    ) -> Result<ProductDetail, ProviderError>;
}

#[async_trait]
pub trait ReviewProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reviews(&self, asin: &str, amazon_domain: &str) -> Result<Vec<Review>, ProviderError>;
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<AnalysisReply, ProviderError>;
}

/// The four provider handles a run needs, constructed once and passed
/// explicitly into the pipeline.
#[derive(Clone)]
pub struct Providers {
    pub search: Arc<dyn SearchProvider>,
    pub detail: Arc<dyn DetailProvider>,
    pub reviews: Arc<dyn ReviewProvider>,
    pub analysis: Arc<dyn AnalysisProvider>,
}

impl Providers {
    /// Builds the live clients, failing fast when a credential is missing.
    pub fn from_env(config: &RunConfig) -> Result<Self, ProviderError> {
        let http = crate::http::build_client();
        let rainforest = Arc::new(rainforest::RainforestClient::from_env(
            http.clone(),
            config.reviews.max_pages,
        )?);
        let reviews: Arc<dyn ReviewProvider> = match config.review_source {
            ReviewSource::Apify => Arc::new(apify::ApifyClient::from_env(
                http.clone(),
                &config.reviews,
            )?),
            ReviewSource::Rainforest => rainforest.clone(),
            ReviewSource::BrightData => Arc::new(brightdata::BrightDataClient::from_env(
                http.clone(),
                &config.reviews,
            )?),
        };
        Ok(Self {
            search: Arc::new(serp::SerpClient::from_env(http.clone())?),
            detail: rainforest,
            reviews,
            analysis: Arc::new(GeminiClient::from_env(http)?),
        })
    }
}

pub(crate) fn require_env(name: &'static str) -> Result<String, ProviderError> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ProviderError::MissingCredentials(name))
}

/// Passes successful responses through and turns everything else into a
/// [`ProviderError::Status`] carrying a truncated body.
pub(crate) async fn ensure_success(
    provider: &'static str,
    response: Response,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        provider,
        status: status.as_u16(),
        body: truncate(&body, 300),
    })
}

pub(crate) fn product_url(amazon_domain: &str, asin: &str) -> String {
    let host = amazon_domain.trim_start_matches("www.");
    format!("https://www.{host}/dp/{}", urlencoding::encode(asin))
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Reads a rating that providers send either as a number or as text such as
/// `"4.5 out of 5 stars"`.
pub(crate) fn loose_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => leading_number(s),
        _ => None,
    }
}

pub(crate) fn loose_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn leading_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let number: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}
