use super::{
    ProviderError, ReviewProvider, ensure_success, loose_f64, product_url, require_env,
};
use crate::config::ReviewSettings;
use crate::models::Review;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const PROVIDER: &str = "apify";
const API_ROOT: &str = "https://api.apify.com/v2";
const REVIEWS_ACTOR: &str = "junglee~amazon-reviews-scraper";
const STATUS_LOG_EVERY: Duration = Duration::from_secs(30);

/// Reviews via the Apify Amazon reviews actor: start a run, poll it until it
/// settles, then read the run's default dataset.
pub struct ApifyClient {
    http: Client,
    token: String,
    base_url: String,
    actor_id: String,
    max_reviews: u32,
    poll_interval: Duration,
    max_wait: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActorInput {
    product_urls: Vec<ProductUrl>,
    max_reviews: u32,
    filter_by_ratings: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ProductUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorRun {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    default_dataset_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pending,
    Succeeded,
    Failed,
}

impl RunState {
    fn from_status(status: &str) -> Self {
        match status {
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" | "ABORTED" | "TIMED-OUT" | "TIMED_OUT" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReview {
    #[serde(default)]
    review_title: Option<String>,
    #[serde(default, alias = "text")]
    review_description: Option<String>,
    #[serde(default, alias = "rating")]
    rating_score: Value,
    #[serde(default, alias = "verified")]
    is_verified: bool,
    #[serde(default)]
    date: Option<String>,
}

impl ApifyClient {
    pub fn from_env(http: Client, settings: &ReviewSettings) -> Result<Self, ProviderError> {
        Ok(Self::new(http, require_env("APIFY_API_TOKEN")?, settings))
    }

    fn new(http: Client, token: String, settings: &ReviewSettings) -> Self {
        Self {
            http,
            token,
            base_url: API_ROOT.to_string(),
            actor_id: REVIEWS_ACTOR.to_string(),
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

    async fn start_run(&self, input: &ActorInput) -> Result<ActorRun, ProviderError> {
        let url = format!("{}/acts/{}/runs", self.base_url, self.actor_id);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        let envelope: Envelope<ActorRun> = response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))?;
        Ok(envelope.data)
    }

    async fn run_status(&self, run_id: &str) -> Result<ActorRun, ProviderError> {
        let url = format!("{}/actor-runs/{}", self.base_url, urlencoding::encode(run_id));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        let envelope: Envelope<ActorRun> = response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))?;
        Ok(envelope.data)
    }

    async fn wait_for_completion(&self, run_id: &str) -> Result<ActorRun, ProviderError> {
        let started = Instant::now();
        let mut last_log = started;
        loop {
            match self.run_status(run_id).await {
                Ok(run) => match RunState::from_status(&run.status) {
                    RunState::Succeeded => return Ok(run),
                    RunState::Failed => {
                        return Err(ProviderError::JobFailed {
                            provider: PROVIDER,
                            job: run_id.to_string(),
                            status: run.status,
                        });
                    }
                    RunState::Pending => {
                        if last_log.elapsed() >= STATUS_LOG_EVERY {
                            info!(target = "insights.apify", run_id, status = %run.status, elapsed_secs = started.elapsed().as_secs(), "actor run still in progress");
                            last_log = Instant::now();
                        }
                    }
                },
                // A failed status check is not fatal; the run may still finish.
                Err(err) => warn!(target = "insights.apify", run_id, error = %err, "could not read run status"),
            }
            if started.elapsed() + self.poll_interval > self.max_wait {
                return Err(ProviderError::JobTimeout {
                    provider: PROVIDER,
                    job: run_id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn dataset_items(&self, dataset_id: &str) -> Result<Vec<DatasetReview>, ProviderError> {
        let url = format!("{}/datasets/{}/items", self.base_url, urlencoding::encode(dataset_id));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))
    }
}

#[async_trait]
impl ReviewProvider for ApifyClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn reviews(&self, asin: &str, amazon_domain: &str) -> Result<Vec<Review>, ProviderError> {
        let input = ActorInput {
            product_urls: vec![ProductUrl {
                url: product_url(amazon_domain, asin),
            }],
            max_reviews: self.max_reviews,
            filter_by_ratings: vec!["allStars"],
        };
        let run = self.start_run(&input).await?;
        debug!(target = "insights.apify", asin, run_id = %run.id, "actor run started");

        let finished = self.wait_for_completion(&run.id).await?;
        let dataset_id = finished
            .default_dataset_id
            .or(run.default_dataset_id)
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "run has no default dataset"))?;
        let items = self.dataset_items(&dataset_id).await?;
        let reviews: Vec<Review> = items
            .into_iter()
            .filter_map(|item| item.into_review(asin))
            .collect();
        info!(target = "insights.apify", asin, reviews = reviews.len(), "reviews collected");
        Ok(reviews)
    }
}

impl DatasetReview {
    fn into_review(self, asin: &str) -> Option<Review> {
        let text = self
            .review_description
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())?;
        Some(Review {
            asin: asin.to_string(),
            product_title: None,
            title: self.review_title,
            text,
            rating: loose_f64(&self.rating_score),
            verified: self.is_verified,
            posted_at: self.date,
        })
    }
}
