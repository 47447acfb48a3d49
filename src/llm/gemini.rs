use super::analysis::{self, DefaultFindingFilter};
use crate::providers::{
    AnalysisProvider, AnalysisReply, AnalysisRequest, ProviderError, ensure_success, require_env,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const PROVIDER: &str = "gemini";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl GeminiConfig {
    pub fn from_env() -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: require_env("GEMINI_API_KEY")?,
            model: std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".into()),
        })
    }
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(http: Client, config: GeminiConfig) -> Self {
        Self { http, config }
    }

    pub fn from_env(http: Client) -> Result<Self, ProviderError> {
        Ok(Self::new(http, GeminiConfig::from_env()?))
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let base = self.config.base_url.trim_end_matches('/');
        let url = format!("{base}/models/{}:generateContent", self.config.model);
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::http(PROVIDER, err))?;
        let response = ensure_success(PROVIDER, response).await?;
        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::invalid(PROVIDER, err.to_string()))?;
        payload.into_text()
    }
}

#[async_trait]
impl AnalysisProvider for GeminiClient {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<AnalysisReply, ProviderError> {
        let prompt = analysis::build_prompt(request.title, request.description, request.reviews);
        debug!(target = "insights.gemini", reviews = request.reviews.len(), prompt_chars = prompt.len(), "requesting analysis");
        let text = self.generate(&prompt).await?;
        let result = analysis::parse_analysis(&text, &DefaultFindingFilter);
        info!(
            target = "insights.gemini",
            strengths = result.strengths.len(),
            concerns = result.concerns.len(),
            "analysis parsed"
        );
        Ok(AnalysisReply { result, text })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String, ProviderError> {
        let text = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "no candidates in response"))?
            .parts
            .into_iter()
            .map(|part| part.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ProviderError::invalid(PROVIDER, "no text generated"));
        }
        Ok(text)
    }
}
