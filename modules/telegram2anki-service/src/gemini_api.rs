use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SERVICE: &str = "gemini";

/// Retry configuration for transient errors
const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 2000;

/// Text-in/text-out language model
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, prompt: &str) -> Result<String, ApiError>;
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    auth_headers: header::HeaderMap,
    endpoint: String,
    model: String,
    base_delay: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, ApiError> {
        let mut auth_headers = header::HeaderMap::new();
        auth_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let key = header::HeaderValue::from_str(api_key)
            .map_err(|e| ApiError::new(SERVICE, format!("Invalid API key format: {}", e)))?;
        auth_headers.insert("x-goog-api-key", key);

        Ok(Self {
            client: crate::http::shared_client().clone(),
            auth_headers,
            endpoint: format!(
                "{}/v1beta/models/{}:generateContent",
                base_url.trim_end_matches('/'),
                model
            ),
            model: model.to_string(),
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        })
    }

    /// Overrides the first retry delay (doubles on each attempt)
    pub fn with_retry_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_once(&self, request: &GenerateContentRequest) -> Result<String, ApiError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.auth_headers.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::new(SERVICE, format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<GeminiErrorResponse>(&body) {
                Ok(err) => err.error.message,
                Err(_) => body,
            };
            return Err(ApiError::with_status(SERVICE, message, status.as_u16()));
        }

        let data: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ApiError::with_status(SERVICE, format!("Failed to parse response: {}", e), status.as_u16())
        })?;

        // A well-formed answer without usable text won't improve on retry
        extract_text(data).map_err(|e| ApiError {
            status_code: Some(status.as_u16()),
            ..e
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate_text(&self, prompt: &str) -> Result<String, ApiError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                temperature: 0.4,
            },
        };

        let mut attempt = 0;
        loop {
            match self.request_once(&request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = self.base_delay * (1 << (attempt - 1));
                    log::warn!(
                        "[GEMINI] {} (attempt {}/{}), retrying in {}ms",
                        e,
                        attempt,
                        MAX_RETRIES,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Concatenates the text parts of the first candidate.
fn extract_text(data: GenerateContentResponse) -> Result<String, ApiError> {
    if let Some(reason) = data.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ApiError::new(SERVICE, format!("Prompt blocked: {}", reason)));
    }

    let candidate = data
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::new(SERVICE, "Response contained no candidates"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ApiError::new(
            SERVICE,
            format!(
                "Empty answer (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        ));
    }

    Ok(text)
}
