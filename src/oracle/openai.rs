//! OpenAI chat-completions client.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Completion, CompletionRequest, OracleError};
use crate::retry::{RetryPolicy, with_retry};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(500));

pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Http(e.to_string()))?;

        Ok(Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            retry: RETRY,
        })
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        let mut messages = Vec::with_capacity(2 + request.examples.len() * 2);
        messages.push(ApiMessage { role: "system", content: &request.instruction });
        for (question, answer) in &request.examples {
            messages.push(ApiMessage { role: "user", content: question });
            messages.push(ApiMessage { role: "assistant", content: answer });
        }
        messages.push(ApiMessage { role: "user", content: &request.user_text });

        let body = ApiRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout
                } else {
                    OracleError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Api { status: status.as_u16(), body: text });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        debug!("{:?} completion: {} chars", request.purpose, content.chars().count());

        if content.is_empty() {
            return Err(OracleError::Empty);
        }
        Ok(content)
    }
}

impl Completion for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        with_retry(self.retry, "OpenAI completion", || self.send_once(request)).await
    }
}
