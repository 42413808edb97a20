//! Chat completion against a hosted model.
//!
//! [`CompletionClient`] is the seam the pipeline depends on.  [`OpenAiChat`]
//! implements it for any OpenAI-compatible `chat/completions` endpoint.

use std::time::Duration;

use reqwest::Client as ReqwestClient;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RagConfig;
use crate::error::{Error, ProviderFailure, Result};
use crate::http::{self, Provider};
use crate::prompt::PromptPayload;
use crate::types::{CompletionResult, Message, Usage};

/// Generator of assistant replies.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Sends `prompt` to the model and returns its reply.
    async fn complete(&self, prompt: &PromptPayload) -> Result<CompletionResult>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiChat {
    api_key: String,
    client: ReqwestClient,
    base_url: Url,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("base_url", &self.base_url.as_str())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAiChat {
    /// Creates a client from the startup configuration.
    pub fn new(config: &RagConfig) -> Result<Self> {
        let api_key = config.openai_api_key.clone().ok_or_else(|| {
            Error::configuration(
                "OpenAI API key not provided and OPENAI_API_KEY not set",
                Some("openai_api_key".to_string()),
            )
        })?;
        HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            Error::configuration(
                "OpenAI API key contains characters not allowed in a header",
                Some("openai_api_key".to_string()),
            )
        })?;
        Ok(Self {
            api_key,
            client: http::build_client(config.request_timeout)?,
            base_url: http::base_url(&config.openai_base_url)?,
            model: config.chat_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.request_timeout,
        })
    }

    /// Returns the model replies are requested from.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Overrides the model after construction.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
                Error::configuration(
                    "OpenAI API key is not a valid header value",
                    Some("openai_api_key".to_string()),
                )
            })?,
        );
        Ok(headers)
    }

    fn endpoint(&self) -> Result<Url> {
        Ok(self.base_url.join("chat/completions")?)
    }

    fn request<'a>(&'a self, messages: &'a [Message]) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiChat {
    async fn complete(&self, prompt: &PromptPayload) -> Result<CompletionResult> {
        let url = self.endpoint()?;
        let messages = prompt.messages();
        let response = self
            .client
            .post(url)
            .headers(self.default_headers()?)
            .json(&self.request(&messages))
            .send()
            .await
            .map_err(|e| http::send_error(Provider::Completion, e, self.timeout))?;
        if !response.status().is_success() {
            return Err(http::error_response(Provider::Completion, response).await);
        }
        let body: ChatCompletionResponse = http::json_body(Provider::Completion, response).await?;
        body.into_result()
    }
}

////////////////////////////////////////////// Wire ////////////////////////////////////////////////

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl ChatCompletionResponse {
    fn into_result(self) -> Result<CompletionResult> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            Error::completion(
                ProviderFailure::MalformedResponse,
                "response contained no choices",
                None,
            )
        })?;
        if choice.finish_reason.as_deref() == Some("length") {
            tracing::warn!("completion was cut off by the token limit");
        }
        let content = match (choice.message.content, choice.message.refusal) {
            (Some(content), _) if !content.trim().is_empty() => content,
            (_, Some(refusal)) => refusal,
            _ => {
                return Err(Error::completion(
                    ProviderFailure::MalformedResponse,
                    "response contained no content",
                    None,
                ));
            }
        };
        let mut result = CompletionResult::new(content);
        result.model = self.model;
        result.usage = self
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
        Ok(result)
    }
}
