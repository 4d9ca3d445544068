//! OpenAI adapter (chat completions).
//!
//! Works against any OpenAI-compatible `POST {base_url}/chat/completions`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use teledigest_core::{
    config::LlmConfig,
    errors::Error,
    llm::{ChatRequest, ChatResponse, LlmClient, TokenUsage},
    Result,
};
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }

    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        Self::new(&cfg.api_key, &cfg.base_url, &cfg.model, cfg.timeout)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn describe(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = request_body(&req);
        debug!(
            "POST {} ({} messages, model {})",
            self.endpoint(),
            req.messages.len(),
            req.model
        );

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "openai chat completion failed: {status} {}",
                body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>()
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error: {e}")))?;
        parse_response(&v)
    }
}

fn request_body(req: &ChatRequest) -> Value {
    let mut body = json!({
        "model": req.model,
        "messages": req.messages,
        "temperature": req.temperature,
    });
    if let Some(max) = req.max_tokens {
        body["max_tokens"] = json!(max);
    }
    body
}

fn parse_response(v: &Value) -> Result<ChatResponse> {
    if let Some(msg) = v.pointer("/error/message").and_then(Value::as_str) {
        return Err(Error::External(format!("openai error: {msg}")));
    }

    let text = v
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::External("openai response has no choices".to_string()))?
        .to_string();
    if text.trim().is_empty() {
        return Err(Error::External("openai returned empty content".to_string()));
    }

    let usage = v.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    });

    Ok(ChatResponse { text, usage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use teledigest_core::llm::ChatMessage;

    fn req(max_tokens: Option<u32>) -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            temperature: 0.5,
            max_tokens,
        }
    }

    #[test]
    fn body_has_roles_and_optional_max_tokens() {
        let body = request_body(&req(None));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("max_tokens").is_none());

        let body = request_body(&req(Some(800)));
        assert_eq!(body["max_tokens"], 800);
    }

    #[test]
    fn parses_choice_and_usage() {
        let v = json!({
            "choices": [{"message": {"role": "assistant", "content": "## Digest"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        });
        let resp = parse_response(&v).unwrap();
        assert_eq!(resp.text, "## Digest");
        assert_eq!(
            resp.usage,
            Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 30
            })
        );
    }

    #[test]
    fn missing_choices_or_api_error_is_external() {
        assert!(matches!(
            parse_response(&json!({"choices": []})),
            Err(Error::External(_))
        ));
        assert!(matches!(
            parse_response(&json!({"choices": [{"message": {"content": " "}}]})),
            Err(Error::External(_))
        ));
        let err = parse_response(&json!({"error": {"message": "quota exceeded"}})).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn endpoint_and_description() {
        let c = OpenAiClient::new("k", "http://localhost:8080/v1/", "local", Duration::from_secs(5))
            .unwrap();
        assert_eq!(c.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(c.describe(), "openai:local");
    }
}
