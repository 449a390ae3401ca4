//! Black-box client for the external inference service.
//!
//! The service is an OpenAI-style chat-completions endpoint with a
//! prompt-in / structured-JSON-out contract and no latency or success
//! guarantee. Callers always race [`InferenceClient::infer_with_timeout`]
//! and validate the returned fields before trusting them; a completed
//! call that lost the race is discarded by the staleness rule, never
//! force-cancelled.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum InferenceError {
    /// No API key configured; every call fails immediately.
    #[error("inference is disabled (no API key configured)")]
    Disabled,
    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inference endpoint returned status {0}")]
    BadStatus(StatusCode),
    #[error("malformed inference response: {0}")]
    Malformed(String),
}

/// Outcome of one raced inference call. The always-present-fallback
/// contract lives in this type: callers match all three arms.
#[derive(Debug)]
pub enum InferenceOutcome {
    Success(Value),
    TimedOut,
    Failed(String),
}

pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl InferenceClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.inference_url.clone(),
            api_key: config.inference_api_key.clone(),
            model: config.inference_model.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// One chat-completions round trip. The model is instructed to answer
    /// with a single JSON object, which is parsed out of the first choice.
    pub async fn infer(&self, system: &str, user: &str) -> Result<Value, InferenceError> {
        let api_key = self.api_key.as_deref().ok_or(InferenceError::Disabled)?;

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
        });

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(InferenceError::BadStatus(resp.status()));
        }

        let envelope: Value = resp.json().await?;
        let content = envelope["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| InferenceError::Malformed("missing message content".to_string()))?;

        serde_json::from_str(content)
            .map_err(|e| InferenceError::Malformed(format!("content is not JSON: {e}")))
    }

    /// Race [`infer`](Self::infer) against `timeout`. Never errors — the
    /// loser of the race becomes `TimedOut`, any failure becomes `Failed`.
    pub async fn infer_with_timeout(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> InferenceOutcome {
        match tokio::time::timeout(timeout, self.infer(system, user)).await {
            Ok(Ok(value)) => InferenceOutcome::Success(value),
            Ok(Err(e)) => InferenceOutcome::Failed(e.to_string()),
            Err(_) => InferenceOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_client() -> InferenceClient {
        InferenceClient::from_config(&Config::default())
    }

    #[tokio::test]
    async fn disabled_client_fails_immediately() {
        let client = disabled_client();
        assert!(!client.enabled());
        match client
            .infer_with_timeout("sys", "user", Duration::from_secs(3))
            .await
        {
            InferenceOutcome::Failed(reason) => assert!(reason.contains("disabled")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_lose_the_race() {
        // A hung call is represented by a pending future; the timeout arm
        // must win without waiting for it.
        let hung = std::future::pending::<Result<Value, InferenceError>>();
        let raced = tokio::time::timeout(Duration::from_secs(3), hung);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(raced.await.is_err());
    }
}
