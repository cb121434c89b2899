use crate::concurrency::{retry_with_backoff, WorkerPool};
use crate::config::Config;
use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Stable error taxonomy for the external model (§4.5).
#[derive(Debug, Clone)]
pub enum ModelErrorKind {
    RateLimited,
    ContextTooLong,
    InvalidCredentials,
    ServiceUnavailable,
    FormatError,
    Other,
}

#[derive(Debug, Clone)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ModelError {}

impl From<ModelError> for AppError {
    fn from(e: ModelError) -> Self {
        match e.kind {
            ModelErrorKind::RateLimited => AppError::RateLimited {
                retry_after_secs: 30,
                details: json!({"upstream": e.message}),
            },
            ModelErrorKind::ContextTooLong => AppError::ResourceExhausted(
                "context too long".to_string(),
                json!({"upstream": e.message}),
            ),
            ModelErrorKind::InvalidCredentials => AppError::Unauthorized,
            ModelErrorKind::ServiceUnavailable => AppError::Unavailable(e.message),
            ModelErrorKind::FormatError => {
                AppError::Internal(format!("model returned malformed output: {}", e.message))
            }
            ModelErrorKind::Other => AppError::Internal(e.message),
        }
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> ModelError {
    let message = body.to_string();
    let kind = match status.as_u16() {
        429 => ModelErrorKind::RateLimited,
        500 | 502 | 503 | 504 => ModelErrorKind::ServiceUnavailable,
        401 | 403 => ModelErrorKind::InvalidCredentials,
        400 if body.to_lowercase().contains("context") || body.to_lowercase().contains("too long") => {
            ModelErrorKind::ContextTooLong
        }
        _ => ModelErrorKind::Other,
    };
    ModelError { kind, message }
}

fn is_retryable(kind: &ModelErrorKind) -> bool {
    matches!(kind, ModelErrorKind::RateLimited | ModelErrorKind::ServiceUnavailable)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// HTTP adapter over an OpenAI/Ollama-compatible chat+embedding backend, with the
/// retry/backoff policy from §4.5: exponential from a configurable base, doubling to a
/// cap, bounded attempts, retrying only the transient HTTP classes.
pub struct ModelAdapter {
    client: reqwest::Client,
    config: Config,
    worker_pool: WorkerPool,
}

impl ModelAdapter {
    pub fn new(config: Config) -> Self {
        let worker_pool = WorkerPool::new(config.io_worker_capacity);
        Self { client: reqwest::Client::new(), config, worker_pool }
    }

    /// Specializes the shared §4.10 retry/backoff loop with this adapter's transient-error
    /// predicate, and bounds each attempt through the model adapter's own worker budget so
    /// a burst of chat requests can't open unbounded concurrent upstream connections.
    async fn with_retry<F, Fut, T>(&self, op: &'static str, mut f: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ModelError>>,
    {
        let pool = &self.worker_pool;
        retry_with_backoff(
            self.config.retry_base,
            self.config.retry_cap,
            self.config.retry_max_attempts,
            |e: &ModelError| is_retryable(&e.kind),
            move || {
                let attempt = f();
                async move {
                    let result = pool.run(|| attempt).await;
                    if let Err(e) = &result {
                        tracing::warn!(op, error = %e, "model call failed");
                    }
                    result
                }
            },
        )
        .await
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        self.with_retry("embed", || self.embed_once(text)).await
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let url = format!("{}/api/embeddings", self.config.embedding_model_url);
        let body = json!({ "model": self.config.embedding_model_name, "prompt": text });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError { kind: ModelErrorKind::ServiceUnavailable, message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError { kind: ModelErrorKind::FormatError, message: e.to_string() })?;

        let embedding = json["embedding"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect::<Vec<f32>>())
            .ok_or_else(|| ModelError {
                kind: ModelErrorKind::FormatError,
                message: "missing 'embedding' field".to_string(),
            })?;

        Ok(embedding)
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    /// `Complete(system, user, context[]) → string`. `context` becomes a synthesized
    /// "Context" turn inserted between the system prompt and the final user turn.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        context: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ModelError> {
        let mut messages = vec![ChatTurn { role: "system".to_string(), content: system.to_string() }];
        if let Some(ctx) = context {
            messages.push(ChatTurn { role: "user".to_string(), content: ctx.to_string() });
        }
        messages.push(ChatTurn { role: "user".to_string(), content: user.to_string() });

        self.with_retry("complete", || self.complete_once(&messages, temperature, max_tokens)).await
    }

    async fn complete_once(
        &self,
        messages: &[ChatTurn],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.config.chat_model_url);
        let body = json!({
            "model": self.config.chat_model_name,
            "messages": messages,
            "stream": false,
            "options": { "temperature": temperature, "num_predict": max_tokens }
        });

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.model_api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| ModelError { kind: ModelErrorKind::ServiceUnavailable, message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError { kind: ModelErrorKind::FormatError, message: e.to_string() })?;

        json["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ModelError {
                kind: ModelErrorKind::FormatError,
                message: "missing message.content".to_string(),
            })
    }

    /// Requests a strict JSON object `{questions:[...]}` and fails `FormatError` on
    /// parse failure; the caller truncates to `n`.
    pub async fn generate_questions(
        &self,
        content: &str,
        n: usize,
        question_type: &str,
    ) -> Result<Vec<crate::models::Question>, ModelError> {
        let system = "You generate study questions. Respond with a strict JSON object of the \
            shape {\"questions\":[{\"question\":...,\"type\":...,\"options\":[...]?,\"answer\":...,\"explanation\":...}]}. \
            No prose, no markdown fences.";
        let user = format!(
            "Generate {n} {question_type} questions from the following material:\n\n{content}"
        );

        let raw = self.complete(system, &user, None, 0.3, 1200).await?;
        let parsed: serde_json::Value = serde_json::from_str(raw.trim()).map_err(|e| ModelError {
            kind: ModelErrorKind::FormatError,
            message: format!("invalid JSON from model: {e}"),
        })?;

        let questions = parsed["questions"]
            .as_array()
            .ok_or_else(|| ModelError {
                kind: ModelErrorKind::FormatError,
                message: "missing 'questions' array".to_string(),
            })?
            .iter()
            .filter_map(|q| serde_json::from_value::<crate::models::Question>(q.clone()).ok())
            .take(n)
            .collect();

        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_429_to_rate_limited() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err.kind, ModelErrorKind::RateLimited));
    }

    #[test]
    fn classify_status_maps_503_to_service_unavailable() {
        let err = classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert!(matches!(err.kind, ModelErrorKind::ServiceUnavailable));
    }

    #[test]
    fn classify_status_maps_401_to_invalid_credentials() {
        let err = classify_status(reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(err.kind, ModelErrorKind::InvalidCredentials));
    }

    #[test]
    fn classify_status_maps_400_context_length_to_context_too_long() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "prompt is too long for context window");
        assert!(matches!(err.kind, ModelErrorKind::ContextTooLong));
    }

    #[test]
    fn classify_status_defaults_plain_400_to_other() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "missing field 'model'");
        assert!(matches!(err.kind, ModelErrorKind::Other));
    }

    #[test]
    fn is_retryable_excludes_invalid_credentials() {
        assert!(!is_retryable(&ModelErrorKind::InvalidCredentials));
        assert!(is_retryable(&ModelErrorKind::RateLimited));
    }
}
