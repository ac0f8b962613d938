//! Embeddings endpoint client (for the semantic cache).

use std::future::Future;

use maestro_types::{EmbeddingError, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};

/// Client for an OpenAI-style embeddings endpoint.
pub struct HttpEmbedder {
    api_key: String,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    /// Create an embedder with the given API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com".into(),
            default_model: "text-embedding-3-small".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Embedding model used when the request does not specify one.
    #[must_use]
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

/// Map an HTTP status from the embeddings endpoint.
fn map_embedding_status(status: reqwest::StatusCode, body: &str) -> EmbeddingError {
    match status.as_u16() {
        401 | 403 => EmbeddingError::Authentication(body.to_string()),
        429 => EmbeddingError::RateLimit { retry_after: None },
        400 | 404 => EmbeddingError::InvalidRequest(body.to_string()),
        _ => EmbeddingError::Other(body.to_string().into()),
    }
}

impl EmbeddingProvider for HttpEmbedder {
    /// Generate one vector per input text.
    fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> impl Future<Output = Result<EmbeddingResponse, EmbeddingError>> + Send {
        let url = self.embeddings_url();
        let api_key = self.api_key.clone();
        let default_model = self.default_model.clone();
        let http_client = self.client.clone();

        async move {
            let model = if request.model.is_empty() {
                default_model
            } else {
                request.model
            };
            let body = serde_json::json!({
                "model": model,
                "input": request.input,
                "encoding_format": "float",
            });
            tracing::debug!(url = %url, model = %model, "sending embedding request");

            let response = http_client
                .post(&url)
                .header("authorization", format!("Bearer {api_key}"))
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| EmbeddingError::Network(Box::new(e)))?;

            let status = response.status();
            let response_text = response
                .text()
                .await
                .map_err(|e| EmbeddingError::Network(Box::new(e)))?;
            if !status.is_success() {
                return Err(map_embedding_status(status, &response_text));
            }

            let json: serde_json::Value = serde_json::from_str(&response_text)
                .map_err(|e| EmbeddingError::InvalidRequest(format!("invalid JSON response: {e}")))?;
            parse_embedding_response(&json, &model)
        }
    }
}

/// Parse the embeddings API response.
fn parse_embedding_response(
    json: &serde_json::Value,
    model: &str,
) -> Result<EmbeddingResponse, EmbeddingError> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| EmbeddingError::InvalidRequest("response missing data".into()))?;
    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let vector = item["embedding"]
            .as_array()
            .ok_or_else(|| EmbeddingError::InvalidRequest("item missing embedding".into()))?
            .iter()
            .filter_map(serde_json::Value::as_f64)
            .map(|v| v as f32)
            .collect();
        embeddings.push(vector);
    }
    Ok(EmbeddingResponse {
        embeddings,
        model: model.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_url_includes_path() {
        let embedder = HttpEmbedder::new("k").base_url("http://localhost:9999");
        assert_eq!(embedder.embeddings_url(), "http://localhost:9999/v1/embeddings");
    }

    #[test]
    fn response_parses_vectors_in_order() {
        let json = serde_json::json!({
            "data": [
                {"index": 0, "embedding": [0.1, 0.2]},
                {"index": 1, "embedding": [0.3, 0.4]}
            ]
        });
        let response = parse_embedding_response(&json, "m").unwrap();
        assert_eq!(response.embeddings.len(), 2);
        assert_eq!(response.embeddings[0], vec![0.1f32, 0.2f32]);
        assert_eq!(response.model, "m");
    }

    #[test]
    fn malformed_responses_error() {
        let json = serde_json::json!({"oops": true});
        assert!(parse_embedding_response(&json, "m").is_err());
    }
}
