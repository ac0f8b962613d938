//! HTTP client struct and builder.

use std::future::Future;

use maestro_types::{CompletionRequest, CompletionResponse, Provider, ProviderError};

use crate::error::{map_http_status, map_reqwest_error};
use crate::mapping::{from_api_response, to_api_request};

/// Default API version header value.
const API_VERSION: &str = "2023-06-01";

/// Client for a messages-style completion API.
///
/// Implements [`Provider`] for use anywhere a provider is accepted.
///
/// # Example
///
/// ```no_run
/// use maestro_provider_http::HttpProvider;
///
/// let client = HttpProvider::new("sk-...")
///     .base_url("https://api.anthropic.com")
///     .default_model("claude-sonnet-4-20250514");
/// ```
pub struct HttpProvider {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) default_model: String,
    /// Header carrying the API key (`x-api-key` by default; gateways
    /// sometimes expect `authorization`).
    pub(crate) auth_header: String,
    pub(crate) client: reqwest::Client,
}

impl HttpProvider {
    /// Create a client with the given API key and defaults.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
            default_model: String::new(),
            auth_header: "x-api-key".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the API base URL (testing, proxies, gateways).
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Model used when the request does not specify one.
    #[must_use]
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Override the auth header name.
    #[must_use]
    pub fn auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = header.into();
        self
    }

    /// Build the messages endpoint URL.
    pub(crate) fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

impl Provider for HttpProvider {
    /// Send one completion request.
    ///
    /// Maps the [`CompletionRequest`] to the API's JSON shape, posts it
    /// with the auth and version headers, and maps the response back.
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send {
        let url = self.messages_url();
        let api_key = self.api_key.clone();
        let auth_header = self.auth_header.clone();
        let default_model = self.default_model.clone();
        let http_client = self.client.clone();

        async move {
            let body = to_api_request(&request, &default_model);
            tracing::debug!(url = %url, model = %body["model"], "sending completion request");

            let response = http_client
                .post(&url)
                .header(&auth_header, &api_key)
                .header("anthropic-version", API_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status();
            let response_text = response.text().await.map_err(map_reqwest_error)?;
            if !status.is_success() {
                return Err(map_http_status(status, &response_text));
            }

            let json: serde_json::Value = serde_json::from_str(&response_text)
                .map_err(|e| ProviderError::InvalidRequest(format!("invalid JSON response: {e}")))?;
            from_api_response(&json)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_set() {
        let client = HttpProvider::new("test-key");
        assert_eq!(client.base_url, "https://api.anthropic.com");
        assert_eq!(client.auth_header, "x-api-key");
        assert_eq!(client.api_key, "test-key");
    }

    #[test]
    fn builder_overrides_apply() {
        let client = HttpProvider::new("k")
            .base_url("http://localhost:9999")
            .default_model("m-1")
            .auth_header("authorization");
        assert_eq!(client.base_url, "http://localhost:9999");
        assert_eq!(client.default_model, "m-1");
        assert_eq!(client.auth_header, "authorization");
    }

    #[test]
    fn messages_url_includes_path() {
        let client = HttpProvider::new("k").base_url("http://localhost:9999");
        assert_eq!(client.messages_url(), "http://localhost:9999/v1/messages");
    }
}
