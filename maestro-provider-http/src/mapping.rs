//! Request/response JSON mapping for the messages-style API.

use maestro_types::{CompletionRequest, CompletionResponse, ProviderError, TokenUsage};

/// Build the API request body.
pub(crate) fn to_api_request(request: &CompletionRequest, default_model: &str) -> serde_json::Value {
    let model = if request.model.is_empty() {
        default_model
    } else {
        &request.model
    };
    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": [
            {"role": "user", "content": request.prompt}
        ],
    });
    if let Some(system) = &request.system {
        body["system"] = serde_json::Value::String(system.clone());
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    // Provider-specific passthrough fields win over the mapped ones.
    if let serde_json::Value::Object(map) = &mut body {
        for (key, value) in &request.extra {
            map.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Parse the API response into a [`CompletionResponse`].
pub(crate) fn from_api_response(
    json: &serde_json::Value,
) -> Result<CompletionResponse, ProviderError> {
    let text = json["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| ProviderError::InvalidRequest("response missing content".into()))?;

    let model = json["model"].as_str().unwrap_or_default().to_string();
    let usage = TokenUsage::new(
        json["usage"]["input_tokens"].as_u64().unwrap_or(0),
        json["usage"]["output_tokens"].as_u64().unwrap_or(0),
    );
    Ok(CompletionResponse { text, model, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_prompt_and_system() {
        let mut request = CompletionRequest::new("m-1", "hello");
        request.system = Some("be brief".into());
        request.temperature = Some(0.2);
        let body = to_api_request(&request, "default-m");
        assert_eq!(body["model"], "m-1");
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn empty_model_uses_the_default() {
        let request = CompletionRequest::new("", "hello");
        let body = to_api_request(&request, "default-m");
        assert_eq!(body["model"], "default-m");
    }

    #[test]
    fn extra_fields_pass_through() {
        let mut request = CompletionRequest::new("m", "hello");
        request
            .extra
            .insert("cache_control".into(), serde_json::json!({"type": "ephemeral"}));
        let body = to_api_request(&request, "d");
        assert_eq!(body["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn response_parses_text_and_usage() {
        let json = serde_json::json!({
            "model": "m-1",
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "text", "text": "world."}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 5}
        });
        let response = from_api_response(&json).unwrap();
        assert_eq!(response.text, "Hello, world.");
        assert_eq!(response.model, "m-1");
        assert_eq!(response.usage, TokenUsage::new(12, 5));
    }

    #[test]
    fn missing_content_is_an_error() {
        let json = serde_json::json!({"model": "m-1"});
        assert!(from_api_response(&json).is_err());
    }
}
