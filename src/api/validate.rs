//! Request validation for the chat-completions endpoint.
//!
//! Everything here runs before routing, against the raw body bytes: size
//! cap, JSON shape, message limits, and model resolution. Checks are ordered
//! so the cheapest rejections happen first and every failure maps to the
//! uniform error envelope.

use serde_json::Value;

use crate::{
    catalog::{ModelCatalog, Resolved},
    config::ProxyConfig,
    error::ProxyError,
};

/// A request that passed every check, with the fields later stages need
/// already extracted.
#[derive(Debug)]
pub struct ValidatedRequest {
    /// The parsed body, kept for fingerprinting and forwarding.
    pub body: Value,
    pub requested_model: String,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    /// Concatenated user-role text content.
    pub prompt: String,
    pub message_count: usize,
    pub tools_present: bool,
    pub structured_output: bool,
    pub non_text_content: bool,
}

pub fn validate(
    bytes: &[u8],
    config: &ProxyConfig,
    catalog: &ModelCatalog,
) -> Result<ValidatedRequest, ProxyError> {
    if bytes.len() > config.max_body_bytes {
        return Err(ProxyError::PayloadTooLarge { limit: config.max_body_bytes });
    }

    let body: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProxyError::Validation(format!("request body is not valid JSON: {e}")))?;
    if !body.is_object() {
        return Err(ProxyError::Validation("request body must be a JSON object".into()));
    }

    let messages = body
        .get("messages")
        .ok_or_else(|| ProxyError::Validation("`messages` is required".into()))?
        .as_array()
        .ok_or_else(|| ProxyError::Validation("`messages` must be an array".into()))?;
    if messages.is_empty() {
        return Err(ProxyError::Validation("`messages` must not be empty".into()));
    }
    if messages.len() > config.max_messages {
        return Err(ProxyError::Validation(format!(
            "`messages` exceeds the {} entry limit",
            config.max_messages
        )));
    }

    let max_tokens = match body.get("max_tokens") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            ProxyError::Validation("`max_tokens` must be a non-negative integer".into())
        })?),
    };

    let requested_model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(crate::catalog::AUTO_MODEL)
        .to_string();
    if matches!(catalog.resolve(&requested_model), Resolved::Unknown) {
        return Err(ProxyError::Validation(format!("unknown model `{requested_model}`")));
    }

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let tools_present = body
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|t| !t.is_empty());
    let structured_output = body
        .pointer("/response_format/type")
        .and_then(Value::as_str)
        .is_some_and(|t| t == "json_object" || t == "json_schema");

    let (prompt, non_text_content) = extract_user_text(messages);

    Ok(ValidatedRequest {
        requested_model,
        stream,
        max_tokens,
        prompt,
        message_count: messages.len(),
        tools_present,
        structured_output,
        non_text_content,
        body,
    })
}

/// Concatenate user-role text. Array-form content is walked part by part;
/// any non-text part flags the request as multimodal.
fn extract_user_text(messages: &[Value]) -> (String, bool) {
    let mut prompt = String::new();
    let mut non_text = false;

    for message in messages {
        if message["role"].as_str() != Some("user") {
            continue;
        }
        match &message["content"] {
            Value::String(text) => {
                if !prompt.is_empty() {
                    prompt.push('\n');
                }
                prompt.push_str(text);
            }
            Value::Array(parts) => {
                for part in parts {
                    match part["type"].as_str() {
                        Some("text") => {
                            if let Some(text) = part["text"].as_str() {
                                if !prompt.is_empty() {
                                    prompt.push('\n');
                                }
                                prompt.push_str(text);
                            }
                        }
                        _ => non_text = true,
                    }
                }
            }
            _ => {}
        }
    }

    (prompt, non_text)
}
