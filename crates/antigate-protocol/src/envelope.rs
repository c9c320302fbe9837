//! The `v1internal:*` envelope Antigravity wraps every Gemini RPC body in.
//! Grounded on `providers/antigravity/mod.rs::wrap_internal_request`, extended
//! with the `requestId`/`userAgent`/`requestType` fields spec §6's wire
//! sample carries that gproxy's envelope omits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gemini::types::GenerateContentRequest;

const USER_AGENT: &str = "antigravity";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalRequest<T> {
    pub project: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    #[serde(rename = "requestType")]
    pub request_type: String,
    pub model: String,
    pub request: T,
}

/// `requestType` is `image_gen` for image-generation models, `agent`
/// otherwise; mirrors `request_type_for_model` in gproxy's Antigravity
/// provider.
pub fn request_type_for_model(model: &str) -> &'static str {
    if model.to_ascii_lowercase().contains("image") {
        "image_gen"
    } else {
        "agent"
    }
}

/// `requestId` takes the `agent-<uuid>` shape spec §6 shows; gproxy built
/// this from wall-clock nanos instead, but a v4 uuid needs no clock.
pub fn new_request_id() -> String {
    format!("agent-{}", uuid::Uuid::new_v4())
}

pub fn wrap_generate_content(
    model: String,
    project: String,
    request: GenerateContentRequest,
) -> InternalRequest<GenerateContentRequest> {
    let request_type = request_type_for_model(&model).to_string();
    InternalRequest {
        project,
        request_id: new_request_id(),
        user_agent: USER_AGENT.to_string(),
        request_type,
        model,
        request,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalResponse<T> {
    #[serde(flatten)]
    pub body: T,
}

/// Unwraps one upstream JSON payload (a non-stream response body, or a
/// single SSE `data:` payload) out of its `v1internal` envelope. Spec §4.C4:
/// both shapes carry the Gemini body under a top-level `response` key; a
/// payload that doesn't have that key (seen from some upstream builds) is
/// parsed as the bare Gemini body directly, so this never rejects a
/// well-formed chunk over a missing wrapper.
pub fn unwrap_response<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(mut map) if map.contains_key("response") => {
            let inner = map.remove("response").expect("checked above");
            serde_json::from_value(inner)
        }
        other => serde_json::from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::types::GenerateContentResponse;

    #[test]
    fn unwraps_response_wrapped_chunk() {
        let raw = r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#;
        let parsed: GenerateContentResponse = unwrap_response(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn falls_back_to_bare_body_when_unwrapped() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}"#;
        let parsed: GenerateContentResponse = unwrap_response(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text.as_deref(), Some("hi"));
    }
}

/// The `loadCodeAssist` RPC response shape, used for project-id discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudaicompanion_project: Option<String>,
    #[serde(default)]
    pub allowed_tiers: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tier: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserRequest {
    pub tier_id: String,
    pub cloudaicompanion_project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserResponse {
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}
