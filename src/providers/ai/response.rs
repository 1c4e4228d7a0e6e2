//! Pulling model output out of gateway response bodies.
//!
//! Gateways wrap the generated text in different envelopes. Each known
//! envelope is a [`ResponseShape`]; they are tried in a fixed order and the
//! first one that yields non-empty text wins. The raw body is the last resort.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::traits::{LlmError, LlmResult};

/// Known response envelopes, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `{"message": {"content": "..."}}` (chat endpoints)
    MessageContent,
    /// `{"choices": [{"message": {"content": "..."}}]}` (OpenAI-compatible)
    ChoicesMessageContent,
    /// `{"response": "..."}` (generate endpoints)
    Response,
    /// `{"respuesta": "..."}`
    Respuesta,
    /// The body itself.
    Raw,
}

impl ResponseShape {
    pub const ORDER: [ResponseShape; 5] = [
        ResponseShape::MessageContent,
        ResponseShape::ChoicesMessageContent,
        ResponseShape::Response,
        ResponseShape::Respuesta,
        ResponseShape::Raw,
    ];

    fn extract(self, body: &str, json: Option<&Value>) -> Option<String> {
        let text = match self {
            Self::MessageContent => json?.pointer("/message/content")?.as_str(),
            Self::ChoicesMessageContent => json?.pointer("/choices/0/message/content")?.as_str(),
            Self::Response => json?.get("response")?.as_str(),
            Self::Respuesta => json?.get("respuesta")?.as_str(),
            Self::Raw => Some(body),
        }?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Returns the model output carried by `body` and the shape that matched.
pub fn extract_output(body: &str) -> LlmResult<(String, ResponseShape)> {
    let json: Option<Value> = serde_json::from_str(body).ok();
    ResponseShape::ORDER
        .iter()
        .find_map(|shape| {
            shape
                .extract(body, json.as_ref())
                .map(|text| (text, *shape))
        })
        .ok_or_else(|| LlmError::InvalidResponse("empty response body".into()))
}

/// Parses the JSON object embedded in model output.
///
/// Tolerates markdown code fences and prose around the object.
pub fn parse_json_payload<T: DeserializeOwned>(text: &str) -> LlmResult<T> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| LlmError::InvalidResponse(format!("malformed JSON payload: {e}"))),
        _ => Err(LlmError::InvalidResponse(format!(
            "no JSON object in model output: {}",
            truncate(trimmed, 80)
        ))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        label: String,
    }

    #[test]
    fn message_content_wins_over_response() {
        let body = r#"{"message":{"content":"A"},"response":"B"}"#;
        let (text, shape) = extract_output(body).unwrap();
        assert_eq!(text, "A");
        assert_eq!(shape, ResponseShape::MessageContent);
    }

    #[test]
    fn choices_shape() {
        let body = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
        let (text, shape) = extract_output(body).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(shape, ResponseShape::ChoicesMessageContent);
    }

    #[test]
    fn empty_candidates_fall_through() {
        let body = r#"{"message":{"content":"  "},"response":"","respuesta":"hola"}"#;
        let (text, shape) = extract_output(body).unwrap();
        assert_eq!(text, "hola");
        assert_eq!(shape, ResponseShape::Respuesta);
    }

    #[test]
    fn non_json_body_is_raw() {
        let (text, shape) = extract_output("  plain words ").unwrap();
        assert_eq!(text, "plain words");
        assert_eq!(shape, ResponseShape::Raw);
    }

    #[test]
    fn json_without_known_keys_is_raw() {
        let body = r#"{"label":"SPAM"}"#;
        let (text, shape) = extract_output(body).unwrap();
        assert_eq!(text, body);
        assert_eq!(shape, ResponseShape::Raw);
    }

    #[test]
    fn empty_body_is_invalid() {
        assert!(matches!(
            extract_output("   "),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn payload_plain() {
        let v: Verdict = parse_json_payload(r#"{"label":"SPAM"}"#).unwrap();
        assert_eq!(v.label, "SPAM");
    }

    #[test]
    fn payload_in_code_fence() {
        let v: Verdict = parse_json_payload("```json\n{\"label\":\"Work\"}\n```").unwrap();
        assert_eq!(v.label, "Work");
    }

    #[test]
    fn payload_with_surrounding_prose() {
        let v: Verdict =
            parse_json_payload("Sure! Here it is: {\"label\":\"News\"} hope it helps").unwrap();
        assert_eq!(v.label, "News");
    }

    #[test]
    fn payload_missing() {
        let err = parse_json_payload::<Verdict>("no idea").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
