//! Provider-neutral stream events and text extraction.
//!
//! Each provider maps its own JSON event shapes onto [`StreamEvent`]; the
//! [`TextAccumulator`] then applies one rule set to all of them:
//!
//! - the first `Delta` of a call switches the call to delta mode, after
//!   which whole `Message`s and `FinalResult`s are duplicates and dropped;
//! - a `FinalResult` only counts when nothing else has contributed.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    SessionStarted(String),
    Delta(String),
    Message(String),
    FinalResult(String),
    Ignored,
}

/// Per-invocation extraction state.
#[derive(Debug, Clone, Default)]
pub struct TextAccumulator {
    session_id: Option<String>,
    saw_delta: bool,
    text: String,
}

impl TextAccumulator {
    /// `session_id` is the id being resumed, kept unless the stream names a
    /// new one.
    pub fn new(session_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            ..Self::default()
        }
    }

    /// Apply one event; returns the fragment it contributed, if any.
    pub fn push(&mut self, event: StreamEvent) -> Option<String> {
        let fragment = match event {
            StreamEvent::SessionStarted(id) => {
                if !id.trim().is_empty() {
                    self.session_id = Some(id);
                }
                return None;
            }
            StreamEvent::Delta(text) => {
                self.saw_delta = true;
                text
            }
            StreamEvent::Message(text) if !self.saw_delta => text,
            StreamEvent::FinalResult(text) if !self.saw_delta && self.text.is_empty() => text,
            StreamEvent::Message(_) | StreamEvent::FinalResult(_) | StreamEvent::Ignored => {
                return None;
            }
        };
        if fragment.is_empty() {
            return None;
        }
        self.text.push_str(&fragment);
        Some(fragment)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_parts(self) -> (String, Option<String>) {
        (self.text, self.session_id)
    }
}

/// Maps one decoded JSON line to zero or more events.
pub type Decoder = fn(&Value) -> Vec<StreamEvent>;

/// Blank and non-JSON lines decode to nothing.
pub fn decode_line(line: &str, decode: Decoder) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => decode(&value),
        Err(_) => Vec::new(),
    }
}

/// Replay a captured stdout transcript. Pure: the same lines always give
/// the same text and session id.
pub fn extract_text<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    decode: Decoder,
    resumed: Option<&str>,
) -> (String, Option<String>) {
    let mut acc = TextAccumulator::new(resumed);
    for line in lines {
        for event in decode_line(line, decode) {
            acc.push(event);
        }
    }
    acc.into_parts()
}

/// Flatten the loose text shapes agents emit: strings, arrays of parts, and
/// objects carrying `text`, `output_text`, `content`, `response`, `delta` or
/// `message`.
pub fn text_from_parts(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(text_from_parts).collect(),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                return text.clone();
            }
            if let Some(Value::String(text)) = map.get("output_text") {
                return text.clone();
            }
            if let Some(content @ (Value::Array(_) | Value::String(_))) = map.get("content") {
                return text_from_parts(content);
            }
            if let Some(Value::String(text)) = map.get("response") {
                return text.clone();
            }
            for key in ["delta", "message"] {
                if let Some(inner) = map.get(key).filter(|inner| !inner.is_null()) {
                    return text_from_parts(inner);
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_mode_drops_later_whole_messages() {
        let mut acc = TextAccumulator::new(None);
        assert_eq!(acc.push(StreamEvent::Delta("He".into())), Some("He".into()));
        assert_eq!(acc.push(StreamEvent::Delta("llo".into())), Some("llo".into()));
        assert_eq!(acc.push(StreamEvent::Message("Hello".into())), None);
        assert_eq!(acc.push(StreamEvent::FinalResult("Hello".into())), None);
        assert_eq!(acc.text(), "Hello");
    }

    #[test]
    fn messages_accumulate_and_final_result_is_a_fallback() {
        let mut acc = TextAccumulator::new(None);
        acc.push(StreamEvent::Message("a".into()));
        acc.push(StreamEvent::Message("b".into()));
        acc.push(StreamEvent::FinalResult("ab".into()));
        assert_eq!(acc.text(), "ab");

        let mut only_result = TextAccumulator::new(None);
        only_result.push(StreamEvent::FinalResult("done".into()));
        assert_eq!(only_result.text(), "done");
    }

    #[test]
    fn session_id_survives_unless_replaced() {
        let mut acc = TextAccumulator::new(Some("old"));
        assert_eq!(acc.session_id(), Some("old"));
        acc.push(StreamEvent::SessionStarted(" ".into()));
        assert_eq!(acc.session_id(), Some("old"));
        acc.push(StreamEvent::SessionStarted("new".into()));
        assert_eq!(acc.session_id(), Some("new"));
    }

    fn toy_decoder(value: &Value) -> Vec<StreamEvent> {
        match value["type"].as_str() {
            Some("delta") => vec![StreamEvent::Delta(text_from_parts(&value["text"]))],
            Some("message") => vec![StreamEvent::Message(text_from_parts(&value["text"]))],
            _ => vec![StreamEvent::Ignored],
        }
    }

    #[test]
    fn extraction_is_idempotent_and_skips_noise() {
        let lines = [
            "",
            "not json at all",
            r#"{"type":"message","text":"one"}"#,
            "   ",
            r#"{"type":"other"}"#,
            r#"{"type":"message","text":[{"text":"two"}]}"#,
        ];
        let first = extract_text(lines, toy_decoder, None);
        let second = extract_text(lines, toy_decoder, None);
        assert_eq!(first, second);
        assert_eq!(first.0, "onetwo");
    }

    #[test]
    fn text_from_parts_handles_nested_shapes() {
        assert_eq!(text_from_parts(&json!("x")), "x");
        assert_eq!(text_from_parts(&json!({"content": "plain"})), "plain");
        assert_eq!(text_from_parts(&json!([{"response": "r"}, {"content": "c"}])), "rc");
        assert_eq!(
            text_from_parts(&json!({"content": [{"text": "a"}, {"output_text": "b"}]})),
            "ab"
        );
        assert_eq!(text_from_parts(&json!({"message": {"delta": "m"}})), "m");
        assert_eq!(text_from_parts(&json!(null)), "");
        assert_eq!(text_from_parts(&json!(42)), "");
    }
}
