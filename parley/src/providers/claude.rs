//! `claude -p --output-format stream-json` adapter.

use serde::Deserialize;
use serde_json::Value;

use super::events::StreamEvent;
use super::{Provider, ProviderReply, ProviderRequest, TextSink, run_stream};
use crate::core::types::ProviderKind;
use crate::io::process::{Invocation, ProcessFailure};

#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeProvider;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClaudeEvent {
    #[serde(rename = "stream_event")]
    Stream { event: InnerEvent },
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct InnerEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<Value>,
}

impl AssistantMessage {
    /// Concatenated `text` blocks; tool use and thinking blocks are skipped.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect()
    }
}

pub(crate) fn decode(value: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    // Any event may carry the session id.
    if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
        events.push(StreamEvent::SessionStarted(session_id.to_string()));
    }
    let event = match ClaudeEvent::deserialize(value) {
        Ok(ClaudeEvent::Stream { event }) if event.kind == "content_block_delta" => {
            match event.delta {
                Some(delta) if delta.kind == "text_delta" => StreamEvent::Delta(delta.text),
                _ => StreamEvent::Ignored,
            }
        }
        Ok(ClaudeEvent::Assistant { message }) => StreamEvent::Message(message.text()),
        Ok(ClaudeEvent::Result {
            subtype,
            result: Some(result),
        }) if subtype == "success" => StreamEvent::FinalResult(result),
        Ok(_) | Err(_) => StreamEvent::Ignored,
    };
    events.push(event);
    events
}

impl ClaudeProvider {
    pub(crate) fn build(&self, request: &ProviderRequest<'_>) -> Invocation {
        let mut invocation = request.invocation(ProviderKind::Claude).args([
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
        ]);
        if request.option("include_partial_messages").is_none()
            || request.flag("include_partial_messages")
        {
            invocation = invocation.arg("--include-partial-messages");
        }
        if let Some(mode) = request.option("permission_mode") {
            invocation = invocation.args(["--permission-mode", mode]);
        }
        if let Some(tools) = request.option("disallowed_tools") {
            invocation = invocation.args(["--disallowedTools", tools]);
        }
        if let Some(model) = request.option("model") {
            invocation = invocation.args(["--model", model]);
        }
        if let Some(session_id) = request.session_id {
            invocation = invocation.args(["-r", session_id]);
        }
        if request.prompt_via_stdin() {
            invocation.stdin = Some(request.prompt.to_string());
        } else {
            invocation = invocation.arg(request.prompt);
        }
        invocation
    }
}

impl Provider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn invoke(
        &self,
        request: &ProviderRequest<'_>,
        sink: Option<&mut dyn TextSink>,
    ) -> Result<ProviderReply, ProcessFailure> {
        run_stream(&self.build(request), decode, request.session_id, sink)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;
    use crate::providers::events::extract_text;
    use crate::providers::testing::settings;

    #[test]
    fn argument_layout_with_options() {
        let options = BTreeMap::from([
            ("permission_mode".to_string(), "default".to_string()),
            ("disallowed_tools".to_string(), "Bash,Edit".to_string()),
            ("include_partial_messages".to_string(), "false".to_string()),
        ]);
        let settings = settings(None);
        let request = ProviderRequest {
            prompt: "review",
            session_id: Some("s-1"),
            workdir: Path::new("/tmp"),
            options: &options,
            settings: &settings,
            abort: None,
        };
        let invocation = ClaudeProvider.build(&request);
        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--permission-mode",
                "default",
                "--disallowedTools",
                "Bash,Edit",
                "-r",
                "s-1",
                "review"
            ]
        );
    }

    #[test]
    fn text_deltas_suppress_whole_message_and_result() {
        let lines = [
            r#"{"type":"system","subtype":"init","session_id":"sess-7"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#,
            r#"{"type":"result","subtype":"success","result":"Hello","session_id":"sess-7"}"#,
        ];
        let (text, session) = extract_text(lines, decode, None);
        assert_eq!(text, "Hello");
        assert_eq!(session.as_deref(), Some("sess-7"));
    }

    #[test]
    fn whole_messages_without_partials() {
        let lines = [
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read"},{"type":"text","text":"{}"}]}}"#,
            r#"{"type":"result","subtype":"success","result":"{}"}"#,
        ];
        assert_eq!(extract_text(lines, decode, None).0, "{}");
    }

    #[test]
    fn result_is_the_last_resort() {
        let lines = [
            r#"{"type":"result","subtype":"error_max_turns","result":"nope"}"#,
            r#"{"type":"result","subtype":"success","result":"final"}"#,
        ];
        assert_eq!(extract_text(lines, decode, None).0, "final");
    }
}
