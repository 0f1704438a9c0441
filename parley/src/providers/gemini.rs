//! `gemini --output-format stream-json` adapter.
//!
//! Also accepts the single-object `--output-format json` payload, whose
//! `response` may be a string or structured JSON.

use serde::Deserialize;
use serde_json::Value;

use super::events::{StreamEvent, text_from_parts};
use super::{Provider, ProviderReply, ProviderRequest, TextSink, run_stream};
use crate::core::types::ProviderKind;
use crate::io::process::{Invocation, ProcessFailure};

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiProvider;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum GeminiEvent {
    Init {
        session_id: String,
    },
    Message {
        #[serde(default)]
        role: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        delta: bool,
    },
    Result {
        #[serde(default)]
        response: Value,
    },
    #[serde(other)]
    Other,
}

/// Structured responses are passed on as compact JSON text.
fn response_text(response: &Value) -> String {
    match response {
        Value::Object(_) | Value::Array(_) => response.to_string(),
        other => text_from_parts(other),
    }
}

pub(crate) fn decode(value: &Value) -> Vec<StreamEvent> {
    if value.get("type").is_none()
        && let Some(response) = value.get("response")
    {
        let mut events = Vec::new();
        if let Some(Value::String(id)) = value.get("session_id") {
            events.push(StreamEvent::SessionStarted(id.clone()));
        }
        events.push(StreamEvent::FinalResult(response_text(response)));
        return events;
    }
    let event = match GeminiEvent::deserialize(value) {
        Ok(GeminiEvent::Init { session_id }) => StreamEvent::SessionStarted(session_id),
        Ok(GeminiEvent::Message {
            role,
            content,
            delta,
        }) if role == "assistant" => {
            let text = text_from_parts(&content);
            if delta {
                StreamEvent::Delta(text)
            } else {
                StreamEvent::Message(text)
            }
        }
        Ok(GeminiEvent::Result { response }) if !response.is_null() => {
            StreamEvent::FinalResult(response_text(&response))
        }
        Ok(_) | Err(_) => StreamEvent::Ignored,
    };
    vec![event]
}

impl GeminiProvider {
    pub(crate) fn build(&self, request: &ProviderRequest<'_>) -> Invocation {
        let mut invocation = request.invocation(ProviderKind::Gemini);
        if request.prompt_via_stdin() {
            invocation.stdin = Some(request.prompt.to_string());
        } else {
            invocation = invocation.args(["-p", request.prompt]);
        }
        invocation = invocation.args(["--output-format", "stream-json"]);
        if let Some(model) = request.option("model") {
            invocation = invocation.args(["--model", model]);
        }
        if let Some(mode) = request.option("approval_mode") {
            invocation = invocation.args(["--approval-mode", mode]);
        }
        if let Some(sandbox) = request.option("sandbox") {
            let on = request.flag("sandbox");
            if on || matches!(sandbox.to_ascii_lowercase().as_str(), "false" | "0" | "no") {
                invocation = invocation.args(["--sandbox", if on { "true" } else { "false" }]);
            }
        }
        if request.flag("yolo") {
            invocation = invocation.arg("--yolo");
        }
        if let Some(session_id) = request.session_id {
            invocation = invocation.args(["--resume", session_id]);
        }
        if let Some(tools) = request.option("allowed_tools") {
            for tool in tools.split(',').map(str::trim).filter(|tool| !tool.is_empty()) {
                invocation = invocation.args(["--allowed-tools", tool]);
            }
        }
        invocation
    }
}

impl Provider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
    fn argument_layout() {
        let options = BTreeMap::from([("approval_mode".to_string(), "default".to_string())]);
        let settings = settings(None);
        let request = ProviderRequest {
            prompt: "plan it",
            session_id: Some("g-2"),
            workdir: Path::new("/tmp"),
            options: &options,
            settings: &settings,
            abort: None,
        };
        assert_eq!(
            GeminiProvider.build(&request).args,
            vec![
                "-p",
                "plan it",
                "--output-format",
                "stream-json",
                "--approval-mode",
                "default",
                "--resume",
                "g-2"
            ]
        );
    }

    #[test]
    fn sandbox_yolo_and_allowed_tools() {
        let options = BTreeMap::from([
            ("sandbox".to_string(), "true".to_string()),
            ("yolo".to_string(), "yes".to_string()),
            ("allowed_tools".to_string(), "read_file, glob,".to_string()),
        ]);
        let settings = settings(Some("/opt/gemini"));
        let request = ProviderRequest {
            prompt: "go",
            session_id: None,
            workdir: Path::new("/tmp"),
            options: &options,
            settings: &settings,
            abort: None,
        };
        let invocation = GeminiProvider.build(&request);
        assert_eq!(invocation.program, "/opt/gemini");
        assert_eq!(
            invocation.args,
            vec![
                "-p",
                "go",
                "--output-format",
                "stream-json",
                "--sandbox",
                "true",
                "--yolo",
                "--allowed-tools",
                "read_file",
                "--allowed-tools",
                "glob"
            ]
        );

        let off = BTreeMap::from([
            ("sandbox".to_string(), "false".to_string()),
            ("yolo".to_string(), "false".to_string()),
        ]);
        let request = ProviderRequest {
            options: &off,
            ..request
        };
        assert_eq!(
            GeminiProvider.build(&request).args[4..],
            ["--sandbox", "false"]
        );
    }

    #[test]
    fn decodes_response_and_string_content_shapes() {
        let stream = [
            r#"{"type":"init","session_id":"g-3"}"#,
            r#"{"type":"message","role":"assistant","content":{"content":"{"a":1}"}}"#,
        ];
        assert_eq!(extract_text(stream, decode, None).0, r#"{"a":1}"#);

        let result_only = [r#"{"type":"result","response":{"ok":true}}"#];
        assert_eq!(extract_text(result_only, decode, None).0, r#"{"ok":true}"#);

        let json_mode = [r#"{"session_id":"g-4","response":"{"ok":true}","stats":{}}"#];
        let (text, session) = extract_text(json_mode, decode, None);
        assert_eq!(text, r#"{"ok":true}"#);
        assert_eq!(session.as_deref(), Some("g-4"));
    }

    #[test]
    fn decodes_init_and_assistant_chunks() {
        let lines = [
            r#"{"type":"init","session_id":"g-1","model":"x"}"#,
            r#"{"type":"message","role":"user","content":"prompt echo"}"#,
            r#"{"type":"message","role":"assistant","content":"{\"ok\":","delta":true}"#,
            r#"{"type":"message","role":"assistant","content":"true}","delta":true}"#,
            r#"{"type":"message","role":"assistant","content":"{\"ok\":true}"}"#,
            r#"{"type":"result","status":"success"}"#,
        ];
        let (text, session) = extract_text(lines, decode, None);
        assert_eq!(text, r#"{"ok":true}"#);
        assert_eq!(session.as_deref(), Some("g-1"));
    }
}
