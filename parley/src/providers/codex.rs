//! `codex exec --json` adapter.

use serde::Deserialize;
use serde_json::Value;

use super::events::{StreamEvent, text_from_parts};
use super::{Provider, ProviderReply, ProviderRequest, TextSink, run_stream};
use crate::core::types::ProviderKind;
use crate::io::process::{Invocation, ProcessFailure};

#[derive(Debug, Clone, Copy, Default)]
pub struct CodexProvider;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "agent_message_delta")]
    AgentMessageDelta {
        #[serde(default)]
        delta: Value,
    },
    #[serde(rename = "agent_message")]
    AgentMessage {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: Value,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Value,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    content: Value,
}

/// First candidate that yields non-empty text.
fn first_text(candidates: &[&Value]) -> String {
    candidates
        .iter()
        .map(|value| text_from_parts(value))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// Events without a recognized `type` still count when they carry
/// `role: assistant`.
fn role_fallback(value: &Value) -> Vec<StreamEvent> {
    if value.get("role").and_then(Value::as_str) != Some("assistant") {
        return vec![StreamEvent::Ignored];
    }
    let text = first_text(&[&value["content"], &value["message"], &value["delta"]]);
    vec![StreamEvent::Message(text)]
}

pub(crate) fn decode(value: &Value) -> Vec<StreamEvent> {
    let Ok(event) = CodexEvent::deserialize(value) else {
        return role_fallback(value);
    };
    match event {
        CodexEvent::ThreadStarted { thread_id } => vec![StreamEvent::SessionStarted(thread_id)],
        CodexEvent::ItemCompleted { item } if matches!(item.kind.as_str(), "agent_message" | "assistant") => {
            vec![StreamEvent::Message(first_text(&[
                &item.text,
                &item.message,
                &item.content,
            ]))]
        }
        CodexEvent::ItemCompleted { .. } => vec![StreamEvent::Ignored],
        CodexEvent::AgentMessageDelta { delta } => vec![StreamEvent::Delta(text_from_parts(&delta))],
        CodexEvent::AgentMessage { message } => vec![StreamEvent::Message(text_from_parts(&message))],
        CodexEvent::Assistant { message, content } => {
            vec![StreamEvent::Message(first_text(&[&message, &content]))]
        }
        CodexEvent::Other => role_fallback(value),
    }
}

impl CodexProvider {
    pub(crate) fn build(&self, request: &ProviderRequest<'_>) -> Invocation {
        let mut invocation = request.invocation(ProviderKind::Codex).arg("exec");
        if request.session_id.is_some() {
            invocation = invocation.arg("resume");
        }
        invocation = invocation.args(["--json", "--skip-git-repo-check"]);
        if request.option("exec_mode") == Some("bypass") {
            invocation = invocation.arg("--dangerously-bypass-approvals-and-sandbox");
        } else if let Some(sandbox) = request.option("sandbox") {
            invocation = invocation.args(["--sandbox", sandbox]);
        }
        if let Some(model) = request.option("model") {
            invocation = invocation.args(["--model", model]);
        }
        if let Some(session_id) = request.session_id {
            invocation = invocation.arg(session_id);
        }
        if request.prompt_via_stdin() {
            invocation = invocation.arg("-");
            invocation.stdin = Some(request.prompt.to_string());
        } else {
            invocation = invocation.arg(request.prompt);
        }
        invocation
    }
}

impl Provider for CodexProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn invoke(
        &self,
        request: &ProviderRequest<'_>,
        sink: Option<&mut dyn TextSink>,
    ) -> Result<ProviderReply, ProcessFailure> {
        run_stream(&self.build(request), decode, request.session_id, sink)
    }
}
