//! Adapters for external agent CLIs.
//!
//! A [`Provider`] turns a prompt plus an optional session id into one
//! governed child process, decodes its line-delimited JSON stdout and returns
//! the assistant text together with the session id to resume next time.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, instrument};

use crate::core::types::ProviderKind;
use crate::io::config::ProviderSettings;
use crate::io::interrupt::CancelToken;
use crate::io::process::{self, Invocation, ProcessFailure};

pub mod claude;
pub mod codex;
pub mod events;
pub mod gemini;

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;
pub use gemini::GeminiProvider;

use events::{Decoder, TextAccumulator, decode_line};

/// Receives assistant text fragments as they arrive.
pub trait TextSink {
    fn on_text(&mut self, fragment: &str);
}

impl<F: FnMut(&str)> TextSink for F {
    fn on_text(&mut self, fragment: &str) {
        self(fragment);
    }
}

/// One provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest<'a> {
    pub prompt: &'a str,
    /// Session to resume, if any.
    pub session_id: Option<&'a str>,
    pub workdir: &'a Path,
    /// Effective per-agent options (`sandbox`, `permission_mode`, `model`...).
    pub options: &'a BTreeMap<String, String>,
    pub settings: &'a ProviderSettings,
    pub abort: Option<&'a CancelToken>,
}

impl ProviderRequest<'_> {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.option(key).map(str::to_ascii_lowercase).as_deref(),
            Some("true" | "1" | "yes")
        )
    }

    /// Whether the prompt is too large for argv.
    pub fn prompt_via_stdin(&self) -> bool {
        self.prompt.len() > self.settings.stdin_threshold_bytes
    }

    fn invocation(&self, kind: ProviderKind) -> Invocation {
        let mut invocation = Invocation::new(
            kind.as_str(),
            self.settings
                .binary
                .clone()
                .unwrap_or_else(|| kind.as_str().to_string()),
        );
        invocation.cwd = Some(self.workdir.to_path_buf());
        invocation.limits = self.settings.limits;
        invocation.abort = self.abort.cloned();
        invocation
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    pub text: String,
    pub session_id: Option<String>,
    pub elapsed_ms: u64,
    /// Bounded command repr of the call that produced `text`.
    pub command: String,
    pub return_code: Option<i32>,
    pub stderr_tail: Vec<String>,
}

pub trait Provider {
    fn kind(&self) -> ProviderKind;

    fn invoke(
        &self,
        request: &ProviderRequest<'_>,
        sink: Option<&mut dyn TextSink>,
    ) -> Result<ProviderReply, ProcessFailure>;
}

/// Run `invocation` and fold its stdout through `decode`.
#[instrument(skip_all, fields(provider = %invocation.label, resume = resumed.is_some()))]
pub(crate) fn run_stream(
    invocation: &Invocation,
    decode: Decoder,
    resumed: Option<&str>,
    mut sink: Option<&mut dyn TextSink>,
) -> Result<ProviderReply, ProcessFailure> {
    let mut acc = TextAccumulator::new(resumed);
    let result = process::invoke(invocation, &mut |line| {
        for event in decode_line(line, decode) {
            if let Some(fragment) = acc.push(event)
                && let Some(sink) = sink.as_deref_mut()
            {
                sink.on_text(&fragment);
            }
        }
    });
    match result {
        Ok(output) => {
            let (text, session_id) = acc.into_parts();
            debug!(chars = text.len(), session = ?session_id, "provider call finished");
            Ok(ProviderReply {
                text,
                session_id,
                elapsed_ms: output.elapsed.as_millis() as u64,
                command: invocation.command_repr(),
                return_code: Some(output.exit_code),
                stderr_tail: output.stderr_tail,
            })
        }
        Err(failure) => Err(failure.with_session(acc.session_id().map(str::to_string))),
    }
}

/// Providers available to a run, by kind.
pub struct ProviderSet {
    providers: BTreeMap<ProviderKind, Box<dyn Provider>>,
}

impl ProviderSet {
    pub fn empty() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// The real CLI adapters.
    pub fn standard() -> Self {
        Self::empty()
            .with(CodexProvider)
            .with(ClaudeProvider)
            .with(GeminiProvider)
    }

    pub fn with(mut self, provider: impl Provider + 'static) -> Self {
        self.providers.insert(provider.kind(), Box::new(provider));
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&dyn Provider> {
        self.providers.get(&kind).map(|provider| provider.as_ref())
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use crate::core::retry::RetryPolicy;
    use crate::io::config::{DEFAULT_STDIN_THRESHOLD_BYTES, ProviderSettings};
    use crate::io::process::ProcessLimits;

    pub fn settings(binary: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            binary: binary.map(str::to_string),
            limits: ProcessLimits {
                idle_timeout: Duration::from_secs(5),
                max_timeout: Duration::from_secs(10),
                terminate_grace: Duration::from_millis(200),
            },
            retry: RetryPolicy::none(),
            stdin_threshold_bytes: DEFAULT_STDIN_THRESHOLD_BYTES,
        }
    }
}
