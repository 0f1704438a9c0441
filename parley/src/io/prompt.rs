//! Turn prompt rendering.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::agents::AgentProfile;
use crate::core::envelope::{Envelope, schema_version};
use crate::core::history::clip;
use crate::core::schema::output_schema;
use crate::core::types::ResponseMode;
use crate::core::validator::ValidationFailure;

const TURN_TEMPLATE: &str = include_str!("prompts/turn.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Previous output quoted back in a repair prompt is clipped to this.
pub const REPAIR_PREVIOUS_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
struct AgentContext<'a> {
    id: &'a str,
    display_name: &'a str,
    mission: &'a str,
}

impl<'a> AgentContext<'a> {
    fn from_profile(profile: &'a AgentProfile) -> Self {
        Self {
            id: &profile.id,
            display_name: &profile.display_name,
            mission: profile.mission.trim(),
        }
    }
}

/// A rejected attempt to quote back to the agent.
#[derive(Debug, Clone, Copy)]
pub struct Repair<'a> {
    /// 1-indexed attempt that was rejected.
    pub attempt: u32,
    pub failure: &'a ValidationFailure,
    pub previous_output: &'a str,
}

#[derive(Debug, Clone)]
pub struct TurnPromptInputs<'a> {
    pub agent: &'a AgentProfile,
    pub peers: Vec<&'a AgentProfile>,
    pub task: &'a Envelope,
    pub workdir: &'a Path,
    pub turn: u32,
    pub rounds: u32,
    pub history: &'a str,
    pub peer_question: Option<&'a str>,
    pub read_only: bool,
    pub repair: Option<Repair<'a>>,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("turn", TURN_TEMPLATE)
            .expect("turn template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }

    fn render_turn(&self, input: &TurnPromptInputs<'_>) -> Result<String> {
        let kind = input.agent.output;
        let task = serde_json::to_string_pretty(input.task).context("serialize task envelope")?;
        let schema =
            serde_json::to_string_pretty(&output_schema(kind)).context("serialize schema")?;
        let peers: Vec<AgentContext<'_>> = input
            .peers
            .iter()
            .map(|peer| AgentContext::from_profile(peer))
            .collect();
        let template = self.env.get_template("turn")?;
        let rendered = template.render(context! {
            agent => AgentContext::from_profile(input.agent),
            peers => peers,
            turn => input.turn,
            rounds => input.rounds,
            task => task,
            workdir => input.workdir.display().to_string(),
            execute => input.agent.response_mode == ResponseMode::Execute,
            read_only => input.read_only,
            history => input.history.trim(),
            peer_question => input.peer_question.map(str::trim).filter(|q| !q.is_empty()),
            kind => kind.as_str(),
            schema_version => schema_version(kind),
            schema => schema,
        })?;
        Ok(rendered)
    }

    fn render_repair(&self, repair: &Repair<'_>) -> Result<String> {
        let previous = repair.previous_output.trim();
        let truncated = previous.chars().count() > REPAIR_PREVIOUS_CHARS;
        let template = self.env.get_template("repair")?;
        let rendered = template.render(context! {
            attempt => repair.attempt,
            errors => repair.failure.render(),
            previous => clip(previous, REPAIR_PREVIOUS_CHARS),
            truncated => truncated,
        })?;
        Ok(rendered)
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Render the prompt for one attempt of one turn.
pub fn build_turn_prompt(input: &TurnPromptInputs<'_>) -> Result<String> {
    let mut prompt = ENGINE.render_turn(input).context("render turn prompt")?;
    if let Some(repair) = &input.repair {
        prompt.push_str(&ENGINE.render_repair(repair).context("render repair prompt")?);
    }
    debug!(
        agent = %input.agent.id,
        turn = input.turn,
        repair = input.repair.is_some(),
        chars = prompt.len(),
        "built turn prompt"
    );
    Ok(prompt)
}

/// Where rendered prompts are copied for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDump {
    Stderr,
    /// One file per attempt: `<run>-t<turn>-a<attempt>-<agent>.txt`.
    Dir(PathBuf),
}

impl PromptDump {
    /// `-` means stderr; anything else is a directory.
    pub fn parse(target: &Path) -> Self {
        if target == Path::new("-") {
            PromptDump::Stderr
        } else {
            PromptDump::Dir(target.to_path_buf())
        }
    }

    pub fn write(
        &self,
        run_id: &str,
        turn: u32,
        attempt: u32,
        agent: &str,
        prompt: &str,
    ) -> Result<()> {
        match self {
            PromptDump::Stderr => {
                let mut stderr = std::io::stderr().lock();
                writeln!(stderr, "===== prompt turn={turn} attempt={attempt} agent={agent} =====")
                    .and_then(|()| writeln!(stderr, "{prompt}"))
                    .context("write prompt to stderr")
            }
            PromptDump::Dir(dir) => {
                fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
                let agent: String = agent
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                    .collect();
                let path = dir.join(format!("{run_id}-t{turn:02}-a{attempt}-{agent}.txt"));
                fs::write(&path, prompt).with_context(|| format!("write {}", path.display()))?;
                debug!(path = %path.display(), "dumped prompt");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agents::ORCHESTRATOR_ID;
    use crate::core::envelope::Stamp;
    use crate::core::types::OutputKind;
    use crate::core::validator::validate;
    use crate::test_support::two_agent_roster;

    fn task(request: &str) -> Envelope {
        let roster = two_agent_roster();
        Envelope::task(
            &roster,
            Stamp::now(),
            "run-1",
            ORCHESTRATOR_ID,
            "builder",
            request,
        )
        .expect("task envelope")
    }

    #[test]
    fn turn_prompt_carries_task_history_and_contract() {
        let roster = two_agent_roster();
        let builder = roster.get("builder").expect("builder");
        let reviewer = roster.get("reviewer").expect("reviewer");
        let task = task("Add a --version flag");
        let prompt = build_turn_prompt(&TurnPromptInputs {
            agent: builder,
            peers: vec![reviewer],
            task: &task,
            workdir: Path::new("/srv/app"),
            turn: 1,
            rounds: 2,
            history: "(no history)",
            peer_question: Some("Which crate owns the CLI?"),
            read_only: true,
            repair: None,
        })
        .expect("prompt");

        assert!(prompt.contains("Add a --version flag"));
        assert!(prompt.contains("/srv/app"));
        assert!(prompt.contains("(no history)"));
        assert!(prompt.contains("Which crate owns the CLI?"));
        assert!(prompt.contains("read-only operations only"));
        assert!(prompt.contains("@reviewer"));
        assert!(prompt.contains("parley.delivery.v1"));
        assert!(!prompt.contains("rejected (attempt"));
    }

    #[test]
    fn repair_section_lists_issues_and_clips_previous_output() {
        let roster = two_agent_roster();
        let reviewer = roster.get("reviewer").expect("reviewer");
        let task = task("Review it");
        let previous = format!("{{\"junk\": \"{}\"}}", "y".repeat(3000));
        let failure = validate(&previous, OutputKind::Review).unwrap_err();
        let prompt = build_turn_prompt(&TurnPromptInputs {
            agent: reviewer,
            peers: Vec::new(),
            task: &task,
            workdir: Path::new("/srv/app"),
            turn: 2,
            rounds: 2,
            history: "LATEST_DELIVERY={}",
            peer_question: None,
            read_only: false,
            repair: Some(Repair {
                attempt: 1,
                failure: &failure,
                previous_output: &previous,
            }),
        })
        .expect("prompt");

        assert!(prompt.contains("rejected (attempt 1)"));
        assert!(prompt.contains("E_SCHEMA_"));
        assert!(prompt.contains("(truncated)"));
        assert!(!prompt.contains(&"y".repeat(2001)));
        assert!(prompt.contains("at least 2 entries"));
    }

    #[test]
    fn dump_target_dash_is_stderr() {
        assert_eq!(PromptDump::parse(Path::new("-")), PromptDump::Stderr);
        assert_eq!(
            PromptDump::parse(Path::new("out/prompts")),
            PromptDump::Dir(PathBuf::from("out/prompts"))
        );
    }

    #[test]
    fn dumped_file_names_are_sanitized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dump = PromptDump::Dir(temp.path().join("p"));
        dump.write("r1", 3, 2, "code reviewer/x", "hello")
            .expect("dump");
        let path = temp.path().join("p/r1-t03-a2-code_reviewer_x.txt");
        assert_eq!(fs::read_to_string(path).expect("read"), "hello");
    }
}
