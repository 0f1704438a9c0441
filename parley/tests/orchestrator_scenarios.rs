//! End-to-end runs over scripted providers.

use serde_json::Value;

use parley::core::types::{ProviderKind, TurnOutcome};
use parley::core::validator::ValidationCode;
use parley::io::audit::AuditKind;
use parley::orchestrator::{Orchestrator, RunState};
use parley::providers::ProviderSet;
use parley::test_support::{
    MemoryAudit, ScriptedProvider, reply, run_settings, valid_delivery, valid_review,
};

/// Two agents, two rounds; the reviewer forgets `verification` once and is
/// re-prompted within the same turn.
#[test]
fn reviewer_is_repaired_within_its_turn() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = run_settings(temp.path());

    let mut incomplete = valid_review();
    incomplete
        .as_object_mut()
        .expect("object")
        .remove("verification");
    let builder = ScriptedProvider::new(
        ProviderKind::Codex,
        [reply(&valid_delivery().to_string(), Some("codex-thread"))],
    );
    let reviewer = ScriptedProvider::new(
        ProviderKind::Claude,
        [
            reply(&incomplete.to_string(), Some("claude-session")),
            reply(&valid_review().to_string(), Some("claude-session")),
        ],
    );
    let providers = ProviderSet::empty()
        .with(builder.clone())
        .with(reviewer.clone());
    let mut audit = MemoryAudit::default();

    let report = Orchestrator::new(&settings, &providers)
        .run("Add a --version flag to the CLI", &mut audit, None)
        .expect("run");

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.transcript.len(), 2);
    let [first, second] = report.transcript.as_slice() else {
        panic!("two turns expected");
    };
    assert_eq!((first.index, first.agent.as_str()), (1, "builder"));
    assert_eq!((second.index, second.agent.as_str()), (2, "reviewer"));
    assert_eq!(first.attempts, 1);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.outcome, TurnOutcome::Accepted);
    assert_eq!(
        second.content.as_ref().map(|c| c["acceptance"].clone()),
        Some(Value::from("pass"))
    );

    let calls = reviewer.calls();
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].prompt.contains("rejected (attempt"));
    assert!(calls[1].prompt.contains("rejected (attempt 1)"));
    assert!(calls[1].prompt.contains(ValidationCode::MissingField.as_str()));
    assert!(calls[1].prompt.contains("$.verification"));
    // The repair attempt resumes the session the first attempt opened.
    assert_eq!(calls[1].session_id.as_deref(), Some("claude-session"));

    let rejected: Vec<_> = audit
        .events
        .iter()
        .filter(|event| event.event == AuditKind::ProtocolRejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].turn, Some(2));
    assert_eq!(rejected[0].data["codes"][0], "E_SCHEMA_MISSING_FIELD");
    assert_eq!(audit.count(AuditKind::RouteDecided), 1);
    assert_eq!(audit.count(AuditKind::TurnCompleted), 2);
    assert_eq!(builder.remaining(), 0);
    assert_eq!(reviewer.remaining(), 0);
}

/// Output wrapped in prose or code fences is never repaired locally.
#[test]
fn fenced_output_is_rejected_and_counted_against_the_protocol_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut settings = run_settings(temp.path());
    settings.rounds = 1;
    settings.max_retries = 0;
    let fenced = format!("```json\n{}\n```", valid_delivery());
    let builder = ScriptedProvider::new(ProviderKind::Codex, [reply(&fenced, None)]);
    let providers = ProviderSet::empty()
        .with(builder)
        .with(ScriptedProvider::new(ProviderKind::Claude, []));

    let report = Orchestrator::new(&settings, &providers)
        .run("task", &mut MemoryAudit::default(), None)
        .expect("run");

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.failure.as_ref().map(|err| err.reason()),
        Some("protocol_retry_exceeded")
    );
    assert_eq!(
        report.transcript[0].outcome,
        TurnOutcome::Failed {
            reason: "protocol_retry_exceeded".to_string()
        }
    );
    let diagnostic = report.diagnostic.as_ref().expect("diagnostic");
    assert_eq!(diagnostic.reason, "protocol_retry_exceeded");
    assert_eq!(diagnostic.provider, ProviderKind::Codex);
    assert!(diagnostic.command.starts_with("codex"));
}
