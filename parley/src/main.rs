//! Multi-agent turn orchestrator.
//!
//! Hands a task to a roster of agent CLIs (`codex`, `claude`, `gemini`) one
//! turn at a time, validates every reply against its schema, and routes the
//! conversation between agents until the configured rounds run out.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;

use parley::core::schema::output_schema;
use parley::core::types::{OutputKind, ProviderKind};
use parley::core::validator::validate;
use parley::exit_codes;
use parley::io::audit::{JsonlAudit, MultiAudit, TracingAudit};
use parley::io::config::{Overrides, load_config, resolve};
use parley::io::interrupt;
use parley::io::prompt::PromptDump;
use parley::io::session_store::{Scope, SessionStore};
use parley::logging;
use parley::orchestrator::{Orchestrator, RunReport, RunState};
use parley::providers::ProviderSet;

#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Process-governed multi-agent turn orchestrator"
)]
struct Cli {
    /// Directory holding `parley.toml` / `parley.local.toml`.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// More diagnostics on stderr (`-v` info, `-vv` debug, `-vvv` trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task through the agent roster.
    Run(RunArgs),
    /// Validate one agent message from FILE (or stdin).
    Check {
        #[arg(long)]
        kind: OutputKind,
        file: Option<PathBuf>,
    },
    /// Print the JSON Schema for an output kind.
    Schema {
        #[arg(long)]
        kind: OutputKind,
    },
    /// Inspect or clear stored provider sessions.
    Sessions {
        /// Session file; defaults to `run.session_file` from config.
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Task text; read from stdin when omitted.
    task: Option<String>,
    #[arg(long)]
    rounds: Option<u32>,
    /// Agent id, display name, or alias that takes the first turn.
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Timeout tier (`quick`, `standard`, `complex`, or a custom tier).
    #[arg(long)]
    timeout_level: Option<String>,
    #[arg(long)]
    read_only: bool,
    /// Start fresh provider sessions and store none.
    #[arg(long)]
    no_session: bool,
    /// Do not echo agent text to stderr while it streams.
    #[arg(long)]
    no_stream: bool,
    #[arg(long)]
    session_file: Option<PathBuf>,
    /// Append structured run events to this JSONL file.
    #[arg(long)]
    audit_log: Option<PathBuf>,
    /// Render the first turn's prompt and exit without calling any agent.
    #[arg(long)]
    dry_run: bool,
    /// Copy every rendered prompt into DIR (`-` for stderr).
    #[arg(long, value_name = "DIR")]
    dump_prompts: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List every stored session.
    List,
    /// Print the session id for one scope and provider.
    Get {
        #[arg(long, default_value = "global")]
        scope: Scope,
        #[arg(long)]
        provider: ProviderKind,
    },
    /// Forget the session for one scope and provider.
    Clear {
        #[arg(long, default_value = "global")]
        scope: Scope,
        #[arg(long)]
        provider: ProviderKind,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    // Nothing we spawned may outlive us.
    interrupt::reap_all();
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&cli.config_dir, args),
        Command::Check { kind, file } => cmd_check(kind, file.as_deref()),
        Command::Schema { kind } => cmd_schema(kind),
        Command::Sessions { file, action } => cmd_sessions(&cli.config_dir, file, action),
    }
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) if path != Path::new("-") => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
        }
        _ => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("read stdin")?;
            Ok(text)
        }
    }
}

fn cmd_run(config_dir: &Path, args: RunArgs) -> Result<i32> {
    let task = match args.task {
        Some(task) => task,
        None => read_input(None)?,
    };
    if task.trim().is_empty() {
        bail!("task is empty");
    }

    let cfg = load_config(config_dir)?;
    let overrides = Overrides {
        rounds: args.rounds,
        start_agent: args.start,
        workdir: args.workdir,
        timeout_level: args.timeout_level,
        read_only: args.read_only.then_some(true),
        use_session: args.no_session.then_some(false),
        stream: args.no_stream.then_some(false),
        session_file: args.session_file,
        audit_log: args.audit_log,
    };
    let base_dir = std::env::current_dir().context("resolve current directory")?;
    let settings = resolve(&cfg, &overrides, &base_dir)?;

    let interrupts = interrupt::install()?;
    let providers = ProviderSet::standard();
    let sessions = settings.session_file.as_ref().map(SessionStore::new);
    let mut audit = MultiAudit::new().with(TracingAudit);
    if let Some(path) = &settings.audit_log {
        audit = audit.with(JsonlAudit::open(path)?);
    }

    let mut orchestrator = Orchestrator::new(&settings, &providers)
        .with_interrupts(&interrupts)
        .with_dry_run(args.dry_run);
    if let Some(store) = &sessions {
        orchestrator = orchestrator.with_sessions(store);
    }
    if let Some(target) = &args.dump_prompts {
        orchestrator = orchestrator.with_prompt_dump(PromptDump::parse(target));
    }
    let mut stderr = std::io::stderr();
    let mut echo = |fragment: &str| {
        let _ = stderr.write_all(fragment.as_bytes());
        let _ = stderr.flush();
    };
    let report = orchestrator.run(&task, &mut audit, Some(&mut echo))?;
    if report.preview.is_none() {
        eprintln!();
    }

    print_report(&report)?;
    Ok(match report.state {
        RunState::Completed => exit_codes::OK,
        RunState::Cancelled => exit_codes::CANCELLED,
        _ => exit_codes::FAILED,
    })
}

fn print_report(report: &RunReport) -> Result<()> {
    let summary = json!({
        "run_id": report.run_id,
        "state": report.state,
        "turns": report.transcript,
        "routes": report.routes,
        "error": report.failure.as_ref().map(|err| json!({
            "reason": err.reason(),
            "message": err.to_string(),
        })),
        "diagnostic": report.diagnostic,
    });
    let summary = match &report.preview {
        Some(preview) => {
            let mut summary = summary;
            summary["dry_run"] = json!(preview);
            summary
        }
        None => summary,
    };
    let payload = serde_json::to_string_pretty(&summary).context("serialize run report")?;
    println!("{payload}");
    Ok(())
}

fn cmd_check(kind: OutputKind, file: Option<&Path>) -> Result<i32> {
    let raw = read_input(file)?;
    match validate(&raw, kind) {
        Ok(_) => {
            println!("ok");
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            let payload = serde_json::to_string_pretty(&json!({
                "kind": kind,
                "issues": failure.issues,
            }))
            .context("serialize issues")?;
            println!("{payload}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_schema(kind: OutputKind) -> Result<i32> {
    let payload =
        serde_json::to_string_pretty(&output_schema(kind)).context("serialize schema")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_sessions(config_dir: &Path, file: Option<PathBuf>, action: SessionAction) -> Result<i32> {
    let path = match file {
        Some(path) => path,
        None => {
            let cfg = load_config(config_dir)?;
            let path = cfg.run.session_file;
            if path.is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .context("resolve current directory")?
                    .join(path)
            }
        }
    };
    let store = SessionStore::new(path);
    match action {
        SessionAction::List => {
            for entry in store.entries() {
                let updated = entry
                    .updated_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.scope, entry.provider, entry.session_id, updated
                );
            }
            Ok(exit_codes::OK)
        }
        SessionAction::Get { scope, provider } => match store.get(&scope, provider) {
            Some(session_id) => {
                println!("{session_id}");
                Ok(exit_codes::OK)
            }
            None => Err(anyhow!("no session for {scope}:{provider}")),
        },
        SessionAction::Clear { scope, provider } => {
            let removed = store.clear(&scope, provider)?;
            println!("{}", if removed { "cleared" } else { "absent" });
            Ok(exit_codes::OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "parley",
            "run",
            "add a health check",
            "--rounds",
            "3",
            "--start",
            "qa",
            "--read-only",
            "--no-session",
            "--dry-run",
            "--dump-prompts",
            "-",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.task.as_deref(), Some("add a health check"));
        assert_eq!(args.rounds, Some(3));
        assert_eq!(args.start.as_deref(), Some("qa"));
        assert!(args.read_only);
        assert!(args.no_session);
        assert!(!args.no_stream);
        assert!(args.dry_run);
        assert_eq!(args.dump_prompts, Some(PathBuf::from("-")));
    }

    #[test]
    fn parse_check_kind() {
        let cli = Cli::parse_from(["parley", "-vv", "check", "--kind", "review", "reply.json"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Check {
                kind: OutputKind::Review,
                file: Some(_)
            }
        ));
    }

    #[test]
    fn parse_sessions_get_with_scope() {
        let cli = Cli::parse_from([
            "parley",
            "sessions",
            "get",
            "--scope",
            "agent/builder",
            "--provider",
            "codex",
        ]);
        let Command::Sessions {
            action: SessionAction::Get { scope, provider },
            ..
        } = cli.command
        else {
            panic!("expected sessions get");
        };
        assert_eq!(scope, Scope::Agent("builder".to_string()));
        assert_eq!(provider, ProviderKind::Codex);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["parley", "schema", "--kind", "essay"]).is_err());
    }
}
