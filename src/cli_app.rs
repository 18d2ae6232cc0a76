//! Top-level CLI definition and dispatch.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use colored::Colorize;
use log::LevelFilter;

use crate::aggregator::JsonlSink;
use crate::arbitration::RemoteJudgment;
use crate::collector::{Collector, RawUnit};
use crate::core::config::Config;
use crate::core::errors::{CfnError, Result};
use crate::core::evidence::{EvidenceSnapshot, Verdict, VerdictStatus};
use crate::daemon::loop_main;
use crate::daemon::signals::SignalFlags;
use crate::gate::EscalationGate;
use crate::logger::jsonl::{tail, verify_chain};
use crate::monitor::telemetry::FunnelCounters;
use crate::pipeline::Funnel;
use crate::policy::{RuleSet, evaluate, explain};

/// Content funnel: local evidence gating, bounded remote arbitration, and
/// auditable rule-based moderation decisions.
#[derive(Debug, Parser)]
#[command(name = "cfn", version, about)]
pub struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c', global = true, env = "CFN_CONFIG")]
    pub config: Option<PathBuf>,

    /// More diagnostics on stderr (-v info, -vv debug, -vvv trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decide every unit in a JSON-lines file (or stdin) and print decisions.
    Classify {
        /// Input file; `-` or omitted reads stdin.
        #[arg(long, short = 'i')]
        input: Option<PathBuf>,
    },
    /// Run the streaming daemon on stdin (SIGHUP reloads rules).
    Daemon,
    /// Validate and inspect rule documents.
    #[command(subcommand)]
    Rules(RulesCommand),
    /// Inspect the audit trail.
    #[command(subcommand)]
    Audit(AuditCommand),
    /// Show configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// `cfn rules ...`
#[derive(Debug, Subcommand)]
pub enum RulesCommand {
    /// Parse and compile a rule document without installing it.
    Check { path: PathBuf },
    /// Show which rules match one unit, in evaluation order.
    Explain(ExplainArgs),
}

/// Arguments of `cfn rules explain`.
#[derive(Debug, Args)]
pub struct ExplainArgs {
    /// Rule document.
    pub rules: PathBuf,
    /// One unit of detector output (JSON).
    pub unit: PathBuf,
    /// Remote judgment to assume (JSON `{categories, rationale}`).
    #[arg(long, conflicts_with = "degraded")]
    pub verdict: Option<PathBuf>,
    /// Assume arbitration failed with this status.
    #[arg(long, value_enum)]
    pub degraded: Option<DegradedStatus>,
    /// Emit JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Failure statuses `rules explain` can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DegradedStatus {
    Timeout,
    Error,
    CircuitOpen,
}

impl From<DegradedStatus> for VerdictStatus {
    fn from(value: DegradedStatus) -> Self {
        match value {
            DegradedStatus::Timeout => Self::Timeout,
            DegradedStatus::Error => Self::Error,
            DegradedStatus::CircuitOpen => Self::CircuitOpen,
        }
    }
}

/// `cfn audit ...`
#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// Re-walk the hash chain and report the first broken link.
    Verify {
        /// Audit file; defaults to `audit.path` from config.
        path: Option<PathBuf>,
    },
    /// Print the last records.
    Tail {
        path: Option<PathBuf>,
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
        #[arg(long)]
        json: bool,
    },
}

/// `cfn config ...`
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (file + env overrides) as TOML.
    Show,
}

/// Dispatch CLI commands.
///
/// # Errors
/// Returns an error if the subcommand fails.
pub fn run(cli: &Cli) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let default_level = match (&cli.command, cli.verbose) {
        (_, 3..) => LevelFilter::Trace,
        (_, 2) => LevelFilter::Debug,
        (Command::Daemon, _) | (_, 1) => LevelFilter::Info,
        _ => LevelFilter::Warn,
    };
    crate::logger::init(default_level)?;

    match &cli.command {
        Command::Classify { input } => classify(cli, input.as_deref())?,
        Command::Daemon => daemon(cli)?,
        Command::Rules(RulesCommand::Check { path }) => rules_check(path)?,
        Command::Rules(RulesCommand::Explain(args)) => rules_explain(cli, args)?,
        Command::Audit(AuditCommand::Verify { path }) => {
            let path = audit_path(cli, path.as_deref())?;
            let report = verify_chain(&path)?;
            println!(
                "{} {}: {} record(s), head {}",
                "ok".green().bold(),
                path.display(),
                report.records,
                report.last_hash
            );
        }
        Command::Audit(AuditCommand::Tail { path, lines, json }) => {
            let path = audit_path(cli, path.as_deref())?;
            let mut out = io::stdout().lock();
            for record in tail(&path, *lines)? {
                if *json {
                    writeln!(out, "{}", serde_json::to_string(&record)?)?;
                } else {
                    let d = &record.decision;
                    writeln!(
                        out,
                        "{:>6}  {}  {:<5}  {:<28}  {:<24}  gen {}",
                        record.seq,
                        d.decided_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                        d.action,
                        d.unit_id,
                        d.matched_rule_id,
                        d.policy_generation
                    )?;
                }
            }
        }
        Command::Config(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            print!("{}", config.to_toml_string()?);
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "cfn", &mut io::stdout());
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load_or_default(cli.config.as_deref())
}

fn audit_path(cli: &Cli, explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(load_config(cli)?.audit.path),
    }
}

fn classify(cli: &Cli, input: Option<&Path>) -> Result<()> {
    let config = load_config(cli)?;
    let funnel = Funnel::from_config(&config, Arc::new(JsonlSink::new(io::stdout())))?;
    let reader: Box<dyn BufRead> = match input {
        Some(p) if p != Path::new("-") => {
            Box::new(BufReader::new(File::open(p).map_err(|e| CfnError::io(p, e))?))
        }
        _ => Box::new(io::stdin().lock()),
    };
    let mut failures = 0u32;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CfnError::io(input.unwrap_or(Path::new("<stdin>")), e))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = funnel.process_json(&line, &format!("input-line-{}", idx + 1)) {
            log::error!("{e}");
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(CfnError::Runtime {
            details: format!("{failures} unit(s) were not acknowledged"),
        });
    }
    Ok(())
}

fn daemon(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let signals = SignalFlags::install()?;
    let funnel = Arc::new(Funnel::from_config(&config, Arc::new(JsonlSink::new(io::stdout())))?);
    let stdin = BufReader::new(io::stdin());
    let report = loop_main::run(funnel, stdin, &config.pipeline, &signals)?;
    if report.failed > 0 {
        return Err(CfnError::Runtime {
            details: format!("{} unit(s) were not acknowledged", report.failed),
        });
    }
    Ok(())
}

fn rules_check(path: &Path) -> Result<()> {
    let set = RuleSet::load(path)?;
    println!(
        "{} {} version {} ({} rules, fingerprint {})",
        "valid".green().bold(),
        path.display(),
        set.version(),
        set.len(),
        &set.fingerprint()[..12]
    );
    for rule in set.rules() {
        let id = if rule.is_builtin() {
            rule.id.dimmed()
        } else {
            rule.id.normal()
        };
        let priority = if rule.is_builtin() {
            "-".to_string()
        } else {
            rule.priority.to_string()
        };
        println!(
            "  {priority:>6}  {id:<28}  {:<5} sev {:>3}{}  {}",
            rule.action,
            rule.severity,
            if rule.short_circuit { " !" } else { "  " },
            rule.when
        );
    }
    Ok(())
}

fn rules_explain(cli: &Cli, args: &ExplainArgs) -> Result<()> {
    let config = load_config(cli)?;
    let rules = RuleSet::load(&args.rules)?;
    let raw = std::fs::read_to_string(&args.unit).map_err(|e| CfnError::io(&args.unit, e))?;
    let unit: RawUnit = serde_json::from_str(&raw)?;

    let counters = FunnelCounters::shared();
    let set = Collector::from_config(&config.collector, Arc::clone(&counters)).collect(unit);
    let gate = EscalationGate::from_config(&config.gate, counters);
    let assessment = gate.decide(&set);
    let verdict = match (&args.verdict, args.degraded) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path).map_err(|e| CfnError::io(path, e))?;
            let judgment: RemoteJudgment = serde_json::from_str(&raw)?;
            Some(Verdict::success(judgment.categories, judgment.rationale, 0, 1))
        }
        (None, Some(status)) => Some(Verdict::failed(status.into(), "simulated", 0, 0)),
        (None, None) => None,
    };
    let evidence = EvidenceSnapshot::new(
        Arc::new(set),
        verdict.map(Arc::new),
        assessment.band,
        assessment.outcome,
    );
    let traces = explain(&evidence, &rules);
    let decision = evaluate(evidence, &rules);

    if args.json {
        let doc = serde_json::json!({ "rules": traces, "decision": decision });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }
    println!(
        "band {} / gate {} / tier {:?}",
        decision.evidence.band,
        serde_json::to_string(&decision.evidence.gate)?,
        decision.tier
    );
    for t in &traces {
        let mark = if t.skipped {
            "skip".dimmed()
        } else if t.matched {
            "hit".green().bold()
        } else {
            "miss".normal()
        };
        println!("  {mark:<4}  {:<28}  {:<5}  {}", t.id, t.action, t.when);
    }
    println!(
        "=> {} by {} (severity {})",
        decision.action.to_string().bold(),
        decision.matched_rule_id,
        decision.severity
    );
    Ok(())
}
