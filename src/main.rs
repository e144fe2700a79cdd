#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use vmpilot::backend::{Capabilities, CommandBridge, CommandConnection, CommandDetector, CommandRecognizer, ConnectionKind};
use vmpilot::config::{self, Config};
use vmpilot::session::{JsonAuditSink, SessionReport};
use vmpilot::vision::{FrameId, ObservationNormalizer, RawDetection, RawTextBox};
use vmpilot::{
    FusionEngine, GuiAction, IdentifierField, PatientIdentifiers, ResolutionResult, Resolver, SafetyGate, Session,
    TerminationReason, UnifiedElement, VerificationResult, REPORT_SCHEMA_VERSION,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `vmpilot` - screenshot-driven desktop automation.
#[derive(Parser, Debug)]
#[command(name = "vmpilot")]
#[command(version)]
#[command(about = "Vision fusion, element resolution and verified actions for remote desktops.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (overrides VMPILOT_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fuse recorded detector and recognizer output into unified elements
    #[command(long_about = "\
Fuse recorded model output into unified elements.

The input file holds one capture's raw output:
  {\"detections\": [...], \"texts\": [...]}

Examples:
  vmpilot fuse --input frame.json
  vmpilot fuse --input frame.json --json")]
    Fuse {
        /// Observation file
        #[arg(long)]
        input: PathBuf,
        /// Print a machine-readable JSON report
        #[arg(long)]
        json: bool,
    },

    /// Resolve a natural-language description against recorded observations
    #[command(long_about = "\
Resolve an element description against one recorded capture.

Runs exact text, clickable-type and fuzzy keyword matching in order and \
reports which strategy matched.

Examples:
  vmpilot resolve --input frame.json \"submit button\"")]
    Resolve {
        /// Observation file
        #[arg(long)]
        input: PathBuf,
        /// Element description, e.g. \"patient name field\"
        description: String,
        #[arg(long)]
        json: bool,
    },

    /// Check banner text against expected patient identifiers
    #[command(long_about = "\
Check OCR'd banner text against the expected patient.

The input file is a JSON array of text fragments. At least two of \
name, MRN and date of birth must match. Exits non-zero on failure.

Examples:
  vmpilot check-banner --input banner.json --name \"John Doe\" --mrn 123456 --dob 01/01/1980")]
    CheckBanner {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        mrn: String,
        #[arg(long)]
        dob: String,
        #[arg(long)]
        json: bool,
    },

    /// Run a plan of actions against a live desktop through the command bridge
    #[command(long_about = "\
Run a TOML plan against the configured backend.

The plan may name the expected patient; the banner is checked before the \
first step. Ctrl-C aborts after the action in flight.

Examples:
  vmpilot run --plan intake.toml")]
    Run {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage vmpilot configuration.

Use 'schema' to dump the JSON Schema for config.toml, which documents \
every available key, type, and default value.

Examples:
  vmpilot config init
  vmpilot config show
  vmpilot config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `vmpilot`.

Examples:
  source <(vmpilot completions bash)
  vmpilot completions zsh > ~/.zfunc/_vmpilot")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Dump the full configuration JSON Schema to stdout
    Schema,
    /// Write a default config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Raw output of both models for one capture.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ObservationFile {
    frame_id: u64,
    detections: Vec<RawDetection>,
    texts: Vec<RawTextBox>,
}

#[derive(Debug, Serialize)]
struct FuseReport {
    schema_version: u32,
    report_type: &'static str,
    frame_id: FrameId,
    elements: Vec<UnifiedElement>,
    discarded: Vec<String>,
    filtered: usize,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    schema_version: u32,
    report_type: &'static str,
    #[serde(flatten)]
    result: ResolutionResult,
}

#[derive(Debug, Serialize)]
struct BannerReport {
    schema_version: u32,
    report_type: &'static str,
    passed: bool,
    match_count: usize,
    required: usize,
    matched_fields: Vec<IdentifierField>,
    unmatched_fields: Vec<IdentifierField>,
}

/// A `run` plan: optional patient check followed by actions.
#[derive(Debug, Deserialize)]
struct Plan {
    #[serde(default = "default_agent")]
    agent: String,
    #[serde(default)]
    patient: Option<PatientIdentifiers>,
    #[serde(default)]
    steps: Vec<PlanStep>,
}

fn default_agent() -> String {
    "cli".into()
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    #[serde(flatten)]
    action: GuiAction,
    /// Element or text that should be visible afterwards.
    #[serde(default)]
    expected: String,
    /// Overrides `verifier.max_attempts` for this step.
    #[serde(default)]
    max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StepOutcome {
    index: usize,
    action: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<VerificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    schema_version: u32,
    report_type: &'static str,
    steps: Vec<StepOutcome>,
    session: SessionReport,
}

fn command_requests_machine_json(command: &Commands) -> bool {
    match command {
        Commands::Fuse { json, .. }
        | Commands::Resolve { json, .. }
        | Commands::CheckBanner { json, .. }
        | Commands::Run { json, .. } => *json,
        Commands::Config { config_command } => matches!(config_command, ConfigCommands::Schema),
        Commands::Completions { .. } => true,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize report")?);
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn fuse_file(config: &Config, file: &ObservationFile) -> FuseReport {
    let outcome = ObservationNormalizer::new(config.vision.min_confidence).normalize(
        FrameId(file.frame_id),
        &file.detections,
        &file.texts,
    );
    let elements = FusionEngine::new(&config.vision).fuse(&outcome.observations);
    FuseReport {
        schema_version: REPORT_SCHEMA_VERSION,
        report_type: "fuse",
        frame_id: FrameId(file.frame_id),
        elements,
        discarded: outcome.discarded.iter().map(ToString::to_string).collect(),
        filtered: outcome.filtered,
    }
}

fn check_banner(config: &Config, texts: &[String], expected: &PatientIdentifiers) -> BannerReport {
    let record = SafetyGate::new(&config.safety).evaluate(expected, texts);
    BannerReport {
        schema_version: REPORT_SCHEMA_VERSION,
        report_type: "check_banner",
        passed: record.passed,
        match_count: record.match_count,
        required: record.required,
        matched_fields: record.matched_fields,
        unmatched_fields: record.unmatched_fields,
    }
}

fn build_session(config: &Config) -> Result<Session> {
    let backend = &config.backend;
    let kind = ConnectionKind::parse(&backend.kind)?;
    let connection = CommandConnection::new(
        CommandBridge::new(backend.program.clone(), backend.args.clone()),
        kind,
        backend.target.clone(),
        Capabilities {
            can_scroll: backend.can_scroll,
            can_reconnect: backend.can_reconnect,
        },
    );
    let models = &config.models;
    let detector = CommandDetector::new(CommandBridge::new(
        models.detector_program.clone(),
        models.detector_args.clone(),
    ));
    let recognizer = CommandRecognizer::new(CommandBridge::new(
        models.recognizer_program.clone(),
        models.recognizer_args.clone(),
    ));
    let audit = JsonAuditSink::new(config.audit_dir()?);
    Ok(Session::new(
        config.clone(),
        Box::new(connection),
        Arc::new(detector),
        Arc::new(recognizer),
        Arc::new(audit),
    ))
}

async fn run_plan(config: Config, plan: Plan) -> Result<RunReport> {
    let mut session = build_session(&config)?.with_agent(plan.agent);
    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting after the current action");
            token.cancel();
        }
    });

    let mut steps = Vec::with_capacity(plan.steps.len());
    let mut halted = false;
    if let Some(patient) = plan.patient.as_ref() {
        if let Err(err) = session.verify_patient(patient).await {
            warn!(error = %err, "patient check did not pass");
            halted = true;
        }
    }

    for (index, step) in plan.steps.into_iter().enumerate() {
        if halted {
            break;
        }
        let summary = step.action.summary();
        info!(step = index, action = %summary, "running step");
        let verified = match step.max_attempts {
            Some(attempts) => {
                session
                    .perform_and_verify_with_attempts(step.action, &step.expected, attempts)
                    .await
            }
            None => session.perform_and_verify(step.action, &step.expected).await,
        };
        match verified {
            Ok(result) => {
                halted = !result.success;
                steps.push(StepOutcome {
                    index,
                    action: summary,
                    success: result.success,
                    verification: Some(result),
                    error: None,
                });
            }
            Err(err) => {
                warn!(step = index, error = %err, fatal = err.is_fatal(), "step failed");
                halted = true;
                steps.push(StepOutcome {
                    index,
                    action: summary,
                    success: false,
                    verification: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let session_report = if session.is_active() {
        session.terminate(TerminationReason::Normal).await?
    } else {
        let reason = match session.state() {
            vmpilot::session::SessionState::Terminated(reason) => reason,
            vmpilot::session::SessionState::Active => TerminationReason::Normal,
        };
        session.report(reason)
    };

    Ok(RunReport {
        schema_version: REPORT_SCHEMA_VERSION,
        report_type: "run",
        steps,
        session: session_report,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var(config::CONFIG_DIR_ENV, config_dir);
    }

    // Completions stay stdout-only: no config, no logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    if !command_requests_machine_json(&cli.command) {
        // Logs go to stderr so stdout stays clean for reports.
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")?;
    }

    if let Commands::Config {
        config_command: ConfigCommands::Init { force },
    } = &cli.command
    {
        let dir = config::config_dir()?;
        let config = Config::init(&dir, *force).await?;
        println!("Wrote {}", config.config_path.display());
        return Ok(());
    }

    let config = Config::load_or_default().await?;

    match cli.command {
        Commands::Fuse { input, json } => {
            let file: ObservationFile = read_json(&input).await?;
            let report = fuse_file(&config, &file);
            if json {
                return print_json(&report);
            }
            println!("Frame {}: {} element(s)", report.frame_id.0, report.elements.len());
            for element in &report.elements {
                let (x, y) = element.click_point();
                println!(
                    "  #{:<3} {:<9} {:<40} conf {:.2} at ({x}, {y})",
                    element.id.0,
                    element.role.as_str(),
                    element.display_name(),
                    element.confidence
                );
            }
            for reason in &report.discarded {
                println!("  discarded: {reason}");
            }
            Ok(())
        }
        Commands::Resolve {
            input,
            description,
            json,
        } => {
            let file: ObservationFile = read_json(&input).await?;
            let elements = fuse_file(&config, &file).elements;
            let result = Resolver::new(&config.vision, &config.resolver).resolve_elements(&description, &elements);
            if json {
                return print_json(&ResolveReport {
                    schema_version: REPORT_SCHEMA_VERSION,
                    report_type: "resolve",
                    result,
                });
            }
            match &result.element {
                Some(element) => println!(
                    "'{}' -> {} via {} (confidence {:.2})",
                    description,
                    element.display_name(),
                    result.strategy_used.as_str(),
                    result.confidence
                ),
                None => println!("'{}' not found", description),
            }
            Ok(())
        }
        Commands::CheckBanner {
            input,
            name,
            mrn,
            dob,
            json,
        } => {
            let texts: Vec<String> = read_json(&input).await?;
            let report = check_banner(&config, &texts, &PatientIdentifiers::new(name, mrn, dob));
            if json {
                print_json(&report)?;
            } else {
                let fields = |f: &[IdentifierField]| f.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ");
                println!(
                    "{} of 3 identifiers matched ({} required): [{}]",
                    report.match_count,
                    report.required,
                    fields(&report.matched_fields)
                );
            }
            if !report.passed {
                bail!("patient banner does not match the expected patient");
            }
            Ok(())
        }
        Commands::Run { plan, json } => {
            let raw = tokio::fs::read_to_string(&plan)
                .await
                .with_context(|| format!("Failed to read {}", plan.display()))?;
            let parsed: Plan = toml::from_str(&raw).with_context(|| format!("Failed to parse {}", plan.display()))?;
            let report = run_plan(config, parsed).await?;
            let failed = report.steps.iter().any(|s| !s.success)
                || report.session.termination_reason != TerminationReason::Normal;
            if json {
                print_json(&report)?;
            } else {
                for step in &report.steps {
                    let status = if step.success { "ok" } else { "FAILED" };
                    println!("[{status}] step {}: {}", step.index, step.action);
                    if let Some(error) = &step.error {
                        println!("        {error}");
                    }
                }
                println!(
                    "Session {} ended: {}",
                    report.session.session_id, report.session.termination_reason
                );
            }
            if failed {
                bail!("plan did not complete");
            }
            Ok(())
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let raw = toml::to_string_pretty(&config).context("Failed to serialize config")?;
                println!("# {}", config.config_path.display());
                print!("{raw}");
                Ok(())
            }
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                print_json(&schema)
            }
            ConfigCommands::Init { .. } => Ok(()),
        },
        Commands::Completions { .. } => Ok(()),
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
