use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use patchgate::agent::{Agent, CommandAgent, NoopAgent, ReplayAgent};
use patchgate::catalog::TaskCatalog;
use patchgate::config::PatchgateConfig;
use patchgate::error::HarnessError;
use patchgate::fixture::FixtureManager;
use patchgate::model::types::{RefKind, TaskDescriptor};
use patchgate::patch_engine;
use patchgate::runner::EvaluationRunner;
use patchgate::validation::ValidationPipeline;

mod format;
mod telemetry;

use format::OutputFormat;
use telemetry::LogFormat;

/// Exit code for a validation run that found malformed tasks.
const EXIT_MALFORMED: u8 = 2;

/// Grading harness for patch-based coding benchmarks
///
/// Each task names three refs of a repository: the buggy baseline, the
/// reference fix, and the hidden tests. patchgate materializes isolated
/// trees for those refs, layers the hidden tests onto them as a patch, runs
/// the task's test runner (Django or Foundry) and turns the result into a
/// 0.0 / 1.0 reward.
///
/// QUICK START:
///
///   patchgate tasks
///   patchgate validate                       # every task: baseline fails, golden passes
///   patchgate eval fix-profile-404 --agent golden
///   patchgate eval fix-profile-404 --agent-command './my-agent.sh'
#[derive(Parser)]
#[command(name = "patchgate")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'patchgate <command> --help' for more information on a specific command.")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "PATCHGATE_CONFIG", default_value = "patchgate.toml")]
    config: PathBuf,

    /// Log line format on stderr (level via RUST_LOG)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the task catalog
    Tasks {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check that every task's baseline fails and golden passes its hidden tests
    ///
    /// Exits with status 2 when any task is malformed.
    Validate {
        /// Only these tasks (repeatable); default is the whole catalog
        #[arg(long = "task", value_name = "ID")]
        tasks: Vec<String>,

        /// Tasks validated concurrently (default: harness.max_parallel)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Evaluate one agent on one task and print the reward record
    Eval(EvalArgs),

    /// Print the patch between two refs of a task
    Diff {
        /// Task id
        task: String,

        /// Source ref kind (buggy, reference-fix, hidden-test)
        #[arg(long, default_value = "buggy")]
        from: RefKind,

        /// Target ref kind
        #[arg(long, default_value = "hidden-test")]
        to: RefKind,

        /// Print the artifact as JSON (file list, digest, patch text)
        #[arg(long)]
        json: bool,
    },

    /// Materialize one ref of a task and keep the tree, printing its path
    Prepare {
        /// Task id
        task: String,

        /// Ref kind (buggy, reference-fix, hidden-test)
        #[arg(long, default_value = "buggy")]
        kind: RefKind,
    },
}

#[derive(Args)]
struct EvalArgs {
    /// Task id
    task: String,

    #[command(flatten)]
    agent: AgentArgs,

    /// Agent budget in seconds (default: harness.agent_timeout_seconds)
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct AgentArgs {
    /// Built-in agent
    #[arg(long, value_enum)]
    agent: Option<BuiltinAgent>,

    /// Shell command run inside the tree
    #[arg(long, value_name = "CMD")]
    agent_command: Option<String>,

    /// Patch file replayed as the agent's work
    #[arg(long, value_name = "FILE")]
    agent_patch: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BuiltinAgent {
    /// Replays the reference fix
    Golden,
    /// Changes nothing
    Noop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = PatchgateConfig::load(&cli.config).map_err(HarnessError::from)?;
    let catalog = TaskCatalog::from_entries(config.tasks.clone())
        .with_context(|| format!("loading tasks from {}", cli.config.display()))?;

    match cli.command {
        Commands::Tasks { format } => {
            println!("{}", format.render(&Listing(catalog.tasks()))?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { tasks, jobs, format } => {
            let selected = catalog.select(&tasks)?;
            if selected.is_empty() {
                bail!("no tasks to validate in {}", cli.config.display());
            }
            let fixtures = FixtureManager::from_config(&config.harness);
            let jobs = jobs.unwrap_or(config.harness.max_parallel);
            let report = ValidationPipeline::new(&fixtures, &config.graders, jobs).run(&selected);
            println!("{}", format.render(&report)?);
            Ok(if report.all_well_formed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_MALFORMED)
            })
        }
        Commands::Eval(args) => {
            let task = catalog.require(&args.task)?;
            let fixtures = FixtureManager::from_config(&config.harness);
            let agent = build_agent(&args.agent, &fixtures, task)?;
            let timeout = args
                .timeout
                .map_or_else(|| config.harness.agent_timeout(), Duration::from_secs);
            let runner = EvaluationRunner::new(
                &fixtures,
                &config.graders,
                timeout,
                config.harness.on_test_patch_conflict,
            );
            let record = runner.evaluate(task, agent.as_ref());
            println!("{}", args.format.render(&record)?);
            // A scored 0.0 is a valid result; only a missing reward is an error.
            Ok(if record.reward.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Diff {
            task,
            from,
            to,
            json,
        } => {
            let task = catalog.require(&task)?;
            let fixtures = FixtureManager::from_config(&config.harness);
            let patch = patch_engine::diff_refs(&fixtures, task, from, to)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&patch)?);
            } else {
                print!("{}", patch.as_text());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prepare { task, kind } => {
            let task = catalog.require(&task)?;
            let fixtures = FixtureManager::from_config(&config.harness);
            let root = fixtures.prepare(task, kind)?.keep();
            println!("{}", root.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_agent(
    args: &AgentArgs,
    fixtures: &FixtureManager,
    task: &TaskDescriptor,
) -> Result<Box<dyn Agent>> {
    if let Some(cmd) = &args.agent_command {
        return Ok(Box::new(CommandAgent::new(cmd.clone())));
    }
    if let Some(path) = &args.agent_patch {
        return Ok(Box::new(read_patch(path)?));
    }
    match args.agent {
        Some(BuiltinAgent::Golden) => {
            let patch =
                patch_engine::diff_refs(fixtures, task, RefKind::Buggy, RefKind::ReferenceFix)?;
            Ok(Box::new(ReplayAgent::new("golden", patch)))
        }
        Some(BuiltinAgent::Noop) | None => Ok(Box::new(NoopAgent)),
    }
}

fn read_patch(path: &Path) -> Result<ReplayAgent> {
    ReplayAgent::from_file(path).with_context(|| format!("reading patch {}", path.display()))
}

/// Catalog listing for `patchgate tasks`.
#[derive(Serialize)]
#[serde(transparent)]
struct Listing<'a>(&'a [TaskDescriptor]);

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no tasks configured");
        }
        for (i, t) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{:<32} {:<15} {:<12} {}",
                t.id.as_str(),
                t.domain.to_string(),
                t.grader.to_string(),
                t.ref_name(RefKind::Buggy)
            )?;
            if let Some(desc) = &t.description {
                write!(f, "  {desc}")?;
            }
        }
        Ok(())
    }
}
