//! Capsule CLI.
//!
//! Exit codes: 0 run completed (denied steps included), 2 any tool error,
//! 3 unrecoverable error, 4 replay hash mismatch, 5 run not found.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use capsule_policy::PolicyEngine;
use capsule_protocol::{Plan, Policy, RunId, canon};
use capsule_runtime::{
    AgentConfig, AgentRunner, AgentStatus, PlanRunner, PlanRunnerConfig, ReplayEngine,
    ReplayError, ScriptedPlanner, build_report,
};
use capsule_store::{AuditStore, StoreError};
use capsule_tools::ToolRegistry;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "capsule")]
#[command(version)]
#[command(about = "Run tool-call plans and agent tasks under a deny-by-default policy", long_about = None)]
struct Cli {
    /// Path to the audit database
    #[arg(long, global = true, default_value = "capsule.db")]
    db: PathBuf,

    /// Verbose logs and full error cause chains
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a YAML plan under a YAML policy
    Run {
        /// Plan file
        plan: PathBuf,

        /// Policy file
        #[arg(long)]
        policy: PathBuf,

        /// Working directory the policy is anchored to
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Print the canonical JSON report instead of the plain digest
        #[arg(long)]
        json: bool,

        /// Keep executing after a denied or failed step
        #[arg(long)]
        no_fail_fast: bool,
    },

    /// Reproduce a recorded run from stored artifacts
    Replay {
        run_id: String,

        /// Recompute the stored plan hash before replaying
        #[arg(long)]
        verify: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print the report for a run
    Report {
        run_id: String,

        #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
        format: ReportFormat,
    },

    /// List recorded runs
    ListRuns {
        #[arg(long)]
        json: bool,
    },

    /// Show one run record
    ShowRun {
        run_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Agent mode
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Debug, Subcommand)]
enum AgentCommands {
    /// Drive the propose-evaluate-execute-learn loop for a task
    Run {
        task: String,

        /// Policy file
        #[arg(long)]
        policy: PathBuf,

        /// Scripted-proposal JSON file driving the planner. Language-model
        /// planners live outside this binary, behind the same interface.
        #[arg(long)]
        planner: Option<PathBuf>,

        #[arg(long, default_value_t = 10)]
        max_iterations: u32,

        /// Working directory the policy is anchored to
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Console,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .compact()
        .init();

    let verbose = cli.verbose;
    let code = dispatch(cli).await.unwrap_or_else(|err| {
        report_error(&err, verbose);
        3
    });
    std::process::exit(code);
}

fn report_error(err: &anyhow::Error, verbose: bool) {
    if let Some(code) = error_code(err) {
        eprintln!("error[{code}]: {err}");
    } else {
        eprintln!("error: {err}");
    }
    if verbose {
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
}

fn error_code(err: &anyhow::Error) -> Option<u16> {
    if let Some(err) = err.downcast_ref::<capsule_protocol::PlanError>() {
        return Some(err.code());
    }
    if let Some(err) = err.downcast_ref::<StoreError>() {
        return Some(err.code());
    }
    if let Some(err) = err.downcast_ref::<ReplayError>() {
        return Some(err.code());
    }
    if let Some(err) = err.downcast_ref::<capsule_runtime::RunnerError>() {
        return Some(err.code());
    }
    None
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            plan,
            policy,
            workdir,
            json,
            no_fail_fast,
        } => run_plan(&cli.db, &plan, &policy, &workdir, json, no_fail_fast).await,
        Commands::Replay {
            run_id,
            verify,
            json,
        } => replay(&cli.db, &run_id, verify, json),
        Commands::Report { run_id, format } => report(&cli.db, &run_id, format),
        Commands::ListRuns { json } => list_runs(&cli.db, json),
        Commands::ShowRun { run_id, json } => show_run(&cli.db, &run_id, json),
        Commands::Agent {
            command:
                AgentCommands::Run {
                    task,
                    policy,
                    planner,
                    max_iterations,
                    workdir,
                    json,
                },
        } => {
            run_agent(
                &cli.db,
                &task,
                &policy,
                planner.as_deref(),
                max_iterations,
                &workdir,
                json,
            )
            .await
        }
    }
}

fn load_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read plan file {}", path.display()))?;
    let plan: Plan = serde_yaml::from_str(&text)
        .with_context(|| format!("cannot parse plan file {}", path.display()))?;
    plan.validate()?;
    Ok(plan)
}

fn load_policy(path: &Path) -> Result<Arc<Policy>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read policy file {}", path.display()))?;
    let policy: Policy = serde_yaml::from_str(&text)
        .with_context(|| format!("cannot parse policy file {}", path.display()))?;
    Ok(Arc::new(policy))
}

fn open_store(db: &Path) -> Result<Arc<AuditStore>> {
    Ok(Arc::new(AuditStore::open(db)?))
}

async fn run_plan(
    db: &Path,
    plan_path: &Path,
    policy_path: &Path,
    workdir: &Path,
    json: bool,
    no_fail_fast: bool,
) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    let policy = load_policy(policy_path)?;
    let store = open_store(db)?;
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    let engine = Arc::new(PolicyEngine::with_system_resolver(policy, workdir));

    let runner = PlanRunner::new(store.clone(), registry, engine).with_config(PlanRunnerConfig {
        fail_fast: !no_fail_fast,
    });
    let outcome = runner.run(&plan).await?;
    info!(run_id = %outcome.run_id, "run finished");

    if json {
        let report = build_report(&store, &outcome.run_id)?;
        println!("{}", canon::to_canonical_json(&report));
    } else {
        print_run_digest(&store, &outcome.run_id)?;
    }

    Ok(if outcome.counters.failed_steps > 0 { 2 } else { 0 })
}

fn replay(db: &Path, run_id: &str, verify: bool, json: bool) -> Result<i32> {
    let store = open_store(db)?;
    let engine = ReplayEngine::new(store.clone());
    match engine.replay(&RunId::from(run_id), verify) {
        Ok(outcome) => {
            if json {
                let report = build_report(&store, &outcome.replay_run_id)?;
                println!("{}", canon::to_canonical_json(&report));
            } else {
                println!(
                    "replay {}: origin {} reproduced ({} steps)",
                    outcome.replay_run_id, outcome.origin_run_id, outcome.counters.total_steps
                );
            }
            Ok(0)
        }
        Err(
            err @ (ReplayError::PlanHashMismatch { .. }
            | ReplayError::InputHashMismatch { .. }
            | ReplayError::OutputHashMismatch { .. }),
        ) => {
            eprintln!("error[{}]: {err}", err.code());
            Ok(4)
        }
        Err(err) => Err(err.into()),
    }
}

fn report(db: &Path, run_id: &str, format: ReportFormat) -> Result<i32> {
    let store = open_store(db)?;
    let report = build_report(&store, &RunId::from(run_id))?;
    match format {
        ReportFormat::Json => println!("{}", canon::to_canonical_json(&report)),
        ReportFormat::Console => print_report_digest(&report),
    }
    Ok(0)
}

fn list_runs(db: &Path, json: bool) -> Result<i32> {
    let store = open_store(db)?;
    let runs = store.list_runs()?;
    if json {
        let rows: Vec<serde_json::Value> = runs
            .iter()
            .map(|run| {
                serde_json::json!({
                    "run_id": run.run_id.as_str(),
                    "mode": run.mode.as_str(),
                    "status": run.status.as_str(),
                    "created_at": run.created_at.to_rfc3339(),
                    "total_steps": run.counters.total_steps,
                })
            })
            .collect();
        println!("{}", canon::to_canonical_json(&serde_json::json!(rows)));
    } else {
        for run in runs {
            println!(
                "{}  {:6}  {:9}  {}  steps={}",
                run.run_id,
                run.mode.as_str(),
                run.status.as_str(),
                run.created_at.to_rfc3339(),
                run.counters.total_steps
            );
        }
    }
    Ok(0)
}

fn show_run(db: &Path, run_id: &str, json: bool) -> Result<i32> {
    let store = open_store(db)?;
    match store.get_run(&RunId::from(run_id)) {
        Ok(run) => {
            if json {
                println!(
                    "{}",
                    canon::to_canonical_json(&serde_json::to_value(&run)?)
                );
            } else {
                println!("run      {}", run.run_id);
                println!("mode     {}", run.mode.as_str());
                println!("status   {}", run.status.as_str());
                println!("created  {}", run.created_at.to_rfc3339());
                if let Some(at) = run.completed_at {
                    println!("finished {}", at.to_rfc3339());
                }
                println!("plan     {}", run.plan_hash);
                println!("policy   {}", run.policy_hash);
                println!(
                    "steps    {} total, {} ok, {} denied, {} failed",
                    run.counters.total_steps,
                    run.counters.completed_steps,
                    run.counters.denied_steps,
                    run.counters.failed_steps
                );
            }
            Ok(0)
        }
        Err(StoreError::RunNotFound(run_id)) => {
            eprintln!("error[5004]: run not found: {run_id}");
            Ok(5)
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_agent(
    db: &Path,
    task: &str,
    policy_path: &Path,
    planner_path: Option<&Path>,
    max_iterations: u32,
    workdir: &Path,
    json: bool,
) -> Result<i32> {
    let policy = load_policy(policy_path)?;
    let store = open_store(db)?;
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    let engine = Arc::new(PolicyEngine::with_system_resolver(policy, workdir));

    let planner = match planner_path {
        Some(path) => ScriptedPlanner::from_file(path)
            .with_context(|| format!("cannot load planner script {}", path.display()))?,
        None => ScriptedPlanner::new(vec![]),
    };

    let runner = AgentRunner::new(store.clone(), registry, engine).with_config(AgentConfig {
        max_iterations,
        ..AgentConfig::default()
    });
    let outcome = runner.run(task, &planner).await?;

    if json {
        let report = build_report(&store, &outcome.run_id)?;
        println!("{}", canon::to_canonical_json(&report));
    } else {
        println!(
            "agent run {}: {} after {} iterations",
            outcome.run_id,
            outcome.status.as_str(),
            outcome.iterations
        );
        if let Some(answer) = &outcome.final_output {
            println!("{answer}");
        }
        for warning in &outcome.warnings {
            println!("warning: {warning}");
        }
    }

    Ok(match outcome.status {
        AgentStatus::Error => 3,
        _ if outcome.counters.failed_steps > 0 => 2,
        _ => 0,
    })
}

fn print_run_digest(store: &AuditStore, run_id: &RunId) -> Result<()> {
    let report = build_report(store, run_id)?;
    print_report_digest(&report);
    Ok(())
}

fn print_report_digest(report: &serde_json::Value) {
    let run = &report["run"];
    let summary = &report["summary"];
    println!(
        "run {}: {} ({} ok, {} denied, {} failed of {})",
        run["run_id"].as_str().unwrap_or("?"),
        run["status"].as_str().unwrap_or("?"),
        summary["completed_steps"],
        summary["denied_steps"],
        summary["failed_steps"],
        summary["total_steps"],
    );
    if let Some(steps) = report["steps"].as_array() {
        for step in steps {
            let mut line = format!(
                "  [{}] {} {}",
                step["step_index"],
                step["tool"].as_str().unwrap_or("?"),
                step["status"].as_str().unwrap_or("recorded"),
            );
            if let Some(reason) = step["decision"]["reason"].as_str()
                && step["status"] == "denied"
            {
                line.push_str(&format!(" ({reason})"));
            }
            if let Some(error) = step["error"].as_str() {
                line.push_str(&format!(" ({error})"));
            }
            println!("{line}");
        }
    }
}
