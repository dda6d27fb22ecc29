mod config;
mod plan_support;
mod serve_cmd;
mod setup;

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_core::drift::{self, DesiredState};
use nimbus_core::orchestrator::TaskSpec;
use nimbus_core::rollback::{self, RollbackOptions};
use nimbus_db::models::{DriftReport, Priority, TaskType};
use nimbus_db::pool;
use nimbus_db::queries::tasks::TaskFilters;

use config::NimbusConfig;

#[derive(Parser)]
#[command(name = "nimbus", about = "Infrastructure-automation core engine")]
struct Cli {
    /// Database URL (overrides STATE_SERVICE_URL/NIMBUS_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Hex-encoded internal service token secret (overrides INTERNAL_SERVICE_TOKEN)
    #[arg(long, global = true)]
    token_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a nimbus config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/nimbus")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the nimbus database (requires config file or env vars)
    DbInit,
    /// Task lifecycle operations (spec §4.1)
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Plan inspection and generation (spec §4.2)
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Safety Engine operations (spec §4.4)
    Safety {
        #[command(subcommand)]
        command: SafetyCommands,
    },
    /// Drift Subsystem operations (spec §4.7)
    Drift {
        #[command(subcommand)]
        command: DriftCommands,
    },
    /// Rollback Manager operations (spec §4.6)
    Rollback {
        #[command(subcommand)]
        command: RollbackCommands,
    },
    /// Run the HTTP API surface (spec §6) until interrupted
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 3001)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Submit a new task
    Submit {
        #[arg(value_parser = TaskType::from_str)]
        task_type: TaskType,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        team_id: Option<String>,
        #[arg(long, default_value = "medium", value_parser = Priority::from_str)]
        priority: Priority,
        /// Task context as a JSON object (e.g. '{"provider":"aws","environment":"dev"}')
        #[arg(long, default_value = "{}")]
        context: String,
        /// Run planning/safety/execution to completion after submitting
        #[arg(long)]
        execute: bool,
    },
    /// Show a task's current state
    Status { task_id: Uuid },
    /// List tasks, optionally filtered
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Drive a pending task through planning, safety, and execution
    Execute { task_id: Uuid },
    /// Resume a task from its latest checkpoint
    Resume { task_id: Uuid },
    /// Cancel a task
    Cancel { task_id: Uuid },
    /// Grant approval for a task awaiting one
    Approve { task_id: Uuid, approver_id: String },
    /// Show a task's event log
    Events {
        task_id: Uuid,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Show aggregate statistics across all tasks
    Stats,
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Show a plan's steps and edges
    Show { plan_id: Uuid },
    /// Re-validate a persisted plan
    Validate { plan_id: Uuid },
    /// Re-optimize a persisted plan (does not persist the result)
    Optimize { plan_id: Uuid },
}

#[derive(Subcommand)]
enum SafetyCommands {
    /// List registered safety checks
    Checks,
}

#[derive(Subcommand)]
enum DriftCommands {
    /// Detect drift between desired and actual state
    Detect {
        provider: String,
        scope: String,
        /// Desired state as a JSON object keyed by resource address
        #[arg(long, default_value = "{}")]
        desired: String,
    },
    /// Build (and persist) a remediation plan from a drift report
    Plan { report_id: Uuid },
    /// Detect, build a remediation plan, and run it to completion
    Fix {
        task_id: Uuid,
        provider: String,
        scope: String,
        #[arg(long, default_value = "{}")]
        desired: String,
    },
    /// Show an aggregated compliance summary for a drift report
    Compliance { report_id: Uuid },
}

#[derive(Subcommand)]
enum RollbackCommands {
    /// Run (or preview) a task's rollback
    Run {
        task_id: Uuid,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
    },
    /// Check whether a task can be rolled back
    Check { task_id: Uuid },
    /// List plans with rollback-eligible (succeeded) steps
    States,
    /// Delete checkpoints for tasks finished more than `max_age_hours` ago
    Cleanup {
        #[arg(long, default_value_t = 24 * 30)]
        max_age_hours: i64,
    },
}

fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_dir().join("config.toml");
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let token_secret = config::generate_token_secret();
    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: Some(db_url.to_string()) },
        auth: config::AuthSection { token_secret: Some(token_secret.clone()) },
        capabilities: Vec::new(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `nimbus db-init` to create and migrate the database, then add");
    println!("[[capabilities]] entries for each tool service before `nimbus serve`.");
    Ok(())
}

async fn cmd_db_init(cli_database_url: Option<&str>) -> Result<()> {
    let db_config = match cli_database_url {
        Some(url) => nimbus_db::config::DbConfig::new(url),
        None => nimbus_db::config::DbConfig::from_env(),
    };

    println!("Initializing nimbus database...");
    pool::ensure_database_exists(&db_config).await?;
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("nimbus db-init complete.");
    Ok(())
}

fn parse_json_object(raw: &str, label: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw).with_context(|| format!("{label} is not valid JSON"))?;
    anyhow::ensure!(value.is_object(), "{label} must be a JSON object");
    Ok(value)
}

fn parse_desired_state(raw: &str) -> Result<DesiredState> {
    let value = parse_json_object(raw, "--desired")?;
    let map = value.as_object().expect("checked above");
    Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
            return Ok(());
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
            return Ok(());
        }
        _ => {}
    }

    let nimbus_config = NimbusConfig::resolve(cli.database_url.as_deref(), cli.token_secret.as_deref())?;
    let db_pool = pool::create_pool(&nimbus_config.db_config).await?;
    let engine = setup::build_engine(db_pool.clone(), &nimbus_config).await?;

    let result = run_command(cli.command, &engine, &db_pool).await;
    db_pool.close().await;
    result
}

async fn run_command(command: Commands, engine: &setup::Engine, pool: &sqlx::PgPool) -> Result<()> {
    match command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled before engine construction"),
        Commands::Task { command } => run_task_command(command, engine).await,
        Commands::Plan { command } => run_plan_command(command, pool).await,
        Commands::Safety { command } => run_safety_command(command, engine).await,
        Commands::Drift { command } => run_drift_command(command, engine, pool).await,
        Commands::Rollback { command } => run_rollback_command(command, engine, pool).await,
        Commands::Serve { bind, port } => serve_cmd::run_serve(engine, pool.clone(), &bind, port).await,
    }
}

async fn run_task_command(command: TaskCommands, engine: &setup::Engine) -> Result<()> {
    match command {
        TaskCommands::Submit { task_type, user_id, team_id, priority, context, execute } => {
            let context = parse_json_object(&context, "--context")?;
            let task = engine
                .orchestrator
                .create_task(TaskSpec {
                    task_type,
                    user_id,
                    team_id,
                    priority,
                    context,
                    metadata: serde_json::json!({}),
                })
                .await?;
            println!("Created task {} (status={})", task.id, task.status);

            if execute {
                let task = engine.orchestrator.execute_task(task.id).await?;
                print_json(&task)?;
            } else {
                print_json(&task)?;
            }
            Ok(())
        }
        TaskCommands::Status { task_id } => {
            let task = engine.orchestrator.get_task(task_id).await?;
            print_json(&task)
        }
        TaskCommands::List { status, user_id } => {
            let filters = TaskFilters {
                status: status.as_deref().map(str::parse).transpose().context("invalid --status")?,
                user_id,
                team_id: None,
                task_type: None,
            };
            let tasks = engine.orchestrator.list_tasks(&filters).await?;
            print_json(&tasks)
        }
        TaskCommands::Execute { task_id } => {
            let task = engine.orchestrator.execute_task(task_id).await?;
            print_json(&task)
        }
        TaskCommands::Resume { task_id } => {
            let task = engine.orchestrator.resume_task(task_id).await?;
            print_json(&task)
        }
        TaskCommands::Cancel { task_id } => {
            let cancelled = engine.orchestrator.cancel_task(task_id).await?;
            println!("{}", if cancelled { "cancelled" } else { "already terminal; no-op" });
            Ok(())
        }
        TaskCommands::Approve { task_id, approver_id } => {
            engine.orchestrator.grant_approval(task_id, &approver_id).await?;
            println!("Task {task_id} approved by {approver_id}.");
            Ok(())
        }
        TaskCommands::Events { task_id, limit } => {
            let events = engine.orchestrator.get_task_events(task_id, limit).await?;
            print_json(&events)
        }
        TaskCommands::Stats => {
            let stats = engine.orchestrator.get_statistics().await?;
            print_json(&serde_json::json!({
                "pending": stats.pending,
                "planning": stats.planning,
                "awaiting_approval": stats.awaiting_approval,
                "running": stats.running,
                "succeeded": stats.succeeded,
                "failed": stats.failed,
                "cancelled": stats.cancelled,
                "total": stats.total,
            }))
        }
    }
}

async fn run_plan_command(command: PlanCommands, pool: &sqlx::PgPool) -> Result<()> {
    match command {
        PlanCommands::Show { plan_id } => {
            let plan = nimbus_db::queries::plans::get_plan(pool, plan_id).await?.with_context(|| format!("plan {plan_id} not found"))?;
            let steps = nimbus_db::queries::plans::get_steps_for_plan(pool, plan_id).await?;
            let edges = nimbus_db::queries::plans::get_edges_for_plan(pool, plan_id).await?;
            print_json(&serde_json::json!({"plan": plan, "steps": steps, "edges": edges}))
        }
        PlanCommands::Validate { plan_id } => {
            let generated = plan_support::reconstruct_generated_plan(pool, plan_id).await?;
            let report = nimbus_core::planner::validate_plan(&generated, None);
            print_json(&serde_json::json!({"valid": report.is_valid(), "issues": report.issues.iter().map(|i| serde_json::json!({"step_position": i.step_position, "message": i.message})).collect::<Vec<_>>()}))
        }
        PlanCommands::Optimize { plan_id } => {
            let generated = plan_support::reconstruct_generated_plan(pool, plan_id).await?;
            let task = nimbus_db::queries::tasks::get_task(pool, nimbus_db::queries::plans::get_plan(pool, plan_id).await?.context("plan vanished")?.task_id)
                .await?
                .context("owning task not found")?;
            let optimized = nimbus_core::planner::optimize_plan(&task, generated);
            print_json(&serde_json::json!({
                "estimated_duration_ms": optimized.estimated_duration_ms,
                "risk_score": optimized.risk_score,
                "step_count": optimized.steps.len(),
            }))
        }
    }
}

async fn run_safety_command(command: SafetyCommands, engine: &setup::Engine) -> Result<()> {
    match command {
        SafetyCommands::Checks => {
            let checks: Vec<_> = engine
                .safety
                .all()
                .map(|c| serde_json::json!({"id": c.id, "phase": c.phase, "category": c.category, "severity": c.severity, "requires_approval": c.requires_approval}))
                .collect();
            print_json(&checks)
        }
    }
}

async fn run_drift_command(command: DriftCommands, engine: &setup::Engine, pool: &sqlx::PgPool) -> Result<()> {
    match command {
        DriftCommands::Detect { provider, scope, desired } => {
            let desired = parse_desired_state(&desired)?;
            let report = drift::detect(pool, &engine.registry, &provider, &scope, &desired, CancellationToken::new()).await?;
            print_json(&report)
        }
        DriftCommands::Plan { report_id } => {
            let report = load_report(pool, report_id).await?;
            let generated = drift::create_remediation_plan(Uuid::new_v4(), &report.provider, &report)?;
            print_json(&serde_json::json!({
                "estimated_duration_ms": generated.estimated_duration_ms,
                "risk_score": generated.risk_score,
                "step_count": generated.steps.len(),
                "steps": generated.steps.iter().map(|s| serde_json::json!({"kind": s.kind, "inputs": s.inputs})).collect::<Vec<_>>(),
            }))
        }
        DriftCommands::Fix { task_id, provider, scope, desired } => {
            let desired = parse_desired_state(&desired)?;
            let task = engine.orchestrator.get_task(task_id).await?;
            let report = drift::detect(pool, &engine.registry, &provider, &scope, &desired, CancellationToken::new()).await?;
            let outcome = drift::remediate(pool, &engine.registry, &engine.safety, &task, &provider, &report, CancellationToken::new(), &engine.executor_config).await?;
            print_json(&serde_json::json!({"report_id": report.id, "outcome": format!("{outcome:?}")}))
        }
        DriftCommands::Compliance { report_id } => {
            let report = load_report(pool, report_id).await?;
            let compliance = drift::generate_compliance_report(&report)?;
            print_json(&serde_json::json!({
                "total_items": compliance.total_items,
                "in_sync": compliance.in_sync,
                "changed": compliance.changed,
                "missing": compliance.missing,
                "extra": compliance.extra,
                "critical_count": compliance.critical_count,
                "warning_count": compliance.warning_count,
                "info_count": compliance.info_count,
                "percent_in_sync": compliance.percent_in_sync,
            }))
        }
    }
}

async fn load_report(pool: &sqlx::PgPool, report_id: Uuid) -> Result<DriftReport> {
    nimbus_db::queries::drift_reports::get(pool, report_id).await?.with_context(|| format!("drift report {report_id} not found"))
}

async fn run_rollback_command(command: RollbackCommands, engine: &setup::Engine, pool: &sqlx::PgPool) -> Result<()> {
    match command {
        RollbackCommands::Run { task_id, dry_run, force, targets } => {
            let task = engine.orchestrator.get_task(task_id).await?;
            let plan_id = task.plan_id.context("task has no plan to roll back")?;
            let options = RollbackOptions { force, dry_run, targets };
            let result = rollback::run_rollback(pool, &engine.registry, &engine.safety, &task, plan_id, &options, CancellationToken::new(), &engine.executor_config).await?;
            match result {
                rollback::RollbackResult::Planned(plan) => print_json(&serde_json::json!({"executed": false, "summary": plan.summary})),
                rollback::RollbackResult::Executed { plan, outcome } => print_json(&serde_json::json!({"executed": true, "summary": plan.summary, "outcome": format!("{outcome:?}")})),
            }
        }
        RollbackCommands::Check { task_id } => {
            let task = engine.orchestrator.get_task(task_id).await?;
            let plan_id = task.plan_id.context("task has no plan")?;
            let availability = rollback::can_rollback(pool, plan_id).await?;
            print_json(&serde_json::json!({
                "available": availability.available,
                "reason": availability.reason,
                "succeeded_step_count": availability.succeeded_step_count,
            }))
        }
        RollbackCommands::States => {
            let plan_ids = rollback::list_rollback_states(pool).await?;
            print_json(&plan_ids)
        }
        RollbackCommands::Cleanup { max_age_hours } => {
            let deleted = rollback::cleanup_old_states(pool, chrono::Duration::hours(max_age_hours)).await?;
            println!("Deleted checkpoints for {deleted} terminal task(s).");
            Ok(())
        }
    }
}
