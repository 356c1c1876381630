//! CLI subcommand handlers.

use anyhow::Context as _;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stagehouse_core::config::{ConfigOverrides, PipelineConfig, WORKSPACE_CONFIG_FILE, config_template, load_config};
use stagehouse_core::connection::{Connection, StaticConnectionRegistry};
use stagehouse_core::pipeline::{PipelineExecutor, PipelineGraph, PipelineRun, RunStatus, StageState};
use stagehouse_core::warehouse::SqlDialect;
use stagehouse_core::{PipelineSchedule, RunStore, SchedulerState};
use stagehouse_operators::{Backends, build_pipeline, ddl_statements, validate};

use crate::{Commands, ConfigAction, DialectArg, RunsAction};

/// Where the command runs and which config file it reads.
pub struct Context {
    pub workspace: PathBuf,
    pub config_path: Option<PathBuf>,
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run { date, timeout, json } => handle_run(ctx, date, timeout, json).await,
        Commands::Schedule {
            once,
            schedule,
            catchup,
        } => handle_schedule(ctx, once, schedule, catchup).await,
        Commands::Graph => handle_graph(ctx).map(|_| ExitCode::SUCCESS),
        Commands::Ddl { dialect } => handle_ddl(ctx, dialect).map(|_| ExitCode::SUCCESS),
        Commands::Runs { action } => handle_runs(ctx, action).map(|_| ExitCode::SUCCESS),
        Commands::Config { action } => handle_config(ctx, action).map(|_| ExitCode::SUCCESS),
    }
}

fn load(ctx: &Context, overrides: Option<&ConfigOverrides>) -> anyhow::Result<PipelineConfig> {
    let config = load_config(Some(&ctx.workspace), ctx.config_path.as_deref(), overrides)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    validate(&config).map_err(|e| anyhow::anyhow!("Invalid pipeline: {}", e))?;
    Ok(config)
}

/// Backends resolved from config plus `STAGEHOUSE_CONN_*` variables.
fn open_backends(ctx: &Context, config: &PipelineConfig) -> anyhow::Result<Backends> {
    let registry = StaticConnectionRegistry::from_config(&config.connections)
        .with_env_vars(std::env::vars())
        .context("Failed to read connections from the environment")?;
    Ok(Backends::open(config, Arc::new(registry), &ctx.workspace)?)
}

/// Backends that touch nothing on disk, for commands that only inspect.
fn inspection_backends(config: &PipelineConfig) -> anyhow::Result<Backends> {
    let mut connections = config.connections.clone();
    connections.insert(
        config.object_store_conn_id.clone(),
        Connection::new(&config.object_store_conn_id, "memory"),
    );
    connections.insert(
        config.warehouse_conn_id.clone(),
        Connection::new(&config.warehouse_conn_id, "sqlite").with_host(":memory:"),
    );
    let registry = StaticConnectionRegistry::from_config(&connections);
    Ok(Backends::open(config, Arc::new(registry), Path::new("."))?)
}

fn executor(config: &PipelineConfig) -> PipelineExecutor {
    PipelineExecutor::new()
        .with_run_timeout(config.run_timeout_secs.map(Duration::from_secs))
        .with_max_active_stages(config.max_active_stages)
}

/// Logical date of the most recent interval that has closed.
fn default_logical_date(config: &PipelineConfig) -> NaiveDate {
    let now = Utc::now();
    PipelineSchedule::parse(&config.schedule)
        .ok()
        .and_then(|schedule| {
            schedule
                .due_ticks(None, now, false, None)
                .last()
                .map(|tick| schedule.logical_date_for(*tick))
        })
        .unwrap_or_else(|| (now - ChronoDuration::days(1)).date_naive())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
}

/// 0 when the run succeeded, 1 otherwise.
fn exit_status(status: RunStatus) -> u8 {
    match status {
        RunStatus::Succeeded => 0,
        _ => 1,
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    ExitCode::from(exit_status(status))
}

async fn handle_run(
    ctx: &Context,
    date: Option<NaiveDate>,
    timeout: Option<u64>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let overrides = ConfigOverrides {
        run_timeout_secs: timeout,
        ..Default::default()
    };
    let config = load(ctx, Some(&overrides))?;
    let backends = open_backends(ctx, &config)?;
    let graph = build_pipeline(&config, &backends)?;
    let logical_date = date.unwrap_or_else(|| default_logical_date(&config));

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let run = executor(&config).run(&graph, logical_date, cancel).await;

    let store = RunStore::new(&config.state_dir_in(&ctx.workspace));
    let path = store.save(&run)?;
    info!(path = %path.display(), "Run recorded");

    if json {
        println!("{}", run.to_json()?);
    } else {
        print!("{}", render_run(&run));
    }
    Ok(exit_code(run.status))
}

async fn handle_schedule(
    ctx: &Context,
    once: bool,
    schedule: Option<String>,
    catchup: bool,
) -> anyhow::Result<ExitCode> {
    let overrides = ConfigOverrides {
        schedule,
        catchup: catchup.then_some(true),
        ..Default::default()
    };
    let config = load(ctx, Some(&overrides))?;
    let schedule = PipelineSchedule::parse(&config.schedule)?;
    let backends = open_backends(ctx, &config)?;
    let graph = build_pipeline(&config, &backends)?;
    let executor = executor(&config);
    let state_dir = config.state_dir_in(&ctx.workspace);
    let store = RunStore::new(&state_dir);
    let mut state = SchedulerState::load(&state_dir, &config.name);

    let shutdown = CancellationToken::new();
    cancel_on_interrupt(shutdown.clone());
    info!(
        pipeline = %config.name,
        schedule = schedule.expression(),
        catchup = config.catchup,
        "Scheduler started"
    );

    let mut last_status = None;
    loop {
        let ticks = schedule.due_ticks(state.last_tick, Utc::now(), config.catchup, config.start_date);
        for tick in ticks {
            if shutdown.is_cancelled() {
                break;
            }
            let logical_date = schedule.logical_date_for(tick);
            info!(tick = %tick, logical_date = %logical_date, "Starting scheduled run");
            let run = executor.run(&graph, logical_date, shutdown.child_token()).await;
            store.save(&run)?;
            println!("{}", run.headline());
            if shutdown.is_cancelled() {
                // The interrupted interval runs again next time.
                return Ok(ExitCode::from(130));
            }
            state.record(tick, &run);
            state.save(&state_dir)?;
            last_status = Some(run.status);
        }

        if once || shutdown.is_cancelled() {
            break;
        }
        let now = Utc::now();
        let Some(next) = schedule.next_after(now) else {
            warn!("Schedule has no further ticks");
            break;
        };
        info!(next = %next, "Waiting for next tick");
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    Ok(match last_status {
        Some(status) if once => exit_code(status),
        _ => ExitCode::SUCCESS,
    })
}

fn handle_graph(ctx: &Context) -> anyhow::Result<()> {
    let config = load(ctx, None)?;
    let graph = build_pipeline(&config, &inspection_backends(&config)?)?;
    print!("{}", render_graph(&graph));
    Ok(())
}

fn handle_ddl(ctx: &Context, dialect: DialectArg) -> anyhow::Result<()> {
    let config = load(ctx, None)?;
    let dialect = match dialect {
        DialectArg::Redshift => SqlDialect::Redshift,
        DialectArg::Sqlite => SqlDialect::Sqlite,
    };
    for statement in ddl_statements(&config, dialect)? {
        println!("{statement};\n");
    }
    Ok(())
}

fn handle_runs(ctx: &Context, action: RunsAction) -> anyhow::Result<()> {
    let config = load(ctx, None)?;
    let store = RunStore::new(&config.state_dir_in(&ctx.workspace));
    match action {
        RunsAction::List { limit, json } => {
            let runs = store.list()?;
            let rows: Vec<RunRow> = runs.iter().take(limit).map(RunRow::from).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No runs recorded in {}", store.dir().display());
            } else {
                for row in &rows {
                    println!("{row}");
                }
            }
        }
        RunsAction::Show { run_id, json } => {
            let run = store.load(&run_id)?;
            if json {
                println!("{}", run.to_json()?);
            } else {
                print!("{}", render_run(&run));
            }
        }
    }
    Ok(())
}

fn handle_config(ctx: &Context, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = ctx
                .config_path
                .clone()
                .unwrap_or_else(|| ctx.workspace.join(WORKSPACE_CONFIG_FILE));
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_path, config_template()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(&ctx.workspace), ctx.config_path.as_deref(), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// One line per stored run in `runs list`.
#[derive(Debug, Serialize)]
struct RunRow {
    run_id: String,
    logical_date: NaiveDate,
    status: RunStatus,
    started_at: String,
    duration_secs: Option<i64>,
    stages_succeeded: usize,
    stages_total: usize,
}

impl From<&PipelineRun> for RunRow {
    fn from(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id.to_string(),
            logical_date: run.logical_date,
            status: run.status,
            started_at: run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            duration_secs: run.finished_at.map(|f| (f - run.started_at).num_seconds()),
            stages_succeeded: run.metrics.stages_succeeded,
            stages_total: run.metrics.stages_total,
        }
    }
}

impl std::fmt::Display for RunRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let duration = self
            .duration_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}  {}  {:<9}  {}  {:>6}  {}/{}",
            &self.run_id[..8.min(self.run_id.len())],
            self.logical_date,
            self.status.to_string(),
            self.started_at,
            duration,
            self.stages_succeeded,
            self.stages_total
        )
    }
}

fn state_label(state: StageState) -> &'static str {
    match state {
        StageState::Pending => "pending",
        StageState::Running => "running",
        StageState::Retrying => "retrying",
        StageState::Succeeded => "ok",
        StageState::Failed => "FAILED",
        StageState::UpstreamFailed => "upstream_failed",
        StageState::Cancelled => "cancelled",
    }
}

/// Headline followed by one line per stage.
fn render_run(run: &PipelineRun) -> String {
    let mut out = format!("{}\n", run.headline());
    if let Some(reason) = &run.cancel_reason {
        out.push_str(&format!("  cancelled: {reason}\n"));
    }
    for stage in &run.stages {
        let mut line = format!("  {:<16} {}", state_label(stage.state), stage.stage_id);
        if stage.attempts.len() > 1 {
            line.push_str(&format!(" ({} attempts)", stage.attempts.len()));
        }
        if let Some(report) = &stage.report {
            line.push_str(&format!(": {}", report.summary));
        }
        if let Some(error) = &stage.error {
            line.push_str(&format!(": [{}] {}", error.kind, error.message));
            if !error.failing_tables.is_empty() {
                line.push_str(&format!(" (tables: {})", error.failing_tables.join(", ")));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn render_graph(graph: &PipelineGraph) -> String {
    let mut out = format!("{} ({} stages)\n", graph.name(), graph.len());
    for node in graph.nodes() {
        out.push_str(&format!("{} [{}]\n", node.id, node.runnable.kind()));
        if !node.upstream.is_empty() {
            out.push_str(&format!("    after: {}\n", node.upstream.join(", ")));
        }
        out.push_str(&format!("    {}\n", node.runnable.describe()));
    }
    out
}
