#![forbid(unsafe_code)]

//! `agent-relay`: run agents in the foreground or as detached background
//! runners, track their sessions, and watch live event streams.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::GlobalConfig;
use agent_relay::executor::{CommandExecutor, ExecutorHandle, ResumeRequest, RunRequest};
use agent_relay::models::session::{SessionDocument, SessionEntry, SessionStatus};
use agent_relay::orchestrator::coordinator::{execute_run, RunHandle, RunOutcome, RunSpec};
use agent_relay::orchestrator::runner::RunnerMarkers;
use agent_relay::orchestrator::status::{resolve_display_status, stop_session, sweep_abandoned};
use agent_relay::orchestrator::supervisor::{LaunchRequest, ProcessSupervisor};
use agent_relay::persistence::session_store::SessionStore;
use agent_relay::stream::{Handlers, StreamPayload, StreamReconnector, WebSocketConnector};
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Agent run orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an agent with a prompt.
    Run(RunArgs),
    /// List recorded sessions with their live status.
    List,
    /// Signal the processes behind a session and mark it stopped.
    Stop {
        /// Session key as shown by `list`.
        session: String,
    },
    /// Mark stale sessions without live processes as abandoned.
    Sweep,
    /// Print every message from a stream until interrupted.
    Watch {
        /// Stream endpoint (`ws://` or `wss://`).
        url: String,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct RunArgs {
    /// Agent to invoke.
    agent: String,

    /// Prompt handed to the executor.
    prompt: String,

    /// Detach into a background runner.
    #[arg(long)]
    background: bool,

    /// Executor to use instead of the configured default.
    #[arg(long)]
    executor: Option<String>,

    /// File with agent instructions prepended to the prompt.
    #[arg(long)]
    instructions: Option<PathBuf>,

    /// Continue an existing session instead of starting a new one.
    #[arg(long)]
    resume: Option<String>,
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<ExitCode> {
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    let store = SessionStore::new(config.sessions_path(), config.default_executor.clone())
        .with_executors(config.executors.keys());

    match args.command {
        Command::Run(run_args) => match RunnerMarkers::from_env() {
            Some(markers) => run_as_runner(&config, store, run_args, markers).await,
            None if run_args.background => launch_background(&config, &store, &run_args),
            None => run_foreground(&config, store, run_args).await,
        },
        Command::List => {
            list_sessions(&config, &store);
            Ok(ExitCode::SUCCESS)
        }
        Command::Stop { session } => {
            let supervisor = ProcessSupervisor::new(config.background.clone());
            let mut document = store.load();
            let delivered = stop_session(&mut document, &session, &supervisor)?;
            store.save(&document)?;
            if delivered {
                println!("stopped {session}");
            } else {
                println!("{session} has no running process");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep => {
            let supervisor = ProcessSupervisor::new(config.background.clone());
            let mut document = store.load();
            let swept = sweep_abandoned(&mut document, Utc::now(), config.abandoned_after(), &supervisor);
            if !swept.is_empty() {
                store.save(&document)?;
            }
            println!("{} session(s) marked abandoned", swept.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch { url } => watch(&config, url).await,
    }
}

/// Prepared state shared by the foreground, background and runner paths.
struct Prepared {
    executor: Arc<dyn ExecutorHandle>,
    document: SessionDocument,
    key: String,
    prompt: String,
    instructions: Option<String>,
}

fn prepare(config: &GlobalConfig, store: &SessionStore, args: &RunArgs, key: Option<String>) -> Result<Prepared> {
    let executor_name = args
        .executor
        .clone()
        .unwrap_or_else(|| config.default_executor.clone());
    let executor_config = config.executor(&executor_name)?.clone();
    let executor: Arc<dyn ExecutorHandle> = Arc::new(CommandExecutor::new(executor_name, executor_config));

    let instructions = match &args.instructions {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|err| {
            AppError::Io(format!("failed to read instructions {}: {err}", path.display()))
        })?),
        None => None,
    };

    let document = store.load();
    let key = match (key, &args.resume) {
        (Some(key), _) => key,
        (None, Some(resume)) => {
            if !document.sessions.contains_key(resume) {
                return Err(AppError::NotFound(format!("session {resume} not found")));
            }
            resume.clone()
        }
        (None, None) => document.allocate_key(&args.agent, Utc::now()),
    };

    Ok(Prepared {
        executor,
        document,
        key,
        prompt: args.prompt.clone(),
        instructions,
    })
}

fn record_invocation(prepared: &mut Prepared, agent: &str, log_path: &std::path::Path, background: bool) {
    let now = Utc::now();
    let executor_name = prepared.executor.name().to_owned();
    let entry = prepared
        .document
        .sessions
        .entry(prepared.key.clone())
        .or_insert_with(|| SessionEntry::new(agent, prepared.key.as_str(), now));
    entry.executor = Some(executor_name);
    entry.set_last_prompt(&prepared.prompt);
    entry.log_file = Some(log_path.to_path_buf());
    entry.background = Some(background);
    entry.touch();
}

fn build_command(prepared: &Prepared) -> agent_relay::executor::CommandDescriptor {
    let session_id = prepared
        .document
        .sessions
        .get(&prepared.key)
        .and_then(|entry| entry.session_id.clone());
    match session_id {
        Some(session_id) => prepared.executor.build_resume_command(&ResumeRequest {
            session_id: &session_id,
            prompt: &prepared.prompt,
        }),
        None => prepared.executor.build_run_command(&RunRequest {
            instructions: prepared.instructions.as_deref(),
            prompt: &prepared.prompt,
        }),
    }
}

async fn run_foreground(config: &GlobalConfig, store: SessionStore, args: RunArgs) -> Result<ExitCode> {
    let mut prepared = prepare(config, &store, &args, None)?;
    let start_time = Utc::now();
    let log_path = config.log_path_for(&args.agent, start_time.timestamp_millis());
    record_invocation(&mut prepared, &args.agent, &log_path, false);
    let command = build_command(&prepared);

    let spec = RunSpec {
        agent_name: args.agent.clone(),
        session_key: prepared.key.clone(),
        command,
        log_path,
        background: false,
        runner_pid: None,
        start_time,
        default_extraction_delay: config.session_extraction_delay(),
    };
    let handle = execute_run(spec, Arc::clone(&prepared.executor), store, prepared.document).await?;
    let (outcome, interrupted) = wait_or_interrupt(handle).await?;
    Ok(if interrupted {
        ExitCode::from(130)
    } else if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Wait for a run, stopping it on ctrl-c or `SIGTERM`.
///
/// An interrupted run is still awaited so that its `stopped` status, log and
/// summary are written before the process exits.
async fn wait_or_interrupt(handle: RunHandle) -> Result<(RunOutcome, bool)> {
    let interrupt = handle.interrupt_token();
    let wait = handle.wait();
    tokio::pin!(wait);

    tokio::select! {
        outcome = &mut wait => Ok((outcome?, false)),
        () = shutdown_signal() => {
            warn!("interrupted; stopping executor");
            interrupt.cancel();
            Ok((wait.await?, true))
        }
    }
}

fn launch_background(config: &GlobalConfig, store: &SessionStore, args: &RunArgs) -> Result<ExitCode> {
    let mut prepared = prepare(config, store, args, None)?;
    let start_time = Utc::now();
    let log_path = config.log_path_for(&args.agent, start_time.timestamp_millis());
    record_invocation(&mut prepared, &args.agent, &log_path, true);
    if let Some(entry) = prepared.document.sessions.get_mut(&prepared.key) {
        entry.status = SessionStatus::Starting;
        entry.start_time = Some(start_time);
    }
    store.save(&prepared.document)?;

    let target = std::env::current_exe()
        .map_err(|err| AppError::Launch(format!("cannot locate own executable: {err}")))?;
    let launch_args: Vec<String> = std::env::args_os()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    let supervisor = ProcessSupervisor::new(config.background.clone());
    let pid = supervisor.launch(LaunchRequest {
        target: Some(target),
        launch_args,
        start_time: Some(start_time),
        log_path: Some(log_path.clone()),
        session: Some(prepared.key.clone()),
        env: std::collections::HashMap::new(),
    })?;

    let mut document = store.load();
    if let Some(entry) = document.sessions.get_mut(&prepared.key) {
        if entry.runner_pid.is_none() {
            entry.runner_pid = Some(pid);
            store.save(&document)?;
        }
    }

    println!(
        "▸ {} started in background [session {}] (pid {pid})\n  log: {}",
        args.agent,
        prepared.key,
        log_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_as_runner(
    config: &GlobalConfig,
    store: SessionStore,
    args: RunArgs,
    markers: RunnerMarkers,
) -> Result<ExitCode> {
    let key = markers
        .session
        .clone()
        .ok_or_else(|| AppError::Launch("background runner started without a session".into()))?;
    let start_time = markers.start_time.unwrap_or_else(Utc::now);
    let log_path = markers
        .log_path
        .clone()
        .unwrap_or_else(|| config.log_path_for(&args.agent, start_time.timestamp_millis()));
    info!(session = %key, log = %log_path.display(), "background runner started");

    let mut prepared = prepare(config, &store, &args, Some(key))?;
    record_invocation(&mut prepared, &args.agent, &log_path, true);
    let command = build_command(&prepared);

    let spec = RunSpec {
        agent_name: args.agent.clone(),
        session_key: prepared.key.clone(),
        command,
        log_path,
        background: true,
        runner_pid: Some(std::process::id()),
        start_time,
        default_extraction_delay: config.session_extraction_delay(),
    };
    let handle = execute_run(spec, Arc::clone(&prepared.executor), store, prepared.document).await?;
    let (outcome, _) = wait_or_interrupt(handle).await?;
    info!(session = %outcome.session_key, status = %outcome.entry.status, "background runner finished");
    Ok(if outcome.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn list_sessions(config: &GlobalConfig, store: &SessionStore) {
    let supervisor = ProcessSupervisor::new(config.background.clone());
    let document = store.load();
    if document.sessions.is_empty() {
        println!("no sessions recorded");
        return;
    }

    let mut entries: Vec<(&String, &SessionEntry)> = document.sessions.iter().collect();
    entries.sort_by(|a, b| b.1.last_used.cmp(&a.1.last_used));

    println!("{:<32} {:<16} {:<20} {:<10} {}", "SESSION", "AGENT", "STATUS", "EXECUTOR", "LAST USED");
    for (key, entry) in entries {
        let status = resolve_display_status(entry, &supervisor);
        let last_used = entry
            .last_used
            .map_or_else(|| "-".to_owned(), |ts| ts.format("%Y-%m-%d %H:%M").to_string());
        println!(
            "{:<32} {:<16} {:<20} {:<10} {}",
            key,
            entry.agent,
            status.to_string(),
            entry.executor.as_deref().unwrap_or("-"),
            last_used
        );
    }
}

async fn watch(config: &GlobalConfig, url: String) -> Result<ExitCode> {
    let reconnector = StreamReconnector::new(&config.stream, WebSocketConnector::default());
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<AppError>();

    let handlers = Handlers::new(|payload| match payload {
        StreamPayload::Json(value) => println!("{value}"),
        StreamPayload::Raw(text) => println!("{text}"),
    })
    .on_error(move |err| {
        let _ = error_tx.send(err);
    });
    let subscription = reconnector.subscribe(url.clone(), handlers);
    info!(%subscription, %url, "watching stream");

    let code = loop {
        tokio::select! {
            () = shutdown_signal() => break ExitCode::SUCCESS,
            Some(err) = error_rx.recv() => {
                if reconnector.subscription_count() == 0 {
                    error!(%err, "stream watch ended");
                    break ExitCode::FAILURE;
                }
                warn!(%err, "stream error");
            }
        }
    };

    reconnector.close();
    Ok(code)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
