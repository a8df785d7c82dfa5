//! Execution Tracker CLI
//!
//! Starts workflow executions on a remote server and follows their event
//! stream from the terminal. When a run pauses for human input, the operator
//! is prompted on stdin and the answer is sent back as a resume (or cancel).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dotenv::dotenv;
use execution_tracker::{
    DispatchOutcome, ExecutionStatus, HitlSession, HttpControlClient, NodeStatus, StreamEvent,
    TrackerConfig, WebSocketEventSource, WorkflowTracker,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "execution-tracker")]
#[command(about = "Execution Tracker CLI - Start and follow remote workflow executions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, env = "TRACKER_CONFIG")]
    config: Option<PathBuf>,

    /// Workflow server URL, overrides the configuration
    #[arg(long, env = "TRACKER_SERVER_URL")]
    server_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an execution and follow it until it finishes
    Run {
        /// Query that triggers the workflow
        query: String,

        /// Data source to run the query against
        #[arg(long)]
        data_source: Option<String>,
    },

    /// Follow every execution event for this client session
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut config = TrackerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }

    let client_id = Uuid::new_v4().to_string();
    let transport = HttpControlClient::from_config(&config)?.with_client_id(&client_id);
    let source = WebSocketEventSource::from_config(&config, &client_id)?;
    let mut tracker = WorkflowTracker::new(config, Arc::new(transport)).with_client_id(&client_id);

    info!("🔗 Client session {}", client_id);
    tracker.dispatcher_mut().connecting();
    let frames = source.connect().await.map_err(|e| {
        tracker.dispatcher_mut().fail(&e);
        e
    })?;

    let result = match cli.command {
        Commands::Run { query, data_source } => {
            run_execution(&mut tracker, frames, &query, data_source).await
        }
        Commands::Watch => watch(&mut tracker, frames).await,
    };

    print_summary(&tracker);
    tracker.dispose();
    result
}

/// Start one execution and follow the stream until it is terminal
async fn run_execution(
    tracker: &mut WorkflowTracker,
    mut frames: execution_tracker::transport::FrameStream,
    query: &str,
    data_source: Option<String>,
) -> Result<()> {
    tracker.dispatcher_mut().connected();
    let execution_id = tracker.start_execution(query, data_source).await?;
    println!("{} {}", "▶ Started".green().bold(), execution_id);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracker.dispatcher_mut().fail(&e);
                return Err(e.into());
            }
        };

        let outcome = match StreamEvent::from_frame(&frame) {
            Ok(event) => {
                let outcome = tracker.handle_event(&event);
                print_event(&event, &outcome);
                outcome
            }
            Err(_) => tracker.handle_frame(&frame),
        };

        if let DispatchOutcome::HitlOpened(_) = outcome {
            if let Some(session) = tracker.hitl().session(&execution_id).cloned() {
                decide(tracker, &session, &mut stdin).await?;
            }
        }

        let finished = tracker
            .registry()
            .execution(&execution_id)
            .map_or(false, |execution| execution.is_terminal());
        if finished {
            break;
        }
    }

    tracker.dispatcher_mut().disconnected();
    Ok(())
}

async fn watch(
    tracker: &mut WorkflowTracker,
    frames: execution_tracker::transport::FrameStream,
) -> Result<()> {
    println!("{}", "👀 Watching execution events (Ctrl-C to stop)".cyan());
    tracker
        .run(frames, |event, outcome| {
            if let Some(event) = event {
                print_event(event, outcome);
            }
        })
        .await?;
    Ok(())
}

/// Prompt the operator for a resume value, or cancel
async fn decide(
    tracker: &mut WorkflowTracker,
    session: &HitlSession,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    let primary = tracker.hitl().schema().primary_field().to_string();
    let current = session
        .parameters
        .get(&primary)
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string();

    loop {
        println!(
            "{} {} at node {}",
            "⏸ Awaiting decision:".yellow().bold(),
            session.mode,
            session.node_name
        );
        println!("  {} = {}", primary, current);
        println!("  Enter a new value, an empty line to keep it, or 'cancel'");

        let Some(line) = stdin.next_line().await? else {
            warn!("stdin closed, leaving session {} open", session.execution_id);
            return Ok(());
        };
        let line = line.trim();

        let result = if line.eq_ignore_ascii_case("cancel") {
            tracker.cancel_hitl(&session.execution_id).await
        } else {
            let mut parameters = session.parameters.clone();
            let value = if line.is_empty() { current.as_str() } else { line };
            parameters.insert(primary.clone(), value.into());
            tracker.submit_hitl(&session.execution_id, parameters).await
        };

        match result {
            Ok(()) => {
                println!("{}", "✓ Decision sent".green());
                return Ok(());
            }
            Err(e) if e.is_retryable() || e.kind() == execution_tracker::ErrorKind::Validation => {
                println!("{} {}", "✗".red(), e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_event(event: &StreamEvent, outcome: &DispatchOutcome) {
    if !outcome.is_applied() {
        return;
    }
    match event {
        StreamEvent::ExecutionStarted { execution_id, query, .. } => {
            println!("{} {} ({})", "▶ execution".green(), execution_id, query);
        }
        StreamEvent::NodeStarted { node_id, node_type, .. } => {
            println!("  {} {} [{}]", "● node".blue(), node_id, node_type);
        }
        StreamEvent::NodeCompleted { node_id, .. } => {
            println!("  {} {}", "✓ node".green(), node_id);
        }
        StreamEvent::NodeError { node_id, error, .. } => {
            println!("  {} {}: {}", "✗ node".red(), node_id, error);
        }
        StreamEvent::EdgeActivated { from, to, .. } => {
            println!("  {} {} → {}", "→".dimmed(), from, to);
        }
        StreamEvent::ExecutionCompleted { execution_id, .. } => {
            println!("{} {}", "✓ execution completed".green().bold(), execution_id);
        }
        StreamEvent::ExecutionError { execution_id, error } => {
            println!("{} {}: {}", "✗ execution failed".red().bold(), execution_id, error);
        }
        StreamEvent::ExecutionCancelled { execution_id, .. } => {
            println!("{} {}", "✗ execution cancelled".red().bold(), execution_id);
        }
        StreamEvent::HitlPaused { node_name, .. } | StreamEvent::HitlInterrupted { node_name, .. } => {
            println!("  {} {}", "⏸ waiting at".yellow(), node_name);
        }
    }
}

fn print_summary(tracker: &WorkflowTracker) {
    let stats = tracker.dispatcher().stats();
    println!();
    println!("{}", "Summary".bold());
    println!(
        "  events: {} applied, {} ignored, {} dropped",
        stats.applied, stats.ignored, stats.dropped
    );

    for entry in tracker.registry().history() {
        let status = match entry.status {
            ExecutionStatus::Running => entry.status.as_str().yellow(),
            ExecutionStatus::Completed => entry.status.as_str().green(),
            ExecutionStatus::Error => entry.status.as_str().red(),
        };
        println!("  {} {} {}", entry.id, status, entry.query);

        if let Some(execution) = tracker.registry().execution(&entry.id) {
            let mut nodes: Vec<_> = execution.nodes.values().collect();
            nodes.sort_by_key(|node| node.start_time);
            for node in nodes {
                let marker = match node.status {
                    NodeStatus::Running => "…",
                    NodeStatus::Completed => "✓",
                    NodeStatus::Error => "✗",
                };
                match node.duration {
                    Some(seconds) => println!("    {} {} ({:.2}s)", marker, node.id, seconds),
                    None => println!("    {} {}", marker, node.id),
                }
            }
        }
    }
}
