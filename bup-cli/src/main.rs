//! bup-cli - command-line client for bup-server

use anyhow::{bail, Context, Result};
use bup_cli::{logger, Channel, MessageFilter};
use bup_server::models::{Config, RunState};
use bup_server::ws::protocol::{ClientCommand, MessageKind, ServerMessage};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the server
    #[arg(long, default_value = "ws://localhost:1234/ws")]
    url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Seconds to wait for each reply before giving up
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current config
    Config,
    /// Print a backup's status
    Status { id: String },
    /// Run a backup now and follow it to completion
    Run { id: String },
    /// List a backup's revisions, newest first
    Revisions { id: String },
    /// Garbage-collect one backup's repository, or every repository
    Gc { id: Option<String> },
    /// Prune old revisions of one backup, or of every backup
    Prune { id: Option<String> },
    /// Print every message the server sends until the connection closes
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(&args.log_level)?;

    let timeout = args.timeout.map(Duration::from_secs);
    let channel = Channel::connect(&args.url)
        .await
        .with_context(|| format!("Could not connect to {}", args.url))?;

    match args.command {
        Command::Config => {
            let config = fetch_config(&channel, timeout).await?;
            print_json(&config)?;
        }
        Command::Status { id } => {
            let reply = channel
                .request(
                    ClientCommand::GetBackupStatus { id },
                    &[MessageKind::BackupStatus],
                    timeout,
                )
                .await?;
            if let ServerMessage::BackupStatus { status, .. } = reply {
                print_json(&status)?;
            }
        }
        Command::Revisions { id } => {
            let reply = channel
                .request(
                    ClientCommand::GetRevisions { id },
                    &[MessageKind::BackupRevisions],
                    timeout,
                )
                .await?;
            if let ServerMessage::BackupRevisions { revisions, .. } = reply {
                for revision in revisions {
                    println!("{}", revision.to_rfc3339());
                }
            }
        }
        Command::Run { id } => run(&channel, id, timeout).await?,
        Command::Gc { id } => maintain(&channel, id, false, timeout).await?,
        Command::Prune { id } => maintain(&channel, id, true, timeout).await?,
        Command::Watch => {
            let mut subscription = channel.subscribe(MessageFilter::any());
            while let Some(message) = subscription.recv().await {
                println!("{}", serde_json::to_string(&message)?);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn fetch_config(channel: &Channel, timeout: Option<Duration>) -> Result<Config> {
    match channel
        .request(ClientCommand::GetConfig, &[MessageKind::Config], timeout)
        .await?
    {
        ServerMessage::Config { config } => Ok(config),
        other => bail!("Unexpected reply: {:?}", other.kind()),
    }
}

/// Prints each status transition of the run until its revisions arrive.
async fn run(channel: &Channel, id: String, timeout: Option<Duration>) -> Result<()> {
    let correlation = Channel::new_correlation();
    let token = correlation.token().unwrap_or_default().to_string();
    let mut subscription = channel.subscribe(
        MessageFilter::kinds([
            MessageKind::BackupStatus,
            MessageKind::BackupRevisions,
            MessageKind::ClientError,
        ])
        .correlated(token),
    );

    channel.send(ClientCommand::RunNow { id: id.clone() }, &correlation)?;

    let mut last_state = None;
    loop {
        match subscription.next(timeout).await?.message {
            ServerMessage::BackupStatus { id: status_id, status } if status_id == id => {
                if last_state != Some(status.status) {
                    println!("{}", serde_json::to_string(&status.status)?);
                    last_state = Some(status.status);
                }
            }
            ServerMessage::BackupRevisions { revisions, .. } => {
                if let Some(latest) = revisions.first() {
                    println!("Latest revision: {}", latest.to_rfc3339());
                }
                return Ok(());
            }
            ServerMessage::ClientError { error } => bail!("{}", error),
            _ => {}
        }
    }
}

/// Sends gc or prune and waits until every targeted backup has settled.
///
/// A backup is done once a correlated status for it leaves `working`, or
/// once the server reports it as already executing.
async fn maintain(
    channel: &Channel,
    id: Option<String>,
    prune: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let config = fetch_config(channel, timeout).await?;
    let mut pending: HashMap<String, String> = config
        .backups
        .iter()
        .filter(|b| id.as_deref().map_or(true, |id| b.id == id))
        .map(|b| (b.id.clone(), b.name.clone()))
        .collect();
    if let Some(id) = &id {
        if pending.is_empty() {
            bail!("Backup with id {} does not exist", id);
        }
    }

    let correlation = Channel::new_correlation();
    let token = correlation.token().unwrap_or_default().to_string();
    let mut subscription = channel.subscribe(
        MessageFilter::kinds([MessageKind::BackupStatus, MessageKind::ClientError])
            .correlated(token),
    );

    let all = id.is_none();
    let command = if prune {
        ClientCommand::Prune { id, all }
    } else {
        ClientCommand::Gc { id, all }
    };
    channel.send(command, &correlation)?;

    let mut failures = 0usize;
    while !pending.is_empty() {
        match subscription.next(timeout).await?.message {
            ServerMessage::BackupStatus { id, status } => {
                if status.status != RunState::Working {
                    if let Some(name) = pending.remove(&id) {
                        println!("{}: done", name);
                    }
                }
            }
            ServerMessage::ClientError { error } => {
                eprintln!("{}", error);
                failures += 1;
                if let Some(name) = error.strip_prefix("Backup is already currently executing: ") {
                    pending.retain(|_, pending_name| pending_name != name);
                } else if !error.starts_with("Failed to ") {
                    bail!("{}", error);
                }
            }
            _ => {}
        }
    }

    if failures > 0 {
        bail!("{} backup(s) reported errors", failures);
    }
    Ok(())
}
