#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for running adaptive IMAP syncs against an account

use clap::{Parser, Subcommand};
use imap_adsync::{
    Account, Connector, ImapConnector, MailboxNode, SyncConfig, SyncEvent, SyncSession,
    SyncSessionState, SyncState, build_tree,
};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adsync-cli")]
#[command(about = "Adaptive IMAP mailbox synchronization")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Sync state file, read before and written after a sync
    #[arg(long, global = true, default_value = "adsync-state.json")]
    state: PathBuf,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Download all syncable mailboxes
    Sync {
        /// Download quota in bytes (default: keep the saved one)
        #[arg(long)]
        quota: Option<u64>,

        /// Sync one mailbox at a time
        #[arg(long)]
        no_parallel: bool,

        /// Keep the fetch window size fixed
        #[arg(long)]
        no_block_size_optimizer: bool,

        /// Ignore CONDSTORE/QRESYNC mod-sequences
        #[arg(long)]
        no_qresync: bool,

        /// Initial number of messages per fetch window
        #[arg(long)]
        block_size: Option<u32>,
    },

    /// Show the mailbox tree of the account
    Folders,

    /// Summarize the saved sync state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Sync {
            quota,
            no_parallel,
            no_block_size_optimizer,
            no_qresync,
            block_size,
        } => {
            let mut config = SyncConfig::from_env()?;
            config.parallel_processes_optimizer &= !no_parallel;
            config.block_size_optimizer &= !no_block_size_optimizer;
            config.qresync &= !no_qresync;
            if let Some(block_size) = block_size {
                config.initial_block_size = *block_size;
            }
            cmd_sync(&args, config, *quota).await?;
        }
        Command::Folders => {
            cmd_folders(&args).await?;
        }
        Command::Status => {
            cmd_status(&args)?;
        }
    }

    Ok(())
}

fn load_state(path: &Path) -> anyhow::Result<Option<SyncState>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    Ok(Some(SyncState::from_json(&json)?))
}

/// Write the state without credentials.
fn save_state(path: &Path, mut state: SyncState) -> anyhow::Result<()> {
    state.account.password = None;
    state.account.access_token = None;
    std::fs::write(path, state.to_json()?)?;
    Ok(())
}

async fn cmd_sync(args: &Args, config: SyncConfig, quota: Option<u64>) -> anyhow::Result<()> {
    let account = Account::from_env()?;
    let mut state = match load_state(&args.state)? {
        Some(saved) => SyncState {
            account,
            ..saved
        },
        None => SyncState::new(account, u64::MAX),
    };
    if let Some(quota) = quota {
        state.max_quota = quota;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = SyncSession::new(tx, config);
    session.start(state)?;

    let outcome = {
        let join = session.join();
        tokio::pin!(join);
        loop {
            tokio::select! {
                outcome = &mut join => break outcome?,
                Some(event) = rx.recv() => print_event(&event, args.json)?,
            }
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event, args.json)?;
    }

    if let Some(state) = session.sync_state() {
        save_state(&args.state, state)?;
        info!("Saved sync state to {}", args.state.display());
    }

    match outcome {
        SyncSessionState::Finished => eprintln!("Sync finished."),
        SyncSessionState::Postponed => eprintln!("Sync postponed: download quota nearly used up."),
        other => eprintln!("Sync ended in state {other:?}."),
    }
    Ok(())
}

fn print_event(event: &SyncEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        SyncEvent::Mailbox { kind, mailbox } => println!("{kind:?} mailbox {}", mailbox.path),
        SyncEvent::MailboxStatus(status) => println!(
            "{}: {} messages, UIDVALIDITY {}",
            status.path,
            status
                .message_count
                .map_or_else(|| "?".to_string(), |n| n.to_string()),
            status.uid_validity
        ),
        SyncEvent::Message { kind, message } => println!(
            "{:<8} {:<30} uid {:<8} {} bytes",
            format!("{kind:?}"),
            truncate(&message.mailbox, 28),
            message.uid,
            message.payload_len()
        ),
        SyncEvent::Postponed { resume_at } => {
            println!("Postponed until {}", resume_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        SyncEvent::Finished { downloaded_bytes } => {
            println!("Finished, {downloaded_bytes} bytes downloaded");
        }
        SyncEvent::Error(error) => eprintln!("error: {error}"),
    }
    Ok(())
}

async fn cmd_folders(args: &Args) -> anyhow::Result<()> {
    let account = Account::from_env()?;
    let mut connection = ImapConnector::new().connect(&account).await?;
    let listed = connection.list().await?;
    connection.logout().await?;
    let tree = build_tree(listed);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else {
        for root in &tree {
            print_node(root, 0);
        }
    }
    Ok(())
}

fn print_node(node: &MailboxNode, depth: usize) {
    let mut line = format!("{}{}", "  ".repeat(depth), node.info.name);
    if let Some(special_use) = node.info.special_use {
        line.push_str(&format!(" [{special_use:?}]"));
    }
    if node.info.disabled {
        line.push_str(" (not selectable)");
    }
    println!("{line}");
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn cmd_status(args: &Args) -> anyhow::Result<()> {
    let Some(state) = load_state(&args.state)? else {
        anyhow::bail!("No sync state at {}", args.state.display());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!(
        "{}@{} (quota {} bytes)",
        state.account.username, state.account.host, state.max_quota
    );
    println!("{:<30} {:<12} {:<10} {}", "Mailbox", "UIDVALIDITY", "Imported", "Last UID");
    println!("{}", "-".repeat(70));
    for mailbox in &state.mailboxes {
        println!(
            "{:<30} {:<12} {:<10} {}",
            truncate(&mailbox.path, 28),
            mailbox
                .uid_validity
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            mailbox.imported.len(),
            mailbox
                .max_imported_uid()
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
