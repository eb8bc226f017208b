#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for bridging a POP3/SMTP account and managing the sealed vault

use anyhow::Context;
use clap::{Parser, Subcommand};
use mail_bridge::{
    AccountCredentials, BridgeConfig, CredentialsSource, Envelope, InMemoryCredentials,
    MailBridge, Message, MessageSummary, OutgoingMessage, RequestContext, SendResult, Service,
    VaultKey, VaultStorage as _,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailbridge-cli")]
#[command(about = "Bridge a legacy POP3/SMTP account and manage its sealed vault")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// JSON file of accounts; defaults to `POP3_*` / `SMTP_*` variables
    #[arg(long, global = true)]
    accounts: Option<PathBuf>,

    /// Account to operate on
    #[arg(long, global = true, default_value = "default")]
    account: String,

    /// Overall deadline for the operation, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Seal a secret read from stdin, for use as an account secret
    Seal,

    /// List messages in the mailbox
    List,

    /// Show a single message by ordinal
    Show {
        /// Message ordinal (1-based)
        ordinal: u32,

        /// Only fetch headers and this many body lines
        #[arg(long)]
        lines: Option<u32>,
    },

    /// Send a message; the body is read from stdin
    Send {
        #[arg(long)]
        from: String,

        /// Recipient (repeatable)
        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long, default_value = "")]
        subject: String,
    },

    /// Fetch a message and store it sealed in the vault
    Archive {
        /// Message ordinal (1-based)
        ordinal: u32,
    },

    /// Manage sealed vault entries
    Vault {
        #[command(subcommand)]
        action: VaultCommand,
    },
}

#[derive(Subcommand)]
enum VaultCommand {
    /// Seal stdin and store it under KEY
    Put { key: VaultKey },
    /// Open and print the entry under KEY
    Get { key: VaultKey },
    /// Open and print an archived message
    Message { key: VaultKey },
    /// List keys, optionally below PREFIX
    List { prefix: Option<VaultKey> },
    /// Remove the entry under KEY
    Delete { key: VaultKey },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = BridgeConfig::from_env()?;
    let ctx = request_context(&args);

    match &args.command {
        Command::Seal => {
            let secret = read_stdin()?;
            let blob = Envelope::new(&config.key).seal_str(secret.trim_end_matches(['\r', '\n']))?;
            println!("{blob}");
        }
        Command::List => cmd_list(&open_bridge(&args, &config).await?, &args, &ctx).await?,
        Command::Show { ordinal, lines } => {
            let bridge = open_bridge(&args, &config).await?;
            cmd_show(&bridge, &args, &ctx, *ordinal, *lines).await?;
        }
        Command::Send { from, to, subject } => {
            let body = read_stdin()?;
            let message = OutgoingMessage::new(from, to.clone(), subject, body);
            let bridge = open_bridge(&args, &config).await?;
            cmd_send(&bridge, &args, &ctx, &message).await?;
        }
        Command::Archive { ordinal } => {
            let bridge = open_bridge(&args, &config).await?;
            let key = bridge.archive_message(&args.account, *ordinal, &ctx).await?;
            println!("{key}");
        }
        Command::Vault { action } => {
            cmd_vault(&open_bridge(&args, &config).await?, &args, action).await?;
        }
    }

    Ok(())
}

async fn open_bridge(args: &Args, config: &BridgeConfig) -> anyhow::Result<MailBridge> {
    let credentials = load_credentials(args)?;
    Ok(MailBridge::from_config(config, credentials).await?)
}

fn read_stdin() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read stdin")?;
    Ok(input)
}

/// Accounts from `--accounts`, or a single `default` account built from
/// `POP3_*` and `SMTP_*` variables (either may be absent).
fn load_credentials(args: &Args) -> anyhow::Result<Arc<dyn CredentialsSource>> {
    if let Some(path) = &args.accounts {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(Arc::new(InMemoryCredentials::from_json(&json)?));
    }

    let mut credentials = InMemoryCredentials::new();
    for (service, prefix, port) in [(Service::Pop3, "POP3", 110), (Service::Smtp, "SMTP", 587)] {
        match AccountCredentials::from_env(prefix, port) {
            Ok(account) => credentials.insert(args.account.clone(), service, account),
            Err(e) => tracing::debug!("No {} account configured: {}", service, e),
        }
    }
    Ok(Arc::new(credentials))
}

/// Deadline from `--timeout`; Ctrl-C cancels the operation.
fn request_context(args: &Args) -> RequestContext {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let ctx = RequestContext::new().with_cancel(cancel);
    match args.timeout {
        Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
        None => ctx,
    }
}

async fn cmd_list(bridge: &MailBridge, args: &Args, ctx: &RequestContext) -> anyhow::Result<()> {
    let messages = bridge.list_messages(&args.account, ctx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        print_summary_table(&messages);
    }

    Ok(())
}

async fn cmd_show(
    bridge: &MailBridge,
    args: &Args,
    ctx: &RequestContext,
    ordinal: u32,
    lines: Option<u32>,
) -> anyhow::Result<()> {
    let message = match lines {
        Some(lines) => bridge.fetch_headers(&args.account, ordinal, lines, ctx).await?,
        None => bridge.fetch_message(&args.account, ordinal, ctx).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&message)?);
    } else {
        print_message_detail(&message);
    }

    Ok(())
}

async fn cmd_send(
    bridge: &MailBridge,
    args: &Args,
    ctx: &RequestContext,
    message: &OutgoingMessage,
) -> anyhow::Result<()> {
    let result = bridge.send(&args.account, message, ctx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_send_result(&result);
    }

    Ok(())
}

async fn cmd_vault(bridge: &MailBridge, args: &Args, action: &VaultCommand) -> anyhow::Result<()> {
    match action {
        VaultCommand::Put { key } => {
            let value = read_stdin()?;
            bridge.store_secret(key, value.trim_end_matches(['\r', '\n'])).await?;
            println!("Stored {key}");
        }
        VaultCommand::Get { key } => {
            let secret = bridge.load_secret(key).await?;
            println!("{}", secret.as_str());
        }
        VaultCommand::Message { key } => {
            let message = bridge.load_archived(key).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&message)?);
            } else {
                print_message_detail(&message);
            }
        }
        VaultCommand::List { prefix } => {
            let keys = bridge.vault().list(prefix.as_ref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                for key in &keys {
                    println!("{key}");
                }
            }
        }
        VaultCommand::Delete { key } => {
            bridge.vault().delete(key).await?;
            println!("Deleted {key}");
        }
    }
    Ok(())
}

fn print_summary_table(messages: &[MessageSummary]) {
    if messages.is_empty() {
        println!("No messages found.");
        return;
    }

    println!("{:<8} {:<12} UID", "#", "Size");
    println!("{}", "-".repeat(60));

    for message in messages {
        println!(
            "{:<8} {:<12} {}",
            message.ordinal,
            message.size,
            message.uid.as_deref().unwrap_or("-"),
        );
    }

    println!("\n{} message(s)", messages.len());
}

fn print_message_detail(message: &Message) {
    for name in ["Date", "From", "To", "Cc", "Subject", "Message-ID"] {
        if let Some(value) = message.header(name) {
            println!("{:<9}{}", format!("{name}:"), truncate(&value, 200));
        }
    }
    println!("\n--- Body ---\n");
    println!("{}", String::from_utf8_lossy(message.body()));
}

fn print_send_result(result: &SendResult) {
    for recipient in &result.recipients {
        println!(
            "{:<9}{} ({} {})",
            if recipient.accepted { "accepted" } else { "rejected" },
            recipient.address,
            recipient.code,
            recipient.reply,
        );
    }
    println!(
        "\n{} accepted, {} rejected: {}",
        result.accepted_count(),
        result.rejected_count(),
        result.reply
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
