//! mailsync - synchronize the mailboxes of two mail stores

use clap::Parser;
use mailsync_common::config::LoggingConfig;
use mailsync_common::types::{CheckpointMode, IdentityScheme, TraversalOrder};
use mailsync_common::{Config, Error};
use mailsync_core::{run, Invocation, Outcome};
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Synchronize the mailboxes of two mail stores
#[derive(Parser, Debug)]
#[command(name = "mailsync")]
#[command(about = "Three-way synchronization of mailboxes between two mail stores")]
#[command(
    after_help = "NAME is a channel to synchronize, a channel and one of its stores to \
                  compare that store against the last checkpoint, or a store to list."
)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Classify and report without changing anything
    #[arg(short, long)]
    simulate: bool,

    /// Do not expunge removed messages
    #[arg(short = 'n', long)]
    no_expunge: bool,

    /// Delete mailboxes that are empty on both sides
    #[arg(short = 'D', long)]
    delete_empty: bool,

    /// Show a line per message
    #[arg(short = 'm', long)]
    show_messages: bool,

    /// Show a line per message including its identity
    #[arg(short = 'M', long)]
    show_message_ids: bool,

    /// Also copy messages flagged as deleted
    #[arg(long)]
    copy_deleted: bool,

    /// Warn about malformed Message-ID headers
    #[arg(long)]
    report_malformed_ids: bool,

    /// Identity scheme: header or digest
    #[arg(short = 't', long, value_parser = parse_identity)]
    identity: Option<IdentityScheme>,

    /// Mailbox traversal order: longest-first or lexical
    #[arg(long, value_parser = parse_traversal)]
    traversal: Option<TraversalOrder>,

    /// Rewrite the checkpoint after every mailbox
    #[arg(long)]
    checkpoint_per_mailbox: bool,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Channel, channel and store, or store
    #[arg(required = true, num_args = 1..=2)]
    names: Vec<String>,
}

fn parse_identity(s: &str) -> std::result::Result<IdentityScheme, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_traversal(s: &str) -> std::result::Result<TraversalOrder, String> {
    match s {
        "longest-first" | "longest_first" => Ok(TraversalOrder::LongestFirst),
        "lexical" => Ok(TraversalOrder::Lexical),
        other => Err(format!(
            "unknown traversal order {}, expected longest-first or lexical",
            other
        )),
    }
}

impl Args {
    /// Fold the command line switches into the loaded configuration
    fn apply_to(&self, config: &mut Config) {
        let sync = &mut config.sync;
        sync.simulate |= self.simulate;
        if self.no_expunge {
            sync.expunge = false;
        }
        sync.delete_empty_mailboxes |= self.delete_empty;
        sync.show_messages |= self.show_messages || self.show_message_ids;
        sync.show_message_ids |= self.show_message_ids;
        sync.copy_deleted_messages |= self.copy_deleted;
        sync.report_malformed_ids |= self.report_malformed_ids;
        if let Some(traversal) = self.traversal {
            sync.traversal = traversal;
        }
        if self.checkpoint_per_mailbox {
            sync.checkpoint_mode = CheckpointMode::PerMailbox;
        }
        if let Some(identity) = self.identity {
            for channel in config.channels.values_mut() {
                channel.identity = identity;
            }
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("mailsync: {}", e);
        std::process::exit(e.exit_code());
    });
    args.apply_to(&mut config);

    init_logging(&config.logging);

    match execute(&config, &args).await {
        Ok(()) => {}
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn execute(config: &Config, args: &Args) -> mailsync_common::Result<()> {
    let invocation = Invocation::resolve(config, &args.names)?;
    debug!(invocation = ?invocation, "Resolved invocation");

    let outcome = run(config, &invocation).await?;
    if args.json {
        let json = match &outcome {
            Outcome::Sync(report) => serde_json::to_string_pretty(report),
            Outcome::Diff(report) => serde_json::to_string_pretty(report),
            Outcome::List(report) => serde_json::to_string_pretty(report),
        }
        .map_err(|e| Error::Internal(format!("Failed to serialize report: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    match &outcome {
        Outcome::Sync(report) => {
            for mailbox in &report.mailboxes {
                println!("{}", mailbox.summary());
            }
            for mailbox in &report.deleted_mailboxes {
                println!("{}: gone from both stores, forgotten", mailbox);
            }
            println!(
                "{}{}: {} copied, {} removed",
                report.channel,
                if report.simulate { " (simulated)" } else { "" },
                report.copied(),
                report.removed()
            );
        }
        Outcome::Diff(report) => {
            for mailbox in &report.mailboxes {
                println!("{}", mailbox.summary());
            }
        }
        Outcome::List(report) => {
            for mailbox in &report.mailboxes {
                println!("{}", mailbox.summary());
            }
        }
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,mailsync={}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
