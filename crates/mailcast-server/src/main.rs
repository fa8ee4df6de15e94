use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mailcast_core::MailcastConfig;
use mailcast_dispatch::{MailingStore, NewMailing, NewRecipient, Recurrence, TickOutcome};
use tracing::info;

mod app;

/// Periodic mailing dispatcher.
#[derive(Debug, Parser)]
#[command(name = "mailcast", version, about)]
struct Cli {
    /// Config file (default: $MAILCAST_CONFIG, then ~/.mailcast/mailcast.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the dispatcher until Ctrl-C.
    Run,
    /// Run exactly one lifecycle + dispatch tick and exit.
    ///
    /// Skipped when another dispatcher on the same database holds the lease.
    Tick,
    /// Show mailing and client counters.
    Stats,
    /// Set the manager override: the mailing is neither advanced nor sent.
    Disable { id: String },
    /// Clear the manager override.
    Enable { id: String },
    /// Show the attempt history of a mailing, newest first.
    Attempts {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage recipients.
    Client {
        #[command(subcommand)]
        action: ClientCommand,
    },
    /// Manage message texts.
    Message {
        #[command(subcommand)]
        action: MessageCommand,
    },
    /// Manage mailings.
    Mailing {
        #[command(subcommand)]
        action: MailingCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Register a recipient.
    Add {
        email: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        middle_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum MessageCommand {
    /// Store a subject and body.
    Add {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
}

#[derive(Debug, Subcommand)]
enum MailingCommand {
    /// Schedule a mailing (starts in `created`).
    Add {
        /// RFC 3339, e.g. 2026-11-01T09:00:00Z
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        /// daily | weekly | monthly
        #[arg(long)]
        recurrence: Recurrence,
        /// Message id.
        #[arg(long)]
        message: Option<String>,
        /// Client id; repeat for several recipients.
        #[arg(long = "recipient")]
        recipients: Vec<String>,
    },
    /// Delete a mailing together with its attempt history.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailcast_server=info,mailcast_dispatch=info,mailcast_smtp=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > MAILCAST_CONFIG env > ~/.mailcast/mailcast.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("MAILCAST_CONFIG").ok());
    let config = MailcastConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        MailcastConfig::default()
    });

    let store = Arc::new(app::open_store(&config)?);

    match cli.command {
        Command::Run => {
            let dispatcher = Arc::new(app::build_dispatcher(&config, Arc::clone(&store)));
            let handle = dispatcher.start();
            info!("mailcast running — press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            handle.stop().await;
        }
        Command::Tick => {
            let dispatcher = app::build_dispatcher(&config, Arc::clone(&store));
            match dispatcher.tick().await {
                TickOutcome::Completed(report) => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!(
                            "launched {} · completed {} · delivered {} · failed {} · not due {} · skipped {}",
                            report.launched,
                            report.completed,
                            report.delivered,
                            report.failed,
                            report.not_due,
                            report.skipped
                        );
                    }
                }
                TickOutcome::Skipped => println!("tick skipped: another dispatcher is ticking"),
                TickOutcome::Failed(e) => anyhow::bail!("tick failed: {e}"),
            }
        }
        Command::Stats => {
            let stats = store.stats()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("mailings:        {}", stats.mailing_count);
                println!("active mailings: {}", stats.active_count);
                println!("clients:         {}", stats.client_count);
            }
        }
        Command::Disable { id } => {
            store.set_disabled(&id, true)?;
            println!("mailing {id} disabled");
        }
        Command::Enable { id } => {
            store.set_disabled(&id, false)?;
            println!("mailing {id} enabled");
        }
        Command::Attempts { id, limit } => {
            // Surface NotFound rather than an empty list for unknown ids.
            store.get_mailing(&id)?;
            let attempts: Vec<_> = store.list_attempts(&id)?.into_iter().take(limit).collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&attempts)?);
            } else if attempts.is_empty() {
                println!("no attempts yet");
            } else {
                for a in attempts {
                    println!("{}  {:<7}  {}", a.attempted_at.to_rfc3339(), a.outcome.as_str(), a.diagnostic);
                }
            }
        }
        Command::Client {
            action:
                ClientCommand::Add {
                    email,
                    first_name,
                    middle_name,
                    last_name,
                    comment,
                },
        } => {
            let client = store.create_recipient(NewRecipient {
                email,
                first_name,
                middle_name,
                last_name,
                comment,
            })?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&client)?);
            } else {
                println!("client {} added ({})", client.id, client.email);
            }
        }
        Command::Message {
            action: MessageCommand::Add { subject, body },
        } => {
            let message = store.create_message(&subject, &body)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&message)?);
            } else {
                println!("message {} added", message.id);
            }
        }
        Command::Mailing {
            action:
                MailingCommand::Add {
                    start,
                    end,
                    recurrence,
                    message,
                    recipients,
                },
        } => {
            let mailing = store.create_mailing(NewMailing {
                start_at: start,
                end_at: end,
                recurrence,
                message_id: message,
                recipient_ids: recipients,
            })?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&mailing)?);
            } else {
                println!(
                    "mailing {} scheduled {} → {} ({})",
                    mailing.id,
                    mailing.start_at.to_rfc3339(),
                    mailing.end_at.to_rfc3339(),
                    mailing.recurrence
                );
            }
        }
        Command::Mailing {
            action: MailingCommand::Delete { id },
        } => {
            store.delete_mailing(&id)?;
            println!("mailing {id} deleted");
        }
    }

    Ok(())
}
