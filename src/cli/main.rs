use anyhow::Context;
use clap::{Parser, Subcommand};
use mail_relay::{
    config::Config,
    mail::{MailService, OutgoingMail},
    messaging::{
        connector_from_config, parse_timestamp, timestamp_now, FilteredDrain, MailEnvelope,
        QueuePublisher,
    },
};
use serde_json::json;

#[derive(Parser)]
#[command(name = "mail-relay-cli")]
#[command(about = "Mail relay queue CLI", version, long_about = None)]
struct Cli {
    /// Broker URL, overrides the configured one
    #[arg(short, long, env = "CLOUDAMQP_URL", hide_env_values = true)]
    url: Option<String>,

    /// Queue name, overrides the configured one
    #[arg(short, long)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one envelope
    Publish {
        #[arg(long)]
        sender_id: i64,

        #[arg(long)]
        receiver_id: i64,

        #[arg(long)]
        sender_email: String,

        #[arg(long)]
        receiver_email: String,

        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        content: String,

        /// `YYYY-MM-DD HH:MM:SS`, defaults to now
        #[arg(short, long)]
        timestamp: Option<String>,
    },

    /// Take every queued envelope for a receiver without waiting
    Drain {
        #[arg(short, long)]
        receiver_id: i64,
    },

    /// Send a mail between two users from the configured users file
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        content: String,
    },

    /// Take the queued envelopes for a user from the configured users file
    Pending {
        #[arg(short, long)]
        email: String,
    },

    /// Connect, declare the queue and disconnect
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(url) = cli.url {
        config.broker.url = url;
    }
    if let Some(queue) = cli.queue {
        config.broker.queue = queue;
    }
    let connector = connector_from_config(&config.broker)?;
    let queue = config.broker.queue.clone();

    match cli.command {
        Commands::Publish {
            sender_id,
            receiver_id,
            sender_email,
            receiver_email,
            subject,
            content,
            timestamp,
        } => {
            let timestamp = match timestamp {
                Some(value) => {
                    parse_timestamp(&value)?;
                    value
                }
                None => timestamp_now(),
            };
            let envelope = MailEnvelope {
                sender_id,
                receiver_id,
                sender_email,
                receiver_email,
                subject,
                content,
                timestamp,
            };

            QueuePublisher::new(connector, queue.clone())
                .publish(&envelope)
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "queued": true,
                    "queue": queue,
                    "envelope": envelope,
                }))?
            );
        }

        Commands::Drain { receiver_id } => {
            let envelopes = FilteredDrain::new(connector, queue)
                .drain_for_receiver(receiver_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&envelopes)?);
        }

        Commands::Send {
            from,
            to,
            subject,
            content,
        } => {
            let service = MailService::from_config(&config).await?;
            let receipt = service
                .send(OutgoingMail {
                    sender_email: from,
                    receiver_email: to,
                    subject,
                    content,
                    timestamp: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }

        Commands::Pending { email } => {
            let service = MailService::from_config(&config).await?;
            let envelopes = service.drain_pending(&email).await?;
            println!("{}", serde_json::to_string_pretty(&envelopes)?);
        }

        Commands::Check => {
            let endpoint = connector.endpoint();
            let session = connector.connect().await?;
            let declared = session.declare_queue(&queue, true).await;
            if let Err(e) = session.close().await {
                eprintln!("Warning: failed to close session: {}", e);
            }

            let body = match &declared {
                Ok(()) => json!({
                    "status": "ok",
                    "endpoint": endpoint,
                    "queue": queue,
                    "durable": true,
                }),
                Err(e) => json!({
                    "status": "error",
                    "endpoint": endpoint,
                    "queue": queue,
                    "error_kind": e.kind(),
                    "error": e.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
            declared?;
        }
    }

    Ok(())
}
