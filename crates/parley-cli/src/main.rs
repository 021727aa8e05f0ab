//! parley: encrypted conversations from the command line.
//!
//! Every subcommand runs against the local SQLite database named by `--db`,
//! `PARLEY_DB_PATH` or the platform data directory, in that order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use parley_client::{
    init_tracing, Client, ClientConfig, ClientError, DecryptedBatch, KeyHealth, SendMode,
};
use parley_shared::{ConversationId, UserId};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Per-conversation encrypted chat")]
struct Cli {
    /// SQLite database file (overrides PARLEY_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and store a message
    Send {
        conversation: String,
        text: String,
        /// Sending user
        #[arg(long, short = 'f', env = "PARLEY_USER")]
        from: String,
        /// Participants recorded with a newly created key
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
    },

    /// Show the most recent messages of a conversation
    Read { conversation: String },

    /// Print the conversation again whenever a message arrives
    Watch { conversation: String },

    /// List conversations that have a key, with message counts
    Conversations,

    /// Show the conversation key fingerprint for out-of-band comparison
    Fingerprint { conversation: String },

    /// Check that the stored key loads and round-trips
    Validate { conversation: String },

    /// Replace the conversation key. Existing encrypted messages become unreadable.
    Regenerate {
        conversation: String,
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
    },

    /// Delete encrypted messages that fail to decrypt with the current key
    PurgeUnreadable { conversation: String },

    /// Delete every encrypted message and regenerate the key
    Reset {
        conversation: String,
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
    },

    /// Delete a conversation's messages and its key
    DeleteConversation { conversation: String },

    /// Delete a single message
    DeleteMessage { id: Uuid },

    /// Show (and create if needed) a user's X25519 key pair
    UserKeys {
        user: String,
        /// Replace the existing pair
        #[arg(long)]
        rotate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ClientConfig::from_env();
    if cli.db.is_some() {
        config.database_path = cli.db.clone();
    }
    info!(?config, "Loaded configuration");

    let client = Client::open(&config).context("failed to open the local database")?;

    run(&client, cli.command, cli.json).await
}

async fn run(client: &Client, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Send {
            conversation,
            text,
            from,
            participants,
        } => {
            let cid = ConversationId::new(conversation);
            let receipt = client
                .pipeline
                .send(&cid, &UserId::new(from), &users(participants), &text)
                .await
                .map_err(explain)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else {
                match receipt.mode {
                    SendMode::Encrypted => println!("sent {} (encrypted)", receipt.message_id),
                    SendMode::PlaintextFallback { reason } => {
                        println!("sent {} UNENCRYPTED: {reason}", receipt.message_id)
                    }
                }
            }
        }

        Commands::Read { conversation } => {
            let batch = client.pipeline.fetch(&ConversationId::new(conversation)).await?;
            print_batch(&batch, json)?;
        }

        Commands::Watch { conversation } => {
            let cid = ConversationId::new(conversation);
            let mut watch = client.pipeline.watch(&cid);
            print_batch(&client.pipeline.fetch(&cid).await?, json)?;

            loop {
                tokio::select! {
                    next = watch.next_batch() => match next? {
                        Some(batch) => print_batch(&batch, json)?,
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Commands::Conversations => {
            let summaries = client.conversations().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if summaries.is_empty() {
                println!("no conversations yet");
            } else {
                for summary in &summaries {
                    println!(
                        "{:<32} {:>6} message(s)  {:?}",
                        summary.conversation_id, summary.messages, summary.health
                    );
                }
            }
        }

        Commands::Fingerprint { conversation } => {
            let fingerprint = client
                .keys
                .fingerprint_for(&ConversationId::new(conversation))
                .await
                .map_err(explain)?;
            println!("{fingerprint}");
        }

        Commands::Validate { conversation } => {
            let cid = ConversationId::new(conversation);
            let presence = client.keys.presence(&cid).await;
            let health = client.keys.health(&cid).await;

            if json {
                let value = serde_json::json!({ "health": health, "presence": presence });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("health:     {health:?}");
                println!("in memory:  {}", presence.in_memory);
                println!("in storage: {}", presence.in_durable);
                if let Some(created) = presence.created_at {
                    println!("created:    {created}");
                }
                match health {
                    KeyHealth::Healthy => {}
                    KeyHealth::Missing => println!("no key yet; one is created on first send"),
                    KeyHealth::Corrupt => println!("key is unusable; run `parley regenerate`"),
                }
            }
        }

        Commands::Regenerate {
            conversation,
            participants,
        } => {
            let regen = client
                .keys
                .force_regenerate(&ConversationId::new(conversation), &users(participants))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&regen)?);
            } else {
                println!(
                    "{} -> {}",
                    regen.previous_fingerprint.as_deref().unwrap_or("(none)"),
                    regen.fingerprint
                );
            }
        }

        Commands::PurgeUnreadable { conversation } => {
            let deleted = client
                .pipeline
                .purge_unreadable(&ConversationId::new(conversation))
                .await?;
            println!("deleted {deleted} unreadable message(s)");
        }

        Commands::Reset {
            conversation,
            participants,
        } => {
            let reset = client
                .pipeline
                .purge_encrypted_and_regenerate(
                    &ConversationId::new(conversation),
                    &users(participants),
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reset)?);
            } else {
                println!(
                    "deleted {} encrypted message(s), new key {}",
                    reset.deleted, reset.regeneration.fingerprint
                );
            }
        }

        Commands::DeleteConversation { conversation } => {
            let deleted = client
                .pipeline
                .delete_conversation(&ConversationId::new(conversation))
                .await?;
            println!("deleted {deleted} message(s) and the conversation key");
        }

        Commands::DeleteMessage { id } => {
            if client.pipeline.delete_message(id)? {
                println!("deleted {id}");
            } else {
                anyhow::bail!("no message with id {id}");
            }
        }

        Commands::UserKeys { user, rotate } => {
            let user = UserId::new(user);
            let pair = if rotate {
                client.user_keys.rotate(&user)?
            } else {
                client.user_keys.initialize(&user)?
            };

            if json {
                let value = serde_json::json!({
                    "publicKey": pair.public_key,
                    "keyId": pair.key_id,
                    "createdAt": pair.created_at,
                    "fingerprint": pair.fingerprint()?,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("public key:  {}", pair.public_key);
                println!("fingerprint: {}", pair.fingerprint()?);
            }
        }
    }

    Ok(())
}

fn users(ids: Vec<String>) -> Vec<UserId> {
    ids.into_iter().map(UserId::new).collect()
}

fn print_batch(batch: &DecryptedBatch, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(batch)?);
        return Ok(());
    }

    for message in &batch.messages {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.sender_id,
            message.content
        );
    }

    if !batch.health.is_clean() {
        eprintln!(
            "warning: {:?}, suggested action: {:?}",
            batch.health,
            batch.recommended_action()
        );
    }
    Ok(())
}

/// Add a hint for the errors a user can act on.
fn explain(e: ClientError) -> anyhow::Error {
    let hint = match &e {
        ClientError::KeyNotFound(_) => Some("send a message first to create the key"),
        ClientError::KeyCorrupt { .. } => Some("run `parley regenerate`"),
        ClientError::EncryptionUnavailable { .. } => {
            Some("set PARLEY_PLAINTEXT_FALLBACK=true to send unencrypted instead")
        }
        _ => None,
    };

    match hint {
        Some(hint) => anyhow::Error::new(e).context(hint),
        None => e.into(),
    }
}
