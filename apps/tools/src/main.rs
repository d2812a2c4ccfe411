use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::ConversationId;
use storage::{Storage, SyncStore};
use sync_core::config::{load_settings, normalize_database_url};
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the database url from settings.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists every attachment download job.
    Jobs,
    /// Clears pending flags left behind by a crashed process.
    ResetPending,
    /// Shows the watermarks and unread state of one conversation.
    Conversation { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings()?;
    let database_url = cli
        .database_url
        .as_deref()
        .map(normalize_database_url)
        .unwrap_or(settings.database_url);
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open '{database_url}'"))?;
    storage.health_check().await?;

    match cli.command {
        Command::Jobs => {
            let jobs = storage.list_jobs().await?;
            for job in &jobs {
                println!(
                    "{} message={} kind={} index={} attempts={} pending={} scheduled_at={} cdn_key={}",
                    job.id,
                    job.message_id,
                    job.kind.as_str(),
                    job.index,
                    job.attempts,
                    job.pending,
                    job.scheduled_at.to_rfc3339(),
                    job.attachment.cdn_key,
                );
            }
            println!("{} job(s)", jobs.len());
        }
        Command::ResetPending => {
            let reset = storage.reset_all_pending_flags().await?;
            info!(reset, "tools: pending flags cleared");
            println!("reset {reset} pending job(s)");
        }
        Command::Conversation { id } => {
            let Some(conversation) = storage.load_conversation(ConversationId(id)).await? else {
                println!("conversation {id} not found");
                return Ok(());
            };
            let range = |start: Option<i64>, end: Option<i64>| match (start, end) {
                (Some(start), Some(end)) => format!("[{start}, {end}]"),
                _ => "-".to_string(),
            };
            println!("conversation {id} ({:?})", conversation.kind);
            println!(
                "  remote      {}",
                range(
                    conversation.oldest_remote_msg_seq_id,
                    conversation.latest_remote_msg_seq_id
                )
            );
            println!(
                "  loaded      {}",
                range(
                    conversation.oldest_loaded_msg_seq_id,
                    conversation.latest_loaded_msg_seq_id
                )
            );
            println!("  read cursor {:?}", conversation.read_cursor());
            println!(
                "  unread      {} (display {})",
                conversation.unread_count,
                sync_core::unread::display_unread_count(&conversation)
            );
            println!("  marked      {:?}", conversation.marked_unread_at);
            println!("  synced to   {:?}", conversation.last_synced_read_timestamp);
        }
    }

    Ok(())
}
