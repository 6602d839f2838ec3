/// Offline admin CLI: works directly on a ChatSync data directory
/// (the server must not be running; sled locks the directory).
use chatsync_core::accounts::NewAccount;
use chatsync_core::media::MediaKind;
use chatsync_core::messenger_types::{display_timestamp, MessageDraft, MessageKind};
use chatsync_core::orchestrator::{CreateConversation, Participant};
use chatsync_core::{Config, Messenger};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
        if !dir.is_empty() {
            config.data_dir = PathBuf::from(dir);
        }
    }
    if args.len() >= 3 && args[1] == "--data-dir" {
        config.data_dir = PathBuf::from(&args[2]);
        args.drain(1..3);
    }

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    let command = args[1].clone();
    let rest = &args[2..];
    let messenger = Messenger::open(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", config.data_dir, e))?;

    match command.as_str() {
        "register" => {
            let [email, first, last] = take::<3>(rest, "register <email> <first_name> <last_name>")?;
            let key = messenger
                .accounts
                .register(&NewAccount {
                    email,
                    first_name: first,
                    last_name: last,
                })
                .await?;
            println!("{} Registered {}", "✓".green().bold(), key.to_string().cyan());
        }
        "search" => {
            if rest.is_empty() {
                return usage_error("search <query>");
            }
            let hits = messenger.feeds.search_users(&rest.join(" ")).await?;
            if hits.is_empty() {
                println!("{}", "No matching users".dimmed());
            }
            for entry in hits {
                println!("  {}  {}", entry.display_name.bold(), entry.user_key.to_string().dimmed());
            }
        }
        "create" => {
            if rest.len() < 5 {
                return usage_error("create <from_email> <from_name> <to_email> <to_name> <message>");
            }
            let request = CreateConversation {
                initiator: Participant {
                    account: rest[0].clone(),
                    display_name: rest[1].clone(),
                },
                counterpart: Participant {
                    account: rest[2].clone(),
                    display_name: rest[3].clone(),
                },
                first_message: MessageKind::Text(rest[4..].join(" ")),
            };
            let id = messenger.orchestrator.create_conversation(request).await?;
            println!("{} Conversation created: {}", "✓".green().bold(), id.cyan());
        }
        "send" => {
            if rest.len() < 5 {
                return usage_error("send <conversation_id> <from_email> <from_name> <to_email> <message>");
            }
            let draft = MessageDraft::text(rest[4..].join(" "), rest[2].clone());
            let message_id = draft.id.clone();
            let outcome = messenger
                .orchestrator
                .send_message(&rest[0], &rest[1], &rest[3], draft)
                .await?;
            let note = if outcome.is_duplicate() { " (already stored)" } else { "" };
            println!("{} Message sent! ID: {}{}", "✓".green().bold(), message_id.cyan(), note);
        }
        "send-photo" => {
            let [id, from, name, to, file] =
                take::<5>(rest, "send-photo <conversation_id> <from_email> <from_name> <to_email> <file>")?;
            let bytes = std::fs::read(&file)?;
            let kind = if file.to_lowercase().ends_with(".mov") {
                MediaKind::MessageVideo
            } else {
                MediaKind::MessagePhoto
            };
            messenger
                .send_media(&id, &from, &to, &name, kind, bytes)
                .await?;
            println!("{} {} sent from {}", "✓".green().bold(), kind, file.cyan());
        }
        "set-picture" => {
            let [account, file] = take::<2>(rest, "set-picture <email> <file>")?;
            let bytes = std::fs::read(&file)?;
            let url = messenger.upload_profile_picture(&account, bytes).await?;
            println!("{} Profile picture stored at {}", "✓".green().bold(), url.cyan());
        }
        "inbox" => {
            let [account] = take::<1>(rest, "inbox <email>")?;
            let inbox = messenger.feeds.inbox_by_recency(&account).await?;
            if inbox.is_empty() {
                println!("{}", "No conversations".dimmed());
            }
            for summary in inbox {
                let latest = &summary.latest_message;
                let marker = if latest.is_read { " ".normal() } else { "•".bright_blue() };
                println!(
                    "{} {}  {}  {}",
                    marker,
                    summary.display_name.bold(),
                    latest.preview_text,
                    display_timestamp(&latest.timestamp).dimmed()
                );
                println!("    {}", summary.conversation_id.dimmed());
            }
        }
        "history" => {
            let [id] = take::<1>(rest, "history <conversation_id>")?;
            for message in messenger.feeds.history(&id).await? {
                println!(
                    "{} {}: {}",
                    display_timestamp(&message.timestamp).dimmed(),
                    message.sender_display_name.cyan(),
                    message.kind.preview()
                );
            }
        }
        "delete" => {
            let [account, id] = take::<2>(rest, "delete <email> <conversation_id>")?;
            messenger.orchestrator.delete_conversation(&account, &id).await?;
            println!("{} Removed {} from {}'s inbox", "✓".green().bold(), id.cyan(), account);
        }
        "resync" => {
            let [id, account] = take::<2>(rest, "resync <conversation_id> <email>")?;
            let latest = messenger.orchestrator.resync_summary(&id, &account).await?;
            println!("{} Summary now shows: {}", "✓".green().bold(), latest.preview_text.cyan());
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&args[0]);
        }
    }

    Ok(())
}

/// Exactly `N` positional arguments
fn take<const N: usize>(rest: &[String], usage: &str) -> anyhow::Result<[String; N]> {
    <[String; N]>::try_from(rest.to_vec())
        .map_err(|_| anyhow::anyhow!("Usage: chatsync-cli {}", usage))
}

fn usage_error(usage: &str) -> anyhow::Result<()> {
    Err(anyhow::anyhow!("Usage: chatsync-cli {}", usage))
}

fn print_usage(bin: &str) {
    println!("{}", "ChatSync CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--data-dir <path>] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <email> <first> <last>                 Register an account", "register".cyan());
    println!("  {} <query>                                  Search the user directory", "search".cyan());
    println!("  {} <from> <from_name> <to> <to_name> <msg>  Start a conversation", "create".cyan());
    println!("  {} <id> <from> <from_name> <to> <msg>         Send a text message", "send".cyan());
    println!("  {} <id> <from> <from_name> <to> <file>  Send a photo (.mov for video)", "send-photo".cyan());
    println!("  {} <email> <file>                      Upload a profile picture", "set-picture".cyan());
    println!("  {} <email>                                   List conversations, newest first", "inbox".cyan());
    println!("  {} <id>                                    Show a conversation", "history".cyan());
    println!("  {} <email> <id>                             Hide a conversation for one user", "delete".cyan());
    println!("  {} <id> <email>                             Rebuild a stale inbox summary", "resync".cyan());
}
