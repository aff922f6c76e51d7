//! `AreaChat`: line-oriented terminal client for one area chat.
//!
//! Reads input from stdin and prints the conversation to stdout. Logs go
//! to a file so they never interleave with the chat.
//!
//! ```bash
//! cargo run --bin areachat -- --server-url http://127.0.0.1:9100 \
//!     --team t1 --area general --user-id u1 --display-name Ana --token dev-ana
//! ```
//!
//! Commands: `/more` loads older history, `/delete <id>` deletes one of your
//! messages, `/retry [id]` re-sends a failed message, `/quit` leaves. Lines
//! starting with the assistant prefix (default `/ia`) go to the assistant.

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use areachat::backend::rest::RestBackend;
use areachat::chat::delivery::SendOutcome;
use areachat::chat::store::StoredMessage;
use areachat::config::{CliArgs, ClientConfig};
use areachat::conversation::{AreaConversation, ConversationConfig, ConversationEvent};
use areachat::transport::ws::WsConnector;
use areachat_proto::message::MessageId;

type Conversation = AreaConversation<RestBackend>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("areachat starting");

    let code = match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    };
    tracing::info!("areachat exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("areachat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig) -> Result<(), String> {
    let target = config
        .to_target()
        .ok_or("team, area and user id are required (--team, --area, --user-id)")?;
    let channel_url = config.channel_url().map_err(|e| e.to_string())?;
    let server_url = config.server_url.as_deref().unwrap_or_default();
    let backend = RestBackend::new(server_url, config.token.clone(), config.request_timeout)
        .map_err(|e| e.to_string())?;

    println!("Connecting to {} as {}...", target.area, target.user.display_name);
    let (conversation, mut events) = AreaConversation::open(
        target,
        WsConnector::new(channel_url),
        backend,
        ConversationConfig::from(config),
    )
    .await
    .map_err(|e| format!("Could not open the area: {e}"))?;
    let conversation = Arc::new(conversation);

    let mut screen = Screen::default();
    screen.render(&conversation);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !handle_line(&conversation, line.trim_end()) {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !screen.apply(&conversation, event, &mut events) {
                    break;
                }
            }
        }
    }

    conversation.close();
    Ok(())
}

/// Dispatch one line of input. Returns `false` to quit.
fn handle_line(conversation: &Arc<Conversation>, line: &str) -> bool {
    let (command, arg) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(c, a)| (c, a.trim()));

    match command {
        "" => {}
        "/quit" => return false,
        "/more" => {
            let conversation = Arc::clone(conversation);
            tokio::spawn(async move {
                match conversation.load_older().await {
                    Ok(page) if page.fetched == 0 => println!("-- no older messages --"),
                    Ok(_) => {}
                    Err(e) => println!("!! {e} (type /more to retry)"),
                }
            });
        }
        "/delete" if !arg.is_empty() => {
            let conversation = Arc::clone(conversation);
            let id = MessageId::new(arg);
            tokio::spawn(async move {
                if let Err(e) = conversation.delete(&id).await {
                    println!("!! could not delete {id}: {e}");
                }
            });
        }
        "/retry" => {
            let id = if arg.is_empty() {
                conversation.failed_sends().pop()
            } else {
                Some(MessageId::new(arg))
            };
            let Some(id) = id else {
                println!("-- nothing to retry --");
                return true;
            };
            let conversation = Arc::clone(conversation);
            tokio::spawn(async move {
                if let Err(e) = conversation.retry_send(&id).await {
                    println!("!! retry failed: {e}");
                }
            });
        }
        _ => {
            let conversation = Arc::clone(conversation);
            let text = line.to_string();
            tokio::spawn(async move {
                match conversation.send(&text).await {
                    Ok(SendOutcome::Sent(_)) => {}
                    Ok(SendOutcome::Answered(answer)) => {
                        println!("[assistant] {}", answer.answer);
                        for source in answer.sources {
                            println!("[assistant]   - {source}");
                        }
                    }
                    Err(e) => println!("!! {e} (type /retry to send again)"),
                }
            });
        }
    }
    true
}

/// Tracks what has already been printed.
#[derive(Default)]
struct Screen {
    printed: HashSet<MessageId>,
    typing: Vec<String>,
}

impl Screen {
    /// Apply one event and anything already queued behind it. Returns
    /// `false` when the conversation is over.
    fn apply(
        &mut self,
        conversation: &Conversation,
        first: ConversationEvent,
        events: &mut mpsc::Receiver<ConversationEvent>,
    ) -> bool {
        let mut dirty = false;
        let mut next = Some(first);
        while let Some(event) = next {
            match event {
                ConversationEvent::MessagesChanged => dirty = true,
                ConversationEvent::TypingChanged(names) => self.show_typing(names),
                ConversationEvent::ConnectionChanged(state) => println!("-- {state} --"),
                ConversationEvent::ConnectionLost(reason) => {
                    println!("!! connection lost: {reason}");
                    return false;
                }
            }
            next = events.try_recv().ok();
        }
        if dirty {
            self.render(conversation);
        }
        true
    }

    fn render(&mut self, conversation: &Conversation) {
        for (index, entry) in conversation.ordered().iter().enumerate() {
            if entry.is_pending() || !self.printed.insert(entry.message.id.clone()) {
                continue;
            }
            if conversation.starts_new_day(index) {
                println!("=== {} ===", day_label(entry));
            }
            println!("{}", format_entry(entry));
        }
    }

    fn show_typing(&mut self, names: Vec<String>) {
        if names == self.typing {
            return;
        }
        if !names.is_empty() {
            println!("... {} typing", names.join(", "));
        }
        self.typing = names;
    }
}

fn day_label(entry: &StoredMessage) -> String {
    let rfc = entry.message.created_at.to_rfc3339();
    rfc.split('T').next().unwrap_or_default().to_string()
}

fn format_entry(entry: &StoredMessage) -> String {
    let message = &entry.message;
    let time = message.created_at.to_rfc3339();
    let clock = time.get(11..16).unwrap_or("--:--");
    let edited = if message.is_edited() { " (edited)" } else { "" };
    format!(
        "[{clock}] {}: {}{edited}  <{}>",
        message.author.display_name, message.body, message.id
    )
}
