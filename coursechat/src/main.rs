//! `CourseChat` demo. Runs the engine against the in-process backend.
//!
//! Seeds a short conversation, opens it, sends one message and prints the
//! reconciled view. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/coursechat/config.toml`).
//!
//! ```bash
//! cargo run --bin coursechat -- --conversation cs101 --message "see you in lab"
//!
//! # Verbose engine logs (written to $TMPDIR/coursechat.log)
//! COURSECHAT_LOG=debug cargo run --bin coursechat
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use coursechat::config::{CliArgs, ClientConfig};
use coursechat::error::ChatError;
use coursechat::reconcile::{ConversationView, LoadPhase, ViewEntry};
use coursechat::session::ChatSession;
use coursechat::transport::loopback::LoopbackBackend;
use coursechat_proto::message::{ConversationId, MessageId, PendingState, Timestamp, UserId};
use coursechat_proto::wire::MessageRow;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(conversation = %config.conversation, "coursechat starting");

    let backend = Arc::new(LoopbackBackend::new());
    seed(&backend, &config);

    let session = ChatSession::start(Arc::clone(&backend), config.to_session_config());
    let result = run(&session, &config, &cli.message).await;
    session.shutdown().await;

    tracing::info!("coursechat exiting");
    result.map_err(Into::into)
}

/// Initialize file-based logging.
///
/// Stdout is reserved for the rendered conversation. Returns a
/// [`WorkerGuard`] that must be held until shutdown to ensure all buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("coursechat.log");
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

/// Fills the backend with a few rows from two other participants.
fn seed(backend: &LoopbackBackend, config: &ClientConfig) {
    let instructor = UserId::new(config.user_id.as_u64() + 1);
    let classmate = UserId::new(config.user_id.as_u64() + 2);
    backend.add_profile(config.user_id, "You");
    backend.add_profile(instructor, "Instructor");
    backend.add_profile(classmate, "Classmate");

    let base = Timestamp::now().as_millis().saturating_sub(60_000);
    let lines = [
        (instructor, "Welcome to the course channel.", None),
        (classmate, "Is the first assignment due Friday?", None),
        (instructor, "Yes, before midnight.", Some("seed-2")),
    ];
    for (n, (author, content, reply_to)) in (1_u64..).zip(lines) {
        backend.seed(MessageRow {
            id: MessageId::new(format!("seed-{n}")),
            conversation_id: config.conversation.clone(),
            user_id: author,
            content: content.to_string(),
            created_at: Timestamp::from_millis(base + n * 1_000),
            edited_at: None,
            reply_to_id: reply_to.map(MessageId::new),
            attachments: Vec::new(),
            reactions: Vec::new(),
        });
    }
}

async fn run(
    session: &ChatSession<LoopbackBackend>,
    config: &ClientConfig,
    message: &str,
) -> Result<(), ChatError> {
    session
        .set_active_conversation(config.conversation.clone())
        .await?;
    let mut view = session.watch_view();
    settle(&mut view, |v| v.phase == LoadPhase::Ready).await;

    let temp_id = session.send_message(message, None).await?;
    settle(&mut view, |v| v.pending(&temp_id).is_none()).await;

    let snapshot = session.view();
    print_view(&config.conversation, &snapshot, &config.timestamp_format);
    if let Some(error) = session.watch_connection().borrow().error() {
        println!("! {error}");
    }
    Ok(())
}

async fn settle(
    view: &mut tokio::sync::watch::Receiver<ConversationView>,
    done: impl FnMut(&ConversationView) -> bool,
) {
    if tokio::time::timeout(SETTLE_TIMEOUT, view.wait_for(done))
        .await
        .is_err()
    {
        tracing::warn!("view did not settle in time");
    }
}

fn print_view(conversation: &ConversationId, view: &ConversationView, format: &str) {
    println!("# {conversation}");
    for entry in &view.entries {
        let at = i64::try_from(entry.created_at().as_millis())
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|t| t.with_timezone(&chrono::Local).format(format).to_string())
            .unwrap_or_default();
        let status = match entry {
            ViewEntry::Confirmed(_) => "",
            ViewEntry::Pending(p) => match &p.state {
                PendingState::Sending => " (sending)",
                PendingState::Failed { .. } => " (failed)",
            },
        };
        let reply = entry
            .as_message()
            .and_then(|m| m.reply_preview.as_ref())
            .map(|p| format!("  > {}: {}\n", p.author_name.as_str(), p.excerpt))
            .unwrap_or_default();
        println!(
            "{reply}[{at}] {}: {}{status}",
            entry.author_name().as_str(),
            entry.content()
        );
    }
    if let Some(error) = &view.last_error {
        println!("! {error}");
    }
}
