use anyhow::{anyhow, Context as _, Result};
use marketplace_messaging::backends::{JwtIdentity, PgMessagingStore, S3ObjectStore};
use marketplace_messaging::config::Config;
use marketplace_messaging::models::Message;
use marketplace_messaging::realtime::RedisChangeFeed;
use marketplace_messaging::services::LocalFile;
use marketplace_messaging::session::{MessagingView, ViewEvent};
use marketplace_messaging::state::AppState;
use marketplace_messaging::{db, logging};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt as _;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Args {
    conversation_id: Option<Uuid>,
    token: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        token: env::var("MESSAGES_TOKEN").ok().filter(|t| !t.is_empty()),
        ..Args::default()
    };
    let mut it = env::args().skip(1);

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--conversation" => {
                let v = it
                    .next()
                    .ok_or_else(|| anyhow!("--conversation requires a UUID"))?;
                args.conversation_id =
                    Some(Uuid::parse_str(&v).context("invalid --conversation UUID")?);
            }
            "--token" => {
                let v = it.next().ok_or_else(|| anyhow!("--token requires a value"))?;
                args.token = Some(v);
            }
            "--help" | "-h" => {
                println!(
                    "\
messages-tail

Print the conversation directory, follow one conversation and send stdin lines to it.

Usage:
  messages-tail [--conversation <uuid>] [--token <access token>]

The token defaults to $MESSAGES_TOKEN. While a conversation is open:
  <text>                          send a message
  /file <path> <content-type>     send a file
  /refresh                        reload directory and history
  /quit                           leave
"
                );
                std::process::exit(0);
            }
            other => return Err(anyhow!("Unknown arg: {other}")),
        }
    }

    Ok(args)
}

fn print_message(message: &Message) {
    let who = message
        .sender
        .as_ref()
        .map(|p| p.name.clone())
        .unwrap_or_else(|| message.sender_id.to_string());
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        who,
        message.content
    );
    for attachment in &message.attachments {
        println!(
            "    attachment: {} ({}, {} bytes) {}",
            attachment.filename, attachment.content_type, attachment.size, attachment.url
        );
    }
}

fn print_directory(view: &MessagingView) {
    println!("Conversations ({} unread):", view.directory().total_unread());
    for c in view.directory().entries() {
        let preview = c
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("No messages yet");
        println!(
            "  {}  {:<24} {:<32} unread={:<3} {}",
            c.id, c.other_user.name, c.job.title, c.unread_count, preview
        );
    }
}

async fn send_file(view: &MessagingView, rest: &str) -> Result<()> {
    let mut parts = rest.split_whitespace();
    let path = parts
        .next()
        .ok_or_else(|| anyhow!("usage: /file <path> <content-type>"))?;
    let content_type = parts
        .next()
        .ok_or_else(|| anyhow!("usage: /file <path> <content-type>"))?;

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {path}"))?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);

    view.attach(&[LocalFile::new(filename, content_type, bytes)])
        .await?;
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(view: &mut MessagingView, line: &str) -> Result<bool> {
    let line = line.trim();
    match line {
        "" => {}
        "/quit" => return Ok(false),
        "/refresh" => {
            view.refresh().await?;
            print_directory(view);
        }
        _ if line.starts_with("/file ") => send_file(view, &line["/file ".len()..]).await?,
        text => {
            view.send(text).await?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let args = parse_args()?;
    let cfg = Config::from_env()?;

    let jwt_secret = cfg
        .jwt_secret
        .clone()
        .ok_or_else(|| anyhow!("JWT_SECRET must be set"))?;

    let pool = db::init_pool(&cfg.database_url, cfg.db_max_connections).await?;
    db::ensure_schema(&pool).await?;

    let feed = Arc::new(RedisChangeFeed::connect(&cfg.redis_url, cfg.feed_batch_size).await?);
    let store = PgMessagingStore::new(pool).with_publisher(feed.clone());
    let objects = S3ObjectStore::from_config(cfg.s3.clone()).await;

    let state = AppState {
        identity: Arc::new(JwtIdentity::new(&jwt_secret, args.token)),
        store: Arc::new(store),
        objects: Arc::new(objects),
        feed,
        attachment_max_bytes: cfg.attachment_max_bytes,
    };

    let mut view = match MessagingView::enter(state).await {
        Ok(view) => view,
        Err(e) if e.requires_login() => {
            return Err(anyhow!("not signed in; pass --token or set MESSAGES_TOKEN"))
        }
        Err(e) => return Err(e.into()),
    };
    print_directory(&view);

    if let Some(conversation_id) = args.conversation_id {
        for message in view.select(conversation_id).await? {
            print_message(message);
        }
    }

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => match handle_line(&mut view, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {e:#}"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
                None => break,
            },
            // Only the receive is raced; applying the item runs to completion.
            Some(item) = view.recv_event(), if view.is_live() => match view.apply(item).await {
                ViewEvent::Merged { message_id, .. } => {
                    if let Some(message) = view.messages().iter().find(|m| m.id == message_id) {
                        print_message(message);
                    }
                }
                ViewEvent::DirectoryRefreshed { conversation_id } => {
                    if let Some(c) = view.directory().get(conversation_id) {
                        println!("* {} ({}): {} unread", c.other_user.name, c.job.title, c.unread_count);
                    }
                }
                ViewEvent::FeedEnded => {
                    warn!("live updates stopped; use /refresh");
                }
                other => info!(event = ?other, "feed event"),
            },
        }
    }

    view.leave();
    Ok(())
}
