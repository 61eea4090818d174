use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, Channel, ChannelOptions, ChatEvent, ChatSession, SessionGateway, TimelineEntry,
};
use shared::{
    domain::{ChatId, ChatKind, MessageId},
    protocol::ChatMessage,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Joins one chat from the terminal: lines typed on stdin are sent, the
/// reconciled timeline is printed as it changes.
#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from client.toml / the environment.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// service, support or dispute
    #[arg(long, default_value = "service")]
    kind: ChatKind,
    #[arg(long)]
    chat_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_base_url) = args.api_base_url {
        settings.api_base_url = api_base_url;
    }
    let gateway = Arc::new(SessionGateway::new(&settings)?);

    gateway
        .login(&args.email, &args.password)
        .await
        .context("login failed")?;
    let user = gateway
        .current_user()
        .await
        .context("failed to load current user")?;
    println!("Signed in as {} <{}>", user.name, user.email);

    let chat_id = ChatId(args.chat_id);
    let detail = gateway
        .chat_detail(args.kind, chat_id)
        .await
        .with_context(|| format!("failed to load {}/{}", args.kind.path_segment(), chat_id))?;

    let channel = Channel::for_chat(
        Arc::clone(&gateway),
        settings.ws_base_url()?,
        args.kind,
        chat_id,
        ChannelOptions {
            reconnect: settings.reconnect,
            policy: settings.reconnect_policy(),
        },
    );
    let session = Arc::new(ChatSession::open(channel, chat_id, user.id, detail.messages));
    let mut printed = HashSet::new();
    for message in take_unprinted(&session.entries().await, &mut printed) {
        print_message(&message);
    }

    let printer = {
        let session = Arc::clone(&session);
        let gateway = Arc::clone(&gateway);
        let kind = args.kind;
        let mut events = session.subscribe();
        tokio::spawn(async move {
            let mut connected_before = false;
            while let Ok(event) = events.recv().await {
                match event {
                    ChatEvent::TimelineChanged => {
                        for message in take_unprinted(&session.entries().await, &mut printed) {
                            print_message(&message);
                        }
                    }
                    ChatEvent::Connected => {
                        println!("-- connected");
                        // Anything sent while we were away only shows up in the history.
                        if connected_before {
                            if let Err(err) = session.resync(&gateway, kind).await {
                                warn!("history resync failed: {err}");
                            }
                        }
                        connected_before = true;
                    }
                    ChatEvent::Disconnected { reconnecting } => {
                        println!("-- disconnected{}", if reconnecting { ", retrying" } else { "" });
                    }
                    ChatEvent::ServerError(message) => println!("-- server: {message}"),
                    ChatEvent::Unavailable(reason) => println!("-- unavailable: {reason}"),
                    ChatEvent::ResyncNeeded => {
                        if let Err(err) = session.resync(&gateway, kind).await {
                            warn!("history resync failed: {err}");
                        }
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim() == "/quit" {
            break;
        }
        if let Err(err) = session.send_text(&line).await {
            println!("-- not sent: {err}");
        }
    }

    session.close();
    printer.abort();
    if let Err(err) = gateway.logout().await {
        warn!("logout failed: {err}");
    }
    Ok(())
}

/// Confirmed messages not printed yet, in timeline order. Pending entries are
/// printed once the server confirms them.
fn take_unprinted(entries: &[TimelineEntry], printed: &mut HashSet<MessageId>) -> Vec<ChatMessage> {
    entries
        .iter()
        .filter(|entry| !entry.is_provisional())
        .filter(|entry| printed.insert(entry.message.id))
        .map(|entry| entry.message.clone())
        .collect()
}

fn print_message(message: &ChatMessage) {
    println!("[{}] {}: {}", message.created_at, message.sender_id, message.content);
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
