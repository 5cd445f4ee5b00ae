//! Line-oriented chat client for an OpenClaw-style gateway.
//!
//! Run with: cargo run -p pinchy-chat-cli
//!
//! The gateway URL and token come from `PINCHY_GATEWAY_URL` and
//! `PINCHY_GATEWAY_TOKEN`, falling back to the saved settings. Anything
//! given through the environment is saved for next time.
//!
//! Commands: `/attach <message>`, `/abort`, `/sessions`, `/switch <key>`,
//! `/quit`. Everything else (including `/new`) is sent as a message.

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use pinchy_client::GatewayClient;
use pinchy_core::{
    ClientConfig, ConnectionStatus, FilePicker, FileReader,
    files::{LocalFileReader, format_file_size},
    protocol::Role,
    settings::JsonFileSettings,
};
use pinchy_session::{ChatConfig, ChatController, ChatSnapshot, RegistryConfig, SessionRegistry};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::{Mutex, watch},
};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Input = Arc<Mutex<Lines<BufReader<Stdin>>>>;

/// Asks for file paths on the terminal.
struct TerminalPicker {
    input: Input,
}

#[async_trait]
impl FilePicker for TerminalPicker {
    async fn pick_files(&self) -> Vec<PathBuf> {
        println!("attach (space-separated paths, empty to cancel):");
        match self.input.lock().await.next_line().await {
            Ok(Some(line)) => line.split_whitespace().map(PathBuf::from).collect(),
            _ => Vec::new(),
        }
    }
}

enum Command<'a> {
    Send(&'a str),
    Attach(&'a str),
    Abort,
    Sessions,
    Switch(&'a str),
    Quit,
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head {
            "/quit" | "/exit" => Self::Quit,
            "/abort" => Self::Abort,
            "/sessions" => Self::Sessions,
            "/switch" if !rest.trim().is_empty() => Self::Switch(rest.trim()),
            "/attach" => Self::Attach(rest.trim()),
            _ => Self::Send(line),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = JsonFileSettings::in_config_dir()?;
    let config = load_config(&settings).await?;

    let client = GatewayClient::websocket(config);
    let registry = SessionRegistry::new(client.clone(), RegistryConfig::default());
    let chat = ChatController::new(client.clone(), registry.clone(), ChatConfig::default());

    tokio::spawn(print_status(client.status_receiver()));
    tokio::spawn(print_messages(chat.snapshots()));
    client.connect();

    let input: Input = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let picker = TerminalPicker {
        input: Arc::clone(&input),
    };

    loop {
        let Some(line) = input.lock().await.next_line().await? else {
            break;
        };
        let result = match Command::parse(&line) {
            Command::Quit => break,
            Command::Send(text) => chat.send(text, Vec::new()).await,
            Command::Attach(text) => {
                if text.is_empty() {
                    println!("usage: /attach <message>");
                    continue;
                }
                let attachments = pick_attachments(&picker).await;
                chat.send(text, attachments).await
            }
            Command::Abort => chat.abort().await.map(|_| ()),
            Command::Sessions => {
                print_sessions(&registry);
                Ok(())
            }
            Command::Switch(key) => chat.set_active_session(key).await,
        };
        if let Err(e) = result {
            tracing::warn!("{e}");
        }
    }

    client.disconnect();
    Ok(())
}

async fn load_config(settings: &JsonFileSettings) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::from_settings(settings).await?;
    let mut changed = false;
    if let Ok(url) = std::env::var("PINCHY_GATEWAY_URL") {
        config.url = url;
        changed = true;
    }
    if let Ok(token) = std::env::var("PINCHY_GATEWAY_TOKEN") {
        config.token = token;
        changed = true;
    }
    config
        .validate()
        .context("set PINCHY_GATEWAY_URL and PINCHY_GATEWAY_TOKEN")?;
    if changed {
        config.save_to(settings).await?;
        tracing::info!("Saved gateway settings to {}", settings.path().display());
    }
    Ok(config)
}

async fn pick_attachments(picker: &TerminalPicker) -> Vec<pinchy_core::protocol::ChatAttachment> {
    let reader = LocalFileReader;
    let mut attachments = Vec::new();
    for path in picker.pick_files().await {
        match reader.read(&path).await {
            Ok(file) => {
                println!("  + {} ({}, {})", file.name, file.mime_type, format_file_size(file.size));
                attachments.push(file.into_chat_attachment());
            }
            Err(e) => tracing::warn!("Skipping attachment: {e}"),
        }
    }
    attachments
}

fn print_sessions(registry: &SessionRegistry) {
    let active = registry.active_key();
    for session in registry.sessions() {
        let marker = if session.key == active { '*' } else { ' ' };
        let label = session.label.as_deref().unwrap_or("");
        let tokens = session.total_tokens.unwrap_or(0);
        println!("{marker} {} {label} ({tokens} tokens)", session.key);
    }
}

async fn print_status(mut rx: watch::Receiver<ConnectionStatus>) {
    loop {
        let status = *rx.borrow_and_update();
        println!("[{status}]");
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Print each message once it stops streaming.
async fn print_messages(mut snapshots: WatchStream<ChatSnapshot>) {
    let mut printed = HashSet::new();
    let mut session = String::new();
    while let Some(snapshot) = snapshots.next().await {
        if snapshot.session_key != session {
            session.clone_from(&snapshot.session_key);
            println!("── {session} ──");
        }
        for message in snapshot.messages.iter().filter(|m| !m.streaming) {
            if !printed.insert(message.id.clone()) {
                continue;
            }
            let who = match message.role {
                Role::User => "you",
                _ => "assistant",
            };
            match &message.error {
                Some(error) => println!("{who} (error)> {error}"),
                None => println!("{who}> {}", message.text),
            }
        }
    }
}
