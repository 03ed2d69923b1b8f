use anyhow::Context;
use clap::Parser;
use groupchat_client::{
    connect, present, ChannelSurface, ChatConnection, ClientConfig, ClientError, JsonLinesSurface,
    PresentationSurface, TerminalSurface,
};
use groupchat_core::ChatEvent;
use std::{io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "groupchat-client", about = "Join a group chat relay from the terminal")]
struct Args {
    /// Display name to request. The hub may add a numeric suffix.
    name: String,
    host: String,
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    /// Print events as JSON lines instead of a transcript.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
}

enum Input {
    Chat(String),
    Who,
    Quit,
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "/quit" => Input::Quit,
        "/who" => Input::Who,
        _ => Input::Chat(line.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let display: Box<dyn PresentationSurface> = if args.json {
        Box::new(JsonLinesSurface::stdout())
    } else {
        Box::new(TerminalSurface::stdout())
    };
    let (surface, mut events) = ChannelSurface::channel();

    let mut config = ClientConfig::new(args.name.clone(), args.host.clone(), args.port);
    config.handshake_timeout = Duration::from_secs(args.handshake_timeout);
    let connection = match connect(config, Arc::new(surface)).await {
        Ok(connection) => connection,
        Err(err) => {
            drain_events(&mut events, display.as_ref());
            return Err(err).with_context(|| format!("could not join {}:{}", args.host, args.port));
        }
    };

    let result = run_chat(&connection, &mut events, display.as_ref(), args.json).await;
    connection.close().await;
    drain_events(&mut events, display.as_ref());
    result
}

async fn run_chat(
    connection: &ChatConnection,
    events: &mut mpsc::UnboundedReceiver<ChatEvent>,
    display: &dyn PresentationSurface,
    json: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                present(display, &event);
                if event.is_terminal() {
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    debug!(event = "client_stdin_closed");
                    return Ok(());
                };
                match parse_input(&line) {
                    Input::Quit => return Ok(()),
                    Input::Who => print_users(&connection.users(), json),
                    Input::Chat(text) => match connection.submit_chat_text(&text).await {
                        Ok(()) => {}
                        Err(ClientError::NotConnected) => return Ok(()),
                        Err(err) => warn!(event = "client_submit_failed", error = %err),
                    },
                }
            }
        }
    }
}

fn print_users(users: &[String], json: bool) {
    if json {
        println!("{}", serde_json::json!({ "type": "users", "payload": { "users": users } }));
    } else {
        println!("online ({}): {}", users.len(), users.join(", "));
    }
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<ChatEvent>, display: &dyn PresentationSurface) {
    while let Ok(event) = events.try_recv() {
        present(display, &event);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_enabled = matches!(
        std::env::var("GROUPCHAT_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stderr_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}
