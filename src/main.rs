//! Console host
//!
//! Starts a session and reads talk/device/chat commands from stdin.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hydrowcast_lib::webrtc::RtcMediaFactory;
use hydrowcast_lib::{load_config, AudioMixer, CpalBackend, Host, HostContext, HostEvent};

const HELP: &str = "\
Commands:
  intercom on|off         talk on the private intercom
  live on|off             go on air (ducks program audio)
  client <id> on|off      put a contributor on or off air
  device <name|default>   switch the microphone
  mute on|off             mute the microphone
  chat <text>             message every client
  clients                 list connected clients
  state                   show the talk state
  renegotiate <id>        rebuild a client's link
  kick <id>               disconnect a client
  quit";

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Intercom(bool),
    Live(bool),
    Client(String, bool),
    Device(Option<String>),
    Mute(bool),
    Chat(String),
    Clients,
    State,
    Renegotiate(String),
    Kick(String),
    Help,
    Quit,
}

fn parse_switch(word: Option<&str>) -> Option<bool> {
    match word {
        Some("on") => Some(true),
        Some("off") => Some(false),
        _ => None,
    }
}

fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let mut words = rest.split_whitespace();

    let command = match head {
        "intercom" => ConsoleCommand::Intercom(parse_switch(words.next())?),
        "live" => ConsoleCommand::Live(parse_switch(words.next())?),
        "mute" => ConsoleCommand::Mute(parse_switch(words.next())?),
        "client" => {
            let id = words.next()?.to_string();
            ConsoleCommand::Client(id, parse_switch(words.next())?)
        }
        "device" if rest == "default" => ConsoleCommand::Device(None),
        "device" if !rest.is_empty() => ConsoleCommand::Device(Some(rest.to_string())),
        "chat" if !rest.is_empty() => ConsoleCommand::Chat(rest.to_string()),
        "clients" => ConsoleCommand::Clients,
        "state" => ConsoleCommand::State,
        "renegotiate" => ConsoleCommand::Renegotiate(words.next()?.to_string()),
        "kick" => ConsoleCommand::Kick(words.next()?.to_string()),
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return None,
    };
    Some(command)
}

async fn execute(host: &Host, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Intercom(true) => print_state(&host.press_intercom().await),
        ConsoleCommand::Intercom(false) => print_state(&host.release_intercom().await),
        ConsoleCommand::Live(true) => print_state(&host.press_live().await),
        ConsoleCommand::Live(false) => print_state(&host.release_live().await),
        ConsoleCommand::Client(id, active) => print_state(&host.set_client_live(&id, active).await),
        ConsoleCommand::Device(device) => match host.set_capture_device(device).await {
            Ok(name) => println!("Capturing from {}", name),
            Err(e) => println!("Device switch failed: {}", e),
        },
        ConsoleCommand::Mute(muted) => {
            host.set_muted(muted).await;
            println!("Microphone {}", if muted { "muted" } else { "open" });
        }
        ConsoleCommand::Chat(text) => {
            if let Err(e) = host.post_chat(&text).await {
                println!("{}", e);
            }
        }
        ConsoleCommand::Clients => {
            let clients = host.clients().await;
            if clients.is_empty() {
                println!("No clients");
            }
            for client in clients {
                println!(
                    "  {} {} ({}){} level {:.2}",
                    client.client_id,
                    client.display_name,
                    client.remote_address,
                    if client.authenticated { "" } else { " [pending]" },
                    client.audio_level
                );
            }
        }
        ConsoleCommand::State => print_state(&host.talk_state().await),
        ConsoleCommand::Renegotiate(id) => {
            if let Err(e) = host.renegotiate(&id).await {
                println!("{}", e);
            }
        }
        ConsoleCommand::Kick(id) => {
            if let Err(e) = host.kick(&id).await {
                println!("{}", e);
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}

fn print_state(state: &hydrowcast_lib::TalkState) {
    println!(
        "Mode: {:?}, ducking: {}, live clients: {:?}",
        state.mode, state.ducking, state.live_client_ids
    );
}

async fn log_events(mut events: broadcast::Receiver<HostEvent>) {
    loop {
        match events.recv().await {
            Ok(HostEvent::ClientJoined(client)) => {
                tracing::info!("{} joined ({})", client.display_name, client.client_id)
            }
            Ok(HostEvent::ClientLeft { display_name, .. }) => tracing::info!("{} left", display_name),
            Ok(HostEvent::Chat(entry)) => tracing::info!("[chat] {}: {}", entry.display_name, entry.text),
            Ok(HostEvent::ClipReceived {
                client_id, audio, ..
            }) => tracing::info!("Clip of {} bytes from {}", audio.len(), client_id),
            Ok(HostEvent::ClientPtt {
                client_id,
                channel,
                active,
            }) => tracing::info!("{} {:?} talk: {}", client_id, channel, active),
            Ok(HostEvent::LinkState { client_id, state }) => {
                tracing::debug!("Link {} is {:?}", client_id, state)
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event log skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config()?;
    config.apply_env()?;
    config.validate()?;

    let factory = Arc::new(RtcMediaFactory::new(config.stun_servers.clone()));
    let ctx = HostContext::new(
        config,
        factory,
        Arc::new(CpalBackend),
        Arc::new(AudioMixer::new()),
    );
    let host = Host::new(ctx);
    tokio::spawn(log_events(host.subscribe()));

    let report = host.start_report().await;
    if !report.success {
        bail!(
            "Could not start hosting: {}",
            report.error.unwrap_or_default()
        );
    }
    println!(
        "Session code {} on port {}. Type 'help' for commands.",
        report.session_code.unwrap_or_default(),
        report.port.unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(&line) {
                    Some(ConsoleCommand::Quit) => break,
                    Some(command) => execute(&host, command).await,
                    None => println!("Unknown command. Type 'help'."),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.stop().await?;
    Ok(())
}
