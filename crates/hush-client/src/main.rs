use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use hush_client::command::{self, InputCommand, HELP};
use hush_client::dummy::{DummyMediaProvider, DummyPeerConnector};
use hush_client::{
    CallCommand, ChatCodec, Negotiator, NegotiatorEvent, NegotiatorState, SignalingClient,
};
use hush_common::{ClientMessage, ServerMessage};
use hush_crypto::{ChannelKey, ClientKeys};

#[derive(Parser, Debug)]
#[command(name = "hush-client")]
#[command(about = "Hush client - encrypted room chat and call signaling")]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, env = "HUSH_RELAY_URL", default_value = "ws://127.0.0.1:8080/ws")]
    relay_url: String,

    /// Join this room on connect
    #[arg(long, conflicts_with = "create")]
    join: Option<String>,

    /// Create a new room on connect
    #[arg(long, default_value_t = false)]
    create: bool,

    /// Pre-shared channel key (base64). Without it, only this process can read its payloads.
    #[arg(long, env = "HUSH_ROOM_KEY", hide_env_values = true)]
    room_key: Option<String>,

    /// Print a freshly generated room key and exit
    #[arg(long, default_value_t = false)]
    generate_key: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Default)]
struct CallToggles {
    sharing: bool,
    muted: bool,
    camera_off: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    hush_common::init_tracing_with_default(&args.log_level);

    if args.generate_key {
        println!("{}", ChannelKey::generate().to_base64());
        return Ok(());
    }

    let keys = match &args.room_key {
        Some(encoded) => {
            ClientKeys::with_channel_key(ChannelKey::from_base64(encoded).context("--room-key")?)
        }
        None => {
            eprintln!("warning: no --room-key given; peers will not be able to read your messages");
            ClientKeys::generate()
        }
    };

    let client = SignalingClient::connect(&args.relay_url)
        .await
        .with_context(|| format!("connecting to {}", args.relay_url))?;
    let relay = client.spawn();
    let outbound = relay.outbound.clone();
    let mut inbound = relay.inbound;

    let mut chat = ChatCodec::new(keys.channel());
    chat.set_member_id(relay.member_id.clone());
    println!("connected as {}", relay.member_id);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (negotiator_tx, negotiator_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(16);
    let mut negotiator = Negotiator::new(
        DummyMediaProvider::new(),
        DummyPeerConnector,
        keys.channel(),
        outbound.clone(),
        events_tx,
    );
    negotiator.set_member_id(relay.member_id.clone());
    let negotiator_task = tokio::spawn(negotiator.run(negotiator_rx, command_rx));

    if args.create {
        outbound.send(ClientMessage::CreateGroup)?;
    } else if let Some(group_id) = args.join.clone() {
        outbound.send(ClientMessage::JoinGroup { group_id })?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut toggles = CallToggles::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break; };
                let cmd = match command::parse(&line) {
                    Ok(cmd) => cmd,
                    Err(command::InputError::Empty) => continue,
                    Err(err) => {
                        println!("{err}");
                        continue;
                    }
                };
                let msg = match cmd {
                    InputCommand::Quit => break,
                    InputCommand::Help => {
                        println!("{HELP}");
                        None
                    }
                    InputCommand::Chat(text) => match seal_chat(&chat, &text) {
                        Some(msg) => Some(msg),
                        None => continue,
                    },
                    InputCommand::Create => Some(ClientMessage::CreateGroup),
                    InputCommand::Join(group_id) => Some(ClientMessage::JoinGroup { group_id }),
                    InputCommand::Leave => {
                        command_tx.send(CallCommand::End).await?;
                        Some(ClientMessage::LeaveGroup)
                    }
                    InputCommand::Call(call_type) => Some(ClientMessage::StartCall { call_type }),
                    InputCommand::Hangup => {
                        command_tx.send(CallCommand::End).await?;
                        None
                    }
                    InputCommand::ToggleScreen => {
                        toggles.sharing = !toggles.sharing;
                        let cmd = if toggles.sharing {
                            CallCommand::StartScreenShare
                        } else {
                            CallCommand::StopScreenShare
                        };
                        command_tx.send(cmd).await?;
                        None
                    }
                    InputCommand::ToggleMute => {
                        toggles.muted = !toggles.muted;
                        command_tx.send(CallCommand::SetMuted(toggles.muted)).await?;
                        None
                    }
                    InputCommand::ToggleCamera => {
                        toggles.camera_off = !toggles.camera_off;
                        command_tx
                            .send(CallCommand::SetCameraEnabled(!toggles.camera_off))
                            .await?;
                        None
                    }
                };
                if let Some(msg) = msg {
                    outbound.send(msg)?;
                }
            }
            msg = inbound.recv() => {
                let Some(msg) = msg else {
                    println!("relay connection closed");
                    break;
                };
                match msg {
                    ServerMessage::ChatMessage { content, sender, timestamp } => {
                        match chat.decode(&content, &sender, timestamp) {
                            Ok(line) if line.own => debug!("own echo ignored"),
                            Ok(line) => println!("[{}] {}", short(&line.sender), line.text),
                            Err(err) => warn!(%sender, "dropping unreadable chat message: {}", err),
                        }
                    }
                    ServerMessage::GroupCreated { group_id } => println!("room created: {group_id}"),
                    ServerMessage::JoinedGroup { group_id } => println!("joined room {group_id}"),
                    ServerMessage::LeftGroup { group_id } => println!("left room {group_id}"),
                    ServerMessage::Error { message } => println!("relay error: {message}"),
                    msg @ (ServerMessage::CallAllowed { .. } | ServerMessage::EncryptedSignaling { .. }) => {
                        negotiator_tx.send(msg).await?;
                    }
                    ServerMessage::Welcome { .. } => {}
                }
            }
            Some(event) = events_rx.recv() => {
                if matches!(event, NegotiatorEvent::StateChanged(NegotiatorState::Idle)) {
                    toggles = CallToggles::default();
                }
                print_event(&event);
            }
        }
    }

    drop(command_tx);
    let _ = negotiator_task.await;
    Ok(())
}

fn print_event(event: &NegotiatorEvent) {
    match event {
        NegotiatorEvent::StateChanged(state) => println!("call: {state:?}"),
        NegotiatorEvent::RemoteTrack(track) => println!("call: remote {:?} track", track.kind),
        NegotiatorEvent::ScreenShare { active } => {
            println!("call: screen share {}", if *active { "on" } else { "off" })
        }
        NegotiatorEvent::PeerStatus(status) => println!("peer: {status:?}"),
        NegotiatorEvent::CallFailed {
            reason,
            retry_after,
        } => println!(
            "call failed: {reason} (back to chat in {}s)",
            retry_after.as_secs()
        ),
        NegotiatorEvent::CallEnded { duration } => match duration {
            Some(d) => println!("call ended after {}s", d.as_secs()),
            None => println!("call ended"),
        },
        NegotiatorEvent::ReturnedToChat => println!("back to chat"),
    }
}

/// A chat line that cannot be sealed is dropped; the session keeps going.
fn seal_chat(chat: &ChatCodec, text: &str) -> Option<ClientMessage> {
    match chat.encode(text) {
        Ok(msg) => Some(msg),
        Err(err) => {
            warn!("could not seal chat message: {}", err);
            None
        }
    }
}

fn short(member_id: &str) -> &str {
    member_id.get(..8).unwrap_or(member_id)
}
