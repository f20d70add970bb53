//! Wirechat call signaling demo CLI
//!
//! Runs two in-process clients over the in-memory relay and drives a
//! scripted call through the full signaling path: offer, answer, candidate
//! exchange, and teardown with a call summary.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use wirechat_calls::prelude::*;
use wirechat_calls::{ChatMessageSink, SummaryError, DEFAULT_STUN_SERVERS};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted loopback call between two in-process clients
    Demo {
        /// Negotiate a video call instead of audio
        #[arg(long)]
        video: bool,

        /// How long the call stays active before hanging up
        #[arg(long, default_value = "3")]
        seconds: u64,
    },

    /// Show the signaling stack configuration
    Status,
}

/// Prints call summaries the way the chat stream would display them
struct ConsoleSink {
    label: &'static str,
}

#[async_trait]
impl ChatMessageSink for ConsoleSink {
    async fn send_chat_message(
        &self,
        _target: ConversationTarget,
        text: &str,
        message_type: &str,
        meta: serde_json::Value,
    ) -> Result<(), SummaryError> {
        println!("[{}] chat message ({message_type}): {text}", self.label);
        println!("[{}]   meta: {meta}", self.label);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("wirechat=info")
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { video, seconds } => run_demo(video, seconds).await?,
        Commands::Status => print_status(),
    }

    Ok(())
}

fn client(
    relay: &LocalRelay,
    id: i64,
    name: &'static str,
) -> Result<(CallService, Arc<RelayClient>)> {
    let me = PeerInfo {
        id: UserId(id),
        name: name.to_string(),
        avatar_url: None,
    };
    let relay_client = Arc::new(relay.connect(me.id));
    let service = CallService::builder(me)
        .with_transport(relay_client.clone())
        .with_message_sink(Arc::new(ConsoleSink { label: name }))
        .build()?;

    // Deliver inbound signals into the state machine.
    let pump_client = relay_client.clone();
    let pump_service = service.clone();
    tokio::spawn(async move {
        while let Some(envelope) = pump_client.recv().await {
            pump_service.handle_incoming_signal(envelope).await;
        }
    });

    // Narrate call events.
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::IncomingCall { kind, from, .. } => {
                    println!("[{name}] incoming {kind:?} call from {}", from.name);
                }
                CallEvent::CallInitiated { kind, .. } => {
                    println!("[{name}] calling ({kind:?})...");
                }
                CallEvent::CallConnected { .. } => println!("[{name}] call connected"),
                CallEvent::CallEnded { reason, .. } => {
                    println!("[{name}] call ended ({})", reason.as_str());
                }
                CallEvent::Notice(text) => println!("[{name}] {text}"),
                CallEvent::LocalStream { .. } | CallEvent::RemoteStream { .. } => {}
            }
        }
    });

    Ok((service, relay_client))
}

async fn run_demo(video: bool, seconds: u64) -> Result<()> {
    let kind = if video { CallKind::Video } else { CallKind::Audio };
    println!("Starting loopback demo ({kind:?}, {seconds}s active)\n");

    let relay = LocalRelay::new();
    let (ana, ana_relay) = client(&relay, 1, "ana")?;
    let (ben, ben_relay) = client(&relay, 2, "ben")?;

    let channel = ChannelId::pair(UserId(1), UserId(2));
    ana_relay.subscribe(channel.clone());
    ben_relay.subscribe(channel);

    // Ben answers any incoming call after a short ring.
    let answerer = ben.clone();
    let mut ben_events = ben.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = ben_events.recv().await {
            if matches!(event, CallEvent::IncomingCall { .. }) {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Err(e) = answerer.accept_call().await {
                    eprintln!("[ben] accept failed: {e}");
                }
            }
        }
    });

    ana.start_call(ConversationTarget::User(UserId(2)), kind)
        .await?;

    // Wait for both ends to go active, then hold the call.
    let mut snapshot = ana.snapshot();
    tokio::time::timeout(
        Duration::from_secs(10),
        snapshot.wait_for(|s| s.status == CallStatus::Active),
    )
    .await
    .map_err(|_| anyhow::anyhow!("call never became active"))??;

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    println!("\n[ana] hanging up after {}", ana.current().duration_label());
    ana.hang_up().await;

    // Let Ben's teardown and both summaries drain.
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("\nDemo complete.");
    Ok(())
}

fn print_status() {
    println!("wirechat-calls {}", env!("CARGO_PKG_VERSION"));
    println!("signal transport: in-memory relay (demo) / host-provided in production");
    println!("media backend:    webrtc-rs");
    println!("stun servers:");
    for server in DEFAULT_STUN_SERVERS {
        println!("  {server}");
    }
}
