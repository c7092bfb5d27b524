//! Callwire CLI Application

use anyhow::{bail, Context, Result};
use callwire_core::prelude::*;
use callwire_core::RelayEndpoint;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON engine configuration; defaults apply to missing fields
    #[arg(short, long, env = "CALLWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two local engines over an in-process relay
    Loopback {
        /// Kind of call
        #[arg(long, value_enum, default_value = "video")]
        kind: KindArg,

        /// How the callee answers
        #[arg(long, value_enum, default_value = "accept")]
        answer: AnswerPolicy,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        hold: u64,

        /// Override the ring timeout, in seconds
        #[arg(long)]
        ring_timeout: Option<u64>,
    },

    /// Print the effective engine configuration
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Audio,
    Video,
}

impl From<KindArg> for CallKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Audio => CallKind::Audio,
            KindArg::Video => CallKind::Video,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AnswerPolicy {
    /// Accept the call
    Accept,
    /// Reject the call
    Reject,
    /// Let it ring until the caller gives up
    Ignore,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callwire=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Loopback {
            kind,
            answer,
            hold,
            ring_timeout,
        } => {
            let mut config = config;
            if let Some(secs) = ring_timeout {
                config.ring_timeout = Duration::from_secs(secs);
            }
            handle_loopback(config, kind.into(), answer, Duration::from_secs(hold)).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<CallEngineConfig> {
    let Some(path) = path else {
        return Ok(CallEngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    Ok(CallEngineConfig::from_json(&text)?)
}

fn join(
    relay: &SignalingRelay,
    name: &str,
    config: CallEngineConfig,
) -> Result<Arc<CallEngine<RelayEndpoint>>> {
    let participant = ParticipantId::new(name);
    let (channel, inbound) = relay.register(participant.clone());
    let engine = CallEngine::builder(participant, Arc::new(channel))
        .with_config(config)
        .build()?;
    engine.spawn_inbound(inbound);
    Ok(engine)
}

fn describe(event: &CallEvent) -> Option<String> {
    let line = match event {
        CallEvent::CallStateChange { previous, current } => format!("{previous} → {current}"),
        CallEvent::IncomingCall { call } => {
            format!("📞 Incoming {} call from {}", call.kind, call.remote_participant)
        }
        CallEvent::OutgoingCall { call } => {
            format!("📞 Ringing {} (call {})", call.remote_participant, call.call_id)
        }
        CallEvent::LocalStreamReady { stream } => {
            format!("🎙️  Local stream ready ({} tracks)", stream.tracks().len())
        }
        CallEvent::RemoteStreamReady { stream } => {
            format!("🔊 Remote stream ready ({} tracks)", stream.tracks().len())
        }
        CallEvent::ConnectionStateChange { state, .. } => format!("🔗 Peer connection {state:?}"),
        CallEvent::CallRejected { .. } => "❌ Call rejected".to_string(),
        CallEvent::CallEnded { record } => format!("📴 Call {}", record.outcome),
        CallEvent::CallFailed { reason, .. } => format!("❌ Call failed: {reason}"),
        CallEvent::Error { kind, error } => format!("⚠️  {kind}: {error}"),
        CallEvent::VideoToggled { .. } | CallEvent::AudioToggled { .. } | CallEvent::Cleanup { .. } => {
            return None
        }
    };
    Some(line)
}

fn print_events(label: &'static str, engine: &CallEngine<RelayEndpoint>) {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Some(line) = describe(&event) {
                println!("[{label}] {line}");
            }
        }
    });
}

async fn handle_loopback(
    config: CallEngineConfig,
    kind: CallKind,
    answer: AnswerPolicy,
    hold: Duration,
) -> Result<()> {
    let ring_timeout = config.ring_timeout;
    let relay = SignalingRelay::new();
    let caller = join(&relay, "caller", config.clone())?;
    let callee = join(&relay, "callee", config)?;
    print_events("caller", &caller);
    print_events("callee", &callee);

    let mut callee_events = callee.subscribe_events();
    let answering = Arc::clone(&callee);
    tokio::spawn(async move {
        while let Ok(event) = callee_events.recv().await {
            if !matches!(event, CallEvent::IncomingCall { .. }) {
                continue;
            }
            let result = match answer {
                AnswerPolicy::Accept => answering.accept_call().await,
                AnswerPolicy::Reject => answering.reject_call().await,
                AnswerPolicy::Ignore => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Callee failed to answer");
            }
        }
    });

    let mut caller_events = caller.subscribe_events();
    let call_id = caller
        .start_call(ParticipantId::new("callee"), kind, None)
        .await?;
    println!("✅ Call placed with ID: {call_id}");

    let settle = ring_timeout + Duration::from_secs(30);
    let connected = tokio::time::timeout(settle, async {
        while let Ok(event) = caller_events.recv().await {
            if let CallEvent::CallStateChange { current, .. } = event {
                match current {
                    CallState::Connected => return true,
                    CallState::Idle => return false,
                    _ => {}
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if connected {
        println!("⏳ Holding for {}s", hold.as_secs());
        tokio::time::sleep(hold).await;
        caller.end_call().await?;
    } else if caller.state() != CallState::Idle {
        caller.end_call().await?;
    }

    let Some(record) = caller.last_call() else {
        bail!("call finished without a record");
    };
    println!(
        "📋 {} {} call with {}: {} (connected for {}s)",
        direction(record.role),
        record.kind,
        record.remote_participant,
        record.outcome,
        record.duration().map_or(0, |d| d.num_seconds())
    );
    Ok(())
}

fn direction(role: CallRole) -> &'static str {
    match role {
        CallRole::Initiator => "Outgoing",
        CallRole::Receiver => "Incoming",
    }
}
