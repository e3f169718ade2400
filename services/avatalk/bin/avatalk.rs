//! Main Entrypoint for the Avatalk Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Building the microphone, socket, signed-URL and renderer adapters.
//! 3. Running one conversation until the session ends or Ctrl+C is pressed.

use anyhow::Context;
use avatalk_core::signaling::SignedUrlProvider;
use avatalk_core::{
    Collaborators, Command, CoordinatorState, SessionCoordinator, SessionNotice,
};
use avatalk_service::{
    config::Config,
    microphone::CpalBackend,
    renderer_bridge::BridgeRenderer,
    signed_url::{HttpSignedUrlProvider, PublicAgentUrl},
    socket::TungsteniteConnector,
};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Talk to a voice agent through an avatar renderer")]
struct Args {
    /// Agent to converse with. Overrides AGENT_ID.
    #[arg(long)]
    agent_id: Option<String>,

    /// Microphone name, or a substring of it. Overrides INPUT_DEVICE.
    #[arg(long)]
    input_device: Option<String>,
}

/// Listens for the `Ctrl+C` signal to end the conversation.
async fn shutdown_signal(commands: mpsc::Sender<Command>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Ending the conversation...");
    let _ = commands.send(Command::Shutdown).await;
}

/// Logs session notices and shuts down once a started session returns to idle.
async fn watch_notices(
    mut notices: mpsc::UnboundedReceiver<SessionNotice>,
    commands: mpsc::Sender<Command>,
) {
    let mut started = false;
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::StateChanged(CoordinatorState::Active) => {
                started = true;
                info!("Conversation is live. Press Ctrl+C to end it.");
            }
            SessionNotice::StateChanged(CoordinatorState::Idle) => {
                if started {
                    info!("Session ended.");
                }
                let _ = commands.send(Command::Shutdown).await;
                break;
            }
            SessionNotice::StateChanged(state) => info!(?state, "Session state changed"),
            SessionNotice::ConversationStarted { conversation_id } => {
                info!(%conversation_id, "Conversation started")
            }
            SessionNotice::UserTranscript(text) => info!(user = %text, "Transcript"),
            SessionNotice::AgentResponse(text) => info!(agent = %text, "Response"),
            SessionNotice::Interruption(reason) => info!(%reason, "Agent interrupted"),
            SessionNotice::ConnectionLost(reason) => warn!(%reason, "Connection lost"),
            SessionNotice::RendererDisconnected => warn!("Renderer disconnected"),
            SessionNotice::Error(message) => error!("{}", message),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(agent_id) = args.agent_id {
        config.agent_id = agent_id;
    }
    if let Some(input_device) = args.input_device {
        config.input_device = input_device;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Building session collaborators...");

    // --- 3. Build Adapters ---
    let renderer_url = config
        .renderer_url
        .clone()
        .context("RENDERER_URL must be set")?;
    let signaling: Arc<dyn SignedUrlProvider> = if config.agent_public {
        info!("Using public agent URL.");
        Arc::new(PublicAgentUrl::new(config.conversation_url.clone()))
    } else {
        Arc::new(HttpSignedUrlProvider::new(
            config.signed_url_endpoint.clone(),
            config.xi_api_key.take(),
        ))
    };
    let collaborators = Collaborators {
        renderer: Arc::new(BridgeRenderer::new(
            renderer_url,
            config.renderer_api_key.take(),
        )),
        signaling,
        connector: Arc::new(TungsteniteConnector),
        audio: Arc::new(CpalBackend),
    };

    // --- 4. Run the Session ---
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(8);
    let mut coordinator =
        SessionCoordinator::new(config.coordinator_config(), collaborators).with_notices(notice_tx);

    tokio::spawn(watch_notices(notice_rx, command_tx.clone()));
    tokio::spawn(shutdown_signal(command_tx.clone()));

    info!(agent_id = %config.agent_id, device = %config.input_device, "Starting conversation...");
    command_tx
        .send(Command::Start)
        .await
        .context("Session coordinator is not accepting commands")?;
    coordinator.run(command_rx).await;

    if let Some(e) = coordinator.last_error() {
        anyhow::bail!("Session failed: {}", e);
    }
    info!("Avatalk has shut down.");
    Ok(())
}
