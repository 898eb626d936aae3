// Skiff daemon: discovery, encrypted transport and session wiring.

mod config;
mod discovery;
mod transport;

use std::path::Path;
use std::sync::Arc;

use skiff_core::{
    InvitationResponder, Keypair, PeerConnectionState, PeerId, Progress, Session, SessionConfig,
    SessionError, SessionEvents, TransferMetadata,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::transport::{TcpTransport, TransportEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("skiff-daemon {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let keypair = Arc::new(Keypair::generate());
    let local = PeerId::new(keypair.device_id(), cfg.display_name.clone());
    info!(%local, "starting");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (tcp, dial_rx) = TcpTransport::new(keypair, cfg.display_name.clone(), events_tx);
    let session = Session::new(
        local,
        tcp.clone(),
        SessionConfig::new(cfg.download_dir.clone()),
        Arc::new(LogEvents),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        session.start()?;
        tokio::spawn(discovery::run_discovery(
            tcp.clone(),
            cfg.discovery_port,
            cfg.transport_port,
        ));
        tokio::spawn(transport::run_transport(
            tcp.clone(),
            cfg.transport_port,
            dial_rx,
        ));
        tokio::spawn(pump_events(events_rx, session.clone()));
        shutdown_signal().await?;
        session.stop().await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Translate transport events into session handler calls. Long-running
/// handlers (streams, messages, invitations) get their own task so one slow
/// transfer never stalls the pump.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    session: Session<TcpTransport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Discovered { peer } => {
                session.handle_peer_discovered(peer.clone()).await;
                // The lower device ID dials; avoids crossed duplicate connections.
                if session.local_peer().device_id().as_bytes() < peer.device_id().as_bytes() {
                    if let Err(error) = session.connect_to(&peer).await {
                        warn!(%peer, %error, "invite failed");
                    }
                }
            }
            TransportEvent::Lost { peer } => session.handle_peer_lost(&peer).await,
            TransportEvent::Connected { peer } => {
                session
                    .handle_peer_state_changed(peer, PeerConnectionState::Connected)
                    .await;
            }
            TransportEvent::Disconnected { peer } => {
                session
                    .handle_peer_state_changed(peer, PeerConnectionState::NotConnected)
                    .await;
            }
            TransportEvent::Invitation { peer, reply } => {
                let session = session.clone();
                tokio::spawn(async move {
                    let _ = reply.send(session.handle_invitation(&peer).await);
                });
            }
            TransportEvent::Message { peer, bytes } => {
                let session = session.clone();
                tokio::spawn(async move {
                    let _ = session.handle_message(&peer, &bytes).await;
                });
            }
            TransportEvent::Stream { peer, reader } => {
                let session = session.clone();
                tokio::spawn(async move {
                    let _ = session.handle_incoming_stream(&peer, reader).await;
                });
            }
        }
    }
}

/// Headless event sink: log everything, accept LAN invitations.
struct LogEvents;

impl SessionEvents for LogEvents {
    fn peer_discovered(&self, peer: &PeerId) {
        info!(%peer, "discovered");
    }
    fn peer_lost(&self, peer: &PeerId) {
        info!(%peer, "lost");
    }
    fn peer_connected(&self, peer: &PeerId) {
        info!(%peer, "connected");
    }
    fn peer_disconnected(&self, peer: &PeerId) {
        info!(%peer, "disconnected");
    }
    fn invitation_received(&self, peer: &PeerId, responder: InvitationResponder) {
        info!(%peer, "accepting invitation");
        responder.accept();
    }
    fn message_received(&self, peer: &PeerId, text: &str) {
        info!(%peer, text, "message");
    }
    fn transfer_progress(&self, filename: &str, peer: &PeerId, progress: Progress) {
        info!(
            filename,
            %peer,
            percent = (progress.fraction() * 100.0) as u32,
            "transfer progress"
        );
    }
    fn did_finish_receiving(&self, metadata: &TransferMetadata, peer: &PeerId, destination: &Path) {
        info!(file = %metadata.filename, %peer, ?destination, "received file");
    }
    fn did_fail_receiving(
        &self,
        metadata: Option<&TransferMetadata>,
        peer: &PeerId,
        error: &SessionError,
    ) {
        let file = metadata.map(|m| m.filename.as_str()).unwrap_or("?");
        warn!(file, %peer, %error, "receive failed");
    }
    fn did_fail_sending(
        &self,
        metadata: Option<&TransferMetadata>,
        peers: &[PeerId],
        error: &SessionError,
    ) {
        let file = metadata.map(|m| m.filename.as_str()).unwrap_or("?");
        warn!(file, ?peers, %error, "send failed");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
