//! Session coordinator: owns the transport handle, the peer roster, the
//! receive state machine and the pending queue; routes sends and fans
//! transport events into the typed event sink.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::event::{InvitationResponder, SessionEvents};
use crate::header::{decode_header, encode_header, read_header};
use crate::identity::PeerId;
use crate::metadata::TransferMetadata;
use crate::pending::PendingQueue;
use crate::progress::{Progress, ProgressUpdate};
use crate::receive::{ReceiveManager, CHUNK_SIZE};
use crate::transport::Transport;

/// Connection lifecycle of one peer. Terminal per attempt; visibility
/// (discovered/lost) is tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Discovered,
    Inviting,
    Connecting,
    Connected,
    NotConnected,
}

/// What to do with an in-flight receive when its peer disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Close and discard the transfer (default).
    #[default]
    CancelActiveReceive,
    /// Keep the transfer so a quick reconnect can resume it.
    KeepActiveReceive,
}

/// Session tuning. The invitation timeout bounds how long a transport thread
/// can be parked on a user decision.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scratch_dir: PathBuf,
    pub disconnect_policy: DisconnectPolicy,
    pub invitation_timeout: Duration,
}

impl SessionConfig {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            disconnect_policy: DisconnectPolicy::default(),
            invitation_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Default)]
struct Roster {
    discovered: HashSet<PeerId>,
    connections: HashMap<PeerId, PeerConnectionState>,
}

impl Roster {
    fn is_connected(&self, peer: &PeerId) -> bool {
        matches!(
            self.connections.get(peer),
            Some(PeerConnectionState::Connected)
        )
    }

    fn connected(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|(_, s)| matches!(s, PeerConnectionState::Connected))
            .map(|(p, _)| p.clone())
            .collect()
    }
}

struct Inner<T> {
    local: PeerId,
    transport: T,
    config: SessionConfig,
    events: Arc<dyn SessionEvents>,
    roster: Mutex<Roster>,
    receives: ReceiveManager,
    pending: Mutex<PendingQueue>,
    progress_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<ProgressUpdate>>>,
    started: AtomicBool,
}

/// The top-level façade. Cheap to clone; clones share all state.
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(
        local: PeerId,
        transport: T,
        config: SessionConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Self {
        let receives = ReceiveManager::new(config.scratch_dir.clone());
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                config,
                events,
                roster: Mutex::new(Roster::default()),
                receives,
                pending: Mutex::new(PendingQueue::new()),
                progress_tx: std::sync::Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Receive-side transfer state, for status queries and explicit
    /// cancel/complete from the caller.
    pub fn receives(&self) -> &ReceiveManager {
        &self.inner.receives
    }

    /// Subscribe to per-chunk progress updates. Replaces any prior
    /// subscription. Delivery is fire-and-continue: a slow consumer never
    /// stalls a transfer loop.
    pub fn subscribe_progress(&self) -> mpsc::UnboundedReceiver<ProgressUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.progress_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Begin advertising and browsing. Idempotent while started.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let started = self
            .inner
            .transport
            .start_advertising()
            .and_then(|_| self.inner.transport.start_browsing());
        if let Err(error) = started {
            warn!(%error, "failed to start transport");
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(SessionError::TransportUnavailable);
        }
        info!(local = %self.inner.local, "session started");
        Ok(())
    }

    /// End advertising and browsing and clear the roster. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.transport.stop_advertising();
        self.inner.transport.stop_browsing();
        *self.inner.roster.lock().await = Roster::default();
        info!("session stopped");
    }

    /// Ask a discovered peer to connect. The outcome arrives later through
    /// `handle_peer_state_changed`.
    pub async fn connect_to(&self, peer: &PeerId) -> Result<(), SessionError> {
        self.ensure_started()?;
        self.inner
            .roster
            .lock()
            .await
            .connections
            .insert(peer.clone(), PeerConnectionState::Inviting);
        self.inner
            .transport
            .invite(peer)
            .map_err(|source| SessionError::SendFailed {
                peers: vec![peer.clone()],
                source,
            })
    }

    /// Send a text message over the reliable channel, to the given peers or
    /// to the whole connected roster.
    pub async fn send_message(
        &self,
        text: &str,
        peers: Option<&[PeerId]>,
    ) -> Result<(), SessionError> {
        self.ensure_started()?;
        let targets = match peers {
            Some(list) => list.to_vec(),
            None => self.inner.roster.lock().await.connected(),
        };
        if targets.is_empty() {
            return Ok(());
        }
        match self
            .inner
            .transport
            .send(text.as_bytes().to_vec(), &targets, true)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) => {
                let err = SessionError::SendFailed {
                    peers: targets.clone(),
                    source,
                };
                self.inner.events.did_fail_sending_message(&targets, &err);
                Err(err)
            }
        }
    }

    /// Send a whole file as one reliable message (header ++ file bytes) to
    /// every connected target; targets that are not connected are queued and
    /// replayed when they connect.
    pub async fn send_file(&self, path: &Path, peers: &[PeerId]) -> Result<(), SessionError> {
        self.ensure_started()?;
        let metadata = TransferMetadata::for_path(path)?;

        let (connected, offline): (Vec<PeerId>, Vec<PeerId>) = {
            let roster = self.inner.roster.lock().await;
            peers.iter().cloned().partition(|p| roster.is_connected(p))
        };
        if !offline.is_empty() {
            debug!(file = %metadata.filename, peers = offline.len(), "queueing send for offline peers");
            self.inner.pending.lock().await.enqueue(path, offline);
        }
        if connected.is_empty() {
            return Ok(());
        }

        let mut payload = encode_header(&metadata)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => payload.extend_from_slice(&bytes),
            Err(source) => {
                let err = SessionError::StorageUnavailable { source };
                self.inner
                    .events
                    .did_fail_sending(Some(&metadata), &connected, &err);
                return Err(err);
            }
        }

        self.inner
            .events
            .did_start_sending(path, &metadata, &connected);
        match self.inner.transport.send(payload, &connected, true).await {
            Ok(()) => {
                info!(file = %metadata.filename, peers = connected.len(), "file sent");
                self.inner.events.did_finish_sending(&metadata, &connected);
                Ok(())
            }
            Err(source) => {
                let err = SessionError::SendFailed {
                    peers: connected.clone(),
                    source,
                };
                self.inner
                    .events
                    .did_fail_sending(Some(&metadata), &connected, &err);
                Err(err)
            }
        }
    }

    /// Stream a file to one peer in fixed-size chunks, optionally resuming
    /// from a byte offset. Bounds memory to one chunk and emits progress
    /// after every chunk; the large-file path.
    pub async fn send_file_streaming(
        &self,
        path: &Path,
        peer: &PeerId,
        resume_from: u64,
    ) -> Result<(), SessionError> {
        self.ensure_started()?;
        let mut metadata = TransferMetadata::for_path(path)?;
        metadata.resume_offset = resume_from;
        let header = encode_header(&metadata)?;
        let peers = std::slice::from_ref(peer);

        let mut file = File::open(path)
            .await
            .map_err(|source| SessionError::StorageUnavailable { source })?;
        if resume_from > 0 {
            file.seek(std::io::SeekFrom::Start(resume_from))
                .await
                .map_err(|source| SessionError::StorageUnavailable { source })?;
        }

        let mut stream = match self.inner.transport.open_stream(&metadata.filename, peer).await {
            Ok(s) => s,
            Err(source) => {
                let err = SessionError::SendFailed {
                    peers: vec![peer.clone()],
                    source,
                };
                self.inner.events.did_fail_sending(Some(&metadata), peers, &err);
                return Err(err);
            }
        };
        if let Err(source) = stream.write_all(&header).await {
            let err = SessionError::SendFailed {
                peers: vec![peer.clone()],
                source,
            };
            self.inner.events.did_fail_sending(Some(&metadata), peers, &err);
            return Err(err);
        }

        self.inner.events.did_start_sending(path, &metadata, peers);
        let mut sent = resume_from;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(source) => {
                    let err = SessionError::StorageUnavailable { source };
                    self.inner.events.did_fail_sending(Some(&metadata), peers, &err);
                    return Err(err);
                }
            };
            if n == 0 {
                break;
            }
            if let Err(source) = stream.write_all(&buf[..n]).await {
                let err = SessionError::SendFailed {
                    peers: vec![peer.clone()],
                    source,
                };
                self.inner.events.did_fail_sending(Some(&metadata), peers, &err);
                return Err(err);
            }
            sent += n as u64;
            self.emit_progress(&metadata.filename, peer, Progress::new(sent, metadata.file_size));
        }
        if let Err(source) = stream.shutdown().await {
            let err = SessionError::SendFailed {
                peers: vec![peer.clone()],
                source,
            };
            self.inner.events.did_fail_sending(Some(&metadata), peers, &err);
            return Err(err);
        }

        info!(file = %metadata.filename, %peer, sent, "file streamed");
        self.inner.events.did_finish_sending(&metadata, peers);
        Ok(())
    }

    /// Transport callback: a peer became visible.
    pub async fn handle_peer_discovered(&self, peer: PeerId) {
        {
            let mut roster = self.inner.roster.lock().await;
            roster.discovered.insert(peer.clone());
            roster
                .connections
                .entry(peer.clone())
                .or_insert(PeerConnectionState::Discovered);
        }
        debug!(%peer, "peer discovered");
        self.inner.events.peer_discovered(&peer);
    }

    /// Transport callback: a peer stopped being visible. Connection state is
    /// tracked independently and stays untouched.
    pub async fn handle_peer_lost(&self, peer: &PeerId) {
        self.inner.roster.lock().await.discovered.remove(peer);
        debug!(%peer, "peer lost");
        self.inner.events.peer_lost(peer);
    }

    /// Transport callback: a peer's connection state changed. Connection
    /// replays any queued sends; disconnection applies the configured policy
    /// to an in-flight receive.
    pub async fn handle_peer_state_changed(&self, peer: PeerId, state: PeerConnectionState) {
        let connected_snapshot = {
            let mut roster = self.inner.roster.lock().await;
            roster.connections.insert(peer.clone(), state);
            roster.connected().into_iter().collect::<HashSet<_>>()
        };
        match state {
            PeerConnectionState::Connected => {
                info!(%peer, "peer connected");
                self.inner.events.peer_connected(&peer);
                let mut to_send = Vec::new();
                self.inner.pending.lock().await.flush(
                    &peer,
                    |p| connected_snapshot.contains(p),
                    |path, p| to_send.push((path.to_path_buf(), p.clone())),
                );
                for (path, target) in to_send {
                    if let Err(error) = self.send_file(&path, std::slice::from_ref(&target)).await {
                        warn!(%target, ?path, %error, "queued send failed");
                    }
                }
            }
            PeerConnectionState::NotConnected => {
                info!(%peer, "peer disconnected");
                self.inner.events.peer_disconnected(&peer);
                if self.inner.receives.is_active(&peer).await {
                    match self.inner.config.disconnect_policy {
                        DisconnectPolicy::CancelActiveReceive => {
                            warn!(%peer, "cancelling in-flight receive for disconnected peer");
                            self.inner.receives.cancel_transfer(&peer).await;
                        }
                        DisconnectPolicy::KeepActiveReceive => {
                            debug!(%peer, "keeping in-flight receive for disconnected peer");
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Transport callback: a reliable message arrived. A payload that carries
    /// a wire header is a whole-file transfer and is persisted; anything else
    /// is delivered as a text message.
    pub async fn handle_message(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), SessionError> {
        match decode_header(bytes) {
            Ok((metadata, consumed)) => {
                if let Err(err) = self.inner.receives.start_transfer(peer, &metadata).await {
                    self.inner.events.did_fail_receiving(Some(&metadata), peer, &err);
                    return Err(err);
                }
                self.inner.events.did_start_receiving(&metadata, peer);
                let filename = metadata.filename.clone();
                match self
                    .inner
                    .receives
                    .receive(peer, &bytes[consumed..], |p| {
                        self.emit_progress(&filename, peer, p)
                    })
                    .await
                {
                    Ok(destination) => {
                        info!(file = %metadata.filename, %peer, "file received");
                        self.inner
                            .events
                            .did_finish_receiving(&metadata, peer, &destination);
                        Ok(())
                    }
                    Err(err) => {
                        self.inner.events.did_fail_receiving(Some(&metadata), peer, &err);
                        Err(err)
                    }
                }
            }
            Err(_) => {
                match std::str::from_utf8(bytes) {
                    Ok(text) => self.inner.events.message_received(peer, text),
                    Err(_) => warn!(%peer, len = bytes.len(), "dropping undecodable message"),
                }
                Ok(())
            }
        }
    }

    /// Transport callback: an inbound byte stream arrived. Reads the header,
    /// starts (or resumes) a receive and drains the stream to completion.
    /// Returns the destination path of the received file.
    pub async fn handle_incoming_stream<R>(
        &self,
        peer: &PeerId,
        mut stream: R,
    ) -> Result<PathBuf, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let metadata = match read_header(&mut stream).await {
            Ok(m) => m,
            Err(e) => {
                let err = SessionError::MalformedHeader(e);
                self.inner.events.did_fail_receiving(None, peer, &err);
                return Err(err);
            }
        };

        let resuming_in_place =
            metadata.resume_offset > 0 && self.inner.receives.is_active(peer).await;
        let prepared = if resuming_in_place {
            self.inner
                .receives
                .handle_resume_request(peer, metadata.resume_offset)
                .await
        } else {
            let started = self.inner.receives.start_transfer(peer, &metadata).await;
            match started {
                Ok(_) if metadata.resume_offset > 0 => {
                    self.inner
                        .receives
                        .handle_resume_request(peer, metadata.resume_offset)
                        .await
                }
                other => other.map(|_| ()),
            }
        };
        if let Err(err) = prepared {
            self.inner.events.did_fail_receiving(Some(&metadata), peer, &err);
            return Err(err);
        }

        self.inner.events.did_start_receiving(&metadata, peer);
        let filename = metadata.filename.clone();
        match self
            .inner
            .receives
            .receive(peer, stream, |p| self.emit_progress(&filename, peer, p))
            .await
        {
            Ok(destination) => {
                info!(file = %metadata.filename, %peer, "stream received");
                self.inner
                    .events
                    .did_finish_receiving(&metadata, peer, &destination);
                Ok(destination)
            }
            Err(err) => {
                self.inner.events.did_fail_receiving(Some(&metadata), peer, &err);
                Err(err)
            }
        }
    }

    /// Transport callback: a connection invitation arrived. Surfaces it to
    /// the event sink and waits a bounded time for the decision; timeout, a
    /// dropped responder, or an absent sink all decline.
    pub async fn handle_invitation(&self, peer: &PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        self.inner
            .events
            .invitation_received(peer, InvitationResponder::new(tx));
        match tokio::time::timeout(self.inner.config.invitation_timeout, rx).await {
            Ok(Ok(accept)) => accept,
            _ => {
                debug!(%peer, "invitation unanswered, declining");
                false
            }
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.roster.lock().await.connected()
    }

    pub async fn discovered_peers(&self) -> Vec<PeerId> {
        self.inner
            .roster
            .lock()
            .await
            .discovered
            .iter()
            .cloned()
            .collect()
    }

    pub async fn peer_state(&self, peer: &PeerId) -> Option<PeerConnectionState> {
        self.inner.roster.lock().await.connections.get(peer).copied()
    }

    pub async fn pending_transfers(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    fn ensure_started(&self) -> Result<(), SessionError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(SessionError::TransportUnavailable)
        }
    }

    fn emit_progress(&self, filename: &str, peer: &PeerId, progress: Progress) {
        if let Some(tx) = &*self.inner.progress_tx.lock().unwrap() {
            let _ = tx.send(ProgressUpdate {
                filename: filename.to_string(),
                peer: peer.clone(),
                progress,
            });
        }
        self.inner.events.transfer_progress(filename, peer, progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::transport::OutboundStream;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct MockState {
        sent: std::sync::Mutex<Vec<(Vec<u8>, Vec<PeerId>, bool)>>,
        streams: std::sync::Mutex<Vec<(String, PeerId, DuplexStream)>>,
        invited: std::sync::Mutex<Vec<PeerId>>,
        fail_sends: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<MockState>,
    }

    impl Transport for MockTransport {
        fn start_advertising(&self) -> io::Result<()> {
            Ok(())
        }

        fn stop_advertising(&self) {}

        fn start_browsing(&self) -> io::Result<()> {
            Ok(())
        }

        fn stop_browsing(&self) {}

        fn invite(&self, peer: &PeerId) -> io::Result<()> {
            self.state.invited.lock().unwrap().push(peer.clone());
            Ok(())
        }

        async fn send(&self, data: Vec<u8>, peers: &[PeerId], reliable: bool) -> io::Result<()> {
            if self.state.fail_sends.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "link down"));
            }
            self.state
                .sent
                .lock()
                .unwrap()
                .push((data, peers.to_vec(), reliable));
            Ok(())
        }

        async fn open_stream(&self, name: &str, peer: &PeerId) -> io::Result<OutboundStream> {
            let (write, read) = tokio::io::duplex(1 << 20);
            self.state
                .streams
                .lock()
                .unwrap()
                .push((name.to_string(), peer.clone(), read));
            Ok(Box::new(write))
        }
    }

    #[derive(Default)]
    struct Recording {
        log: std::sync::Mutex<Vec<String>>,
    }

    impl Recording {
        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl SessionEvents for Recording {
        fn peer_discovered(&self, peer: &PeerId) {
            self.push(format!("discovered:{}", peer.display_name()));
        }
        fn peer_lost(&self, peer: &PeerId) {
            self.push(format!("lost:{}", peer.display_name()));
        }
        fn peer_connected(&self, peer: &PeerId) {
            self.push(format!("connected:{}", peer.display_name()));
        }
        fn peer_disconnected(&self, peer: &PeerId) {
            self.push(format!("disconnected:{}", peer.display_name()));
        }
        fn message_received(&self, _peer: &PeerId, text: &str) {
            self.push(format!("msg:{text}"));
        }
        fn did_start_sending(&self, _path: &Path, metadata: &TransferMetadata, _peers: &[PeerId]) {
            self.push(format!("send-start:{}", metadata.filename));
        }
        fn did_finish_sending(&self, metadata: &TransferMetadata, _peers: &[PeerId]) {
            self.push(format!("send-finish:{}", metadata.filename));
        }
        fn did_fail_sending(
            &self,
            metadata: Option<&TransferMetadata>,
            _peers: &[PeerId],
            _error: &SessionError,
        ) {
            let name = metadata.map(|m| m.filename.as_str()).unwrap_or("?");
            self.push(format!("send-fail:{name}"));
        }
        fn did_fail_sending_message(&self, _peers: &[PeerId], _error: &SessionError) {
            self.push("msg-fail".to_string());
        }
        fn did_start_receiving(&self, metadata: &TransferMetadata, _peer: &PeerId) {
            self.push(format!("recv-start:{}", metadata.filename));
        }
        fn did_finish_receiving(
            &self,
            metadata: &TransferMetadata,
            _peer: &PeerId,
            _destination: &Path,
        ) {
            self.push(format!("recv-finish:{}", metadata.filename));
        }
        fn did_fail_receiving(
            &self,
            metadata: Option<&TransferMetadata>,
            _peer: &PeerId,
            _error: &SessionError,
        ) {
            let name = metadata.map(|m| m.filename.as_str()).unwrap_or("?");
            self.push(format!("recv-fail:{name}"));
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(Keypair::generate().device_id(), name)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Fixture {
        session: Session<MockTransport>,
        transport: MockTransport,
        events: Arc<Recording>,
        _scratch: tempfile::TempDir,
        files: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tune: impl FnOnce(&mut SessionConfig)) -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let files = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new(scratch.path());
        tune(&mut config);
        let transport = MockTransport::default();
        let events = Arc::new(Recording::default());
        let session = Session::new(
            peer("local"),
            transport.clone(),
            config,
            events.clone(),
        );
        Fixture {
            session,
            transport,
            events,
            _scratch: scratch,
            files,
        }
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn operations_require_start() {
        let fx = fixture();
        let a = peer("a");
        let path = write_file(fx.files.path(), "x.txt", b"x");
        assert!(matches!(
            fx.session.send_message("hi", None).await,
            Err(SessionError::TransportUnavailable)
        ));
        assert!(matches!(
            fx.session.send_file(&path, &[a.clone()]).await,
            Err(SessionError::TransportUnavailable)
        ));
        assert!(matches!(
            fx.session.send_file_streaming(&path, &a, 0).await,
            Err(SessionError::TransportUnavailable)
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fx = fixture();
        fx.session.start().unwrap();
        assert!(fx.session.is_started());
        fx.session.stop().await;
        fx.session.stop().await;
        assert!(!fx.session.is_started());
    }

    #[tokio::test]
    async fn send_file_to_offline_peer_queues_then_replays_once() {
        let fx = fixture();
        fx.session.start().unwrap();
        let b = peer("b");
        let data = pattern(3000);
        let path = write_file(fx.files.path(), "deferred.bin", &data);

        fx.session.send_file(&path, &[b.clone()]).await.unwrap();
        assert_eq!(fx.session.pending_transfers().await, 1);
        assert!(fx.transport.state.sent.lock().unwrap().is_empty());

        fx.session
            .handle_peer_state_changed(b.clone(), PeerConnectionState::Connected)
            .await;
        assert_eq!(fx.session.pending_transfers().await, 0);
        let sent = fx.transport.state.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec![b.clone()]);
        let (meta, consumed) = decode_header(&sent[0].0).unwrap();
        assert_eq!(meta.filename, "deferred.bin");
        assert_eq!(&sent[0].0[consumed..], &data[..]);
    }

    #[tokio::test]
    async fn send_file_to_connected_peer_frames_payload() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::Connected)
            .await;

        let data = pattern(10_000);
        let path = write_file(fx.files.path(), "framed.png", &data);
        fx.session.send_file(&path, &[a.clone()]).await.unwrap();

        let sent = fx.transport.state.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2, "whole-file sends use the reliable channel");
        let (meta, consumed) = decode_header(&sent[0].0).unwrap();
        assert_eq!(meta.filename, "framed.png");
        assert_eq!(meta.content_type, "image/png");
        assert_eq!(meta.file_size, data.len() as u64);
        assert_eq!(&sent[0].0[consumed..], &data[..]);

        let log = fx.events.entries();
        assert!(log.contains(&"send-start:framed.png".to_string()));
        assert!(log.contains(&"send-finish:framed.png".to_string()));
    }

    #[tokio::test]
    async fn send_file_missing_source_fails_fast() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        let err = fx
            .session
            .send_file(&fx.files.path().join("absent.txt"), &[a])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MetadataUnavailable { .. }));
    }

    #[tokio::test]
    async fn send_message_defaults_to_connected_roster() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        let b = peer("b");
        for p in [&a, &b] {
            fx.session
                .handle_peer_state_changed(p.clone(), PeerConnectionState::Connected)
                .await;
        }
        fx.session.send_message("hello pod", None).await.unwrap();
        let sent = fx.transport.state.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b"hello pod".to_vec());
        assert_eq!(sent[0].1.len(), 2);
    }

    #[tokio::test]
    async fn send_message_failure_surfaces_event_and_error() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::Connected)
            .await;
        fx.transport.state.fail_sends.store(true, Ordering::SeqCst);

        let err = fx.session.send_message("hi", None).await.unwrap_err();
        assert!(matches!(err, SessionError::SendFailed { .. }));
        assert!(fx.events.entries().contains(&"msg-fail".to_string()));
    }

    #[tokio::test]
    async fn streaming_send_chunks_and_reports_progress() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::Connected)
            .await;

        let data = pattern(200 * 1024);
        let path = write_file(fx.files.path(), "movie.bin", &data);
        let mut progress_rx = fx.session.subscribe_progress();
        fx.session.send_file_streaming(&path, &a, 0).await.unwrap();

        let (name, target, mut read_half) = fx.transport.state.streams.lock().unwrap().remove(0);
        assert_eq!(name, "movie.bin");
        assert_eq!(target, a);
        let mut wire = Vec::new();
        read_half.read_to_end(&mut wire).await.unwrap();
        let (meta, consumed) = decode_header(&wire).unwrap();
        assert_eq!(meta.file_size, data.len() as u64);
        assert_eq!(meta.resume_offset, 0);
        assert_eq!(&wire[consumed..], &data[..]);

        let mut fractions = Vec::new();
        while let Ok(update) = progress_rx.try_recv() {
            assert_eq!(update.filename, "movie.bin");
            fractions.push(update.progress.fraction());
        }
        assert_eq!(fractions.len(), 4);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);

        let log = fx.events.entries();
        assert!(log.contains(&"send-start:movie.bin".to_string()));
        assert!(log.contains(&"send-finish:movie.bin".to_string()));
    }

    #[tokio::test]
    async fn streaming_send_resumes_from_offset() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::Connected)
            .await;

        let data = pattern(100 * 1024);
        let resume = 40 * 1024u64;
        let path = write_file(fx.files.path(), "partial.bin", &data);
        let mut progress_rx = fx.session.subscribe_progress();
        fx.session
            .send_file_streaming(&path, &a, resume)
            .await
            .unwrap();

        let (_, _, mut read_half) = fx.transport.state.streams.lock().unwrap().remove(0);
        let mut wire = Vec::new();
        read_half.read_to_end(&mut wire).await.unwrap();
        let (meta, consumed) = decode_header(&wire).unwrap();
        assert_eq!(meta.resume_offset, resume);
        assert_eq!(&wire[consumed..], &data[resume as usize..]);

        let first = progress_rx.try_recv().unwrap();
        assert!(first.progress.completed > resume);
        let mut last = first.progress.fraction();
        while let Ok(update) = progress_rx.try_recv() {
            last = update.progress.fraction();
        }
        assert_eq!(last, 1.0);
    }

    #[tokio::test]
    async fn incoming_stream_received_end_to_end() {
        let fx = fixture();
        let a = peer("a");
        let data = pattern(200 * 1024);
        let metadata = TransferMetadata {
            filename: "incoming.bin".into(),
            content_type: "application/octet-stream".into(),
            file_size: data.len() as u64,
            resume_offset: 0,
        };
        let mut wire = encode_header(&metadata).unwrap();
        wire.extend_from_slice(&data);

        let mut progress_rx = fx.session.subscribe_progress();
        let dest = fx
            .session
            .handle_incoming_stream(&a, wire.as_slice())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        let mut fractions = Vec::new();
        while let Ok(update) = progress_rx.try_recv() {
            fractions.push(update.progress.fraction());
        }
        assert_eq!(fractions.len(), 4);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);

        let log = fx.events.entries();
        assert!(log.contains(&"recv-start:incoming.bin".to_string()));
        assert!(log.contains(&"recv-finish:incoming.bin".to_string()));
    }

    #[tokio::test]
    async fn incoming_stream_resume_completes_file() {
        let fx = fixture();
        let a = peer("a");
        let data = pattern(100 * 1024);
        let split = 40 * 1024;
        let mut metadata = TransferMetadata {
            filename: "resumed.bin".into(),
            content_type: "application/octet-stream".into(),
            file_size: data.len() as u64,
            resume_offset: 0,
        };

        // First stream ends after the prefix.
        let mut wire = encode_header(&metadata).unwrap();
        wire.extend_from_slice(&data[..split]);
        fx.session
            .handle_incoming_stream(&a, wire.as_slice())
            .await
            .unwrap();

        // Second stream resumes at the split point.
        metadata.resume_offset = split as u64;
        let mut wire = encode_header(&metadata).unwrap();
        wire.extend_from_slice(&data[split..]);
        let dest = fx
            .session
            .handle_incoming_stream(&a, wire.as_slice())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn incoming_stream_rejects_malformed_header() {
        let fx = fixture();
        let a = peer("a");
        let err = fx
            .session
            .handle_incoming_stream(&a, &b"\x00\x00"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedHeader(_)));
        assert!(fx.events.entries().contains(&"recv-fail:?".to_string()));
    }

    #[tokio::test]
    async fn message_with_header_is_persisted_as_file() {
        let fx = fixture();
        let a = peer("a");
        let data = pattern(5000);
        let metadata = TransferMetadata {
            filename: "dropped.csv".into(),
            content_type: "text/csv".into(),
            file_size: data.len() as u64,
            resume_offset: 0,
        };
        let mut payload = encode_header(&metadata).unwrap();
        payload.extend_from_slice(&data);

        fx.session.handle_message(&a, &payload).await.unwrap();

        let log = fx.events.entries();
        assert!(log.contains(&"recv-start:dropped.csv".to_string()));
        assert!(log.contains(&"recv-finish:dropped.csv".to_string()));
        let dest = fx._scratch.path().join("dropped.csv");
        assert_eq!(std::fs::read(dest).unwrap(), data);
    }

    #[tokio::test]
    async fn plain_text_message_is_delivered_as_text() {
        let fx = fixture();
        let a = peer("a");
        fx.session.handle_message(&a, b"see you at 5").await.unwrap();
        assert!(fx.events.entries().contains(&"msg:see you at 5".to_string()));
    }

    #[tokio::test]
    async fn discovery_roster_tracks_visibility() {
        let fx = fixture();
        let a = peer("a");
        fx.session.handle_peer_discovered(a.clone()).await;
        assert_eq!(fx.session.discovered_peers().await, vec![a.clone()]);
        assert_eq!(
            fx.session.peer_state(&a).await,
            Some(PeerConnectionState::Discovered)
        );

        fx.session.handle_peer_lost(&a).await;
        assert!(fx.session.discovered_peers().await.is_empty());

        let log = fx.events.entries();
        assert!(log.contains(&"discovered:a".to_string()));
        assert!(log.contains(&"lost:a".to_string()));
    }

    #[tokio::test]
    async fn connect_to_marks_inviting_and_invites() {
        let fx = fixture();
        fx.session.start().unwrap();
        let a = peer("a");
        fx.session.handle_peer_discovered(a.clone()).await;
        fx.session.connect_to(&a).await.unwrap();
        assert_eq!(
            fx.session.peer_state(&a).await,
            Some(PeerConnectionState::Inviting)
        );
        assert_eq!(fx.transport.state.invited.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_cancels_active_receive_by_default() {
        let fx = fixture();
        let a = peer("a");
        let metadata = TransferMetadata {
            filename: "inflight.bin".into(),
            content_type: "application/octet-stream".into(),
            file_size: 1000,
            resume_offset: 0,
        };
        fx.session
            .receives()
            .start_transfer(&a, &metadata)
            .await
            .unwrap();
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::NotConnected)
            .await;
        assert!(!fx.session.receives().is_active(&a).await);
        assert!(fx.events.entries().contains(&"disconnected:a".to_string()));
    }

    #[tokio::test]
    async fn disconnect_can_keep_active_receive() {
        let fx = fixture_with(|c| c.disconnect_policy = DisconnectPolicy::KeepActiveReceive);
        let a = peer("a");
        let metadata = TransferMetadata {
            filename: "inflight.bin".into(),
            content_type: "application/octet-stream".into(),
            file_size: 1000,
            resume_offset: 0,
        };
        fx.session
            .receives()
            .start_transfer(&a, &metadata)
            .await
            .unwrap();
        fx.session
            .handle_peer_state_changed(a.clone(), PeerConnectionState::NotConnected)
            .await;
        assert!(fx.session.receives().is_active(&a).await);
    }

    struct AcceptInvitations;

    impl SessionEvents for AcceptInvitations {
        fn invitation_received(&self, _peer: &PeerId, responder: InvitationResponder) {
            responder.accept();
        }
    }

    struct HoldInvitations {
        slot: std::sync::Mutex<Option<InvitationResponder>>,
    }

    impl SessionEvents for HoldInvitations {
        fn invitation_received(&self, _peer: &PeerId, responder: InvitationResponder) {
            *self.slot.lock().unwrap() = Some(responder);
        }
    }

    #[tokio::test]
    async fn invitation_accepted_by_sink() {
        let scratch = tempfile::tempdir().unwrap();
        let session = Session::new(
            peer("local"),
            MockTransport::default(),
            SessionConfig::new(scratch.path()),
            Arc::new(AcceptInvitations),
        );
        assert!(session.handle_invitation(&peer("a")).await);
    }

    #[tokio::test]
    async fn invitation_without_sink_declines() {
        let scratch = tempfile::tempdir().unwrap();
        let session = Session::new(
            peer("local"),
            MockTransport::default(),
            SessionConfig::new(scratch.path()),
            Arc::new(()),
        );
        assert!(!session.handle_invitation(&peer("a")).await);
    }

    #[tokio::test]
    async fn unanswered_invitation_times_out_declined() {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = SessionConfig::new(scratch.path());
        config.invitation_timeout = Duration::from_millis(50);
        let session = Session::new(
            peer("local"),
            MockTransport::default(),
            config,
            Arc::new(HoldInvitations {
                slot: std::sync::Mutex::new(None),
            }),
        );
        assert!(!session.handle_invitation(&peer("a")).await);
    }
}
