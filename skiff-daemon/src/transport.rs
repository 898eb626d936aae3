//! LAN transport: TCP listener and dialer, identity handshake, encrypted
//! frames, and per-peer outbound channels. Control connections carry reliable
//! messages; byte streams ride dedicated connections opened with a stream
//! preamble.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use skiff_core::identity::{decrypt_wire, derive_session_key, encrypt_wire};
use skiff_core::{DeviceId, Keypair, PeerId, PublicKey, Transport, CHUNK_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: u8 = 1;

const KIND_CONTROL: u8 = 0;
const KIND_STREAM: u8 = 1;
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const STREAM_PIPE_CAPACITY: usize = 256 * 1024;

/// What discovery learned about a peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub public_key: PublicKey,
    pub display_name: String,
    pub last_seen: Instant,
}

pub type AddrBook = Arc<Mutex<HashMap<DeviceId, PeerEntry>>>;
type PeerSenders = Arc<Mutex<HashMap<DeviceId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Everything the transport reports to the session; the daemon pumps these
/// into the session's handler methods.
pub enum TransportEvent {
    Discovered { peer: PeerId },
    Lost { peer: PeerId },
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
    Invitation {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Message { peer: PeerId, bytes: Vec<u8> },
    Stream {
        peer: PeerId,
        reader: skiff_core::InboundStream,
    },
}

/// Command side of the LAN transport. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TcpTransport {
    pub(crate) keypair: Arc<Keypair>,
    pub(crate) display_name: String,
    pub(crate) advertising: Arc<AtomicBool>,
    pub(crate) browsing: Arc<AtomicBool>,
    pub(crate) addr_book: AddrBook,
    peer_senders: PeerSenders,
    dial_tx: mpsc::UnboundedSender<PeerId>,
    pub(crate) events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TcpTransport {
    pub fn new(
        keypair: Arc<Keypair>,
        display_name: String,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let transport = Self {
            keypair,
            display_name,
            advertising: Arc::new(AtomicBool::new(false)),
            browsing: Arc::new(AtomicBool::new(false)),
            addr_book: Arc::new(Mutex::new(HashMap::new())),
            peer_senders: Arc::new(Mutex::new(HashMap::new())),
            dial_tx,
            events_tx,
        };
        (transport, dial_rx)
    }
}

impl Transport for TcpTransport {
    fn start_advertising(&self) -> io::Result<()> {
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_advertising(&self) {
        self.advertising.store(false, Ordering::SeqCst);
    }

    fn start_browsing(&self) -> io::Result<()> {
        self.browsing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_browsing(&self) {
        self.browsing.store(false, Ordering::SeqCst);
    }

    fn invite(&self, peer: &PeerId) -> io::Result<()> {
        self.dial_tx
            .send(peer.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport task stopped"))
    }

    async fn send(&self, data: Vec<u8>, peers: &[PeerId], _reliable: bool) -> io::Result<()> {
        let senders = self.peer_senders.lock().await;
        let mut unreachable = Vec::new();
        for peer in peers {
            match senders.get(&peer.device_id()) {
                Some(tx) if tx.send(data.clone()).is_ok() => {}
                _ => unreachable.push(peer.display_name().to_string()),
            }
        }
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no connection to {}", unreachable.join(", ")),
            ))
        }
    }

    async fn open_stream(&self, name: &str, peer: &PeerId) -> io::Result<skiff_core::OutboundStream> {
        let entry = self
            .addr_book
            .lock()
            .await
            .get(&peer.device_id())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "peer address unknown"))?;
        let mut stream = TcpStream::connect(entry.addr).await?;
        stream.write_all(&[KIND_STREAM]).await?;
        write_hello(&mut stream, &self.keypair, &self.display_name).await?;
        let (remote, remote_key) = read_hello(&mut stream).await?;
        if remote.device_id() != peer.device_id() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected peer identity",
            ));
        }
        let key = derive_session_key(&self.keypair.shared_secret(&remote_key));
        // Frame 0 names the stream; data frames follow.
        write_frame(&mut stream, &key, 0, name.as_bytes()).await?;

        let (local, mut pump) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
        tokio::spawn(async move {
            let mut nonce = 1u64;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match pump.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if write_frame(&mut stream, &key, nonce, &buf[..n]).await.is_err() {
                            break;
                        }
                        nonce += 1;
                    }
                }
            }
            let _ = stream.shutdown().await;
        });
        Ok(Box::new(local))
    }
}

/// Run the listener and dialer until the daemon shuts down.
pub async fn run_transport(
    transport: TcpTransport,
    port: u16,
    mut dial_rx: mpsc::UnboundedReceiver<PeerId>,
) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "transport listening");

    let accept_transport = transport.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let t = accept_transport.clone();
                    tokio::spawn(async move {
                        if let Err(error) = handle_inbound(t, stream).await {
                            debug!(%from, %error, "inbound connection ended with error");
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    while let Some(peer) = dial_rx.recv().await {
        let t = transport.clone();
        tokio::spawn(async move {
            dial(t, peer).await;
        });
    }
    Ok(())
}

async fn handle_inbound(t: TcpTransport, mut stream: TcpStream) -> io::Result<()> {
    let mut kind = [0u8; 1];
    stream.read_exact(&mut kind).await?;
    let (peer, peer_key) = read_hello(&mut stream).await?;
    let session_key = derive_session_key(&t.keypair.shared_secret(&peer_key));

    match kind[0] {
        KIND_CONTROL => {
            if t.peer_senders.lock().await.contains_key(&peer.device_id()) {
                debug!(%peer, "dropping duplicate control connection");
                return Ok(());
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            if t.events_tx
                .send(TransportEvent::Invitation {
                    peer: peer.clone(),
                    reply: reply_tx,
                })
                .is_err()
            {
                return Ok(());
            }
            if !reply_rx.await.unwrap_or(false) {
                info!(%peer, "invitation declined");
                return Ok(());
            }
            write_hello(&mut stream, &t.keypair, &t.display_name).await?;
            run_connection(t, stream, peer, session_key, false).await;
        }
        KIND_STREAM => {
            // Streams only ride on an established relationship.
            if !t.peer_senders.lock().await.contains_key(&peer.device_id()) {
                warn!(%peer, "rejecting stream from unconnected peer");
                return Ok(());
            }
            write_hello(&mut stream, &t.keypair, &t.display_name).await?;
            let name = read_frame(&mut stream, &session_key, 0)
                .await?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "missing stream name"))?;
            debug!(%peer, name = %String::from_utf8_lossy(&name), "stream opened");

            let (mut pump, reader) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
            if t.events_tx
                .send(TransportEvent::Stream {
                    peer: peer.clone(),
                    reader: Box::new(reader),
                })
                .is_err()
            {
                return Ok(());
            }
            let mut nonce = 1u64;
            loop {
                match read_frame(&mut stream, &session_key, nonce).await {
                    Ok(Some(plain)) => {
                        nonce += 1;
                        if pump.write_all(&plain).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%peer, %error, "stream read failed");
                        break;
                    }
                }
            }
            // Dropping the pump end signals end-of-stream to the session.
        }
        other => warn!(other, "unknown connection kind"),
    }
    Ok(())
}

async fn dial(t: TcpTransport, peer: PeerId) {
    if t.peer_senders.lock().await.contains_key(&peer.device_id()) {
        debug!(%peer, "already connected, skipping dial");
        return;
    }
    let entry = t.addr_book.lock().await.get(&peer.device_id()).cloned();
    let Some(entry) = entry else {
        warn!(%peer, "no known address, cannot dial");
        let _ = t.events_tx.send(TransportEvent::Disconnected { peer });
        return;
    };
    let attempt = async {
        let mut stream = TcpStream::connect(entry.addr).await?;
        stream.write_all(&[KIND_CONTROL]).await?;
        write_hello(&mut stream, &t.keypair, &t.display_name).await?;
        // No reply means the remote declined the invitation.
        let (remote, remote_key) = read_hello(&mut stream).await?;
        if remote.device_id() != peer.device_id() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected peer identity",
            ));
        }
        let key = derive_session_key(&t.keypair.shared_secret(&remote_key));
        Ok::<_, io::Error>((stream, remote, key))
    };
    match attempt.await {
        Ok((stream, remote, key)) => run_connection(t, stream, remote, key, true).await,
        Err(error) => {
            warn!(%peer, %error, "dial failed");
            let _ = t.events_tx.send(TransportEvent::Disconnected { peer });
        }
    }
}

/// Drive one control connection: writer task drains the peer's outbound
/// channel, the read loop surfaces messages, and teardown reports the
/// disconnect. Both directions share one session key, so the nonce space is
/// split by direction: the dialer counts from 0, the acceptor from 2^63.
async fn run_connection(
    t: TcpTransport,
    stream: TcpStream,
    peer: PeerId,
    session_key: [u8; 32],
    dialed: bool,
) {
    let (write_base, read_base) = if dialed { (0, 1u64 << 63) } else { (1u64 << 63, 0) };
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    t.peer_senders.lock().await.insert(peer.device_id(), tx);
    let _ = t.events_tx.send(TransportEvent::Connected { peer: peer.clone() });
    info!(%peer, "control connection established");

    let (mut reader, mut writer) = stream.into_split();
    let writer_key = session_key;
    let writer_task = tokio::spawn(async move {
        let mut nonce: u64 = write_base;
        while let Some(plain) = rx.recv().await {
            if write_frame(&mut writer, &writer_key, nonce, &plain).await.is_err() {
                break;
            }
            nonce += 1;
        }
    });

    let mut nonce: u64 = read_base;
    loop {
        match read_frame(&mut reader, &session_key, nonce).await {
            Ok(Some(plain)) => {
                nonce += 1;
                let _ = t.events_tx.send(TransportEvent::Message {
                    peer: peer.clone(),
                    bytes: plain,
                });
            }
            Ok(None) => break,
            Err(error) => {
                warn!(%peer, %error, "control read failed");
                break;
            }
        }
    }

    writer_task.abort();
    t.peer_senders.lock().await.remove(&peer.device_id());
    let _ = t.events_tx.send(TransportEvent::Disconnected { peer: peer.clone() });
    info!(%peer, "control connection closed");
}

async fn write_hello<W>(w: &mut W, keypair: &Keypair, display_name: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let name = display_name.as_bytes();
    let name_len = name.len().min(u8::MAX as usize);
    let mut hello = Vec::with_capacity(1 + 16 + 32 + 1 + name_len);
    hello.push(PROTOCOL_VERSION);
    hello.extend_from_slice(keypair.device_id().as_bytes());
    hello.extend_from_slice(keypair.public_key().as_bytes());
    hello.push(name_len as u8);
    hello.extend_from_slice(&name[..name_len]);
    w.write_all(&hello).await?;
    w.flush().await
}

async fn read_hello<R>(r: &mut R) -> io::Result<(PeerId, PublicKey)>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; 1 + 16 + 32 + 1];
    r.read_exact(&mut fixed).await?;
    if fixed[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut device_id = [0u8; 16];
    device_id.copy_from_slice(&fixed[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&fixed[17..49]);
    let name_len = fixed[49] as usize;
    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name).await?;

    // The claimed device ID must match the key it was derived from.
    if DeviceId::from_public_key(&public_key) != DeviceId::from_bytes(device_id) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "device id does not match public key",
        ));
    }
    let display_name = String::from_utf8_lossy(&name).into_owned();
    Ok((
        PeerId::new(DeviceId::from_bytes(device_id), display_name),
        PublicKey::from_bytes(public_key),
    ))
}

async fn write_frame<W>(w: &mut W, key: &[u8; 32], nonce: u64, plain: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let cipher = encrypt_wire(key, nonce, plain)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = cipher.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    w.write_all(&len.to_le_bytes()).await?;
    w.write_all(&cipher).await?;
    w.flush().await
}

async fn read_frame<R>(r: &mut R, key: &[u8; 32], nonce: u64) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut cipher = vec![0u8; len as usize];
    r.read_exact(&mut cipher).await?;
    decrypt_wire(key, nonce, &cipher)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
