//! Transport abstraction consumed by the session coordinator.
//!
//! The session only needs this capability set; the wire details (discovery
//! beacons, handshakes, encryption) belong to the implementation — see the
//! daemon crate for the LAN one.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::PeerId;

/// Incoming byte stream handed to the session by the transport.
pub type InboundStream = Box<dyn AsyncRead + Send + Unpin>;

/// Outbound byte stream opened toward a peer.
pub type OutboundStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound capability set the session requires from a transport. Events flow
/// the other way: the transport's owner pumps them into the session's
/// `handle_*` methods.
pub trait Transport: Send + Sync + 'static {
    /// Begin advertising this device to the local network.
    fn start_advertising(&self) -> io::Result<()>;

    fn stop_advertising(&self);

    /// Begin browsing for other devices.
    fn start_browsing(&self) -> io::Result<()>;

    fn stop_browsing(&self);

    /// Ask a discovered peer to connect. Completion is reported through the
    /// transport's event flow, not this call.
    fn invite(&self, peer: &PeerId) -> io::Result<()>;

    /// Deliver one message to every listed peer. `reliable` selects the
    /// ordered, atomically delivered channel; transports without an
    /// unreliable mode may ignore the flag.
    fn send(
        &self,
        data: Vec<u8>,
        peers: &[PeerId],
        reliable: bool,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Open a named outbound byte stream to a connected peer.
    fn open_stream(
        &self,
        name: &str,
        peer: &PeerId,
    ) -> impl std::future::Future<Output = io::Result<OutboundStream>> + Send;
}
