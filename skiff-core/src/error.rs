//! Session error taxonomy.

use std::path::PathBuf;

use crate::header::HeaderError;
use crate::identity::PeerId;

/// Errors surfaced by the session and transfer layer. Per-peer failures are
/// also reported through the event sink for the operation that caused them;
/// they never abort unrelated peers' transfers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session has not been started, or was already stopped.
    #[error("transport not started")]
    TransportUnavailable,

    /// The length prefix or the metadata payload could not be decoded.
    #[error("malformed header: {0}")]
    MalformedHeader(#[from] HeaderError),

    /// Destination storage could not be created, opened, seeked or written.
    #[error("storage unavailable: {source}")]
    StorageUnavailable {
        #[source]
        source: std::io::Error,
    },

    /// A resume, cancel or complete referenced a peer with no tracked transfer.
    #[error("no active transfer for peer {peer}")]
    NoActiveTransfer { peer: PeerId },

    /// The underlying transport failed to deliver to one or more peers.
    #[error("send failed for {peers:?}: {source}")]
    SendFailed {
        peers: Vec<PeerId>,
        #[source]
        source: std::io::Error,
    },

    /// A stream read failed or the stream closed prematurely.
    #[error("receive failed: {source}")]
    ReceiveFailed {
        #[source]
        source: std::io::Error,
    },

    /// The source file could not be statted to build transfer metadata.
    #[error("cannot read metadata for {path:?}: {source}")]
    MetadataUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
