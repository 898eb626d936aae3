//! Skiff: LAN peer-to-peer file transfer engine.
//! Session coordination, wire framing, resumable receives and deferred sends;
//! the transport (discovery, connections, streams) is supplied by the host.

pub mod error;
pub mod event;
pub mod header;
pub mod identity;
pub mod metadata;
pub mod pending;
pub mod progress;
pub mod receive;
pub mod session;
pub mod transport;

pub use error::SessionError;
pub use event::{InvitationResponder, SessionEvents};
pub use header::{decode_header, encode_header, read_header, HeaderError};
pub use identity::{derive_session_key, DeviceId, Keypair, PeerId, PublicKey};
pub use metadata::TransferMetadata;
pub use pending::PendingQueue;
pub use progress::{Progress, ProgressUpdate};
pub use receive::{ReceiveManager, CHUNK_SIZE};
pub use session::{DisconnectPolicy, PeerConnectionState, Session, SessionConfig};
pub use transport::{InboundStream, OutboundStream, Transport};
