//! Typed event sink: the session's one notification path to a presentation layer.

use std::path::Path;

use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::identity::PeerId;
use crate::metadata::TransferMetadata;
use crate::progress::Progress;

/// Answer handle for an incoming connection invitation. Consuming methods
/// make a double answer unrepresentable; dropping it unanswered declines.
pub struct InvitationResponder {
    reply: oneshot::Sender<bool>,
}

impl InvitationResponder {
    pub(crate) fn new(reply: oneshot::Sender<bool>) -> Self {
        Self { reply }
    }

    pub fn accept(self) {
        let _ = self.reply.send(true);
    }

    pub fn decline(self) {
        let _ = self.reply.send(false);
    }

    pub fn respond(self, accept: bool) {
        let _ = self.reply.send(accept);
    }
}

/// Everything the session reports outward, one method per event. All methods
/// have no-op defaults, so a sink implements only what it cares about and an
/// unregistered sink (the `()` impl) costs nothing. Failure events carry the
/// metadata when it was available and the peers involved, enough for a caller
/// to offer a manual retry or resume.
pub trait SessionEvents: Send + Sync {
    fn peer_discovered(&self, _peer: &PeerId) {}
    fn peer_lost(&self, _peer: &PeerId) {}
    fn peer_connected(&self, _peer: &PeerId) {}
    fn peer_disconnected(&self, _peer: &PeerId) {}

    /// An invitation arrived; answer through the responder. The session
    /// bounds the wait and declines on timeout.
    fn invitation_received(&self, _peer: &PeerId, responder: InvitationResponder) {
        responder.decline();
    }

    fn message_received(&self, _peer: &PeerId, _text: &str) {}

    fn transfer_progress(&self, _filename: &str, _peer: &PeerId, _progress: Progress) {}

    fn did_start_sending(&self, _path: &Path, _metadata: &TransferMetadata, _peers: &[PeerId]) {}
    fn did_finish_sending(&self, _metadata: &TransferMetadata, _peers: &[PeerId]) {}
    fn did_fail_sending(
        &self,
        _metadata: Option<&TransferMetadata>,
        _peers: &[PeerId],
        _error: &SessionError,
    ) {
    }

    fn did_fail_sending_message(&self, _peers: &[PeerId], _error: &SessionError) {}

    fn did_start_receiving(&self, _metadata: &TransferMetadata, _peer: &PeerId) {}
    fn did_finish_receiving(&self, _metadata: &TransferMetadata, _peer: &PeerId, _destination: &Path) {
    }
    fn did_fail_receiving(
        &self,
        _metadata: Option<&TransferMetadata>,
        _peer: &PeerId,
        _error: &SessionError,
    ) {
    }
}

/// The absent sink.
impl SessionEvents for () {}
