//! Pending transfer queue: defers file sends to peers that are not yet connected.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::identity::PeerId;

/// One deferred send: a file and the peers still waiting for it.
/// The entry is dropped once its peer set empties.
#[derive(Debug, Clone)]
pub struct PendingFileTransfer {
    pub path: PathBuf,
    pub peers: HashSet<PeerId>,
}

/// Queue of deferred sends. Owned by the session coordinator; callers go
/// through `enqueue`/`flush` only.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Vec<PendingFileTransfer>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a file for peers that are not currently connected.
    pub fn enqueue(&mut self, path: impl Into<PathBuf>, peers: impl IntoIterator<Item = PeerId>) {
        let peers: HashSet<PeerId> = peers.into_iter().collect();
        if peers.is_empty() {
            return;
        }
        self.entries.push(PendingFileTransfer {
            path: path.into(),
            peers,
        });
    }

    /// Replay queued sends for `peer`. For every entry naming the peer whose
    /// `is_connected` check passes, `send` is invoked once and the peer is
    /// removed from the entry; emptied entries are dropped. Entries not
    /// naming the peer, or failing the check, are kept unchanged. Call
    /// exactly once per peer-connected transition.
    pub fn flush<C, S>(&mut self, peer: &PeerId, is_connected: C, mut send: S)
    where
        C: Fn(&PeerId) -> bool,
        S: FnMut(&Path, &PeerId),
    {
        for entry in &mut self.entries {
            if entry.peers.contains(peer) && is_connected(peer) {
                send(&entry.path, peer);
                entry.peers.remove(peer);
            }
        }
        self.entries.retain(|e| !e.peers.is_empty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PendingFileTransfer] {
        &self.entries
    }
}
