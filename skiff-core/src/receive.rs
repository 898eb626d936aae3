//! Receive-side transfer state: one in-flight transfer per peer, with
//! resume, cancellation and chunked draining.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::identity::PeerId;
use crate::metadata::TransferMetadata;
use crate::progress::Progress;

/// Chunk size for streamed sends and receives.
pub const CHUNK_SIZE: usize = 64 * 1024;

struct ActiveReceive {
    file: File,
    destination: PathBuf,
    filename: String,
    transfer_id: Uuid,
    total_bytes_expected: u64,
    bytes_received: u64,
}

/// Owns all in-flight receive transfers, keyed by peer. At most one active
/// transfer per peer. Every operation goes through the guarded map; the map
/// itself is never exposed, so same-peer mutations are serialized here.
pub struct ReceiveManager {
    scratch_dir: PathBuf,
    active: Mutex<HashMap<PeerId, ActiveReceive>>,
}

impl ReceiveManager {
    /// `scratch_dir` is where incoming files land; created on first use.
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Open destination storage for an incoming transfer and mark the peer as
    /// receiving. The destination is not truncated here; stale bytes past the
    /// final length are trimmed on completion, which keeps a previously
    /// received prefix intact for a follow-up resume. Starting while a
    /// transfer is already active replaces it and closes the prior handle.
    pub async fn start_transfer(
        &self,
        peer: &PeerId,
        metadata: &TransferMetadata,
    ) -> Result<Uuid, SessionError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| SessionError::StorageUnavailable { source })?;
        // Only the final path component is honored; a remote peer does not get
        // to pick directories.
        let filename = Path::new(&metadata.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SessionError::StorageUnavailable {
                source: io::Error::new(io::ErrorKind::InvalidInput, "unusable file name"),
            })?
            .to_string();
        let destination = self.scratch_dir.join(&filename);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&destination)
            .await
            .map_err(|source| SessionError::StorageUnavailable { source })?;

        let transfer_id = Uuid::new_v4();
        let entry = ActiveReceive {
            file,
            destination,
            filename,
            transfer_id,
            total_bytes_expected: metadata.file_size,
            bytes_received: 0,
        };
        let mut active = self.active.lock().await;
        if let Some(prev) = active.insert(peer.clone(), entry) {
            warn!(%peer, transfer_id = %prev.transfer_id, "replacing active receive transfer");
        }
        debug!(%peer, %transfer_id, total = metadata.file_size, "receive transfer started");
        Ok(transfer_id)
    }

    /// Apply a negotiated resume offset to the peer's active transfer: seek
    /// the destination handle and account the already-present prefix.
    pub async fn handle_resume_request(
        &self,
        peer: &PeerId,
        resume_offset: u64,
    ) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        let entry = active
            .get_mut(peer)
            .ok_or_else(|| SessionError::NoActiveTransfer { peer: peer.clone() })?;
        entry
            .file
            .seek(io::SeekFrom::Start(resume_offset))
            .await
            .map_err(|source| SessionError::StorageUnavailable { source })?;
        entry.bytes_received = resume_offset;
        debug!(%peer, resume_offset, "receive transfer resumed");
        Ok(())
    }

    /// Drain `reader` into the peer's active transfer in fixed-size chunks,
    /// emitting a progress snapshot after each chunk. A zero-byte read is the
    /// natural end of the stream: the transfer completes, the handle closes,
    /// the entry is removed and the destination path is returned. Any error
    /// also closes and removes the transfer before surfacing.
    pub async fn receive<R, F>(
        &self,
        peer: &PeerId,
        mut reader: R,
        mut on_progress: F,
    ) -> Result<PathBuf, SessionError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Progress),
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(source) => {
                    self.discard(peer).await;
                    return Err(SessionError::ReceiveFailed { source });
                }
            };
            if n == 0 {
                break;
            }

            let progress = {
                let mut active = self.active.lock().await;
                let entry = active
                    .get_mut(peer)
                    .ok_or_else(|| SessionError::NoActiveTransfer { peer: peer.clone() })?;
                if let Err(source) = entry.file.write_all(&buf[..n]).await {
                    active.remove(peer);
                    return Err(SessionError::StorageUnavailable { source });
                }
                entry.bytes_received += n as u64;
                if entry.bytes_received > entry.total_bytes_expected {
                    let received = entry.bytes_received;
                    let expected = entry.total_bytes_expected;
                    active.remove(peer);
                    return Err(SessionError::ReceiveFailed {
                        source: io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("stream delivered {received} bytes, expected {expected}"),
                        ),
                    });
                }
                Progress::new(entry.bytes_received, entry.total_bytes_expected)
            };
            on_progress(progress);
        }

        let mut active = self.active.lock().await;
        let entry = active
            .remove(peer)
            .ok_or_else(|| SessionError::NoActiveTransfer { peer: peer.clone() })?;
        let destination = finalize(entry).await?;
        debug!(%peer, ?destination, "receive transfer completed");
        Ok(destination)
    }

    /// Close and discard the peer's transfer, whatever its state. Idempotent;
    /// a later `start_transfer` observes no leftover state.
    pub async fn cancel_transfer(&self, peer: &PeerId) {
        let mut active = self.active.lock().await;
        if active.remove(peer).is_some() {
            debug!(%peer, "receive transfer cancelled");
        }
    }

    /// Finalize the peer's transfer when the caller detected end-of-stream
    /// itself. Returns the destination path, or `None` if nothing was active.
    pub async fn complete_transfer(&self, peer: &PeerId) -> Option<PathBuf> {
        let entry = self.active.lock().await.remove(peer)?;
        finalize(entry).await.ok()
    }

    pub async fn is_active(&self, peer: &PeerId) -> bool {
        self.active.lock().await.contains_key(peer)
    }

    /// Current progress of the peer's active transfer, if any.
    pub async fn status(&self, peer: &PeerId) -> Option<Progress> {
        let active = self.active.lock().await;
        let entry = active.get(peer)?;
        Some(Progress::new(
            entry.bytes_received,
            entry.total_bytes_expected,
        ))
    }

    /// Filename of the peer's active transfer, if any.
    pub async fn active_filename(&self, peer: &PeerId) -> Option<String> {
        self.active.lock().await.get(peer).map(|e| e.filename.clone())
    }

    async fn discard(&self, peer: &PeerId) {
        self.active.lock().await.remove(peer);
    }
}

/// Flush and trim the destination to the received length, then close.
async fn finalize(mut entry: ActiveReceive) -> Result<PathBuf, SessionError> {
    entry
        .file
        .flush()
        .await
        .map_err(|source| SessionError::StorageUnavailable { source })?;
    entry
        .file
        .set_len(entry.bytes_received)
        .await
        .map_err(|source| SessionError::StorageUnavailable { source })?;
    Ok(entry.destination)
}
