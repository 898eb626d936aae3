//! Transfer metadata: the descriptor prepended to every file payload.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Describes one file transfer. Serialized with bincode behind the length
/// prefix built by the header codec; both send paths carry the same fields.
/// Immutable once built except `resume_offset`, which is set when a resumed
/// send is negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub filename: String,
    pub content_type: String,
    pub file_size: u64,
    pub resume_offset: u64,
}

impl TransferMetadata {
    /// Build metadata for a local file: stat it for the size and infer the
    /// content type from the extension. Fails with `MetadataUnavailable`
    /// when the file cannot be statted or its name is not valid UTF-8.
    pub fn for_path(path: &Path) -> Result<Self, SessionError> {
        let attrs = std::fs::metadata(path).map_err(|source| SessionError::MetadataUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SessionError::MetadataUnavailable {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "unusable file name"),
            })?
            .to_string();
        let content_type = content_type_for(&filename).to_string();
        Ok(Self {
            filename,
            content_type,
            file_size: attrs.len(),
            resume_offset: 0,
        })
    }
}

/// Extension-to-MIME mapping used when building metadata. Unknown extensions
/// fall back to the generic octet-stream type.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "zip" => "application/zip",
        "archive" => "application/vnd.peertopeer.bundle",
        _ => "application/octet-stream",
    }
}
