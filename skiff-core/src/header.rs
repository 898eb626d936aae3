//! Wire framing: 4-byte big-endian length prefix + bincode transfer metadata.
//!
//! Every transfer payload starts with this header, on both send paths: the
//! whole-blob path appends the file bytes directly after it, the stream path
//! writes it first and then raw chunks until end-of-stream.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::metadata::TransferMetadata;

const LEN_SIZE: usize = 4;
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a metadata header: 4 bytes BE length + bincode payload.
pub fn encode_header(metadata: &TransferMetadata) -> Result<Vec<u8>, HeaderError> {
    let payload = bincode::serialize(metadata).map_err(HeaderError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_HEADER_LEN {
        return Err(HeaderError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one header from the front of `bytes`. Returns the metadata and the
/// number of bytes consumed; anything after that is file content. The reader
/// must not interpret payload bytes before the full header is available.
pub fn decode_header(bytes: &[u8]) -> Result<(TransferMetadata, usize), HeaderError> {
    if bytes.len() < LEN_SIZE {
        return Err(HeaderError::Truncated);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_HEADER_LEN {
        return Err(HeaderError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(HeaderError::Truncated);
    }
    let metadata: TransferMetadata =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(HeaderError::Decode)?;
    Ok((metadata, LEN_SIZE + len))
}

/// Read one header from an async stream: exactly 4 length bytes, then exactly
/// that many metadata bytes. The stream position afterwards is the first byte
/// of file content.
pub async fn read_header<R>(reader: &mut R) -> Result<TransferMetadata, HeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| HeaderError::Truncated)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_HEADER_LEN {
        return Err(HeaderError::TooLarge);
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| HeaderError::Truncated)?;
    bincode::deserialize(&payload).map_err(HeaderError::Decode)
}

/// Error encoding or decoding a metadata header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header truncated")]
    Truncated,
    #[error("header too large")]
    TooLarge,
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> TransferMetadata {
        TransferMetadata {
            filename: "holiday.png".into(),
            content_type: "image/png".into(),
            file_size: 204_800,
            resume_offset: 0,
        }
    }

    #[test]
    fn roundtrip() {
        let meta = sample_metadata();
        let frame = encode_header(&meta).unwrap();
        let (decoded, n) = decode_header(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, meta);
    }

    #[test]
    fn roundtrip_with_resume_offset() {
        let mut meta = sample_metadata();
        meta.resume_offset = 131_072;
        let frame = encode_header(&meta).unwrap();
        let (decoded, _) = decode_header(&frame).unwrap();
        assert_eq!(decoded.resume_offset, 131_072);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let meta = sample_metadata();
        let frame = encode_header(&meta).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - LEN_SIZE);
    }

    #[test]
    fn truncated_prefix_fails() {
        let frame = encode_header(&sample_metadata()).unwrap();
        assert!(matches!(
            decode_header(&frame[..2]),
            Err(HeaderError::Truncated)
        ));
        assert!(matches!(decode_header(&[]), Err(HeaderError::Truncated)));
    }

    #[test]
    fn truncated_payload_fails() {
        let frame = encode_header(&sample_metadata()).unwrap();
        assert!(matches!(
            decode_header(&frame[..frame.len() - 1]),
            Err(HeaderError::Truncated)
        ));
    }

    #[test]
    fn consumed_count_leaves_payload_intact() {
        let meta = sample_metadata();
        let mut buf = encode_header(&meta).unwrap();
        let content = b"file content follows";
        buf.extend_from_slice(content);
        let (_, n) = decode_header(&buf).unwrap();
        assert_eq!(&buf[n..], content);
    }

    #[tokio::test]
    async fn async_read_header() {
        let meta = sample_metadata();
        let mut buf = encode_header(&meta).unwrap();
        buf.extend_from_slice(b"rest");
        let mut reader: &[u8] = &buf;
        let decoded = read_header(&mut reader).await.unwrap();
        assert_eq!(decoded, meta);
        // Reader is positioned at the first content byte.
        assert_eq!(reader, b"rest");
    }

    #[tokio::test]
    async fn async_read_header_truncated() {
        let frame = encode_header(&sample_metadata()).unwrap();
        let mut reader: &[u8] = &frame[..frame.len() - 3];
        assert!(matches!(
            read_header(&mut reader).await,
            Err(HeaderError::Truncated)
        ));
    }
}
