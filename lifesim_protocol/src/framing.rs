// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by a JSON-encoded
// `Message`. `encode` / `decode` handle the JSON step; `write_frame` and
// `read_frame` move whole frames over blocking `Write` / `Read` streams.
//
// `FrameDecoder` is the incremental form used by the session's receive loops.
// Those loops read with a short idle timeout so they can notice shutdown; a
// timeout can land in the middle of a frame, so bytes are buffered until a
// complete frame is available instead of relying on `read_exact`.
//
// `MAX_FRAME_SIZE` (64 KiB) bounds every frame. A full roster of attribute
// bags is the largest expected message and stays far below it.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::message::Message;

/// Maximum allowed payload size in bytes.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

const LEN_PREFIX: usize = 4;

/// Failure to move a `Message` across the wire.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized { len: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the failure came from the stream rather than from the bytes
    /// on it (closed socket, reset, timeout).
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

/// Serialize a message into a complete frame (prefix included).
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(msg)?;
    let len = checked_len(payload.len())?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse one frame payload (prefix already stripped).
pub fn decode(payload: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode and write one message, then flush.
pub fn write_frame<W: Write>(writer: &mut W, msg: &Message) -> Result<(), CodecError> {
    let frame = encode(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read and decode exactly one message from a blocking stream.
///
/// Returns `Io(UnexpectedEof)` if the stream closes before or during a frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message, CodecError> {
    let mut len_buf = [0u8; LEN_PREFIX];
    reader.read_exact(&mut len_buf)?;
    let len = declared_len(len_buf)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    decode(&buf)
}

fn checked_len(len: usize) -> Result<u32, CodecError> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_FRAME_SIZE => Ok(n),
        _ => Err(CodecError::Oversized { len }),
    }
}

fn declared_len(prefix: [u8; LEN_PREFIX]) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::Oversized { len });
    }
    Ok(len)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// An oversized length prefix is reported as soon as the prefix arrives,
    /// without waiting for (or allocating) the payload.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        let Some(prefix) = self.buf.first_chunk::<LEN_PREFIX>() else {
            return Ok(None);
        };
        let len = declared_len(*prefix)?;
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..LEN_PREFIX + len).collect();
        decode(&frame[LEN_PREFIX..]).map(Some)
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
