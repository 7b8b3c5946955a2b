//! TLV wire codec.
//!
//! Every frame on the wire is:
//!
//! ```text
//! kind(1 byte) length(2 bytes, big-endian) payload(length bytes)
//! kind := 0 = MESSAGE | 1 = COMMAND
//! ```
//!
//! `decode` works on a borrowed buffer and never copies the payload.
//! `FrameCodec` layers partial-frame buffering and the configured payload
//! limit on top of it for the connection read loop.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the kind + length header.
pub const HEADER_LEN: usize = 3;

/// Largest payload the 16-bit length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Chat line.
    Message,
    /// Slash command.
    Command,
    /// Any tag this server does not understand. Kept so the handler can
    /// answer it instead of dropping the connection.
    Other(u8),
}

impl FrameKind {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            0 => FrameKind::Message,
            1 => FrameKind::Command,
            other => FrameKind::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Message => 0,
            FrameKind::Command => 1,
            FrameKind::Other(tag) => tag,
        }
    }
}

/// Frame codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than `length + 3` bytes are available.
    TruncatedFrame { needed: usize, available: usize },
    /// Payload length exceeds the limit in force.
    PayloadTooLarge { len: usize, limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TruncatedFrame { needed, available } => {
                write!(f, "Truncated frame: need {} bytes, have {}", needed, available)
            }
            FrameError::PayloadTooLarge { len, limit } => {
                write!(f, "Payload too large: {} bytes exceeds limit {}", len, limit)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Borrowed view of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView<'a> {
    pub kind: FrameKind,
    pub length: u16,
    pub payload: &'a [u8],
}

impl FrameView<'_> {
    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Owned frame handed from the codec to the connection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Payload as text, cut at the first CR, LF or NUL.
    pub fn text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == b'\r' || b == b'\n' || b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

/// Append one frame to `dst`.
pub fn encode_into(kind: FrameKind, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            limit: MAX_FRAME_PAYLOAD,
        });
    }

    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u8(kind.as_u8());
    dst.put_u16(payload.len() as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Encode one frame into a fresh buffer.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(kind, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a server notice as a MESSAGE frame.
pub fn message(text: &str) -> Result<Bytes, FrameError> {
    encode(FrameKind::Message, text.as_bytes())
}

/// Decode the frame at the front of `buf` without copying its payload.
pub fn decode(buf: &[u8]) -> Result<FrameView<'_>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::TruncatedFrame {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }

    let length = u16::from_be_bytes([buf[1], buf[2]]);
    let total = HEADER_LEN + length as usize;
    if buf.len() < total {
        return Err(FrameError::TruncatedFrame {
            needed: total,
            available: buf.len(),
        });
    }

    Ok(FrameView {
        kind: FrameKind::from_u8(buf[0]),
        length,
        payload: &buf[HEADER_LEN..total],
    })
}

/// Incremental decoder for a connection's read buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split the next complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared length over
    /// the limit is rejected as soon as the header is visible.
    pub fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() >= HEADER_LEN {
            let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
            if declared > self.max_payload {
                return Err(FrameError::PayloadTooLarge {
                    len: declared,
                    limit: self.max_payload,
                });
            }
        }

        let (kind, wire_len) = match decode(buf) {
            Ok(view) => (view.kind, view.wire_len()),
            Err(FrameError::TruncatedFrame { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut frame = buf.split_to(wire_len);
        let payload = frame.split_off(HEADER_LEN).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}
