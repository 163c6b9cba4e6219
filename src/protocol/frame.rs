//! Frames and fragmentation.
//!
//! A [`Frame`] is one discrete write over the transport. Payloads larger than
//! a single write are split into a [`FragmentedMessage`]:
//! ```text
//! ┌──────────┬──────────┬─────────┬─────────┬──────────────┬──────────────────┐
//! │  opcode  │ sync id  │ maxFrag │ fragIdx │ extra header │ payload slice    │
//! │  1 byte  │  1 byte  │ 1 byte  │ 1 byte  │  0..n bytes  │ <= capacity      │
//! └──────────┴──────────┴─────────┴─────────┴──────────────┴──────────────────┘
//! ```
//! All fragments of one message share the sync id and must be written in
//! ascending `fragIdx` order; the firmware reassembles by arrival order.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::Opcode;

/// Largest fragment count representable in the one-byte `maxFrag` field.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// One immutable wire write. Always starts with an opcode byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Wraps already-encoded bytes.
    #[must_use]
    pub const fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Returns the leading opcode byte.
    #[must_use]
    pub fn opcode_byte(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Returns the decoded opcode, if known.
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        self.opcode_byte().and_then(Opcode::from_byte)
    }

    /// Returns the encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the frame carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns a cheap clone of the underlying buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Renders the frame as `[len] AA BB CC` for log lines.
    #[must_use]
    pub fn to_log_string(&self) -> String {
        hex_line(&self.0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.to_log_string())
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

/// Formats bytes as `[len] AA BB CC` (upper-case hex, space separated).
#[must_use]
pub fn hex_line(data: &[u8]) -> String {
    let mut line = format!("[{}]", data.len());
    for byte in data {
        line.push(' ');
        line.push_str(&hex::encode_upper([*byte]));
    }
    line
}

/// An ordered set of frames sharing one sync id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentedMessage {
    sync_id: u8,
    frames: Vec<Frame>,
}

impl FragmentedMessage {
    /// Returns the message-level sync id shared by every fragment.
    #[must_use]
    pub const fn sync_id(&self) -> u8 {
        self.sync_id
    }

    /// Returns the fragments in write order.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Returns the number of fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the message has no fragments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Consumes the message, yielding its frames in write order.
    #[must_use]
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

/// Number of fragments needed for `len` bytes at `capacity` bytes each.
#[must_use]
pub const fn fragment_count(len: usize, capacity: usize) -> usize {
    len.div_ceil(capacity)
}

/// Splits `payload` into fragments of at most `capacity` bytes.
///
/// Each frame is `[opcode, sync_id, maxFrag, fragIdx, extra_header.., slice..]`.
///
/// # Errors
///
/// Returns a `CodecError` if `capacity` is zero or the payload needs more
/// than [`MAX_FRAGMENTS`] fragments.
pub fn fragment(
    opcode: Opcode,
    sync_id: u8,
    extra_header: &[u8],
    payload: &[u8],
    capacity: usize,
) -> Result<FragmentedMessage, CodecError> {
    if capacity == 0 {
        return Err(CodecError::ZeroCapacity);
    }

    let count = fragment_count(payload.len(), capacity);
    let max_frag = u8::try_from(count).map_err(|_| CodecError::TooManyFragments {
        len: payload.len(),
        count,
    })?;

    let frames = payload
        .chunks(capacity)
        .zip(0..=max_frag)
        .map(|(chunk, index)| {
            let mut buf = BytesMut::with_capacity(4 + extra_header.len() + chunk.len());
            buf.put_u8(opcode.as_byte());
            buf.put_u8(sync_id);
            buf.put_u8(max_frag);
            buf.put_u8(index);
            buf.put_slice(extra_header);
            buf.put_slice(chunk);
            Frame(buf.freeze())
        })
        .collect();

    Ok(FragmentedMessage { sync_id, frames })
}
