//! Length-prefixed framing for chat messages.
//!
//! Every frame on the wire is a 4-byte big-endian length header followed by
//! exactly that many body bytes:
//!
//! ```text
//! +----------------+------------------------+
//! | length: u32    | body: length bytes     |
//! +----------------+------------------------+
//! ```
//!
//! This module is a pure data transform. Reading and writing frames on a
//! socket lives in [`crate::connection`].

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length header preceding every body.
pub const HEADER_SIZE: usize = 4;

/// Largest body a single frame may carry.
pub const MAX_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame declares an empty body")]
    Empty,
    #[error("frame declares {declared} body bytes, limit is {}", MAX_BODY_BYTES)]
    Oversized { declared: u32 },
    #[error("frame declares {declared} body bytes but only {available} were supplied")]
    Truncated { declared: usize, available: usize },
    #[error("frame header needs {} bytes, got {available}", HEADER_SIZE)]
    IncompleteHeader { available: usize },
}

/// An immutable chat message body, at most [`MAX_BODY_BYTES`] long.
///
/// Cloning is cheap: the body is reference counted, so a broadcast hands the
/// same allocation to every receiving mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    body: Bytes,
}

impl Message {
    /// Builds a message, truncating anything past [`MAX_BODY_BYTES`].
    pub fn new(body: impl Into<Bytes>) -> Self {
        let mut body = body.into();
        body.truncate(MAX_BODY_BYTES);
        Self { body }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// A server-generated notification such as a join or leave notice.
    pub fn notice(text: impl AsRef<str>) -> Self {
        Self::from_text(&format!("*** {}", text.as_ref()))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Renders the body as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Serializes the message into a complete frame.
    pub fn encode(&self) -> Bytes {
        encode_body(&self.body)
    }
}

/// Encodes `body` as a frame, truncating it to [`MAX_BODY_BYTES`] first.
pub fn encode(body: &[u8]) -> Bytes {
    encode_body(&body[..body.len().min(MAX_BODY_BYTES)])
}

fn encode_body(body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    // Bodies never exceed MAX_BODY_BYTES here, so the cast cannot wrap.
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    frame.freeze()
}

/// Validates a length header and returns the body length it announces.
///
/// A zero or oversized length is a protocol violation; callers must not try
/// to read a body after an error.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> Result<usize, FrameError> {
    let declared = u32::from_be_bytes(header);
    if declared == 0 {
        return Err(FrameError::Empty);
    }
    if declared as usize > MAX_BODY_BYTES {
        return Err(FrameError::Oversized { declared });
    }
    Ok(declared as usize)
}

/// Decodes the frame at the front of `frame`. Bytes past the declared body are
/// left untouched.
pub fn decode(frame: &[u8]) -> Result<Message, FrameError> {
    let Some((header, rest)) = frame.split_first_chunk::<HEADER_SIZE>() else {
        return Err(FrameError::IncompleteHeader {
            available: frame.len(),
        });
    };

    let declared = decode_header(*header)?;
    if rest.len() < declared {
        return Err(FrameError::Truncated {
            declared,
            available: rest.len(),
        });
    }

    Ok(Message::new(Bytes::copy_from_slice(&rest[..declared])))
}
