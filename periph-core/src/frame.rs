//! Opaque protocol frames

use std::fmt;

use bytes::Bytes;

/// One complete protocol unit as recognized by a [`Framer`](crate::Framer).
///
/// Immutable byte sequence; cloning is cheap (`Bytes` refcount). Produced by
/// the transport channel's read pump, consumed by whichever waiter's
/// predicate matches it first.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// True for a 1-byte frame equal to the given control byte (ACK/NAK/ENQ).
    pub fn is_control(&self, byte: u8) -> bool {
        self.0.len() == 1 && self.0[0] == byte
    }

    /// True for any multi-byte (non-control) frame.
    pub fn is_message(&self) -> bool {
        self.0.len() > 1
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame[{}]({})", self.0.len(), hex::encode_upper(&self.0))
    }
}
