//! Frame extraction from accumulating byte buffers

use bytes::BytesMut;

use crate::frame::Frame;

/// Turns an accumulating byte buffer into discrete frames.
///
/// `extract` is a pure function over the buffer: it either consumes exactly
/// the bytes of one complete frame (plus any discarded garbage prefix) and
/// returns it, or returns `None` when more bytes are needed. No protocol
/// state is retained between calls, so the same byte sequence yields the
/// same frames no matter how it is split across reads.
pub trait Framer: Send + Sync {
    /// Extract at most one complete frame from the front of `buf`.
    fn extract(&self, buf: &mut BytesMut) -> Option<Frame>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Feed `bytes` to `framer` in chunks of `chunk` bytes, collecting every
    /// extracted frame. Used by the per-protocol fragmentation tests.
    pub fn feed_chunked(framer: &dyn Framer, bytes: &[u8], chunk: usize) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for part in bytes.chunks(chunk.max(1)) {
            buf.extend_from_slice(part);
            while let Some(frame) = framer.extract(&mut buf) {
                frames.push(frame);
            }
        }
        frames
    }
}
