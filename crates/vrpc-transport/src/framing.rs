//! Frame reassembly for byte streams without message boundaries.
//!
//! A frame is complete once the header terminator has been seen and
//! `terminator offset + 4 + Content-Length` bytes have been buffered. The
//! declared length is read leniently: a missing or unparsable
//! `Content-Length` counts as zero so a malformed head still yields a frame
//! the codec can reject with a proper fault.
//!
//! A frame whose declared size exceeds the limit is rejected as soon as its
//! head arrives, and the rest of its body is skipped as it streams in so the
//! following frame is read intact.

use vrpc_protocol::{HEADER_TERMINATOR, find_header_end};

use crate::errors::TransportError;

/// Largest frame accepted by default.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Largest header block accepted before the terminator must appear.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Accumulates stream bytes and yields complete frames.
///
/// Bytes that follow a complete frame stay buffered for the next frame.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    frame_len: Option<usize>,
    skip: usize,
    limit: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Creates a buffer using [`MAX_FRAME_BYTES`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    /// Creates a buffer with a custom frame size limit.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            frame_len: None,
            skip: 0,
            limit,
        }
    }

    /// Appends received bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] when the declared frame or an
    /// unterminated header block exceeds the limit. The oversized frame is
    /// dropped, including body bytes that have not arrived yet.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let skipped = self.skip.min(bytes.len());
        self.skip = self.skip.saturating_sub(skipped);
        self.buffer
            .extend_from_slice(bytes.get(skipped..).unwrap_or_default());
        self.measure()
    }

    /// Replaces the frame size limit for frames not yet measured.
    pub const fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Removes and returns the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] when the bytes after the
    /// previous frame declare an oversized frame.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.measure()?;
        let Some(frame_len) = self.frame_len.filter(|len| self.buffer.len() >= *len) else {
            return Ok(None);
        };
        let remainder = self.buffer.split_off(frame_len);
        let frame = std::mem::replace(&mut self.buffer, remainder);
        self.frame_len = None;
        Ok(Some(frame))
    }

    /// Drops any partially received frame and returns its size.
    ///
    /// Bytes still owed by a rejected oversized frame keep being skipped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.frame_len = None;
        dropped
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reports whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes of a rejected frame still to be skipped.
    #[must_use]
    pub const fn skipping(&self) -> usize {
        self.skip
    }

    fn measure(&mut self) -> Result<(), TransportError> {
        if self.frame_len.is_some() {
            return Ok(());
        }
        let Some(head_end) = find_header_end(&self.buffer) else {
            let head_limit = MAX_HEAD_BYTES.min(self.limit);
            if self.buffer.len() > head_limit {
                let size = self.discard();
                return Err(TransportError::FrameTooLarge {
                    size,
                    limit: head_limit,
                });
            }
            return Ok(());
        };
        let head = self.buffer.get(..head_end).unwrap_or_default();
        let body_len = declared_body_length(head);
        let size = head_end
            .saturating_add(HEADER_TERMINATOR.len())
            .saturating_add(body_len);
        if size > self.limit {
            self.reject(size);
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.limit,
            });
        }
        self.frame_len = Some(size);
        Ok(())
    }

    /// Drops the first `size` bytes of the stream, buffered or not.
    fn reject(&mut self, size: usize) {
        if self.buffer.len() >= size {
            self.buffer = self.buffer.split_off(size);
        } else {
            self.skip = size.saturating_sub(self.buffer.len());
            self.buffer.clear();
        }
        self.frame_len = None;
    }
}

/// Reads `Content-Length` from a raw header block.
///
/// Missing or unparsable values count as zero.
#[must_use]
pub fn declared_body_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const FRAME: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"a\":1}";

    #[test]
    fn whole_frame_is_returned_at_once() {
        let mut frames = FrameBuffer::new();
        frames.push(FRAME).expect("push");
        assert_eq!(frames.take_frame().expect("measure").as_deref(), Some(FRAME));
        assert!(frames.is_empty());
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    #[case(13)]
    fn split_feeds_yield_the_same_frame(#[case] piece: usize) {
        let mut frames = FrameBuffer::new();
        let mut produced = Vec::new();
        for chunk in FRAME.chunks(piece) {
            assert!(produced.is_empty(), "frame completed early");
            frames.push(chunk).expect("push");
            if let Some(frame) = frames.take_frame().expect("measure") {
                produced = frame;
            }
        }
        assert_eq!(produced, FRAME);
    }

    #[test]
    fn every_single_split_point_yields_the_frame() {
        for split in 0..=FRAME.len() {
            let (first, second) = FRAME.split_at(split);
            let mut frames = FrameBuffer::new();
            frames.push(first).expect("push first");
            let early = frames.take_frame().expect("measure");
            frames.push(second).expect("push second");
            let frame = early.or_else(|| frames.take_frame().expect("measure"));
            assert_eq!(frame.as_deref(), Some(FRAME), "split at {split}");
        }
    }

    #[test]
    fn back_to_back_frames_are_separated() {
        let mut joined = FRAME.to_vec();
        joined.extend_from_slice(b"GET /y HTTP/1.1\r\n\r\n");
        let mut frames = FrameBuffer::new();
        frames.push(&joined).expect("push");
        assert_eq!(frames.take_frame().expect("measure").as_deref(), Some(FRAME));
        assert_eq!(
            frames.take_frame().expect("measure").as_deref(),
            Some(b"GET /y HTTP/1.1\r\n\r\n".as_slice())
        );
        assert!(frames.take_frame().expect("measure").is_none());
    }

    #[rstest]
    #[case::missing(b"GET /x HTTP/1.1\r\nHost: a".as_slice(), 0)]
    #[case::garbage(b"GET /x HTTP/1.1\r\nContent-Length: ten".as_slice(), 0)]
    #[case::lowercase(b"GET /x HTTP/1.1\r\ncontent-length:  12 ".as_slice(), 12)]
    fn declared_length_is_lenient(#[case] head: &[u8], #[case] expected: usize) {
        assert_eq!(declared_body_length(head), expected);
    }

    #[test]
    fn oversized_declarations_fail_fast() {
        let mut frames = FrameBuffer::with_limit(64);
        let error = frames
            .push(b"POST /x HTTP/1.1\r\nContent-Length: 1000\r\n\r\n")
            .expect_err("too large");
        assert!(matches!(error, TransportError::FrameTooLarge { limit: 64, .. }));
        assert!(frames.is_empty());
    }

    #[test]
    fn rejected_bodies_are_skipped_before_the_next_frame() {
        let head = b"POST /x HTTP/1.1\r\nContent-Length: 100\r\n\r\n";
        let mut frames = FrameBuffer::with_limit(64);
        assert!(frames.push(head).is_err());
        assert_eq!(frames.skipping(), 100);

        let mut tail = vec![b'x'; 100];
        tail.extend_from_slice(FRAME);
        for piece in tail.chunks(30) {
            frames.push(piece).expect("push");
        }
        assert_eq!(frames.skipping(), 0);
        assert_eq!(frames.take_frame().expect("measure").as_deref(), Some(FRAME));
    }

    #[test]
    fn oversized_frame_after_a_valid_one_is_dropped_whole() {
        let mut joined = FRAME.to_vec();
        let oversized_at = joined.len();
        joined.extend_from_slice(b"POST /y HTTP/1.1\r\nContent-Length: 30\r\n\r\n");
        joined.extend_from_slice(&[b'y'; 30]);
        joined.extend_from_slice(FRAME);
        let mut frames = FrameBuffer::with_limit(64);
        frames
            .push(joined.get(..oversized_at).expect("prefix"))
            .expect("push");
        assert_eq!(frames.take_frame().expect("measure").as_deref(), Some(FRAME));
        assert!(frames.push(joined.get(oversized_at..).expect("rest")).is_err());
        assert_eq!(frames.take_frame().expect("measure").as_deref(), Some(FRAME));
    }

    #[test]
    fn discard_reports_partial_size() {
        let mut frames = FrameBuffer::new();
        frames.push(b"POST /x HTTP/1.1\r\n").expect("push");
        assert_eq!(frames.discard(), 18);
        assert_eq!(frames.buffered(), 0);
    }
}
