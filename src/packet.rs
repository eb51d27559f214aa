//! Packet buffer (C1): a chunk queue with a read cursor into the head chunk.
//!
//! Bytes arrive from the reactor as discrete chunks (whatever the socket read
//! returned) and get appended here; the wire codec peeks and pops fixed-size
//! spans across chunk boundaries without knowing how the bytes were chunked.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use crate::error::{Result, WireError};

/// An ordered sequence of byte chunks plus a read offset into the head chunk.
///
/// Invariant: `offset <= chunks.front().len()` whenever `chunks` is non-empty;
/// `offset == 0` whenever `chunks` is empty.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    chunks: VecDeque<Bytes>,
    offset: usize,
    len: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total unread bytes across every chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk of freshly received bytes. Never suspends, never fails.
    pub fn append(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Non-destructive read of exactly `n` bytes. Returns `None` if fewer than
    /// `n` bytes are buffered. Never mutates `self`.
    pub fn peek(&self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        let mut iter = self.chunks.iter();
        let head = iter.next()?;
        let head_remaining = head.len() - self.offset;
        if n <= head_remaining {
            return Some(head.slice(self.offset..self.offset + n));
        }

        let mut out = BytesMut::with_capacity(n);
        out.extend_from_slice(&head[self.offset..]);
        let mut remaining = n - head_remaining;
        for chunk in iter {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
        }
        Some(out.freeze())
    }

    /// Destructive read of exactly `n` bytes, advancing the cursor and
    /// releasing any chunk that becomes fully consumed.
    ///
    /// When the request is exactly the remainder of the head chunk and the
    /// cursor sits at the start of it, the head chunk is handed back by
    /// reference-counted move rather than copied; this matters for large row
    /// payloads where a memcpy would otherwise dominate.
    pub fn pop(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        let head_len = self.chunks.front()?.len();
        let head_remaining = head_len - self.offset;

        if n == head_remaining && self.offset == 0 {
            let chunk = self.chunks.pop_front()?;
            self.len -= n;
            return Some(chunk);
        }

        if n < head_remaining {
            let head = self.chunks.front().unwrap();
            let out = head.slice(self.offset..self.offset + n);
            self.offset += n;
            self.len -= n;
            return Some(out);
        }

        // Spans multiple chunks: fall back to a copy.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let head = self.chunks.front().cloned().unwrap();
            let avail = head.len() - self.offset;
            let take = remaining.min(avail);
            out.extend_from_slice(&head[self.offset..self.offset + take]);
            self.offset += take;
            self.len -= take;
            remaining -= take;
            if self.offset == head.len() {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }
        Some(out.freeze())
    }
}

/// A borrowed view over a contiguous byte buffer with a read cursor, used for
/// decoding a single already-framed packet payload.
pub struct NetworkPacket<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> NetworkPacket<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    pub fn has_more(&self, n: usize) -> bool {
        self.data.len() - self.cursor >= n
    }

    /// Non-destructive read; does not move the cursor.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if !self.has_more(n) {
            return Err(WireError::Eof("network packet peek").into());
        }
        Ok(&self.data[self.cursor..self.cursor + n])
    }

    /// Destructive read; moves the cursor past the returned span.
    pub fn get(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self.peek(n)?;
        self.cursor += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if !self.has_more(n) {
            return Err(WireError::Eof("network packet skip").into());
        }
        self.cursor += n;
        Ok(())
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.cursor..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_framing_scenario() {
        // Spec scenario 1: two chunks arrive, a length-prefixed packet header
        // plus one extra byte of the next packet's header straddle them.
        let mut buf = PacketBuffer::new();
        buf.append(Bytes::from_static(&[0x03, 0x00, 0x00, 0x00, 0x05]));

        let peeked = buf.peek(4).unwrap();
        assert_eq!(&peeked[..], &[0x03, 0x00, 0x00, 0x00]);
        assert_eq!(buf.len(), 5); // peek never mutates

        buf.append(Bytes::from_static(&[0x00, 0x00, 0xff]));

        let first = buf.pop(4).unwrap();
        assert_eq!(&first[..], &[0x03, 0x00, 0x00, 0x00]);

        let second = buf.pop(4).unwrap();
        assert_eq!(&second[..], &[0x05, 0x00, 0x00, 0xff]);

        assert!(buf.is_empty());
    }

    #[test]
    fn peek_insufficient_data_returns_none() {
        let mut buf = PacketBuffer::new();
        buf.append(Bytes::from_static(&[1, 2, 3]));
        assert!(buf.peek(10).is_none());
        assert!(buf.pop(10).is_none());
    }

    #[test]
    fn pop_exact_head_chunk_is_zero_copy_move() {
        let mut buf = PacketBuffer::new();
        let chunk = Bytes::from_static(b"hello world");
        buf.append(chunk.clone());

        let popped = buf.pop(chunk.len()).unwrap();
        // Same backing storage: slicing the whole chunk out should not have
        // allocated a new buffer, so the pointer into the arc-backed bytes matches.
        assert_eq!(popped.as_ptr(), chunk.as_ptr());
        assert!(buf.is_empty());
    }

    #[test]
    fn pop_spanning_chunks_concatenates_in_order() {
        let mut buf = PacketBuffer::new();
        buf.append(Bytes::from_static(b"ab"));
        buf.append(Bytes::from_static(b"cd"));
        buf.append(Bytes::from_static(b"ef"));

        let out = buf.pop(5).unwrap();
        assert_eq!(&out[..], b"abcde");
        let rest = buf.pop(1).unwrap();
        assert_eq!(&rest[..], b"f");
        assert!(buf.is_empty());
    }

    #[test]
    fn network_packet_view_bounds_and_cursor() {
        let data = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut view = NetworkPacket::new(&data);

        assert!(view.has_more(4));
        assert_eq!(view.peek(2).unwrap(), &[0xaa, 0xbb]);
        assert_eq!(view.cursor(), 0);

        assert_eq!(view.get(2).unwrap(), &[0xaa, 0xbb]);
        assert_eq!(view.cursor(), 2);

        view.skip(1).unwrap();
        assert_eq!(view.cursor(), 3);

        assert!(view.get(2).is_err());
    }
}
