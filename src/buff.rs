//! Framed buffer primitives for the wire protocol.
//!
//! Messages are `tag:u8 | length:u32_be | payload`; the length includes
//! itself but not the tag. [`Reader`] walks a single payload, [`Writer`]
//! builds outgoing messages with a deferred-length header that is patched
//! in `end_message`. Codec payloads nest length-prefixed blocks via
//! `begin_bytes`/`end_bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Frames larger than this are rejected as malformed.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reader over one message payload.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.remaining() == 0
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "message payload truncated: wanted {} bytes, {} remain",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn pop_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn pop_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn pop_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn pop_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn pop_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn pop_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn pop_uuid(&mut self) -> Result<Uuid> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Length-prefixed byte string (`u32` length).
    pub fn pop_bytes(&mut self) -> Result<Bytes> {
        let len = self.pop_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Length-prefixed UTF-8 string.
    pub fn pop_str(&mut self) -> Result<String> {
        let raw = self.pop_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::protocol(format!("invalid UTF-8 in string: {}", e)))
    }

    /// Advance without copying.
    pub fn discard(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Split off the next `n` bytes as an independent reader.
    pub fn slice(&mut self, n: usize) -> Result<Reader> {
        self.need(n)?;
        Ok(Reader::new(self.buf.split_to(n)))
    }

    /// Remaining bytes, consuming the reader.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    /// Reject trailing bytes the decoder did not consume.
    pub fn expect_end(&self) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after message payload",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Writer for outgoing messages.
///
/// `begin_message` reserves the length field; `end_message` patches it.
/// Several messages may be queued in one writer before the buffer is
/// flushed to the transport.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
    // offsets of open length fields, innermost last
    frames: Vec<usize>,
    msg_open: bool,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            frames: Vec::new(),
            msg_open: false,
        }
    }

    pub fn begin_message(&mut self, tag: u8) -> &mut Self {
        debug_assert!(!self.msg_open, "previous message not ended");
        self.msg_open = true;
        self.buf.put_u8(tag);
        self.frames.push(self.buf.len());
        self.buf.put_u32(0);
        self
    }

    pub fn end_message(&mut self) -> Result<()> {
        debug_assert!(self.msg_open);
        let start = self
            .frames
            .pop()
            .ok_or_else(|| Error::protocol("end_message without begin_message"))?;
        let len = self.buf.len() - start;
        if len > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "outgoing message of {} bytes exceeds frame limit",
                len
            )));
        }
        self.buf[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        self.msg_open = false;
        Ok(())
    }

    /// Open a nested length-prefixed block (`u32` length excluding the
    /// length field itself), used by codecs for variable-width payloads.
    pub fn begin_bytes(&mut self) {
        self.frames.push(self.buf.len());
        self.buf.put_u32(0);
    }

    pub fn end_bytes(&mut self) -> Result<()> {
        let start = self
            .frames
            .pop()
            .ok_or_else(|| Error::protocol("end_bytes without begin_bytes"))?;
        let len = self.buf.len() - start - 4;
        self.buf[start..start + 4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn push_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn push_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn push_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn push_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn push_uuid(&mut self, id: Uuid) {
        self.buf.put_slice(id.as_bytes());
    }

    pub fn push_raw(&mut self, raw: &[u8]) {
        self.buf.put_slice(raw);
    }

    /// Length-prefixed byte string.
    pub fn push_bytes(&mut self, raw: &[u8]) {
        self.buf.put_u32(raw.len() as u32);
        self.buf.put_slice(raw);
    }

    /// Length-prefixed UTF-8 string.
    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the accumulated bytes, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        debug_assert!(self.frames.is_empty(), "unclosed frame");
        self.buf.split().freeze()
    }
}
