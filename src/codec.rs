//! Length-prefixed packet codec.
//!
//! Every frame on the wire is `[length: FrameWidth bytes, little-endian]`
//! followed by exactly `length` payload bytes. The width is fixed for the
//! lifetime of a connection and must be configured identically on both ends.
//!
//! [`FrameWriter`] and [`FrameReader`] are sequential cursors over a single
//! contiguous buffer. Overrunning a writer's declared payload length or
//! reading past the end of a frame is a programming-contract violation, not
//! a runtime data error, and panics.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::pool::BufferPool;

/// Width of the length prefix, in bytes.
///
/// Chosen per listener/connection according to the largest frame the
/// protocol on top needs to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum FrameWidth {
    U8 = 1,
    U16 = 2,
    U32 = 4,
    U64 = 8,
}

impl FrameWidth {
    /// Prefix size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        self as usize
    }

    /// Largest payload length this prefix width can describe.
    #[inline]
    pub const fn max_payload(self) -> u64 {
        match self {
            FrameWidth::U8 => u8::MAX as u64,
            FrameWidth::U16 => u16::MAX as u64,
            FrameWidth::U32 => u32::MAX as u64,
            FrameWidth::U64 => u64::MAX,
        }
    }

    /// Select a width by its byte size; anything but 1, 2, 4 or 8 is a
    /// configuration error.
    pub fn from_size(size: usize) -> Result<Self> {
        match size {
            1 => Ok(FrameWidth::U8),
            2 => Ok(FrameWidth::U16),
            4 => Ok(FrameWidth::U32),
            8 => Ok(FrameWidth::U64),
            other => Err(GatewayError::config(format!(
                "frame width must be 1, 2, 4 or 8 bytes, got {other}"
            ))),
        }
    }

    /// Encode `value` into the first `size()` bytes of `buf`.
    #[inline]
    pub fn put(self, buf: &mut [u8], value: u64) {
        match self {
            FrameWidth::U8 => buf[0] = value as u8,
            FrameWidth::U16 => LittleEndian::write_u16(buf, value as u16),
            FrameWidth::U32 => LittleEndian::write_u32(buf, value as u32),
            FrameWidth::U64 => LittleEndian::write_u64(buf, value),
        }
    }

    /// Decode a value from the first `size()` bytes of `buf`.
    #[inline]
    pub fn get(self, buf: &[u8]) -> u64 {
        match self {
            FrameWidth::U8 => buf[0] as u64,
            FrameWidth::U16 => LittleEndian::read_u16(buf) as u64,
            FrameWidth::U32 => LittleEndian::read_u32(buf) as u64,
            FrameWidth::U64 => LittleEndian::read_u64(buf),
        }
    }
}

impl Default for FrameWidth {
    fn default() -> Self {
        FrameWidth::U32
    }
}

impl TryFrom<usize> for FrameWidth {
    type Error = GatewayError;

    fn try_from(size: usize) -> Result<Self> {
        Self::from_size(size)
    }
}

impl From<FrameWidth> for usize {
    fn from(width: FrameWidth) -> usize {
        width.size()
    }
}

/// Sequential write cursor over a pre-sized frame buffer.
///
/// `new` writes the length prefix immediately; the cursor then covers
/// exactly the declared payload length. The finished buffer (prefix +
/// payload) is sent in one write.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    pos: usize,
}

impl FrameWriter {
    /// Wrap an existing buffer of exactly `width.size() + payload_len`
    /// bytes and write the length prefix.
    ///
    /// # Panics
    ///
    /// Panics if the buffer size does not match the declared frame size.
    pub fn new(mut buf: BytesMut, width: FrameWidth, payload_len: usize) -> Result<Self> {
        if payload_len as u64 > width.max_payload() {
            return Err(GatewayError::FrameTooLarge {
                len: payload_len,
                max: width.max_payload(),
            });
        }
        assert_eq!(
            buf.len(),
            width.size() + payload_len,
            "frame buffer does not match declared frame size"
        );
        width.put(&mut buf[..width.size()], payload_len as u64);
        Ok(Self {
            buf,
            pos: width.size(),
        })
    }

    /// Allocate the frame buffer from `pool` and write the length prefix.
    pub fn with_pool(
        pool: &dyn BufferPool,
        width: FrameWidth,
        payload_len: usize,
    ) -> Result<Self> {
        if payload_len as u64 > width.max_payload() {
            return Err(GatewayError::FrameTooLarge {
                len: payload_len,
                max: width.max_payload(),
            });
        }
        let size = width.size() + payload_len;
        let buf = pool.alloc(size).ok_or(GatewayError::PoolExhausted {
            requested: size,
            max: pool.max_alloc(),
        })?;
        Self::new(buf, width, payload_len)
    }

    #[inline]
    fn slot(&mut self, n: usize) -> &mut [u8] {
        assert!(
            self.pos + n <= self.buf.len(),
            "frame writer overrun: {} bytes requested, {} left",
            n,
            self.buf.len() - self.pos
        );
        let slot = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        slot
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.slot(1)[0] = value;
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        LittleEndian::write_u16(self.slot(2), value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        LittleEndian::write_u32(self.slot(4), value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        LittleEndian::write_u64(self.slot(8), value);
        self
    }

    /// Width-selected integer write for generic callers.
    pub fn write_uint(&mut self, width: FrameWidth, value: u64) -> &mut Self {
        width.put(self.slot(width.size()), value);
        self
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.slot(data.len()).copy_from_slice(data);
        self
    }

    /// Write a `u8` byte count followed by the bytes themselves.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 255 bytes.
    pub fn write_bytes8(&mut self, data: &[u8]) -> &mut Self {
        assert!(data.len() <= u8::MAX as usize, "bytes8 field too long");
        self.write_u8(data.len() as u8);
        self.write_bytes(data)
    }

    /// Bytes still writable before the declared payload length is reached.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The full frame (prefix + payload) as built so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Hand back the full frame buffer.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

/// Sequential read cursor over a received frame payload.
#[derive(Debug)]
pub struct FrameReader {
    data: Bytes,
}

impl FrameReader {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.data.get_u8()
    }

    pub fn read_u16(&mut self) -> u16 {
        self.data.get_u16_le()
    }

    pub fn read_u32(&mut self) -> u32 {
        self.data.get_u32_le()
    }

    pub fn read_u64(&mut self) -> u64 {
        self.data.get_u64_le()
    }

    /// Width-selected integer read for generic callers.
    pub fn read_uint(&mut self, width: FrameWidth) -> u64 {
        self.data.get_uint_le(width.size())
    }

    /// Consume the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Bytes {
        self.data.split_to(n)
    }

    /// Read a `u8` byte count followed by that many bytes.
    pub fn read_bytes8(&mut self) -> Bytes {
        let n = self.read_u8() as usize;
        self.read_bytes(n)
    }

    /// Skip `n` bytes.
    pub fn seek(&mut self, n: usize) -> &mut Self {
        self.data.advance(n);
        self
    }

    /// Unconsumed bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take ownership of the unconsumed tail.
    pub fn into_remaining(self) -> Bytes {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HeapPool;
    use proptest::prelude::*;

    #[test]
    fn width_from_size() {
        assert_eq!(FrameWidth::from_size(1).unwrap(), FrameWidth::U8);
        assert_eq!(FrameWidth::from_size(2).unwrap(), FrameWidth::U16);
        assert_eq!(FrameWidth::from_size(4).unwrap(), FrameWidth::U32);
        assert_eq!(FrameWidth::from_size(8).unwrap(), FrameWidth::U64);
        assert!(FrameWidth::from_size(3).is_err());
        assert!(FrameWidth::from_size(0).is_err());
    }

    #[test]
    fn prefix_encoding_is_little_endian() {
        let mut buf = [0u8; 4];
        FrameWidth::U32.put(&mut buf, 0x0102_0304);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(FrameWidth::U32.get(&buf), 0x0102_0304);
    }

    #[test]
    fn writer_reader_round_trip() {
        let pool = HeapPool::new(1024);
        let mut w = FrameWriter::with_pool(&pool, FrameWidth::U16, 15).unwrap();
        w.write_u8(7)
            .write_u32(0xDEAD_BEEF)
            .write_u16(0xFFFF)
            .write_u64(42);
        let frame = w.into_inner();

        assert_eq!(FrameWidth::U16.get(&frame[..2]), 15);
        let mut r = FrameReader::new(frame.freeze().slice(2..));
        assert_eq!(r.read_u8(), 7);
        assert_eq!(r.read_u32(), 0xDEAD_BEEF);
        assert_eq!(r.read_u16(), 0xFFFF);
        assert_eq!(r.read_u64(), 42);
        assert!(r.is_empty());
    }

    #[test]
    fn bytes8_round_trip() {
        let pool = HeapPool::new(64);
        let mut w = FrameWriter::with_pool(&pool, FrameWidth::U8, 10).unwrap();
        w.write_bytes8(b"127.0.0.1");
        let frame = w.into_inner().freeze();
        let mut r = FrameReader::new(frame.slice(1..));
        assert_eq!(&r.read_bytes8()[..], b"127.0.0.1");
    }

    #[test]
    fn payload_too_large_for_width() {
        let pool = HeapPool::new(4096);
        let err = FrameWriter::with_pool(&pool, FrameWidth::U8, 300).unwrap_err();
        assert!(matches!(err, GatewayError::FrameTooLarge { len: 300, .. }));
    }

    #[test]
    fn pool_refusal_is_surfaced() {
        let pool = HeapPool::new(8);
        let err = FrameWriter::with_pool(&pool, FrameWidth::U32, 64).unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));
    }

    #[test]
    #[should_panic(expected = "frame writer overrun")]
    fn writer_overrun_panics() {
        let pool = HeapPool::new(64);
        let mut w = FrameWriter::with_pool(&pool, FrameWidth::U32, 2).unwrap();
        w.write_u32(1);
    }

    #[test]
    #[should_panic]
    fn reader_underrun_panics() {
        let mut r = FrameReader::new(Bytes::from_static(&[1, 2]));
        r.read_u32();
    }

    #[test]
    fn seek_skips_reserved_head() {
        let mut r = FrameReader::new(Bytes::from_static(&[0, 0, 0xFF, 0xFF]));
        assert_eq!(r.seek(2).read_u16(), 0xFFFF);
    }

    proptest! {
        #[test]
        fn framing_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let pool = HeapPool::new(4096);
            let mut w = FrameWriter::with_pool(&pool, FrameWidth::U32, payload.len()).unwrap();
            w.write_bytes(&payload);
            let frame = w.into_inner();

            prop_assert_eq!(FrameWidth::U32.get(&frame[..4]) as usize, payload.len());
            prop_assert_eq!(&frame[4..], &payload[..]);
        }
    }
}
