// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{BigEndian, ByteOrder};
use std::convert::Infallible;
use std::io::{self, Seek, SeekFrom, Write};

pub(crate) const BASIC_BOX_SIZE: usize = 8;
pub(crate) const FULL_BOX_SIZE: usize = BASIC_BOX_SIZE + 4;

/// A box that knows its encoded size before it is written.
pub(crate) trait MpegBox {
    /// Total encoded length, header included.
    fn len(&self) -> usize;
    fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error>;
}

pub(crate) trait WriterBackend {
    type Error;
    fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), Self::Error>;
    /// Absolute position of the next byte written.
    fn position(&self) -> u64;
}

/// `io::Write` generates bloated code (with backtrace for every byte written),
/// so headers are assembled in memory infallibly.
impl WriterBackend for std::vec::Vec<u8> {
    type Error = Infallible;
    #[inline(always)]
    fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), Infallible> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.len() as u64
    }
}

impl<W: Write> WriterBackend for BigEndianWriter<W> {
    type Error = io::Error;
    #[inline(always)]
    fn extend_from_slice(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_bytes(data)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Writes one box at a time, checking that each box emits exactly the
/// number of bytes it declared.
pub(crate) struct Writer<'p, 'w, B> {
    parent: Option<&'p mut usize>,
    left: Option<usize>,
    out: &'w mut B,
}

impl<'w, B> Writer<'static, 'w, B> {
    #[inline]
    pub fn new(out: &'w mut B) -> Self {
        Self {
            parent: None,
            left: None,
            out,
        }
    }
}

impl<B: WriterBackend> Writer<'_, '_, B> {
    #[inline]
    pub fn new_box(&mut self, len: usize) -> Writer<'_, '_, B> {
        Writer {
            parent: self.left.as_mut(),
            left: Some(len),
            out: self.out,
        }
    }

    #[inline(always)]
    pub fn full_box(&mut self, typ: [u8; 4], version: u8, flags: u32) -> Result<(), B::Error> {
        self.basic_box(typ)?;
        let flags = flags.to_be_bytes();
        self.push(&[version, flags[1], flags[2], flags[3]])
    }

    /// Box header. Sizes above 4GiB use the 64-bit large-size form.
    #[inline]
    pub fn basic_box(&mut self, typ: [u8; 4]) -> Result<(), B::Error> {
        let len = self.left.unwrap_or(0);
        if let Some(parent) = &mut self.parent {
            debug_assert!(**parent >= len, "child box larger than its parent");
            **parent = parent.saturating_sub(len);
        }
        match u32::try_from(len) {
            Ok(len) => {
                self.u32(len)?;
                self.push(&typ)
            },
            Err(_) => {
                self.u32(1)?;
                self.push(&typ)?;
                self.u64(len as u64)
            },
        }
    }

    #[inline(always)]
    pub fn push(&mut self, data: &[u8]) -> Result<(), B::Error> {
        if let Some(left) = self.left.as_mut() {
            debug_assert!(*left >= data.len(), "box overflows its declared size");
            *left = left.saturating_sub(data.len());
        }
        self.out.extend_from_slice(data)
    }

    #[inline(always)]
    pub fn u8(&mut self, val: u8) -> Result<(), B::Error> {
        self.push(std::slice::from_ref(&val))
    }

    #[inline(always)]
    pub fn u16(&mut self, val: u16) -> Result<(), B::Error> {
        self.push(&val.to_be_bytes())
    }

    #[inline(always)]
    pub fn u32(&mut self, val: u32) -> Result<(), B::Error> {
        self.push(&val.to_be_bytes())
    }

    #[inline(always)]
    pub fn u64(&mut self, val: u64) -> Result<(), B::Error> {
        self.push(&val.to_be_bytes())
    }

    /// Unsigned integer in `width` bytes (0, 2, 4 or 8).
    pub fn uint(&mut self, width: u8, val: u64) -> Result<(), B::Error> {
        match width {
            0 => Ok(()),
            2 => self.u16(val as u16),
            4 => self.u32(val as u32),
            _ => self.u64(val),
        }
    }

    /// UTF-8 string followed by a NUL terminator.
    pub fn str0(&mut self, s: &str) -> Result<(), B::Error> {
        self.push(s.as_bytes())?;
        self.u8(0)
    }

    pub fn position(&self) -> u64 {
        self.out.position()
    }
}

#[cfg(debug_assertions)]
impl<B> Drop for Writer<'_, '_, B> {
    fn drop(&mut self) {
        if let Some(unwritten_bytes) = self.left {
            if !std::thread::panicking() {
                assert_eq!(0, unwritten_bytes, "box is shorter than its declared size");
            }
        }
    }
}

/// Big-endian writes to a byte sink.
///
/// Integers are staged in a small stack buffer, so no write allocates.
/// `W` may be an owned sink or a `&mut` borrow of one; `into_inner` returns it.
pub struct BigEndianWriter<W> {
    inner: W,
    scratch: [u8; 8],
    position: u64,
}

impl<W: Write> BigEndianWriter<W> {
    /// Wraps a sink whose next byte is at offset 0.
    pub fn new(inner: W) -> Self {
        Self::at_position(inner, 0)
    }

    pub fn at_position(inner: W, position: u64) -> Self {
        Self { inner, scratch: [0; 8], position }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_u8(&mut self, val: u8) -> io::Result<()> {
        self.scratch[0] = val;
        self.flush_scratch(1)
    }

    pub fn write_u16(&mut self, val: u16) -> io::Result<()> {
        BigEndian::write_u16(&mut self.scratch, val);
        self.flush_scratch(2)
    }

    pub fn write_u32(&mut self, val: u32) -> io::Result<()> {
        BigEndian::write_u32(&mut self.scratch, val);
        self.flush_scratch(4)
    }

    pub fn write_u64(&mut self, val: u64) -> io::Result<()> {
        BigEndian::write_u64(&mut self.scratch, val);
        self.flush_scratch(8)
    }

    pub fn write_fourcc(&mut self, fourcc: crate::FourCC) -> io::Result<()> {
        self.write_bytes(&fourcc.value)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn flush_scratch(&mut self, len: usize) -> io::Result<()> {
        let scratch = self.scratch;
        self.write_bytes(&scratch[..len])
    }
}

impl<W: Write + Seek> BigEndianWriter<W> {
    /// Wraps a seekable sink, continuing from its current position.
    pub fn from_seekable(mut inner: W) -> io::Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self::at_position(inner, position))
    }

    pub fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.position = self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Pair(u8, u16);

    impl MpegBox for Pair {
        fn len(&self) -> usize {
            FULL_BOX_SIZE + 3
        }

        fn write<B: WriterBackend>(&self, w: &mut Writer<'_, '_, B>) -> Result<(), B::Error> {
            let mut b = w.new_box(self.len());
            b.full_box(*b"test", 1, 0x00_0203)?;
            b.u8(self.0)?;
            b.u16(self.1)
        }
    }

    #[test]
    fn box_header_matches_declared_len() {
        let mut out = std::vec::Vec::new();
        let pair = Pair(7, 0x0102);
        pair.write(&mut Writer::new(&mut out)).unwrap();
        assert_eq!(out.len(), pair.len());
        assert_eq!(out, [0, 0, 0, 15, b't', b'e', b's', b't', 1, 0, 2, 3, 7, 1, 2]);
    }

    #[test]
    fn huge_box_uses_large_size() {
        let mut out = std::vec::Vec::new();
        let mut w = Writer::new(&mut out);
        let len = u32::MAX as usize + 10;
        let mut b = w.new_box(len);
        b.basic_box(*b"mdat").unwrap();
        assert_eq!(b.left, Some(len - 16));
        b.left = Some(0);
        drop(b);
        drop(w);
        assert_eq!(&out[..8], &[0, 0, 0, 1, b'm', b'd', b'a', b't']);
        assert_eq!(&out[8..], &(len as u64).to_be_bytes());
    }

    #[test]
    fn stream_writer_patches_in_place() {
        let mut sink = Cursor::new(std::vec::Vec::new());
        let mut w = BigEndianWriter::from_seekable(&mut sink).unwrap();
        w.write_u32(0).unwrap();
        w.write_u16(0xabcd).unwrap();
        w.write_u64(1).unwrap();
        let end = w.position();
        w.seek_to(0).unwrap();
        w.write_u32(0xdead_beef).unwrap();
        w.seek_to(end).unwrap();
        w.write_u8(9).unwrap();
        assert_eq!(w.position(), 15);
        assert_eq!(sink.into_inner(), [0xde, 0xad, 0xbe, 0xef, 0xab, 0xcd, 0, 0, 0, 0, 0, 0, 0, 1, 9]);
    }
}
