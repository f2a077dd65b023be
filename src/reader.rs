// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffered big-endian reading over a seekable stream.

use crate::{Error, Result, ToU64, TryVec};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};

const BUFFER_SIZE: usize = 4096;

/// Indicate the current position of a reader in the underlying stream.
pub(crate) trait Offset {
    fn offset(&self) -> u64;
}

/// A buffering reader over a seekable stream.
///
/// Repositioning within the current fill buffer is free; seeks outside it
/// drop the buffer and the next read refills from the new position.
pub struct BinaryReader<R> {
    inner: R,
    buffer: std::boxed::Box<[u8]>,
    /// Stream offset of `buffer[0]`.
    buffer_start: u64,
    buffer_len: usize,
    position: u64,
    length: u64,
}

impl<R: Read + Seek> BinaryReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let length = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            buffer: vec![0; BUFFER_SIZE].into_boxed_slice(),
            buffer_start: 0,
            buffer_len: 0,
            position: 0,
            length,
        })
    }

    /// Total length of the stream in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(Error::InvalidData("position is beyond the end of the stream"));
        }
        self.position = position;
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// A read-only view clamped to `[start, start + length)`.
    pub fn segment(&mut self, start: u64, length: u64) -> Result<Segment<'_, R>> {
        let end = start.checked_add(length).ok_or(Error::InvalidData("segment end overflow"))?;
        if end > self.length {
            return Err(Error::InvalidData("segment exceeds the stream length"));
        }
        self.set_position(start)?;
        Ok(Segment { reader: self, start, end })
    }

    /// The whole stream as a segment.
    pub fn full(&mut self) -> Segment<'_, R> {
        let end = self.length;
        self.position = 0;
        Segment { reader: self, start: 0, end }
    }

    fn buffered(&self) -> &[u8] {
        let end = self.buffer_start + self.buffer_len.to_u64();
        if self.position >= self.buffer_start && self.position < end {
            let from = (self.position - self.buffer_start) as usize;
            &self.buffer[from..self.buffer_len]
        } else {
            &[]
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(self.position))?;
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.inner.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        self.buffer_start = self.position;
        self.buffer_len = filled;
        Ok(())
    }
}

impl<R: Read + Seek> Read for BinaryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        if self.buffered().is_empty() {
            if buf.len() >= self.buffer.len() {
                // Large reads bypass the buffer.
                self.inner.seek(SeekFrom::Start(self.position))?;
                let n = self.inner.read(buf)?;
                self.position += n.to_u64();
                return Ok(n);
            }
            self.fill()?;
        }
        let available = self.buffered();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n.to_u64();
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for BinaryReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.length.checked_add_signed(n),
            SeekFrom::Current(n) => self.position.checked_add_signed(n),
        };
        let target = target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid seek"))?;
        self.set_position(target)?;
        Ok(target)
    }
}

impl<R> Offset for BinaryReader<R> {
    fn offset(&self) -> u64 {
        self.position
    }
}

/// A bounded view over a [`BinaryReader`].
///
/// Positions are absolute stream offsets. Reads are clipped at the segment
/// end and seeks outside `[start, end]` fail. The view shares the parent's
/// cursor, so the parent must not be used while a segment is alive.
pub struct Segment<'a, R> {
    reader: &'a mut BinaryReader<R>,
    start: u64,
    end: u64,
}

impl<R> Segment<'_, R> {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn position(&self) -> u64 {
        self.reader.position
    }

    pub fn bytes_left(&self) -> u64 {
        self.end.saturating_sub(self.reader.position)
    }
}

impl<R: Read + Seek> Segment<'_, R> {
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        if position < self.start || position > self.end {
            return Err(Error::InvalidData("position is outside the segment"));
        }
        self.reader.set_position(position)
    }

    pub fn skip(&mut self, bytes: u64) -> Result<()> {
        let target = self
            .position()
            .checked_add(bytes)
            .ok_or(Error::InvalidData("skip overflow"))?;
        self.set_position(target)
    }

    pub fn skip_to_end(&mut self) -> Result<()> {
        let end = self.end;
        self.set_position(end)
    }

    /// A nested view, which must lie within this one.
    pub fn segment(&mut self, start: u64, length: u64) -> Result<Segment<'_, R>> {
        let end = start.checked_add(length).ok_or(Error::InvalidData("segment end overflow"))?;
        if start < self.start || end > self.end {
            return Err(Error::InvalidData("segment exceeds its parent's bounds"));
        }
        self.reader.set_position(start)?;
        Ok(Segment { reader: &mut *self.reader, start, end })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        ReadBytesExt::read_u8(self).map_err(From::from)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        ReadBytesExt::read_u16::<BigEndian>(self).map_err(From::from)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        ReadBytesExt::read_u32::<BigEndian>(self).map_err(From::from)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        ReadBytesExt::read_u64::<BigEndian>(self).map_err(From::from)
    }

    pub fn read_fourcc(&mut self) -> Result<crate::FourCC> {
        Ok(self.read_u32()?.into())
    }

    /// Reads exactly `count` bytes.
    pub fn read_bytes(&mut self, count: u64) -> Result<TryVec<u8>> {
        if count > self.bytes_left() {
            return Err(Error::UnexpectedEOF);
        }
        let count: usize = count.try_into()?;
        let mut buf = std::vec::Vec::new();
        buf.try_reserve_exact(count)?;
        buf.resize(count, 0);
        self.read_exact(&mut buf)?;
        Ok(buf.into())
    }

    /// Reads everything up to the segment end.
    pub fn read_to_end(&mut self) -> Result<TryVec<u8>> {
        let left = self.bytes_left();
        self.read_bytes(left)
    }

    /// Reads a UTF-8 string terminated by a NUL byte or by `end_offset`,
    /// whichever comes first. The terminator is consumed.
    pub fn read_string(&mut self, end_offset: u64) -> Result<std::string::String> {
        let end = end_offset.min(self.end);
        let mut bytes = std::vec::Vec::new();
        while self.position() < end {
            match self.read_u8()? {
                0 => break,
                b => {
                    bytes.try_reserve(1)?;
                    bytes.push(b);
                },
            }
        }
        Ok(std::string::String::from_utf8(bytes)?)
    }
}

impl<R: Read + Seek> Read for Segment<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.bytes_left();
        let limit = buf.len().min(left.try_into().unwrap_or(usize::MAX));
        self.reader.read(&mut buf[..limit])
    }
}

impl<R> Offset for Segment<'_, R> {
    fn offset(&self) -> u64 {
        self.reader.position
    }
}

/// Big-endian reads from an in-memory slice, for payloads parsed after the box walk.
pub(crate) fn be_u16_at(data: &[u8], pos: usize) -> Result<u16> {
    let bytes = data.get(pos..pos + 2).ok_or(Error::UnexpectedEOF)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn be_u32_at(data: &[u8], pos: usize) -> Result<u32> {
    let bytes = data.get(pos..pos + 4).ok_or(Error::UnexpectedEOF)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
