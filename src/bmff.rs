// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::boxes::{BoxType, FourCC};
use crate::reader::{Offset, Segment};
use crate::{Error, ParseOptions, ResourceTracker, Result, TryVec};
use log::debug;
use std::io::{Read, Seek};

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub name: BoxType,
    /// Size of the box in bytes, header included.
    pub size: u64,
    /// Offset to the start of the contained data (or header size).
    pub offset: u64,
    /// Stream position of the first header byte.
    pub start: u64,
    /// Uuid for extended type.
    #[allow(unused)]
    pub uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub const MIN_LARGE_SIZE: u64 = 16;

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn fourcc(&self) -> FourCC {
        self.name.into()
    }
}

/// Per-parse state threaded through the box readers.
pub(crate) struct ParseContext {
    pub options: ParseOptions,
    pub tracker: ResourceTracker,
}

impl ParseContext {
    pub fn new(config: &crate::DecodeConfig) -> Self {
        Self {
            options: config.parse_options(),
            tracker: ResourceTracker::new(config),
        }
    }
}

/// See ISO 14496-12:2015 § 4.2
pub(crate) struct BMFFBox<'a, R> {
    pub head: BoxHeader,
    pub content: Segment<'a, R>,
}

impl<'a, R: Read + Seek> BMFFBox<'a, R> {
    pub fn bytes_left(&self) -> u64 {
        self.content.bytes_left()
    }

    pub const fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    pub fn box_iter(&mut self) -> BoxIter<'_, 'a, R> {
        BoxIter::new(&mut self.content)
    }

    /// Reads the rest of the box, counting the bytes against the memory limit.
    pub fn read_into_try_vec(&mut self, tracker: &mut ResourceTracker) -> Result<TryVec<u8>> {
        tracker.reserve(self.bytes_left())?;
        self.content.read_to_end()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.content.read_u8()
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.content.read_u16()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.content.read_u32()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.content.read_u64()
    }

    pub fn read_fourcc(&mut self) -> Result<FourCC> {
        self.content.read_fourcc()
    }

    /// NUL- or box-end-terminated UTF-8 string.
    pub fn read_string(&mut self) -> Result<std::string::String> {
        let end = self.content.end();
        self.content.read_string(end)
    }
}

impl<R: Read + Seek> Read for BMFFBox<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<R> Offset for BMFFBox<'_, R> {
    fn offset(&self) -> u64 {
        self.content.offset()
    }
}

impl<R> Drop for BMFFBox<'_, R> {
    fn drop(&mut self) {
        let left = self.content.bytes_left();
        if left > 0 {
            debug!("Dropping {} bytes in '{}'", left, self.head.fourcc());
        }
    }
}

pub(crate) struct BoxIter<'s, 'a, R> {
    src: &'s mut Segment<'a, R>,
}

impl<'s, 'a, R: Read + Seek> BoxIter<'s, 'a, R> {
    pub fn new(src: &'s mut Segment<'a, R>) -> Self {
        BoxIter { src }
    }

    /// Reads the next child header and returns a view over exactly that box.
    ///
    /// Returns `None` once the parent is exhausted. A box whose declared end
    /// lies past the parent's end is rejected before any of it is read.
    pub fn next_box(&mut self) -> Result<Option<BMFFBox<'_, R>>> {
        let left = self.src.bytes_left();
        if left == 0 {
            return Ok(None);
        }
        if left < BoxHeader::MIN_SIZE {
            return Err(Error::InvalidData("truncated box header"));
        }
        let head = read_box_header(self.src)?;
        let content = self.src.segment(head.start + head.offset, head.size - head.offset)?;
        Ok(Some(BMFFBox { head, content }))
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular mp4 box
/// and its length. Used internally for dispatching to specific
/// parsers for the internal content, or to get the length to
/// skip unknown or uninteresting boxes.
///
/// A size of 0 means the box runs to the end of `src`.
///
/// See ISO 14496-12:2015 § 4.2
pub(crate) fn read_box_header<R: Read + Seek>(src: &mut Segment<'_, R>) -> Result<BoxHeader> {
    let start = src.position();
    let parent_end = src.end();
    let size32 = src.read_u32()?;
    let name = BoxType::from(src.read_u32()?);
    let size = match size32 {
        // valid only for the last box of its container. usually mdat.
        0 => parent_end - start,
        1 => {
            let size64 = src.read_u64()?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            u64::from(size32)
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let end = start.checked_add(size).ok_or(Error::InvalidData("box size overflow"))?;
    if end > parent_end {
        return Err(Error::InvalidData("box extends past the end of its parent"));
    }
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            src.read_exact(&mut buffer)?;
            offset += 16;
            Some(buffer)
        } else {
            return Err(Error::InvalidData("uuid box too small for its extended type"));
        }
    } else {
        None
    };
    if offset > size {
        return Err(Error::InvalidData("box size smaller than its header"));
    }
    Ok(BoxHeader { name, size, offset, start, uuid })
}

/// Parse the extra header fields for a full box.
pub(crate) fn read_fullbox_extra<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

// Parse the extra fields for a full box whose flag fields must be zero.
pub(crate) fn read_fullbox_version_no_flags<R: Read + Seek>(
    src: &mut BMFFBox<'_, R>,
    options: &ParseOptions,
) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

/// Skip over the entire contents of a box.
pub(crate) fn skip_box_content<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<()> {
    debug!("{:?} (skipped)", src.get_header());
    src.content.skip_to_end()
}

/// Skip over the remain data of a box.
pub(crate) fn skip_box_remain<R: Read + Seek>(src: &mut BMFFBox<'_, R>) -> Result<()> {
    let len = src.bytes_left();
    if len > 0 {
        debug!("remain {len} (skipped) in {:?}", src.get_header());
    }
    src.content.skip_to_end()
}

/// A fully parsed box must have consumed exactly its declared size.
#[cfg_attr(debug_assertions, track_caller)]
pub(crate) fn check_parser_state<R: Read + Seek>(src: &BMFFBox<'_, R>) -> Result<()> {
    let left = src.bytes_left();
    if left == 0 {
        Ok(())
    } else {
        debug!("{} unread bytes in {:?}", left, src.get_header());
        Err(Error::InvalidData("unread box content or bad parser sync"))
    }
}

/// Runs `f` over the first box in `data`, then checks it was consumed exactly.
#[cfg(test)]
pub(crate) fn parse_test_box<'d, T>(
    data: &'d [u8],
    config: &crate::DecodeConfig,
    f: impl FnOnce(&mut BMFFBox<'_, std::io::Cursor<&'d [u8]>>, &mut ParseContext) -> Result<T>,
) -> Result<T> {
    let mut r = crate::reader::BinaryReader::new(std::io::Cursor::new(data))?;
    let mut root = r.full();
    let mut iter = BoxIter::new(&mut root);
    let mut b = iter.next_box()?.ok_or(Error::UnexpectedEOF)?;
    let mut ctx = ParseContext::new(config);
    let out = f(&mut b, &mut ctx)?;
    check_parser_state(&b)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::BinaryReader;
    use std::io::Cursor;

    fn boxed(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(name);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn iterates_siblings_and_consumes_exact_sizes() {
        let mut data = boxed(b"free", &[1, 2, 3]);
        data.extend(boxed(b"skip", &[]));
        let mut r = BinaryReader::new(Cursor::new(&data[..])).unwrap();
        let mut root = r.full();
        let mut iter = BoxIter::new(&mut root);
        let mut b = iter.next_box().unwrap().unwrap();
        assert_eq!(b.head.name, BoxType::FreeBox);
        assert_eq!(b.head.size, 11);
        assert_eq!(b.bytes_left(), 3);
        assert!(check_parser_state(&b).is_err());
        skip_box_content(&mut b).unwrap();
        assert!(check_parser_state(&b).is_ok());
        drop(b);
        let b = iter.next_box().unwrap().unwrap();
        assert_eq!(b.head.name, BoxType::SkipBox);
        assert_eq!(b.head.start, 11);
        drop(b);
        assert!(iter.next_box().unwrap().is_none());
    }

    #[test]
    fn size_zero_runs_to_parent_end() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[9; 20]);
        let mut r = BinaryReader::new(Cursor::new(&data[..])).unwrap();
        let mut root = r.full();
        let mut iter = BoxIter::new(&mut root);
        let b = iter.next_box().unwrap().unwrap();
        assert_eq!(b.head.size, 28);
        assert_eq!(b.bytes_left(), 20);
    }

    #[test]
    fn large_size_header() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(b"free");
        data.extend_from_slice(&18u64.to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        let mut r = BinaryReader::new(Cursor::new(&data[..])).unwrap();
        let mut root = r.full();
        let mut iter = BoxIter::new(&mut root);
        let b = iter.next_box().unwrap().unwrap();
        assert_eq!(b.head.offset, 16);
        assert_eq!(b.bytes_left(), 2);
    }

    #[test]
    fn rejects_boxes_that_overrun_or_undersize() {
        for data in [
            boxed(b"free", &[0; 4])[..10].to_vec(),
            vec![0, 0, 0, 4, b'f', b'r', b'e', b'e'],
            vec![0, 0, 0, 1, b'f', b'r', b'e', b'e', 0, 0, 0, 0, 0, 0, 0, 8],
            vec![0, 0, 0, 9],
        ] {
            let mut r = BinaryReader::new(Cursor::new(&data[..])).unwrap();
            let mut root = r.full();
            let mut iter = BoxIter::new(&mut root);
            assert!(iter.next_box().is_err(), "{data:?}");
        }
    }

    #[test]
    fn nested_children_stay_inside_parent() {
        let inner = boxed(b"free", &[0; 8]);
        let mut outer = boxed(b"meta", &inner);
        // Claim the child is larger than the parent payload.
        outer[11] = 20;
        let mut r = BinaryReader::new(Cursor::new(&outer[..])).unwrap();
        let mut root = r.full();
        let mut iter = BoxIter::new(&mut root);
        let mut meta = iter.next_box().unwrap().unwrap();
        let mut children = meta.box_iter();
        assert!(children.next_box().is_err());
    }
}
