// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPA ranges: byte ranges of guest memory described by a page list.
//!
//! On the wire, a range is a [`GpaRange`] header (byte count and the offset
//! into the first page) followed by one page number per page the range
//! touches. GPADLs and GPA direct packets both use this encoding.

use crate::PAGE_SIZE;
use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The largest number of pages a single range may reference.
pub const MAX_PAGES_PER_RANGE: usize = 0xfffff;

/// A buffer of encoded ranges.
pub type GpnList = SmallVec<[u64; 64]>;

/// The wire header of a GPA range.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    /// The length of the range in bytes.
    pub len: u32,
    /// The offset of the range within the first page.
    pub offset: u32,
}

impl GpaRange {
    fn to_u64(self) -> u64 {
        u64::from(self.len) | u64::from(self.offset) << 32
    }

    fn from_u64(v: u64) -> Self {
        Self {
            len: v as u32,
            offset: (v >> 32) as u32,
        }
    }
}

/// Returns the number of pages touched by `len` bytes starting `offset`
/// bytes into the first page.
pub fn page_span(offset: usize, len: usize) -> usize {
    (offset % PAGE_SIZE + len).div_ceil(PAGE_SIZE)
}

/// A byte range over a list of guest pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns a range of `len` bytes starting `offset` bytes into the first
    /// of `gpns`, or `None` if the page list does not exactly cover the range
    /// or is too long for one range.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        if offset >= PAGE_SIZE
            || len == 0
            || len > u32::MAX as usize
            || gpns.len() != page_span(offset, len)
            || gpns.len() > MAX_PAGES_PER_RANGE
        {
            return None;
        }
        Some(Self { offset, len, gpns })
    }

    /// The offset into the first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The page numbers.
    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }

    /// The size of this range in wire format.
    pub fn encoded_len(&self) -> usize {
        size_of::<GpaRange>() + size_of_val(self.gpns)
    }
}

/// An error in an encoded range list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before the declared ranges did.
    #[error("range list truncated")]
    Truncated,
    /// A range has a zero byte count.
    #[error("empty byte count")]
    EmptyByteCount,
    /// A range's offset is not within its first page.
    #[error("range offset {0:#x} outside first page")]
    InvalidOffset(u32),
    /// A range references more pages than allowed.
    #[error("range spans too many pages")]
    TooManyPages,
}

fn parse(buf: &[u64]) -> Result<(PagedRange<'_>, &[u64]), Error> {
    let (header, rest) = buf.split_first().ok_or(Error::Truncated)?;
    let header = GpaRange::from_u64(*header);
    if header.len == 0 {
        return Err(Error::EmptyByteCount);
    }
    if header.offset as usize >= PAGE_SIZE {
        return Err(Error::InvalidOffset(header.offset));
    }
    let pages = page_span(header.offset as usize, header.len as usize);
    if pages > MAX_PAGES_PER_RANGE {
        return Err(Error::TooManyPages);
    }
    if rest.len() < pages {
        return Err(Error::Truncated);
    }
    let (gpns, rest) = rest.split_at(pages);
    Ok((
        PagedRange {
            offset: header.offset as usize,
            len: header.len as usize,
            gpns,
        },
        rest,
    ))
}

/// A validated list of encoded ranges.
#[derive(Debug, Clone, Default)]
pub struct MultiPagedRangeBuf<T: AsRef<[u64]>> {
    buf: T,
    count: usize,
}

impl<T: AsRef<[u64]>> MultiPagedRangeBuf<T> {
    /// Validates that `buf` holds `count` ranges, ignoring any trailing
    /// values.
    pub fn new(count: usize, buf: T) -> Result<Self, Error> {
        let mut rest = buf.as_ref();
        for _ in 0..count {
            rest = parse(rest)?.1;
        }
        Ok(Self { buf, count })
    }

    /// Iterates over the ranges.
    pub fn iter(&self) -> MultiPagedRangeIter<'_> {
        MultiPagedRangeIter {
            buf: self.buf.as_ref(),
            count: self.count,
        }
    }

    /// The number of ranges.
    pub fn range_count(&self) -> usize {
        self.count
    }

    /// The encoded ranges.
    pub fn range_buffer(&self) -> &[u64] {
        self.buf.as_ref()
    }
}

impl<'a> FromIterator<PagedRange<'a>> for MultiPagedRangeBuf<GpnList> {
    fn from_iter<I: IntoIterator<Item = PagedRange<'a>>>(iter: I) -> Self {
        let mut buf = GpnList::new();
        let mut count = 0;
        for range in iter {
            buf.push(
                GpaRange {
                    len: range.len() as u32,
                    offset: range.offset() as u32,
                }
                .to_u64(),
            );
            buf.extend_from_slice(range.gpns());
            count += 1;
        }
        // Each range was validated on construction.
        Self { buf, count }
    }
}

/// An iterator over the ranges of a [`MultiPagedRangeBuf`].
#[derive(Clone, Debug)]
pub struct MultiPagedRangeIter<'a> {
    buf: &'a [u64],
    count: usize,
}

impl<'a> Iterator for MultiPagedRangeIter<'a> {
    type Item = PagedRange<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        // Validated in `MultiPagedRangeBuf::new`.
        let (range, rest) = parse(self.buf).ok()?;
        self.buf = rest;
        self.count -= 1;
        Some(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn range_page_counts() {
        assert_eq!(page_span(0, 4096), 1);
        assert_eq!(page_span(0xff0, 0x20), 2);
        assert!(PagedRange::new(0xff0, 0x20, &[1]).is_none());
        assert!(PagedRange::new(0xff0, 0x20, &[1, 2]).is_some());
        assert!(PagedRange::new(0, 0, &[]).is_none());
        assert!(PagedRange::new(4096, 1, &[1]).is_none());
    }

    #[test]
    fn encode_and_validate() {
        let a = [10, 11];
        let b = [20];
        let ranges = [
            PagedRange::new(0x800, 0x1000, &a).unwrap(),
            PagedRange::new(0, 100, &b).unwrap(),
        ];
        let buf: MultiPagedRangeBuf<GpnList> = ranges.iter().copied().collect();
        assert_eq!(buf.range_count(), 2);
        assert_eq!(buf.range_buffer().len(), 5);
        assert_eq!(buf.iter().map(|r| r.len()).sum::<usize>(), 0x1000 + 100);

        let parsed = MultiPagedRangeBuf::new(2, buf.range_buffer()).unwrap();
        assert_eq!(parsed.iter().collect::<Vec<_>>(), ranges);

        assert_eq!(
            MultiPagedRangeBuf::new(3, buf.range_buffer()).unwrap_err(),
            Error::Truncated
        );
        assert_eq!(
            MultiPagedRangeBuf::new(1, &[0u64][..]).unwrap_err(),
            Error::EmptyByteCount
        );
    }
}
