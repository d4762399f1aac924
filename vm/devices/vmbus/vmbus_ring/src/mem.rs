// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory shared with the host.
//!
//! Shared memory is modeled as an array of 32-bit atomics so that both the
//! ring control words (which need atomic access with specific orderings) and
//! arbitrary byte ranges can be accessed without `unsafe`.

use crate::PAGE_SIZE;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;

/// The size of the ring control region in 32-bit words.
pub const CONTROL_WORD_COUNT: usize = 32;

/// A run of guest pages, physically contiguous from the guest's point of
/// view, that the host may access concurrently.
///
/// Cloning produces another handle to the same memory.
#[derive(Clone)]
pub struct SharedPages {
    words: Arc<[AtomicU32]>,
    first_page: usize,
    page_count: usize,
    base_gpn: u64,
}

impl Debug for SharedPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPages")
            .field("gpn", &format_args!("{:#x}", self.gpn()))
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl SharedPages {
    /// Allocates `page_count` zeroed pages located at guest page number
    /// `base_gpn`.
    pub fn new(base_gpn: u64, page_count: usize) -> Self {
        let words = (0..page_count * WORDS_PER_PAGE)
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            words,
            first_page: 0,
            page_count,
            base_gpn,
        }
    }

    /// Returns a handle to `page_count` pages starting at `first_page`, or
    /// `None` if that is out of range.
    pub fn subrange(&self, first_page: usize, page_count: usize) -> Option<Self> {
        if first_page.checked_add(page_count)? > self.page_count {
            return None;
        }
        Some(Self {
            words: self.words.clone(),
            first_page: self.first_page + first_page,
            page_count,
            base_gpn: self.base_gpn,
        })
    }

    /// The number of pages.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The length in bytes.
    pub fn len(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    /// The guest page number of the first page.
    pub fn gpn(&self) -> u64 {
        self.base_gpn + self.first_page as u64
    }

    /// The guest page numbers of every page, in order.
    pub fn gpns(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.page_count as u64).map(|i| self.gpn() + i)
    }

    /// Returns `count` words starting at word `index`.
    ///
    /// Panics if the range is out of bounds.
    pub fn words(&self, index: usize, count: usize) -> &[AtomicU32] {
        assert!(index + count <= self.page_count * WORDS_PER_PAGE);
        let start = self.first_page * WORDS_PER_PAGE + index;
        &self.words[start..start + count]
    }

    fn word(&self, byte_offset: usize) -> &AtomicU32 {
        &self.words[self.first_page * WORDS_PER_PAGE + byte_offset / 4]
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "access {offset:#x}+{len:#x} out of range {:#x}",
            self.len()
        );
    }

    /// Copies bytes starting at `offset` into `data`.
    ///
    /// Panics if the range is out of bounds.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        self.check(offset, data.len());
        let mut done = 0;
        while done < data.len() {
            let addr = offset + done;
            let lane = addr % 4;
            let n = (4 - lane).min(data.len() - done);
            let word = self.word(addr).load(Ordering::Relaxed).to_le_bytes();
            data[done..done + n].copy_from_slice(&word[lane..lane + n]);
            done += n;
        }
    }

    /// Copies `data` into memory starting at `offset`.
    ///
    /// Panics if the range is out of bounds.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        let mut done = 0;
        while done < data.len() {
            let addr = offset + done;
            let lane = addr % 4;
            let n = (4 - lane).min(data.len() - done);
            let src = &data[done..done + n];
            let word = self.word(addr);
            if n == 4 {
                let mut bytes = [0; 4];
                bytes.copy_from_slice(src);
                word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                    let mut bytes = w.to_le_bytes();
                    bytes[lane..lane + n].copy_from_slice(src);
                    Some(u32::from_le_bytes(bytes))
                });
            }
            done += n;
        }
    }

    /// Sets `len` bytes starting at `offset` to `value`.
    pub fn fill_at(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        let chunk = [value; 64];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            self.write_at(offset + done, &chunk[..n]);
            done += n;
        }
    }
}

/// Splits the ring access `addr..addr + len` into at most two physical
/// ranges, the second of which starts at zero.
///
/// `addr` may be in `0..ring_len * 2`, representing the ring mapped twice
/// consecutively; `len` must not exceed `ring_len`.
pub fn split_wrapped(addr: usize, len: usize, ring_len: usize) -> (Range<usize>, Range<usize>) {
    debug_assert!(len <= ring_len);
    let addr = if addr >= ring_len { addr - ring_len } else { addr };
    let first = len.min(ring_len - addr);
    (addr..addr + first, 0..len - first)
}

/// Memory backing one ring buffer: a control region and a data region.
pub trait RingMem: Send + Sync {
    /// Returns the control words. At least [`CONTROL_WORD_COUNT`] long.
    fn control(&self) -> &[AtomicU32];

    /// Reads from the data region starting at `addr`, wrapping once at the
    /// end. Requires `addr < self.len() * 2` and `data.len() <= self.len()`.
    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// Writes to the data region starting at `addr`, wrapping once at the
    /// end, with the same requirements as [`RingMem::read_at`].
    fn write_at(&self, addr: usize, data: &[u8]);

    /// Like [`RingMem::read_at`], for 8-byte aligned offsets and lengths.
    fn read_aligned(&self, addr: usize, data: &mut [u8]) {
        debug_assert!(addr % 8 == 0 && data.len() % 8 == 0);
        self.read_at(addr, data)
    }

    /// Like [`RingMem::write_at`], for 8-byte aligned offsets and lengths.
    fn write_aligned(&self, addr: usize, data: &[u8]) {
        debug_assert!(addr % 8 == 0 && data.len() % 8 == 0);
        self.write_at(addr, data)
    }

    /// The length of the data region in bytes.
    fn len(&self) -> usize;
}

impl<T: RingMem> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU32] {
        (*self).control()
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }

    fn len(&self) -> usize {
        (*self).len()
    }
}

/// A ring laid out in [`SharedPages`]: one control page followed by the data
/// pages.
#[derive(Debug, Clone)]
pub struct PagedRingMem {
    control: SharedPages,
    data: SharedPages,
}

impl PagedRingMem {
    /// Wraps `pages`, which must hold a control page and at least one data
    /// page.
    pub fn new(pages: SharedPages) -> Option<Self> {
        if pages.page_count() < 2 {
            return None;
        }
        Some(Self {
            control: pages.subrange(0, 1)?,
            data: pages.subrange(1, pages.page_count() - 1)?,
        })
    }
}

impl RingMem for PagedRingMem {
    fn control(&self) -> &[AtomicU32] {
        self.control.words(0, CONTROL_WORD_COUNT)
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        let (a, b) = split_wrapped(addr, data.len(), self.len());
        let (first, second) = data.split_at_mut(a.len());
        self.data.read_at(a.start, first);
        self.data.read_at(b.start, second);
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        let (a, b) = split_wrapped(addr, data.len(), self.len());
        let (first, second) = data.split_at(a.len());
        self.data.write_at(a.start, first);
        self.data.write_at(b.start, second);
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn unaligned_access() {
        let pages = SharedPages::new(0x100, 1);
        pages.write_at(3, &[1, 2, 3, 4, 5, 6]);
        let mut buf = [0; 8];
        pages.read_at(2, &mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 0]);
        pages.fill_at(4, 2, 0xff);
        pages.read_at(2, &mut buf);
        assert_eq!(buf, [0, 1, 0xff, 0xff, 4, 5, 6, 0]);
    }

    #[test]
    fn subrange_shares_memory() {
        let pages = SharedPages::new(0x100, 4);
        let sub = pages.subrange(2, 2).unwrap();
        assert_eq!(sub.gpn(), 0x102);
        assert_eq!(sub.gpns().collect::<Vec<_>>(), [0x102, 0x103]);
        sub.write_at(0, b"abc");
        let mut buf = [0; 3];
        pages.read_at(2 * PAGE_SIZE, &mut buf);
        assert_eq!(&buf, b"abc");
        assert!(pages.subrange(3, 2).is_none());
    }

    #[test]
    fn wrapped_split() {
        assert_eq!(split_wrapped(10, 5, 16), (10..15, 0..0));
        assert_eq!(split_wrapped(12, 8, 16), (12..16, 0..4));
        assert_eq!(split_wrapped(20, 4, 16), (4..8, 0..0));
    }

    #[test]
    fn ring_wraps() {
        let mem = PagedRingMem::new(SharedPages::new(0, 2)).unwrap();
        let data: Vec<u8> = (0..32).collect();
        mem.write_at(PAGE_SIZE - 16, &data);
        let mut buf = [0; 32];
        mem.read_at(PAGE_SIZE - 16, &mut buf);
        assert_eq!(&buf[..], &data[..]);
        let mut head = [0; 16];
        mem.read_at(0, &mut head);
        assert_eq!(&head[..], &data[16..]);
    }
}
