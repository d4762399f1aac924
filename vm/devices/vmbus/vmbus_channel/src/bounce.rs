// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-visible bounce pages for external buffers on isolated VMs.
//!
//! Private guest memory cannot be referenced by GPA direct packets, so the
//! data is staged in pages that have been shared with the host. Pages are
//! carved out of blocks of at least [`BOUNCE_BLOCK_PAGES`] pages and reused
//! across transactions.

use crate::ExternalBuffer;
use std::sync::Arc;
use vmbus_client::MemoryAllocator;
use vmbus_client::MemoryError;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::SharedPages;
use vmbus_ring::gparange::page_span;

/// The minimum number of pages shared with the host at once.
pub const BOUNCE_BLOCK_PAGES: usize = 32;

pub(crate) struct BouncePool {
    memory: Arc<dyn MemoryAllocator>,
    blocks: Vec<SharedPages>,
    free: Vec<SharedPages>,
}

impl BouncePool {
    pub fn new(memory: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            memory,
            blocks: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Takes `count` zeroed pages from the pool, growing it if necessary.
    fn acquire(&mut self, count: usize) -> Result<Vec<SharedPages>, MemoryError> {
        if self.free.len() < count {
            let block_pages = (count - self.free.len()).max(BOUNCE_BLOCK_PAGES);
            let block = self.memory.allocate_pages(block_pages)?;
            self.memory.set_host_visibility(&block, true)?;
            tracing::debug!(gpn = block.gpn(), block_pages, "allocated bounce block");
            self.free
                .extend((0..block_pages).rev().filter_map(|i| block.subrange(i, 1)));
            self.blocks.push(block);
        }
        let pages = self.free.split_off(self.free.len() - count);
        for page in &pages {
            page.fill_at(0, PAGE_SIZE, 0);
        }
        Ok(pages)
    }

    /// Stages `buffer` in bounce pages, copying its contents out unless
    /// `copy_out` is false.
    pub fn bounce(
        &mut self,
        buffer: &ExternalBuffer,
        copy_out: bool,
    ) -> Result<BounceBuffer, MemoryError> {
        let pages = self.acquire(page_span(buffer.offset, buffer.len))?;
        let bounce = BounceBuffer {
            original: buffer.clone(),
            pages,
        };
        if copy_out {
            bounce.copy(true);
        }
        Ok(bounce)
    }

    /// Returns a bounce buffer's pages to the pool.
    pub fn release(&mut self, bounce: BounceBuffer) {
        self.free.extend(bounce.pages);
    }

    /// The page number at which the host sees `page`.
    pub fn visible_gpn(&self, page: &SharedPages) -> u64 {
        page.gpn() + self.memory.shared_gpa_boundary() / PAGE_SIZE as u64
    }

    pub fn free_pages(&self) -> usize {
        self.free.len()
    }
}

impl Drop for BouncePool {
    fn drop(&mut self) {
        for block in &self.blocks {
            if let Err(err) = self.memory.set_host_visibility(block, false) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    gpn = block.gpn(),
                    "failed to revoke bounce block visibility"
                );
            }
        }
    }
}

/// An external buffer staged in bounce pages. The data starts at the same
/// offset into the first page as in the original buffer.
pub(crate) struct BounceBuffer {
    original: ExternalBuffer,
    pages: Vec<SharedPages>,
}

impl BounceBuffer {
    pub fn pages(&self) -> &[SharedPages] {
        &self.pages
    }

    /// Copies between the original buffer and the bounce pages.
    pub fn copy(&self, to_bounce: bool) {
        let buffer = &self.original;
        let mut chunk = [0; PAGE_SIZE];
        let mut page_offset = buffer.offset % PAGE_SIZE;
        let mut done = 0;
        for page in &self.pages {
            if done == buffer.len {
                break;
            }
            let n = (PAGE_SIZE - page_offset).min(buffer.len - done);
            let chunk = &mut chunk[..n];
            if to_bounce {
                buffer.pages.read_at(buffer.offset + done, chunk);
                page.write_at(page_offset, chunk);
            } else {
                page.read_at(page_offset, chunk);
                buffer.pages.write_at(buffer.offset + done, chunk);
            }
            done += n;
            page_offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;
    use vmbus_client::testing::HostConfig;
    use vmbus_client::testing::SimulatedHost;

    fn pool() -> (Arc<SimulatedHost>, BouncePool) {
        let host = Arc::new(SimulatedHost::new(HostConfig {
            isolated: true,
            ..Default::default()
        }));
        let pool = BouncePool::new(host.clone());
        (host, pool)
    }

    #[test]
    fn blocks_are_shared_and_reused() {
        let (host, mut pool) = pool();
        let buffer = ExternalBuffer {
            pages: host.allocate_pages(1).unwrap(),
            offset: 0,
            len: PAGE_SIZE,
        };
        let bounce = pool.bounce(&buffer, false).unwrap();
        assert_eq!(bounce.pages().len(), 1);
        assert!(host.is_visible(bounce.pages()[0].gpn()));
        assert_eq!(pool.free_pages(), BOUNCE_BLOCK_PAGES - 1);
        pool.release(bounce);
        assert_eq!(pool.free_pages(), BOUNCE_BLOCK_PAGES);

        let gpn = pool.blocks[0].gpn();
        drop(pool);
        assert!(!host.is_visible(gpn));
    }

    #[test]
    fn large_buffers_get_large_blocks() {
        let (host, mut pool) = pool();
        let buffer = ExternalBuffer {
            pages: host.allocate_pages(40).unwrap(),
            offset: 10,
            len: 40 * PAGE_SIZE - 10,
        };
        let bounce = pool.bounce(&buffer, false).unwrap();
        assert_eq!(bounce.pages().len(), 40);
        assert_eq!(pool.free_pages(), 0);
    }

    #[test]
    fn copy_keeps_page_offset() {
        let (host, mut pool) = pool();
        let pages = host.allocate_pages(2).unwrap();
        let data: Vec<u8> = (0..5000).map(|i| i as u8).collect();
        pages.write_at(100, &data);
        let buffer = ExternalBuffer {
            pages: pages.clone(),
            offset: 100,
            len: data.len(),
        };

        let bounce = pool.bounce(&buffer, true).unwrap();
        let mut first = vec![0; PAGE_SIZE - 100];
        bounce.pages()[0].read_at(100, &mut first);
        assert_eq!(first, data[..PAGE_SIZE - 100]);

        bounce.pages()[1].fill_at(0, PAGE_SIZE, 0xaa);
        bounce.copy(false);
        let mut back = vec![0; data.len()];
        pages.read_at(100, &mut back);
        assert_eq!(back[..PAGE_SIZE - 100], data[..PAGE_SIZE - 100]);
        assert!(back[PAGE_SIZE - 100..].iter().all(|&b| b == 0xaa));
    }
}
