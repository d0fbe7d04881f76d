//! Bounded pool of staging pages.

use fc_block::Page;
use fc_error::{FcError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Caps how many staging buffers may be live at once. Exhaustion is an
/// immediate `NoMemory`, never a wait.
#[derive(Debug)]
pub struct PagePool {
    capacity: usize,
    live: AtomicUsize,
}

impl PagePool {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            live: AtomicUsize::new(0),
        })
    }

    /// Zeroed buffer of `len` bytes, returned to the pool on drop.
    pub fn try_page(self: &Arc<Self>, len: usize) -> Result<PooledPage> {
        let prev = self.live.fetch_add(1, Ordering::AcqRel);
        if prev >= self.capacity {
            self.live.fetch_sub(1, Ordering::AcqRel);
            debug!(target: "fc::pool", capacity = self.capacity, "staging_pool_exhausted");
            return Err(FcError::NoMemory(format!(
                "staging pool exhausted ({} pages)",
                self.capacity
            )));
        }
        Ok(PooledPage {
            page: Page::zeroed(len),
            pool: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A staging page on loan from a [`PagePool`].
#[derive(Debug)]
pub struct PooledPage {
    page: Page,
    pool: Arc<PagePool>,
}

impl PooledPage {
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::AcqRel);
    }
}
