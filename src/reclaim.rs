//! Deferred reclamation of unlinked pool objects.
//!
//! Once a node, leaf or slice buffer is unlinked from the tree, optimistic
//! readers may still be looking at it. The range is only returned to the pool
//! after every thread that was pinned at the time of the unlink has moved on.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_epoch::Guard;

use crate::pool::PmPool;

/// Hands unlinked pool ranges to the epoch collector.
pub struct Reclaimer {
    pool: Arc<PmPool>,
    retired: AtomicU64,
}

impl Reclaimer {
    /// Create a reclaimer returning ranges to `pool`.
    pub fn new(pool: Arc<PmPool>) -> Self {
        Reclaimer {
            pool,
            retired: AtomicU64::new(0),
        }
    }

    /// Schedule `size` bytes at `offset` to be freed once no thread pinned
    /// before this call can still observe them.
    pub fn retire(&self, guard: &Guard, offset: u64, size: usize) {
        let pool = Arc::clone(&self.pool);
        self.retired.fetch_add(1, Ordering::Relaxed);
        guard.defer(move || pool.free(offset, size));
    }

    /// Free a range that was never published. No reader can have seen it, so
    /// it goes back to the pool right away.
    pub fn discard(&self, offset: u64, size: usize) {
        self.pool.free(offset, size);
    }

    /// Number of ranges retired since the tree was opened.
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeafLayout;

    #[test]
    fn retired_range_is_freed_after_unpin() {
        let pool = Arc::new(PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap());
        let reclaimer = Reclaimer::new(Arc::clone(&pool));
        let offset = pool.allocate(128).unwrap();

        {
            let guard = crossbeam_epoch::pin();
            reclaimer.retire(&guard, offset, 128);
            guard.flush();
        }

        // Advancing the global epoch needs a few pins from any thread
        for _ in 0..10_000 {
            crossbeam_epoch::pin().flush();
            if pool.free_bytes() == 128 {
                break;
            }
            std::thread::yield_now();
        }

        assert_eq!(reclaimer.retired(), 1);
        assert_eq!(pool.free_bytes(), 128);
    }

    #[test]
    fn discarded_range_is_freed_immediately() {
        let pool = Arc::new(PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap());
        let reclaimer = Reclaimer::new(Arc::clone(&pool));
        let offset = pool.allocate(64).unwrap();

        reclaimer.discard(offset, 64);
        assert_eq!(pool.free_bytes(), 64);
    }
}
