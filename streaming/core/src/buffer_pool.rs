// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::buffer::TupleBuffer;
use crate::context::Context;
use crate::error::{StreamError, StreamResult};
use crate::metrics::Metrics;

/// Allocates and recycles [`TupleBuffer`]s.
///
/// Pooled buffers have a fixed capacity and travel through a lock-free free
/// list; `acquire` parks the caller until one frees up. Unpooled buffers are
/// variable-size, accounted against a byte limit behind a mutex, and fail
/// with `ResourceExhausted` instead of blocking.
#[derive(Clone)]
pub struct BufferPool {
    core: Arc<PoolCore>,
}

pub(crate) struct PoolCore {
    free: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    // Parks acquirers when the free list is empty. The mutex guards nothing;
    // releasers lock it briefly so a notify cannot slip between an acquirer's
    // re-check and its wait.
    gate: Mutex<()>,
    available: Condvar,
    unpooled_outstanding: Mutex<usize>,
    unpooled_limit: usize,
    metrics: Arc<Metrics>,
}

impl BufferPool {
    pub fn new(context: &Context) -> Self {
        let parameters = &context.parameters;
        let free = ArrayQueue::new(parameters.pooled_buffers);
        for _ in 0..parameters.pooled_buffers {
            let pushed = free.push(vec![0u8; parameters.buffer_size_bytes].into_boxed_slice());
            debug_assert!(pushed.is_ok());
        }
        Self {
            core: Arc::new(PoolCore {
                free,
                buffer_size: parameters.buffer_size_bytes,
                gate: Mutex::new(()),
                available: Condvar::new(),
                unpooled_outstanding: Mutex::new(0),
                unpooled_limit: parameters.unpooled_bytes_limit,
                metrics: context.metrics.clone(),
            }),
        }
    }

    /// Fixed payload capacity of pooled buffers.
    pub fn buffer_size(&self) -> usize {
        self.core.buffer_size
    }

    /// Returns a pooled buffer, parking the calling thread until one is free.
    ///
    /// This is the only sanctioned suspension point inside pipeline stages.
    pub fn acquire(&self) -> TupleBuffer {
        if let Some(bytes) = self.core.free.pop() {
            return self.issue(bytes);
        }
        let mut guard = self.core.gate.lock();
        loop {
            if let Some(bytes) = self.core.free.pop() {
                drop(guard);
                return self.issue(bytes);
            }
            self.core.available.wait(&mut guard);
        }
    }

    /// Returns a pooled buffer if one is immediately available.
    pub fn try_acquire(&self) -> Option<TupleBuffer> {
        self.core.free.pop().map(|bytes| self.issue(bytes))
    }

    /// Allocates a variable-size buffer of at least `size` bytes.
    pub fn acquire_unpooled(&self, size: usize) -> StreamResult<TupleBuffer> {
        let mut outstanding = self.core.unpooled_outstanding.lock();
        if *outstanding + size > self.core.unpooled_limit {
            warn!(
                outstanding = *outstanding,
                requested = size,
                "unpooled allocation over limit"
            );
            return Err(StreamError::ResourceExhausted(format!(
                "unpooled allocation of {size} bytes exceeds limit"
            )));
        }
        *outstanding += size;
        drop(outstanding);
        self.core.metrics.unpooled_bytes.add(size as i64);
        let storage = BufferStorage {
            bytes: Some(vec![0u8; size].into_boxed_slice()),
            owner: StorageOwner::Unpooled {
                pool: Arc::downgrade(&self.core),
                size,
            },
        };
        Ok(TupleBuffer::new(storage))
    }

    /// Number of pooled buffers currently sitting in the free list.
    pub fn free_buffers(&self) -> usize {
        self.core.free.len()
    }

    fn issue(&self, bytes: Box<[u8]>) -> TupleBuffer {
        self.core.metrics.buffers_acquired.inc();
        TupleBuffer::new(BufferStorage {
            bytes: Some(bytes),
            owner: StorageOwner::Pooled(Arc::downgrade(&self.core)),
        })
    }
}

/// The byte storage behind a [`TupleBuffer`]. Dropping the storage recycles
/// pooled bytes into the owning pool's free list; that drop is the "last
/// release" of the buffer.
pub(crate) struct BufferStorage {
    bytes: Option<Box<[u8]>>,
    owner: StorageOwner,
}

enum StorageOwner {
    Pooled(Weak<PoolCore>),
    Unpooled { pool: Weak<PoolCore>, size: usize },
}

impl BufferStorage {
    pub(crate) fn len(&self) -> usize {
        self.bytes.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or(&mut [])
    }

    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self.owner, StorageOwner::Pooled(_))
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        let Some(bytes) = self.bytes.take() else {
            return;
        };
        match &self.owner {
            StorageOwner::Pooled(pool) => {
                if let Some(pool) = pool.upgrade() {
                    // The queue cannot be full: capacity equals the number of
                    // buffers ever issued.
                    let _ = pool.free.push(bytes);
                    pool.metrics.buffers_recycled.inc();
                    let _unused = pool.gate.lock();
                    drop(_unused);
                    pool.available.notify_one();
                }
            }
            StorageOwner::Unpooled { pool, size } => {
                if let Some(pool) = pool.upgrade() {
                    *pool.unpooled_outstanding.lock() -= size;
                    pool.metrics.unpooled_bytes.sub(*size as i64);
                }
            }
        }
    }
}

/// One entry of slice state: a key, its running aggregate, and an auxiliary
/// word (the count of an average, or the event time of a join record).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageEntry {
    pub key: u64,
    pub value: u64,
    pub aux: u64,
}

/// A fixed-capacity block of [`PageEntry`] slots drawn from a [`PagePool`].
///
/// Pages back all per-tuple operator state, so the steady state performs no
/// per-tuple allocations. Dropping a page returns its slots to the pool.
pub struct Page {
    slots: Option<Box<[PageEntry]>>,
    /// Number of occupied slots when used as an append-only page. Hash maps
    /// manage their own occupancy and leave this untouched.
    len: usize,
    pool: Weak<PagePoolCore>,
}

impl Page {
    pub fn capacity(&self) -> usize {
        self.slots.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Appends an entry, returning it to the caller when the page is full.
    pub fn push(&mut self, entry: PageEntry) -> Result<(), PageEntry> {
        if self.is_full() {
            return Err(entry);
        }
        let len = self.len;
        self.slots_mut()[len] = entry;
        self.len = len + 1;
        Ok(())
    }

    /// The occupied prefix of an append-only page.
    pub fn entries(&self) -> &[PageEntry] {
        &self.slots()[..self.len]
    }

    pub(crate) fn slots(&self) -> &[PageEntry] {
        self.slots.as_deref().unwrap_or(&[])
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [PageEntry] {
        self.slots.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let Some(mut slots) = self.slots.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            slots.fill(PageEntry::default());
            let _ = pool.free.push(slots);
            pool.in_circulation.fetch_sub(1, Ordering::Relaxed);
            pool.metrics.pages_in_use.dec();
        }
    }
}

/// Recycles fixed-capacity state pages. Exhaustion is reported to the caller,
/// which surfaces it as backpressure or a query failure depending on where it
/// happens.
#[derive(Clone)]
pub struct PagePool {
    core: Arc<PagePoolCore>,
}

struct PagePoolCore {
    free: ArrayQueue<Box<[PageEntry]>>,
    page_entries: usize,
    page_limit: usize,
    in_circulation: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl PagePool {
    pub fn new(context: &Context) -> Self {
        let parameters = &context.parameters;
        Self {
            core: Arc::new(PagePoolCore {
                free: ArrayQueue::new(parameters.page_limit),
                page_entries: parameters.page_entries,
                page_limit: parameters.page_limit,
                in_circulation: AtomicUsize::new(0),
                metrics: context.metrics.clone(),
            }),
        }
    }

    pub fn page_entries(&self) -> usize {
        self.core.page_entries
    }

    /// Pages that can still be handed out before the pool is exhausted.
    pub fn headroom(&self) -> usize {
        self.core
            .page_limit
            .saturating_sub(self.core.in_circulation.load(Ordering::Relaxed))
    }

    pub fn allocate(&self) -> StreamResult<Page> {
        let slots = match self.core.free.pop() {
            Some(slots) => slots,
            None => {
                let previous = self.core.in_circulation.load(Ordering::Relaxed);
                if previous >= self.core.page_limit {
                    return Err(StreamError::ResourceExhausted(
                        "page pool exhausted".to_string(),
                    ));
                }
                vec![PageEntry::default(); self.core.page_entries].into_boxed_slice()
            }
        };
        self.core.in_circulation.fetch_add(1, Ordering::Relaxed);
        self.core.metrics.pages_in_use.inc();
        Ok(Page {
            slots: Some(slots),
            len: 0,
            pool: Arc::downgrade(&self.core),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use streaming_config::Parameters;

    fn small_pool(buffers: usize) -> BufferPool {
        let context = Context::new_for_test(2).with_parameters(Parameters {
            pooled_buffers: buffers,
            buffer_size_bytes: 64,
            ..Default::default()
        });
        BufferPool::new(&context)
    }

    #[test]
    fn acquire_and_recycle() {
        let pool = small_pool(2);
        assert_eq!(pool.free_buffers(), 2);

        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(pool.free_buffers(), 0);
        assert!(pool.try_acquire().is_none());

        drop(first);
        assert_eq!(pool.free_buffers(), 1);
        drop(second);
        assert_eq!(pool.free_buffers(), 2);
    }

    #[test]
    fn acquire_parks_until_release() {
        let pool = small_pool(1);
        let held = pool.acquire();

        let contender = pool.clone();
        let waiter = std::thread::spawn(move || contender.acquire());
        // Give the waiter a moment to park.
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(held);

        let acquired = waiter.join().expect("waiter should not panic");
        assert_eq!(acquired.capacity(), 64);
    }

    #[test]
    fn unpooled_respects_limit() {
        let context = Context::new_for_test(2).with_parameters(Parameters {
            unpooled_bytes_limit: 1024,
            ..Default::default()
        });
        let pool = BufferPool::new(&context);

        let big = pool.acquire_unpooled(1000).expect("within limit");
        assert!(!big.is_pooled());
        assert!(matches!(
            pool.acquire_unpooled(100),
            Err(StreamError::ResourceExhausted(_))
        ));
        drop(big);
        assert!(pool.acquire_unpooled(100).is_ok());
    }

    #[test]
    fn pages_recycle_on_drop() {
        let context = Context::new_for_test(2).with_parameters(Parameters {
            page_entries: 4,
            page_limit: 2,
            ..Default::default()
        });
        let pages = PagePool::new(&context);
        assert_eq!(pages.headroom(), 2);

        let mut page = pages.allocate().expect("first page");
        let _other = pages.allocate().expect("second page");
        assert_eq!(pages.headroom(), 0);
        assert!(pages.allocate().is_err());

        for key in 0..4 {
            page.push(PageEntry {
                key,
                value: key,
                aux: 0,
            })
            .expect("page has room");
        }
        assert!(page.push(PageEntry::default()).is_err());
        assert_eq!(page.entries().len(), 4);

        drop(page);
        assert_eq!(pages.headroom(), 1);
        let recycled = pages.allocate().expect("recycled page");
        assert!(recycled.is_empty());
    }
}
