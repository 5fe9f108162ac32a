//! Router buffer pools
//!
//! Forwarded messages are received into preallocated page-backed buffers.
//! Each size class has its own pool and credit counter:
//! - Credits go negative while messages queue for a buffer
//! - `min_credits` records how close the pool came to exhaustion
//! - Pools are sized once, before forwarding starts, and never resized while
//!   routing is active

use crate::RouterError;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Size of one buffer page
pub const PAGE_SIZE: usize = 4096;
/// Largest forwarded payload
pub const MAX_PAYLOAD: usize = 1 << 20;
/// Pages in a large buffer
pub const LARGE_BUFFER_PAGES: usize = MAX_PAYLOAD.div_ceil(PAGE_SIZE);

/// Identifier of a forward waiting for a buffer
pub type ForwardId = u64;

// ============================================================================
// SIZE CLASSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolClass {
    /// Zero-payload messages
    Tiny,
    /// Payloads up to one page
    Small,
    /// Payloads up to [`MAX_PAYLOAD`]
    Large,
}

impl PoolClass {
    pub const ALL: [PoolClass; 3] = [PoolClass::Tiny, PoolClass::Small, PoolClass::Large];

    pub fn npages(&self) -> usize {
        match self {
            PoolClass::Tiny => 0,
            PoolClass::Small => 1,
            PoolClass::Large => LARGE_BUFFER_PAGES,
        }
    }

    /// Smallest class that holds `len` payload bytes
    pub fn for_payload(len: usize) -> Option<Self> {
        match len {
            0 => Some(PoolClass::Tiny),
            l if l <= PAGE_SIZE => Some(PoolClass::Small),
            l if l <= MAX_PAYLOAD => Some(PoolClass::Large),
            _ => None,
        }
    }
}

impl std::fmt::Display for PoolClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolClass::Tiny => write!(f, "tiny"),
            PoolClass::Small => write!(f, "small"),
            PoolClass::Large => write!(f, "large"),
        }
    }
}

// ============================================================================
// BUFFERS
// ============================================================================

/// Page-backed forwarding buffer
#[derive(Debug)]
pub struct RouterBuffer {
    class: PoolClass,
    pages: Vec<Vec<u8>>,
}

impl RouterBuffer {
    /// Allocate a buffer of `class`, failing instead of aborting when memory
    /// is short
    pub fn allocate(class: PoolClass) -> Result<Self, RouterError> {
        let npages = class.npages();
        let mut pages = Vec::new();
        pages.try_reserve_exact(npages).map_err(|_| RouterError::OutOfMemory)?;
        for _ in 0..npages {
            let mut page = Vec::new();
            page.try_reserve_exact(PAGE_SIZE).map_err(|_| RouterError::OutOfMemory)?;
            page.resize(PAGE_SIZE, 0);
            pages.push(page);
        }
        Ok(Self { class, pages })
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn pages(&self) -> &[Vec<u8>] {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.pages
    }
}

/// Outcome of asking a pool for a buffer
#[derive(Debug)]
pub enum Admission {
    /// A buffer was free
    Granted(RouterBuffer),
    /// The forward waits for a buffer to be given back
    Queued,
}

/// Pool counters for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub class: PoolClass,
    pub npages: usize,
    pub nbuffers: usize,
    pub credits: i32,
    pub min_credits: i32,
    pub waiting: usize,
}

// ============================================================================
// POOL
// ============================================================================

#[derive(Debug)]
pub struct BufferPool {
    class: PoolClass,
    /// Free buffers
    buffers: Vec<RouterBuffer>,
    /// Buffers owned by the pool, free or lent out
    nbuffers: usize,
    credits: i32,
    min_credits: i32,
    waiting: VecDeque<ForwardId>,
}

impl BufferPool {
    /// Empty pool for `class`
    pub fn new(class: PoolClass) -> Self {
        Self {
            class,
            buffers: Vec::new(),
            nbuffers: 0,
            credits: 0,
            min_credits: 0,
            waiting: VecDeque::new(),
        }
    }

    pub fn class(&self) -> PoolClass {
        self.class
    }

    pub fn npages(&self) -> usize {
        self.class.npages()
    }

    pub fn nbuffers(&self) -> usize {
        self.nbuffers
    }

    pub fn credits(&self) -> i32 {
        self.credits
    }

    pub fn min_credits(&self) -> i32 {
        self.min_credits
    }

    /// No buffer lent out and nobody waiting
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty()
            && self.credits == self.nbuffers as i32
            && self.buffers.len() == self.nbuffers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            class: self.class,
            npages: self.npages(),
            nbuffers: self.nbuffers,
            credits: self.credits,
            min_credits: self.min_credits,
            waiting: self.waiting.len(),
        }
    }

    /// Size the pool to `count` buffers
    pub fn allocate(&mut self, count: usize, routing_active: bool) -> Result<(), RouterError> {
        self.allocate_with(count, routing_active, RouterBuffer::allocate)
    }

    /// Size the pool using `alloc` for each buffer
    ///
    /// A pool that is already sized accepts only the same count again. Any
    /// allocation failure releases everything allocated so far.
    pub fn allocate_with<F>(&mut self, count: usize, routing_active: bool, mut alloc: F) -> Result<(), RouterError>
    where
        F: FnMut(PoolClass) -> Result<RouterBuffer, RouterError>,
    {
        if self.nbuffers != 0 {
            if self.nbuffers == count {
                return Ok(());
            }
            return Err(RouterError::ConfigurationConflict(format!(
                "{} pool already has {} buffers, {} requested",
                self.class, self.nbuffers, count
            )));
        }
        if routing_active {
            return Err(RouterError::ConfigurationConflict(format!(
                "{} pool cannot be sized while routing",
                self.class
            )));
        }

        let mut buffers = Vec::new();
        buffers.try_reserve_exact(count).map_err(|_| RouterError::OutOfMemory)?;
        for i in 0..count {
            match alloc(self.class) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    warn!("Failed to allocate {} router buffer {}/{}: {}", self.class, i, count, e);
                    return Err(RouterError::OutOfMemory);
                }
            }
        }

        self.buffers = buffers;
        self.nbuffers = count;
        self.credits = count as i32;
        self.min_credits = count as i32;
        debug!("Allocated {} {} router buffers", count, self.class);
        Ok(())
    }

    /// Release every buffer; fails if any is lent out or anyone waits
    pub fn free_all(&mut self) -> Result<(), RouterError> {
        if !self.is_idle() {
            return Err(RouterError::PoolBusy(format!(
                "{} pool: {} of {} buffers outstanding, {} waiting",
                self.class,
                self.nbuffers - self.buffers.len(),
                self.nbuffers,
                self.waiting.len()
            )));
        }
        self.buffers = Vec::new();
        self.nbuffers = 0;
        self.credits = 0;
        self.min_credits = 0;
        Ok(())
    }

    /// Ask for a buffer on behalf of forward `id`
    pub fn take(&mut self, id: ForwardId) -> Admission {
        self.credits -= 1;
        self.min_credits = self.min_credits.min(self.credits);

        if self.credits < 0 {
            self.waiting.push_back(id);
            return Admission::Queued;
        }
        match self.buffers.pop() {
            Some(buffer) => Admission::Granted(buffer),
            None => {
                // credits said a buffer was free; keep the books straight
                self.waiting.push_back(id);
                Admission::Queued
            }
        }
    }

    /// Return a buffer; the oldest waiter gets it if there is one
    ///
    /// Fails if the pool has no buffer lent out.
    pub fn give_back(
        &mut self,
        buffer: RouterBuffer,
    ) -> Result<Option<(ForwardId, RouterBuffer)>, RouterError> {
        if buffer.class != self.class || self.credits >= self.nbuffers as i32 {
            warn!("{} pool: returned buffer was never lent out", self.class);
            return Err(RouterError::InvalidArgument(format!(
                "{} buffer returned to {} pool with nothing outstanding",
                buffer.class, self.class
            )));
        }
        self.credits += 1;
        match self.waiting.pop_front() {
            Some(id) => Ok(Some((id, buffer))),
            None => {
                self.buffers.push(buffer);
                Ok(None)
            }
        }
    }
}

/// One pool per size class
#[derive(Debug)]
pub struct RouterPools {
    pools: [BufferPool; 3],
}

impl Default for RouterPools {
    fn default() -> Self {
        Self {
            pools: PoolClass::ALL.map(BufferPool::new),
        }
    }
}

impl RouterPools {
    pub fn get(&self, class: PoolClass) -> &BufferPool {
        &self.pools[class as usize]
    }

    pub fn get_mut(&mut self, class: PoolClass) -> &mut BufferPool {
        &mut self.pools[class as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferPool> {
        self.pools.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferPool> {
        self.pools.iter_mut()
    }

    pub fn is_idle(&self) -> bool {
        self.pools.iter().all(BufferPool::is_idle)
    }

    /// Free every pool; checks all of them before touching any
    pub fn free_all(&mut self) -> Result<(), RouterError> {
        if let Some(busy) = self.pools.iter().find(|p| !p.is_idle()) {
            return Err(RouterError::PoolBusy(format!("{} pool in use", busy.class())));
        }
        for pool in self.pools.iter_mut() {
            pool.free_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_payload() {
        assert_eq!(PoolClass::for_payload(0), Some(PoolClass::Tiny));
        assert_eq!(PoolClass::for_payload(1), Some(PoolClass::Small));
        assert_eq!(PoolClass::for_payload(PAGE_SIZE), Some(PoolClass::Small));
        assert_eq!(PoolClass::for_payload(PAGE_SIZE + 1), Some(PoolClass::Large));
        assert_eq!(PoolClass::for_payload(MAX_PAYLOAD), Some(PoolClass::Large));
        assert_eq!(PoolClass::for_payload(MAX_PAYLOAD + 1), None);
    }

    #[test]
    fn test_buffer_pages() {
        let tiny = RouterBuffer::allocate(PoolClass::Tiny).unwrap();
        assert_eq!(tiny.capacity(), 0);
        let small = RouterBuffer::allocate(PoolClass::Small).unwrap();
        assert_eq!(small.capacity(), PAGE_SIZE);
        assert_eq!(small.pages()[0].len(), PAGE_SIZE);
    }

    #[test]
    fn test_allocate_sets_credits() {
        let mut pool = BufferPool::new(PoolClass::Small);
        pool.allocate(4, false).unwrap();
        assert_eq!(pool.nbuffers(), 4);
        assert_eq!(pool.credits(), 4);
        assert_eq!(pool.min_credits(), 4);
        assert!(pool.is_idle());
    }

    #[test]
    fn test_allocate_same_count_is_noop() {
        let mut pool = BufferPool::new(PoolClass::Tiny);
        pool.allocate(3, false).unwrap();
        pool.allocate(3, true).unwrap();
        assert!(matches!(
            pool.allocate(5, false),
            Err(RouterError::ConfigurationConflict(_))
        ));
        assert_eq!(pool.nbuffers(), 3);
    }

    #[test]
    fn test_allocate_refused_while_routing() {
        let mut pool = BufferPool::new(PoolClass::Tiny);
        assert!(matches!(
            pool.allocate(2, true),
            Err(RouterError::ConfigurationConflict(_))
        ));
        assert_eq!(pool.nbuffers(), 0);
    }

    #[test]
    fn test_allocate_failure_rolls_back() {
        let mut pool = BufferPool::new(PoolClass::Small);
        let mut made = 0;
        let result = pool.allocate_with(5, false, |class| {
            made += 1;
            if made == 3 {
                Err(RouterError::OutOfMemory)
            } else {
                RouterBuffer::allocate(class)
            }
        });

        assert!(matches!(result, Err(RouterError::OutOfMemory)));
        assert_eq!(pool.nbuffers(), 0);
        assert_eq!(pool.credits(), 0);

        // caller retries the whole pool
        pool.allocate(5, false).unwrap();
        assert_eq!(pool.nbuffers(), 5);
    }

    #[test]
    fn test_take_and_give_back() {
        let mut pool = BufferPool::new(PoolClass::Tiny);
        pool.allocate(1, false).unwrap();

        let buffer = match pool.take(1) {
            Admission::Granted(b) => b,
            Admission::Queued => panic!("Expected a free buffer"),
        };
        assert_eq!(pool.credits(), 0);

        assert!(matches!(pool.take(2), Admission::Queued));
        assert!(matches!(pool.take(3), Admission::Queued));
        assert_eq!(pool.credits(), -2);
        assert_eq!(pool.min_credits(), -2);
        assert!(!pool.is_idle());

        // handed to the oldest waiter first
        let (id, buffer) = pool.give_back(buffer).unwrap().unwrap();
        assert_eq!(id, 2);
        let (id, buffer) = pool.give_back(buffer).unwrap().unwrap();
        assert_eq!(id, 3);
        assert!(pool.give_back(buffer).unwrap().is_none());

        assert_eq!(pool.credits(), 1);
        assert_eq!(pool.min_credits(), -2);
        assert!(pool.is_idle());
    }

    #[test]
    fn test_give_back_rejects_foreign_buffer() {
        let mut pool = BufferPool::new(PoolClass::Tiny);
        pool.allocate(2, false).unwrap();

        let stray = RouterBuffer::allocate(PoolClass::Tiny).unwrap();
        assert!(matches!(pool.give_back(stray), Err(RouterError::InvalidArgument(_))));
        assert_eq!(pool.credits(), 2);
        assert!(pool.is_idle());
        pool.free_all().unwrap();
    }

    #[test]
    fn test_free_all_busy() {
        let mut pool = BufferPool::new(PoolClass::Small);
        pool.allocate(2, false).unwrap();
        let Admission::Granted(buffer) = pool.take(9) else {
            panic!("Expected a free buffer");
        };

        assert!(matches!(pool.free_all(), Err(RouterError::PoolBusy(_))));
        assert!(pool.give_back(buffer).unwrap().is_none());
        pool.free_all().unwrap();
        assert_eq!(pool.nbuffers(), 0);
        assert_eq!(pool.credits(), 0);
    }

    #[test]
    fn test_router_pools_free_checks_all_first() {
        let mut pools = RouterPools::default();
        pools.get_mut(PoolClass::Tiny).allocate(2, false).unwrap();
        pools.get_mut(PoolClass::Large).allocate(1, false).unwrap();
        let Admission::Granted(_held) = pools.get_mut(PoolClass::Large).take(1) else {
            panic!("Expected a free buffer");
        };

        assert!(pools.free_all().is_err());
        // the idle tiny pool was left untouched
        assert_eq!(pools.get(PoolClass::Tiny).nbuffers(), 2);
    }
}
