use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AllocError;

/// A contiguous range of blob ids reserved for one allocation, exclusive
/// of `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidScope {
    pub start: u64,
    pub end: u64,
}

impl BidScope {
    pub fn count(&self) -> u64 {
        self.end - self.start
    }
}

/// Process-wide blob-id space, independent of which vid a caller ends up
/// pairing a reserved range with. Reserving bids never touches a volume's
/// own accounting, so a caller can always ask the bid manager first and
/// only pick a vid once the reservation succeeds.
pub trait BidManager: Send + Sync {
    /// Reserve `count` consecutive bids, returned as one or more
    /// contiguous scopes covering them in aggregate. Errors with
    /// `AllocError::BidExhausted` once the id space would overflow.
    fn reserve(&self, count: u32) -> Result<Vec<BidScope>, AllocError>;
}

/// Single monotonic `AtomicU64` cursor shared by every caller.
/// `compare_exchange_weak` retry loop is the idiom this stack uses for
/// cursor-like counters rather than a `Mutex`.
#[derive(Default)]
pub struct AtomicBidManager {
    cursor: AtomicU64,
}

impl AtomicBidManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BidManager for AtomicBidManager {
    fn reserve(&self, count: u32) -> Result<Vec<BidScope>, AllocError> {
        let count = count as u64;
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(count).ok_or(AllocError::BidExhausted)?;
            match self
                .cursor
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(start) => return Ok(vec![BidScope { start, end: start + count }]),
                Err(observed) => current = observed,
            }
        }
    }
}
