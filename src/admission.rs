//! Per-origin admission control.
//!
//! Bounds the number of outstanding requests each origin may have in
//! flight. Counters live in one map owned by the queue; callers go through
//! [`RequestQueue::admit`] so every increment is paired with a decrement,
//! whatever the outcome of the request.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{error, trace};

use crate::error::{ExecutionError, Result};
use crate::lock;

/// Default cap on outstanding requests per origin.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 25;

pub struct RequestQueue {
    max_queue_size: usize,
    counts: Mutex<HashMap<String, usize>>,
}

impl RequestQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Counts one more outstanding request for `origin`.
    ///
    /// Fails with `TooManyRequests`, leaving the counter untouched, when the
    /// origin is already at the cap.
    pub fn increment(&self, origin: &str) -> Result<()> {
        let mut counts = lock(&self.counts);
        let count = counts.get(origin).copied().unwrap_or(0);
        if count >= self.max_queue_size {
            return Err(ExecutionError::TooManyRequests {
                origin: origin.to_string(),
            });
        }
        counts.insert(origin.to_string(), count + 1);
        trace!(origin, count = count + 1, "request admitted");
        Ok(())
    }

    /// Releases one outstanding request for `origin`.
    ///
    /// Decrementing an origin with nothing outstanding is a bug in the
    /// caller; it is logged at error level and reported as `QueueUnderflow`.
    pub fn decrement(&self, origin: &str) -> Result<()> {
        let mut counts = lock(&self.counts);
        match counts.get_mut(origin) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                counts.remove(origin);
                Ok(())
            }
            None => {
                error!(origin, "unmatched decrement: origin has no outstanding requests");
                Err(ExecutionError::QueueUnderflow {
                    origin: origin.to_string(),
                })
            }
        }
    }

    /// Current outstanding count for `origin` (0 if never seen).
    pub fn get(&self, origin: &str) -> usize {
        lock(&self.counts).get(origin).copied().unwrap_or(0)
    }

    /// Increments and returns a permit that decrements on drop.
    pub fn admit(&self, origin: &str) -> Result<AdmissionPermit<'_>> {
        self.increment(origin)?;
        Ok(AdmissionPermit {
            queue: self,
            origin: origin.to_string(),
        })
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

/// One admitted request. Dropping it releases the slot.
pub struct AdmissionPermit<'a> {
    queue: &'a RequestQueue,
    origin: String,
}

impl AdmissionPermit<'_> {
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        // The permit owns exactly one increment, so this cannot underflow;
        // decrement() logs loudly if that ever stops being true.
        let _ = self.queue.decrement(&self.origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://dapp.example";

    #[test]
    fn test_get_unseen_origin_is_zero() {
        let queue = RequestQueue::new(3);
        assert_eq!(queue.get(ORIGIN), 0);
    }

    #[test]
    fn test_increment_past_cap_fails_and_leaves_counter() {
        let queue = RequestQueue::new(3);
        for _ in 0..3 {
            queue.increment(ORIGIN).unwrap();
        }
        let err = queue.increment(ORIGIN).unwrap_err();
        assert!(matches!(err, ExecutionError::TooManyRequests { .. }));
        assert_eq!(queue.get(ORIGIN), 3);
    }

    #[test]
    fn test_decrement_at_zero_fails_loudly() {
        let queue = RequestQueue::new(3);
        let err = queue.decrement(ORIGIN).unwrap_err();
        assert!(matches!(err, ExecutionError::QueueUnderflow { .. }));
        assert_eq!(queue.get(ORIGIN), 0);
    }

    #[test]
    fn test_origins_are_independent() {
        let queue = RequestQueue::new(1);
        queue.increment(ORIGIN).unwrap();
        queue.increment("npm:other-snap").unwrap();
        assert!(queue.increment(ORIGIN).is_err());
        assert_eq!(queue.get("npm:other-snap"), 1);
    }

    #[test]
    fn test_paired_sequences_stay_in_bounds() {
        let queue = RequestQueue::new(4);
        // Deterministic pseudo-random walk of paired operations.
        let mut outstanding = 0usize;
        let mut seed = 0x2545_f491_u32;
        for _ in 0..1_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 2 == 0 {
                if queue.increment(ORIGIN).is_ok() {
                    outstanding += 1;
                }
            } else if outstanding > 0 {
                queue.decrement(ORIGIN).unwrap();
                outstanding -= 1;
            }
            let count = queue.get(ORIGIN);
            assert!(count <= queue.max_queue_size());
            assert_eq!(count, outstanding);
        }
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let queue = RequestQueue::new(1);
        {
            let permit = queue.admit(ORIGIN).unwrap();
            assert_eq!(permit.origin(), ORIGIN);
            assert_eq!(queue.get(ORIGIN), 1);
            assert!(queue.admit(ORIGIN).is_err());
        }
        assert_eq!(queue.get(ORIGIN), 0);
        assert!(queue.admit(ORIGIN).is_ok());
    }
}
