//! Catch-up key allocation
//!
//! A catch-up key correlates the phases of a stream reset: the server hands
//! one to the client that is asked to upload a fresh canvas, and the client
//! echoes it back so late or duplicate uploads can be told apart. Keys are
//! session-local and cycle through `MIN_CATCHUP_KEY..=MAX_CATCHUP_KEY`.

use std::collections::HashSet;

pub const MIN_CATCHUP_KEY: i32 = 1;
pub const MAX_CATCHUP_KEY: i32 = 999_999_999;

/// Reserved "no catch-up" sentinel, never handed out
pub const INITIAL_CATCHUP_KEY: i32 = 1_000_000;

#[derive(Debug, Clone)]
pub struct CatchupKeyAllocator {
    next: i32,
    outstanding: HashSet<i32>,
}

impl CatchupKeyAllocator {
    pub fn new() -> Self {
        Self::starting_at(INITIAL_CATCHUP_KEY + 1)
    }

    /// Resume allocation at a persisted position
    ///
    /// Out-of-range values restart right after the sentinel.
    pub fn starting_at(next: i32) -> Self {
        let next = if (MIN_CATCHUP_KEY..=MAX_CATCHUP_KEY).contains(&next) {
            next
        } else {
            INITIAL_CATCHUP_KEY + 1
        };
        Self {
            next,
            outstanding: HashSet::new(),
        }
    }

    /// The key the next allocation will try first
    pub fn next_key(&self) -> i32 {
        self.next
    }

    /// Hand out a key that is neither the sentinel nor currently outstanding
    ///
    /// Returns `None` only when every key in the range is outstanding.
    pub fn allocate(&mut self) -> Option<i32> {
        // One full pass over the outstanding set plus the sentinel is enough
        // to find a free key if one exists
        let attempts = self.outstanding.len() + 2;
        for _ in 0..attempts {
            let key = self.next;
            self.next = if key >= MAX_CATCHUP_KEY {
                MIN_CATCHUP_KEY
            } else {
                key + 1
            };
            if key == INITIAL_CATCHUP_KEY || self.outstanding.contains(&key) {
                continue;
            }
            self.outstanding.insert(key);
            return Some(key);
        }
        None
    }

    /// Mark a key as no longer in use
    pub fn release(&mut self, key: i32) -> bool {
        self.outstanding.remove(&key)
    }

    pub fn is_outstanding(&self, key: i32) -> bool {
        self.outstanding.contains(&key)
    }
}

impl Default for CatchupKeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}
