// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Identifier Generation
//!
//! Action, command and agent identifiers double as storage keys and spool
//! filenames, so they must be unique across the fleet and increase
//! monotonically within one process.
//!
//! [`EpochIdGenerator`] seeds itself from the number of seconds elapsed since
//! 2013-04-29T10:00:00Z, shifted left 16 bits, and then counts up by one. The
//! value stays below 2^53 so ids survive a round-trip through JSON numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp of the seed epoch.
pub const ID_EPOCH_UNIX: i64 = 1_367_258_400;

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

pub struct EpochIdGenerator {
    last: AtomicU64,
}

impl EpochIdGenerator {
    pub fn new() -> Self {
        Self::seeded_at(Utc::now())
    }

    pub fn seeded_at(now: DateTime<Utc>) -> Self {
        let epoch = Utc
            .timestamp_opt(ID_EPOCH_UNIX, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let elapsed = (now - epoch).num_seconds().max(0) as u64 + 1;
        let seed = elapsed << 16;
        // next_id() returns `seed` on its first call
        Self {
            last: AtomicU64::new(seed - 1),
        }
    }
}

impl Default for EpochIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for EpochIdGenerator {
    fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Deterministic generator for tests.
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
