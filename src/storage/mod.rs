pub mod memory;

pub use memory::MemoryStorage;

use std::time::{Duration, Instant};

//usage counters for one key within its current window
#[derive(Debug, Clone, Copy)]
pub struct UsageEntry {
    //admitted uploads this window
    pub count: u32,
    //cumulative admitted bytes this window
    pub total_bytes: u64,
    //when the window began
    pub window_start: Instant,
    //renewed on every window reset, so a late release can be scoped to the
    //window its charge landed in
    pub generation: u64,
}

impl UsageEntry {
    pub fn fresh(now: Instant, generation: u64) -> Self {
        Self {
            count: 0,
            total_bytes: 0,
            window_start: now,
            generation,
        }
    }

    //true once the window this entry tracks has fully elapsed
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) > window
    }
}
