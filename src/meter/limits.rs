use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use tokio::sync::Mutex;

use crate::error::MeterError;

const SHARD_COUNT: usize = 16;

/// Fixed-window request counters keyed by credential scope.
///
/// Keys hash onto one of 16 independently locked shards. A shard drops every
/// window that is not the current one the first time it is touched in a new
/// window, so idle keys do not accumulate.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    shards: Vec<Mutex<Shard>>,
    limit: u32,
    window_secs: u64,
}

#[derive(Debug, Default)]
struct Shard {
    usage: HashMap<String, WindowUsage>,
    last_gc_window: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowUsage {
    window: u64,
    requests: u32,
}

impl KeyedRateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            limit,
            window_secs: window_secs.max(1),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub async fn check_and_consume(&self, key: &str, now_epoch_secs: u64) -> Result<(), MeterError> {
        let window = now_epoch_secs / self.window_secs;
        let mut shard = self.shard_for(key).lock().await;

        if window != shard.last_gc_window {
            shard.usage.retain(|_, usage| usage.window == window);
            shard.last_gc_window = window;
        }

        let usage = shard.usage.entry(key.to_string()).or_insert(WindowUsage {
            window,
            requests: 0,
        });
        if usage.window != window {
            usage.window = window;
            usage.requests = 0;
        }

        let next = usage.requests.saturating_add(1);
        if self.limit == 0 || next > self.limit {
            return Err(MeterError::RateLimited {
                limit: format!("{}/{}s", self.limit, self.window_secs),
            });
        }
        usage.requests = next;
        Ok(())
    }

    pub async fn tracked_keys(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.usage.len();
        }
        total
    }
}
