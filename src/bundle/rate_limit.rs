//! Per-token sliding-window rate limiter for the bundle endpoint (spec.md
//! §4.5 — 60 requests/min/token).

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

struct SlidingWindow {
    window_secs: i64,
    max_count: u64,
    events: VecDeque<i64>,
}

impl SlidingWindow {
    fn new(window_secs: i64, max_count: u64) -> Self {
        Self {
            window_secs,
            max_count,
            events: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: i64) {
        let cutoff = now - self.window_secs;
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn record_and_check(&mut self, now: i64) -> bool {
        self.evict(now);
        let limited = self.events.len() as u64 >= self.max_count;
        if !limited {
            self.events.push_back(now);
        }
        limited
    }
}

pub struct BundleRateLimiter {
    max_per_min: u64,
    trackers: Mutex<HashMap<String, SlidingWindow>>,
}

impl BundleRateLimiter {
    pub fn new(max_per_min: u64) -> Self {
        Self {
            max_per_min,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this request should be rejected with 429.
    pub async fn is_limited(&self, token: &str, now: i64) -> bool {
        let mut map = self.trackers.lock().await;
        let window = map
            .entry(token.to_string())
            .or_insert_with(|| SlidingWindow::new(60, self.max_per_min));
        window.record_and_check(now)
    }
}
