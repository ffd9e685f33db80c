// src/dedupe.rs
//
// Bounded-time set of recently seen ids. Used for upstream message-id
// dedupe and for throttling synthetic subscription.error envelopes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Duplicate,
}

struct Inner {
    seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

pub struct DedupeWindow {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DedupeWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record `id`, reporting whether it was seen inside the window.
    pub fn observe(&self, id: &str) -> Freshness {
        self.observe_at(id, Instant::now())
    }

    fn observe_at(&self, id: &str, now: Instant) -> Freshness {
        if id.is_empty() {
            // Unidentifiable messages are never forwarded twice on purpose;
            // treat them as duplicates so callers drop them.
            return Freshness::Duplicate;
        }
        let mut inner = self.inner.lock().unwrap();
        Self::expire(&mut inner, now, self.ttl);

        if let Some(seen_at) = inner.seen.get(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return Freshness::Duplicate;
            }
        }

        inner.seen.insert(id.to_string(), now);
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        Freshness::Fresh
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(inner: &mut Inner, now: Instant, ttl: Duration) {
        while let Some(front) = inner.order.front() {
            let stale = inner
                .seen
                .get(front)
                .map(|seen_at| now.duration_since(*seen_at) >= ttl)
                .unwrap_or(true);
            if !stale {
                break;
            }
            let id = inner.order.pop_front().unwrap();
            if let Some(seen_at) = inner.seen.get(&id) {
                if now.duration_since(*seen_at) >= ttl {
                    inner.seen.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_observation_is_duplicate() {
        let window = DedupeWindow::new(Duration::from_secs(600), 1024);
        assert_eq!(window.observe("m1"), Freshness::Fresh);
        assert_eq!(window.observe("m1"), Freshness::Duplicate);
        assert_eq!(window.observe("m2"), Freshness::Fresh);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let window = DedupeWindow::new(Duration::from_millis(10), 1024);
        let start = Instant::now();
        assert_eq!(window.observe_at("m1", start), Freshness::Fresh);
        assert_eq!(
            window.observe_at("m1", start + Duration::from_millis(20)),
            Freshness::Fresh
        );
    }

    #[test]
    fn capacity_evicts_oldest() {
        let window = DedupeWindow::new(Duration::from_secs(600), 2);
        window.observe("a");
        window.observe("b");
        window.observe("c");
        assert_eq!(window.len(), 2);
        // "a" was evicted, so it reads as fresh again.
        assert_eq!(window.observe("a"), Freshness::Fresh);
    }

    #[test]
    fn empty_id_never_fresh() {
        let window = DedupeWindow::new(Duration::from_secs(600), 16);
        assert_eq!(window.observe(""), Freshness::Duplicate);
    }
}
