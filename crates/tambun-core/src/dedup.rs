//! ============================================================================
//! Dedup Guard - Bounded recency set for already-handled ids
//! ============================================================================
//! Recognises webhook envelope ids and message ids that were already
//! processed. In-process and best-effort: history is lost on restart, which
//! is fine because platform redelivery windows are short.
//! ============================================================================

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

/// Default number of ids remembered per guard
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Records-and-tests membership of an id.
///
/// The first call for an id returns `false` and marks it seen; later calls
/// return `true`. Implementations may forget old ids.
#[async_trait]
pub trait DedupGuard: Send + Sync {
    async fn seen(&self, id: &str) -> bool;
}

#[derive(Default)]
struct Window {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Fixed-capacity FIFO set: inserting past capacity evicts the oldest
/// inserted id. Lookups do not refresh an id's position.
pub struct RecentIds {
    capacity: usize,
    window: Mutex<Window>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.window.lock().await.order.len()
    }
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[async_trait]
impl DedupGuard for RecentIds {
    async fn seen(&self, id: &str) -> bool {
        let mut window = self.window.lock().await;
        if window.members.contains(id) {
            debug!("Duplicate id: {}", id);
            return true;
        }

        window.members.insert(id.to_string());
        window.order.push_back(id.to_string());
        while window.order.len() > self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.members.remove(&oldest);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_sighting_is_unseen() {
        let guard = RecentIds::new(10);
        assert!(!guard.seen("evt-1").await);
        assert!(guard.seen("evt-1").await);
        assert!(!guard.seen("evt-2").await);
        assert_eq!(guard.len().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_inserted() {
        let n = 5;
        let guard = RecentIds::new(n);
        for i in 0..=n {
            assert!(!guard.seen(&format!("id-{}", i)).await);
        }
        assert_eq!(guard.len().await, n);
        // id-0 fell out of the window, so it reads as new again
        assert!(!guard.seen("id-0").await);
        // that re-insert evicted id-1; id-5 is still remembered
        assert!(guard.seen("id-5").await);
        assert!(!guard.seen("id-1").await);
    }

    #[tokio::test]
    async fn test_lookup_does_not_refresh_position() {
        let guard = RecentIds::new(2);
        guard.seen("a").await;
        guard.seen("b").await;
        assert!(guard.seen("a").await);
        guard.seen("c").await;
        // insertion order, not access order: "a" is gone despite the hit
        assert!(!guard.seen("a").await);
    }

    #[tokio::test]
    async fn test_concurrent_callers_see_one_winner() {
        let guard = Arc::new(RecentIds::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move { guard.seen("same").await }));
        }
        let mut fresh = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(RecentIds::new(0).capacity(), 1);
    }
}
