//! Dispatch debouncer
//!
//! Coalesces bursts of automated sends per ticket into a single delayed
//! dispatch. One pending timer exists per ticket id; scheduling again within
//! the window cancels and replaces the previous timer, so a burst of inbound
//! messages produces at most one menu prompt or out-of-hours notice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct PendingDispatch {
    tenant_id: i64,
    token: u64,
    handle: Option<tokio::task::JoinHandle<()>>,
}

/// Per-ticket delayed-send coalescer
#[derive(Default)]
pub struct DispatchDebouncer {
    timers: Mutex<HashMap<i64, PendingDispatch>>,
    next_token: AtomicU64,
}

impl DispatchDebouncer {
    /// Create an empty debouncer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run after `delay`, replacing any timer still
    /// pending for the same ticket
    pub fn schedule<F>(self: &Arc<Self>, tenant_id: i64, ticket_id: i64, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        {
            let mut timers = self.lock();
            if let Some(prev) = timers.insert(
                ticket_id,
                PendingDispatch {
                    tenant_id,
                    token,
                    handle: None,
                },
            ) {
                if let Some(handle) = prev.handle {
                    handle.abort();
                }
            }
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Run only if this timer is still the registered one
            let claimed = {
                let mut timers = this.lock();
                match timers.get(&ticket_id) {
                    Some(pending) if pending.token == token => {
                        timers.remove(&ticket_id);
                        true
                    }
                    _ => false,
                }
            };

            if claimed {
                action.await;
            }
        });

        let mut timers = self.lock();
        match timers.get_mut(&ticket_id) {
            Some(pending) if pending.token == token => pending.handle = Some(task),
            // Replaced while spawning
            _ => task.abort(),
        }
    }

    /// Cancel a ticket's pending timer, if any
    pub fn cancel(&self, ticket_id: i64) {
        let mut timers = self.lock();
        if let Some(pending) = timers.remove(&ticket_id) {
            if let Some(handle) = pending.handle {
                handle.abort();
            }
        }
    }

    /// Invalidate every pending timer for a tenant (logout / terminal
    /// disconnect)
    pub fn cancel_tenant(&self, tenant_id: i64) {
        let mut timers = self.lock();
        timers.retain(|_, pending| {
            if pending.tenant_id == tenant_id {
                if let Some(handle) = pending.handle.take() {
                    handle.abort();
                }
                false
            } else {
                true
            }
        });
    }

    /// Number of timers currently pending
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, PendingDispatch>> {
        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_one_dispatch() {
        let debouncer = Arc::new(DispatchDebouncer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = Arc::clone(&runs);
            debouncer.schedule(1, 10, Duration::from_millis(100), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tickets_debounce_independently() {
        let debouncer = Arc::new(DispatchDebouncer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        for ticket_id in [10, 11] {
            let runs = Arc::clone(&runs);
            debouncer.schedule(1, ticket_id, Duration::from_millis(100), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_restarts_the_window() {
        let debouncer = Arc::new(DispatchDebouncer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        debouncer.schedule(1, 10, Duration::from_millis(100), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let r = Arc::clone(&runs);
        debouncer.schedule(1, 10, Duration::from_millis(100), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        // 120ms after the first schedule: the replaced timer must not fire
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_tenant_drops_only_that_tenant() {
        let debouncer = Arc::new(DispatchDebouncer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        debouncer.schedule(1, 10, Duration::from_millis(100), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&runs);
        debouncer.schedule(2, 20, Duration::from_millis(100), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.cancel_tenant(1);
        assert_eq!(debouncer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
