//! Background work attached to a single event.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::{trace, warn};

/// The set of tasks an event handler started and must see finish before the
/// event counts as complete.
///
/// Dropping a lifetime without settling it aborts whatever is still running.
pub struct EventLifetime {
    event: &'static str,
    tasks: JoinSet<()>,
}

impl EventLifetime {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            tasks: JoinSet::new(),
        }
    }

    /// Extend the event until `work` has finished.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(work);
        trace!(event = self.event, pending = self.tasks.len(), "Work attached to event");
    }

    /// Number of tasks not yet joined.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every attached task. Returns how many finished normally.
    pub async fn settled(mut self) -> usize {
        let mut completed = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(()) => completed += 1,
                Err(e) => warn!(event = self.event, error = %e, "Background task failed"),
            }
        }
        completed
    }
}

impl std::fmt::Debug for EventLifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLifetime")
            .field("event", &self.event)
            .field("pending", &self.tasks.len())
            .finish()
    }
}

/// A handler result plus the work still attached to its event.
#[derive(Debug)]
pub struct EventOutcome<T> {
    pub result: T,
    pub lifetime: EventLifetime,
}

impl<T> EventOutcome<T> {
    pub fn new(result: T, lifetime: EventLifetime) -> Self {
        Self { result, lifetime }
    }

    /// Wait for the background work, then hand back the result.
    pub async fn settle(self) -> T {
        self.lifetime.settled().await;
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settled_waits_for_all_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut lifetime = EventLifetime::new("fetch");

        for delay in [30u64, 10, 20] {
            let counter = Arc::clone(&counter);
            lifetime.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(lifetime.pending(), 3);

        assert_eq!(lifetime.settled().await, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panicking_task_is_not_counted() {
        let mut lifetime = EventLifetime::new("fetch");
        lifetime.wait_until(async {});
        lifetime.wait_until(async { panic!("revalidation blew up") });

        assert_eq!(lifetime.settled().await, 1);
    }

    #[tokio::test]
    async fn test_outcome_settle_returns_result() {
        let flag = Arc::new(AtomicUsize::new(0));
        let mut lifetime = EventLifetime::new("fetch");
        let inner = Arc::clone(&flag);
        lifetime.wait_until(async move {
            inner.store(7, Ordering::SeqCst);
        });

        let result = EventOutcome::new("done", lifetime).settle().await;
        assert_eq!(result, "done");
        assert_eq!(flag.load(Ordering::SeqCst), 7);
    }
}
