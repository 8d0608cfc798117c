//! Waiter registry for asynchronous acknowledgments.
//!
//! A condition (capture ready, capture stopped, uploads drained) is either
//! satisfied or not. Parties that need it register a oneshot; the event that
//! satisfies the condition resolves every pending waiter and clears the list
//! in one step. Waits are always bounded: a timeout reports `false`.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Default)]
struct WaiterState {
    satisfied: bool,
    pending: Vec<oneshot::Sender<()>>,
}

/// Latch plus pending list. `reset` re-arms the latch for the next cycle.
#[derive(Default)]
pub struct Waiters {
    state: Mutex<WaiterState>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that starts out satisfied.
    pub fn satisfied() -> Self {
        Self {
            state: Mutex::new(WaiterState {
                satisfied: true,
                pending: Vec::new(),
            }),
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.lock().satisfied
    }

    /// Mark the condition unsatisfied. Pending waiters keep waiting.
    pub fn reset(&self) {
        self.lock().satisfied = false;
    }

    /// Mark the condition satisfied and wake every pending waiter.
    /// Returns how many waiters were woken.
    pub fn resolve_all(&self) -> usize {
        let pending = {
            let mut state = self.lock();
            state.satisfied = true;
            std::mem::take(&mut state.pending)
        };
        let mut woken = 0;
        for tx in pending {
            if tx.send(()).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    /// Wait until the condition is satisfied or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let rx = {
            let mut state = self.lock();
            if state.satisfied {
                return true;
            }
            state.pending.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            state.pending.push(tx);
            rx
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Number of registered waiters that are still listening.
    pub fn pending(&self) -> usize {
        self.lock().pending.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaiterState> {
        // A poisoned latch still holds a coherent bool and list.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn satisfied_wait_returns_immediately() {
        let waiters = Waiters::satisfied();
        assert!(waiters.wait(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_not_satisfied() {
        let waiters = Waiters::new();
        assert!(!waiters.wait(Duration::from_millis(500)).await);
        assert_eq!(waiters.pending(), 0);
    }

    #[tokio::test]
    async fn resolve_wakes_all_and_clears() {
        let waiters = Arc::new(Waiters::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let w = waiters.clone();
            handles.push(tokio::spawn(async move { w.wait(Duration::from_secs(5)).await }));
        }

        while waiters.pending() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(waiters.resolve_all(), 3);
        assert_eq!(waiters.pending(), 0);

        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }

    #[tokio::test]
    async fn reset_rearms_the_latch() {
        let waiters = Waiters::new();
        waiters.resolve_all();
        assert!(waiters.is_satisfied());
        waiters.reset();
        assert!(!waiters.is_satisfied());
        assert!(!waiters.wait(Duration::from_millis(10)).await);
    }
}
