use std::sync::Arc;
use std::time::Duration;

use mrc_core::TableId;
use mrc_storage::{LockGuard, LockProvider, TtlCache};

use crate::error::{SyncError, SyncResult};

/// Master document lock plus the per-row debounce window, shared by every
/// entry point that writes to the master table.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    lock: Arc<dyn LockProvider>,
    debounce: Arc<dyn TtlCache>,
    window: Duration,
}

impl ConcurrencyGuard {
    pub fn new(lock: Arc<dyn LockProvider>, debounce: Arc<dyn TtlCache>, window: Duration) -> Self {
        Self {
            lock,
            debounce,
            window,
        }
    }

    pub async fn acquire(&self, wait: Duration) -> SyncResult<LockGuard> {
        self.lock
            .try_acquire(wait)
            .await
            .ok_or(SyncError::LockTimeout(wait))
    }

    pub fn debounce_key(source_id: &str, table_id: TableId, row: usize) -> String {
        format!("debounce_{source_id}_{table_id}_{row}")
    }

    /// True if this row was already handled inside the window. Otherwise the
    /// row is marked and false is returned.
    pub fn recently_handled(&self, source_id: &str, table_id: TableId, row: usize) -> bool {
        if self.window.is_zero() {
            return false;
        }
        let key = Self::debounce_key(source_id, table_id, row);
        if self.debounce.contains(&key) {
            return true;
        }
        self.debounce.put(&key, self.window);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrc_storage::{DocumentLock, MokaTtlCache};

    fn guard(window: Duration) -> ConcurrencyGuard {
        ConcurrencyGuard::new(
            Arc::new(DocumentLock::new("master")),
            Arc::new(MokaTtlCache::new(64)),
            window,
        )
    }

    #[test]
    fn debounce_suppresses_repeat_rows_only() {
        let guard = guard(Duration::from_secs(30));
        assert!(!guard.recently_handled("src", 0, 4));
        assert!(guard.recently_handled("src", 0, 4));
        assert!(!guard.recently_handled("src", 0, 5));
        assert!(!guard.recently_handled("src", 1, 4));
    }

    #[test]
    fn zero_window_disables_debounce() {
        let guard = guard(Duration::ZERO);
        assert!(!guard.recently_handled("src", 0, 4));
        assert!(!guard.recently_handled("src", 0, 4));
    }

    #[tokio::test]
    async fn second_acquire_times_out() {
        let guard = guard(Duration::from_secs(1));
        let _held = guard.acquire(Duration::from_millis(20)).await.expect("first");
        let err = guard
            .acquire(Duration::from_millis(20))
            .await
            .err()
            .expect("second acquire must fail");
        assert!(matches!(err, SyncError::LockTimeout(_)));
    }
}
