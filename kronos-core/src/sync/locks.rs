use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::event::UserId;

/// Per-user commit locks. Waiters are granted the lock in arrival order.
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the user's lock. The guard releases on drop.
    pub async fn acquire(&self, user_id: UserId, timeout: Duration) -> Option<OwnedMutexGuard<()>> {
        let lock = Arc::clone(self.locks.entry(user_id).or_default().value());
        tokio::time::timeout(timeout, lock.lock_owned()).await.ok()
    }
}
