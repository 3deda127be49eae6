//! Interruptible lock waits

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};

/// Wakes every task currently waiting on a filesystem lock
#[derive(Debug, Default)]
pub struct Interrupt {
    token: RwLock<CancellationToken>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `mutex`, failing with [`FsError::Interrupted`] if
    /// [`interrupt_waiters`](Self::interrupt_waiters) fires first
    pub async fn lock<'a, T>(&self, mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>> {
        let token = self.token.read().clone();
        tokio::select! {
            biased;
            guard = mutex.lock() => Ok(guard),
            _ = token.cancelled() => {
                log::warn!("LOCK: wait for {} lock interrupted", name);
                Err(FsError::Interrupted)
            }
        }
    }

    /// Cancel all waits in progress; later waits are unaffected
    pub fn interrupt_waiters(&self) {
        let old = std::mem::take(&mut *self.token.write());
        old.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_uncontended_lock() {
        let interrupt = Interrupt::new();
        let mutex = Mutex::new(5u32);
        let guard = interrupt.lock(&mutex, "test").await.unwrap();
        assert_eq!(*guard, 5);
    }

    #[tokio::test]
    async fn test_interrupted_wait_is_retryable() {
        let interrupt = Arc::new(Interrupt::new());
        let mutex = Arc::new(Mutex::new(()));
        let held = mutex.clone().lock_owned().await;

        let waiter = {
            let interrupt = interrupt.clone();
            let mutex = mutex.clone();
            tokio::spawn(async move { interrupt.lock(&mutex, "test").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.interrupt_waiters();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_retryable());

        // A fresh wait after the interrupt succeeds once the lock is free
        drop(held);
        interrupt.lock(&mutex, "test").await.unwrap();
    }
}
