//! One-shot flags.
//!
//! A `Flag` starts open and can be closed exactly once; the transition is
//! irreversible. It can be checked without blocking and awaited.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Flag {
    closed: AtomicBool,
    notify: Notify,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the flag and wakes every waiter.
    ///
    /// Returns true if this call performed the transition.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Waits until the flag is closed.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent close cannot be missed.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_close_is_one_way() {
        let flag = Flag::new();
        assert!(!flag.is_closed());
        assert!(flag.close());
        assert!(flag.is_closed());
        assert!(!flag.close());
        assert!(flag.is_closed());
    }

    #[tokio::test]
    async fn test_wait_on_closed_flag_returns() {
        let flag = Flag::new();
        flag.close();
        tokio::time::timeout(Duration::from_secs(1), flag.wait())
            .await
            .expect("wait should complete immediately");
    }

    #[tokio::test]
    async fn test_waiters_are_released() {
        let flag = Arc::new(Flag::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let flag = flag.clone();
            waiters.push(tokio::spawn(async move { flag.wait().await }));
        }
        tokio::task::yield_now().await;
        flag.close();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should be released")
                .unwrap();
        }
    }
}
