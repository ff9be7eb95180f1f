//! Process-wide shutdown signal.
//!
//! A [`ShutdownTrigger`] flips a `watch` flag once; every cloned [`Shutdown`]
//! handle observes it. Dropping the trigger without firing it does not count
//! as a shutdown request.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested; pends forever otherwise.
    pub async fn requested(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_seen_by_clones() {
        let (trigger, shutdown) = Shutdown::channel();
        let mut other = shutdown.clone();
        assert!(!shutdown.is_requested());

        trigger.trigger();
        other.requested().await;
        assert!(shutdown.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_is_not_a_request() {
        let (trigger, mut shutdown) = Shutdown::channel();
        drop(trigger);

        let waited = tokio::time::timeout(Duration::from_secs(5), shutdown.requested()).await;
        assert!(waited.is_err());
        assert!(!shutdown.is_requested());
    }
}
