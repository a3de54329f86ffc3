use std::time::Duration;

use tokio::sync::watch;

/// Held by whoever stops the pipeline.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Observed by every background task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `delay`. Returns `true` if shutdown cut the sleep short.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, mut signal) = channel();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move {
            signal.wait().await;
            signal.is_triggered()
        });
        trigger.trigger();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_interrupted() {
        let (trigger, mut signal) = channel();
        assert!(!signal.sleep(Duration::from_millis(5)).await);

        trigger.trigger();
        assert!(signal.sleep(Duration::from_secs(60)).await);
    }
}
