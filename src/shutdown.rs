//! Process-wide shutdown signal shared by every long-running task.

use std::time::Duration;

use tokio::sync::watch;

/// Fires the shutdown signal.  Dropping it fires it as well.
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Cloneable listener side.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        // An error means the trigger is gone, which also counts.
        let _ = self.0.wait_for(|down| *down).await;
    }

    /// Sleeps for `duration`; returns `false` if shutdown cut it short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
