//! Bootstrap gate.
//!
//! Nothing may be written to the record store before it has answered a
//! readiness check: the zone is provisioned by an external step and may
//! not exist yet when the controller starts.  Holding a [`Ready`] token is
//! the only way to start the reconciler.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::{timeout, Instant};

use crate::backoff::Backoff;
use crate::error::{BootstrapError, StoreError};
use crate::health::Health;
use crate::shutdown::Shutdown;
use crate::store::RecordStore;

/// Proof that the record store passed the bootstrap gate.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    _private: (),
}

#[cfg(test)]
impl Ready {
    pub fn assume() -> Self {
        Ready { _private: () }
    }
}

pub struct BootstrapGate {
    store: Arc<dyn RecordStore>,
    deadline: Duration,
    call_timeout: Duration,
    backoff: Backoff,
}

impl BootstrapGate {
    pub fn new(store: Arc<dyn RecordStore>, deadline: Duration, call_timeout: Duration, backoff: Backoff) -> Self {
        Self {
            store,
            deadline,
            call_timeout,
            backoff,
        }
    }

    /// Polls the store until it is ready or the deadline passes.
    pub async fn wait_until_ready(&mut self, shutdown: &mut Shutdown) -> Result<Ready, BootstrapError> {
        let deadline = Instant::now() + self.deadline;
        let mut last: Option<BootstrapError> = None;
        self.backoff.reset();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(self.call_timeout.min(remaining), self.store.check_ready()).await {
                Ok(Ok(())) => {
                    info!("Record store is ready");
                    return Ok(Ready { _private: () });
                }
                Ok(Err(StoreError::SchemaInvalid(detail))) => {
                    last = Some(BootstrapError::SchemaMissing(detail));
                }
                Ok(Err(e)) => {
                    last = Some(BootstrapError::Unreachable(e.to_string()));
                }
                Err(_) => {}
            }

            let delay = self.backoff.next_delay();
            if Instant::now() + delay >= deadline {
                return Err(last.unwrap_or(BootstrapError::Timeout(self.deadline)));
            }
            if let Some(ref err) = last {
                warn!("Record store not ready ({}), probing again in {:?}", err, delay);
            }
            if !shutdown.sleep(delay).await {
                return Err(BootstrapError::Shutdown);
            }
        }
    }

    /// Repeats [`wait_until_ready`](Self::wait_until_ready) until it
    /// succeeds, reporting each failed round.  `None` on shutdown.
    pub async fn pass(&mut self, health: &Health, shutdown: &mut Shutdown) -> Option<Ready> {
        loop {
            match self.wait_until_ready(shutdown).await {
                Ok(ready) => {
                    health
                        .update(|r| {
                            r.bootstrap_passed = true;
                            r.bootstrap_error = None;
                        })
                        .await;
                    return Some(ready);
                }
                Err(BootstrapError::Shutdown) => return None,
                Err(e) => {
                    error!("Bootstrap gate failed: {}", e);
                    let message = e.to_string();
                    health.update(|r| r.bootstrap_error = Some(message)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use crate::testing::MemoryStore;

    fn gate(store: Arc<MemoryStore>, deadline_secs: u64) -> BootstrapGate {
        BootstrapGate::new(
            store,
            Duration::from_secs(deadline_secs),
            Duration::from_secs(5),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(8)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn passes_once_the_zone_appears() {
        let store = Arc::new(MemoryStore::new(true));
        store.fail_ready_checks([
            StoreError::Transient("connection refused".into()),
            StoreError::SchemaInvalid("zone missing".into()),
        ]);
        let (_trigger, mut shutdown) = shutdown::channel();
        let started = Instant::now();

        assert!(gate(store, 60).wait_until_ready(&mut shutdown).await.is_ok());
        // Two failed readiness checks: 1s + 2s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_missing_schema_at_deadline() {
        let store = Arc::new(MemoryStore::new(true));
        store.fail_ready_checks(std::iter::repeat(StoreError::SchemaInvalid("zone missing".into())).take(100));
        let (_trigger, mut shutdown) = shutdown::channel();

        let err = gate(store, 10).wait_until_ready(&mut shutdown).await.unwrap_err();
        assert!(matches!(err, BootstrapError::SchemaMissing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_unreachable_at_deadline() {
        let store = Arc::new(MemoryStore::new(true));
        store.fail_ready_checks(std::iter::repeat(StoreError::Transient("refused".into())).take(100));
        let (_trigger, mut shutdown) = shutdown::channel();

        let err = gate(store, 10).wait_until_ready(&mut shutdown).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Unreachable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_keeps_retrying_and_marks_health() {
        let store = Arc::new(MemoryStore::new(true));
        // Enough failures to exhaust the first 3s window.
        store.fail_ready_checks(std::iter::repeat(StoreError::Transient("refused".into())).take(3));
        let (_trigger, mut shutdown) = shutdown::channel();
        let health = Health::default();

        let ready = gate(store, 3).pass(&health, &mut shutdown).await;
        assert!(ready.is_some());
        let report = health.report().await;
        assert!(report.bootstrap_passed);
        assert!(report.bootstrap_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_the_gate() {
        let store = Arc::new(MemoryStore::new(true));
        store.fail_ready_checks(std::iter::repeat(StoreError::Transient("refused".into())).take(100));
        let (trigger, mut shutdown) = shutdown::channel();
        trigger.trigger();

        let ready = gate(store, 60).pass(&Health::default(), &mut shutdown).await;
        assert!(ready.is_none());
    }
}
