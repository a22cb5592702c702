//! Membership observer.
//!
//! Turns the inventory's list + watch feed into a stream of
//! [`VersionedSnapshot`]s published on a `watch` channel.  The channel only
//! ever holds the newest snapshot, so a busy consumer never sees a backlog.
//!
//! * A full listing seeds the first snapshot before any watch event is
//!   applied, and every watch failure is answered by listing again.
//! * Events are coalesced: the first event after a quiet period opens a
//!   debounce window and everything arriving inside it is folded into a
//!   single snapshot emitted when the window closes.
//! * A snapshot equal to the previously emitted one is dropped.
//! * The inventory is listed again every `resync` period even while the
//!   watch is healthy, so a lost notification is corrected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};

use crate::backoff::Backoff;
use crate::config::{ReadinessConfig, ReadinessPolicy};
use crate::error::InventoryError;
use crate::inventory::PodInventory;
use crate::selector::LabelSelector;
use crate::shutdown::Shutdown;
use crate::types::{MembershipSnapshot, PodEvent, PodKey, PodRecord, VersionedSnapshot};

pub struct MembershipObserver {
    inventory: Arc<dyn PodInventory>,
    selector: LabelSelector,
    readiness: ReadinessConfig,
    debounce: Duration,
    call_timeout: Duration,
    resync: Duration,
    relist_backoff: Backoff,
}

/// Observed pods plus what was last published.
struct Membership {
    pods: BTreeMap<PodKey, PodRecord>,
    unready_since: HashMap<PodKey, Instant>,
    version: u64,
    last_emitted: Option<MembershipSnapshot>,
}

impl MembershipObserver {
    pub fn new(
        inventory: Arc<dyn PodInventory>,
        selector: LabelSelector,
        readiness: ReadinessConfig,
        debounce: Duration,
        call_timeout: Duration,
        resync: Duration,
        relist_backoff: Backoff,
    ) -> Self {
        Self {
            inventory,
            selector,
            readiness,
            debounce,
            call_timeout,
            resync,
            relist_backoff,
        }
    }

    /// Runs until shutdown.  Inventory failures are retried forever.
    pub async fn run(mut self, tx: watch::Sender<VersionedSnapshot>, mut shutdown: Shutdown) {
        let mut state = Membership {
            pods: BTreeMap::new(),
            unready_since: HashMap::new(),
            version: 0,
            last_emitted: None,
        };

        'relist: loop {
            if shutdown.is_triggered() {
                break;
            }

            let listed = timeout(self.call_timeout, self.inventory.list())
                .await
                .unwrap_or_else(|_| Err(InventoryError::Timeout(self.call_timeout)));
            let listing = match listed {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("Pod listing failed: {}", e);
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let now = Instant::now();
            state.pods.clear();
            for record in listing.pods {
                if self.selector.matches(&record.labels) {
                    state.pods.insert(record.key(), record);
                }
            }
            let pods = &state.pods;
            state.unready_since.retain(|key, _| pods.get(key).map_or(false, |p| !p.ready));
            for record in state.pods.values().filter(|p| !p.ready) {
                state.unready_since.entry(record.key()).or_insert(now);
            }
            info!("Pod listing found {} matching pods", state.pods.len());
            if !self.emit(&mut state, &tx) {
                break;
            }

            let watched = timeout(self.call_timeout, self.inventory.watch(&listing.resume))
                .await
                .unwrap_or_else(|_| Err(InventoryError::Timeout(self.call_timeout)));
            let mut events = match watched {
                Ok(events) => events,
                Err(e) => {
                    warn!("Pod watch failed to start: {}", e);
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            self.relist_backoff.reset();

            let resync_at = Instant::now() + self.resync;
            let mut window: Option<Instant> = None;
            loop {
                let wake = earliest(window, self.next_grace_expiry(&state));

                tokio::select! {
                    _ = shutdown.wait() => break 'relist,
                    item = events.next() => match item {
                        Some(Ok(event)) => {
                            self.apply(&mut state, event);
                            window.get_or_insert_with(|| Instant::now() + self.debounce);
                        }
                        Some(Err(e)) => {
                            warn!("Pod watch error, re-listing: {}", e);
                            if !self.pause(&mut shutdown).await {
                                break 'relist;
                            }
                            continue 'relist;
                        }
                        None => {
                            debug!("Pod watch stream ended, re-listing");
                            continue 'relist;
                        }
                    },
                    _ = sleep_until(resync_at) => {
                        debug!("Periodic pod re-list");
                        continue 'relist;
                    }
                    _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                        window = None;
                        if !self.emit(&mut state, &tx) {
                            break 'relist;
                        }
                    }
                }
            }
        }
        info!("Membership observer stopped");
    }

    async fn pause(&mut self, shutdown: &mut Shutdown) -> bool {
        let delay = self.relist_backoff.next_delay();
        debug!("Re-listing pods in {:?}", delay);
        shutdown.sleep(delay).await
    }

    fn apply(&self, state: &mut Membership, event: PodEvent) {
        match event {
            PodEvent::Upsert(record) if self.selector.matches(&record.labels) => {
                let key = record.key();
                if record.ready {
                    state.unready_since.remove(&key);
                } else {
                    state.unready_since.entry(key.clone()).or_insert_with(Instant::now);
                }
                debug!("Pod {} -> {} (ready={})", key, record.address, record.ready);
                state.pods.insert(key, record);
            }
            PodEvent::Upsert(record) => {
                let key = record.key();
                debug!("Pod {} no longer matches selector", key);
                state.unready_since.remove(&key);
                state.pods.remove(&key);
            }
            PodEvent::Removed(key) => {
                debug!("Pod {} removed", key);
                state.unready_since.remove(&key);
                state.pods.remove(&key);
            }
        }
    }

    fn is_live(&self, state: &Membership, record: &PodRecord, now: Instant) -> bool {
        if record.ready {
            return true;
        }
        match self.readiness.policy {
            ReadinessPolicy::IncludeUnready => true,
            ReadinessPolicy::ExcludeUnready => false,
            ReadinessPolicy::GracePeriod => state
                .unready_since
                .get(&record.key())
                .map_or(false, |since| now < *since + self.grace()),
        }
    }

    fn live_snapshot(&self, state: &Membership, now: Instant) -> MembershipSnapshot {
        MembershipSnapshot::from_records(
            state
                .pods
                .values()
                .filter(|record| self.is_live(state, record, now))
                .cloned(),
        )
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.readiness.grace_secs)
    }

    /// When the next still-published unready pod runs out of grace.
    fn next_grace_expiry(&self, state: &Membership) -> Option<Instant> {
        if self.readiness.policy != ReadinessPolicy::GracePeriod {
            return None;
        }
        let now = Instant::now();
        state
            .unready_since
            .values()
            .map(|since| *since + self.grace())
            .filter(|expiry| *expiry > now)
            .min()
    }

    /// Publishes the current membership if it differs from the last one.
    /// Returns `false` once nobody is listening any more.
    fn emit(&self, state: &mut Membership, tx: &watch::Sender<VersionedSnapshot>) -> bool {
        let snapshot = self.live_snapshot(state, Instant::now());

        if state.last_emitted.as_ref() == Some(&snapshot) {
            debug!("Membership unchanged, nothing to emit");
            return !tx.is_closed();
        }

        state.version += 1;
        info!(
            "Membership snapshot v{}: {} live pods",
            state.version,
            snapshot.len()
        );
        state.last_emitted = Some(snapshot.clone());
        tx.send_replace(VersionedSnapshot {
            version: state.version,
            snapshot,
        });
        !tx.is_closed()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
