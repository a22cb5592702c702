//! Reconciliation loop.
//!
//! A single sequential task owning all reconciliation state.  It waits for
//! the newest membership snapshot, brings the record store and the peer
//! artifact in line with it, and retries each of the two sinks on its own
//! schedule.  Retry timers are tied to the snapshot version they were
//! scheduled for; a newer snapshot drops them and starts over.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};

use crate::adapter::RecordStoreAdapter;
use crate::backoff::Backoff;
use crate::bootstrap::Ready;
use crate::error::{StoreError, WriteError};
use crate::health::{unix_now, Health, Phase};
use crate::peers::PeerSnapshotWriter;
use crate::shutdown::Shutdown;
use crate::types::{MembershipSnapshot, VersionedSnapshot};

pub struct Reconciler {
    adapter: RecordStoreAdapter,
    writer: PeerSnapshotWriter,
    health: Health,
    period: Duration,
    call_timeout: Duration,
    store_backoff: Backoff,
    writer_backoff: Backoff,
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    version: u64,
    at: Instant,
}

#[derive(Default)]
struct State {
    desired: VersionedSnapshot,
    /// What the store is known to hold.
    last_applied: MembershipSnapshot,
    /// `last_applied` must be re-read from the store before diffing.
    baseline_dirty: bool,
    store_synced: bool,
    artifact_synced: bool,
    store_retry: Option<Retry>,
    writer_retry: Option<Retry>,
    /// A non-transient store failure: no retries until the next snapshot
    /// or periodic tick.
    store_blocked: bool,
    store_error: Option<StoreError>,
    artifact_error: Option<String>,
}

/// What woke the loop up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Snapshot,
    Periodic,
    StoreRetry,
    WriterRetry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Trigger::Snapshot => "snapshot",
            Trigger::Periodic => "periodic",
            Trigger::StoreRetry => "store retry",
            Trigger::WriterRetry => "artifact retry",
        })
    }
}

enum StoreOutcome {
    Synced { added: usize, removed: usize },
    Failed(StoreError),
    Superseded,
}

impl Reconciler {
    pub fn new(
        adapter: RecordStoreAdapter,
        writer: PeerSnapshotWriter,
        health: Health,
        period: Duration,
        call_timeout: Duration,
        retry_backoff: Backoff,
    ) -> Self {
        Self {
            adapter,
            writer,
            health,
            period,
            call_timeout,
            store_backoff: retry_backoff.clone(),
            writer_backoff: retry_backoff,
        }
    }

    /// Runs until shutdown or until the observer goes away.
    pub async fn run(
        mut self,
        _ready: Ready,
        mut snapshots: watch::Receiver<VersionedSnapshot>,
        mut shutdown: Shutdown,
    ) {
        let mut state = State {
            baseline_dirty: true,
            ..Default::default()
        };

        // Version 0 is the empty placeholder the channel starts with.
        // Acting on it would withdraw every published record.
        while snapshots.borrow_and_update().version == 0 {
            tokio::select! {
                _ = shutdown.wait() => return,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        state.desired = snapshots.borrow().clone();
        self.reconcile(&mut state, &snapshots, Trigger::Snapshot).await;

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let store_retry = state.store_retry.map(|r| r.at);
            let writer_retry = state.writer_retry.map(|r| r.at);

            let trigger = tokio::select! {
                _ = shutdown.wait() => {
                    info!("Reconciler shutting down");
                    break;
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        warn!("Membership observer stopped; reconciler exiting");
                        break;
                    }
                    let next = snapshots.borrow_and_update().clone();
                    self.supersede(&mut state, next);
                    Trigger::Snapshot
                }
                _ = ticker.tick() => {
                    state.baseline_dirty = true;
                    state.store_synced = false;
                    state.artifact_synced = false;
                    state.store_blocked = false;
                    Trigger::Periodic
                }
                _ = sleep_until_opt(store_retry) => {
                    if let Some(retry) = state.store_retry.take() {
                        debug!("Retrying record store for v{}", retry.version);
                    }
                    Trigger::StoreRetry
                }
                _ = sleep_until_opt(writer_retry) => {
                    if let Some(retry) = state.writer_retry.take() {
                        debug!("Retrying peer artifact for v{}", retry.version);
                    }
                    Trigger::WriterRetry
                }
            };

            self.reconcile(&mut state, &snapshots, trigger).await;
        }
    }

    /// A newer snapshot cancels every pending retry.
    fn supersede(&mut self, state: &mut State, next: VersionedSnapshot) {
        debug!("Snapshot v{} supersedes v{}", next.version, state.desired.version);
        state.desired = next;
        state.store_synced = false;
        state.artifact_synced = false;
        state.store_retry = None;
        state.writer_retry = None;
        state.store_blocked = false;
        self.store_backoff.reset();
        self.writer_backoff.reset();
    }

    async fn reconcile(
        &mut self,
        state: &mut State,
        snapshots: &watch::Receiver<VersionedSnapshot>,
        trigger: Trigger,
    ) {
        let version = state.desired.version;
        let store_due = !state.store_synced && !state.store_blocked && state.store_retry.is_none();
        let writer_due = !state.artifact_synced && state.writer_retry.is_none();
        if !store_due && !writer_due {
            return;
        }

        self.health
            .update(|r| {
                r.phase = Phase::Reconciling;
                r.desired_version = version;
                r.last_attempt_at = Some(unix_now());
            })
            .await;

        let (mut added, mut removed) = (0, 0);
        let mut store_result = if state.store_synced {
            "unchanged"
        } else if state.store_blocked {
            "blocked"
        } else {
            "retry pending"
        };
        let mut artifact_result = if state.artifact_synced { "unchanged" } else { "retry pending" };

        if store_due {
            match self.sync_store(state, snapshots).await {
                StoreOutcome::Synced { added: a, removed: r } => {
                    (added, removed) = (a, r);
                    store_result = if a + r == 0 { "unchanged" } else { "ok" };
                    state.store_synced = true;
                    state.store_error = None;
                    self.store_backoff.reset();
                }
                StoreOutcome::Superseded => {
                    info!(
                        "Reconcile v{} ({}): superseded while the store write was in flight",
                        version, trigger
                    );
                    return;
                }
                StoreOutcome::Failed(e) => {
                    store_result = "failed";
                    if e.is_transient() {
                        let delay = self.store_backoff.next_delay();
                        warn!("Record store update for v{} failed: {}; retrying in {:?}", version, e, delay);
                        state.store_retry = Some(Retry {
                            version,
                            at: Instant::now() + delay,
                        });
                    } else {
                        error!("Record store update for v{} failed: {}", version, e);
                        state.store_blocked = true;
                    }
                    state.store_error = Some(e);
                }
            }
        }

        if writer_due {
            match self.sync_artifact(&state.desired.snapshot).await {
                Ok(written) => {
                    artifact_result = if written { "ok" } else { "unchanged" };
                    state.artifact_synced = true;
                    state.artifact_error = None;
                    self.writer_backoff.reset();
                }
                Err(e) => {
                    artifact_result = "failed";
                    let delay = self.writer_backoff.next_delay();
                    warn!("Peer artifact write for v{} failed: {}; retrying in {:?}", version, e, delay);
                    state.writer_retry = Some(Retry {
                        version,
                        at: Instant::now() + delay,
                    });
                    state.artifact_error = Some(e.to_string());
                }
            }
        }

        let converged = state.store_synced && state.artifact_synced;
        let peers = state.desired.snapshot.len();
        let store_error = state.store_error.as_ref().map(|e| e.to_string());
        let artifact_error = state.artifact_error.clone();
        info!(
            "Reconcile v{} ({}): +{} -{}, store {}, artifact {}, {} peers{}",
            version,
            trigger,
            added,
            removed,
            store_result,
            artifact_result,
            peers,
            if converged { ", converged" } else { "" }
        );
        self.health
            .update(|r| {
                r.converged = converged;
                r.store_error = store_error;
                r.artifact_error = artifact_error;
                if converged {
                    r.phase = Phase::Converged;
                    r.applied_version = version;
                    r.peers = peers;
                    r.last_applied_at = Some(unix_now());
                } else {
                    r.phase = Phase::Failed;
                }
            })
            .await;
    }

    async fn sync_store(
        &self,
        state: &mut State,
        snapshots: &watch::Receiver<VersionedSnapshot>,
    ) -> StoreOutcome {
        if state.baseline_dirty {
            match timeout(self.call_timeout, self.adapter.baseline()).await {
                Ok(Ok(baseline)) => {
                    state.last_applied = baseline;
                    state.baseline_dirty = false;
                }
                Ok(Err(e)) => return StoreOutcome::Failed(e),
                Err(_) => return StoreOutcome::Failed(self.timed_out("reading records")),
            }
        }

        let diff = state.desired.snapshot.diff(&state.last_applied);
        if diff.is_empty() {
            debug!("Record store already matches v{}", state.desired.version);
            return StoreOutcome::Synced { added: 0, removed: 0 };
        }

        // A clone keeps its own "seen" marker, so the loop still notices
        // the newer snapshot after this race.
        let mut newer = snapshots.clone();
        let apply = timeout(self.call_timeout, self.adapter.apply(&diff.to_add, &diff.to_remove));
        let result = tokio::select! {
            biased;
            _ = newer.changed() => {
                state.baseline_dirty = true;
                return StoreOutcome::Superseded;
            }
            result = apply => result,
        };

        match result {
            Ok(Ok(())) => {
                state.last_applied = state.desired.snapshot.clone();
                StoreOutcome::Synced {
                    added: diff.to_add.len(),
                    removed: diff.to_remove.len(),
                }
            }
            Ok(Err(e)) => {
                state.baseline_dirty = true;
                StoreOutcome::Failed(e)
            }
            Err(_) => {
                state.baseline_dirty = true;
                StoreOutcome::Failed(self.timed_out("applying changes"))
            }
        }
    }

    /// `Ok(false)` when the served artifact was already current.
    async fn sync_artifact(&self, snapshot: &MembershipSnapshot) -> Result<bool, WriteError> {
        match timeout(self.call_timeout, self.writer.is_current(snapshot)).await {
            Ok(Ok(true)) => return Ok(false),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!("Could not compare peer artifact: {}", e),
            Err(_) => debug!("Comparing peer artifact timed out"),
        }
        match timeout(self.call_timeout, self.writer.write(snapshot)).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(WriteError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("peer artifact write timed out after {:?}", self.call_timeout),
            ))),
        }
    }

    fn timed_out(&self, what: &str) -> StoreError {
        StoreError::Transient(format!("{} timed out after {:?}", what, self.call_timeout))
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
