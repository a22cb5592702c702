//! In-memory stand-ins for the inventory, the record store and the peer
//! sinks, shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};

use crate::error::{InventoryError, StoreError, WriteError};
use crate::inventory::{EventStream, Listing, PodInventory, Resume};
use crate::peers::{PeerArtifact, PeerSink};
use crate::store::{DnsRecord, RecordChange, RecordStore};
use crate::types::{PodEvent, PodRecord};

pub fn pod(name: &str, ip: &str) -> PodRecord {
    PodRecord {
        name: name.into(),
        namespace: "default".into(),
        address: ip.parse().unwrap(),
        ready: true,
        labels: BTreeMap::new(),
    }
}

type EventSender = mpsc::UnboundedSender<Result<PodEvent, InventoryError>>;

pub struct FakeInventory {
    pods: Mutex<Vec<PodRecord>>,
    sender: Mutex<Option<EventSender>>,
    watching: Notify,
    lists: AtomicUsize,
}

impl FakeInventory {
    pub fn new(pods: Vec<PodRecord>) -> Self {
        Self {
            pods: Mutex::new(pods),
            sender: Mutex::new(None),
            watching: Notify::new(),
            lists: AtomicUsize::new(0),
        }
    }

    pub fn set_pods(&self, pods: Vec<PodRecord>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn push(&self, event: PodEvent) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    pub fn fail_watch(&self) {
        if let Some(tx) = self.sender.lock().unwrap().take() {
            let _ = tx.send(Err(InventoryError::Watch("injected".into())));
        }
    }

    pub async fn wait_for_watch(&self) {
        self.watching.notified().await;
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodInventory for FakeInventory {
    async fn list(&self) -> Result<Listing, InventoryError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(Listing {
            pods: self.pods.lock().unwrap().clone(),
            resume: Resume::default(),
        })
    }

    async fn watch(&self, _resume: &Resume) -> Result<EventStream, InventoryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        self.watching.notify_one();
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }
}

/// Record store keeping rrsets in a map, with scripted failures.
pub struct MemoryStore {
    transactional: bool,
    records: Mutex<BTreeMap<(String, String), DnsRecord>>,
    failures: Mutex<VecDeque<StoreError>>,
    ready_failures: Mutex<VecDeque<StoreError>>,
    commits: Mutex<Vec<Vec<RecordChange>>>,
    commit_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new(transactional: bool) -> Self {
        Self {
            transactional,
            records: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            ready_failures: Mutex::new(VecDeque::new()),
            commits: Mutex::new(Vec::new()),
            commit_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// The next `commit` calls fail with these errors, in order.
    pub fn fail_commits(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn fail_ready_checks(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.ready_failures.lock().unwrap().extend(errors);
    }

    /// Every `commit` waits this long before touching the records.
    pub fn delay_commits(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = delay;
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn commits(&self) -> Vec<Vec<RecordChange>> {
        self.commits.lock().unwrap().clone()
    }

    /// `fqdn -> address` for everything stored.
    pub fn addresses(&self) -> BTreeMap<String, IpAddr> {
        self.records
            .lock()
            .unwrap()
            .values()
            .map(|r| (r.name.clone(), r.address))
            .collect()
    }

    /// Out-of-band mutation, as an operator would do by hand.
    pub fn insert(&self, record: DnsRecord) {
        self.records
            .lock()
            .unwrap()
            .insert((record.name.clone(), record.kind().to_string()), record);
    }

    pub fn delete(&self, fqdn: &str) {
        self.records.lock().unwrap().retain(|(name, _), _| name != fqdn);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn check_ready(&self) -> Result<(), StoreError> {
        match self.ready_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn records(&self) -> Result<Vec<DnsRecord>, StoreError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn commit(&self, changes: &[RecordChange]) -> Result<(), StoreError> {
        let delay = *self.commit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut records = self.records.lock().unwrap();
        for change in changes {
            match change {
                RecordChange::Remove(r) => {
                    records.remove(&(r.name.clone(), r.kind().to_string()));
                }
                RecordChange::Upsert(r) => {
                    records.insert((r.name.clone(), r.kind().to_string()), r.clone());
                }
            }
        }
        self.commits.lock().unwrap().push(changes.to_vec());
        Ok(())
    }
}

/// Peer sink remembering every artifact it was handed.
#[derive(Default)]
pub struct MemorySink {
    current: Mutex<Option<PeerArtifact>>,
    writes: AtomicUsize,
    failures: Mutex<VecDeque<WriteError>>,
}

impl MemorySink {
    pub fn fail_writes(&self, errors: impl IntoIterator<Item = WriteError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<PeerArtifact> {
        self.current.lock().unwrap().clone()
    }

    pub fn clobber(&self) {
        *self.current.lock().unwrap() = None;
    }
}

#[async_trait]
impl PeerSink for MemorySink {
    fn describe(&self) -> String {
        "memory".into()
    }

    async fn publish(&self, artifact: &PeerArtifact) -> Result<(), WriteError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = Some(artifact.clone());
        Ok(())
    }

    async fn is_current(&self, artifact: &PeerArtifact) -> Result<bool, WriteError> {
        Ok(self.current.lock().unwrap().as_ref() == Some(artifact))
    }
}
