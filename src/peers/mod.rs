//! Peer snapshot writer.
//!
//! Renders a membership snapshot into the peer artifact and hands it to
//! every configured sink.  Sinks replace their content atomically: a
//! reader sees either the previous artifact or the new one in full.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::Serialize;

use crate::error::WriteError;
use crate::types::MembershipSnapshot;

pub mod configmap;
pub mod file;
pub use configmap::ConfigMapPeerWriter;
pub use file::FilePeerWriter;

/// The two renderings of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerArtifact {
    /// One address per line.
    pub text: String,
    /// Pretty-printed JSON array of peer entries.
    pub json: String,
}

#[derive(Serialize)]
struct PeerEntry<'a> {
    name: &'a str,
    namespace: &'a str,
    ip: String,
    ready: bool,
    labels: &'a BTreeMap<String, String>,
}

impl PeerArtifact {
    /// Entries are ordered by `(namespace, name)`.
    pub fn render(snapshot: &MembershipSnapshot) -> Result<Self, WriteError> {
        let mut pods: Vec<_> = snapshot.iter().collect();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut text = String::new();
        for pod in &pods {
            text.push_str(&pod.address.to_string());
            text.push('\n');
        }

        let entries: Vec<PeerEntry<'_>> = pods
            .iter()
            .map(|pod| PeerEntry {
                name: &pod.name,
                namespace: &pod.namespace,
                ip: pod.address.to_string(),
                ready: pod.ready,
                labels: &pod.labels,
            })
            .collect();
        let mut json = serde_json::to_string_pretty(&entries).map_err(|e| WriteError::Io(e.into()))?;
        json.push('\n');

        Ok(Self { text, json })
    }
}

/// Somewhere the peer artifact is published.
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Atomically replaces the published artifact.
    async fn publish(&self, artifact: &PeerArtifact) -> Result<(), WriteError>;

    /// Whether the published artifact equals `artifact`.
    async fn is_current(&self, artifact: &PeerArtifact) -> Result<bool, WriteError>;
}

pub struct PeerSnapshotWriter {
    sinks: Vec<Arc<dyn PeerSink>>,
}

impl PeerSnapshotWriter {
    pub fn new(sinks: Vec<Arc<dyn PeerSink>>) -> Self {
        Self { sinks }
    }

    /// Publishes to every sink; a failing sink does not stop the others.
    /// The first error is returned.
    pub async fn write(&self, snapshot: &MembershipSnapshot) -> Result<(), WriteError> {
        let artifact = PeerArtifact::render(snapshot)?;
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&artifact).await {
                warn!("Publishing peers to {} failed: {}", sink.describe(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether every sink already serves the rendering of `snapshot`.
    pub async fn is_current(&self, snapshot: &MembershipSnapshot) -> Result<bool, WriteError> {
        let artifact = PeerArtifact::render(snapshot)?;
        for sink in &self.sinks {
            if !sink.is_current(&artifact).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, MemorySink};

    #[test]
    fn renders_text_and_json_sorted_by_namespace() {
        let mut b = pod("b", "10.0.0.2");
        b.namespace = "alpha".into();
        b.labels.insert("dns".into(), "true".into());
        let snapshot = MembershipSnapshot::from_records(vec![pod("a", "10.0.0.1"), b]);

        let artifact = PeerArtifact::render(&snapshot).unwrap();
        assert_eq!(artifact.text, "10.0.0.2\n10.0.0.1\n");

        let parsed: serde_json::Value = serde_json::from_str(&artifact.json).unwrap();
        assert_eq!(parsed[0]["name"], "b");
        assert_eq!(parsed[0]["namespace"], "alpha");
        assert_eq!(parsed[0]["ip"], "10.0.0.2");
        assert_eq!(parsed[0]["labels"]["dns"], "true");
        assert_eq!(parsed[1]["name"], "a");
        assert_eq!(parsed[1]["ready"], true);
    }

    #[test]
    fn empty_snapshot_renders_empty_list() {
        let artifact = PeerArtifact::render(&MembershipSnapshot::default()).unwrap();
        assert_eq!(artifact.text, "");
        assert_eq!(artifact.json, "[]\n");
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_block_the_other() {
        let good = Arc::new(MemorySink::default());
        let bad = Arc::new(MemorySink::default());
        bad.fail_writes([WriteError::PermissionDenied("read-only".into())]);
        let writer = PeerSnapshotWriter::new(vec![bad.clone(), good.clone()]);
        let snapshot = MembershipSnapshot::from_records(vec![pod("a", "10.0.0.1")]);

        let err = writer.write(&snapshot).await.unwrap_err();
        assert!(matches!(err, WriteError::PermissionDenied(_)));
        assert_eq!(good.write_count(), 1);
        assert!(!writer.is_current(&snapshot).await.unwrap());

        writer.write(&snapshot).await.unwrap();
        assert!(writer.is_current(&snapshot).await.unwrap());
    }
}
