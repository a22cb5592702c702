//! Pod inventory backed by the Kubernetes API.

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use log::debug;

use super::{merge_watches, EventStream, Listing, PodInventory, Resume};
use crate::error::InventoryError;
use crate::selector::LabelSelector;
use crate::types::{PodEvent, PodKey, PodRecord};

/// Server-side watch timeout; the stream ends afterwards and the observer
/// lists again.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeInventory {
    apis: Vec<Api<Pod>>,
    selector: String,
}

impl KubeInventory {
    /// One API handle per namespace, or a single cluster-wide handle when
    /// `namespaces` is empty.
    pub fn new(client: Client, namespaces: &[String], selector: &LabelSelector) -> Self {
        let apis = if namespaces.is_empty() {
            vec![Api::all(client)]
        } else {
            namespaces
                .iter()
                .map(|ns| Api::namespaced(client.clone(), ns))
                .collect()
        };
        Self {
            apis,
            selector: selector.to_string(),
        }
    }
}

#[async_trait]
impl PodInventory for KubeInventory {
    async fn list(&self) -> Result<Listing, InventoryError> {
        let params = ListParams::default().labels(&self.selector);
        let mut listing = Listing::default();

        for api in &self.apis {
            let list = api.list(&params).await?;
            listing
                .resume
                .0
                .push(list.metadata.resource_version.clone().unwrap_or_default());
            listing.pods.extend(list.items.iter().filter_map(pod_record));
        }
        Ok(listing)
    }

    async fn watch(&self, resume: &Resume) -> Result<EventStream, InventoryError> {
        let params = WatchParams::default()
            .labels(&self.selector)
            .timeout(WATCH_TIMEOUT_SECS);

        let mut streams = Vec::with_capacity(self.apis.len());
        for (idx, api) in self.apis.iter().enumerate() {
            let version = resume.0.get(idx).map(String::as_str).unwrap_or("0");
            let events = api.watch(&params, version).await?.filter_map(|item| async move {
                match item {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => Some(Ok(pod_event(&pod))),
                    Ok(WatchEvent::Deleted(pod)) => Some(Ok(PodEvent::Removed(pod_key(&pod)))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    // Usually 410 Gone: the resume version expired.
                    Ok(WatchEvent::Error(status)) => Some(Err(InventoryError::Watch(format!(
                        "{} ({})",
                        status.message, status.code
                    )))),
                    Err(e) => Some(Err(InventoryError::from(e))),
                }
            });
            streams.push(events.boxed());
        }

        // One namespace's watch timing out must not leave the others running
        // alone: every stream is re-listed together.
        let merged = merge_watches(streams);

        Ok(merged)
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    PodKey {
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
    }
}

fn pod_event(pod: &Pod) -> PodEvent {
    match pod_record(pod) {
        Some(record) => PodEvent::Upsert(record),
        None => {
            debug!("Pod {} has no publishable address", pod_key(pod));
            PodEvent::Removed(pod_key(pod))
        }
    }
}

/// `None` for pods without a valid IP or in a terminal phase.
fn pod_record(pod: &Pod) -> Option<PodRecord> {
    let status = pod.status.as_ref()?;
    if matches!(status.phase.as_deref(), Some("Succeeded") | Some("Failed")) {
        return None;
    }
    let address = status.pod_ip.as_deref()?.parse().ok()?;

    let condition_ready = status.conditions.as_ref().map_or(false, |conditions| {
        conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    });
    let terminating = pod.metadata.deletion_timestamp.is_some();

    Some(PodRecord {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        address,
        ready: condition_ready && !terminating,
        labels: pod.labels().clone(),
    })
}
