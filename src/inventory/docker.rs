use super::{merge_watches, EventStream, Listing, PodInventory, Resume};
use crate::error::InventoryError;
use crate::selector::LabelSelector;
use crate::types::{PodEvent, PodKey, PodRecord};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// Label Docker stacks put on their containers; used as the namespace.
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// Treats containers on the local Docker engine as pods.
pub struct DockerInventory {
    docker: Docker,
    network_name: Option<String>,
    selector: LabelSelector,
}

impl DockerInventory {
    pub fn new(network_name: Option<String>, selector: LabelSelector) -> Result<Self, InventoryError> {
        // Handles the unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            network_name,
            selector,
        })
    }

    fn label_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        let labels = self.selector.docker_filters();
        if !labels.is_empty() {
            filters.insert("label".to_string(), labels);
        }
        filters
    }

    fn event_stream(&self, filters: HashMap<String, Vec<String>>) -> EventStream {
        let opts = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        let docker = self.docker.clone();
        let network_name = self.network_name.clone();

        self.docker
            .events(Some(opts))
            .filter_map(move |msg| {
                let docker = docker.clone();
                let network_name = network_name.clone();
                async move {
                    let event = match msg {
                        Ok(event) => event,
                        Err(e) => return Some(Err(InventoryError::from(e))),
                    };
                    match reaction_for(&event)? {
                        Reaction::Remove(key) => Some(Ok(PodEvent::Removed(key))),
                        Reaction::Inspect(target) => match docker.inspect_container(&target, None).await {
                            Ok(detail) => container_event(&detail, network_name.as_deref()).map(Ok),
                            // A destroyed container also sends its own event.
                            Err(e) => {
                                warn!("Failed to inspect container {}: {}", target, e);
                                None
                            }
                        },
                    }
                }
            })
            .boxed()
    }
}

#[async_trait]
impl PodInventory for DockerInventory {
    async fn list(&self) -> Result<Listing, InventoryError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            filters: self.label_filters(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut pods = Vec::new();
        for c in containers {
            let Some(id) = c.id else { continue };
            match self.docker.inspect_container(&id, None).await {
                Ok(detail) => {
                    if let Some(record) = container_record(&detail, self.network_name.as_deref()) {
                        pods.push(record);
                    }
                }
                // The container may have gone away between list and inspect.
                Err(e) => debug!("Skipping container {}: {}", id, e),
            }
        }
        Ok(Listing {
            pods,
            resume: Resume::default(),
        })
    }

    async fn watch(&self, _resume: &Resume) -> Result<EventStream, InventoryError> {
        let mut container_filters = self.label_filters();
        container_filters.insert("type".to_string(), vec!["container".to_string()]);

        // Network events carry no container labels; the observer drops
        // containers outside the selector after the inspect.
        let mut network_filters = HashMap::new();
        network_filters.insert("type".to_string(), vec!["network".to_string()]);
        network_filters.insert(
            "event".to_string(),
            vec!["connect".to_string(), "disconnect".to_string()],
        );
        if let Some(name) = &self.network_name {
            network_filters.insert("network".to_string(), vec![name.clone()]);
        }

        Ok(merge_watches(vec![
            self.event_stream(container_filters),
            self.event_stream(network_filters),
        ]))
    }
}

/// What an engine event asks of the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reaction {
    /// Re-read the container (by name or id) and publish what it looks like now.
    Inspect(String),
    Remove(PodKey),
}

fn reaction_for(event: &EventMessage) -> Option<Reaction> {
    let action = event.action.as_deref().unwrap_or_default();
    let actor = event.actor.as_ref()?;
    let attributes = actor.attributes.clone().unwrap_or_default();

    match event.typ {
        Some(EventMessageTypeEnum::CONTAINER) => {
            let name = attributes
                .get("name")
                .filter(|n| !n.is_empty())
                .cloned()
                .or_else(|| actor.id.clone())
                .filter(|n| !n.is_empty())?;
            debug!("Container event: {} for {}", action, name);
            match action {
                "start" | "unpause" => Some(Reaction::Inspect(name)),
                a if a.starts_with("health_status") => Some(Reaction::Inspect(name)),
                // `kill` only delivers a signal (often a reload); `die`
                // follows if the container actually exits.
                "die" | "stop" | "pause" | "destroy" => Some(Reaction::Remove(PodKey {
                    namespace: attributes.get(STACK_NAMESPACE_LABEL).cloned().unwrap_or_default(),
                    name,
                })),
                _ => None,
            }
        }
        Some(EventMessageTypeEnum::NETWORK) if matches!(action, "connect" | "disconnect") => {
            let container = attributes.get("container").filter(|c| !c.is_empty())?.clone();
            debug!("Network event: {} for container {}", action, container);
            Some(Reaction::Inspect(container))
        }
        _ => None,
    }
}

/// Current state of an inspected container as a pod event: an upsert when
/// it has a usable address, a removal otherwise.
fn container_event(detail: &ContainerInspectResponse, network_name: Option<&str>) -> Option<PodEvent> {
    if let Some(record) = container_record(detail, network_name) {
        return Some(PodEvent::Upsert(record));
    }
    let name = detail.name.as_deref()?.trim_start_matches('/').to_string();
    let namespace = detail
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(STACK_NAMESPACE_LABEL).cloned())
        .unwrap_or_default();
    Some(PodEvent::Removed(PodKey { namespace, name }))
}

/// Converts an inspected container into a record, or `None` if it has no
/// usable address.
fn container_record(detail: &ContainerInspectResponse, network_name: Option<&str>) -> Option<PodRecord> {
    let name = detail.name.as_deref()?.trim_start_matches('/').to_string();
    let address = ip_for_network(detail, network_name)?;
    let labels: BTreeMap<String, String> = detail
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default()
        .into_iter()
        .collect();
    let namespace = labels.get(STACK_NAMESPACE_LABEL).cloned().unwrap_or_default();

    let state = detail.state.as_ref();
    let running = state.and_then(|s| s.running).unwrap_or(false);
    let unhealthy = state
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status.as_ref())
        .map_or(false, |status| *status == HealthStatusEnum::UNHEALTHY);

    Some(PodRecord {
        name,
        namespace,
        address,
        ready: running && !unhealthy,
        labels,
    })
}

fn ip_for_network(detail: &ContainerInspectResponse, network_name: Option<&str>) -> Option<IpAddr> {
    let networks = detail.network_settings.as_ref()?.networks.as_ref()?;

    let candidates: Vec<_> = match network_name {
        Some(name) => networks.get(name).into_iter().collect(),
        None => {
            // Deterministic pick when no network is configured.
            let mut all: Vec<_> = networks.iter().collect();
            all.sort_by(|a, b| a.0.cmp(b.0));
            all.into_iter().map(|(_, net)| net).collect()
        }
    };

    for net in candidates {
        for raw in [&net.ip_address, &net.global_ipv6_address].into_iter().flatten() {
            if let Ok(ip) = raw.parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    None
}
