//! podpeer daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

mod adapter;
mod backoff;
mod bootstrap;
mod config;
mod error;
mod health;
mod inventory;
mod observer;
mod peers;
mod reconciler;
mod selector;
mod shutdown;
mod store;
#[cfg(test)]
mod testing;
mod types;

use adapter::RecordStoreAdapter;
use backoff::Backoff;
use bootstrap::BootstrapGate;
use config::{Config, InventoryBackend};
use health::{run_health_server, Health};
use inventory::{DockerInventory, KubeInventory, PodInventory};
use observer::MembershipObserver;
use peers::{ConfigMapPeerWriter, FilePeerWriter, PeerSink, PeerSnapshotWriter};
use reconciler::Reconciler;
use selector::LabelSelector;
use store::{PowerDnsStore, RecordStore};
use types::VersionedSnapshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!(
        "Starting podpeer: selector {:?}, {:?} inventory, zone {}, artifacts in {}",
        cfg.selector,
        cfg.inventory.backend,
        cfg.store.zone,
        cfg.artifact.dir.display()
    );

    let selector = LabelSelector::parse(&cfg.selector)?;
    let retry_backoff = Backoff::from(cfg.retry_backoff);

    // A kube client is needed for the Kubernetes inventory and for the
    // ConfigMap sink, whichever backend is in use.
    let needs_kube = cfg.inventory.backend == InventoryBackend::Kubernetes || cfg.artifact.config_map.is_some();
    let kube_client = if needs_kube {
        Some(kube::Client::try_default().await?)
    } else {
        None
    };

    let inventory: Arc<dyn PodInventory> = match (cfg.inventory.backend, &kube_client) {
        (InventoryBackend::Kubernetes, Some(client)) => {
            Arc::new(KubeInventory::new(client.clone(), &cfg.inventory.namespaces, &selector))
        }
        _ => Arc::new(DockerInventory::new(cfg.inventory.network.clone(), selector.clone())?),
    };

    let store: Arc<dyn RecordStore> = Arc::new(PowerDnsStore::new(&cfg.store, cfg.call_timeout())?);

    let mut sinks: Vec<Arc<dyn PeerSink>> = vec![Arc::new(FilePeerWriter::new(
        cfg.artifact.dir.clone(),
        &cfg.artifact.text_file,
        &cfg.artifact.json_file,
    ))];
    if let (Some(target), Some(client)) = (&cfg.artifact.config_map, &kube_client) {
        sinks.push(Arc::new(ConfigMapPeerWriter::new(
            client.clone(),
            &target.namespace,
            &target.name,
            &cfg.artifact.text_file,
            &cfg.artifact.json_file,
        )));
    }

    let (trigger, shutdown) = shutdown::channel();
    let health = Health::default();

    let health_handle = cfg.health.bind.map(|bind| {
        let health = health.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(bind, health, shutdown).await {
                error!("Health endpoint failed: {}", e);
            }
        })
    });

    // Membership observer
    let (snapshot_tx, snapshot_rx) = watch::channel(VersionedSnapshot::default());
    let observer = MembershipObserver::new(
        inventory,
        selector,
        cfg.readiness,
        cfg.debounce_window(),
        cfg.call_timeout(),
        cfg.reconcile_period(),
        retry_backoff.clone(),
    );
    let observer_handle = tokio::spawn(observer.run(snapshot_tx, shutdown.clone()));

    // Bootstrap gate, then the reconciliation loop
    let adapter = RecordStoreAdapter::new(store.clone(), &cfg.store.zone, &cfg.store.record_prefix, cfg.store.ttl);
    let reconciler = Reconciler::new(
        adapter,
        PeerSnapshotWriter::new(sinks),
        health.clone(),
        cfg.reconcile_period(),
        cfg.call_timeout(),
        retry_backoff.clone(),
    );
    let mut gate = BootstrapGate::new(store, cfg.bootstrap_deadline(), cfg.call_timeout(), retry_backoff);
    let loop_shutdown = shutdown.clone();
    let loop_handle = tokio::spawn(async move {
        let mut shutdown = loop_shutdown;
        if let Some(ready) = gate.pass(&health, &mut shutdown).await {
            reconciler.run(ready, snapshot_rx, shutdown).await;
        }
    });

    wait_for_signal().await;
    trigger.trigger();

    for (name, handle) in [("observer", observer_handle), ("reconciler", loop_handle)] {
        if let Err(e) = handle.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    if let Some(handle) = health_handle {
        if let Err(e) = handle.await {
            warn!("health task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {}", e);
            return wait_for_ctrl_c().await;
        }
    };
    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}
