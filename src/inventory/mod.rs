use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::error::InventoryError;
use crate::types::{PodEvent, PodRecord};

pub mod docker;
pub mod kubernetes;
pub use self::docker::DockerInventory;
pub use self::kubernetes::KubeInventory;

/// Incremental pod notifications following a [`Listing`].
pub type EventStream = BoxStream<'static, Result<PodEvent, InventoryError>>;

/// Opaque position to resume watching from, produced by a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resume(pub Vec<String>);

/// A full listing of the pods matching the selector.
#[derive(Debug, Default)]
pub struct Listing {
    pub pods: Vec<PodRecord>,
    pub resume: Resume,
}

#[async_trait]
pub trait PodInventory: Send + Sync {
    /// List every pod currently matching the selector.  Pods that cannot
    /// be published (no address yet, terminal phase) are left out.
    async fn list(&self) -> Result<Listing, InventoryError>;

    /// Start watching for changes after `resume`.  The stream ending, or
    /// yielding an error, means the caller must list again.
    async fn watch(&self, resume: &Resume) -> Result<EventStream, InventoryError>;
}

/// Interleaves several watches into one stream that ends as soon as any
/// of them ends, so the caller re-lists instead of going half blind.
pub fn merge_watches(streams: Vec<EventStream>) -> EventStream {
    let tagged = streams
        .into_iter()
        .map(|s| s.map(Some).chain(stream::once(future::ready(None))));
    stream::select_all(tagged)
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
        .boxed()
}
