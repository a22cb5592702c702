use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use log::debug;

use super::{PeerArtifact, PeerSink};
use crate::error::WriteError;
use crate::health::unix_now;

pub const LAST_UPDATE_ANNOTATION: &str = "podpeer/last-update";

/// Publishes the artifact as a ConfigMap with one key per rendering.
/// A single `replace` updates both keys together.
pub struct ConfigMapPeerWriter {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    text_key: String,
    json_key: String,
}

impl ConfigMapPeerWriter {
    pub fn new(client: Client, namespace: &str, name: &str, text_key: &str, json_key: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
            text_key: text_key.to_string(),
            json_key: json_key.to_string(),
        }
    }

    fn data(&self, artifact: &PeerArtifact) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.text_key.clone(), artifact.text.clone()),
            (self.json_key.clone(), artifact.json.clone()),
        ])
    }
}

fn map_kube_error(action: &str, err: kube::Error) -> WriteError {
    match err {
        kube::Error::Api(resp) if resp.code == 403 || resp.code == 401 => {
            WriteError::PermissionDenied(format!("{}: {}", action, resp.message))
        }
        other => WriteError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{}: {}", action, other),
        )),
    }
}

#[async_trait]
impl PeerSink for ConfigMapPeerWriter {
    fn describe(&self) -> String {
        format!("configmap {}/{}", self.namespace, self.name)
    }

    async fn publish(&self, artifact: &PeerArtifact) -> Result<(), WriteError> {
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| map_kube_error("get configmap", e))?;

        let stamp = unix_now().to_string();
        match existing {
            Some(mut cm) => {
                cm.data = Some(self.data(artifact));
                cm.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(LAST_UPDATE_ANNOTATION.to_string(), stamp);
                self.api
                    .replace(&self.name, &PostParams::default(), &cm)
                    .await
                    .map_err(|e| map_kube_error("replace configmap", e))?;
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        annotations: Some(BTreeMap::from([(LAST_UPDATE_ANNOTATION.to_string(), stamp)])),
                        ..Default::default()
                    },
                    data: Some(self.data(artifact)),
                    ..Default::default()
                };
                self.api
                    .create(&PostParams::default(), &cm)
                    .await
                    .map_err(|e| map_kube_error("create configmap", e))?;
            }
        }
        debug!("Updated {}", self.describe());
        Ok(())
    }

    async fn is_current(&self, artifact: &PeerArtifact) -> Result<bool, WriteError> {
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| map_kube_error("get configmap", e))?;
        Ok(existing.and_then(|cm| cm.data).as_ref() == Some(&self.data(artifact)))
    }
}
