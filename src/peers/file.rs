use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;

use super::{PeerArtifact, PeerSink};
use crate::error::WriteError;

/// Writes `peers.txt` / `peers.json` into a directory served read-only by
/// the HTTP exposer.
pub struct FilePeerWriter {
    dir: PathBuf,
    text_path: PathBuf,
    json_path: PathBuf,
}

impl FilePeerWriter {
    pub fn new(dir: impl Into<PathBuf>, text_file: &str, json_file: &str) -> Self {
        let dir = dir.into();
        Self {
            text_path: dir.join(text_file),
            json_path: dir.join(json_file),
            dir,
        }
    }
}

#[async_trait]
impl PeerSink for FilePeerWriter {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    async fn publish(&self, artifact: &PeerArtifact) -> Result<(), WriteError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WriteError::from_io("create artifact dir", e))?;

        write_atomic(&self.text_path, artifact.text.as_bytes()).await?;
        write_atomic(&self.json_path, artifact.json.as_bytes()).await?;
        debug!("Saved peer artifact to {:?}", self.dir);
        Ok(())
    }

    async fn is_current(&self, artifact: &PeerArtifact) -> Result<bool, WriteError> {
        for (path, expected) in [(&self.text_path, &artifact.text), (&self.json_path, &artifact.json)] {
            match tokio::fs::read(path).await {
                Ok(bytes) if bytes == expected.as_bytes() => {}
                Ok(_) => return Ok(false),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(WriteError::from_io("read artifact", e)),
            }
        }
        Ok(true)
    }
}

/// Write to a temp file next to `path`, sync, then rename over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let result = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(WriteError::from_io(&format!("write {}", path.display()), e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pod;
    use crate::types::MembershipSnapshot;
    use tempfile::tempdir;

    fn artifact(pods: usize, base: u8) -> PeerArtifact {
        let records = (0..pods).map(|i| pod(&format!("p{}", i), &format!("10.{}.{}.{}", base, i / 250, i % 250)));
        PeerArtifact::render(&MembershipSnapshot::from_records(records)).unwrap()
    }

    #[tokio::test]
    async fn publish_creates_both_files() {
        let dir = tempdir().unwrap();
        let writer = FilePeerWriter::new(dir.path().join("nested"), "peers.txt", "peers.json");
        let a = artifact(2, 1);

        assert!(!writer.is_current(&a).await.unwrap());
        writer.publish(&a).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("nested/peers.txt")).unwrap();
        assert_eq!(text, a.text);
        assert!(writer.is_current(&a).await.unwrap());
        assert!(!writer.is_current(&artifact(3, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let dir = tempdir().unwrap();
        let writer = FilePeerWriter::new(dir.path(), "peers.txt", "peers.json");
        writer.publish(&artifact(1, 1)).await.unwrap();
        writer.publish(&artifact(2, 1)).await.unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["peers.json", "peers.txt"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_observe_a_partial_file() {
        let dir = tempdir().unwrap();
        let writer = FilePeerWriter::new(dir.path(), "peers.txt", "peers.json");
        let old = artifact(2000, 1);
        let new = artifact(2000, 2);
        writer.publish(&old).await.unwrap();

        let path = dir.path().join("peers.txt");
        let expected = [old.text.clone(), new.text.clone()];
        let reader = tokio::spawn(async move {
            for _ in 0..200 {
                let seen = tokio::fs::read_to_string(&path).await.unwrap();
                assert!(expected.contains(&seen), "observed a torn peer list");
                tokio::task::yield_now().await;
            }
        });

        for i in 0..50 {
            let next = if i % 2 == 0 { &new } else { &old };
            writer.publish(next).await.unwrap();
        }
        reader.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_only_directory_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
        // Root ignores directory permissions.
        if std::fs::write(dir.path().join("write-check"), b"x").is_ok() {
            return;
        }
        let writer = FilePeerWriter::new(dir.path(), "peers.txt", "peers.json");
        let err = writer.publish(&artifact(1, 1)).await.unwrap_err();
        assert!(matches!(err, WriteError::PermissionDenied(_)));
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
