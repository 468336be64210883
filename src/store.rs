use crate::types::{PipelineError, Result, Stage};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Stage-keyed artifact cache backed by one directory per stage.
///
/// Writes go through a temp file and an atomic rename, so concurrent readers
/// either see a complete artifact or none at all. Distinct keys never contend;
/// the same key resolves last-writer-wins, which is safe because every
/// artifact is reproducible from its inputs.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for stage in [Stage::Pdf, Stage::Markdown, Stage::Summary, Stage::Tags] {
            std::fs::create_dir_all(root.join(stage.dir_name()))?;
        }
        info!("Artifact store at {}", root.display());
        Ok(Self { root })
    }

    fn path_for(&self, stage: Stage, paper_id: &str) -> PathBuf {
        self.root
            .join(stage.dir_name())
            .join(format!("{}.{}", paper_id, stage.extension()))
    }

    /// Whether an artifact exists for `(stage, paper_id)`.
    pub async fn has(&self, stage: Stage, paper_id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(stage, paper_id))
            .await
            .unwrap_or(false)
    }

    /// Read an artifact, or `NotFound` if it was never cached.
    pub async fn get(&self, stage: Stage, paper_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(stage, paper_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::NotFound {
                stage,
                paper_id: paper_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an artifact as UTF-8 text.
    pub async fn get_string(&self, stage: Stage, paper_id: &str) -> Result<String> {
        let bytes = self.get(stage, paper_id).await?;
        String::from_utf8(bytes).map_err(|e| {
            PipelineError::Extraction(format!("artifact {}/{} is not UTF-8: {}", stage, paper_id, e))
        })
    }

    /// Store an artifact atomically: either the full payload becomes visible
    /// under the final name, or nothing does.
    pub async fn put(&self, stage: Stage, paper_id: &str, payload: &[u8]) -> Result<()> {
        let final_path = self.path_for(stage, paper_id);
        let tmp_path = final_path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        tokio::fs::write(&tmp_path, payload).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(
            "Cached {}/{} ({} bytes)",
            stage,
            paper_id,
            payload.len()
        );
        Ok(())
    }

    /// Remove a cached artifact if present. Used by forced refreshes.
    pub async fn remove(&self, stage: Stage, paper_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(stage, paper_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate the paper ids cached for a stage, in name order.
    pub async fn list(&self, stage: Stage) -> Result<Vec<String>> {
        let dir = self.root.join(stage.dir_name());
        let suffix = format!(".{}", stage.extension());
        let mut ids = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(&suffix) {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        assert!(!store.has(Stage::Pdf, "2506.00001").await);
        store.put(Stage::Pdf, "2506.00001", b"%PDF-1.4 data").await.unwrap();
        assert!(store.has(Stage::Pdf, "2506.00001").await);
        assert_eq!(
            store.get(Stage::Pdf, "2506.00001").await.unwrap(),
            b"%PDF-1.4 data"
        );
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let err = store.get(Stage::Summary, "nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn same_key_is_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        store.put(Stage::Markdown, "p", b"first").await.unwrap();
        store.put(Stage::Markdown, "p", b"second").await.unwrap();
        assert_eq!(store.get(Stage::Markdown, "p").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        store.put(Stage::Summary, "b", b"x").await.unwrap();
        store.put(Stage::Summary, "a", b"y").await.unwrap();
        std::fs::write(dir.path().join("summary/stray.txt"), b"z").unwrap();

        assert_eq!(store.list(Stage::Summary).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn concurrent_puts_to_distinct_keys_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(ArtifactStore::open(dir.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("paper-{}", i);
                store
                    .put(Stage::Markdown, &id, format!("body {}", i).as_bytes())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for i in 0..16 {
            let id = format!("paper-{}", i);
            assert_eq!(
                store.get_string(Stage::Markdown, &id).await.unwrap(),
                format!("body {}", i)
            );
        }
    }
}
