//! Versioned tenant index lifecycle: build, atomic activation, cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::storage::{GraphStore, MetaStore, VectorIndex};
use crate::types::{BuildVersion, ChatbotStatus, DocumentStatus, VersionStatus};

pub struct VersionManager {
    meta: Arc<MetaStore>,
    vector: Arc<dyn VectorIndex>,
    graph: Arc<dyn GraphStore>,
    storage_root: PathBuf,
}

impl VersionManager {
    pub fn new(
        meta: Arc<MetaStore>,
        vector: Arc<dyn VectorIndex>,
        graph: Arc<dyn GraphStore>,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            meta,
            vector,
            graph,
            storage_root,
        }
    }

    /// Open the version an incoming document should build into. The latest
    /// version is reused while it is still `building`; otherwise a new one
    /// opens (N+1). Returns (version, freshly_created) so the orchestrator
    /// can carry still-present older documents into a fresh version.
    pub async fn open_build_version(&self, chatbot_id: Uuid) -> Result<(BuildVersion, bool)> {
        let versions = self.meta.list_versions(chatbot_id).await?;
        if let Some(latest) = versions.first() {
            if latest.status == VersionStatus::Building {
                return Ok((latest.clone(), false));
            }
        }
        let version = self.meta.create_version(chatbot_id).await?;
        self.vector
            .ensure_collection(chatbot_id, version.version)
            .await?;
        Ok((version, true))
    }

    /// Called after a document finalizes. When every document of the version
    /// has completed, the version flips to ready and activates atomically;
    /// the predecessor is archived by the same transaction.
    pub async fn finalize_if_complete(&self, chatbot_id: Uuid, version: i64) -> Result<bool> {
        let documents = self.meta.documents_in_version(chatbot_id, version).await?;
        if documents.is_empty() {
            return Ok(false);
        }
        let all_done = documents
            .iter()
            .all(|d| d.status == DocumentStatus::Completed);
        if !all_done {
            return Ok(false);
        }

        self.meta
            .set_version_status(chatbot_id, version, VersionStatus::Ready)
            .await?;
        self.meta.activate_version(chatbot_id, version).await?;
        Ok(true)
    }

    /// Record a failed build. The previous active version stays active; the
    /// tenant only returns to `active` when a later version activates.
    pub async fn mark_build_failed(&self, chatbot_id: Uuid, version: i64) -> Result<()> {
        self.meta
            .set_version_status(chatbot_id, version, VersionStatus::Failed)
            .await
    }

    /// Explicit admin activation of a ready (or re-activation of an archived,
    /// via ready) version.
    pub async fn activate(&self, chatbot_id: Uuid, version: i64) -> Result<BuildVersion> {
        self.meta.activate_version(chatbot_id, version).await
    }

    /// Drop a non-active version: vector collection, graph partition, row.
    pub async fn drop_version(&self, chatbot_id: Uuid, version: i64) -> Result<()> {
        let current = self.meta.get_version(chatbot_id, version).await?;
        if current.status == VersionStatus::Active {
            return Err(RagError::conflict(format!(
                "version {version} is active and cannot be dropped"
            )));
        }
        self.vector.drop_collection(chatbot_id, version).await?;
        self.graph.delete_version(chatbot_id, version).await?;
        self.meta.delete_version(chatbot_id, version).await?;
        tracing::info!(chatbot = %chatbot_id, version, "dropped version");
        Ok(())
    }

    /// Remove every artifact of a tenant: vector collections, graph
    /// partitions, stored files, then the relational rows. Any substep
    /// failure parks the tenant in `cleanup_pending` for the janitor; the id
    /// is not reused until cleanup completes.
    pub async fn cleanup_chatbot(&self, chatbot_id: Uuid) -> Result<()> {
        let result = self.cleanup_artifacts(chatbot_id).await;
        match result {
            Ok(()) => {
                self.meta.delete_chatbot(chatbot_id).await?;
                tracing::info!(chatbot = %chatbot_id, "tenant cleanup complete");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(chatbot = %chatbot_id, error = %e, "tenant cleanup incomplete, parking");
                self.meta
                    .set_chatbot_status(chatbot_id, ChatbotStatus::CleanupPending)
                    .await?;
                Err(e)
            }
        }
    }

    async fn cleanup_artifacts(&self, chatbot_id: Uuid) -> Result<()> {
        for version in self.meta.list_versions(chatbot_id).await? {
            self.vector
                .drop_collection(chatbot_id, version.version)
                .await?;
        }
        self.graph.delete_chatbot(chatbot_id).await?;

        let dir = self.storage_root.join(chatbot_id.to_string());
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| RagError::Transient(format!("removing {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    /// Retry parked cleanups. Returns how many tenants were fully removed.
    pub async fn retry_pending_cleanups(&self) -> Result<usize> {
        let pending = self
            .meta
            .list_chatbots_with_status(ChatbotStatus::CleanupPending)
            .await?;
        let mut completed = 0;
        for chatbot in pending {
            if self.cleanup_chatbot(chatbot.id).await.is_ok() {
                completed += 1;
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::storage::SqliteGraphStore;
    use crate::types::{ChunkRecord, Persona, SearchHit};

    /// Vector index stub whose drop can be forced to fail, for the
    /// cleanup_pending path.
    #[derive(Default)]
    struct FlakyIndex {
        fail_drop: AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        async fn ensure_collection(&self, _c: Uuid, _v: i64) -> Result<()> {
            Ok(())
        }
        async fn upsert_chunks(&self, _c: Uuid, _v: i64, _chunks: &[ChunkRecord]) -> Result<()> {
            Ok(())
        }
        async fn search(
            &self,
            _c: Uuid,
            _v: i64,
            _q: &[f32],
            _k: usize,
            _t: f32,
        ) -> Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
        async fn count_chunks(&self, _c: Uuid, _v: i64, _d: Option<Uuid>) -> Result<usize> {
            Ok(0)
        }
        async fn delete_document(&self, _c: Uuid, _v: i64, _d: Uuid) -> Result<usize> {
            Ok(0)
        }
        async fn drop_collection(&self, _c: Uuid, _v: i64) -> Result<()> {
            if self.fail_drop.load(Ordering::SeqCst) {
                Err(RagError::Transient("vector store offline".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn manager(
        index: Arc<FlakyIndex>,
        root: PathBuf,
    ) -> (VersionManager, Arc<MetaStore>) {
        let meta = Arc::new(MetaStore::connect_in_memory().await.unwrap());
        let graph = {
            let store = SqliteGraphStore::new(meta.pool().clone());
            store.migrate().await.unwrap();
            Arc::new(store)
        };
        (
            VersionManager::new(meta.clone(), index, graph, root),
            meta,
        )
    }

    #[tokio::test]
    async fn test_building_version_is_reused() {
        let (manager, meta) = manager(Arc::new(FlakyIndex::default()), PathBuf::from("/tmp/none")).await;
        let chatbot = meta
            .create_chatbot("bot", "", &Persona::default(), "bot")
            .await
            .unwrap();

        let (v1, created) = manager.open_build_version(chatbot.id).await.unwrap();
        let (again, created_again) = manager.open_build_version(chatbot.id).await.unwrap();
        assert_eq!(v1.version, 1);
        assert!(created);
        assert_eq!(again.version, 1);
        assert!(!created_again);
    }

    #[tokio::test]
    async fn test_finalize_waits_for_all_documents() {
        let (manager, meta) = manager(Arc::new(FlakyIndex::default()), PathBuf::from("/tmp/none")).await;
        let chatbot = meta
            .create_chatbot("bot", "", &Persona::default(), "bot")
            .await
            .unwrap();
        let (version, _) = manager.open_build_version(chatbot.id).await.unwrap();

        let doc_a = meta
            .create_document(Uuid::new_v4(), chatbot.id, "a.pdf", "/x/a.pdf", 1, version.version)
            .await
            .unwrap();
        let doc_b = meta
            .create_document(Uuid::new_v4(), chatbot.id, "b.pdf", "/x/b.pdf", 1, version.version)
            .await
            .unwrap();

        meta.set_document_completed(doc_a.id, 1, 1).await.unwrap();
        assert!(!manager
            .finalize_if_complete(chatbot.id, version.version)
            .await
            .unwrap());
        // The tenant still has no active version mid-build.
        assert_eq!(meta.get_chatbot(chatbot.id).await.unwrap().active_version, 0);

        meta.set_document_completed(doc_b.id, 1, 1).await.unwrap();
        assert!(manager
            .finalize_if_complete(chatbot.id, version.version)
            .await
            .unwrap());
        assert_eq!(meta.get_chatbot(chatbot.id).await.unwrap().active_version, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_parks_tenant() {
        let index = Arc::new(FlakyIndex::default());
        let temp = tempfile::tempdir().unwrap();
        let (manager, meta) = manager(index.clone(), temp.path().to_path_buf()).await;
        let chatbot = meta
            .create_chatbot("bot", "", &Persona::default(), "bot")
            .await
            .unwrap();
        manager.open_build_version(chatbot.id).await.unwrap();

        index.fail_drop.store(true, Ordering::SeqCst);
        assert!(manager.cleanup_chatbot(chatbot.id).await.is_err());
        let parked = meta.get_chatbot(chatbot.id).await.unwrap();
        assert_eq!(parked.status, ChatbotStatus::CleanupPending);

        // Janitor retries once the substep recovers.
        index.fail_drop.store(false, Ordering::SeqCst);
        assert_eq!(manager.retry_pending_cleanups().await.unwrap(), 1);
        assert!(matches!(
            meta.get_chatbot(chatbot.id).await.unwrap_err(),
            RagError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_active_version_cannot_drop() {
        let (manager, meta) = manager(Arc::new(FlakyIndex::default()), PathBuf::from("/tmp/none")).await;
        let chatbot = meta
            .create_chatbot("bot", "", &Persona::default(), "bot")
            .await
            .unwrap();
        let (version, _) = manager.open_build_version(chatbot.id).await.unwrap();
        let doc = meta
            .create_document(Uuid::new_v4(), chatbot.id, "a.pdf", "/x/a.pdf", 1, version.version)
            .await
            .unwrap();
        meta.set_document_completed(doc.id, 1, 1).await.unwrap();
        manager
            .finalize_if_complete(chatbot.id, version.version)
            .await
            .unwrap();

        let err = manager.drop_version(chatbot.id, version.version).await.unwrap_err();
        assert!(matches!(err, RagError::Conflict(_)));
    }
}
