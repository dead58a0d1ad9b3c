// repository/chain.rs
//
// Chain bookkeeping: the ordered sequence of images rooted at one full
// backup for a (context, disk, repository) triple.

use crate::db::queries;
use crate::models::{BackupChain, BackupJob};
use crate::repository::error::RepositoryError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;

/// Derives the stable chain id from the root full backup and its disk.
pub fn chain_id(
    context_id: &str,
    disk_ordinal: i32,
    repository_id: &str,
    full_backup_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context_id.as_bytes());
    hasher.update(b"|");
    hasher.update(disk_ordinal.to_le_bytes());
    hasher.update(b"|");
    hasher.update(repository_id.as_bytes());
    hasher.update(b"|");
    hasher.update(full_backup_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Manages chain rows and serialises head-pointer updates.
pub struct ChainManager {
    pool: Pool<MySql>,
    /// Per-chain locks guarding finalise-time head updates.
    head_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChainManager {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self {
            pool,
            head_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The lock serialising updates to one chain's head pointer.
    pub fn head_lock(&self, chain_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.head_locks
                .lock()
                .entry(chain_id.to_string())
                .or_default(),
        )
    }

    /// Registers the chain created by a completed full backup. A previous
    /// chain for the triple, if any, is closed by the new root.
    pub async fn register_chain(
        &self,
        full_backup: &BackupJob,
        image_size: i64,
    ) -> Result<String, RepositoryError> {
        let id = chain_id(
            &full_backup.context_id,
            full_backup.disk_ordinal,
            &full_backup.repository_id,
            &full_backup.id,
        );

        queries::chain::register_chain(
            &self.pool,
            &id,
            &full_backup.context_id,
            full_backup.disk_ordinal,
            &full_backup.repository_id,
            &full_backup.id,
            image_size,
        )
        .await?;

        Ok(id)
    }

    /// Appends a completed incremental to its chain tip.
    pub async fn append_to_chain(
        &self,
        chain_id: &str,
        child_backup_id: &str,
        image_size: i64,
    ) -> Result<(), RepositoryError> {
        queries::chain::append_to_chain(&self.pool, chain_id, child_backup_id, image_size)
            .await?;
        Ok(())
    }

    /// Gets the open chain for a triple, if any.
    pub async fn get_chain(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        repository_id: &str,
    ) -> Result<Option<BackupChain>, RepositoryError> {
        Ok(queries::chain::get_chain(&self.pool, context_id, disk_ordinal, repository_id).await?)
    }

    /// Lists a chain's members ordered root..tip.
    pub async fn list_chain(
        &self,
        context_id: &str,
        disk_ordinal: i32,
        repository_id: &str,
    ) -> Result<Vec<BackupJob>, RepositoryError> {
        let chain = self
            .get_chain(context_id, disk_ordinal, repository_id)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!(
                    "no chain for {}/disk{} in {}",
                    context_id, disk_ordinal, repository_id
                ))
            })?;

        Ok(queries::chain::list_chain_members(&self.pool, &chain).await?)
    }

    /// Removes a chain row once its root is deleted.
    pub async fn delete_chain(&self, chain_id: &str) -> Result<(), RepositoryError> {
        queries::chain::delete_chain(&self.pool, chain_id).await?;
        self.head_locks.lock().remove(chain_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_is_stable_and_distinct() {
        let a = chain_id("ctx-1", 0, "repo-1", "bk-1");
        let b = chain_id("ctx-1", 0, "repo-1", "bk-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_ne!(a, chain_id("ctx-1", 1, "repo-1", "bk-1"));
        assert_ne!(a, chain_id("ctx-1", 0, "repo-2", "bk-1"));
        assert_ne!(a, chain_id("ctx-1", 0, "repo-1", "bk-2"));
    }
}
