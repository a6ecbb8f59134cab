//! Storage driver contract

use async_trait::async_trait;
use ironhive_common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Polled by long-running work (source fetches) so an advisory
/// `rpc.cancel` can abandon the job between chunks
pub type CancelFlag = Arc<dyn Fn() -> bool + Send + Sync>;

/// A created or described volume as the driver sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub path: String,
    pub size_gb: u64,
    pub format: String,
}

/// Uniform interface over the storage backends. Operations are expected
/// to converge: creating something that exists or deleting something
/// already gone must not fail.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Make the backend usable on this host (mount, login); idempotent
    async fn ensure_ready(&self) -> Result<()>;

    /// Resolved backing path for a volume id
    fn volume_path(&self, volume_id: &str, format: &str) -> String;

    async fn create_volume(
        &self,
        volume_id: &str,
        size_gb: u64,
        format: &str,
        source: Option<&str>,
        cancelled: CancelFlag,
    ) -> Result<VolumeInfo>;

    async fn delete_volume(&self, volume_id: &str, format: &str) -> Result<()>;

    async fn resize_volume(&self, volume_id: &str, format: &str, new_size_gb: u64) -> Result<()>;

    async fn clone_volume(
        &self,
        source_id: &str,
        clone_id: &str,
        format: &str,
    ) -> Result<VolumeInfo>;

    /// Whether the backing store exists and how big it is
    async fn describe_volume(&self, volume_id: &str, format: &str)
        -> Result<Option<VolumeInfo>>;

    /// Offline snapshot through the image tool
    async fn snapshot_create(&self, volume_id: &str, format: &str, tag: &str) -> Result<()>;

    async fn snapshot_delete(&self, volume_id: &str, format: &str, tag: &str) -> Result<()>;

    async fn snapshot_restore(&self, volume_id: &str, format: &str, tag: &str) -> Result<()>;

    fn driver_type(&self) -> &'static str;
}
