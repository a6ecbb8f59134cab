//! Ceph RBD-backed volumes
//!
//! Volumes are RBD images named by volume id; the qemu rbd protocol path
//! (`rbd:pool/image`) goes straight into the domain XML.

use async_trait::async_trait;
use ironhive_common::{Error, Result};
use tracing::debug;

use super::driver::{CancelFlag, StorageDriver, VolumeInfo};
use super::{fetch_source, run_tool};

pub struct CephDriver {
    pool: String,
    user: String,
}

impl CephDriver {
    pub fn new(pool: &str, user: &str) -> Self {
        Self {
            pool: pool.to_string(),
            user: user.to_string(),
        }
    }

    fn image_ref(&self, volume_id: &str) -> String {
        format!("{}/{}", self.pool, volume_id)
    }

    async fn image_exists(&self, volume_id: &str) -> bool {
        run_tool(
            "rbd",
            &["info", &self.image_ref(volume_id), "--id", &self.user],
        )
        .await
        .is_ok()
    }

    async fn image_size_gb(&self, volume_id: &str) -> Result<u64> {
        let json = run_tool(
            "rbd",
            &[
                "info",
                &self.image_ref(volume_id),
                "--id",
                &self.user,
                "--format",
                "json",
            ],
        )
        .await?;
        let info: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| Error::Storage(format!("bad rbd info output: {}", e)))?;
        let bytes = info.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
        Ok(bytes.div_ceil(1024 * 1024 * 1024))
    }
}

#[async_trait]
impl StorageDriver for CephDriver {
    async fn ensure_ready(&self) -> Result<()> {
        // Cluster reachability check; no local state to set up.
        run_tool("rbd", &["ls", &self.pool, "--id", &self.user]).await?;
        Ok(())
    }

    fn volume_path(&self, volume_id: &str, _format: &str) -> String {
        format!("rbd:{}/{}", self.pool, volume_id)
    }

    async fn create_volume(
        &self,
        volume_id: &str,
        size_gb: u64,
        _format: &str,
        source: Option<&str>,
        cancelled: CancelFlag,
    ) -> Result<VolumeInfo> {
        if self.image_exists(volume_id).await {
            debug!(volume = volume_id, "rbd image already exists");
        } else {
            run_tool(
                "rbd",
                &[
                    "create",
                    &self.image_ref(volume_id),
                    "--size",
                    &format!("{}G", size_gb),
                    "--id",
                    &self.user,
                ],
            )
            .await?;
        }

        if let Some(url) = source {
            let scratch = format!("/var/tmp/ironhive-fetch-{}", volume_id);
            fetch_source(url, &scratch, &cancelled).await?;
            run_tool(
                "qemu-img",
                &[
                    "convert",
                    "-O",
                    "raw",
                    &scratch,
                    &self.volume_path(volume_id, "raw"),
                ],
            )
            .await?;
            let _ = tokio::fs::remove_file(&scratch).await;
        }

        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            path: self.volume_path(volume_id, "raw"),
            size_gb,
            format: "raw".to_string(),
        })
    }

    async fn delete_volume(&self, volume_id: &str, _format: &str) -> Result<()> {
        if !self.image_exists(volume_id).await {
            return Ok(());
        }
        run_tool(
            "rbd",
            &["rm", &self.image_ref(volume_id), "--id", &self.user],
        )
        .await?;
        Ok(())
    }

    async fn resize_volume(&self, volume_id: &str, _format: &str, new_size_gb: u64) -> Result<()> {
        run_tool(
            "rbd",
            &[
                "resize",
                &self.image_ref(volume_id),
                "--size",
                &format!("{}G", new_size_gb),
                "--id",
                &self.user,
            ],
        )
        .await?;
        Ok(())
    }

    async fn clone_volume(
        &self,
        source_id: &str,
        clone_id: &str,
        _format: &str,
    ) -> Result<VolumeInfo> {
        run_tool(
            "rbd",
            &[
                "cp",
                &self.image_ref(source_id),
                &self.image_ref(clone_id),
                "--id",
                &self.user,
            ],
        )
        .await?;
        let size_gb = self.image_size_gb(clone_id).await?;
        Ok(VolumeInfo {
            volume_id: clone_id.to_string(),
            path: self.volume_path(clone_id, "raw"),
            size_gb,
            format: "raw".to_string(),
        })
    }

    async fn describe_volume(
        &self,
        volume_id: &str,
        _format: &str,
    ) -> Result<Option<VolumeInfo>> {
        if !self.image_exists(volume_id).await {
            return Ok(None);
        }
        let size_gb = self.image_size_gb(volume_id).await?;
        Ok(Some(VolumeInfo {
            volume_id: volume_id.to_string(),
            path: self.volume_path(volume_id, "raw"),
            size_gb,
            format: "raw".to_string(),
        }))
    }

    async fn snapshot_create(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        run_tool(
            "rbd",
            &[
                "snap",
                "create",
                &format!("{}@{}", self.image_ref(volume_id), tag),
                "--id",
                &self.user,
            ],
        )
        .await?;
        Ok(())
    }

    async fn snapshot_delete(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        run_tool(
            "rbd",
            &[
                "snap",
                "rm",
                &format!("{}@{}", self.image_ref(volume_id), tag),
                "--id",
                &self.user,
            ],
        )
        .await?;
        Ok(())
    }

    async fn snapshot_restore(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        run_tool(
            "rbd",
            &[
                "snap",
                "rollback",
                &format!("{}@{}", self.image_ref(volume_id), tag),
                "--id",
                &self.user,
            ],
        )
        .await?;
        Ok(())
    }

    fn driver_type(&self) -> &'static str {
        "ceph"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rbd_paths() {
        let driver = CephDriver::new("vms", "ironhive");
        assert_eq!(driver.volume_path("vol-1", "raw"), "rbd:vms/vol-1");
        assert_eq!(driver.image_ref("vol-1"), "vms/vol-1");
        assert_eq!(driver.driver_type(), "ceph");
    }
}
