//! LVM-backed volumes
//!
//! Volumes are logical volumes named by volume id inside the pool's
//! volume group. Format is always raw; snapshots are LVM snapshot LVs
//! and restore merges the snapshot back into the origin.

use async_trait::async_trait;
use ironhive_common::{Error, Result};
use tracing::debug;

use super::driver::{CancelFlag, StorageDriver, VolumeInfo};
use super::{fetch_source, run_tool};

pub struct LvmDriver {
    volume_group: String,
}

impl LvmDriver {
    pub fn new(volume_group: &str) -> Self {
        Self {
            volume_group: volume_group.to_string(),
        }
    }

    fn lv_ref(&self, volume_id: &str) -> String {
        format!("{}/{}", self.volume_group, volume_id)
    }

    fn snapshot_name(volume_id: &str, tag: &str) -> String {
        format!("{}-{}", volume_id, tag)
    }

    async fn lv_exists(&self, volume_id: &str) -> bool {
        run_tool("lvs", &["--noheadings", &self.lv_ref(volume_id)])
            .await
            .is_ok()
    }

    async fn lv_size_gb(&self, volume_id: &str) -> Result<u64> {
        let out = run_tool(
            "lvs",
            &[
                "--noheadings",
                "--units",
                "g",
                "--nosuffix",
                "-o",
                "lv_size",
                &self.lv_ref(volume_id),
            ],
        )
        .await?;
        out.trim()
            .parse::<f64>()
            .map(|g| g.ceil() as u64)
            .map_err(|e| Error::Storage(format!("bad lv size '{}': {}", out.trim(), e)))
    }
}

#[async_trait]
impl StorageDriver for LvmDriver {
    async fn ensure_ready(&self) -> Result<()> {
        // The volume group must already exist; activate it in case the
        // host just booted.
        run_tool("vgchange", &["-ay", &self.volume_group]).await?;
        Ok(())
    }

    fn volume_path(&self, volume_id: &str, _format: &str) -> String {
        format!("/dev/{}/{}", self.volume_group, volume_id)
    }

    async fn create_volume(
        &self,
        volume_id: &str,
        size_gb: u64,
        _format: &str,
        source: Option<&str>,
        cancelled: CancelFlag,
    ) -> Result<VolumeInfo> {
        self.ensure_ready().await?;
        if self.lv_exists(volume_id).await {
            debug!(volume = volume_id, "logical volume already exists");
        } else {
            run_tool(
                "lvcreate",
                &[
                    "-y",
                    "-L",
                    &format!("{}G", size_gb),
                    "-n",
                    volume_id,
                    &self.volume_group,
                ],
            )
            .await?;
        }

        let path = self.volume_path(volume_id, "raw");
        if let Some(url) = source {
            let scratch = format!("/var/tmp/ironhive-fetch-{}", volume_id);
            fetch_source(url, &scratch, &cancelled).await?;
            run_tool("qemu-img", &["convert", "-O", "raw", &scratch, &path]).await?;
            let _ = tokio::fs::remove_file(&scratch).await;
        }

        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            path,
            size_gb,
            format: "raw".to_string(),
        })
    }

    async fn delete_volume(&self, volume_id: &str, _format: &str) -> Result<()> {
        if !self.lv_exists(volume_id).await {
            return Ok(());
        }
        run_tool("lvremove", &["-f", &self.lv_ref(volume_id)]).await?;
        Ok(())
    }

    async fn resize_volume(&self, volume_id: &str, _format: &str, new_size_gb: u64) -> Result<()> {
        run_tool(
            "lvextend",
            &["-L", &format!("{}G", new_size_gb), &self.lv_ref(volume_id)],
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
        self.ensure_ready().await?;
        let size_gb = self.lv_size_gb(source_id).await?;
        run_tool(
            "lvcreate",
            &[
                "-y",
                "-L",
                &format!("{}G", size_gb),
                "-n",
                clone_id,
                &self.volume_group,
            ],
        )
        .await?;
        run_tool(
            "qemu-img",
            &[
                "convert",
                "-O",
                "raw",
                &self.volume_path(source_id, "raw"),
                &self.volume_path(clone_id, "raw"),
            ],
        )
        .await?;
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
        if !self.lv_exists(volume_id).await {
            return Ok(None);
        }
        let size_gb = self.lv_size_gb(volume_id).await?;
        Ok(Some(VolumeInfo {
            volume_id: volume_id.to_string(),
            path: self.volume_path(volume_id, "raw"),
            size_gb,
            format: "raw".to_string(),
        }))
    }

    async fn snapshot_create(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        run_tool(
            "lvcreate",
            &[
                "-y",
                "-s",
                "-n",
                &Self::snapshot_name(volume_id, tag),
                "-l",
                "20%ORIGIN",
                &self.volume_path(volume_id, "raw"),
            ],
        )
        .await?;
        Ok(())
    }

    async fn snapshot_delete(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        let name = Self::snapshot_name(volume_id, tag);
        run_tool(
            "lvremove",
            &["-f", &format!("{}/{}", self.volume_group, name)],
        )
        .await?;
        Ok(())
    }

    async fn snapshot_restore(&self, volume_id: &str, _format: &str, tag: &str) -> Result<()> {
        // Merge folds the snapshot back into the origin and removes it.
        let name = Self::snapshot_name(volume_id, tag);
        run_tool(
            "lvconvert",
            &["--merge", &format!("{}/{}", self.volume_group, name)],
        )
        .await?;
        Ok(())
    }

    fn driver_type(&self) -> &'static str {
        "lvm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_names() {
        let driver = LvmDriver::new("vg0");
        assert_eq!(driver.volume_path("vol-1", "raw"), "/dev/vg0/vol-1");
        assert_eq!(driver.lv_ref("vol-1"), "vg0/vol-1");
        assert_eq!(LvmDriver::snapshot_name("vol-1", "snap-a"), "vol-1-snap-a");
        assert_eq!(driver.driver_type(), "lvm");
    }
}
