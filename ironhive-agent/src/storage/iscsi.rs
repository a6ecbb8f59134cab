//! iSCSI-backed volumes
//!
//! The target's LUN is formatted and mounted by the operator; volumes are
//! image files on that filesystem, so everything past the session login
//! reuses the qemu-img file operations.

use async_trait::async_trait;
use ironhive_common::{Error, Result};

use super::driver::{CancelFlag, StorageDriver, VolumeInfo};
use super::nfs::image;
use super::run_tool;

pub struct IscsiDriver {
    portal: String,
    target: String,
    mount_point: String,
}

impl IscsiDriver {
    pub fn new(portal: &str, target: &str, mount_point: &str) -> Self {
        Self {
            portal: portal.to_string(),
            target: target.to_string(),
            mount_point: mount_point.to_string(),
        }
    }

    async fn session_active(&self) -> bool {
        match run_tool("iscsiadm", &["-m", "session"]).await {
            Ok(out) => out.contains(&self.target),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl StorageDriver for IscsiDriver {
    async fn ensure_ready(&self) -> Result<()> {
        if !self.session_active().await {
            run_tool(
                "iscsiadm",
                &[
                    "-m", "node", "-T", &self.target, "-p", &self.portal, "--login",
                ],
            )
            .await?;
        }
        if !tokio::fs::try_exists(&self.mount_point).await.unwrap_or(false) {
            return Err(Error::Storage(format!(
                "iscsi mount point {} does not exist",
                self.mount_point
            )));
        }
        Ok(())
    }

    fn volume_path(&self, volume_id: &str, format: &str) -> String {
        format!("{}/{}.{}", self.mount_point, volume_id, format)
    }

    async fn create_volume(
        &self,
        volume_id: &str,
        size_gb: u64,
        format: &str,
        source: Option<&str>,
        cancelled: CancelFlag,
    ) -> Result<VolumeInfo> {
        self.ensure_ready().await?;
        let path = self.volume_path(volume_id, format);
        match source {
            Some(url) => {
                image::create_from_source(&path, format, size_gb, url, &cancelled).await?
            }
            None => image::create(&path, format, size_gb).await?,
        }
        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            path,
            size_gb,
            format: format.to_string(),
        })
    }

    async fn delete_volume(&self, volume_id: &str, format: &str) -> Result<()> {
        self.ensure_ready().await?;
        let path = self.volume_path(volume_id, format);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to delete {}: {}", path, e))),
        }
    }

    async fn resize_volume(&self, volume_id: &str, format: &str, new_size_gb: u64) -> Result<()> {
        self.ensure_ready().await?;
        image::resize(&self.volume_path(volume_id, format), format, new_size_gb).await
    }

    async fn clone_volume(
        &self,
        source_id: &str,
        clone_id: &str,
        format: &str,
    ) -> Result<VolumeInfo> {
        self.ensure_ready().await?;
        let source = self.volume_path(source_id, format);
        let clone = self.volume_path(clone_id, format);
        run_tool("qemu-img", &["convert", "-O", format, &source, &clone]).await?;
        let size_gb = image::virtual_size_gb(&clone).await?;
        Ok(VolumeInfo {
            volume_id: clone_id.to_string(),
            path: clone,
            size_gb,
            format: format.to_string(),
        })
    }

    async fn describe_volume(
        &self,
        volume_id: &str,
        format: &str,
    ) -> Result<Option<VolumeInfo>> {
        self.ensure_ready().await?;
        let path = self.volume_path(volume_id, format);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let size_gb = image::virtual_size_gb(&path).await?;
        Ok(Some(VolumeInfo {
            volume_id: volume_id.to_string(),
            path,
            size_gb,
            format: format.to_string(),
        }))
    }

    async fn snapshot_create(&self, volume_id: &str, format: &str, tag: &str) -> Result<()> {
        self.ensure_ready().await?;
        image::snapshot_create(&self.volume_path(volume_id, format), tag).await
    }

    async fn snapshot_delete(&self, volume_id: &str, format: &str, tag: &str) -> Result<()> {
        self.ensure_ready().await?;
        image::snapshot_delete(&self.volume_path(volume_id, format), tag).await
    }

    async fn snapshot_restore(&self, volume_id: &str, format: &str, tag: &str) -> Result<()> {
        self.ensure_ready().await?;
        image::snapshot_apply(&self.volume_path(volume_id, format), tag).await
    }

    fn driver_type(&self) -> &'static str {
        "iscsi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_path_layout() {
        let driver = IscsiDriver::new(
            "10.0.0.9:3260",
            "iqn.2026-01.io.ironhive:vms",
            "/mnt/ironhive/iscsi0",
        );
        assert_eq!(
            driver.volume_path("vol-1", "qcow2"),
            "/mnt/ironhive/iscsi0/vol-1.qcow2"
        );
        assert_eq!(driver.driver_type(), "iscsi");
    }
}
