//! NFS-backed volumes
//!
//! Volumes are qcow2/raw image files inside the mounted export. The mount
//! is ensured before every operation; mounting an already-mounted export
//! is a no-op.

use async_trait::async_trait;
use ironhive_common::{Error, Result};
use tracing::{debug, info};

use super::driver::{CancelFlag, StorageDriver, VolumeInfo};
use super::{fetch_source, run_tool};

pub struct NfsDriver {
    server: String,
    export: String,
    mount_point: String,
}

impl NfsDriver {
    pub fn new(server: &str, export: &str, mount_point: &str) -> Self {
        Self {
            server: server.to_string(),
            export: export.to_string(),
            mount_point: mount_point.to_string(),
        }
    }

    async fn is_mounted(&self) -> bool {
        match tokio::fs::read_to_string("/proc/mounts").await {
            Ok(mounts) => mounts
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(self.mount_point.as_str())),
            Err(_) => false,
        }
    }
}

/// qemu-img file operations shared by the file-backed drivers
pub(crate) mod image {
    use super::*;

    pub async fn create(path: &str, format: &str, size_gb: u64) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(path, "image already exists, not recreating");
            return Ok(());
        }
        run_tool(
            "qemu-img",
            &["create", "-f", format, path, &format!("{}G", size_gb)],
        )
        .await?;
        Ok(())
    }

    pub async fn create_from_source(
        path: &str,
        format: &str,
        size_gb: u64,
        source: &str,
        cancelled: &CancelFlag,
    ) -> Result<()> {
        let scratch = format!("{}.fetch", path);
        fetch_source(source, &scratch, cancelled).await?;
        run_tool("qemu-img", &["convert", "-O", format, &scratch, path]).await?;
        let _ = tokio::fs::remove_file(&scratch).await;
        // Grow to the requested size; convert leaves the image at the
        // source's virtual size. Shrinking is refused by qemu-img, so a
        // source larger than the requested size surfaces as an error.
        run_tool(
            "qemu-img",
            &["resize", "-f", format, path, &format!("{}G", size_gb)],
        )
        .await?;
        Ok(())
    }

    pub async fn resize(path: &str, format: &str, new_size_gb: u64) -> Result<()> {
        run_tool(
            "qemu-img",
            &["resize", "-f", format, path, &format!("{}G", new_size_gb)],
        )
        .await?;
        Ok(())
    }

    pub async fn virtual_size_gb(path: &str) -> Result<u64> {
        let json = run_tool("qemu-img", &["info", "--output=json", path]).await?;
        let info: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| Error::Storage(format!("bad qemu-img info output: {}", e)))?;
        let bytes = info
            .get("virtual-size")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(bytes.div_ceil(1024 * 1024 * 1024))
    }

    pub async fn snapshot_create(path: &str, tag: &str) -> Result<()> {
        run_tool("qemu-img", &["snapshot", "-c", tag, path]).await?;
        Ok(())
    }

    pub async fn snapshot_delete(path: &str, tag: &str) -> Result<()> {
        run_tool("qemu-img", &["snapshot", "-d", tag, path]).await?;
        Ok(())
    }

    pub async fn snapshot_apply(path: &str, tag: &str) -> Result<()> {
        run_tool("qemu-img", &["snapshot", "-a", tag, path]).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for NfsDriver {
    async fn ensure_ready(&self) -> Result<()> {
        if self.is_mounted().await {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.mount_point)
            .await
            .map_err(|e| Error::Storage(format!("failed to create mount point: {}", e)))?;
        let export = format!("{}:{}", self.server, self.export);
        run_tool("mount", &["-t", "nfs", &export, &self.mount_point]).await?;
        info!(export = %export, mount = %self.mount_point, "nfs export mounted");
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
        "nfs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_path_layout() {
        let driver = NfsDriver::new("10.0.0.5", "/export/vms", "/mnt/ironhive/nfs0");
        assert_eq!(
            driver.volume_path("vol-1", "qcow2"),
            "/mnt/ironhive/nfs0/vol-1.qcow2"
        );
        assert_eq!(driver.driver_type(), "nfs");
    }
}
