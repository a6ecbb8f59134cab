//! Storage drivers
//!
//! One driver per pool type. The controller ships the pool configuration
//! with every request, so drivers are constructed per call and hold no
//! state beyond it.

pub mod ceph;
pub mod driver;
pub mod iscsi;
pub mod lvm;
pub mod nfs;

use futures::StreamExt;
use ironhive_common::rpc::types::{PoolConfig, PoolSpec};
use ironhive_common::{Error, Result};
use tracing::info;

pub use driver::{CancelFlag, StorageDriver, VolumeInfo};

/// Build the driver for a pool
pub fn driver_for(pool: &PoolSpec) -> Box<dyn StorageDriver> {
    match &pool.config {
        PoolConfig::Nfs {
            server,
            export,
            mount_point,
        } => Box::new(nfs::NfsDriver::new(server, export, mount_point)),
        PoolConfig::Lvm { volume_group } => Box::new(lvm::LvmDriver::new(volume_group)),
        PoolConfig::Ceph { pool, user, .. } => Box::new(ceph::CephDriver::new(pool, user)),
        PoolConfig::Iscsi {
            portal,
            target,
            mount_point,
        } => Box::new(iscsi::IscsiDriver::new(portal, target, mount_point)),
    }
}

/// Download initial volume contents to a scratch file. The caller converts
/// it into the backing store afterwards.
pub async fn fetch_source(url: &str, dest: &str, cancelled: &CancelFlag) -> Result<()> {
    info!(url, dest, "fetching volume source");
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Storage(format!("source fetch failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(Error::Storage(format!(
            "source fetch returned {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| Error::Storage(format!("failed to create {}: {}", dest, e)))?;
    let is_cancelled = cancelled.as_ref();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if is_cancelled() {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::Storage("source fetch cancelled".into()));
        }
        let chunk = chunk.map_err(|e| Error::Storage(format!("source fetch failed: {}", e)))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
            .await
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", dest, e)))?;
    }
    Ok(())
}

/// Run a storage shell tool, mapping failure into a storage error
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Storage(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Storage(format!(
            "{} {} failed: {}",
            program,
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
