//! Safe-zone builder: formats the leading region of the MD device with F2FS
//! and seeds it with innocuous content.
//!
//! The download/extract step is the one permitted partial outcome in the
//! whole pipeline: when it fails the safe-zone stays formatted and empty, and
//! the enclosing operation still succeeds.

use crate::config::FreeholdConfig;
use crate::error::FreeholdResult;
use crate::invoke::ToolInvoker;
use crate::probe;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Sectors formatted for the safe-zone: 1 GiB minus the 1 MiB slack the
/// payload offsets land in, in 512-byte units.
pub const SAFE_ZONE_SECTORS: u64 = ((1 << 30) - (1 << 20)) / 512;

/// Seeding is skipped when the mounted zone reports less than this.
const SEED_MIN_FREE_BYTES: u64 = 800 << 20;

#[derive(Debug, Clone)]
pub struct SafeZoneBuilder<I> {
    invoker: I,
    content_url: String,
    tmp_root: PathBuf,
}

impl<I: ToolInvoker> SafeZoneBuilder<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            content_url: config.safezone_content_url.clone(),
            tmp_root: PathBuf::from("/tmp"),
        }
    }

    /// Place the ephemeral mountpoint somewhere else (tests).
    pub fn with_tmp_root(mut self, tmp_root: impl Into<PathBuf>) -> Self {
        self.tmp_root = tmp_root.into();
        self
    }

    /// Format the leading sectors of `md_device`, mount them on an ephemeral
    /// directory, seed content when space allows, and unmount again.
    pub fn populate(&self, md_device: &Path) -> FreeholdResult<()> {
        let device_arg = md_device.to_string_lossy();
        let sectors = SAFE_ZONE_SECTORS.to_string();
        self.invoker.run_checked(
            "mkfs",
            &["-t", "f2fs", "-w", "512", device_arg.as_ref(), &sectors],
        )?;

        let mount_point = self.tmp_root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&mount_point)?;
        let mount_arg = mount_point.to_string_lossy();
        self.invoker
            .run_checked("mount", &[device_arg.as_ref(), mount_arg.as_ref()])?;

        self.seed(&mount_point);

        let unmounted = self.invoker.run_checked("umount", &[mount_arg.as_ref()]);
        if let Err(err) = fs::remove_dir(&mount_point) {
            warn!("could not remove mount point {}: {err}", mount_point.display());
        }
        unmounted?;

        info!("safe-zone populated on {}", md_device.display());
        Ok(())
    }

    /// Best-effort content seeding; never fails the populate call.
    fn seed(&self, mount_point: &Path) {
        let free = match probe::statvfs(mount_point) {
            Ok(free) => free.bytes_available,
            Err(err) => {
                warn!("statvfs on safe-zone failed, leaving it empty: {err}");
                return;
            }
        };
        if free < SEED_MIN_FREE_BYTES {
            info!("safe-zone too small for seeding ({free} bytes free), leaving it empty");
            return;
        }

        let archive = mount_point.join(archive_name(&self.content_url));
        let archive_arg = archive.to_string_lossy();
        let mount_arg = mount_point.to_string_lossy();

        if let Err(err) = self.invoker.run_checked(
            "curl",
            &["-L", "-o", archive_arg.as_ref(), &self.content_url],
        ) {
            warn!("safe-zone download failed, leaving it empty: {err}");
            return;
        }
        if let Err(err) = self.invoker.run_checked(
            "tar",
            &["-x", "-f", archive_arg.as_ref(), "-C", mount_arg.as_ref()],
        ) {
            warn!("safe-zone extraction failed: {err}");
        }
        if let Err(err) = fs::remove_file(&archive) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not unlink safe-zone archive: {err}");
            }
        }
    }
}

/// Last path segment of the content URL, with a fallback for odd URLs.
fn archive_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains('?'))
        .unwrap_or("content.tar")
        .to_string()
}
