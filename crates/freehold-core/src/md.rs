//! MD array controller: create, assemble, adopt, and stop the RAID-0 device
//! built from the backing set's loop devices.

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use crate::pages::BackingSet;
use crate::probe;
use log::info;
use std::path::{Path, PathBuf};

/// A virgin page classifies as plain `data`; anything else carries metadata
/// and must be assembled, not created over.
const VIRGIN_MAGIC: &str = "data";

/// An MD array discovered in sysfs whose members all resolve into our root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdArray {
    /// Kernel block name (`md0`, `md127`, ...).
    pub kernel_name: String,
    /// Member device paths in stripe order.
    pub members: Vec<String>,
}

/// Drives `mdadm` and the sysfs ownership walk for one named array.
#[derive(Debug, Clone)]
pub struct ArrayController<I> {
    invoker: I,
    root: PathBuf,
    name: String,
    sysfs_block: PathBuf,
}

impl<I: ToolInvoker> ArrayController<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            root: config.root.clone(),
            name: config.md_name.clone(),
            sysfs_block: PathBuf::from("/sys/block"),
        }
    }

    /// Point the sysfs walk at a staged tree (tests).
    pub fn with_sysfs_block(mut self, sysfs_block: impl Into<PathBuf>) -> Self {
        self.sysfs_block = sysfs_block.into();
        self
    }

    /// The named device path handed to mdadm and cryptsetup.
    pub fn device(&self) -> PathBuf {
        Path::new("/dev/md").join(&self.name)
    }

    /// Walk sysfs for an MD array whose slaves are all loops backed by files
    /// inside our root. Returns `None` when no such array exists.
    pub fn status(&self) -> FreeholdResult<Option<MdArray>> {
        for md in probe::md_arrays(&self.sysfs_block)? {
            let slaves = probe::md_slaves(&self.sysfs_block, &md)?;
            if slaves.is_empty() {
                continue;
            }
            let mut members = Vec::with_capacity(slaves.len());
            let mut ours = true;
            for slave in &slaves {
                match probe::loop_backing_file(&self.sysfs_block, &md, slave) {
                    Ok(backing) if backing.starts_with(&self.root) => {
                        members.push(format!("/dev/{slave}"));
                    }
                    _ => {
                        ours = false;
                        break;
                    }
                }
            }
            if ours {
                return Ok(Some(MdArray {
                    kernel_name: md,
                    members,
                }));
            }
        }
        Ok(None)
    }

    /// Bring the array up from a fully attached backing set.
    ///
    /// An array that already owns all our pages is adopted as-is. Otherwise
    /// the first page's magic decides: a virgin set is created (loop
    /// enumeration order = stripe order), a metadata-bearing set is assembled
    /// and mdadm's on-disk metadata is trusted for ordering.
    pub fn start(&self, set: &BackingSet) -> FreeholdResult<MdArray> {
        if set.is_empty() {
            return Err(FreeholdError::PreconditionUnmet(
                "no backing pages".to_string(),
            ));
        }
        let loops = set.loop_devices();
        if loops.len() != set.len() {
            return Err(FreeholdError::PreconditionUnmet(
                "backing pages without attached loop devices; run activate first".to_string(),
            ));
        }

        if let Some(existing) = self.status()? {
            info!(
                "adopting existing array {} ({} members)",
                existing.kernel_name,
                existing.members.len()
            );
            return Ok(existing);
        }
        if self.device().exists() {
            return Err(FreeholdError::PreconditionUnmet(format!(
                "md name `{}` already in use by a foreign array",
                self.name
            )));
        }

        let device = self.device();
        let device_arg = device.to_string_lossy();
        let magic = probe::magic(&self.invoker, &set.pages[0].path)?;
        if magic == VIRGIN_MAGIC {
            let raid_devices = format!("--raid-devices={}", loops.len());
            let mut args = vec![
                "--create",
                device_arg.as_ref(),
                "--level=0",
                raid_devices.as_str(),
            ];
            args.extend(loops.iter().copied());
            self.invoker.run_checked("mdadm", &args)?;
        } else {
            let mut args = vec!["--assemble", device_arg.as_ref()];
            args.extend(loops.iter().copied());
            if let Err(err) = self.invoker.run_checked("mdadm", &args) {
                return Err(match err {
                    FreeholdError::ToolFailure { stderr, .. } => {
                        FreeholdError::ArrayInconsistent(stderr)
                    }
                    other => other,
                });
            }
        }

        self.status()?.ok_or_else(|| {
            FreeholdError::ArrayInconsistent(format!(
                "array `{}` did not appear in sysfs after start",
                self.name
            ))
        })
    }

    /// Stop the array. A missing array is a no-op.
    pub fn stop(&self) -> FreeholdResult<()> {
        if self.status()?.is_none() {
            return Ok(());
        }
        let device = self.device();
        let device_arg = device.to_string_lossy();
        match self.invoker.run_checked("mdadm", &["--stop", device_arg.as_ref()]) {
            Ok(_) => Ok(()),
            Err(FreeholdError::ToolFailure { stderr, .. })
                if stderr.to_ascii_lowercase().contains("no such") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
