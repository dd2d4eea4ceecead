//! Backing-page store: sparse page files under the root and their loop
//! devices.
//!
//! The store never trusts its own bookkeeping: every mutator finishes by
//! re-reading ground truth (directory listing + `losetup --associated`), so a
//! crash between steps only costs a re-run of `rediscover`.

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use crate::probe;
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Write granularity used when zero-filling a page.
pub const PAGE_BLOCK_SIZE: u64 = 1 << 20;

/// One page file and, when attached, its loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingPage {
    pub path: PathBuf,
    pub loop_device: Option<String>,
}

/// The unordered set of pages under one root, enumerated in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackingSet {
    pub pages: Vec<BackingPage>,
}

impl BackingSet {
    /// Attached loop devices, in page enumeration order. This order is the
    /// stripe order handed to `mdadm --create`.
    pub fn loop_devices(&self) -> Vec<&str> {
        self.pages
            .iter()
            .filter_map(|page| page.loop_device.as_deref())
            .collect()
    }

    /// Active means every page has a loop device and there is at least one.
    pub fn active(&self) -> bool {
        !self.pages.is_empty() && self.pages.iter().all(|page| page.loop_device.is_some())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Result of an allocation run (or a simulated plan).
#[derive(Debug, Clone)]
pub struct Allocation {
    pub pages: Vec<PathBuf>,
    pub page_size: u64,
    pub simulated: bool,
}

/// Owns the backing-page root directory.
#[derive(Debug, Clone)]
pub struct PageStore<I> {
    invoker: I,
    root: PathBuf,
    page_size: u64,
}

impl<I: ToolInvoker> PageStore<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            root: config.root.clone(),
            page_size: config.data_pagesize,
        }
    }

    /// Override the page size for this store (CLI `-d`).
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Allocation arithmetic, checked before any file is touched.
    ///
    /// `limit == 0` means "fill the free space".
    pub fn plan(free: u64, page_size: u64, limit: u64) -> FreeholdResult<u64> {
        let to_create = if limit == 0 { free / page_size } else { limit };
        if to_create < 1 {
            return Err(FreeholdError::InsufficientSpace {
                needed: page_size,
                available: free,
            });
        }
        let needed = page_size.saturating_mul(to_create);
        if needed > free {
            return Err(FreeholdError::InsufficientSpace {
                needed,
                available: free,
            });
        }
        Ok(to_create)
    }

    /// Create `limit` pages (or as many as fit when `limit == 0`), each a
    /// freshly named UUID file filled with zeros via `dd`. With `simulated`
    /// the plan is reported but nothing is written.
    pub fn allocate(&self, limit: u64, simulated: bool) -> FreeholdResult<Allocation> {
        fs::create_dir_all(&self.root)?;
        let free = probe::statvfs(&self.root)?.bytes_available;
        let to_create = Self::plan(free, self.page_size, limit)?;
        let blocks = self.page_size.div_ceil(PAGE_BLOCK_SIZE);

        let mut pages = Vec::with_capacity(to_create as usize);
        for _ in 0..to_create {
            let path = self.root.join(Uuid::new_v4().to_string());
            if simulated {
                debug!("simulated page {}", path.display());
            } else {
                let of = format!("of={}", path.display());
                self.invoker.run_checked(
                    "dd",
                    &[
                        "if=/dev/zero",
                        &of,
                        &format!("bs={PAGE_BLOCK_SIZE}"),
                        &format!("count={blocks}"),
                    ],
                )?;
            }
            pages.push(path);
        }

        info!(
            "{} {} page(s) of {} bytes under {}",
            if simulated { "planned" } else { "allocated" },
            pages.len(),
            self.page_size,
            self.root.display()
        );
        Ok(Allocation {
            pages,
            page_size: self.page_size,
            simulated,
        })
    }

    /// Enumerate the pages under the root and resolve their loop devices from
    /// ground truth. With `attach_missing`, unattached pages are attached via
    /// `losetup -f --show`. Idempotent and crash-safe.
    pub fn rediscover(&self, attach_missing: bool) -> FreeholdResult<BackingSet> {
        let mut pages = Vec::new();
        for path in probe::uuid_entries(&self.root)? {
            let mut loop_device = self.associated_loop(&path)?;
            if loop_device.is_none() && attach_missing {
                loop_device = Some(self.attach(&path)?);
            }
            pages.push(BackingPage { path, loop_device });
        }
        Ok(BackingSet { pages })
    }

    /// Detach every loop device in the set. Per-device failures are logged
    /// and skipped; the returned set reflects what is actually still
    /// attached.
    pub fn deactivate(&self, set: &BackingSet) -> FreeholdResult<BackingSet> {
        for page in &set.pages {
            let Some(device) = page.loop_device.as_deref() else {
                continue;
            };
            if let Err(err) = self.invoker.run_checked("losetup", &["-d", device]) {
                warn!("failed to detach {device}: {err}");
            }
        }
        self.rediscover(false)
    }

    /// Unlink every page file. Requires prior deactivation and an explicit
    /// confirmation; missing files are tolerated.
    pub fn remove(&self, confirmed: bool) -> FreeholdResult<()> {
        if !confirmed {
            return Err(FreeholdError::RefusedUnconfirmed("pages remove".to_string()));
        }
        let set = self.rediscover(false)?;
        if set.pages.iter().any(|page| page.loop_device.is_some()) {
            return Err(FreeholdError::PreconditionUnmet(
                "backing pages still have attached loop devices; deactivate first".to_string(),
            ));
        }
        for page in set.pages {
            match fs::remove_file(&page.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn associated_loop(&self, path: &std::path::Path) -> FreeholdResult<Option<String>> {
        let path_arg = path.to_string_lossy();
        let out = self
            .invoker
            .run_checked("losetup", &["--associated", path_arg.as_ref()])?;
        // `losetup --associated` prints `/dev/loopN: [...]: (<file>)` per hit.
        Ok(out
            .stdout
            .lines()
            .find_map(|line| line.split(':').next())
            .map(str::trim)
            .filter(|device| !device.is_empty())
            .map(str::to_string))
    }

    fn attach(&self, path: &std::path::Path) -> FreeholdResult<String> {
        let path_arg = path.to_string_lossy();
        let out = self
            .invoker
            .run_checked("losetup", &["--find", "--show", path_arg.as_ref()])?;
        let device = out.stdout_trimmed();
        if device.is_empty() {
            return Err(FreeholdError::PreconditionUnmet(format!(
                "losetup returned no loop device for {}",
                path.display()
            )));
        }
        Ok(device.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Plan = PageStore<crate::invoke::SystemInvoker>;

    #[test]
    fn plan_fills_free_space_when_unlimited() {
        assert_eq!(Plan::plan(6 << 30, 1 << 30, 0).unwrap(), 6);
        assert_eq!(Plan::plan((6 << 30) - 1, 1 << 30, 0).unwrap(), 5);
    }

    #[test]
    fn plan_honours_explicit_limit() {
        assert_eq!(Plan::plan(6 << 30, 1 << 30, 3).unwrap(), 3);
    }

    #[test]
    fn plan_rejects_zero_fit() {
        let err = Plan::plan(512 << 20, 1 << 30, 0).unwrap_err();
        match err {
            FreeholdError::InsufficientSpace { needed, available } => {
                assert_eq!(needed, 1 << 30);
                assert_eq!(available, 512 << 20);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn plan_rejects_oversized_limit() {
        let err = Plan::plan(2 << 30, 1 << 30, 3).unwrap_err();
        match err {
            FreeholdError::InsufficientSpace { needed, available } => {
                assert_eq!(needed, 3 << 30);
                assert_eq!(available, 2 << 30);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn set_activity_requires_full_attachment() {
        let page = |dev: Option<&str>| BackingPage {
            path: PathBuf::from("/tmp/x"),
            loop_device: dev.map(str::to_string),
        };
        assert!(!BackingSet::default().active());
        assert!(!BackingSet {
            pages: vec![page(Some("/dev/loop0")), page(None)],
        }
        .active());
        let set = BackingSet {
            pages: vec![page(Some("/dev/loop0")), page(Some("/dev/loop1"))],
        };
        assert!(set.active());
        assert_eq!(set.loop_devices(), vec!["/dev/loop0", "/dev/loop1"]);
    }
}
