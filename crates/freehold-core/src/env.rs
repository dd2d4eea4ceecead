//! Environment service: composes the component stores into the operations
//! the command shell calls.
//!
//! State is threaded explicitly: every operation re-checks its precondition
//! at entry and rebuilds its view from ground truth, so a crashed or
//! interrupted run needs nothing more than the next command to resynchronise.

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::headers::{HeaderRecord, HeaderVault};
use crate::invoke::ToolInvoker;
use crate::keys::{KeyRecord, KeyVault};
use crate::mapper::PdeMapper;
use crate::md::{ArrayController, MdArray};
use crate::pages::{Allocation, BackingSet, PageStore};
use crate::safezone::SafeZoneBuilder;
use std::path::PathBuf;

/// Derived snapshot of the whole environment; reconstructed on demand and
/// never cached across commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentState {
    pub backing_active: bool,
    pub md_name: Option<String>,
    pub luks_open: bool,
}

/// Probe locations, overridable so tests can stage fake trees.
#[derive(Debug, Clone)]
struct ProbeRoots {
    sysfs_block: PathBuf,
    dev_mapper: PathBuf,
    tmp_root: PathBuf,
}

impl Default for ProbeRoots {
    fn default() -> Self {
        Self {
            sysfs_block: PathBuf::from("/sys/block"),
            dev_mapper: PathBuf::from("/dev/mapper"),
            tmp_root: PathBuf::from("/tmp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Environment<I> {
    config: FreeholdConfig,
    invoker: I,
    roots: ProbeRoots,
}

impl<I: ToolInvoker + Clone> Environment<I> {
    pub fn new(config: FreeholdConfig, invoker: I) -> Self {
        Self {
            config,
            invoker,
            roots: ProbeRoots::default(),
        }
    }

    /// Redirect sysfs / device-mapper / tmp probing (tests).
    pub fn with_probe_roots(
        mut self,
        sysfs_block: impl Into<PathBuf>,
        dev_mapper: impl Into<PathBuf>,
        tmp_root: impl Into<PathBuf>,
    ) -> Self {
        self.roots = ProbeRoots {
            sysfs_block: sysfs_block.into(),
            dev_mapper: dev_mapper.into(),
            tmp_root: tmp_root.into(),
        };
        self
    }

    pub fn config(&self) -> &FreeholdConfig {
        &self.config
    }

    /// Verify required external binaries before the first mutation.
    pub fn preflight(&self) -> FreeholdResult<()> {
        self.invoker.preflight()
    }

    fn pages(&self) -> PageStore<I> {
        PageStore::new(&self.config, self.invoker.clone())
    }

    fn array(&self) -> ArrayController<I> {
        ArrayController::new(&self.config, self.invoker.clone())
            .with_sysfs_block(self.roots.sysfs_block.clone())
    }

    fn keys(&self) -> KeyVault<I> {
        KeyVault::new(&self.config, self.invoker.clone())
    }

    fn headers(&self) -> HeaderVault<I> {
        HeaderVault::new(&self.config, self.invoker.clone())
    }

    fn mapper(&self) -> PdeMapper<I> {
        PdeMapper::new(&self.config, self.invoker.clone())
            .with_dev_mapper(self.roots.dev_mapper.clone())
    }

    fn safezone(&self) -> SafeZoneBuilder<I> {
        SafeZoneBuilder::new(&self.config, self.invoker.clone())
            .with_tmp_root(self.roots.tmp_root.clone())
    }

    // --- pages ---

    pub fn pages_create(
        &self,
        page_size: Option<u64>,
        limit: u64,
        simulated: bool,
    ) -> FreeholdResult<Allocation> {
        let mut store = self.pages();
        if let Some(size) = page_size {
            store = store.with_page_size(size);
        }
        store.allocate(limit, simulated)
    }

    pub fn pages_list(&self) -> FreeholdResult<BackingSet> {
        self.pages().rediscover(false)
    }

    pub fn pages_activate(&self) -> FreeholdResult<BackingSet> {
        self.pages().rediscover(true)
    }

    pub fn pages_deactivate(&self) -> FreeholdResult<BackingSet> {
        let store = self.pages();
        let set = store.rediscover(false)?;
        store.deactivate(&set)
    }

    pub fn pages_remove(&self, confirmed: bool) -> FreeholdResult<()> {
        self.pages().remove(confirmed)
    }

    // --- md ---

    pub fn md_start(&self) -> FreeholdResult<MdArray> {
        let set = self.pages().rediscover(true)?;
        self.array().start(&set)
    }

    pub fn md_stop(&self) -> FreeholdResult<()> {
        self.array().stop()
    }

    pub fn md_status(&self) -> FreeholdResult<Option<MdArray>> {
        self.array().status()
    }

    pub fn populate_safezone(&self) -> FreeholdResult<()> {
        if self.array().status()?.is_none() {
            return Err(FreeholdError::PreconditionUnmet(
                "no MD device; run `md start` first".to_string(),
            ));
        }
        self.safezone().populate(&self.config.md_device())
    }

    // --- keys ---

    pub fn keys_create(&self, count: Option<u32>) -> FreeholdResult<Vec<String>> {
        self.keys().create(count.unwrap_or(self.config.key_count))
    }

    pub fn keys_list(&self) -> FreeholdResult<Vec<KeyRecord>> {
        self.keys().list()
    }

    pub fn keys_remove(&self, confirmed: bool) -> FreeholdResult<()> {
        self.keys().remove(confirmed)
    }

    // --- headers ---

    /// Forge `count` fresh keys and one detached header per key, starting the
    /// MD array first when it is not already up.
    pub fn headers_create(&self, count: Option<u32>) -> FreeholdResult<Vec<HeaderRecord>> {
        if self.array().status()?.is_none() {
            self.md_start()?;
        }
        let count = count.unwrap_or(self.config.header_count);
        let keys = self.keys().create(count)?;
        self.headers().create(&self.config.md_device(), &keys)
    }

    pub fn headers_list(&self) -> FreeholdResult<Vec<String>> {
        self.headers().list()
    }

    pub fn headers_remove(&self, confirmed: bool) -> FreeholdResult<()> {
        self.headers().remove(confirmed)
    }

    // --- pde ---

    pub fn pde_start(
        &self,
        header: &str,
        key: &str,
        keyfile_offset: u64,
        bless: bool,
    ) -> FreeholdResult<()> {
        if self.array().status()?.is_none() {
            return Err(FreeholdError::PreconditionUnmet(
                "no MD device; run `md start` first".to_string(),
            ));
        }
        let header_path = self.headers().resolve(header)?;
        let key_path = self.keys().resolve(key)?;
        self.mapper().open(
            &self.config.md_device(),
            &header_path,
            &key_path,
            keyfile_offset,
            bless,
        )
    }

    pub fn pde_stop(&self) -> FreeholdResult<()> {
        self.mapper().close()
    }

    // --- status ---

    /// Compose the derived snapshot without mutating anything.
    pub fn status(&self) -> FreeholdResult<EnvironmentState> {
        let set = self.pages().rediscover(false)?;
        let array = self.array().status()?;
        Ok(EnvironmentState {
            backing_active: set.active(),
            md_name: array.map(|_| self.config.md_name.clone()),
            luks_open: self.mapper().is_open(),
        })
    }
}
