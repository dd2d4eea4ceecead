//! dm-crypt mapper for the plausibly-deniable zone.
//!
//! Only the correct `(header, key, keyfile-offset)` tuple opens a consistent
//! filesystem; every other combination is rejected by cryptsetup and surfaces
//! as [`FreeholdError::WrongTuple`].

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PdeMapper<I> {
    invoker: I,
    mapper_name: String,
    key_size: u64,
    dev_mapper: PathBuf,
}

impl<I: ToolInvoker> PdeMapper<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            mapper_name: config.mapper_name.clone(),
            key_size: config.key_size,
            dev_mapper: PathBuf::from("/dev/mapper"),
        }
    }

    /// Point the mapping probe at a staged device directory (tests).
    pub fn with_dev_mapper(mut self, dev_mapper: impl Into<PathBuf>) -> Self {
        self.dev_mapper = dev_mapper.into();
        self
    }

    /// The mapped device path once open.
    pub fn device(&self) -> PathBuf {
        self.dev_mapper.join(&self.mapper_name)
    }

    /// Whether the mapping currently exists.
    pub fn is_open(&self) -> bool {
        self.device().exists()
    }

    /// Open the mapping for one tuple; optionally bless the mapped device
    /// with a fresh ext4 filesystem for first use.
    pub fn open(
        &self,
        md_device: &Path,
        header: &Path,
        key: &Path,
        keyfile_offset: u64,
        bless: bool,
    ) -> FreeholdResult<()> {
        for path in [header, key] {
            if !path.is_file() {
                return Err(FreeholdError::NotFound {
                    path: path.to_path_buf(),
                });
            }
        }

        let device_arg = md_device.to_string_lossy();
        let key_arg = key.to_string_lossy();
        let header_arg = header.to_string_lossy();
        let key_size_arg = self.key_size.to_string();
        let offset_arg = keyfile_offset.to_string();

        let out = self.invoker.run(
            "cryptsetup",
            &[
                "luksOpen",
                device_arg.as_ref(),
                &self.mapper_name,
                "--key-size",
                &key_size_arg,
                "--key-file",
                key_arg.as_ref(),
                "--keyfile-offset",
                &offset_arg,
                "--header",
                header_arg.as_ref(),
            ],
        )?;
        if !out.success() {
            return Err(FreeholdError::WrongTuple {
                header: display_name(header),
                key: display_name(key),
            });
        }

        if bless {
            let mapped = self.device();
            let mapped_arg = mapped.to_string_lossy();
            self.invoker
                .run_checked("mkfs", &["-t", "ext4", mapped_arg.as_ref()])?;
        }
        Ok(())
    }

    /// Close the mapping. A mapping that is not open is a no-op, and a close
    /// racing an already-gone mapping is tolerated.
    pub fn close(&self) -> FreeholdResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        match self
            .invoker
            .run_checked("cryptsetup", &["luksClose", &self.mapper_name])
        {
            Ok(_) => Ok(()),
            Err(FreeholdError::ToolFailure { stderr, .. }) if mapping_already_gone(&stderr) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

fn mapping_already_gone(stderr: &str) -> bool {
    let diagnostic = stderr.to_ascii_lowercase();
    diagnostic.contains("does not exist")
        || diagnostic.contains("doesn't exist")
        || diagnostic.contains("not active")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::SystemInvoker;
    use tempfile::tempdir;

    #[test]
    fn close_without_mapping_is_a_noop() {
        let dev = tempdir().unwrap();
        let config = FreeholdConfig::default();
        let mapper = PdeMapper::new(&config, SystemInvoker).with_dev_mapper(dev.path());
        assert!(!mapper.is_open());
        mapper.close().unwrap();
    }

    #[test]
    fn open_requires_both_files() {
        let dev = tempdir().unwrap();
        let vault = tempdir().unwrap();
        let config = FreeholdConfig::default();
        let mapper = PdeMapper::new(&config, SystemInvoker).with_dev_mapper(dev.path());

        let header = vault.path().join("missing-header");
        let key = vault.path().join("missing-key");
        let err = mapper
            .open(Path::new("/dev/md/freedom"), &header, &key, 0, false)
            .unwrap_err();
        assert!(matches!(err, FreeholdError::NotFound { .. }));
    }

    #[test]
    fn gone_mapping_diagnostics_are_tolerated() {
        assert!(mapping_already_gone("Device freedom is not active."));
        assert!(mapping_already_gone("Device freedom doesn't exist or access denied."));
        assert!(!mapping_already_gone("No key available with this passphrase."));
    }
}
