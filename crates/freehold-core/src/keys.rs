//! Key vault: random keyfiles under the hidden `.k/` sub-root.
//!
//! Key material is produced by `dd if=/dev/urandom` so raw bytes never pass
//! through this process during generation; only `list` reads them back, and
//! then only inside a zeroizing buffer.

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use crate::probe;
use md5::{Digest, Md5};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

/// dm-crypt key block granularity; keyfiles are written in these units.
pub const KEY_BLOCK_SIZE: u64 = 512;

/// One key as presented to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub name: String,
    /// MD5 of the file contents. Identification only; nothing verifies it.
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct KeyVault<I> {
    invoker: I,
    dir: PathBuf,
    keyfile_size: u64,
    key_size: u64,
}

impl<I: ToolInvoker> KeyVault<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            dir: config.key_dir(),
            keyfile_size: config.keyfile_size,
            key_size: config.key_size,
        }
    }

    /// Keyfile size on disk, rounded up to a whole number of key slices.
    pub fn padded_keyfile_size(&self) -> u64 {
        self.keyfile_size.div_ceil(self.key_size) * self.key_size
    }

    /// Generate `count` fresh keyfiles and return their names.
    pub fn create(&self, count: u32) -> FreeholdResult<Vec<String>> {
        fs::create_dir_all(&self.dir)?;
        let blocks = self.padded_keyfile_size().div_ceil(KEY_BLOCK_SIZE);

        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = Uuid::new_v4().to_string();
            let path = self.dir.join(&name);
            let of = format!("of={}", path.display());
            self.invoker.run_checked(
                "dd",
                &[
                    "if=/dev/urandom",
                    &of,
                    &format!("bs={KEY_BLOCK_SIZE}"),
                    &format!("count={blocks}"),
                ],
            )?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;
            names.push(name);
        }
        Ok(names)
    }

    /// Enumerate the vault with MD5 fingerprints for human identification.
    pub fn list(&self) -> FreeholdResult<Vec<KeyRecord>> {
        let mut records = Vec::new();
        for path in probe::uuid_entries(&self.dir)? {
            let contents = Zeroizing::new(fs::read(&path)?);
            let fingerprint = hex::encode(Md5::digest(&contents[..]));
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            records.push(KeyRecord { name, fingerprint });
        }
        Ok(records)
    }

    /// Unlink every keyfile. Refuses without explicit confirmation; missing
    /// files are tolerated.
    pub fn remove(&self, confirmed: bool) -> FreeholdResult<()> {
        if !confirmed {
            return Err(FreeholdError::RefusedUnconfirmed("keys remove".to_string()));
        }
        for path in probe::uuid_entries(&self.dir)? {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Absolute path for a named key; errors when it does not exist.
    pub fn resolve(&self, name: &str) -> FreeholdResult<PathBuf> {
        let path = self.dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(FreeholdError::NotFound { path })
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}
