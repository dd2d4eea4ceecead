//! Header vault: detached LUKS1 headers with randomized key and payload
//! offsets under the hidden `.h/` sub-root.
//!
//! Every header carries a fresh payload offset just past the safe-zone and a
//! fresh slice offset into its keyfile. The returned records are the only
//! place the winning tuple ever exists; the vault persists nothing about
//! which header pairs with which key.

use crate::config::FreeholdConfig;
use crate::error::{FreeholdError, FreeholdResult};
use crate::invoke::ToolInvoker;
use crate::probe;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Payload offset range in 512-byte sectors: `[1 GiB, 1 GiB + 1 MiB]`,
/// landing the PDZ start just past the safe-zone.
pub const PAYLOAD_OFFSET_MIN_SECTORS: u64 = (1 << 30) / 512;
pub const PAYLOAD_OFFSET_MAX_SECTORS: u64 = ((1 << 30) + (1 << 20)) / 512;

/// One generated header and the tuple that opens it. Handed to the operator
/// at creation time and never written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: String,
    pub key: String,
    pub keyfile_offset: u64,
    pub payload_offset: u64,
}

#[derive(Debug, Clone)]
pub struct HeaderVault<I> {
    invoker: I,
    dir: PathBuf,
    key_dir: PathBuf,
    keyfile_size: u64,
    key_size: u64,
}

impl<I: ToolInvoker> HeaderVault<I> {
    pub fn new(config: &FreeholdConfig, invoker: I) -> Self {
        Self {
            invoker,
            dir: config.header_dir(),
            key_dir: config.key_dir(),
            keyfile_size: config.keyfile_size,
            key_size: config.key_size,
        }
    }

    /// Format one detached header per key against `md_device`.
    ///
    /// Keys are visited in a uniform shuffle so creation order carries no
    /// correlation between a header and any particular key.
    pub fn create(&self, md_device: &Path, keys: &[String]) -> FreeholdResult<Vec<HeaderRecord>> {
        if keys.is_empty() {
            return Err(FreeholdError::PreconditionUnmet(
                "no keys to derive headers from".to_string(),
            ));
        }
        fs::create_dir_all(&self.dir)?;

        let mut rng = rand::thread_rng();
        let mut shuffled: Vec<&String> = keys.iter().collect();
        shuffled.shuffle(&mut rng);

        let device_arg = md_device.to_string_lossy();
        let key_size_arg = self.key_size.to_string();
        let mut records = Vec::with_capacity(shuffled.len());
        for key in shuffled {
            let header = Uuid::new_v4().to_string();
            let header_path = self.dir.join(&header);
            let key_path = self.key_dir.join(key);
            if !key_path.is_file() {
                return Err(FreeholdError::NotFound { path: key_path });
            }

            let keyfile_offset = sample_keyfile_offset(&mut rng, self.keyfile_size, self.key_size);
            let payload_offset = sample_payload_offset(&mut rng);
            let key_arg = key_path.to_string_lossy();
            let header_arg = header_path.to_string_lossy();
            let keyfile_offset_arg = keyfile_offset.to_string();
            let payload_offset_arg = payload_offset.to_string();

            self.invoker.run_checked(
                "cryptsetup",
                &[
                    "luksFormat",
                    device_arg.as_ref(),
                    "--type",
                    "luks1",
                    "--batch-mode",
                    "--key-size",
                    &key_size_arg,
                    "--key-file",
                    key_arg.as_ref(),
                    "--keyfile-offset",
                    &keyfile_offset_arg,
                    "--header",
                    header_arg.as_ref(),
                    "--align-payload",
                    &payload_offset_arg,
                ],
            )?;

            records.push(HeaderRecord {
                header,
                key: key.clone(),
                keyfile_offset,
                payload_offset,
            });
        }
        Ok(records)
    }

    /// Header names only; a header betrays nothing else about its tuple.
    pub fn list(&self) -> FreeholdResult<Vec<String>> {
        Ok(probe::uuid_entries(&self.dir)?
            .into_iter()
            .filter_map(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .collect())
    }

    /// Unlink every header. Refuses without explicit confirmation.
    pub fn remove(&self, confirmed: bool) -> FreeholdResult<()> {
        if !confirmed {
            return Err(FreeholdError::RefusedUnconfirmed(
                "headers remove".to_string(),
            ));
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

    /// Absolute path for a named header; errors when it does not exist.
    pub fn resolve(&self, name: &str) -> FreeholdResult<PathBuf> {
        let path = self.dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(FreeholdError::NotFound { path })
        }
    }
}

/// Uniform payload offset over the closed sector range.
pub fn sample_payload_offset<R: Rng>(rng: &mut R) -> u64 {
    rng.gen_range(PAYLOAD_OFFSET_MIN_SECTORS..=PAYLOAD_OFFSET_MAX_SECTORS)
}

/// Uniform slice offset leaving a full key inside the keyfile.
pub fn sample_keyfile_offset<R: Rng>(rng: &mut R, keyfile_size: u64, key_size: u64) -> u64 {
    rng.gen_range(0..=keyfile_size.saturating_sub(key_size))
}
