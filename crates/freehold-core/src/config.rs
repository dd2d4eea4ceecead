//! Configuration model and helpers used by the Freehold services.

use crate::error::{FreeholdError, FreeholdResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/freehold.toml";

const KEY_SUBDIR: &str = ".k";
const HEADER_SUBDIR: &str = ".h";

/// Lightweight sanity check that a device-mapper / MD name matches common
/// patterns before it is spliced into a device path.
pub fn looks_like_mapping_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('-') {
        return false;
    }
    trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}

fn default_root() -> PathBuf {
    PathBuf::from("/.space")
}

fn default_md_name() -> String {
    "freedom".to_string()
}

fn default_mapper_name() -> String {
    "freedom".to_string()
}

fn default_data_pagesize() -> u64 {
    1 << 30
}

fn default_key_count() -> u32 {
    5
}

fn default_header_count() -> u32 {
    5
}

fn default_keyfile_size() -> u64 {
    8192
}

fn default_key_size() -> u64 {
    512
}

fn default_luks_sector_size() -> u64 {
    512
}

fn default_safezone_content_url() -> String {
    "https://cdn.kernel.org/pub/linux/kernel/v3.x/linux-3.19.8.tar.xz".to_string()
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FreeholdConfig {
    /// Backing-page root directory, exclusively owned by the core.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Kernel name for the MD array (`/dev/md/<md_name>`).
    #[serde(default = "default_md_name")]
    pub md_name: String,

    /// dm-crypt mapper name (`/dev/mapper/<mapper_name>`).
    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,

    /// Backing-page size in bytes.
    #[serde(default = "default_data_pagesize")]
    pub data_pagesize: u64,

    /// Default number of keys per `keys create`.
    #[serde(default = "default_key_count")]
    pub key_count: u32,

    /// Default number of headers per `headers create`.
    #[serde(default = "default_header_count")]
    pub header_count: u32,

    /// Bytes of random material per keyfile.
    #[serde(default = "default_keyfile_size")]
    pub keyfile_size: u64,

    /// Bytes of key material presented to dm-crypt.
    #[serde(default = "default_key_size")]
    pub key_size: u64,

    /// LUKS sector unit in bytes.
    #[serde(default = "default_luks_sector_size")]
    pub luks_sector_size: u64,

    /// Innocuous payload downloaded into the safe-zone.
    #[serde(default = "default_safezone_content_url")]
    pub safezone_content_url: String,

    /// Where this configuration was loaded from.
    #[serde(skip)]
    #[schemars(skip)]
    pub path: PathBuf,
}

impl Default for FreeholdConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            md_name: default_md_name(),
            mapper_name: default_mapper_name(),
            data_pagesize: default_data_pagesize(),
            key_count: default_key_count(),
            header_count: default_header_count(),
            keyfile_size: default_keyfile_size(),
            key_size: default_key_size(),
            luks_sector_size: default_luks_sector_size(),
            safezone_content_url: default_safezone_content_url(),
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

impl FreeholdConfig {
    /// Load the configuration from `path`.
    pub fn load(path: &Path) -> FreeholdResult<Self> {
        let contents = fs::read_to_string(path)?;
        let mut cfg: Self = toml::from_str(&contents)?;
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> FreeholdResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut cfg = Self::default();
            cfg.path = path.to_path_buf();
            Ok(cfg)
        }
    }

    /// Persist the configuration back to its source path.
    pub fn save(&self) -> FreeholdResult<()> {
        let rendered = toml::to_string_pretty(self)?;
        fs::write(&self.path, rendered)?;
        Ok(())
    }

    /// Validate field combinations, returning one message per issue.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.data_pagesize == 0 {
            issues.push("data_pagesize must be non-zero".to_string());
        }
        if self.key_size == 0 {
            issues.push("key_size must be non-zero".to_string());
        }
        if self.keyfile_size < self.key_size {
            issues.push(format!(
                "keyfile_size ({}) must be at least key_size ({})",
                self.keyfile_size, self.key_size
            ));
        }
        if self.luks_sector_size == 0 {
            issues.push("luks_sector_size must be non-zero".to_string());
        }
        if !looks_like_mapping_name(&self.md_name) {
            issues.push(format!("md_name `{}` is not a usable device name", self.md_name));
        }
        if !looks_like_mapping_name(&self.mapper_name) {
            issues.push(format!(
                "mapper_name `{}` is not a usable device name",
                self.mapper_name
            ));
        }
        if self.root.as_os_str().is_empty() {
            issues.push("root must not be empty".to_string());
        }
        issues
    }

    /// Validate and convert the issue list into a single error.
    pub fn ensure_valid(&self) -> FreeholdResult<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(FreeholdError::InvalidConfig(issues.join("; ")))
        }
    }

    /// Hidden sub-root holding keyfiles.
    pub fn key_dir(&self) -> PathBuf {
        self.root.join(KEY_SUBDIR)
    }

    /// Hidden sub-root holding detached LUKS headers.
    pub fn header_dir(&self) -> PathBuf {
        self.root.join(HEADER_SUBDIR)
    }

    /// Assembled MD device path.
    pub fn md_device(&self) -> PathBuf {
        Path::new("/dev/md").join(&self.md_name)
    }
}

/// Render a commented starter configuration.
pub fn bootstrap_template() -> String {
    format!(
        "# Freehold configuration.\n\
         # The backing-page root is exclusively owned by freehold; do not share it.\n\
         \n\
         root = \"/.space\"\n\
         md_name = \"freedom\"\n\
         mapper_name = \"freedom\"\n\
         \n\
         # Page size in bytes; one loop device per page.\n\
         data_pagesize = {}\n\
         \n\
         key_count = 5\n\
         header_count = 5\n\
         keyfile_size = 8192\n\
         key_size = 512\n\
         luks_sector_size = 512\n\
         \n\
         safezone_content_url = \"{}\"\n",
        default_data_pagesize(),
        default_safezone_content_url()
    )
}
