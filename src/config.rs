//! Configuration management for cryptmirror

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default extended attribute marking a file as ciphertext
pub const DEFAULT_TAG_ATTRIBUTE: &str = "user.enc";

/// Default attribute/entry cache TTL handed to the kernel
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mirror (backing store) configuration
    pub mirror: MirrorConfig,

    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// How the filesystem decides which real files hold ciphertext
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Every regular file is ciphertext
    Uniform,
    /// Only files carrying the tag attribute are ciphertext
    Tagged,
}

impl std::str::FromStr for EncryptionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(EncryptionMode::Uniform),
            "tagged" => Ok(EncryptionMode::Tagged),
            other => Err(Error::InvalidConfig(format!(
                "Unknown encryption mode '{}' (expected 'uniform' or 'tagged')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionMode::Uniform => write!(f, "uniform"),
            EncryptionMode::Tagged => write!(f, "tagged"),
        }
    }
}

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Directory holding the ciphertext tree
    pub root: PathBuf,

    /// Encryption state policy
    pub mode: EncryptionMode,

    /// Attribute name used by tagged mode
    pub tag_attribute: String,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (will be generated if not set)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Let the kernel enforce permission bits
    pub default_permissions: bool,

    /// Attribute cache TTL in seconds
    pub attr_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mirror: MirrorConfig::default(),
            encryption: EncryptionConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            root: PathBuf::new(),
            mode: EncryptionMode::Tagged,
            tag_attribute: DEFAULT_TAG_ATTRIBUTE.to_string(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536,  // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(), // Will be generated on first use
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::new(),
            allow_other: false,
            allow_root: false,
            default_permissions: true,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("CRYPTMIRROR_MIRROR") {
            let root = root.trim();
            if !root.is_empty() {
                self.mirror.root = PathBuf::from(root);
            }
        }

        if let Ok(mode) = std::env::var("CRYPTMIRROR_MODE") {
            if !mode.trim().is_empty() {
                self.mirror.mode = mode.parse()?;
            }
        }

        if let Ok(attr) = std::env::var("CRYPTMIRROR_TAG_ATTR") {
            let attr = attr.trim().to_string();
            if !attr.is_empty() {
                self.mirror.tag_attribute = attr;
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let attr = &self.mirror.tag_attribute;
        if attr.is_empty() {
            return Err(Error::InvalidConfig(
                "Tag attribute name must not be empty".to_string(),
            ));
        }

        // xattr names live in a namespace: "user.enc", "trusted.x", ...
        match attr.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "Tag attribute '{}' must be namespaced, e.g. 'user.enc'",
                    attr
                )));
            }
        }

        if self.encryption.argon2_memory_kib == 0
            || self.encryption.argon2_iterations == 0
            || self.encryption.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 parameters must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
