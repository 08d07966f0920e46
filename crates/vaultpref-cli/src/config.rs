use std::{
    env, fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Environment variable consulted when `crypto.password` is not set.
pub const PASSWORD_ENV: &str = "VAULTPREF_PASSWORD";

/// User-level configuration loaded from `~/.config/vaultpref/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory holding store files.
    pub data_dir: Option<PathBuf>,
    /// Store name; selects `<data_dir>/<name>.json`.
    pub name: String,
    /// Upper bound on worker threads for queued operations.
    pub pool_threads: Option<usize>,
    pub crypto: CryptoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            name: "default".to_string(),
            pool_threads: None,
            crypto: CryptoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CryptoConfig {
    pub cipher: CipherKind,
    pub hash: HashKind,
    pub key: KeyKind,
    pub prf: PrfKind,
    pub password: Option<String>,
    pub salt: Option<String>,
}

impl CryptoConfig {
    /// Configured password, falling back to [`PASSWORD_ENV`].
    pub fn password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| env::var(PASSWORD_ENV).ok())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    #[default]
    AesGcm,
    AesCbc,
    /// Values stored as plain text.
    None,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HashKind {
    #[default]
    Sha512,
    Sha256,
    Sha1,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    Password,
    Fixed,
    Keychain,
    #[default]
    Hybrid,
    /// Empty key; only valid with `cipher = "none"`.
    None,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PrfKind {
    #[default]
    HmacSha1,
    HmacSha256,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("vaultpref").join("config.toml"))
}

/// Write `config` to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
