//! Ambient configuration: an optional TOML file supplying defaults for the
//! cipher/mode/hmac/entropy/chunksize/key options, so the CLI does not need
//! a wall of required flags for every invocation. CLI flags always win over
//! whatever is loaded here.

use crate::cipher::{CipherKind, CipherMode};
use crate::entropy::EntropyCodec;
use crate::error::{Result, ToolkitError};
use crate::packet::{HmacAlg, KeyHash};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WiztkConfig {
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_hmac")]
    pub hmac: String,
    #[serde(default = "default_entropy")]
    pub entropy_codec: String,
    #[serde(default = "default_entropy_level")]
    pub entropy_level: u32,
    #[serde(default = "default_chunksize")]
    pub chunksize: u64,
    #[serde(default = "default_key_hash")]
    pub key_hash: String,
    #[serde(default = "default_key_length")]
    pub key_length: u32,
    #[serde(default)]
    pub keyring_path: Option<PathBuf>,
    #[serde(default)]
    pub reservoir_path: Option<PathBuf>,
}

fn default_cipher() -> String {
    "AES".to_string()
}
fn default_mode() -> String {
    "CBC".to_string()
}
fn default_hmac() -> String {
    "SHA256".to_string()
}
fn default_entropy() -> String {
    "None".to_string()
}
fn default_entropy_level() -> u32 {
    6
}
fn default_chunksize() -> u64 {
    262_144
}
fn default_key_hash() -> String {
    "SHA256".to_string()
}
fn default_key_length() -> u32 {
    256
}

impl Default for WiztkConfig {
    fn default() -> Self {
        WiztkConfig {
            cipher: default_cipher(),
            mode: default_mode(),
            hmac: default_hmac(),
            entropy_codec: default_entropy(),
            entropy_level: default_entropy_level(),
            chunksize: default_chunksize(),
            key_hash: default_key_hash(),
            key_length: default_key_length(),
            keyring_path: None,
            reservoir_path: None,
        }
    }
}

impl WiztkConfig {
    /// Default path: `$WIZTK_CONFIG`, else `~/.wiztk/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var("WIZTK_CONFIG") {
            return Ok(PathBuf::from(explicit));
        }
        let home = dirs::home_dir().ok_or_else(|| ToolkitError::option("cannot find home directory"))?;
        Ok(home.join(".wiztk").join("config.toml"))
    }

    /// Loads the config at `path` if it exists, else returns the defaults.
    /// A present-but-unparsable file is an error (it was likely hand-edited
    /// and broken, rather than simply absent).
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| ToolkitError::option(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ToolkitError::File(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ToolkitError::option(e.to_string()))?;
        fs::write(path, text)?;
        crate::security::set_secure_permissions(path)?;
        Ok(())
    }

    pub fn cipher(&self) -> Result<CipherKind> {
        CipherKind::from_str(&self.cipher)
    }

    pub fn mode(&self) -> Result<CipherMode> {
        CipherMode::from_str(&self.mode)
    }

    pub fn hmac(&self) -> Result<HmacAlg> {
        HmacAlg::from_str(&self.hmac)
    }

    pub fn entropy_codec(&self) -> Result<EntropyCodec> {
        EntropyCodec::from_str(&self.entropy_codec)
    }

    pub fn key_hash(&self) -> Result<KeyHash> {
        KeyHash::from_str(&self.key_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = WiztkConfig::load(&path).unwrap();
        assert_eq!(config.cipher, "AES");
        assert_eq!(config.chunksize, 262_144);
    }

    #[test]
    fn round_trips_through_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = WiztkConfig::default();
        config.cipher = "Serpent".to_string();
        config.chunksize = 65_536;
        config.save(&path).unwrap();

        let loaded = WiztkConfig::load(&path).unwrap();
        assert_eq!(loaded.cipher, "Serpent");
        assert_eq!(loaded.chunksize, 65_536);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "cipher = \"TwoFish\"\n").unwrap();
        let config = WiztkConfig::load(&path).unwrap();
        assert_eq!(config.cipher, "TwoFish");
        assert_eq!(config.mode, "CBC");
    }
}
