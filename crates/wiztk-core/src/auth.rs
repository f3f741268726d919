//! Derives a symmetric key from a passphrase plus a key-hash and
//! key-length, produces a stable key-id, and optionally reads/writes an
//! encrypted-at-rest keyring mapping `key_id -> key`.

use crate::error::{Result, ToolkitError};
use crate::packet::KeyHash;
use crate::security::{set_secure_permissions, SecureMemory};
use aes_gcm::aead::{Aead, KeyInit as AeadKeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::packet::AuthenticateMethod;

pub struct AuthenticateInfo {
    pub method: AuthenticateMethod,
    pub keyring_path: Option<PathBuf>,
    pub key_hash: KeyHash,
    pub key_length: u32,
    pub passphrase: Secret<String>,
}

impl AuthenticateInfo {
    /// `set_key_length`: only {256, 512, 1024, 2048} bits are valid.
    pub fn validate_key_length(bits: u32) -> Result<u32> {
        if matches!(bits, 256 | 512 | 1024 | 2048) {
            Ok(bits)
        } else {
            Err(ToolkitError::option(format!("invalid key length {bits} bits")))
        }
    }

    /// Encipher-side: derives `(key, key_id)` from the configured passphrase,
    /// and writes `key_id -> key` to the keyring if one is configured. The
    /// returned key lives in an `mlock`ed, zeroize-on-drop buffer for the
    /// rest of the pipeline's lifetime.
    pub fn generate_key(&self) -> Result<(SecureMemory, Vec<u8>)> {
        let key_length = Self::validate_key_length(self.key_length)?;
        let mut key_bytes = derive_key(
            self.passphrase.expose_secret().as_bytes(),
            self.key_hash,
            key_length,
        );
        let key_id = key_id_of(&key_bytes, self.key_hash);

        if let Some(path) = &self.keyring_path {
            let mut keyring = Keyring::load(path).unwrap_or_default();
            keyring.insert(&key_id, &key_bytes);
            keyring.save(path)?;
        }

        let key = SecureMemory::from_slice(&key_bytes)?;
        key_bytes.zeroize();
        Ok((key, key_id))
    }

    /// Decipher-side: re-derives the key from the passphrase and checks its
    /// id matches `key_id` from the packet; falls back to a keyring lookup
    /// on mismatch. Fails with `AuthenticateKey` if neither succeeds.
    pub fn authenticate_key(&self, key_id: &[u8]) -> Result<SecureMemory> {
        let key_length = Self::validate_key_length(self.key_length)?;
        let mut candidate = derive_key(
            self.passphrase.expose_secret().as_bytes(),
            self.key_hash,
            key_length,
        );
        if crate::security::constant_time_eq(&key_id_of(&candidate, self.key_hash), key_id) {
            let key = SecureMemory::from_slice(&candidate)?;
            candidate.zeroize();
            return Ok(key);
        }
        candidate.zeroize();

        if let Some(path) = &self.keyring_path {
            if let Ok(keyring) = Keyring::load(path) {
                if let Some(mut key_bytes) = keyring.get(key_id) {
                    let key = SecureMemory::from_slice(&key_bytes)?;
                    key_bytes.zeroize();
                    return Ok(key);
                }
            }
        }

        Err(ToolkitError::AuthenticateKey)
    }
}

/// Stretches `passphrase` into `key_length/8` bytes of key material using it
/// as an HMAC key over a deterministic, key-hash/key-length-derived salt,
/// expanding past one digest with a counter when more bytes are needed.
fn derive_key(passphrase: &[u8], key_hash: KeyHash, key_length_bits: u32) -> Vec<u8> {
    let out_len = (key_length_bits / 8) as usize;
    let salt = format!("wiztk-key-salt:{}:{}", key_hash.as_str(), key_length_bits);

    let mut out = Vec::with_capacity(out_len);
    let mut counter: u32 = 0;
    while out.len() < out_len {
        let block = hmac_with(key_hash, passphrase, &[salt.as_bytes(), &counter.to_be_bytes()].concat());
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(out_len);
    out
}

fn hmac_with(key_hash: KeyHash, key: &[u8], data: &[u8]) -> Vec<u8> {
    match key_hash {
        KeyHash::Sha256 | KeyHash::Sha3_256 => {
            let mut mac = Hmac::<sha2::Sha256>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        KeyHash::Sha384 => {
            let mut mac = Hmac::<sha2::Sha384>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        KeyHash::Sha512 => {
            let mut mac = Hmac::<sha2::Sha512>::new_from_slice(key).expect("hmac key");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn key_id_of(key: &[u8], key_hash: KeyHash) -> Vec<u8> {
    let digest = match key_hash {
        KeyHash::Sha256 | KeyHash::Sha3_256 => sha2::Sha256::digest(key).to_vec(),
        KeyHash::Sha384 => sha2::Sha384::digest(key).to_vec(),
        KeyHash::Sha512 => sha2::Sha512::digest(key).to_vec(),
    };
    digest[..key_hash.digest_len()].to_vec()
}

/// An at-rest `key_id -> key` table, encrypted with an Argon2id-stretched
/// passphrase feeding AES-256-GCM.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyringRecords {
    entries: HashMap<String, String>, // hex(key_id) -> base64(key)
}

pub struct Keyring {
    records: KeyringRecords,
}

impl Default for Keyring {
    fn default() -> Self {
        Keyring {
            records: KeyringRecords::default(),
        }
    }
}

impl Keyring {
    pub fn insert(&mut self, key_id: &[u8], key: &[u8]) {
        use base64::Engine;
        self.records
            .entries
            .insert(hex::encode(key_id), base64::engine::general_purpose::STANDARD.encode(key));
    }

    pub fn remove(&mut self, key_id_hex: &str) -> bool {
        self.records.entries.remove(key_id_hex).is_some()
    }

    pub fn list(&self) -> Vec<&str> {
        self.records.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn get(&self, key_id: &[u8]) -> Option<Vec<u8>> {
        use base64::Engine;
        let b64 = self.records.entries.get(&hex::encode(key_id))?;
        base64::engine::general_purpose::STANDARD.decode(b64).ok()
    }

    /// Plaintext load/save (no `WIZTK_KEYRING_PASSPHRASE` in the
    /// environment): used by default so a keyring "just works" without
    /// additional setup.
    pub fn load(path: &Path) -> Result<Self> {
        if let Ok(passphrase) = std::env::var("WIZTK_KEYRING_PASSPHRASE") {
            return Self::load_encrypted(path, passphrase.as_bytes());
        }
        let data = fs::read_to_string(path)?;
        let records: KeyringRecords =
            serde_json::from_str(&data).map_err(|e| ToolkitError::option(e.to_string()))?;
        Ok(Keyring { records })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Ok(passphrase) = std::env::var("WIZTK_KEYRING_PASSPHRASE") {
            return self.save_encrypted(path, passphrase.as_bytes());
        }
        let data =
            serde_json::to_string_pretty(&self.records).map_err(|e| ToolkitError::option(e.to_string()))?;
        fs::write(path, data)?;
        set_secure_permissions(path)?;
        Ok(())
    }

    fn load_encrypted(path: &Path, passphrase: &[u8]) -> Result<Self> {
        let blob = fs::read(path)?;
        if blob.len() < 16 + 12 {
            return Err(ToolkitError::option("keyring file truncated"));
        }
        let salt = &blob[..16];
        let nonce = &blob[16..28];
        let ciphertext = &blob[28..];
        let key = derive_key_argon2id(passphrase, salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| ToolkitError::option(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ToolkitError::AuthenticateKey)?;
        let records: KeyringRecords =
            serde_json::from_slice(&plaintext).map_err(|e| ToolkitError::option(e.to_string()))?;
        Ok(Keyring { records })
    }

    fn save_encrypted(&self, path: &Path, passphrase: &[u8]) -> Result<()> {
        let mut salt = [0u8; 16];
        getrandom::getrandom(&mut salt).map_err(|e| ToolkitError::random(e.to_string()))?;
        let key = derive_key_argon2id(passphrase, &salt)?;
        let mut nonce = [0u8; 12];
        getrandom::getrandom(&mut nonce).map_err(|e| ToolkitError::random(e.to_string()))?;

        let plaintext =
            serde_json::to_vec(&self.records).map_err(|e| ToolkitError::option(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| ToolkitError::option(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|e| ToolkitError::option(e.to_string()))?;

        let mut blob = Vec::with_capacity(16 + 12 + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        fs::write(path, blob)?;
        set_secure_permissions(path)?;
        Ok(())
    }
}

fn derive_key_argon2id(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    let params = Params::new(19456, 2, 1, None).map_err(|e| ToolkitError::option(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    argon
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|e| ToolkitError::option(e.to_string()))?;
    Ok(out)
}

/// Default `~/.wiztk/keyring` path, created lazily on first use.
pub fn default_keyring_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| ToolkitError::option("cannot find home directory"))?;
    let dir = home.join(".wiztk");
    fs::create_dir_all(&dir)?;
    Ok(dir.join("keyring"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_passphrase_same_key_id() {
        let info = AuthenticateInfo {
            method: AuthenticateMethod::Secret,
            keyring_path: None,
            key_hash: KeyHash::Sha256,
            key_length: 256,
            passphrase: Secret::new("correct horse battery staple".to_string()),
        };
        let (key_a, id_a) = info.generate_key().unwrap();
        let (key_b, id_b) = info.generate_key().unwrap();
        assert_eq!(key_a.as_slice(), key_b.as_slice());
        assert_eq!(id_a, id_b);
        assert_eq!(key_a.len(), 32);
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let right = AuthenticateInfo {
            method: AuthenticateMethod::Secret,
            keyring_path: None,
            key_hash: KeyHash::Sha256,
            key_length: 256,
            passphrase: Secret::new("right".to_string()),
        };
        let (_, key_id) = right.generate_key().unwrap();

        let wrong = AuthenticateInfo {
            method: AuthenticateMethod::Secret,
            keyring_path: None,
            key_hash: KeyHash::Sha256,
            key_length: 256,
            passphrase: Secret::new("wrong".to_string()),
        };
        let err = wrong.authenticate_key(&key_id).unwrap_err();
        assert!(matches!(err, ToolkitError::AuthenticateKey));
    }

    #[test]
    fn keyring_round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        let mut keyring = Keyring::default();
        keyring.insert(b"id1", b"supersecretkeybytes");
        keyring.save(&path).unwrap();

        let loaded = Keyring::load(&path).unwrap();
        assert_eq!(loaded.get(b"id1").unwrap(), b"supersecretkeybytes");
    }
}
