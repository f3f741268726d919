//! Fixture-driven checker that exercises the public `wiztk_core` pipelines
//! end to end against a set of known-answer and negative scenarios, rather
//! than reimplementing any cryptography by hand.

use anyhow::{anyhow, bail, Context, Result};
use secrecy::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use wiztk_core::auth::AuthenticateInfo;
use wiztk_core::cipher::{CipherKind, CipherMode};
use wiztk_core::digest::DigestAlg;
use wiztk_core::entropy::EntropyCodec;
use wiztk_core::packet::{AuthenticateMethod, HmacAlg, KeyHash};
use wiztk_core::reservoir::RandomReservoir;
use wiztk_core::{decipher, digest_authenticate, digest_generate, encipher, DecipherOptions, EncipherOptions};
use wiztk_core::{ExceptionAggregator, ToolkitError};

#[derive(Deserialize)]
#[serde(tag = "kind")]
enum Scenario {
    #[serde(rename = "round_trip")]
    RoundTrip(RoundTripCase),
    #[serde(rename = "digest")]
    Digest(DigestCase),
    #[serde(rename = "tamper_header_chunk")]
    TamperHeaderChunk(TamperCase),
    #[serde(rename = "wrong_passphrase")]
    WrongPassphrase(RoundTripCase),
}

#[derive(Deserialize)]
struct RoundTripCase {
    name: String,
    #[serde(default)]
    plaintext_hex: String,
    cipher: String,
    mode: String,
    hmac: String,
    #[serde(default = "default_entropy")]
    entropy: String,
    #[serde(default)]
    entropy_level: u32,
    chunksize: u64,
    #[serde(default = "default_key_hash")]
    key_hash: String,
    #[serde(default = "default_key_length")]
    key_length: u32,
    passphrase: String,
    expected_chunk_count: Option<u64>,
}

#[derive(Deserialize)]
struct TamperCase {
    name: String,
    #[serde(default)]
    plaintext_hex: String,
    cipher: String,
    mode: String,
    hmac: String,
    chunksize: u64,
    passphrase: String,
    /// Offset relative to the start of the ciphertext body (after the
    /// header) whose byte gets XORed with 0x01 before decipher is attempted.
    corrupt_offset: usize,
}

#[derive(Deserialize)]
struct DigestCase {
    name: String,
    /// Hex-encoded file contents, one entry per referenced file.
    #[serde(default)]
    files_hex: Vec<String>,
    /// Large repeated-byte files, appended after `files_hex`, specified as
    /// `(fill_byte, length)` so a fixture can name e.g. a 1 MiB file of 0xAA
    /// without inlining two million hex characters.
    #[serde(default)]
    files_fill: Vec<(u8, usize)>,
    #[serde(default = "default_digest_alg")]
    alg: String,
    /// Index into the combined file list to flip a byte in after generating
    /// the manifest, or omit to exercise the clean round trip.
    tamper_index: Option<usize>,
}

fn default_entropy() -> String {
    "None".to_string()
}
fn default_key_hash() -> String {
    "SHA256".to_string()
}
fn default_key_length() -> u32 {
    256
}
fn default_digest_alg() -> String {
    "sha256".to_string()
}

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: verify-vectors <scenarios.json>"))?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let scenarios: Vec<Scenario> = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;

    let mut failures = 0;
    for scenario in scenarios {
        let (name, result) = match &scenario {
            Scenario::RoundTrip(c) => (c.name.clone(), run_round_trip(c)),
            Scenario::Digest(c) => (c.name.clone(), run_digest(c)),
            Scenario::TamperHeaderChunk(c) => (c.name.clone(), run_tamper(c)),
            Scenario::WrongPassphrase(c) => (c.name.clone(), run_wrong_passphrase(c)),
        };
        match result {
            Ok(()) => println!("PASS {name}"),
            Err(e) => {
                println!("FAIL {name}: {e:#}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} scenario(s) failed");
    }
    println!("all scenarios passed");
    Ok(())
}

fn auth_info(passphrase: &str, key_hash: KeyHash, key_length: u32) -> AuthenticateInfo {
    AuthenticateInfo {
        method: AuthenticateMethod::Secret,
        keyring_path: None,
        key_hash,
        key_length,
        passphrase: Secret::new(passphrase.to_string()),
    }
}

fn run_round_trip(c: &RoundTripCase) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let plaintext = hex::decode(&c.plaintext_hex).context("plaintext_hex is not valid hex")?;
    let input = write_temp(&dir, "plaintext.bin", &plaintext)?;
    let ciphertext = dir.path().join("ciphertext.bin");
    let recovered = dir.path().join("recovered.bin");
    let reservoir = RandomReservoir::open(dir.path().join("reservoir.xdm"))?;
    let warnings = ExceptionAggregator::new();
    let auth = auth_info(&c.passphrase, KeyHash::from_str(&c.key_hash)?, c.key_length);

    let opts = EncipherOptions {
        cipher: CipherKind::from_str(&c.cipher)?,
        mode: CipherMode::from_str(&c.mode)?,
        hmac: HmacAlg::from_str(&c.hmac)?,
        entropy_codec: EntropyCodec::from_str(&c.entropy)?,
        entropy_level: c.entropy_level,
        chunksize: c.chunksize,
        key_hash: KeyHash::from_str(&c.key_hash)?,
        key_length: c.key_length,
        properties_path: None,
        transparent_compression: false,
    };

    let chunk_count = encipher(path_str(&input)?, path_str(&ciphertext)?, &opts, &auth, &reservoir, &warnings)?;
    if let Some(expected) = c.expected_chunk_count {
        if chunk_count != expected {
            bail!("expected {expected} chunks, got {chunk_count}");
        }
    }

    let decipher_opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    decipher(path_str(&ciphertext)?, path_str(&recovered)?, &decipher_opts, &auth, &warnings)?;

    let recovered_bytes = std::fs::read(&recovered)?;
    if recovered_bytes != plaintext {
        bail!(
            "round trip mismatch: {} bytes in, {} bytes out",
            plaintext.len(),
            recovered_bytes.len()
        );
    }

    reservoir.close()?;
    Ok(())
}

fn run_wrong_passphrase(c: &RoundTripCase) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let plaintext = hex::decode(&c.plaintext_hex).context("plaintext_hex is not valid hex")?;
    let input = write_temp(&dir, "plaintext.bin", &plaintext)?;
    let ciphertext = dir.path().join("ciphertext.bin");
    let recovered = dir.path().join("recovered.bin");
    let reservoir = RandomReservoir::open(dir.path().join("reservoir.xdm"))?;
    let warnings = ExceptionAggregator::new();

    let key_hash = KeyHash::from_str(&c.key_hash)?;
    let right = auth_info(&c.passphrase, key_hash, c.key_length);
    let wrong = auth_info(&format!("{}-wrong", c.passphrase), key_hash, c.key_length);

    let opts = EncipherOptions {
        cipher: CipherKind::from_str(&c.cipher)?,
        mode: CipherMode::from_str(&c.mode)?,
        hmac: HmacAlg::from_str(&c.hmac)?,
        entropy_codec: EntropyCodec::None,
        entropy_level: 0,
        chunksize: c.chunksize,
        key_hash,
        key_length: c.key_length,
        properties_path: None,
        transparent_compression: false,
    };
    encipher(path_str(&input)?, path_str(&ciphertext)?, &opts, &right, &reservoir, &warnings)?;

    let decipher_opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    match decipher(path_str(&ciphertext)?, path_str(&recovered)?, &decipher_opts, &wrong, &warnings) {
        Err(ToolkitError::AuthenticateKey) => {}
        Err(other) => bail!("expected AuthenticateKey, got {other}"),
        Ok(_) => bail!("decipher unexpectedly succeeded with the wrong passphrase"),
    }
    if recovered.exists() {
        bail!("decipher left an output file behind after a key-authentication failure");
    }

    reservoir.close()?;
    Ok(())
}

fn run_tamper(c: &TamperCase) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let plaintext = hex::decode(&c.plaintext_hex).context("plaintext_hex is not valid hex")?;
    let input = write_temp(&dir, "plaintext.bin", &plaintext)?;
    let ciphertext = dir.path().join("ciphertext.bin");
    let recovered = dir.path().join("recovered.bin");
    let reservoir = RandomReservoir::open(dir.path().join("reservoir.xdm"))?;
    let warnings = ExceptionAggregator::new();
    let auth = auth_info(&c.passphrase, KeyHash::Sha256, 256);

    let opts = EncipherOptions {
        cipher: CipherKind::from_str(&c.cipher)?,
        mode: CipherMode::from_str(&c.mode)?,
        hmac: HmacAlg::from_str(&c.hmac)?,
        entropy_codec: EntropyCodec::None,
        entropy_level: 0,
        chunksize: c.chunksize,
        key_hash: KeyHash::Sha256,
        key_length: 256,
        properties_path: None,
        transparent_compression: false,
    };
    encipher(path_str(&input)?, path_str(&ciphertext)?, &opts, &auth, &reservoir, &warnings)?;

    let (_descriptor, header_len) =
        wiztk_core::ContentDescriptor::parse(&std::fs::read(&ciphertext)?, &warnings)?;
    let mut bytes = std::fs::read(&ciphertext)?;
    let corrupt_at = header_len + c.corrupt_offset;
    if corrupt_at >= bytes.len() {
        bail!("corrupt_offset {} is past end of ciphertext body", c.corrupt_offset);
    }
    bytes[corrupt_at] ^= 0x01;
    std::fs::write(&ciphertext, &bytes)?;

    let decipher_opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    match decipher(path_str(&ciphertext)?, path_str(&recovered)?, &decipher_opts, &auth, &warnings) {
        Err(ToolkitError::AuthenticateChunk { index: 0 }) => {}
        Err(other) => bail!("expected AuthenticateChunk {{ index: 0 }}, got {other}"),
        Ok(_) => bail!("decipher unexpectedly succeeded against tampered ciphertext"),
    }

    reservoir.close()?;
    Ok(())
}

fn run_digest(c: &DigestCase) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut contents: Vec<Vec<u8>> = Vec::new();
    for hex_contents in &c.files_hex {
        contents.push(hex::decode(hex_contents).context("files_hex entry is not valid hex")?);
    }
    for &(fill_byte, len) in &c.files_fill {
        contents.push(vec![fill_byte; len]);
    }

    let mut paths = Vec::with_capacity(contents.len());
    for (i, bytes) in contents.iter().enumerate() {
        let path = write_temp(&dir, &format!("file{i}.bin"), bytes)?;
        paths.push(path_str(&path)?.to_string());
    }

    let alg = DigestAlg::from_str(&c.alg)?;
    let (records, rdf) = digest_generate(&paths, alg)?;
    if records.len() != paths.len() {
        bail!("expected {} digest records, got {}", paths.len(), records.len());
    }

    if let Some(idx) = c.tamper_index {
        let target = Path::new(&paths[idx]);
        let mut bytes = std::fs::read(target)?;
        if bytes.is_empty() {
            bytes.push(0);
        } else {
            bytes[0] ^= 0x01;
        }
        std::fs::write(target, bytes)?;

        let mismatches = digest_authenticate(rdf.as_bytes())?;
        if mismatches.len() != 1 {
            bail!("expected exactly 1 mismatch after tampering, got {}", mismatches.len());
        }
        if mismatches[0].path != paths[idx] {
            bail!("mismatch reported the wrong path: {}", mismatches[0].path);
        }
    } else {
        let mismatches = digest_authenticate(rdf.as_bytes())?;
        if !mismatches.is_empty() {
            bail!("expected a clean digest authentication, got {} mismatch(es)", mismatches.len());
        }
    }
    Ok(())
}

fn write_temp(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| anyhow!("path is not valid UTF-8"))
}
