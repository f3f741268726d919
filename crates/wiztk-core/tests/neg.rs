use secrecy::Secret;
use wiztk_core::auth::AuthenticateInfo;
use wiztk_core::cipher::{CipherKind, CipherMode};
use wiztk_core::entropy::EntropyCodec;
use wiztk_core::packet::{AuthenticateMethod, ContentDescriptor, HmacAlg, KeyHash};
use wiztk_core::reservoir::RandomReservoir;
use wiztk_core::{decipher, encipher};
use wiztk_core::{DecipherOptions, EncipherOptions, ExceptionAggregator, ToolkitError};

fn auth(passphrase: &str) -> AuthenticateInfo {
    AuthenticateInfo {
        method: AuthenticateMethod::Secret,
        keyring_path: None,
        key_hash: KeyHash::Sha256,
        key_length: 256,
        passphrase: Secret::new(passphrase.to_string()),
    }
}

fn encipher_sample(dir: &std::path::Path, plaintext: &[u8], passphrase: &str) -> std::path::PathBuf {
    let input = dir.join("plaintext.bin");
    std::fs::write(&input, plaintext).unwrap();
    let ciphertext = dir.join("ciphertext.bin");
    let reservoir = RandomReservoir::open(dir.join("reservoir.xdm")).unwrap();
    let warnings = ExceptionAggregator::new();
    let info = auth(passphrase);

    let opts = EncipherOptions {
        cipher: CipherKind::Aes,
        mode: CipherMode::Cbc,
        hmac: HmacAlg::Sha256,
        entropy_codec: EntropyCodec::None,
        entropy_level: 0,
        chunksize: 262_144,
        key_hash: KeyHash::Sha256,
        key_length: 256,
        properties_path: None,
        transparent_compression: false,
    };
    encipher(
        input.to_str().unwrap(),
        ciphertext.to_str().unwrap(),
        &opts,
        &info,
        &reservoir,
        &warnings,
    )
    .unwrap();
    reservoir.close().unwrap();
    ciphertext
}

#[test]
fn corrupt_first_ciphertext_byte_fails_chunk_zero() {
    let dir = tempfile::tempdir().unwrap();
    let ciphertext = encipher_sample(dir.path(), b"hello wizard", "tamper me not");

    let (_descriptor, header_len) =
        ContentDescriptor::parse(&std::fs::read(&ciphertext).unwrap(), &ExceptionAggregator::new()).unwrap();
    let mut bytes = std::fs::read(&ciphertext).unwrap();
    bytes[header_len + 1] ^= 0x01;
    std::fs::write(&ciphertext, &bytes).unwrap();

    let recovered = dir.path().join("recovered.bin");
    let info = auth("tamper me not");
    let warnings = ExceptionAggregator::new();
    let opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let err = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &opts,
        &info,
        &warnings,
    )
    .unwrap_err();
    assert!(matches!(err, ToolkitError::AuthenticateChunk { index: 0 }));
    assert!(!recovered.exists(), "a failed chunk authentication must not leave partial output");
}

#[test]
fn tampered_header_digest_is_rejected_before_any_cipher_work() {
    let dir = tempfile::tempdir().unwrap();
    let ciphertext = encipher_sample(dir.path(), b"hello wizard", "header tamper");

    let mut bytes = std::fs::read(&ciphertext).unwrap();
    let (_descriptor, header_len) = ContentDescriptor::parse(&bytes, &ExceptionAggregator::new()).unwrap();
    let mid = header_len / 2; // inside the RDF header, well before the ciphertext body
    bytes[mid] ^= 0x01;
    std::fs::write(&ciphertext, &bytes).unwrap();

    let recovered = dir.path().join("recovered.bin");
    let info = auth("header tamper");
    let warnings = ExceptionAggregator::new();
    let opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let err = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &opts,
        &info,
        &warnings,
    )
    .unwrap_err();
    assert!(matches!(err, ToolkitError::AuthenticateHeader));
    assert!(!recovered.exists());
}

#[test]
fn wrong_passphrase_fails_key_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let ciphertext = encipher_sample(dir.path(), b"hello wizard", "the right one");

    let recovered = dir.path().join("recovered.bin");
    let wrong = auth("not the right one");
    let warnings = ExceptionAggregator::new();
    let opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let err = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &opts,
        &wrong,
        &warnings,
    )
    .unwrap_err();
    assert!(matches!(err, ToolkitError::AuthenticateKey));
    assert!(!recovered.exists());
}

#[test]
fn truncated_final_chunk_fails_rather_than_silently_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let ciphertext = encipher_sample(dir.path(), &vec![0x11u8; 5000], "truncate me");

    let mut bytes = std::fs::read(&ciphertext).unwrap();
    bytes.truncate(bytes.len() - 3);
    std::fs::write(&ciphertext, &bytes).unwrap();

    let recovered = dir.path().join("recovered.bin");
    let info = auth("truncate me");
    let warnings = ExceptionAggregator::new();
    let opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let err = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &opts,
        &info,
        &warnings,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ToolkitError::AuthenticateChunk { .. } | ToolkitError::Cipher(_)
    ));
}

#[test]
fn bit_flip_in_hmac_tag_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let ciphertext = encipher_sample(dir.path(), b"authenticate this please", "hmac tamper");

    let (_descriptor, header_len) =
        ContentDescriptor::parse(&std::fs::read(&ciphertext).unwrap(), &ExceptionAggregator::new()).unwrap();
    let mut bytes = std::fs::read(&ciphertext).unwrap();
    // The HMAC tag is the first 32 bytes of the chunk body (SHA-256).
    bytes[header_len] ^= 0x80;
    std::fs::write(&ciphertext, &bytes).unwrap();

    let recovered = dir.path().join("recovered.bin");
    let info = auth("hmac tamper");
    let warnings = ExceptionAggregator::new();
    let opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let err = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &opts,
        &info,
        &warnings,
    )
    .unwrap_err();
    assert!(matches!(err, ToolkitError::AuthenticateChunk { index: 0 }));
}
