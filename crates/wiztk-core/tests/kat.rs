use secrecy::Secret;
use wiztk_core::auth::AuthenticateInfo;
use wiztk_core::cipher::{CipherKind, CipherMode};
use wiztk_core::digest::DigestAlg;
use wiztk_core::entropy::EntropyCodec;
use wiztk_core::packet::{AuthenticateMethod, HmacAlg, KeyHash};
use wiztk_core::reservoir::RandomReservoir;
use wiztk_core::{decipher, digest_authenticate, digest_generate, encipher};
use wiztk_core::{DecipherOptions, EncipherOptions, ExceptionAggregator};

fn auth(passphrase: &str) -> AuthenticateInfo {
    AuthenticateInfo {
        method: AuthenticateMethod::Secret,
        keyring_path: None,
        key_hash: KeyHash::Sha256,
        key_length: 256,
        passphrase: Secret::new(passphrase.to_string()),
    }
}

fn round_trip(plaintext: &[u8], opts: EncipherOptions, expected_chunks: u64) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("plaintext.bin");
    std::fs::write(&input, plaintext).unwrap();
    let ciphertext = dir.path().join("ciphertext.bin");
    let recovered = dir.path().join("recovered.bin");

    let reservoir = RandomReservoir::open(dir.path().join("reservoir.xdm")).unwrap();
    let warnings = ExceptionAggregator::new();
    let info = auth("correct horse battery staple");

    let chunks = encipher(
        input.to_str().unwrap(),
        ciphertext.to_str().unwrap(),
        &opts,
        &info,
        &reservoir,
        &warnings,
    )
    .unwrap();
    assert_eq!(chunks, expected_chunks);

    let decipher_opts = DecipherOptions {
        properties_path: None,
        transparent_compression: false,
    };
    let descriptor = decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &decipher_opts,
        &info,
        &warnings,
    )
    .unwrap();
    assert_eq!(descriptor.about, input.to_str().unwrap());

    let out = std::fs::read(&recovered).unwrap();
    assert_eq!(out, plaintext);

    reservoir.close().unwrap();
}

fn base_opts(cipher: CipherKind, mode: CipherMode, hmac: HmacAlg, chunksize: u64) -> EncipherOptions {
    EncipherOptions {
        cipher,
        mode,
        hmac,
        entropy_codec: EntropyCodec::None,
        entropy_level: 0,
        chunksize,
        key_hash: KeyHash::Sha256,
        key_length: 256,
        properties_path: None,
        transparent_compression: false,
    }
}

#[test]
fn zero_byte_plaintext_produces_no_chunks() {
    round_trip(
        b"",
        base_opts(CipherKind::Aes, CipherMode::Ctr, HmacAlg::Sha256, 262_144),
        0,
    );
}

#[test]
fn two_aligned_chunks_with_zip_entropy() {
    let plaintext: Vec<u8> = (0u8..64).collect();
    let mut opts = base_opts(CipherKind::Aes, CipherMode::Cbc, HmacAlg::Sha256, 32);
    opts.entropy_codec = EntropyCodec::Zip;
    opts.entropy_level = 9;
    round_trip(&plaintext, opts, 2);
}

#[test]
fn short_final_chunk_under_one_block() {
    let plaintext = b"short tail".to_vec(); // 10 bytes, under one 16-byte block
    round_trip(
        &plaintext,
        base_opts(CipherKind::Serpent, CipherMode::Cbc, HmacAlg::Sha384, 262_144),
        1,
    );
}

#[test]
fn final_chunk_exactly_block_aligned_still_pads() {
    let plaintext = vec![0x5au8; 32]; // exactly two AES blocks
    round_trip(
        &plaintext,
        base_opts(CipherKind::Aes, CipherMode::Cbc, HmacAlg::Sha256, 262_144),
        1,
    );
}

#[test]
fn cfb_stream_mode_never_pads() {
    let plaintext = b"a message that is not block aligned at all".to_vec();
    round_trip(
        &plaintext,
        base_opts(CipherKind::TwoFish, CipherMode::Cfb, HmacAlg::Sha256, 16),
        3,
    );
}

#[test]
fn ofb_with_bzip_entropy_and_sha3_key_hash() {
    let plaintext = b"wizards keep their secrets compressed and authenticated".to_vec();
    let mut opts = base_opts(CipherKind::Serpent, CipherMode::Ofb, HmacAlg::Sha512, 1024);
    opts.entropy_codec = EntropyCodec::Bzip;
    opts.entropy_level = 5;
    opts.key_hash = KeyHash::Sha3_256;
    round_trip(&plaintext, opts, 1);
}

#[test]
fn hmac_none_disables_per_chunk_authentication() {
    let plaintext = b"no authentication requested for this file".to_vec();
    round_trip(
        &plaintext,
        base_opts(CipherKind::Aes, CipherMode::Ctr, HmacAlg::None, 262_144),
        1,
    );
}

#[test]
fn multi_chunk_with_properties_file_header() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("plaintext.bin");
    let plaintext: Vec<u8> = (0u8..200).cycle().take(5000).collect();
    std::fs::write(&input, &plaintext).unwrap();
    let ciphertext = dir.path().join("ciphertext.bin");
    let recovered = dir.path().join("recovered.bin");
    let properties = dir.path().join("header.rdf");

    let reservoir = RandomReservoir::open(dir.path().join("reservoir.xdm")).unwrap();
    let warnings = ExceptionAggregator::new();
    let info = auth("a separate header file");

    let mut opts = base_opts(CipherKind::Aes, CipherMode::Cbc, HmacAlg::Sha256, 1024);
    opts.properties_path = Some(properties.to_str().unwrap().to_string());
    let chunks = encipher(
        input.to_str().unwrap(),
        ciphertext.to_str().unwrap(),
        &opts,
        &info,
        &reservoir,
        &warnings,
    )
    .unwrap();
    assert_eq!(chunks, 5);

    let decipher_opts = DecipherOptions {
        properties_path: Some(properties.to_str().unwrap().to_string()),
        transparent_compression: false,
    };
    decipher(
        ciphertext.to_str().unwrap(),
        recovered.to_str().unwrap(),
        &decipher_opts,
        &info,
        &warnings,
    )
    .unwrap();

    let out = std::fs::read(&recovered).unwrap();
    assert_eq!(out, plaintext);
    reservoir.close().unwrap();
}

#[test]
fn digest_generate_then_authenticate_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.bin");
    std::fs::File::create(&empty).unwrap();
    let filled = dir.path().join("filled.bin");
    std::fs::write(&filled, vec![0xAAu8; 4096]).unwrap();

    let paths = vec![
        empty.to_str().unwrap().to_string(),
        filled.to_str().unwrap().to_string(),
    ];
    let (records, rdf) = digest_generate(&paths, DigestAlg::Sha256).unwrap();
    assert_eq!(
        records[0].hex_digest,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
    );

    let mismatches = digest_authenticate(rdf.as_bytes()).unwrap();
    assert!(mismatches.is_empty());
}

#[test]
fn reservoir_persists_keystream_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reservoir.xdm");

    let first = RandomReservoir::open(&path).unwrap();
    let a = first.get_random_key(64).unwrap();
    first.close().unwrap();

    let second = RandomReservoir::open(&path).unwrap();
    let b = second.get_random_key(64).unwrap();
    second.close().unwrap();

    assert_ne!(a, b, "reusing the same reservoir file must not repeat the keystream");
}

#[test]
fn reservoir_deleted_between_invocations_reseeds_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reservoir.xdm");

    let first = RandomReservoir::open(&path).unwrap();
    let _ = first.get_random_key(32).unwrap();
    first.close().unwrap();
    assert!(path.exists());

    std::fs::remove_file(&path).unwrap();

    let second = RandomReservoir::open(&path).unwrap();
    let out = second.get_random_key(32).unwrap();
    assert_eq!(out.len(), 32);
    second.close().unwrap();
    assert!(path.exists(), "a fresh reservoir file must be written back out");
}
