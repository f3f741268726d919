//! The write-path pipeline. Drives the byte-stream layer, key derivation,
//! nonce generation, cipher state, and the cipher-packet envelope to turn a
//! plaintext file into a self-describing ciphertext file.

use crate::auth::AuthenticateInfo;
use crate::cipher::{pkcs7_pad, CipherKind, CipherMode, CipherState};
use crate::entropy::EntropyCodec;
use crate::error::{ExceptionAggregator, Result, ToolkitError};
use crate::packet::{AuthenticateMethod, ContentDescriptor, HmacAlg, KeyHash};
use crate::reservoir::RandomReservoir;
use crate::stream::BlobStream;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct EncipherOptions {
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub hmac: HmacAlg,
    pub entropy_codec: EntropyCodec,
    pub entropy_level: u32,
    pub chunksize: u64,
    pub key_hash: KeyHash,
    pub key_length: u32,
    pub properties_path: Option<String>,
    pub transparent_compression: bool,
}

/// Encrypts `input_path` into `output_path` under the given options,
/// authenticating with `auth`. Returns the number of chunks written.
#[tracing::instrument(skip(auth, reservoir, warnings), fields(input_path, output_path))]
pub fn encipher(
    input_path: &str,
    output_path: &str,
    opts: &EncipherOptions,
    auth: &AuthenticateInfo,
    reservoir: &RandomReservoir,
    warnings: &ExceptionAggregator,
) -> Result<u64> {
    crate::security::disable_core_dumps();

    if opts.chunksize == 0 {
        return Err(ToolkitError::option("chunksize must be >= 1"));
    }
    let block_size = opts.cipher.block_size() as u64;
    if opts.chunksize % block_size != 0 {
        return Err(ToolkitError::option(format!(
            "chunksize must be a multiple of the block size ({block_size})"
        )));
    }

    let mut plaintext = BlobStream::open_read(input_path, opts.transparent_compression)?;
    let mut ciphertext = BlobStream::open_write(output_path)?;

    let (key, key_id) = auth.generate_key()?;
    let nonce = reservoir.get_random_key(opts.cipher.block_size())?;
    let mut cipher_state = CipherState::new(opts.cipher, opts.mode, key.as_slice(), &nonce)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let descriptor = ContentDescriptor {
        protocol_major: 1,
        protocol_minor: 0,
        cipher: opts.cipher,
        mode: opts.mode,
        nonce: nonce.clone(),
        authenticate_method: AuthenticateMethod::Secret,
        key_hash: opts.key_hash,
        key_length: opts.key_length,
        key_id,
        entropy_codec: opts.entropy_codec,
        entropy_level: EntropyCodec::clamp_level(opts.entropy_level),
        hmac: opts.hmac,
        chunksize: opts.chunksize,
        create_date: now,
        modify_date: now,
        timestamp: now,
        version: format!("wiztk/{}", env!("CARGO_PKG_VERSION")),
        about: input_path.to_string(),
    };
    descriptor.validate()?;

    let header_bytes = descriptor.encode();
    if let Some(props_path) = &opts.properties_path {
        let mut props = BlobStream::open_write(props_path)?;
        props.write(&header_bytes)?;
        props.sync()?;
        props.close()?;
    } else {
        ciphertext.write(&header_bytes)?;
    }

    let chunk_count = write_chunks(
        &mut plaintext,
        &mut ciphertext,
        &mut cipher_state,
        opts,
        key.as_slice(),
        reservoir,
        warnings,
    )?;

    plaintext.close()?;
    ciphertext.close()?;
    tracing::debug!(chunk_count, "encipher pipeline complete");
    Ok(chunk_count)
}

fn write_chunks(
    plaintext: &mut BlobStream,
    ciphertext: &mut BlobStream,
    cipher_state: &mut CipherState,
    opts: &EncipherOptions,
    key: &[u8],
    reservoir: &RandomReservoir,
    warnings: &ExceptionAggregator,
) -> Result<u64> {
    let block_size = cipher_state.block_size();
    let mut index: u64 = 0;

    // Lookahead: keep one chunk "pending" so we always know, before
    // processing it, whether it is the final chunk (grounded in the
    // fill_buf()-emptiness lookahead pattern for snapshot/recovery streams).
    let mut pending = plaintext.read(opts.chunksize as usize)?;
    while !pending.is_empty() {
        let next = plaintext.read(opts.chunksize as usize)?;
        let is_final = next.is_empty();

        write_one_chunk(
            &pending,
            index,
            is_final,
            ciphertext,
            cipher_state,
            opts,
            key,
            reservoir,
            block_size,
            warnings,
        )?;
        index += 1;

        if is_final {
            break;
        }
        pending = next;
    }

    if index == 0 {
        tracing::debug!("zero-byte plaintext: no chunks written");
    }
    Ok(index)
}

#[allow(clippy::too_many_arguments)]
fn write_one_chunk(
    plaintext_chunk: &[u8],
    index: u64,
    is_final: bool,
    ciphertext: &mut BlobStream,
    cipher_state: &mut CipherState,
    opts: &EncipherOptions,
    key: &[u8],
    reservoir: &RandomReservoir,
    block_size: usize,
    warnings: &ExceptionAggregator,
) -> Result<()> {
    let original_len = plaintext_chunk.len();

    let (codec_used, p) = if opts.entropy_codec != EntropyCodec::None {
        let compressed = opts.entropy_codec.increase(plaintext_chunk, opts.entropy_level)?;
        if compressed.len() > original_len {
            warnings.warn(format!(
                "chunk {index}: {} expanded the chunk instead of shrinking it; storing uncompressed",
                opts.entropy_codec.as_str()
            ));
            (EntropyCodec::None, plaintext_chunk.to_vec())
        } else {
            let mut padded = compressed;
            if padded.len() < original_len {
                let filler = reservoir.get_random_key(original_len - padded.len())?;
                padded.extend_from_slice(&filler);
            }
            (opts.entropy_codec, padded)
        }
    } else {
        (EntropyCodec::None, plaintext_chunk.to_vec())
    };

    let tag = if opts.hmac != HmacAlg::None {
        Some(opts.hmac.tag(key, &p))
    } else {
        None
    };

    let to_cipher = if !opts.mode.is_stream_mode() && is_final {
        pkcs7_pad(&p, block_size)
    } else {
        p
    };
    let enciphered = cipher_state.encipher(&to_cipher)?;

    if let Some(t) = &tag {
        ciphertext.write(t)?;
    }
    if opts.entropy_codec != EntropyCodec::None {
        ciphertext.write(&[codec_used as u8])?;
    }
    ciphertext.write(&enciphered)?;
    ciphertext.sync()?;
    Ok(())
}
