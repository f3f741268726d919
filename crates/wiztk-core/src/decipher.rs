//! The read-path pipeline, dual of the encipher pipeline. Parses the cipher
//! packet, re-derives the key, and reverses the chunk transform (decipher,
//! optional PKCS#7 unpad on the final chunk, optional entropy restore),
//! verifying each chunk's HMAC before trusting its plaintext.

use crate::auth::AuthenticateInfo;
use crate::cipher::{pkcs7_unpad, CipherState};
use crate::entropy::EntropyCodec;
use crate::error::{ExceptionAggregator, Result, ToolkitError};
use crate::packet::ContentDescriptor;
use crate::security::constant_time_eq;
use crate::stream::BlobStream;

/// Caps how large a header probe buffer is allowed to grow while hunting for
/// the trailing `<?cipherpacket?>` marker, so a file with no valid header
/// fails fast instead of buffering the whole input.
const MAX_HEADER_PROBE: usize = 4 << 20; // 4 MiB

pub struct DecipherOptions {
    pub properties_path: Option<String>,
    pub transparent_compression: bool,
}

/// Deciphers `input_path` into `output_path`, returning the descriptor that
/// was authenticated (callers may want `about`, timestamps, etc).
#[tracing::instrument(skip(auth, warnings), fields(input_path, output_path))]
pub fn decipher(
    input_path: &str,
    output_path: &str,
    opts: &DecipherOptions,
    auth: &AuthenticateInfo,
    warnings: &ExceptionAggregator,
) -> Result<ContentDescriptor> {
    crate::security::disable_core_dumps();

    let mut ciphertext = BlobStream::open_read(input_path, opts.transparent_compression)?;

    let (descriptor, leftover) = if let Some(props_path) = &opts.properties_path {
        let mut props = BlobStream::open_read(props_path, false)?;
        let header_bytes = read_all(&mut props)?;
        props.close()?;
        let (descriptor, _) = ContentDescriptor::parse(&header_bytes, warnings)?;
        (descriptor, Vec::new())
    } else {
        read_header_from_stream(&mut ciphertext, warnings)?
    };

    let key = auth.authenticate_key(&descriptor.key_id)?;
    let mut cipher_state =
        CipherState::new(descriptor.cipher, descriptor.mode, key.as_slice(), &descriptor.nonce)?;
    let block_size = cipher_state.block_size();

    let mut out = BlobStream::open_write(output_path)?;
    let mut frame = FrameReader::with_leftover(&mut ciphertext, leftover);
    let mut index: u64 = 0;

    loop {
        if frame.is_exhausted()? {
            break;
        }

        let tag = if descriptor.hmac != crate::packet::HmacAlg::None {
            let t = frame.take(descriptor.hmac.digest_size())?;
            if t.len() < descriptor.hmac.digest_size() {
                return Err(ToolkitError::AuthenticateChunk { index });
            }
            Some(t)
        } else {
            None
        };

        let codec = if descriptor.entropy_codec != EntropyCodec::None {
            let b = frame.take(1)?;
            if b.is_empty() {
                return Err(ToolkitError::AuthenticateChunk { index });
            }
            Some(EntropyCodec::from_byte(b[0])?)
        } else {
            None
        };

        let (raw, is_final) = frame.take_chunk(descriptor.chunksize as usize, block_size, descriptor.mode)?;

        let plain_with_pad = cipher_state.decipher(&raw)?;
        let p = if !descriptor.mode.is_stream_mode() && is_final {
            pkcs7_unpad(&plain_with_pad, block_size)?
        } else {
            plain_with_pad
        };

        if let Some(t) = &tag {
            let expected = descriptor.hmac.tag(key.as_slice(), &p);
            if !constant_time_eq(t, &expected) {
                return Err(ToolkitError::AuthenticateChunk { index });
            }
        }

        let restored = match codec {
            Some(c) if c != EntropyCodec::None => c.restore(p.len(), &p)?,
            _ => p,
        };

        out.write(&restored)?;
        index += 1;

        if is_final {
            break;
        }
    }

    out.sync()?;
    out.close()?;
    ciphertext.close()?;
    tracing::debug!(chunk_count = index, "decipher pipeline complete");
    Ok(descriptor)
}

fn read_all(stream: &mut BlobStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let chunk = stream.read(8192)?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Reads a growing prefix of `stream` until [`ContentDescriptor::parse`]
/// succeeds, returning the descriptor plus whatever ciphertext-body bytes
/// were already pulled in past the header's end.
fn read_header_from_stream(
    stream: &mut BlobStream,
    warnings: &ExceptionAggregator,
) -> Result<(ContentDescriptor, Vec<u8>)> {
    let mut probe = Vec::new();
    loop {
        let chunk = stream.read(4096)?;
        if chunk.is_empty() {
            return Err(ToolkitError::AuthenticateHeader);
        }
        probe.extend_from_slice(&chunk);
        match ContentDescriptor::parse(&probe, warnings) {
            Ok((descriptor, end)) => {
                let leftover = probe[end..].to_vec();
                return Ok((descriptor, leftover));
            }
            Err(ToolkitError::AuthenticateHeader) if probe.len() < MAX_HEADER_PROBE => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A small read-ahead buffer over the ciphertext body, needed because chunk
/// boundaries on the wire are not length-prefixed: the final chunk's
/// ciphertext can be anywhere from shorter than `chunksize` (short final
/// plaintext) up to one full block longer than `chunksize` (a final plaintext
/// chunk that was already block-aligned still gets the mandatory extra pad
/// block). Only consumed bytes are ever dropped, so memory stays
/// bounded by a couple of chunks, not the whole file.
struct FrameReader<'a> {
    stream: &'a mut BlobStream,
    buf: Vec<u8>,
    exhausted: bool,
}

impl<'a> FrameReader<'a> {
    fn with_leftover(stream: &'a mut BlobStream, leftover: Vec<u8>) -> Self {
        FrameReader {
            stream,
            buf: leftover,
            exhausted: false,
        }
    }

    fn ensure(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n && !self.exhausted {
            let chunk = self.stream.read(8192)?;
            if chunk.is_empty() {
                self.exhausted = true;
                break;
            }
            self.buf.extend_from_slice(&chunk);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure(n)?;
        let take = n.min(self.buf.len());
        let out = self.buf[..take].to_vec();
        self.buf.drain(..take);
        Ok(out)
    }

    fn push_back(&mut self, bytes: Vec<u8>) {
        let mut combined = bytes;
        combined.extend_from_slice(&self.buf);
        self.buf = combined;
    }

    fn is_exhausted(&mut self) -> Result<bool> {
        self.ensure(1)?;
        Ok(self.buf.is_empty())
    }

    /// Reads one ciphertext chunk, returning `(bytes, is_final)`. See the
    /// type-level doc comment for the boundary logic this implements.
    fn take_chunk(
        &mut self,
        chunksize: usize,
        block_size: usize,
        mode: crate::cipher::CipherMode,
    ) -> Result<(Vec<u8>, bool)> {
        let mut raw = self.take(chunksize)?;
        if raw.len() < chunksize {
            return Ok((raw, true));
        }

        if self.is_exhausted()? {
            return Ok((raw, true));
        }

        if mode.is_stream_mode() {
            // CFB never pads; more bytes after an exact-size read means
            // this was a full interior chunk.
            return Ok((raw, false));
        }

        let extra = self.take(block_size)?;
        if extra.len() == block_size {
            if self.is_exhausted()? {
                raw.extend_from_slice(&extra);
                Ok((raw, true))
            } else {
                self.push_back(extra);
                Ok((raw, false))
            }
        } else {
            // Fewer than a full block remained: those bytes must be the
            // tail of the mandatory pad block at true end of stream.
            raw.extend_from_slice(&extra);
            Ok((raw, true))
        }
    }
}
