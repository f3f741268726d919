//! The cipher-packet envelope — generates and parses the self-describing
//! RDF/XML header.

use crate::cipher::{CipherKind, CipherMode};
use crate::entropy::EntropyCodec;
use crate::error::{ExceptionAggregator, Result, ToolkitError};
use crate::xml;
use sha2::{Digest, Sha256};
use std::io::Read;

/// `cipher:*` fields `descriptor_from_node` understands. Anything else is
/// tolerated and reported as a warning rather than a parse error.
const KNOWN_CIPHER_FIELDS: &[&str] = &[
    "cipher:session",
    "cipher:id",
    "cipher:protocol",
    "cipher:type",
    "cipher:mode",
    "cipher:nonce",
    "cipher:authenticate",
    "cipher:key-hash",
    "cipher:key-length",
    "cipher:entropy",
    "cipher:level",
    "cipher:hmac",
    "cipher:chunksize",
    "cipher:create-date",
    "cipher:modify-date",
    "cipher:timestamp",
    "cipher:version",
];

/// `cipher:authenticate` — public-key operation is out of scope and left as
/// a stub; the variant exists only so unknown-packet parsing can name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticateMethod {
    Secret,
    Public,
}

impl AuthenticateMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthenticateMethod::Secret => "Secret",
            AuthenticateMethod::Public => "Public",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "Secret" => Ok(AuthenticateMethod::Secret),
            "Public" => Ok(AuthenticateMethod::Public),
            other => Err(ToolkitError::option(format!("unknown authenticate method {other}"))),
        }
    }
}

/// `cipher:key-hash` — the hash used to stretch a passphrase into a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHash {
    Sha256,
    Sha384,
    Sha512,
    Sha3_256,
}

impl KeyHash {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyHash::Sha256 => "SHA256",
            KeyHash::Sha384 => "SHA384",
            KeyHash::Sha512 => "SHA512",
            KeyHash::Sha3_256 => "SHA3256",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "SHA256" => Ok(KeyHash::Sha256),
            "SHA384" => Ok(KeyHash::Sha384),
            "SHA512" => Ok(KeyHash::Sha512),
            "SHA3256" => Ok(KeyHash::Sha3_256),
            other => Err(ToolkitError::option(format!("unknown key-hash {other}"))),
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            KeyHash::Sha256 | KeyHash::Sha3_256 => 32,
            KeyHash::Sha384 => 48,
            KeyHash::Sha512 => 64,
        }
    }
}

/// `cipher:hmac` — `None` disables per-chunk authentication entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlg {
    None,
    Sha256,
    Sha384,
    Sha512,
}

impl HmacAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            HmacAlg::None => "None",
            HmacAlg::Sha256 => "SHA256",
            HmacAlg::Sha384 => "SHA384",
            HmacAlg::Sha512 => "SHA512",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(HmacAlg::None),
            "SHA256" => Ok(HmacAlg::Sha256),
            "SHA384" => Ok(HmacAlg::Sha384),
            "SHA512" => Ok(HmacAlg::Sha512),
            other => Err(ToolkitError::option(format!("unknown hmac algorithm {other}"))),
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            HmacAlg::None => 0,
            HmacAlg::Sha256 => 32,
            HmacAlg::Sha384 => 48,
            HmacAlg::Sha512 => 64,
        }
    }

    /// Computes the HMAC tag of `data` under `key`. Panics only on an
    /// HMAC-key-init failure, which cannot happen for these hash families
    /// (they accept any key length).
    pub fn tag(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        use hmac::{Hmac, Mac};
        match self {
            HmacAlg::None => Vec::new(),
            HmacAlg::Sha256 => {
                let mut mac = Hmac::<sha2::Sha256>::new_from_slice(key).expect("hmac key");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacAlg::Sha384 => {
                let mut mac = Hmac::<sha2::Sha384>::new_from_slice(key).expect("hmac key");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HmacAlg::Sha512 => {
                let mut mac = Hmac::<sha2::Sha512>::new_from_slice(key).expect("hmac key");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

/// The cipher packet itself.
#[derive(Debug, Clone)]
pub struct ContentDescriptor {
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub nonce: Vec<u8>,
    pub authenticate_method: AuthenticateMethod,
    pub key_hash: KeyHash,
    pub key_length: u32,
    pub key_id: Vec<u8>,
    pub entropy_codec: EntropyCodec,
    pub entropy_level: u32,
    pub hmac: HmacAlg,
    pub chunksize: u64,
    pub create_date: i64,
    pub modify_date: i64,
    pub timestamp: i64,
    pub version: String,
    pub about: String,
}

impl ContentDescriptor {
    /// Validates the invariants a well-formed `ContentDescriptor` must hold.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_major != 1 {
            return Err(ToolkitError::option(format!(
                "unsupported protocol major version {}",
                self.protocol_major
            )));
        }
        if self.mode.requires_nonce() && self.nonce.len() < self.cipher.block_size() {
            return Err(ToolkitError::option(
                "nonce shorter than the mode's required block size",
            ));
        }
        if !matches!(self.key_length, 256 | 512 | 1024 | 2048) {
            return Err(ToolkitError::option(format!(
                "invalid key length {} bits",
                self.key_length
            )));
        }
        if self.chunksize == 0 {
            return Err(ToolkitError::option("chunksize must be >= 1"));
        }
        Ok(())
    }

    /// Builds the RDF body (without the `<?cipherpacket?>` wrapper).
    fn render_rdf(&self) -> String {
        let mut body = String::new();
        body.push_str("<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\" xmlns:cipher=\"http://www.wizardtoolkit.org/cipher/1.0/\">\n");
        body.push_str(&format!(
            "  <cipher:Content rdf:about=\"{}\">\n",
            xml::escape(&self.about)
        ));
        body.push_str(&format!("    <cipher:type>{}</cipher:type>\n", self.cipher.as_str()));
        body.push_str(&format!("    <cipher:mode>{}</cipher:mode>\n", self.mode.as_str()));
        body.push_str(&format!("    <cipher:nonce>{}</cipher:nonce>\n", hex::encode(&self.nonce)));
        body.push_str(&format!(
            "    <cipher:authenticate>{}</cipher:authenticate>\n",
            self.authenticate_method.as_str()
        ));
        body.push_str(&format!("    <cipher:id>{}</cipher:id>\n", hex::encode(&self.key_id)));
        body.push_str(&format!("    <cipher:key-hash>{}</cipher:key-hash>\n", self.key_hash.as_str()));
        body.push_str(&format!("    <cipher:key-length>{}</cipher:key-length>\n", self.key_length));
        body.push_str(&format!("    <cipher:entropy>{}</cipher:entropy>\n", self.entropy_codec.as_str()));
        body.push_str(&format!("    <cipher:level>{}</cipher:level>\n", self.entropy_level));
        body.push_str(&format!("    <cipher:hmac>{}</cipher:hmac>\n", self.hmac.as_str()));
        body.push_str(&format!("    <cipher:chunksize>{}</cipher:chunksize>\n", self.chunksize));
        body.push_str(&format!(
            "    <cipher:modify-date>{}</cipher:modify-date>\n",
            format_timestamp(self.modify_date)
        ));
        body.push_str(&format!(
            "    <cipher:create-date>{}</cipher:create-date>\n",
            format_timestamp(self.create_date)
        ));
        body.push_str(&format!(
            "    <cipher:timestamp>{}</cipher:timestamp>\n",
            format_timestamp(self.timestamp)
        ));
        body.push_str(&format!(
            "    <cipher:protocol>{}.{}</cipher:protocol>\n",
            self.protocol_major, self.protocol_minor
        ));
        body.push_str(&format!("    <cipher:version>{}</cipher:version>\n", xml::escape(&self.version)));
        body.push_str("  </cipher:Content>\n");
        body.push_str("</rdf:RDF>\n");
        body
    }

    /// Produces the full wire-format bytes: `<?cipherpacket ...?>` wrapper,
    /// RDF body, and trailing `<?cipherpacket?>\f\n`.
    pub fn encode(&self) -> Vec<u8> {
        let rdf = self.render_rdf();
        let digest = hex::encode(Sha256::digest(rdf.as_bytes()));
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("<?cipherpacket digest=\"{}\" bytes=\"{}\"?>\n", digest, rdf.len()).as_bytes(),
        );
        out.extend_from_slice(rdf.as_bytes());
        out.extend_from_slice(b"<?cipherpacket?>\x0c\n");
        out
    }

    /// Parses a `ContentDescriptor` (plus the byte offset just past the
    /// trailing `<?cipherpacket?>\f\n`) from the front of `input`.
    ///
    /// Scans byte by byte without assuming well-formed XML until the `?>`
    /// that terminates the opening processing instruction, so a corrupt
    /// header is rejected before any cipher work is attempted.
    pub fn parse(input: &[u8], warnings: &ExceptionAggregator) -> Result<(Self, usize)> {
        let pi_start = find(input, b"<?cipherpacket").ok_or_else(|| {
            ToolkitError::AuthenticateHeader
        })?;
        let pi_end = find(&input[pi_start..], b"?>")
            .map(|rel| pi_start + rel + 2)
            .ok_or(ToolkitError::AuthenticateHeader)?;
        let pi_text = std::str::from_utf8(&input[pi_start..pi_end])
            .map_err(|_| ToolkitError::AuthenticateHeader)?;

        let digest_hex = extract_attr(pi_text, "digest").ok_or(ToolkitError::AuthenticateHeader)?;
        let bytes_len: usize = extract_attr(pi_text, "bytes")
            .and_then(|s| s.parse().ok())
            .ok_or(ToolkitError::AuthenticateHeader)?;

        let body_start = pi_end + if input.get(pi_end) == Some(&b'\n') { 1 } else { 0 };
        if input.len() < body_start + bytes_len {
            return Err(ToolkitError::AuthenticateHeader);
        }
        let body = &input[body_start..body_start + bytes_len];

        let actual_digest = hex::encode(Sha256::digest(body));
        if !crate::security::constant_time_eq(actual_digest.as_bytes(), digest_hex.to_lowercase().as_bytes()) {
            return Err(ToolkitError::AuthenticateHeader);
        }

        let root = xml::parse(body)?;
        let content = root
            .child("cipher:Content")
            .or_else(|| root.child("rdf:Description"))
            .ok_or_else(|| ToolkitError::option("cipher packet missing cipher:Content"))?;

        let descriptor = descriptor_from_node(content, warnings)?;
        descriptor.validate()?;

        let trailer_rel = find(&input[body_start + bytes_len..], b"<?cipherpacket?>")
            .ok_or(ToolkitError::AuthenticateHeader)?;
        let trailer_start = body_start + bytes_len + trailer_rel;
        let mut end = trailer_start + "<?cipherpacket?>".len();
        if input.get(end) == Some(&0x0c) {
            end += 1;
        }
        if input.get(end) == Some(&b'\n') {
            end += 1;
        }

        Ok((descriptor, end))
    }
}

fn descriptor_from_node(
    content: &xml::XmlNode,
    warnings: &ExceptionAggregator,
) -> Result<ContentDescriptor> {
    // Duplicate elements: last writer wins.
    let text = |tag: &str| {
        content
            .children_named(tag)
            .last()
            .map(|c| c.text.trim().to_string())
    };
    let need = |tag: &str| {
        text(tag).ok_or_else(|| ToolkitError::option(format!("cipher packet missing {tag}")))
    };

    for child in &content.children {
        if child.name.starts_with("cipher:") && !KNOWN_CIPHER_FIELDS.contains(&child.name.as_str()) {
            warnings.warn(format!("unknown cipher packet field {}", child.name));
        }
    }

    // session/id tie-break: id always wins, session is
    // accepted but ignored for backward compatibility.
    if content.child("cipher:session").is_some() && content.child("cipher:id").is_none() {
        warnings.warn("cipher packet used deprecated cipher:session without cipher:id");
    }
    let key_id_hex = need("cipher:id")?;

    let protocol = need("cipher:protocol")?;
    let (major, minor) = protocol
        .split_once('.')
        .ok_or_else(|| ToolkitError::option("malformed cipher:protocol"))?;

    let cipher = CipherKind::from_str(&need("cipher:type")?)?;
    let mode = CipherMode::from_str(&need("cipher:mode")?)?;
    let nonce = hex::decode(need("cipher:nonce")?)
        .map_err(|_| ToolkitError::option("cipher:nonce is not valid hex"))?;
    if mode.requires_nonce() && nonce.len() < cipher.block_size() {
        return Err(ToolkitError::option(
            "decoded nonce shorter than the mode's required block size",
        ));
    }

    Ok(ContentDescriptor {
        protocol_major: major
            .parse()
            .map_err(|_| ToolkitError::option("malformed cipher:protocol major"))?,
        protocol_minor: minor
            .parse()
            .map_err(|_| ToolkitError::option("malformed cipher:protocol minor"))?,
        cipher,
        mode,
        nonce,
        authenticate_method: AuthenticateMethod::from_str(&need("cipher:authenticate")?)?,
        key_hash: KeyHash::from_str(&need("cipher:key-hash")?)?,
        key_length: need("cipher:key-length")?
            .parse()
            .map_err(|_| ToolkitError::option("malformed cipher:key-length"))?,
        key_id: hex::decode(key_id_hex).map_err(|_| ToolkitError::option("cipher:id is not valid hex"))?,
        entropy_codec: EntropyCodec::from_str(&need("cipher:entropy")?)?,
        entropy_level: need("cipher:level")?
            .parse()
            .map_err(|_| ToolkitError::option("malformed cipher:level"))?,
        hmac: HmacAlg::from_str(&need("cipher:hmac")?)?,
        chunksize: need("cipher:chunksize")?
            .parse()
            .map_err(|_| ToolkitError::option("malformed cipher:chunksize"))?,
        create_date: parse_timestamp(&need("cipher:create-date")?)?,
        modify_date: parse_timestamp(&need("cipher:modify-date")?)?,
        timestamp: parse_timestamp(&need("cipher:timestamp")?)?,
        version: text("cipher:version").unwrap_or_default(),
        about: content.attr("rdf:about").unwrap_or_default().to_string(),
    })
}

fn extract_attr<'a>(pi_text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}=\"");
    let start = pi_text.find(&needle)? + needle.len();
    let end = pi_text[start..].find('"')? + start;
    Some(&pi_text[start..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn parse_timestamp(s: &str) -> Result<i64> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| ToolkitError::option(format!("malformed timestamp {s}")))
}

/// Reads a cipher packet from a stream-like reader rather than a byte slice,
/// used when the packet lives in a separate properties file.
pub fn parse_from_reader<R: Read>(
    mut reader: R,
    warnings: &ExceptionAggregator,
) -> Result<ContentDescriptor> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let (descriptor, _) = ContentDescriptor::parse(&buf, warnings)?;
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContentDescriptor {
        ContentDescriptor {
            protocol_major: 1,
            protocol_minor: 0,
            cipher: CipherKind::Aes,
            mode: CipherMode::Cbc,
            nonce: vec![0x11; 16],
            authenticate_method: AuthenticateMethod::Secret,
            key_hash: KeyHash::Sha256,
            key_length: 256,
            key_id: vec![0xab; 32],
            entropy_codec: EntropyCodec::Zip,
            entropy_level: 9,
            hmac: HmacAlg::Sha256,
            chunksize: 32,
            create_date: 1_700_000_000,
            modify_date: 1_700_000_000,
            timestamp: 1_700_000_000,
            version: "wiztk/0.1.0".to_string(),
            about: "plaintext.txt".to_string(),
        }
    }

    #[test]
    fn round_trips_through_encode_parse() {
        let descriptor = sample();
        let encoded = descriptor.encode();
        let (parsed, end) = ContentDescriptor::parse(&encoded, &ExceptionAggregator::new()).unwrap();
        assert_eq!(end, encoded.len());
        assert_eq!(parsed.cipher, descriptor.cipher);
        assert_eq!(parsed.mode, descriptor.mode);
        assert_eq!(parsed.nonce, descriptor.nonce);
        assert_eq!(parsed.key_id, descriptor.key_id);
        assert_eq!(parsed.chunksize, descriptor.chunksize);
    }

    #[test]
    fn tampered_header_digest_is_rejected() {
        let descriptor = sample();
        let mut encoded = descriptor.encode();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0x01;
        let err = ContentDescriptor::parse(&encoded, &ExceptionAggregator::new()).unwrap_err();
        assert!(matches!(err, ToolkitError::AuthenticateHeader));
    }

    /// Wraps a hand-built RDF body in the `<?cipherpacket?>` digest envelope,
    /// the way `encode()` does, so a test can inject fields `render_rdf()`
    /// never would.
    fn encode_raw(rdf: &str) -> Vec<u8> {
        let digest = hex::encode(Sha256::digest(rdf.as_bytes()));
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("<?cipherpacket digest=\"{}\" bytes=\"{}\"?>\n", digest, rdf.len()).as_bytes(),
        );
        out.extend_from_slice(rdf.as_bytes());
        out.extend_from_slice(b"<?cipherpacket?>\x0c\n");
        out
    }

    #[test]
    fn duplicate_cipher_element_last_writer_wins() {
        let rdf = format!(
            "<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\" xmlns:cipher=\"http://www.wizardtoolkit.org/cipher/1.0/\">\n\
             <cipher:Content rdf:about=\"plaintext.txt\">\n\
             <cipher:type>AES</cipher:type>\n\
             <cipher:type>TwoFish</cipher:type>\n\
             <cipher:mode>CBC</cipher:mode>\n\
             <cipher:nonce>{nonce}</cipher:nonce>\n\
             <cipher:authenticate>Secret</cipher:authenticate>\n\
             <cipher:id>{key_id}</cipher:id>\n\
             <cipher:key-hash>SHA256</cipher:key-hash>\n\
             <cipher:key-length>256</cipher:key-length>\n\
             <cipher:entropy>None</cipher:entropy>\n\
             <cipher:level>0</cipher:level>\n\
             <cipher:hmac>SHA256</cipher:hmac>\n\
             <cipher:chunksize>32</cipher:chunksize>\n\
             <cipher:modify-date>2023-11-14T22:13:20</cipher:modify-date>\n\
             <cipher:create-date>2023-11-14T22:13:20</cipher:create-date>\n\
             <cipher:timestamp>2023-11-14T22:13:20</cipher:timestamp>\n\
             <cipher:protocol>1.0</cipher:protocol>\n\
             </cipher:Content>\n\
             </rdf:RDF>\n",
            nonce = hex::encode([0x11u8; 16]),
            key_id = hex::encode([0xabu8; 32]),
        );
        let encoded = encode_raw(&rdf);
        let warnings = ExceptionAggregator::new();
        let (descriptor, _) = ContentDescriptor::parse(&encoded, &warnings).unwrap();
        assert_eq!(descriptor.cipher, CipherKind::TwoFish);
    }

    #[test]
    fn unknown_cipher_field_warns_instead_of_failing() {
        let rdf = format!(
            "<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\" xmlns:cipher=\"http://www.wizardtoolkit.org/cipher/1.0/\">\n\
             <cipher:Content rdf:about=\"plaintext.txt\">\n\
             <cipher:type>AES</cipher:type>\n\
             <cipher:mode>CBC</cipher:mode>\n\
             <cipher:nonce>{nonce}</cipher:nonce>\n\
             <cipher:authenticate>Secret</cipher:authenticate>\n\
             <cipher:id>{key_id}</cipher:id>\n\
             <cipher:key-hash>SHA256</cipher:key-hash>\n\
             <cipher:key-length>256</cipher:key-length>\n\
             <cipher:entropy>None</cipher:entropy>\n\
             <cipher:level>0</cipher:level>\n\
             <cipher:hmac>SHA256</cipher:hmac>\n\
             <cipher:chunksize>32</cipher:chunksize>\n\
             <cipher:modify-date>2023-11-14T22:13:20</cipher:modify-date>\n\
             <cipher:create-date>2023-11-14T22:13:20</cipher:create-date>\n\
             <cipher:timestamp>2023-11-14T22:13:20</cipher:timestamp>\n\
             <cipher:protocol>1.0</cipher:protocol>\n\
             <cipher:future-field>surprise</cipher:future-field>\n\
             </cipher:Content>\n\
             </rdf:RDF>\n",
            nonce = hex::encode([0x11u8; 16]),
            key_id = hex::encode([0xabu8; 32]),
        );
        let encoded = encode_raw(&rdf);
        let warnings = ExceptionAggregator::new();
        let (_descriptor, _) = ContentDescriptor::parse(&encoded, &warnings).unwrap();
        let drained = warnings.drain();
        assert!(drained.iter().any(|w| w.message.contains("cipher:future-field")));
    }
}
