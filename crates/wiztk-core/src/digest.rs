//! An independent generate/authenticate RDF digest pipeline. Shares no
//! state with the encipher/decipher pipelines beyond the `xml` module —
//! this is a plain hash-and-record utility, not part of the cipher engine.

use crate::error::{Result, ToolkitError};
use crate::stream::BlobStream;
use crate::xml;
use sha2::Digest as Sha2Digest;
use std::time::{SystemTime, UNIX_EPOCH};

/// The hash algorithms `digest:<alg>` may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlg {
    Sha256,
    Sha384,
    Sha512,
    Sha3_256,
}

impl DigestAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlg::Sha256 => "sha256",
            DigestAlg::Sha384 => "sha384",
            DigestAlg::Sha512 => "sha512",
            DigestAlg::Sha3_256 => "sha3-256",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(DigestAlg::Sha256),
            "sha384" => Ok(DigestAlg::Sha384),
            "sha512" => Ok(DigestAlg::Sha512),
            "sha3-256" => Ok(DigestAlg::Sha3_256),
            other => Err(ToolkitError::option(format!("unknown digest algorithm {other}"))),
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlg::Sha256 => sha2::Sha256::digest(data).to_vec(),
            DigestAlg::Sha384 => sha2::Sha384::digest(data).to_vec(),
            DigestAlg::Sha512 => sha2::Sha512::digest(data).to_vec(),
            DigestAlg::Sha3_256 => sha3::Sha3_256::digest(data).to_vec(),
        }
    }
}

/// One `digest:Content` record, either freshly generated or parsed back from
/// an RDF document.
#[derive(Debug, Clone)]
pub struct DigestRecord {
    pub path: String,
    pub alg: DigestAlg,
    pub hex_digest: String,
    pub extent: u64,
    pub timestamp: i64,
    pub modify_date: i64,
    pub create_date: i64,
}

/// Streams every path in `paths` through `alg`, producing one record per
/// file, and renders them into a single `<rdf:RDF>` document.
pub fn generate(paths: &[String], alg: DigestAlg) -> Result<(Vec<DigestRecord>, String)> {
    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let record = hash_one_file(path, alg)?;
        records.push(record);
    }
    let rdf = render_rdf(&records);
    Ok((records, rdf))
}

fn hash_one_file(path: &str, alg: DigestAlg) -> Result<DigestRecord> {
    let mut stream = BlobStream::open_read(path, false)?;
    let mut extent: u64 = 0;
    let mut hasher = RunningHash::new(alg);
    loop {
        let chunk = stream.read(1 << 16)?;
        if chunk.is_empty() {
            break;
        }
        extent += chunk.len() as u64;
        hasher.update(&chunk);
    }
    stream.close()?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let (modify_date, create_date) = file_times(path).unwrap_or((now, now));

    Ok(DigestRecord {
        path: path.to_string(),
        alg,
        hex_digest: hex::encode(hasher.finish()),
        extent,
        timestamp: now,
        modify_date,
        create_date,
    })
}

fn file_times(path: &str) -> Option<(i64, i64)> {
    let meta = std::fs::metadata(path).ok()?;
    let modify = meta.modified().ok().and_then(to_unix).unwrap_or(0);
    let create = meta.created().ok().and_then(to_unix).unwrap_or(modify);
    Some((modify, create))
}

fn to_unix(t: std::time::SystemTime) -> Option<i64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
}

/// Streaming wrapper over the four `sha2`/`sha3` hashers so `hash_one_file`
/// does not need to buffer the whole file before hashing it.
enum RunningHash {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
    Sha3_256(sha3::Sha3_256),
}

impl RunningHash {
    fn new(alg: DigestAlg) -> Self {
        match alg {
            DigestAlg::Sha256 => RunningHash::Sha256(sha2::Sha256::new()),
            DigestAlg::Sha384 => RunningHash::Sha384(sha2::Sha384::new()),
            DigestAlg::Sha512 => RunningHash::Sha512(sha2::Sha512::new()),
            DigestAlg::Sha3_256 => RunningHash::Sha3_256(sha3::Sha3_256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            RunningHash::Sha256(h) => sha2::Digest::update(h, data),
            RunningHash::Sha384(h) => sha2::Digest::update(h, data),
            RunningHash::Sha512(h) => sha2::Digest::update(h, data),
            RunningHash::Sha3_256(h) => sha3::Digest::update(h, data),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            RunningHash::Sha256(h) => h.finalize().to_vec(),
            RunningHash::Sha384(h) => h.finalize().to_vec(),
            RunningHash::Sha512(h) => h.finalize().to_vec(),
            RunningHash::Sha3_256(h) => h.finalize().to_vec(),
        }
    }
}

fn render_rdf(records: &[DigestRecord]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\"?>\n");
    out.push_str("<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\" xmlns:digest=\"http://www.wizardtoolkit.org/digest/1.0/\">\n");
    for r in records {
        out.push_str(&format!("  <digest:Content rdf:about=\"{}\">\n", xml::escape(&r.path)));
        out.push_str(&format!("    <digest:timestamp>{}</digest:timestamp>\n", r.timestamp));
        out.push_str(&format!("    <digest:modify-date>{}</digest:modify-date>\n", r.modify_date));
        out.push_str(&format!("    <digest:create-date>{}</digest:create-date>\n", r.create_date));
        out.push_str(&format!("    <digest:extent>{}</digest:extent>\n", r.extent));
        out.push_str(&format!(
            "    <digest:{}>{}</digest:{}>\n",
            r.alg.as_str(),
            r.hex_digest,
            r.alg.as_str()
        ));
        out.push_str("  </digest:Content>\n");
    }
    out.push_str("</rdf:RDF>\n");
    out
}

/// One mismatch found while authenticating a digest RDF document.
#[derive(Debug, Clone)]
pub struct Mismatch {
    pub path: String,
    pub stored_digest: String,
    pub current_digest: Option<String>,
    pub detail: String,
}

/// Parses `rdf`, re-hashes every referenced path, and reports every mismatch
/// or unreadable path without aborting on the first one.
pub fn authenticate(rdf: &[u8]) -> Result<Vec<Mismatch>> {
    let root = xml::parse(rdf)?;
    let mut mismatches = Vec::new();

    for content in root.children_named("digest:Content") {
        let path = content.attr("rdf:about").unwrap_or_default().to_string();
        let Some((alg, stored_hex)) = find_digest_field(content) else {
            mismatches.push(Mismatch {
                path: path.clone(),
                stored_digest: String::new(),
                current_digest: None,
                detail: "record has no recognised digest:<alg> field".to_string(),
            });
            continue;
        };

        match hash_one_file(&path, alg) {
            Ok(record) => {
                if !record.hex_digest.eq_ignore_ascii_case(&stored_hex) {
                    mismatches.push(Mismatch {
                        path: path.clone(),
                        stored_digest: stored_hex.clone(),
                        current_digest: Some(record.hex_digest.clone()),
                        detail: format!(
                            "digest mismatch: stored {} at {}, current {} at {}",
                            stored_hex, content.child("digest:modify-date").map(|c| c.text.clone()).unwrap_or_default(),
                            record.hex_digest, record.modify_date
                        ),
                    });
                }
            }
            Err(e) => {
                mismatches.push(Mismatch {
                    path: path.clone(),
                    stored_digest: stored_hex.clone(),
                    current_digest: None,
                    detail: format!("could not open {path}: {e}"),
                });
            }
        }
    }

    Ok(mismatches)
}

fn find_digest_field(content: &xml::XmlNode) -> Option<(DigestAlg, String)> {
    for alg in [DigestAlg::Sha256, DigestAlg::Sha384, DigestAlg::Sha512, DigestAlg::Sha3_256] {
        let tag = format!("digest:{}", alg.as_str());
        if let Some(child) = content.child(&tag) {
            return Some((alg, child.text.trim().to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn generate_then_authenticate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let empty_path = dir.path().join("empty.bin");
        std::fs::File::create(&empty_path).unwrap();

        let data_path = dir.path().join("aa.bin");
        let mut f = std::fs::File::create(&data_path).unwrap();
        f.write_all(&vec![0xAAu8; 1024]).unwrap();

        let paths = vec![
            empty_path.to_str().unwrap().to_string(),
            data_path.to_str().unwrap().to_string(),
        ];
        let (records, rdf) = generate(&paths, DigestAlg::Sha256).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].hex_digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );

        let mismatches = authenticate(rdf.as_bytes()).unwrap();
        assert!(mismatches.is_empty());
    }

    #[test]
    fn authenticate_reports_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tamper.bin");
        std::fs::write(&path, b"original bytes").unwrap();

        let paths = vec![path.to_str().unwrap().to_string()];
        let (_records, rdf) = generate(&paths, DigestAlg::Sha256).unwrap();

        std::fs::write(&path, b"tampered byte!").unwrap();
        let mismatches = authenticate(rdf.as_bytes()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].path, path.to_str().unwrap());
    }

    #[test]
    fn authenticate_reports_missing_file_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.bin");
        std::fs::write(&present, b"hello").unwrap();
        let missing = dir.path().join("missing.bin");

        let paths = vec![
            missing.to_str().unwrap().to_string(),
            present.to_str().unwrap().to_string(),
        ];
        let (_records, rdf) = generate_allow_missing(&paths, DigestAlg::Sha256);
        let mismatches = authenticate(rdf.as_bytes()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].detail.contains("could not open"));
    }

    /// Test-only helper: builds an RDF document that references a path which
    /// does not exist, by hashing only the files that do and splicing in a
    /// placeholder record for the rest.
    fn generate_allow_missing(paths: &[String], alg: DigestAlg) -> (Vec<DigestRecord>, String) {
        let mut records = Vec::new();
        for path in paths {
            if let Ok(record) = hash_one_file(path, alg) {
                records.push(record);
            } else {
                records.push(DigestRecord {
                    path: path.clone(),
                    alg,
                    hex_digest: "0".repeat(64),
                    extent: 0,
                    timestamp: 0,
                    modify_date: 0,
                    create_date: 0,
                });
            }
        }
        let rdf = render_rdf(&records);
        (records, rdf)
    }
}
