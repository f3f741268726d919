//! A uniform sequential reader/writer over files, pipes, memory buffers,
//! and transparently (de)compressed gzip/bzip2 streams.
//!
//! The stream reports byte counts only; integrity is the caller's
//! responsibility (the pipeline and digest layers add HMAC and digest
//! checks on top).

use crate::error::{Result, ToolkitError};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

const MMAP_THRESHOLD: u64 = 1 << 20; // 1 MiB

enum Reader {
    File(BufReader<File>),
    Mmap {
        map: memmap2::Mmap,
        pos: usize,
    },
    Gzip(Box<flate2::read::GzDecoder<BufReader<File>>>),
    Bzip2(Box<bzip2::read::BzDecoder<BufReader<File>>>),
    Pipe {
        child: Child,
        reader: BufReader<std::process::ChildStdout>,
    },
    Memory(io::Cursor<Vec<u8>>),
    Stdin(io::Stdin),
}

enum Writer {
    File(BufWriter<File>),
    Gzip(Box<flate2::write::GzEncoder<BufWriter<File>>>),
    Bzip2(Box<bzip2::write::BzEncoder<BufWriter<File>>>),
    Pipe {
        child: Child,
        writer: BufWriter<std::process::ChildStdin>,
    },
    Memory(Vec<u8>),
    Stdout(io::Stdout),
}

/// Which direction a [`BlobStream`] was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// A handle over one underlying transport. `path = "-"` binds stdin/stdout;
/// a leading `|` opens a subprocess pipe; `.gz`/`.bz2` extensions select a
/// compressor on write, and magic-byte sniffing selects a decompressor on
/// read when `transparent_compression` is requested.
pub enum BlobStream {
    Reading {
        inner: Reader,
        position: u64,
        eof: bool,
    },
    Writing {
        inner: Writer,
        position: u64,
    },
    /// An in-memory blob attached from an existing buffer; grows on write.
    MemoryWrite {
        buf: Vec<u8>,
        position: u64,
    },
}

impl BlobStream {
    /// Opens `path` for reading. If `transparent_compression` is set, the
    /// first three bytes are peeked for gzip (`1f 8b 08`) or bzip2 (`BZh`)
    /// magic and the handle is switched to the matching decompressor.
    pub fn open_read(path: &str, transparent_compression: bool) -> Result<Self> {
        if path == "-" {
            return Ok(BlobStream::Reading {
                inner: Reader::Stdin(io::stdin()),
                position: 0,
                eof: false,
            });
        }
        if let Some(cmd) = path.strip_prefix('|') {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .stdout(Stdio::piped())
                .spawn()
                .map_err(|e| ToolkitError::blob(format!("pipe open failed: {e}")))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| ToolkitError::blob("pipe produced no stdout"))?;
            return Ok(BlobStream::Reading {
                inner: Reader::Pipe {
                    child,
                    reader: BufReader::new(stdout),
                },
                position: 0,
                eof: false,
            });
        }

        let file = File::open(path)
            .map_err(|e| ToolkitError::blob(format!("open {path}: {e}")))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let mut probe = [0u8; 3];
        let mut buffered = BufReader::new(file);
        let peeked = peek(&mut buffered, &mut probe)?;

        let reader = if transparent_compression && peeked >= 3 && probe == [0x1f, 0x8b, 0x08] {
            Reader::Gzip(Box::new(flate2::read::GzDecoder::new(buffered)))
        } else if transparent_compression && peeked >= 3 && &probe == b"BZh" {
            Reader::Bzip2(Box::new(bzip2::read::BzDecoder::new(buffered)))
        } else if size >= MMAP_THRESHOLD {
            let file = buffered.into_inner();
            let map = unsafe { memmap2::Mmap::map(&file) }
                .map_err(|e| ToolkitError::blob(format!("mmap {path}: {e}")))?;
            Reader::Mmap { map, pos: 0 }
        } else {
            Reader::File(buffered)
        };

        Ok(BlobStream::Reading {
            inner: reader,
            position: 0,
            eof: false,
        })
    }

    /// Opens `path` for writing. Extension `.gz`/`.bz2` selects the matching
    /// compressor; everything else is written verbatim.
    pub fn open_write(path: &str) -> Result<Self> {
        if path == "-" {
            return Ok(BlobStream::Writing {
                inner: Writer::Stdout(io::stdout()),
                position: 0,
            });
        }
        if let Some(cmd) = path.strip_prefix('|') {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| ToolkitError::blob(format!("pipe open failed: {e}")))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| ToolkitError::blob("pipe produced no stdin"))?;
            return Ok(BlobStream::Writing {
                inner: Writer::Pipe {
                    child,
                    writer: BufWriter::new(stdin),
                },
                position: 0,
            });
        }

        let file = File::create(path)
            .map_err(|e| ToolkitError::blob(format!("create {path}: {e}")))?;
        let buffered = BufWriter::new(file);

        let writer = if path.ends_with(".gz") {
            Writer::Gzip(Box::new(flate2::write::GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            )))
        } else if path.ends_with(".bz2") {
            Writer::Bzip2(Box::new(bzip2::write::BzEncoder::new(
                buffered,
                bzip2::Compression::default(),
            )))
        } else {
            Writer::File(buffered)
        };

        Ok(BlobStream::Writing {
            inner: writer,
            position: 0,
        })
    }

    /// Attaches an in-memory read blob from an existing buffer.
    pub fn from_memory(buf: Vec<u8>) -> Self {
        BlobStream::Reading {
            inner: Reader::Memory(io::Cursor::new(buf)),
            position: 0,
            eof: false,
        }
    }

    /// Creates an in-memory write blob that grows on write.
    pub fn memory_sink() -> Self {
        BlobStream::MemoryWrite {
            buf: Vec::new(),
            position: 0,
        }
    }

    pub fn into_memory(self) -> Option<Vec<u8>> {
        match self {
            BlobStream::MemoryWrite { buf, .. } => Some(buf),
            _ => None,
        }
    }

    pub fn mode(&self) -> OpenMode {
        match self {
            BlobStream::Reading { .. } => OpenMode::Read,
            BlobStream::Writing { .. } | BlobStream::MemoryWrite { .. } => OpenMode::Write,
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            BlobStream::Reading { position, .. } => *position,
            BlobStream::Writing { position, .. } => *position,
            BlobStream::MemoryWrite { position, .. } => *position,
        }
    }

    pub fn eof(&self) -> bool {
        matches!(self, BlobStream::Reading { eof: true, .. })
    }

    /// Reads up to `n` bytes. A short read is not an error: it simply
    /// returns fewer bytes than requested, with `eof()` becoming true once
    /// nothing more is available.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let BlobStream::Reading { inner, position, eof } = self else {
            return Err(ToolkitError::blob("read on a write-mode stream"));
        };
        let mut buf = vec![0u8; n];
        let mut total = 0;
        while total < n {
            let read = match inner {
                Reader::File(r) => r.read(&mut buf[total..])?,
                Reader::Mmap { map, pos } => {
                    let avail = map.len().saturating_sub(*pos);
                    let take = avail.min(n - total);
                    buf[total..total + take].copy_from_slice(&map[*pos..*pos + take]);
                    *pos += take;
                    take
                }
                Reader::Gzip(r) => r.read(&mut buf[total..])?,
                Reader::Bzip2(r) => r.read(&mut buf[total..])?,
                Reader::Pipe { reader, .. } => reader.read(&mut buf[total..])?,
                Reader::Memory(c) => c.read(&mut buf[total..])?,
                Reader::Stdin(s) => s.read(&mut buf[total..])?,
            };
            if read == 0 {
                *eof = true;
                break;
            }
            total += read;
            *position += read as u64;
        }
        buf.truncate(total);
        Ok(buf)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        match self {
            BlobStream::Writing { inner, position } => {
                match inner {
                    Writer::File(w) => w.write_all(bytes)?,
                    Writer::Gzip(w) => w.write_all(bytes)?,
                    Writer::Bzip2(w) => w.write_all(bytes)?,
                    Writer::Pipe { writer, .. } => writer.write_all(bytes)?,
                    Writer::Memory(v) => v.extend_from_slice(bytes),
                    Writer::Stdout(s) => s.write_all(bytes)?,
                }
                *position += bytes.len() as u64;
                Ok(bytes.len())
            }
            BlobStream::MemoryWrite { buf, position } => {
                buf.extend_from_slice(bytes);
                *position += bytes.len() as u64;
                Ok(bytes.len())
            }
            BlobStream::Reading { .. } => Err(ToolkitError::blob("write on a read-mode stream")),
        }
    }

    /// Forces any buffered writes to the underlying transport so a caller
    /// can detect a partial write before moving to the next chunk.
    pub fn sync(&mut self) -> Result<()> {
        match self {
            BlobStream::Writing { inner, .. } => {
                match inner {
                    Writer::File(w) => {
                        w.flush()?;
                        w.get_ref().sync_all()?;
                    }
                    Writer::Gzip(w) => w.flush()?,
                    Writer::Bzip2(w) => w.flush()?,
                    Writer::Pipe { writer, .. } => writer.flush()?,
                    Writer::Memory(_) => {}
                    Writer::Stdout(s) => s.flush()?,
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            BlobStream::Writing { inner, .. } => match inner {
                Writer::Gzip(w) => {
                    w.finish().map_err(|e| ToolkitError::blob(e.to_string()))?;
                    Ok(())
                }
                Writer::Bzip2(w) => {
                    w.finish().map_err(|e| ToolkitError::blob(e.to_string()))?;
                    Ok(())
                }
                Writer::Pipe { mut child, writer } => {
                    drop(writer);
                    child
                        .wait()
                        .map_err(|e| ToolkitError::blob(e.to_string()))?;
                    Ok(())
                }
                _ => Ok(()),
            },
            BlobStream::Reading {
                inner: Reader::Pipe { mut child, reader },
                ..
            } => {
                drop(reader);
                child
                    .wait()
                    .map_err(|e| ToolkitError::blob(e.to_string()))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Peeks up to `buf.len()` bytes without consuming them from the underlying
/// reader, restoring the read position via `seek(0)` (non-seekable sources
/// are opened small enough that this is only used on plain files).
fn peek(reader: &mut BufReader<File>, buf: &mut [u8; 3]) -> Result<usize> {
    use std::io::Seek;
    let n = reader.read(buf)?;
    reader.seek(io::SeekFrom::Start(0))?;
    Ok(n)
}
