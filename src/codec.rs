use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

/// The 28-byte `md5(16) || crc(4) || size_be(8)` block carried in the gzip
/// extra header of every stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sidecar {
    pub md5: [u8; 16],
    pub crc32: [u8; 4],
    pub size: u64,
}

pub const SIDECAR_LEN: usize = 28;

impl Sidecar {
    pub fn to_bytes(&self) -> [u8; SIDECAR_LEN] {
        let mut out = [0u8; SIDECAR_LEN];
        out[0..16].copy_from_slice(&self.md5);
        out[16..20].copy_from_slice(&self.crc32);
        out[20..28].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SIDECAR_LEN {
            return None;
        }
        let mut md5 = [0u8; 16];
        let mut crc32 = [0u8; 4];
        md5.copy_from_slice(&bytes[0..16]);
        crc32.copy_from_slice(&bytes[16..20]);
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&bytes[20..28]);
        Some(Self {
            md5,
            crc32,
            size: u64::from_be_bytes(size_bytes),
        })
    }
}

struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a gzip object at `path` carrying `sidecar` in its extra header.
/// Returns the number of compressed bytes written. Parent directories are
/// created with permissive (`0777`) mode, matching a world-writable shared
/// depot. Not atomic: callers must guarantee `path` is unique per content.
pub fn write_object<R: Read>(path: &Path, mut reader: R, sidecar: &Sidecar) -> anyhow::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating object dir {parent:?}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o777));
        }
    }

    let file = File::create(path).with_context(|| format!("creating object {path:?}"))?;
    let count = Arc::new(AtomicU64::new(0));
    let counting = CountingWriter {
        inner: file,
        count: count.clone(),
    };

    let mut encoder = GzBuilder::new()
        .extra(sidecar.to_bytes().to_vec())
        .write(counting, Compression::default());

    io::copy(&mut reader, &mut encoder).with_context(|| format!("writing object {path:?}"))?;
    encoder.finish().with_context(|| format!("finishing object {path:?}"))?;

    Ok(count.load(Ordering::Relaxed))
}

/// Reads the sidecar out of an object's gzip extra header, if present.
pub fn read_sidecar(path: &Path) -> anyhow::Result<Option<Sidecar>> {
    let file = File::open(path).with_context(|| format!("opening object {path:?}"))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    // Force the header to be parsed; the extra field is available as soon as
    // flate2 has consumed the gzip member header, which happens on first read.
    let mut probe = [0u8; 1];
    let _ = decoder.read(&mut probe);
    Ok(decoder
        .header()
        .and_then(|h| h.extra())
        .and_then(Sidecar::from_bytes))
}

/// Opens an object for streaming decompressed reads.
pub fn open_object(path: &Path) -> anyhow::Result<GzDecoder<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening object {path:?}"))?;
    Ok(GzDecoder::new(BufReader::new(file)))
}

/// Recovers the SHA-1 hex digest from a depot object path by stripping the
/// sharding prefix and the `.gz` suffix.
pub fn sha1_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() == 40 && stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(stem.to_ascii_lowercase())
    } else {
        None
    }
}

/// Maps a hex SHA-1 to its sharded path under `root`: `root/s0s1/s2s3/s4s5/s6s7/<sha1>.gz`.
pub fn object_path(root: &Path, sha1_hex: &str) -> PathBuf {
    let b = sha1_hex.as_bytes();
    root.join(std::str::from_utf8(&b[0..2]).unwrap())
        .join(std::str::from_utf8(&b[2..4]).unwrap())
        .join(std::str::from_utf8(&b[4..6]).unwrap())
        .join(std::str::from_utf8(&b[6..8]).unwrap())
        .join(format!("{sha1_hex}.gz"))
}
