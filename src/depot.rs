use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bloomfilter::Bloom;
use walkdir::WalkDir;

use crate::codec::{object_path, sha1_from_path};
use crate::error::DepotError;

const BLOOM_ITEMS: usize = 20_000_000;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.10;
const SIZE_CACHE_FILE: &str = ".romba_size";
const BLOOM_FILE: &str = "bloomfilter";

/// `size / COMPRESSED_SIZE_DIVISOR` is the pessimistic compressed-size
/// estimate used at reservation time; kept as a named constant (rather than
/// an inline literal) so it stays tunable, per the open question on whether
/// the divisor should be empirically adjustable.
pub const COMPRESSED_SIZE_DIVISOR: u64 = 5;

pub fn estimate_compressed_size(source_size: u64) -> u64 {
    source_size / COMPRESSED_SIZE_DIVISOR
}

#[derive(Debug)]
struct RootState {
    size: u64,
    bloom: Option<Bloom<String>>,
    touched: bool,
}

#[derive(Debug)]
pub struct DepotRoot {
    pub path: PathBuf,
    pub max_size: u64,
    state: Mutex<RootState>,
}

impl DepotRoot {
    fn open(path: PathBuf, max_size: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(&path).with_context(|| format!("creating depot root {path:?}"))?;
        let size = load_or_compute_size(&path)?;
        let bloom = load_bloom(&path)?;
        Ok(Self {
            path,
            max_size,
            state: Mutex::new(RootState {
                size,
                bloom,
                touched: false,
            }),
        })
    }

    pub fn size(&self) -> u64 {
        self.state.lock().unwrap().size
    }

    /// Bloom-filter negative test confirmed by a filesystem existence check.
    pub fn contains(&self, sha1_hex: &str) -> bool {
        let maybe_present = {
            let state = self.state.lock().unwrap();
            match &state.bloom {
                Some(bloom) => bloom.check(&sha1_hex.to_string()),
                None => true,
            }
        };
        if !maybe_present {
            return false;
        }
        object_path(&self.path, sha1_hex).exists()
    }

    pub fn object_path(&self, sha1_hex: &str) -> PathBuf {
        object_path(&self.path, sha1_hex)
    }

    /// Called after a successful write: records the true compressed size and
    /// marks the SHA-1 as present in the Bloom filter.
    pub fn record_write(&self, sha1_hex: &str, actual_compressed: u64, estimated: u64) {
        let mut state = self.state.lock().unwrap();
        let delta = actual_compressed as i64 - estimated as i64;
        state.size = (state.size as i64 + delta).max(0) as u64;
        let bloom = state
            .bloom
            .get_or_insert_with(|| Bloom::new_for_fp_rate(BLOOM_ITEMS, BLOOM_FALSE_POSITIVE_RATE));
        bloom.set(&sha1_hex.to_string());
        state.touched = true;
    }

    /// Called by purge when an object is removed from this root.
    pub fn record_removal(&self, byte_count: u64) {
        let mut state = self.state.lock().unwrap();
        state.size = state.size.saturating_sub(byte_count);
        state.touched = true;
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.touched {
            return Ok(());
        }
        fs::write(self.path.join(SIZE_CACHE_FILE), state.size.to_string())?;
        if let Some(bloom) = &state.bloom {
            let bloom_path = self.path.join(BLOOM_FILE);
            if bloom_path.exists() {
                let backup = self.path.join(format!("{BLOOM_FILE}.bak"));
                fs::rename(&bloom_path, &backup)?;
            }
            write_bloom(&bloom_path, bloom)?;
        }
        state.touched = false;
        Ok(())
    }
}

fn load_or_compute_size(root: &Path) -> anyhow::Result<u64> {
    let cache_path = root.join(SIZE_CACHE_FILE);
    if let Ok(text) = fs::read_to_string(&cache_path) {
        if let Ok(n) = text.trim().parse::<u64>() {
            return Ok(n);
        }
    }

    let mut total = 0u64;
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if entry.path().extension().and_then(|e| e.to_str()) == Some("gz") {
            total = total.saturating_add(entry.metadata().map(|m| m.len()).unwrap_or(0));
        }
    }
    fs::write(&cache_path, total.to_string())?;
    Ok(total)
}

fn load_bloom(root: &Path) -> anyhow::Result<Option<Bloom<String>>> {
    let path = root.join(BLOOM_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&path)?;
    Ok(decode_bloom(&raw))
}

/// Wire layout: `bits_u64 || k_u32 || sip0_0_u64 || sip0_1_u64 || sip1_0_u64 || sip1_1_u64 || bitmap`.
fn decode_bloom(raw: &[u8]) -> Option<Bloom<String>> {
    if raw.len() < 8 + 4 + 32 {
        return None;
    }
    let bits = u64::from_be_bytes(raw[0..8].try_into().ok()?);
    let k = u32::from_be_bytes(raw[8..12].try_into().ok()?);
    let mut offset = 12;
    let mut read_u64 = || {
        let v = u64::from_be_bytes(raw[offset..offset + 8].try_into().unwrap());
        offset += 8;
        v
    };
    let sip_keys = [(read_u64(), read_u64()), (read_u64(), read_u64())];
    let bitmap = raw[offset..].to_vec();
    Some(Bloom::from_existing(&bitmap, bits, k, sip_keys))
}

fn write_bloom(path: &Path, bloom: &Bloom<String>) -> anyhow::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(&bloom.number_of_bits().to_be_bytes());
    out.extend_from_slice(&bloom.number_of_hash_functions().to_be_bytes());
    for (a, b) in bloom.sip_keys() {
        out.extend_from_slice(&a.to_be_bytes());
        out.extend_from_slice(&b.to_be_bytes());
    }
    out.extend_from_slice(&bloom.bitmap());
    fs::write(path, out)?;
    Ok(())
}

struct DepotState {
    roots: Vec<Arc<DepotRoot>>,
    start: usize,
}

/// Owns the ordered list of depot roots and drives first-fit-then-advance
/// space reservation.
pub struct Depot {
    state: Mutex<DepotState>,
}

impl Depot {
    pub fn open(roots: Vec<(PathBuf, u64)>) -> anyhow::Result<Self> {
        let mut opened = Vec::with_capacity(roots.len());
        for (path, max_size) in roots {
            opened.push(Arc::new(DepotRoot::open(path, max_size)?));
        }
        Ok(Self {
            state: Mutex::new(DepotState {
                roots: opened,
                start: 0,
            }),
        })
    }

    pub fn roots(&self) -> Vec<Arc<DepotRoot>> {
        self.state.lock().unwrap().roots.clone()
    }

    /// Walks roots from `start` upward, returning the first with enough
    /// remaining capacity. Fully saturated roots advance `start`.
    pub fn reserve(&self, bytes: u64) -> anyhow::Result<Arc<DepotRoot>> {
        let mut state = self.state.lock().unwrap();
        let root_count = state.roots.len();
        let mut idx = state.start;
        while idx < root_count {
            let root = &state.roots[idx];
            if root.size() + bytes < root.max_size {
                return Ok(root.clone());
            }
            idx += 1;
        }
        state.start = root_count;
        Err(DepotError::DepotFull.into())
    }

    /// Bloom-backed existence check across every root.
    pub fn contains(&self, sha1_hex: &str) -> bool {
        let roots = self.roots();
        roots.iter().any(|root| root.contains(sha1_hex))
    }

    /// Finds the root whose object path would hold `sha1_hex`, if present.
    pub fn locate(&self, sha1_hex: &str) -> Option<Arc<DepotRoot>> {
        self.roots()
            .into_iter()
            .find(|root| root.contains(sha1_hex))
    }

    /// Finds the root owning `path` by path prefix, used by purge to adjust
    /// sizes after a move.
    pub fn root_for_path(&self, path: &Path) -> Option<Arc<DepotRoot>> {
        self.roots()
            .into_iter()
            .find(|root| path.starts_with(&root.path))
    }

    pub fn flush_all(&self) -> anyhow::Result<()> {
        for root in self.roots() {
            root.flush()?;
        }
        Ok(())
    }
}

pub fn recover_sha1(root: &Path, path: &Path) -> Option<String> {
    if !path.starts_with(root) {
        return None;
    }
    sha1_from_path(path)
}
