use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha1_smol::Sha1;

const TAIL_SCAN_BYTES: u64 = 10 * 1024;

/// Reads up to the last 10 KiB of `path`, extracts every line whose trailing
/// space-separated hex SHA-1 matches the recomputed SHA-1 of the preceding
/// text, and returns the lexicographic minimum of the last `worker_count`
/// such lines. Returns `None` (resume abandoned) when fewer than
/// `worker_count` valid lines are present.
pub fn extract_resume_point(path: &Path, worker_count: usize) -> anyhow::Result<Option<String>> {
    if worker_count == 0 {
        return Ok(None);
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };

    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_SCAN_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    let valid: Vec<&str> = buf
        .lines()
        .filter_map(|line| validate_line(line))
        .collect();

    if valid.len() < worker_count {
        return Ok(None);
    }

    let last_w = &valid[valid.len() - worker_count..];
    Ok(last_w.iter().min().map(|s| s.to_string()))
}

fn validate_line(line: &str) -> Option<&str> {
    let (path_part, hash_part) = line.rsplit_once(' ')?;
    if hash_part.len() != 40 || !hash_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if sha1_hex(path_part.as_bytes()) == hash_part.to_ascii_lowercase() {
        Some(path_part)
    } else {
        None
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.digest().bytes())
}

fn checkpoint_line(path: &str) -> String {
    format!("{path} {}\n", sha1_hex(path.as_bytes()))
}

/// Tracks the last completed path per worker slot and flushes the non-empty
/// entries to the resume log, sorted, on each tick or on shutdown.
pub struct ResumeCheckpoint {
    log_path: PathBuf,
    last_paths: Vec<Option<String>>,
}

impl ResumeCheckpoint {
    pub fn new(log_path: PathBuf, worker_count: usize) -> Self {
        Self {
            log_path,
            last_paths: vec![None; worker_count],
        }
    }

    pub fn record(&mut self, worker_index: usize, path: String) {
        if let Some(slot) = self.last_paths.get_mut(worker_index) {
            *slot = Some(path);
        }
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let mut lines: Vec<&String> = self.last_paths.iter().flatten().collect();
        lines.sort();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        for path in lines {
            file.write_all(checkpoint_line(path).as_bytes())?;
        }
        Ok(())
    }
}

/// Builds `<kind>-resume-YYYY-MM-DD-HH_MM_SS.log` under `dir` for a fresh run.
pub fn new_resume_log_path(dir: &Path, kind: &str, timestamp: &str) -> PathBuf {
    dir.join(format!("{kind}-resume-{timestamp}.log"))
}

/// Resolves the `latest` special value by selecting the matching `<kind>-resume-*`
/// file in `dir` whose timestamp suffix sorts greatest.
pub fn resolve_latest_resume_log(dir: &Path, kind: &str) -> anyhow::Result<Option<PathBuf>> {
    let prefix = format!("{kind}-resume-");
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".log") {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates.pop())
}
