use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use crate::containers::scan_container;
use crate::dat_index::DatIndex;
use crate::depot::{estimate_compressed_size, Depot};
use crate::error::DepotError;
use crate::resume::ResumeCheckpoint;
use crate::types::ContainerInclude;
use crate::worker::{Job, Worker, WorkItem};

/// Per-container-extension inclusion policy for the archive/merge pipelines.
#[derive(Debug, Clone, Copy)]
pub struct IncludePolicy {
    pub zip: ContainerInclude,
    pub gzip: ContainerInclude,
    pub sevenz: ContainerInclude,
}

impl IncludePolicy {
    fn for_path(&self, path: &Path) -> ContainerInclude {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("zip") => self.zip,
            Some("gz") => self.gzip,
            Some("7z") => self.sevenz,
            _ => ContainerInclude::EntriesOnly,
        }
    }
}

/// Outcome counters gathered across a completed ingestion run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestStats {
    pub files_seen: usize,
    pub objects_written: usize,
    pub objects_deduplicated: usize,
    pub bytes_ingested: u64,
}

struct IngestStatsInner {
    objects_written: std::sync::atomic::AtomicUsize,
    objects_deduplicated: std::sync::atomic::AtomicUsize,
    bytes_ingested: std::sync::atomic::AtomicU64,
}

/// The `archive`/`merge` job: walks input roots, dispatches each file to a
/// worker, expands containers per `include`, dedups against the depot, and
/// writes new objects under reserved depot roots.
pub struct IngestJob {
    depot: Arc<Depot>,
    dat_index: Option<Arc<dyn DatIndex + Send + Sync>>,
    include: IncludePolicy,
    only_needed: bool,
    resume_threshold: Option<String>,
    worker_count: usize,
    checkpoint: Arc<Mutex<ResumeCheckpoint>>,
    checkpoint_tx: Sender<(usize, String)>,
    stats: Arc<IngestStatsInner>,
    verbose: u8,
}

impl IngestJob {
    pub fn new(
        depot: Arc<Depot>,
        dat_index: Option<Arc<dyn DatIndex + Send + Sync>>,
        include: IncludePolicy,
        only_needed: bool,
        resume_threshold: Option<String>,
        worker_count: usize,
        resume_log_path: PathBuf,
        verbose: u8,
    ) -> (Self, std::sync::mpsc::Receiver<(usize, String)>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let checkpoint = Arc::new(Mutex::new(ResumeCheckpoint::new(resume_log_path, worker_count)));
        let job = Self {
            depot,
            dat_index,
            include,
            only_needed,
            resume_threshold,
            worker_count,
            checkpoint,
            checkpoint_tx: tx,
            verbose,
            stats: Arc::new(IngestStatsInner {
                objects_written: std::sync::atomic::AtomicUsize::new(0),
                objects_deduplicated: std::sync::atomic::AtomicUsize::new(0),
                bytes_ingested: std::sync::atomic::AtomicU64::new(0),
            }),
        };
        (job, rx)
    }

    pub fn stats(&self) -> IngestStats {
        use std::sync::atomic::Ordering;
        IngestStats {
            files_seen: 0,
            objects_written: self.stats.objects_written.load(Ordering::Relaxed),
            objects_deduplicated: self.stats.objects_deduplicated.load(Ordering::Relaxed),
            bytes_ingested: self.stats.bytes_ingested.load(Ordering::Relaxed),
        }
    }

    /// Flushes the resume checkpoint; call this both on a 1-minute tick and
    /// once more after the job completes.
    pub fn flush_checkpoint(&self) -> anyhow::Result<()> {
        self.checkpoint.lock().unwrap().flush()
    }

    fn record_checkpoint(&self, worker_index: usize, path: String) {
        self.checkpoint.lock().unwrap().record(worker_index, path);
    }
}

impl Job for IngestJob {
    fn accept(&self, path: &Path) -> bool {
        match &self.resume_threshold {
            Some(threshold) => path.to_string_lossy().as_ref() > threshold.as_str(),
            None => true,
        }
    }

    fn new_worker(&self, index: usize) -> Box<dyn Worker> {
        Box::new(IngestWorker {
            index,
            depot: self.depot.clone(),
            dat_index: self.dat_index.clone(),
            include: self.include,
            only_needed: self.only_needed,
            checkpoint_tx: self.checkpoint_tx.clone(),
            stats: self.stats.clone(),
            verbose: self.verbose,
        })
    }

    fn num_workers(&self) -> usize {
        self.worker_count.max(1)
    }

    fn finish_up(&self) {
        crate::vprintln!(self.verbose, 1, "archive: flushing resume checkpoint");
        let _ = self.flush_checkpoint();
    }
}

struct IngestWorker {
    index: usize,
    depot: Arc<Depot>,
    dat_index: Option<Arc<dyn DatIndex + Send + Sync>>,
    include: IncludePolicy,
    only_needed: bool,
    checkpoint_tx: Sender<(usize, String)>,
    stats: Arc<IngestStatsInner>,
    verbose: u8,
}

impl Worker for IngestWorker {
    fn process(&mut self, item: &WorkItem) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;

        let include = self.include.for_path(&item.path);
        let entries = scan_container(&item.path, include)?;

        for entry in entries {
            let Some(sha1) = entry.hashes.sha1_hex() else {
                continue;
            };

            if let Some(index) = &self.dat_index {
                let wanted = !index.dats_for_rom(&entry.hashes, entry.size)?.is_empty();
                if self.only_needed && !wanted {
                    continue;
                }
                // Otherwise index the rom, so a scanned file not yet declared
                // by any dat can still be resolved later via resolve_hash.
                if !wanted && index.resolve_hash(&sha1)?.is_none() {
                    index.index_loose_rom(&entry.hashes, entry.size)?;
                }
            }

            if self.depot.contains(&sha1) {
                self.stats.objects_deduplicated.fetch_add(1, Ordering::Relaxed);
                crate::vprintln!(self.verbose, 2, "archive: {sha1} already present, skipping");
                continue;
            }

            let estimated = estimate_compressed_size(entry.size);
            let root = self.depot.reserve(estimated)?;
            let object_path = root.object_path(&sha1);

            let sidecar = crate::codec::Sidecar {
                md5: entry.hashes.md5.unwrap_or([0u8; 16]),
                crc32: entry.hashes.crc32.unwrap_or([0u8; 4]),
                size: entry.size,
            };
            let actual =
                crate::codec::write_object(&object_path, entry.bytes.as_slice(), &sidecar)?;
            root.record_write(&sha1, actual, estimated);

            crate::vprintln!(
                self.verbose,
                1,
                "archive: wrote {sha1} ({actual} bytes) from {}",
                item.path.display()
            );
            self.stats.objects_written.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_ingested.fetch_add(entry.size, Ordering::Relaxed);
        }

        let _ = self
            .checkpoint_tx
            .send((self.index, item.path.display().to_string()));

        Ok(())
    }
}

pub fn depot_full_error() -> anyhow::Error {
    DepotError::DepotFull.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dat_index::InMemoryDatIndex;
    use crate::worker::{run_job, ProgressTracker};
    use tempfile::tempdir;

    fn default_include() -> IncludePolicy {
        IncludePolicy {
            zip: ContainerInclude::EntriesOnly,
            gzip: ContainerInclude::EntriesOnly,
            sevenz: ContainerInclude::EntriesOnly,
        }
    }

    #[test]
    fn ingesting_a_plain_file_writes_one_object() {
        let workdir = tempdir().unwrap();
        let input_dir = workdir.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("a.bin"), b"payload").unwrap();

        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());
        let (job, _rx) = IngestJob::new(
            depot.clone(),
            None,
            default_include(),
            false,
            None,
            1,
            workdir.path().join("resume.log"),
            0,
        );

        let tracker = ProgressTracker::new("archive", 1);
        run_job(&job, &[input_dir], &tracker).unwrap();

        assert_eq!(job.stats().objects_written, 1);
        let (hashes, _) = crate::checksum::hash_stream(&b"payload"[..]).unwrap();
        assert!(depot.contains(&hashes.sha1_hex().unwrap()));
    }

    #[test]
    fn ingesting_the_same_content_twice_deduplicates() {
        let workdir = tempdir().unwrap();
        let input_dir = workdir.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("a.bin"), b"same content").unwrap();
        std::fs::write(input_dir.join("b.bin"), b"same content").unwrap();

        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());
        let (job, _rx) = IngestJob::new(
            depot,
            None,
            default_include(),
            false,
            None,
            1,
            workdir.path().join("resume.log"),
            0,
        );

        let tracker = ProgressTracker::new("archive", 1);
        run_job(&job, &[input_dir], &tracker).unwrap();

        assert_eq!(job.stats().objects_written, 1);
        assert_eq!(job.stats().objects_deduplicated, 1);
    }

    #[test]
    fn only_needed_skips_files_absent_from_the_dat_index() {
        let workdir = tempdir().unwrap();
        let input_dir = workdir.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("unwanted.bin"), b"nobody wants this").unwrap();

        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());
        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        let (job, _rx) = IngestJob::new(
            depot,
            Some(index),
            default_include(),
            true,
            None,
            1,
            workdir.path().join("resume.log"),
            0,
        );

        let tracker = ProgressTracker::new("archive", 1);
        run_job(&job, &[input_dir], &tracker).unwrap();

        assert_eq!(job.stats().objects_written, 0);
    }

    #[test]
    fn a_scanned_rom_not_declared_by_any_dat_becomes_resolvable_afterward() {
        let workdir = tempdir().unwrap();
        let input_dir = workdir.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("undeclared.bin"), b"nobody declared this").unwrap();

        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());
        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        let (job, _rx) = IngestJob::new(
            depot,
            Some(index.clone()),
            default_include(),
            false,
            None,
            1,
            workdir.path().join("resume.log"),
            0,
        );

        let tracker = ProgressTracker::new("archive", 1);
        run_job(&job, &[input_dir], &tracker).unwrap();

        assert_eq!(job.stats().objects_written, 1);
        let (hashes, _) = crate::checksum::hash_stream(&b"nobody declared this"[..]).unwrap();
        let resolved = index.resolve_hash(&hashes.sha1_hex().unwrap()).unwrap();
        assert_eq!(resolved, Some(hashes));
    }

    #[test]
    fn resume_threshold_skips_paths_at_or_below_it() {
        let workdir = tempdir().unwrap();
        let input_dir = workdir.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::write(input_dir.join("a.bin"), b"aaa").unwrap();
        std::fs::write(input_dir.join("z.bin"), b"zzz").unwrap();

        let threshold = input_dir.join("a.bin").to_string_lossy().to_string();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());
        let (job, _rx) = IngestJob::new(
            depot,
            None,
            default_include(),
            false,
            Some(threshold),
            1,
            workdir.path().join("resume.log"),
            0,
        );

        let tracker = ProgressTracker::new("archive", 1);
        run_job(&job, &[input_dir], &tracker).unwrap();

        assert_eq!(job.stats().objects_written, 1);
    }
}
