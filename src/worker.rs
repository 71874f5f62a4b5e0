use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use walkdir::WalkDir;

use crate::error::DepotError;
use crate::types::ProgressSnapshot;

/// One unit of work handed to a worker thread: a path plus its known size
/// (filled in by the initial walk, or by the caller for a `WorkPathIterator`).
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub path: PathBuf,
    pub size: u64,
}

/// Per-worker capability: processes one item at a time, on one thread for
/// the job's lifetime.
pub trait Worker: Send {
    fn process(&mut self, item: &WorkItem) -> anyhow::Result<()>;
    fn close(&mut self) {}
}

/// Master-side job contract. `calculate_work` controls whether the framework
/// runs its own filesystem walk (true) or expects the caller to drive a
/// `WorkPathIterator` instead.
pub trait Job: Send + Sync {
    fn accept(&self, path: &Path) -> bool {
        let _ = path;
        true
    }
    fn calculate_work(&self) -> bool {
        true
    }
    fn new_worker(&self, index: usize) -> Box<dyn Worker>;
    fn num_workers(&self) -> usize;
    fn start(&self) {}
    fn scanned(&self, _n_files: usize, _n_bytes: u64, _common_root: &Path) {}
    fn finish_up(&self) {}
}

/// Thread-safe progress state shared between the dispatcher and whatever UI
/// is rendering it (CLI `progress` subcommand, a TTY bar, or nothing).
pub struct ProgressTracker {
    total_files: AtomicUsize,
    total_bytes: AtomicU64,
    bytes_so_far: AtomicU64,
    files_so_far: AtomicUsize,
    error_files: AtomicUsize,
    know_total: AtomicBool,
    stopping: AtomicBool,
    job_name: String,
    in_flight: Mutex<Vec<Option<String>>>,
}

impl ProgressTracker {
    pub fn new(job_name: impl Into<String>, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            total_files: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            bytes_so_far: AtomicU64::new(0),
            files_so_far: AtomicUsize::new(0),
            error_files: AtomicUsize::new(0),
            know_total: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            job_name: job_name.into(),
            in_flight: Mutex::new(vec![None; worker_count]),
        })
    }

    pub fn set_total(&self, files: usize, bytes: u64) {
        self.total_files.store(files, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.know_total.store(true, Ordering::Relaxed);
    }

    pub fn note_in_flight(&self, worker_index: usize, path: &Path) {
        let mut guard = self.in_flight.lock().unwrap();
        if let Some(slot) = guard.get_mut(worker_index) {
            *slot = Some(path.display().to_string());
        }
    }

    pub fn note_completed(&self, bytes: u64) {
        self.files_so_far.fetch_add(1, Ordering::Relaxed);
        self.bytes_so_far.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn note_error(&self) {
        self.error_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the cooperative cancellation flag; workers observe this between
    /// units and stop pulling new work.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let in_flight = self.in_flight.lock().unwrap();
        ProgressSnapshot {
            total_files: if self.know_total.load(Ordering::Relaxed) {
                Some(self.total_files.load(Ordering::Relaxed))
            } else {
                None
            },
            total_bytes: if self.know_total.load(Ordering::Relaxed) {
                Some(self.total_bytes.load(Ordering::Relaxed))
            } else {
                None
            },
            bytes_so_far: self.bytes_so_far.load(Ordering::Relaxed),
            files_so_far: self.files_so_far.load(Ordering::Relaxed),
            running: !self.stopping.load(Ordering::Relaxed),
            job_name: self.job_name.clone(),
            starting: false,
            stopping: self.stopping.load(Ordering::Relaxed),
            know_total: self.know_total.load(Ordering::Relaxed),
            terminal_message: None,
            current_files: in_flight.iter().flatten().cloned().collect(),
        }
    }
}

/// Drives a job to completion by walking `roots`, dispatching through an
/// unbuffered channel to `job.num_workers()` threads, and observing the
/// progress tracker's stop flag cooperatively.
pub fn run_job(job: &dyn Job, roots: &[PathBuf], tracker: &Arc<ProgressTracker>) -> anyhow::Result<()> {
    run_job_with_items(job, WorkSource::Walk(roots), tracker)
}

/// `WorkPathIterator` variant: the caller supplies the work list directly
/// (e.g. purge-from-DAT resolving DAT roms to depot paths) instead of a
/// filesystem walk.
pub fn run_job_with_iter(
    job: &dyn Job,
    items: Vec<WorkItem>,
    tracker: &Arc<ProgressTracker>,
) -> anyhow::Result<()> {
    run_job_with_items(job, WorkSource::Items(items), tracker)
}

enum WorkSource<'a> {
    Walk(&'a [PathBuf]),
    Items(Vec<WorkItem>),
}

fn run_job_with_items(
    job: &dyn Job,
    source: WorkSource,
    tracker: &Arc<ProgressTracker>,
) -> anyhow::Result<()> {
    job.start();

    let items: Vec<WorkItem> = match source {
        WorkSource::Walk(roots) => {
            let mut collected = Vec::new();
            for root in roots {
                for entry in WalkDir::new(root)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().is_file())
                {
                    let path = entry.path().to_path_buf();
                    if !job.accept(&path) {
                        continue;
                    }
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    collected.push(WorkItem { path, size });
                }
            }
            collected
        }
        WorkSource::Items(items) => items.into_iter().filter(|i| job.accept(&i.path)).collect(),
    };

    if job.calculate_work() {
        let total_bytes: u64 = items.iter().map(|i| i.size).sum();
        let common_root = items
            .first()
            .and_then(|i| i.path.parent())
            .unwrap_or_else(|| Path::new("."));
        job.scanned(items.len(), total_bytes, common_root);
        tracker.set_total(items.len(), total_bytes);
    }

    let worker_count = job.num_workers().max(1);
    let (job_tx, job_rx) = mpsc::channel::<WorkItem>();
    let job_rx = Arc::new(Mutex::new(job_rx));

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);
    let fatal: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    for index in 0..worker_count {
        let mut worker = job.new_worker(index);
        let rx = job_rx.clone();
        let tracker = tracker.clone();
        let fatal = fatal.clone();
        handles.push(std::thread::spawn(move || {
            loop {
                if tracker.is_stopping() {
                    break;
                }
                let item = {
                    let rx = rx.lock().unwrap();
                    rx.recv()
                };
                let Ok(item) = item else { break };
                tracker.note_in_flight(index, &item.path);
                match worker.process(&item) {
                    Ok(()) => tracker.note_completed(item.size),
                    Err(err) => {
                        if let Some(depot_err) = DepotError::downcast_from(&err) {
                            if depot_err.is_fatal() {
                                *fatal.lock().unwrap() = Some(err);
                                tracker.stop();
                                break;
                            }
                        }
                        tracker.note_error();
                    }
                }
            }
            worker.close();
        }));
    }

    for item in items {
        if tracker.is_stopping() {
            break;
        }
        if job_tx.send(item).is_err() {
            break;
        }
    }
    drop(job_tx);

    for handle in handles {
        let _ = handle.join();
    }

    job.finish_up();

    if let Some(err) = fatal.lock().unwrap().take() {
        return Err(err);
    }
    Ok(())
}

/// Sends a `(worker_index, path)` update to the resume-checkpoint observer;
/// kept as a thin type alias so pipelines don't depend on `mpsc` directly.
pub type CheckpointSender = Sender<(usize, String)>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use tempfile::tempdir;

    struct CountingWorker {
        processed: Arc<StdAtomicUsize>,
    }

    impl Worker for CountingWorker {
        fn process(&mut self, _item: &WorkItem) -> anyhow::Result<()> {
            self.processed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct CountingJob {
        processed: Arc<StdAtomicUsize>,
        workers: usize,
    }

    impl Job for CountingJob {
        fn new_worker(&self, _index: usize) -> Box<dyn Worker> {
            Box::new(CountingWorker {
                processed: self.processed.clone(),
            })
        }
        fn num_workers(&self) -> usize {
            self.workers
        }
    }

    #[test]
    fn walk_dispatches_every_file_exactly_once() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.bin")), b"x").unwrap();
        }

        let processed = Arc::new(StdAtomicUsize::new(0));
        let job = CountingJob {
            processed: processed.clone(),
            workers: 2,
        };
        let tracker = ProgressTracker::new("test", 2);
        run_job(&job, &[dir.path().to_path_buf()], &tracker).unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 5);
        assert_eq!(tracker.snapshot().files_so_far, 5);
    }

    struct FailingWorker;
    impl Worker for FailingWorker {
        fn process(&mut self, _item: &WorkItem) -> anyhow::Result<()> {
            Err(DepotError::DepotFull.into())
        }
    }

    struct FailingJob;
    impl Job for FailingJob {
        fn new_worker(&self, _index: usize) -> Box<dyn Worker> {
            Box::new(FailingWorker)
        }
        fn num_workers(&self) -> usize {
            1
        }
    }

    #[test]
    fn depot_full_aborts_the_job_as_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f0.bin"), b"x").unwrap();

        let tracker = ProgressTracker::new("test", 1);
        let result = run_job(&FailingJob, &[dir.path().to_path_buf()], &tracker);
        assert!(result.is_err());
        assert!(tracker.is_stopping());
    }
}
