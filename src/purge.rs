use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{self, read_sidecar};
use crate::dat_index::DatIndex;
use crate::depot::{recover_sha1, Depot};
use crate::types::Hashes;
use crate::worker::{Job, Worker, WorkItem};

/// `purge-backup`: walks depot roots directly, moving any object whose SHA-1
/// resolves to no dat at the index's current generation into `backup_dir`,
/// preserving the orphaned dat's relative path when one is known.
pub struct PurgeJob {
    depot: Arc<Depot>,
    dat_index: Arc<dyn DatIndex + Send + Sync>,
    backup_dir: PathBuf,
    current_generation: u64,
    moved: Arc<std::sync::atomic::AtomicUsize>,
}

impl PurgeJob {
    pub fn new(depot: Arc<Depot>, dat_index: Arc<dyn DatIndex + Send + Sync>, backup_dir: PathBuf) -> anyhow::Result<Self> {
        let current_generation = dat_index.generation()?;
        Ok(Self {
            depot,
            dat_index,
            backup_dir,
            current_generation,
            moved: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    pub fn moved_count(&self) -> usize {
        self.moved.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.depot.roots().iter().map(|r| r.path.clone()).collect()
    }
}

impl Job for PurgeJob {
    fn accept(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("gz")
    }

    fn new_worker(&self, _index: usize) -> Box<dyn Worker> {
        Box::new(PurgeWorker {
            depot: self.depot.clone(),
            dat_index: self.dat_index.clone(),
            backup_dir: self.backup_dir.clone(),
            current_generation: self.current_generation,
            moved: self.moved.clone(),
        })
    }

    fn num_workers(&self) -> usize {
        num_cpus::get().max(1)
    }
}

struct PurgeWorker {
    depot: Arc<Depot>,
    dat_index: Arc<dyn DatIndex + Send + Sync>,
    backup_dir: PathBuf,
    current_generation: u64,
    moved: Arc<std::sync::atomic::AtomicUsize>,
}

impl Worker for PurgeWorker {
    fn process(&mut self, item: &WorkItem) -> anyhow::Result<()> {
        let Some(root) = self.depot.root_for_path(&item.path) else {
            return Ok(());
        };
        let Some(sha1_hex) = recover_sha1(&root.path, &item.path) else {
            return Ok(());
        };
        let Some(sidecar) = read_sidecar(&item.path)? else {
            return Ok(());
        };

        let hashes = Hashes {
            crc32: Some(sidecar.crc32),
            md5: Some(sidecar.md5),
            sha1: hex::decode(&sha1_hex).ok().and_then(|b| b.try_into().ok()),
        };

        let current_generation = self.current_generation;
        let current_dats = self.dat_index.filtered_dats_for_rom(
            &hashes,
            sidecar.size,
            &|_, generation| generation == current_generation,
        )?;
        if !current_dats.is_empty() {
            return Ok(());
        }

        let orphan_dat = self
            .dat_index
            .resolve_hash(&sha1_hex)?
            .and_then(|h| {
                self.dat_index
                    .filtered_dats_for_rom(&h, sidecar.size, &|_, _| true)
                    .ok()
            })
            .and_then(|names| names.into_iter().next());

        let dest = backup_destination(&self.backup_dir, orphan_dat.as_deref(), &item.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        move_cross_device(&item.path, &dest)?;
        root.record_removal(sidecar_object_size(&item.path).unwrap_or(item.size));

        self.moved.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

fn sidecar_object_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

fn backup_destination(backup_dir: &Path, orphan_dat: Option<&str>, object_path: &Path) -> PathBuf {
    let basename = object_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("unknown.gz"));
    match orphan_dat {
        Some(name) => backup_dir.join(name).join(basename),
        None => backup_dir.join("uncategorized").join(basename),
    }
}

/// Renames within the same filesystem, falling back to copy+remove across
/// filesystem boundaries (e.g. depot root and backup dir on separate mounts).
fn move_cross_device(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::rename(src, dest).or_else(|_| {
        fs::copy(src, dest)?;
        fs::remove_file(src)
    })?;
    Ok(())
}

/// `purge-from-dat`: walks the tree of a specific dat, resolving every rom's
/// depot path through the `codec` object layout and feeding those paths
/// through the same `PurgeWorker` logic via `run_job_with_iter`.
pub fn purge_paths_for_dat(depot: &Depot, dat_index: &dyn DatIndex, dat_name: &str) -> anyhow::Result<Vec<WorkItem>> {
    let Some(dat) = dat_index.get_dat(dat_name)? else {
        return Ok(Vec::new());
    };
    let mut items = Vec::new();
    for game in &dat.games {
        for rom in &game.roms {
            let Some(sha1) = rom.hashes.sha1_hex() else {
                continue;
            };
            if let Some(root) = depot.locate(&sha1) {
                let path = root.object_path(&sha1);
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(rom.size);
                items.push(WorkItem { path, size });
            }
        }
    }
    Ok(items)
}

pub fn object_sha1(path: &Path) -> Option<String> {
    codec::sha1_from_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Sidecar;
    use crate::dat_index::InMemoryDatIndex;
    use crate::types::{Dat, ForcePacking, Game, Rom};
    use crate::worker::{run_job, ProgressTracker};
    use tempfile::tempdir;

    #[test]
    fn orphaned_object_is_moved_to_backup() {
        let workdir = tempdir().unwrap();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());

        let (hashes, size) = crate::checksum::hash_stream(&b"orphan"[..]).unwrap();
        let sha1 = hashes.sha1_hex().unwrap();
        let root = depot.reserve(size).unwrap();
        let object_path = root.object_path(&sha1);
        let sidecar = Sidecar {
            md5: hashes.md5.unwrap(),
            crc32: hashes.crc32.unwrap(),
            size,
        };
        codec::write_object(&object_path, &b"orphan"[..], &sidecar).unwrap();
        root.record_write(&sha1, 6, size);

        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        let backup_dir = workdir.path().join("backup");
        let job = PurgeJob::new(depot.clone(), index, backup_dir.clone()).unwrap();

        let tracker = ProgressTracker::new("purge-backup", 1);
        run_job(&job, &[workdir.path().join("root0")], &tracker).unwrap();

        assert_eq!(job.moved_count(), 1);
        assert!(!object_path.exists());
        assert!(backup_dir.join("uncategorized").join(format!("{sha1}.gz")).exists());
    }

    #[test]
    fn current_rom_is_left_in_place() {
        let workdir = tempdir().unwrap();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());

        let (hashes, size) = crate::checksum::hash_stream(&b"keep me"[..]).unwrap();
        let sha1 = hashes.sha1_hex().unwrap();
        let root = depot.reserve(size).unwrap();
        let object_path = root.object_path(&sha1);
        let sidecar = Sidecar {
            md5: hashes.md5.unwrap(),
            crc32: hashes.crc32.unwrap(),
            size,
        };
        codec::write_object(&object_path, &b"keep me"[..], &sidecar).unwrap();
        root.record_write(&sha1, 7, size);

        let dat = Dat {
            name: "demo".into(),
            description: String::new(),
            path: PathBuf::from("demo.dat"),
            force_packing: Some(ForcePacking::Zip),
            unzip_games: false,
            games: vec![Game {
                name: "g1".into(),
                description: String::new(),
                roms: vec![Rom::new("a.bin", size, hashes)],
            }],
            generation: 0,
            fixdat: false,
        };
        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        index.index_rom(&dat).unwrap();

        let backup_dir = workdir.path().join("backup");
        let job = PurgeJob::new(depot, index, backup_dir).unwrap();

        let tracker = ProgressTracker::new("purge-backup", 1);
        run_job(&job, &[workdir.path().join("root0")], &tracker).unwrap();

        assert_eq!(job.moved_count(), 0);
        assert!(object_path.exists());
    }
}
