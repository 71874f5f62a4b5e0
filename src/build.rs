use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::codec::{self, Sidecar};
use crate::dat_index::DatIndex;
use crate::dat_parse::write_dat_file;
use crate::depot::Depot;
use crate::torrentzip::{CanonicalZipWriter, TorrentZipWriter};
use crate::types::{Dat, Game, Rom, ZipCompression};
use crate::worker::{Job, Worker, WorkItem};

/// The `build`/`fixdat` job: for each dat in the index, assembles every
/// available rom into a torrent-canonical zip under `output_dir` (mirroring
/// the dat's relative directory layout), and, if `write_fixdats` is set,
/// emits a `fix_<name>.dat` listing whatever roms the depot is still missing.
pub struct BuildJob {
    depot: Arc<Depot>,
    dat_index: Arc<dyn DatIndex + Send + Sync>,
    output_dir: PathBuf,
    compression: ZipCompression,
    write_fixdats: bool,
    stats: Arc<BuildStatsInner>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BuildStats {
    pub games_built: usize,
    pub games_incomplete: usize,
    pub roms_missing: usize,
}

struct BuildStatsInner {
    games_built: std::sync::atomic::AtomicUsize,
    games_incomplete: std::sync::atomic::AtomicUsize,
    roms_missing: std::sync::atomic::AtomicUsize,
}

impl BuildJob {
    pub fn new(
        depot: Arc<Depot>,
        dat_index: Arc<dyn DatIndex + Send + Sync>,
        output_dir: PathBuf,
        compression: ZipCompression,
        write_fixdats: bool,
    ) -> Self {
        Self {
            depot,
            dat_index,
            output_dir,
            compression,
            write_fixdats,
            stats: Arc::new(BuildStatsInner {
                games_built: std::sync::atomic::AtomicUsize::new(0),
                games_incomplete: std::sync::atomic::AtomicUsize::new(0),
                roms_missing: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    pub fn stats(&self) -> BuildStats {
        use std::sync::atomic::Ordering;
        BuildStats {
            games_built: self.stats.games_built.load(Ordering::Relaxed),
            games_incomplete: self.stats.games_incomplete.load(Ordering::Relaxed),
            roms_missing: self.stats.roms_missing.load(Ordering::Relaxed),
        }
    }

    /// Runs every dat known to the index, one worker per dat name.
    pub fn run_all(&self) -> anyhow::Result<()> {
        let mut names = Vec::new();
        self.dat_index.for_each_dat(&mut |dat| {
            names.push(dat.name.clone());
            Ok(())
        })?;

        for name in names {
            if let Some(dat) = self.dat_index.get_dat(&name)? {
                self.build_one(&dat)?;
            }
        }
        Ok(())
    }

    /// Resolves `rom`'s depot key: its own SHA-1 if declared, otherwise
    /// whatever SHA-1 the dat index can recover from a CRC+size or MD5+size
    /// match against the indexed corpus.
    fn resolve_sha1(&self, rom: &Rom) -> Option<String> {
        if let Some(sha1) = rom.hashes.sha1_hex() {
            return Some(sha1);
        }
        let key = rom.hashes.md5_hex().or_else(|| rom.hashes.crc32_hex())?;
        self.dat_index
            .resolve_hash(&key)
            .ok()
            .flatten()
            .and_then(|h| h.sha1_hex())
    }

    fn build_one(&self, dat: &Dat) -> anyhow::Result<()> {
        let dat_dir = self.output_dir.join(&dat.name);
        std::fs::create_dir_all(&dat_dir)?;

        let mut fix_games: Vec<Game> = Vec::new();

        for game in &dat.games {
            let resolved: Vec<(&Rom, Option<String>)> = game
                .roms
                .iter()
                .map(|rom| (rom, self.resolve_sha1(rom)))
                .collect();
            let (present, missing): (Vec<(&Rom, Option<String>)>, Vec<(&Rom, Option<String>)>) =
                resolved
                    .into_iter()
                    .partition(|(_, sha1)| sha1.as_deref().is_some_and(|h| self.depot.contains(h)));

            if !missing.is_empty() {
                self.stats
                    .games_incomplete
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.stats
                    .roms_missing
                    .fetch_add(missing.len(), std::sync::atomic::Ordering::Relaxed);
                fix_games.push(Game {
                    name: game.name.clone(),
                    description: game.description.clone(),
                    roms: missing.into_iter().map(|(rom, _)| rom.clone()).collect(),
                });
                continue;
            }

            let zip_path = dat_dir.join(format!("{}.zip", sanitize(&game.name)));
            let mut writer: Box<dyn TorrentZipWriter> =
                Box::new(CanonicalZipWriter::create(&zip_path, self.compression));
            for (rom, sha1) in &present {
                let sha1 = sha1.as_deref().expect("checked present above");
                let root = self
                    .depot
                    .locate(sha1)
                    .ok_or_else(|| anyhow::anyhow!("rom {sha1} vanished from depot mid-build"))?;
                let object_path = root.object_path(sha1);
                let mut decoder = codec::open_object(&object_path)?;
                writer.start_file(&rom.name)?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    use std::io::Read;
                    let n = decoder.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buf[..n])?;
                }
            }
            writer.finish()?;

            self.stats
                .games_built
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        if self.write_fixdats && !fix_games.is_empty() {
            let fix_dat = Dat {
                name: format!("fix_{}", dat.name),
                description: format!("missing roms from {}", dat.name),
                path: dat_dir.join(format!("fix_{}.dat", dat.name)),
                force_packing: dat.force_packing,
                unzip_games: dat.unzip_games,
                games: fix_games,
                generation: dat.generation,
                fixdat: true,
            };
            write_dat_file(&fix_dat, &fix_dat.path.clone())?;
        }

        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Disk-backed deduper keyed by SHA-1 hex, used by the build directory
/// mirroring pass to avoid writing the same rom twice when two games share it.
pub struct Deduper {
    seen: Mutex<HashSet<String>>,
}

impl Deduper {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true the first time `key` is seen.
    pub fn mark_new(&self, key: &str) -> bool {
        self.seen.lock().unwrap().insert(key.to_string())
    }
}

impl Default for Deduper {
    fn default() -> Self {
        Self::new()
    }
}

/// `dir2dat`: walks `root`, hashes every file, and emits a `Dat` describing
/// the directory's contents as a single synthetic game set.
pub struct Dir2DatJob {
    dat_name: String,
    description: String,
    games: Arc<Mutex<Vec<Game>>>,
}

impl Dir2DatJob {
    pub fn new(dat_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            dat_name: dat_name.into(),
            description: description.into(),
            games: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn into_dat(self, out: &Path) -> Dat {
        let games = std::mem::take(&mut *self.games.lock().unwrap());
        Dat {
            name: self.dat_name,
            description: self.description,
            path: out.to_path_buf(),
            force_packing: None,
            unzip_games: false,
            games,
            generation: 0,
            fixdat: false,
        }
        .normalize()
    }
}

impl Job for Dir2DatJob {
    fn new_worker(&self, _index: usize) -> Box<dyn Worker> {
        Box::new(Dir2DatWorker {
            games: self.games.clone(),
        })
    }

    fn num_workers(&self) -> usize {
        1
    }
}

struct Dir2DatWorker {
    games: Arc<Mutex<Vec<Game>>>,
}

impl Worker for Dir2DatWorker {
    fn process(&mut self, item: &WorkItem) -> anyhow::Result<()> {
        let (hashes, size) = crate::checksum::hash_file(&item.path)?;
        let rom = Rom::new(
            item.path.file_name().unwrap_or_default().to_string_lossy().to_string(),
            size,
            hashes,
        );
        self.games.lock().unwrap().push(Game {
            name: rom.name.clone(),
            description: String::new(),
            roms: vec![rom],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dat_index::InMemoryDatIndex;
    use crate::types::{ForcePacking, Hashes};
    use tempfile::tempdir;

    fn hashes_for(bytes: &[u8]) -> (Hashes, u64) {
        crate::checksum::hash_stream(bytes).unwrap()
    }

    #[test]
    fn build_writes_a_torrent_zip_for_a_complete_game() {
        let workdir = tempdir().unwrap();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());

        let (hashes, size) = hashes_for(b"rom bytes");
        let sha1 = hashes.sha1_hex().unwrap();
        let root = depot.reserve(size).unwrap();
        let object_path = root.object_path(&sha1);
        let sidecar = Sidecar {
            md5: hashes.md5.unwrap(),
            crc32: hashes.crc32.unwrap(),
            size,
        };
        codec::write_object(&object_path, &b"rom bytes"[..], &sidecar).unwrap();
        root.record_write(&sha1, 9, size);

        let dat = Dat {
            name: "demo".into(),
            description: "demo set".into(),
            path: PathBuf::from("demo.dat"),
            force_packing: Some(ForcePacking::Zip),
            unzip_games: false,
            games: vec![Game {
                name: "game1".into(),
                description: String::new(),
                roms: vec![Rom::new("rom.bin", size, hashes)],
            }],
            generation: 0,
            fixdat: false,
        };

        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        index.index_rom(&dat).unwrap();

        let output_dir = workdir.path().join("out");
        let job = BuildJob::new(depot, index, output_dir.clone(), ZipCompression::Deflated, true);
        job.run_all().unwrap();

        assert_eq!(job.stats().games_built, 1);
        assert!(output_dir.join("demo").join("game1.zip").exists());
    }

    #[test]
    fn build_emits_fixdat_for_incomplete_game() {
        let workdir = tempdir().unwrap();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());

        let (hashes, size) = hashes_for(b"missing rom");
        let dat = Dat {
            name: "demo".into(),
            description: String::new(),
            path: PathBuf::from("demo.dat"),
            force_packing: None,
            unzip_games: false,
            games: vec![Game {
                name: "game1".into(),
                description: String::new(),
                roms: vec![Rom::new("missing.bin", size, hashes)],
            }],
            generation: 0,
            fixdat: false,
        };
        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        index.index_rom(&dat).unwrap();

        let output_dir = workdir.path().join("out");
        let job = BuildJob::new(depot, index, output_dir.clone(), ZipCompression::Deflated, true);
        job.run_all().unwrap();

        assert_eq!(job.stats().games_incomplete, 1);
        assert!(output_dir.join("demo").join("fix_demo.dat").exists());
    }

    #[test]
    fn build_resolves_a_crc_and_size_only_rom_through_the_dat_index() {
        let workdir = tempdir().unwrap();
        let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 10_000_000)]).unwrap());

        let (full_hashes, size) = hashes_for(b"weakly declared rom");
        let sha1 = full_hashes.sha1_hex().unwrap();
        let root = depot.reserve(size).unwrap();
        let object_path = root.object_path(&sha1);
        let sidecar = Sidecar {
            md5: full_hashes.md5.unwrap(),
            crc32: full_hashes.crc32.unwrap(),
            size,
        };
        codec::write_object(&object_path, &b"weakly declared rom"[..], &sidecar).unwrap();
        root.record_write(&sha1, size, size);

        let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
        // Seeds a crc32+size -> full-hash mapping the way a physically
        // scanned rom would, without declaring a sha1 on the dat's own rom.
        index.index_loose_rom(&full_hashes, size).unwrap();

        let crc_only = Hashes {
            crc32: full_hashes.crc32,
            md5: None,
            sha1: None,
        };
        let dat = Dat {
            name: "demo".into(),
            description: String::new(),
            path: PathBuf::from("demo.dat"),
            force_packing: Some(ForcePacking::Zip),
            unzip_games: false,
            games: vec![Game {
                name: "game1".into(),
                description: String::new(),
                roms: vec![Rom::new("rom.bin", size, crc_only)],
            }],
            generation: 0,
            fixdat: false,
        };

        let output_dir = workdir.path().join("out");
        let job = BuildJob::new(depot, index, output_dir.clone(), ZipCompression::Deflated, true);
        job.build_one(&dat).unwrap();

        assert_eq!(job.stats().games_built, 1);
        assert!(output_dir.join("demo").join("game1.zip").exists());
    }
}
