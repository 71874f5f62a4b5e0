use std::sync::Arc;

use romdepot::codec;
use romdepot::dat_index::{DatIndex, InMemoryDatIndex};
use romdepot::depot::Depot;
use romdepot::purge::PurgeJob;
use romdepot::types::{Dat, ForcePacking, Game, Rom};
use romdepot::worker::{run_job, ProgressTracker};
use tempfile::tempdir;

fn write_object(depot: &Depot, bytes: &[u8]) -> (String, u64) {
    let (hashes, size) = romdepot::checksum::hash_stream(bytes).unwrap();
    let sha1 = hashes.sha1_hex().unwrap();
    let root = depot.reserve(size).unwrap();
    let object_path = root.object_path(&sha1);
    let sidecar = codec::Sidecar {
        md5: hashes.md5.unwrap(),
        crc32: hashes.crc32.unwrap(),
        size,
    };
    let actual = codec::write_object(&object_path, bytes, &sidecar).unwrap();
    root.record_write(&sha1, actual, size);
    (sha1, size)
}

/// A depot holding one rom still referenced by an indexed dat and one rom
/// that used to be referenced but whose dat has since dropped it: only the
/// orphan should move, and the referenced object's depot accounting should
/// still see it afterward.
#[test]
fn purge_backup_moves_only_unreferenced_objects() {
    let workdir = tempdir().unwrap();
    let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 50_000_000)]).unwrap());

    let (kept_sha1, kept_size) = write_object(&depot, b"still wanted");
    let (_orphan_sha1, _orphan_size) = write_object(&depot, b"no longer wanted");

    let kept_hashes = romdepot::checksum::hash_stream(&b"still wanted"[..]).unwrap().0;

    let dat = Dat {
        name: "current".into(),
        description: String::new(),
        path: workdir.path().join("current.dat"),
        force_packing: Some(ForcePacking::Zip),
        unzip_games: false,
        games: vec![Game {
            name: "g1".into(),
            description: String::new(),
            roms: vec![Rom::new("kept.bin", kept_size, kept_hashes)],
        }],
        generation: 0,
        fixdat: false,
    };
    let index: Arc<dyn DatIndex + Send + Sync> = Arc::new(InMemoryDatIndex::new());
    index.index_rom(&dat).unwrap();

    let backup_dir = workdir.path().join("backup");
    let job = PurgeJob::new(depot.clone(), index, backup_dir.clone()).unwrap();
    let roots = job.roots();
    run_job(&job, &roots, &ProgressTracker::new("purge-backup", 1)).unwrap();

    assert_eq!(job.moved_count(), 1);
    assert!(depot.contains(&kept_sha1));
    assert!(backup_dir.join("uncategorized").exists());
}

/// A rom's only referencing dat was indexed in an earlier refresh batch and
/// never re-indexed in the batch that's now current: the reference is stale,
/// so purge must reclaim the object even though a dat entry for it still
/// technically exists in the index.
#[test]
fn purge_backup_reclaims_objects_referenced_only_by_a_stale_dat_generation() {
    let workdir = tempdir().unwrap();
    let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 50_000_000)]).unwrap());

    let (sha1, size) = write_object(&depot, b"stale reference");
    let hashes = romdepot::checksum::hash_stream(&b"stale reference"[..]).unwrap().0;

    let dat = Dat {
        name: "old".into(),
        description: String::new(),
        path: workdir.path().join("old.dat"),
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
    index.start_batch().unwrap();
    index.index_rom(&dat).unwrap();

    // A later refresh batch starts but never re-indexes "old", leaving its
    // stored generation behind the index's now-current one.
    index.start_batch().unwrap();

    let backup_dir = workdir.path().join("backup");
    let job = PurgeJob::new(depot.clone(), index, backup_dir.clone()).unwrap();
    let roots = job.roots();
    run_job(&job, &roots, &ProgressTracker::new("purge-backup", 1)).unwrap();

    assert_eq!(job.moved_count(), 1);
    assert!(!depot.contains(&sha1));
}
