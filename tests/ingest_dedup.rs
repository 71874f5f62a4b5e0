use std::sync::Arc;

use romdepot::depot::Depot;
use romdepot::ingest::{IncludePolicy, IngestJob};
use romdepot::types::ContainerInclude;
use romdepot::worker::{run_job, ProgressTracker};
use tempfile::tempdir;

fn entries_only() -> IncludePolicy {
    IncludePolicy {
        zip: ContainerInclude::EntriesOnly,
        gzip: ContainerInclude::EntriesOnly,
        sevenz: ContainerInclude::EntriesOnly,
    }
}

#[test]
fn archiving_a_tree_with_duplicate_files_writes_one_object_per_distinct_content() {
    let workdir = tempdir().unwrap();
    let input_dir = workdir.path().join("input");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("a.bin"), b"shared payload").unwrap();
    std::fs::write(input_dir.join("b.bin"), b"shared payload").unwrap();
    std::fs::write(input_dir.join("c.bin"), b"unique payload").unwrap();

    let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 50_000_000)]).unwrap());
    let (job, _rx) = IngestJob::new(
        depot.clone(),
        None,
        entries_only(),
        false,
        None,
        2,
        workdir.path().join("resume.log"),
        0,
    );

    let tracker = ProgressTracker::new("archive", 2);
    run_job(&job, &[input_dir], &tracker).unwrap();

    let stats = job.stats();
    assert_eq!(stats.objects_written, 2);
    assert_eq!(stats.objects_deduplicated, 1);

    let (shared_hashes, _) = romdepot::checksum::hash_stream(&b"shared payload"[..]).unwrap();
    let (unique_hashes, _) = romdepot::checksum::hash_stream(&b"unique payload"[..]).unwrap();
    assert!(depot.contains(&shared_hashes.sha1_hex().unwrap()));
    assert!(depot.contains(&unique_hashes.sha1_hex().unwrap()));
}

#[test]
fn re_archiving_the_same_tree_writes_nothing_new() {
    let workdir = tempdir().unwrap();
    let input_dir = workdir.path().join("input");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("a.bin"), b"already archived").unwrap();

    let depot = Arc::new(Depot::open(vec![(workdir.path().join("root0"), 50_000_000)]).unwrap());

    let (first, _rx) = IngestJob::new(
        depot.clone(),
        None,
        entries_only(),
        false,
        None,
        1,
        workdir.path().join("resume-1.log"),
        0,
    );
    run_job(&first, &[input_dir.clone()], &ProgressTracker::new("archive", 1)).unwrap();
    assert_eq!(first.stats().objects_written, 1);

    let (second, _rx) = IngestJob::new(
        depot,
        None,
        entries_only(),
        false,
        None,
        1,
        workdir.path().join("resume-2.log"),
        0,
    );
    run_job(&second, &[input_dir], &ProgressTracker::new("archive", 1)).unwrap();
    assert_eq!(second.stats().objects_written, 0);
    assert_eq!(second.stats().objects_deduplicated, 1);
}
