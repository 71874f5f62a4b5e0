// Lightweight verbosity-gated logging helper used throughout the crate.
macro_rules! vprintln {
	($verbose:expr, $level:expr, $($arg:tt)*) => {
		if $verbose >= $level {
			eprintln!($($arg)*);
		}
	};
}
pub(crate) use vprintln;

mod build;
mod checksum;
mod cli;
mod codec;
mod config;
mod containers;
mod dat_index;
mod dat_parse;
mod depot;
mod diff;
mod error;
mod ingest;
mod progress;
mod purge;
mod resume;
mod torrentzip;
mod types;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::build::{BuildJob, Dir2DatJob};
use crate::cli::Cli;
use crate::config::{Config, CommandConfig};
use crate::dat_index::{open_dat_index, DatIndex};
use crate::dat_parse::{discover_dat_files, parse_dat_file, write_dat_file};
use crate::depot::Depot;
use crate::ingest::{IncludePolicy, IngestJob};
use crate::progress::ProgressReporter;
use crate::purge::PurgeJob;
use crate::worker::{run_job, ProgressTracker};

fn open_depot(config: &Config) -> anyhow::Result<Arc<Depot>> {
    let roots = config
        .depot_roots
        .iter()
        .map(|r| (r.path.clone(), r.max_bytes))
        .collect();
    Ok(Arc::new(Depot::open(roots)?))
}

fn open_index(config: &Config) -> anyhow::Result<Arc<dyn DatIndex + Send + Sync>> {
    Ok(Arc::new(open_dat_index(config.db.as_ref())?))
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H_%M_%S").to_string()
}

fn run_archive(config: &Config, input: &[PathBuf]) -> anyhow::Result<()> {
    let depot = open_depot(config)?;
    let index: Option<Arc<dyn DatIndex + Send + Sync>> = if config.only_needed {
        Some(open_index(config)?)
    } else {
        None
    };

    let include = IncludePolicy {
        zip: config.zip_include,
        gzip: config.gzip_include,
        sevenz: config.sevenz_include,
    };

    let resume_log = config.resolve_resume_log("archive", &timestamp())?;
    let resume_threshold = match &config.resume_path {
        Some(_) if resume_log.exists() => resume::extract_resume_point(&resume_log, config.workers)?,
        _ => None,
    };

    vprintln!(config.verbose, 1, "archive: {} depot root(s), {} worker(s)", depot.roots().len(), config.workers);

    let (job, _checkpoint_rx) = IngestJob::new(
        depot.clone(),
        index,
        include,
        config.only_needed,
        resume_threshold,
        config.workers,
        resume_log,
        config.verbose,
    );

    let tracker = ProgressTracker::new("archive", config.workers);
    let reporter = ProgressReporter::new("archive");
    run_job(&job, input, &tracker)?;
    reporter.finish("archive complete");

    vprintln!(config.verbose, 1, "archive: flushing depot state");
    depot.flush_all()?;

    println!("{}", serde_json::to_string_pretty(&job.stats())?);
    Ok(())
}

fn run_purge_backup(config: &Config, backup_dir: &PathBuf, from_dat: Option<&str>) -> anyhow::Result<()> {
    let depot = open_depot(config)?;
    let index = open_index(config)?;
    let job = PurgeJob::new(depot.clone(), index.clone(), backup_dir.clone())?;
    let tracker = ProgressTracker::new("purge-backup", config.workers);

    match from_dat {
        Some(name) => {
            let items = crate::purge::purge_paths_for_dat(&depot, index.as_ref(), name)?;
            vprintln!(config.verbose, 1, "purge-backup: {} object(s) referenced by {name}", items.len());
            crate::worker::run_job_with_iter(&job, items, &tracker)?;
        }
        None => {
            let roots = job.roots();
            vprintln!(config.verbose, 1, "purge-backup: scanning {} depot root(s)", roots.len());
            run_job(&job, &roots, &tracker)?;
        }
    }

    vprintln!(config.verbose, 1, "purge-backup: flushing depot state");
    depot.flush_all()?;

    println!("moved {} objects to {}", job.moved_count(), backup_dir.display());
    Ok(())
}

fn run_build(config: &Config, output_dir: &PathBuf, write_fixdats: bool) -> anyhow::Result<()> {
    let depot = open_depot(config)?;
    let index = open_index(config)?;
    vprintln!(config.verbose, 1, "build: writing torrent-canonical zips under {}", output_dir.display());
    let job = BuildJob::new(depot.clone(), index, output_dir.clone(), config.zip_compression, write_fixdats);
    job.run_all()?;
    let stats = job.stats();
    vprintln!(config.verbose, 1, "build: {} built, {} incomplete", stats.games_built, stats.games_incomplete);

    vprintln!(config.verbose, 1, "build: flushing depot state");
    depot.flush_all()?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn run_dir2dat(input: &PathBuf, name: &str, out: &PathBuf) -> anyhow::Result<()> {
    let job = Dir2DatJob::new(name, format!("dir2dat of {}", input.display()));
    let tracker = ProgressTracker::new("dir2dat", 1);
    run_job(&job, &[input.clone()], &tracker)?;
    let dat = job.into_dat(out);
    write_dat_file(&dat, out)?;
    println!("wrote {} ({} roms)", out.display(), dat.rom_count());
    Ok(())
}

fn run_diffdat(old: &PathBuf, new: &PathBuf, out: &PathBuf, name: &str) -> anyhow::Result<()> {
    let old_dat = parse_dat_file(old)?;
    let new_dat = parse_dat_file(new)?;
    let diff = diff::diffdat(&old_dat, &new_dat, name, &format!("diff of {name}"));
    write_dat_file(&diff, out)?;
    println!("wrote {} ({} roms)", out.display(), diff.rom_count());
    Ok(())
}

fn run_refresh_dats(config: &Config, input: &[PathBuf]) -> anyhow::Result<()> {
    let index = open_index(config)?;
    index.start_batch()?;
    let mut count = 0usize;
    for root in input {
        for path in discover_dat_files(root)? {
            vprintln!(config.verbose, 2, "refresh-dats: indexing {}", path.display());
            let dat = parse_dat_file(&path)?;
            index.index_rom(&dat)?;
            count += 1;
        }
    }
    println!("indexed {count} dats, generation {}", index.generation()?);
    Ok(())
}

fn run_lookup(config: &Config, hash: &str) -> anyhow::Result<()> {
    let index = open_index(config)?;
    match index.resolve_hash(hash)? {
        Some(hashes) => println!("{}", serde_json::to_string_pretty(&hashes)?),
        None => println!("no match for {hash}"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::try_from(cli)?;

    match &config.command {
        CommandConfig::Archive { input } => run_archive(&config, input)?,
        CommandConfig::PurgeBackup { backup_dir, from_dat } => {
            run_purge_backup(&config, backup_dir, from_dat.as_deref())?
        }
        CommandConfig::Build { output_dir, write_fixdats } => {
            run_build(&config, output_dir, *write_fixdats)?
        }
        CommandConfig::Dir2Dat { input, name, out } => run_dir2dat(input, name, out)?,
        CommandConfig::Diffdat { old, new, out, name } => run_diffdat(old, new, out, name)?,
        CommandConfig::Ediffdat { old, new, out } => {
            let written = diff::ediffdat(old, new, out)?;
            println!("wrote {} diff dats under {}", written.len(), out.display());
        }
        CommandConfig::Lookup { hash } => run_lookup(&config, hash)?,
        CommandConfig::RefreshDats { input } => run_refresh_dats(&config, input)?,
        CommandConfig::Progress => println!("no job is currently running in this process"),
        CommandConfig::Cancel => println!("no job is currently running in this process"),
        CommandConfig::Shutdown => println!("romdepot runs one command per invocation; nothing to shut down"),
        CommandConfig::Memstats => println!("memstats is only meaningful for a long-running server process"),
        CommandConfig::Dbstats => {
            let index = open_index(&config)?;
            println!("generation {}", index.generation()?);
        }
    }

    Ok(())
}
