use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::types::{ContainerInclude, ZipCompression};

#[derive(Parser, Debug)]
#[command(
    name = "romdepot",
    version,
    about = "Content-addressed rom depot",
    long_about = "Maintains a sharded, deduplicated, gzip-backed store of rom payloads keyed by SHA-1, built against one or more DAT corpora."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Depot root directories, each as `path[:max_bytes]`; repeatable
    #[arg(long = "depot-root", value_name = "PATH[:BYTES]", global = true, action = ArgAction::Append)]
    pub depot_root: Vec<String>,

    /// Number of worker threads; defaults to the number of CPUs
    #[arg(long = "workers", value_name = "N", global = true)]
    pub workers: Option<usize>,

    /// Path to the sqlite dat index; in-memory if omitted
    #[arg(long = "db", value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Directory holding resume logs
    #[arg(long = "resume-dir", value_name = "PATH", global = true)]
    pub resume_dir: Option<PathBuf>,

    /// Resume from a specific log path, or `latest` to pick the newest
    #[arg(long = "resume", value_name = "PATH|latest", global = true)]
    pub resume: Option<String>,

    /// Skip the initial filesystem walk; rely entirely on the resume log
    #[arg(long = "skip-initial-scan", global = true)]
    pub skip_initial_scan: bool,

    /// Only ingest roms present in the dat index
    #[arg(long = "only-needed", global = true)]
    pub only_needed: bool,

    /// Inclusion policy for zip containers
    #[arg(long = "zip-include", value_enum, default_value_t = ContainerInclude::EntriesOnly, global = true)]
    pub zip_include: ContainerInclude,

    /// Inclusion policy for gzip containers
    #[arg(long = "gzip-include", value_enum, default_value_t = ContainerInclude::EntriesOnly, global = true)]
    pub gzip_include: ContainerInclude,

    /// Inclusion policy for 7z containers
    #[arg(long = "7z-include", value_enum, default_value_t = ContainerInclude::EntriesOnly, global = true)]
    pub sevenz_include: ContainerInclude,

    /// Compression used for torrent-canonical zip output
    #[arg(long = "zip-compression", value_enum, default_value_t = ZipCompression::Deflated, global = true)]
    pub zip_compression: ZipCompression,

    /// Verbosity; repeat for more detail
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingests files from input paths into the depot
    Archive {
        #[arg(value_name = "PATH", required = true)]
        input: Vec<PathBuf>,
    },
    /// Alias for `archive` kept for parity with the romba CLI surface
    Merge {
        #[arg(value_name = "PATH", required = true)]
        input: Vec<PathBuf>,
    },
    /// Moves depot objects with no current dat reference to a backup directory
    PurgeBackup {
        #[arg(long = "backup-dir", value_name = "PATH")]
        backup_dir: PathBuf,

        /// Restrict the purge to roms referenced by this dat rather than
        /// walking every depot root
        #[arg(long = "from-dat", value_name = "NAME")]
        from_dat: Option<String>,
    },
    /// Builds torrent-canonical zips for every indexed dat
    Build {
        #[arg(long = "output-dir", value_name = "PATH")]
        output_dir: PathBuf,
    },
    /// Builds zips and emits `fix_<name>.dat` files for missing roms
    Fixdat {
        #[arg(long = "output-dir", value_name = "PATH")]
        output_dir: PathBuf,
    },
    /// Hashes a directory tree and emits a dat describing its contents
    Dir2Dat {
        #[arg(value_name = "PATH")]
        input: PathBuf,
        #[arg(long = "name", value_name = "NAME")]
        name: String,
        #[arg(long = "out", value_name = "PATH")]
        out: PathBuf,
    },
    /// Emits the roms in `new` not already present in `old`
    Diffdat {
        #[arg(long = "old", value_name = "PATH")]
        old: PathBuf,
        #[arg(long = "new", value_name = "PATH")]
        new: PathBuf,
        #[arg(long = "out", value_name = "PATH")]
        out: PathBuf,
        #[arg(long = "name", value_name = "NAME", default_value = "diff")]
        name: String,
    },
    /// Directory-tree variant of `diffdat`
    Ediffdat {
        #[arg(long = "old", value_name = "PATH")]
        old: PathBuf,
        #[arg(long = "new", value_name = "PATH")]
        new: PathBuf,
        #[arg(long = "out", value_name = "PATH")]
        out: PathBuf,
    },
    /// Resolves a loose hash string against the dat index
    Lookup {
        #[arg(value_name = "HEX")]
        hash: String,
    },
    /// (Re)indexes dat files under the given paths
    RefreshDats {
        #[arg(value_name = "PATH", required = true)]
        input: Vec<PathBuf>,
    },
    /// Reports current job progress
    Progress,
    /// Requests cooperative cancellation of the running job
    Cancel,
    /// Gracefully stops the depot server
    Shutdown,
    /// Reports process memory usage
    Memstats,
    /// Reports dat index and depot root statistics
    Dbstats,
}
