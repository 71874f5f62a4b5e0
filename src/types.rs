use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Three widely used hash digests of a byte stream, any subset of which may be
/// known for a given rom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub crc32: Option<[u8; 4]>,
    pub md5: Option<[u8; 16]>,
    pub sha1: Option<[u8; 20]>,
}

impl Hashes {
    pub fn is_empty(&self) -> bool {
        self.crc32.is_none() && self.md5.is_none() && self.sha1.is_none()
    }

    pub fn sha1_hex(&self) -> Option<String> {
        self.sha1.map(hex::encode)
    }

    pub fn crc32_hex(&self) -> Option<String> {
        self.crc32.map(hex::encode)
    }

    pub fn md5_hex(&self) -> Option<String> {
        self.md5.map(hex::encode)
    }

    /// Stricter rom-hash equality: match iff any available strong hash
    /// matches, with size equal when comparing by CRC or MD5.
    pub fn matches(&self, other: &Hashes, self_size: u64, other_size: u64) -> bool {
        if let (Some(a), Some(b)) = (self.sha1, other.sha1) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.md5, other.md5) {
            return a == b && self_size == other_size;
        }
        if let (Some(a), Some(b)) = (self.crc32, other.crc32) {
            return a == b && self_size == other_size;
        }
        false
    }
}

/// A rom's dump-status annotation. Only non-`NoDump` roms carrying a hash
/// are eligible for depot/build operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RomStatus {
    Good,
    BadDump,
    NoDump,
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rom {
    pub name: String,
    pub size: u64,
    pub hashes: Hashes,
    pub status: Option<RomStatus>,
    pub path: Option<String>,
}

impl Rom {
    pub fn new(name: impl Into<String>, size: u64, hashes: Hashes) -> Self {
        Self {
            name: name.into(),
            size,
            hashes,
            status: None,
            path: None,
        }
    }

    /// A rom is valid iff it carries at least one hash and is not marked
    /// `nodump`.
    pub fn is_valid(&self) -> bool {
        if matches!(self.status, Some(RomStatus::NoDump)) {
            return false;
        }
        !self.hashes.is_empty()
    }

    pub fn normalize_name(&mut self) {
        if self.name.contains('\\') {
            self.name = self.name.replace('\\', "/");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub name: String,
    pub description: String,
    pub roms: Vec<Rom>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcePacking {
    Zip,
    Unzip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dat {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub force_packing: Option<ForcePacking>,
    pub unzip_games: bool,
    pub games: Vec<Game>,
    pub generation: u64,
    pub fixdat: bool,
}

impl Dat {
    /// Sorts games and roms by name, canonicalizes rom name separators and
    /// drops invalid roms. Idempotent: `normalize(normalize(d)) == normalize(d)`.
    pub fn normalize(mut self) -> Self {
        for game in &mut self.games {
            for rom in &mut game.roms {
                rom.normalize_name();
            }
            game.roms.retain(|r| r.is_valid());
            game.roms.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.games.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(ForcePacking::Unzip) = self.force_packing {
            self.unzip_games = true;
        }

        self
    }

    pub fn rom_count(&self) -> usize {
        self.games.iter().map(|g| g.roms.len()).sum()
    }
}

/// Tri-state inclusion policy used by the ingestion pipeline for containers
/// that can be expanded (zip, 7z, gzip): either ingest only the inner
/// entries, both the container and its entries, or only the container as an
/// opaque object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ContainerInclude {
    #[value(name = "entries")]
    EntriesOnly,
    #[value(name = "both")]
    Both,
    #[value(name = "container")]
    ContainerOnly,
}

impl ContainerInclude {
    pub fn includes_container(self) -> bool {
        matches!(self, ContainerInclude::Both | ContainerInclude::ContainerOnly)
    }

    pub fn includes_entries(self) -> bool {
        matches!(self, ContainerInclude::Both | ContainerInclude::EntriesOnly)
    }
}

/// Compression selected for the build pipeline's torrent-canonical zip
/// output. `Stored` trades space for speed and matches sets where entries
/// are already compressed (e.g. CHD); `Deflated` is the common default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ZipCompression {
    #[value(name = "stored")]
    Stored,
    #[value(name = "deflated")]
    Deflated,
}

/// Outcome of a completed job, reported by the worker framework and printed
/// by the CLI shell in place of a network progress broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobOutcome {
    Success {
        files_processed: usize,
        bytes_processed: u64,
    },
    Fatal {
        reason: String,
    },
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_files: Option<usize>,
    pub total_bytes: Option<u64>,
    pub bytes_so_far: u64,
    pub files_so_far: usize,
    pub running: bool,
    pub job_name: String,
    pub starting: bool,
    pub stopping: bool,
    pub know_total: bool,
    pub terminal_message: Option<String>,
    pub current_files: Vec<String>,
}
