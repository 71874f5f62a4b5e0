use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::dat_parse::{discover_dat_files, parse_dat_file, write_dat_file};
use crate::types::{Dat, Game};

/// Disk-backed (in this process, memory-backed, flushed once) deduper keyed
/// on whichever strong hash a rom carries, used by both diff operations to
/// decide whether `new_dat` already declared a rom in `old_dat`.
#[derive(Default)]
struct RomKeySet {
    seen: Mutex<HashSet<String>>,
}

impl RomKeySet {
    fn new() -> Self {
        Self::default()
    }

    fn declare(&self, dat: &Dat) {
        let mut seen = self.seen.lock().unwrap();
        for game in &dat.games {
            for rom in &game.roms {
                if let Some(key) = rom_key(rom) {
                    seen.insert(key);
                }
            }
        }
    }

    fn contains(&self, rom: &crate::types::Rom) -> bool {
        match rom_key(rom) {
            Some(key) => self.seen.lock().unwrap().contains(&key),
            None => false,
        }
    }
}

fn rom_key(rom: &crate::types::Rom) -> Option<String> {
    rom.hashes
        .sha1_hex()
        .or_else(|| rom.hashes.md5_hex().map(|m| format!("md5:{m}:{}", rom.size)))
        .or_else(|| rom.hashes.crc32_hex().map(|c| format!("crc:{c}:{}", rom.size)))
}

/// `diffdat`: declares every rom of `old_dat`, then emits the roms of
/// `new_dat` not already declared as a fresh dat named `name`.
pub fn diffdat(old_dat: &Dat, new_dat: &Dat, name: &str, description: &str) -> Dat {
    let seen = RomKeySet::new();
    seen.declare(old_dat);

    let games = new_dat
        .games
        .iter()
        .filter_map(|game| {
            let roms: Vec<_> = game
                .roms
                .iter()
                .filter(|r| r.is_valid() && !seen.contains(r))
                .cloned()
                .collect();
            if roms.is_empty() {
                None
            } else {
                Some(Game {
                    name: game.name.clone(),
                    description: game.description.clone(),
                    roms,
                })
            }
        })
        .collect();

    Dat {
        name: name.to_string(),
        description: description.to_string(),
        path: new_dat.path.clone(),
        force_packing: new_dat.force_packing,
        unzip_games: new_dat.unzip_games,
        games,
        generation: new_dat.generation,
        fixdat: false,
    }
    .normalize()
}

/// `ediffdat`: walks `old_tree` feeding every dat into one shared deduper,
/// then walks `new_tree` diffing each dat individually against it and
/// writing per-dat diff files under `out_dir` mirroring the source layout.
pub fn ediffdat(old_tree: &Path, new_tree: &Path, out_dir: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let seen = RomKeySet::new();
    for path in discover_dat_files(old_tree)? {
        let dat = parse_dat_file(&path)?;
        seen.declare(&dat);
    }

    let mut written = Vec::new();
    for path in discover_dat_files(new_tree)? {
        let dat = parse_dat_file(&path)?;
        let rel = path.strip_prefix(new_tree).unwrap_or(&path);
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let games: Vec<Game> = dat
            .games
            .iter()
            .filter_map(|game| {
                let roms: Vec<_> = game
                    .roms
                    .iter()
                    .filter(|r| r.is_valid() && !seen.contains(r))
                    .cloned()
                    .collect();
                if roms.is_empty() {
                    None
                } else {
                    Some(Game {
                        name: game.name.clone(),
                        description: game.description.clone(),
                        roms,
                    })
                }
            })
            .collect();

        if games.is_empty() {
            continue;
        }

        let diff_dat = Dat {
            name: dat.name.clone(),
            description: dat.description.clone(),
            path: out_path.clone(),
            force_packing: dat.force_packing,
            unzip_games: dat.unzip_games,
            games,
            generation: dat.generation,
            fixdat: false,
        }
        .normalize();

        write_dat_file(&diff_dat, &out_path)?;
        written.push(out_path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForcePacking, Hashes, Rom};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn dat_with_rom(name: &str, rom_name: &str, sha1: [u8; 20]) -> Dat {
        let mut hashes = Hashes::default();
        hashes.sha1 = Some(sha1);
        Dat {
            name: name.into(),
            description: String::new(),
            path: PathBuf::from(format!("{name}.dat")),
            force_packing: Some(ForcePacking::Zip),
            unzip_games: false,
            games: vec![crate::types::Game {
                name: "g1".into(),
                description: String::new(),
                roms: vec![Rom::new(rom_name, 4, hashes)],
            }],
            generation: 0,
            fixdat: false,
        }
    }

    #[test]
    fn diffdat_keeps_only_roms_absent_from_old() {
        let old_dat = dat_with_rom("old", "a.bin", [1u8; 20]);
        let new_dat_same = dat_with_rom("new", "a.bin", [1u8; 20]);
        let mut new_dat = dat_with_rom("new", "b.bin", [2u8; 20]);
        new_dat.games[0].roms.push(new_dat_same.games[0].roms[0].clone());

        let diff = diffdat(&old_dat, &new_dat, "diff", "diff set");
        assert_eq!(diff.rom_count(), 1);
        assert_eq!(diff.games[0].roms[0].name, "b.bin");
    }

    #[test]
    fn diffdat_drops_roms_with_no_hashes() {
        let old_dat = dat_with_rom("old", "a.bin", [1u8; 20]);
        let mut new_dat = dat_with_rom("new", "b.bin", [2u8; 20]);
        new_dat.games[0].roms.push(Rom::new("nohash.bin", 10, Hashes::default()));

        let diff = diffdat(&old_dat, &new_dat, "diff", "diff set");
        assert_eq!(diff.rom_count(), 1);
    }

    #[test]
    fn ediffdat_mirrors_source_layout_for_changed_dats() {
        let workdir = tempdir().unwrap();
        let old_tree = workdir.path().join("old");
        let new_tree = workdir.path().join("new");
        std::fs::create_dir_all(old_tree.join("sub")).unwrap();
        std::fs::create_dir_all(new_tree.join("sub")).unwrap();

        let old_dat = dat_with_rom("demo", "a.bin", [1u8; 20]);
        write_dat_file(&old_dat, &old_tree.join("sub/demo.dat")).unwrap();

        let mut new_dat = dat_with_rom("demo", "a.bin", [1u8; 20]);
        new_dat.games[0].roms.push(Rom::new("new.bin", 4, {
            let mut h = Hashes::default();
            h.sha1 = Some([9u8; 20]);
            h
        }));
        write_dat_file(&new_dat, &new_tree.join("sub/demo.dat")).unwrap();

        let out_dir = workdir.path().join("out");
        let written = ediffdat(&old_tree, &new_tree, &out_dir).unwrap();
        assert_eq!(written.len(), 1);
        assert!(out_dir.join("sub/demo.dat").exists());

        let diff = parse_dat_file(&out_dir.join("sub/demo.dat")).unwrap();
        assert_eq!(diff.rom_count(), 1);
        assert_eq!(diff.games[0].roms[0].name, "new.bin");
    }
}
