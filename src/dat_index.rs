use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::DepotError;
use crate::types::{Dat, Game, Hashes, Rom};

/// CRC+size is the weakest of the three keys the index supports; collisions
/// are possible in principle, so lookups by this key may return more than
/// one candidate rom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrcSizeKey {
    pub crc32: [u8; 4],
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Md5SizeKey {
    pub md5: [u8; 16],
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sha1Key {
    pub sha1: [u8; 20],
}

/// Identifies one rom entry within one indexed dat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomLocation {
    pub dat_name: String,
    pub game_name: String,
    pub rom_name: String,
}

/// Reserved dat name under which physically-scanned roms not declared by any
/// dat are indexed, so `resolve_hash` can still find them later.
pub const LOOSE_DAT_NAME: &str = "";

/// The capability set a build/purge/diff pipeline needs from whatever is
/// holding the indexed dat corpus, independent of the storage backend.
pub trait DatIndex {
    /// Indexes every rom of `dat`, replacing any prior entries for the same
    /// dat name, stamped with whatever generation the last `start_batch`
    /// call established (or the index's current generation if no batch was
    /// ever started).
    fn index_rom(&self, dat: &Dat) -> anyhow::Result<()>;

    /// Indexes a single physically-scanned rom that isn't declared by any
    /// dat, under the reserved `LOOSE_DAT_NAME` bucket. A no-op rom that's
    /// already resolvable is cheap to call redundantly; callers should still
    /// prefer to check `resolve_hash` first to avoid growing the table.
    fn index_loose_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<()>;

    /// All dats that declare a rom matching `hashes`/`size`.
    fn dats_for_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<Vec<String>>;

    /// True iff every rom of `dat_name` is present in the depot, per `contains`.
    fn complete_rom(&self, dat_name: &str, contains: &dyn Fn(&str) -> bool) -> anyhow::Result<bool>;

    /// Resolves a loose hash string (any of crc32/md5/sha1 hex) back to the
    /// full `Hashes` recorded for it, if known.
    fn resolve_hash(&self, hex: &str) -> anyhow::Result<Option<Hashes>>;

    /// Like `dats_for_rom`, restricted to dats passing `filter(name, generation)`.
    fn filtered_dats_for_rom(
        &self,
        hashes: &Hashes,
        size: u64,
        filter: &dyn Fn(&str, u64) -> bool,
    ) -> anyhow::Result<Vec<String>>;

    fn get_dat(&self, name: &str) -> anyhow::Result<Option<Dat>>;

    fn for_each_dat(&self, f: &mut dyn FnMut(&Dat) -> anyhow::Result<()>) -> anyhow::Result<()>;

    /// Cross-references every CRC+size key against every MD5+size key across
    /// the indexed corpus, returning rom locations sharing both. Used by
    /// `refresh-dats` sanity checks.
    fn join_crc_md5(&self) -> anyhow::Result<Vec<(RomLocation, RomLocation)>>;

    /// Begins a bulk-load batch: bumps `generation` once for the whole batch
    /// so every `index_rom` call that follows, until the next `start_batch`,
    /// is stamped with the same value. Backends that don't need transactional
    /// batching still must bump the generation here.
    fn start_batch(&self) -> anyhow::Result<()>;

    fn generation(&self) -> anyhow::Result<u64>;
}

/// Rusqlite-backed index, persisted on disk so a large DAT corpus doesn't
/// have to be reparsed and reindexed on every invocation.
pub struct SqliteDatIndex {
    conn: Mutex<Connection>,
}

impl SqliteDatIndex {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening dat index database {db_path:?}"))?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS dats (
                name TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                generation INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS roms (
                dat_name TEXT NOT NULL,
                game_name TEXT NOT NULL,
                rom_name TEXT NOT NULL,
                size INTEGER NOT NULL,
                crc32 TEXT,
                md5 TEXT,
                sha1 TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_roms_crc ON roms(crc32, size);
            CREATE INDEX IF NOT EXISTS idx_roms_md5 ON roms(md5, size);
            CREATE INDEX IF NOT EXISTS idx_roms_sha1 ON roms(sha1);
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            COMMIT;",
        )
        .map_err(|e| DepotError::Index(e.to_string()))?;
        Ok(())
    }

    fn bump_generation(conn: &Connection) -> anyhow::Result<u64> {
        let next: u64 = conn
            .query_row(
                "SELECT COALESCE(value, 0) + 1 FROM meta WHERE key = 'generation'",
                [],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64)
            .unwrap_or(1);
        conn.execute(
            "REPLACE INTO meta (key, value) VALUES ('generation', ?1)",
            params![next as i64],
        )?;
        Ok(next)
    }

    fn read_generation(conn: &Connection) -> anyhow::Result<u64> {
        let value: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = 'generation'", [], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }
}

impl DatIndex for SqliteDatIndex {
    fn index_rom(&self, dat: &Dat) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let generation = Self::read_generation(&conn)?;
        let tx = conn.transaction()?;
        let payload = serde_json::to_string(dat)?;
        tx.execute(
            "REPLACE INTO dats (name, payload, generation) VALUES (?1, ?2, ?3)",
            params![dat.name, payload, generation as i64],
        )?;
        tx.execute("DELETE FROM roms WHERE dat_name = ?1", params![dat.name])?;
        for game in &dat.games {
            for rom in &game.roms {
                tx.execute(
                    "INSERT INTO roms (dat_name, game_name, rom_name, size, crc32, md5, sha1) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        dat.name,
                        game.name,
                        rom.name,
                        rom.size as i64,
                        rom.hashes.crc32_hex(),
                        rom.hashes.md5_hex(),
                        rom.hashes.sha1_hex(),
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn index_loose_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO roms (dat_name, game_name, rom_name, size, crc32, md5, sha1) VALUES (?1, '', '', ?2, ?3, ?4, ?5)",
            params![
                LOOSE_DAT_NAME,
                size as i64,
                hashes.crc32_hex(),
                hashes.md5_hex(),
                hashes.sha1_hex(),
            ],
        )?;
        Ok(())
    }

    fn dats_for_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<Vec<String>> {
        self.filtered_dats_for_rom(hashes, size, &|_, _| true)
    }

    fn complete_rom(&self, dat_name: &str, contains: &dyn Fn(&str) -> bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT sha1, md5, crc32 FROM roms WHERE dat_name = ?1")?;
        let mut rows = stmt.query(params![dat_name])?;
        while let Some(row) = rows.next()? {
            let sha1: Option<String> = row.get(0)?;
            let md5: Option<String> = row.get(1)?;
            let crc32: Option<String> = row.get(2)?;
            let key = sha1.or(md5).or(crc32);
            let present = match key {
                Some(hex) => contains(&hex),
                None => false,
            };
            if !present {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resolve_hash(&self, hex: &str) -> anyhow::Result<Option<Hashes>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT crc32, md5, sha1 FROM roms WHERE crc32 = ?1 OR md5 = ?1 OR sha1 = ?1 LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![hex], |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })
            .optional()?;
        Ok(row.map(|(crc32, md5, sha1)| Hashes {
            crc32: crc32.and_then(|s| parse_hex_array(&s)),
            md5: md5.and_then(|s| parse_hex_array(&s)),
            sha1: sha1.and_then(|s| parse_hex_array(&s)),
        }))
    }

    fn filtered_dats_for_rom(
        &self,
        hashes: &Hashes,
        size: u64,
        filter: &dyn Fn(&str, u64) -> bool,
    ) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut candidates: Vec<(String, u64)> = Vec::new();

        if let Some(sha1) = hashes.sha1_hex() {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT roms.dat_name, dats.generation FROM roms
                 JOIN dats ON dats.name = roms.dat_name
                 WHERE roms.sha1 = ?1",
            )?;
            let mut rows = stmt.query(params![sha1])?;
            while let Some(row) = rows.next()? {
                candidates.push((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64));
            }
        } else if let Some(md5) = hashes.md5_hex() {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT roms.dat_name, dats.generation FROM roms
                 JOIN dats ON dats.name = roms.dat_name
                 WHERE roms.md5 = ?1 AND roms.size = ?2",
            )?;
            let mut rows = stmt.query(params![md5, size as i64])?;
            while let Some(row) = rows.next()? {
                candidates.push((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64));
            }
        } else if let Some(crc32) = hashes.crc32_hex() {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT roms.dat_name, dats.generation FROM roms
                 JOIN dats ON dats.name = roms.dat_name
                 WHERE roms.crc32 = ?1 AND roms.size = ?2",
            )?;
            let mut rows = stmt.query(params![crc32, size as i64])?;
            while let Some(row) = rows.next()? {
                candidates.push((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64));
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|(name, generation)| filter(name, *generation))
            .map(|(name, _)| name)
            .collect())
    }

    fn get_dat(&self, name: &str) -> anyhow::Result<Option<Dat>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM dats WHERE name = ?1", params![name], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(match payload {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    fn for_each_dat(&self, f: &mut dyn FnMut(&Dat) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM dats ORDER BY name")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            let dat: Dat = serde_json::from_str(&json)?;
            f(&dat)?;
        }
        Ok(())
    }

    fn join_crc_md5(&self) -> anyhow::Result<Vec<(RomLocation, RomLocation)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.dat_name, a.game_name, a.rom_name, b.dat_name, b.game_name, b.rom_name
             FROM roms a JOIN roms b
               ON a.crc32 IS NOT NULL AND a.crc32 = b.crc32 AND a.size = b.size
               AND a.md5 IS NOT NULL AND a.md5 = b.md5
               AND (a.dat_name != b.dat_name OR a.rom_name != b.rom_name)",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((
                RomLocation {
                    dat_name: row.get(0)?,
                    game_name: row.get(1)?,
                    rom_name: row.get(2)?,
                },
                RomLocation {
                    dat_name: row.get(3)?,
                    game_name: row.get(4)?,
                    rom_name: row.get(5)?,
                },
            ));
        }
        Ok(out)
    }

    fn start_batch(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::bump_generation(&conn)?;
        Ok(())
    }

    fn generation(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        Self::read_generation(&conn)
    }
}

fn parse_hex_array<const N: usize>(value: &str) -> Option<[u8; N]> {
    hex::decode(value).ok()?.try_into().ok()
}

/// Flat in-memory index used by `dir2dat`/`diffdat` one-shot runs where
/// paying for sqlite setup isn't worth it.
#[derive(Default)]
pub struct InMemoryDatIndex {
    dats: Mutex<HashMap<String, Dat>>,
    generation: Mutex<u64>,
}

impl InMemoryDatIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatIndex for InMemoryDatIndex {
    fn index_rom(&self, dat: &Dat) -> anyhow::Result<()> {
        let generation = *self.generation.lock().unwrap();
        let mut stamped = dat.clone();
        stamped.generation = generation;
        self.dats.lock().unwrap().insert(dat.name.clone(), stamped);
        Ok(())
    }

    fn index_loose_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<()> {
        let mut dats = self.dats.lock().unwrap();
        let entry = dats.entry(LOOSE_DAT_NAME.to_string()).or_insert_with(|| Dat {
            name: LOOSE_DAT_NAME.to_string(),
            description: String::new(),
            path: PathBuf::new(),
            force_packing: None,
            unzip_games: false,
            games: vec![Game {
                name: String::new(),
                description: String::new(),
                roms: Vec::new(),
            }],
            generation: 0,
            fixdat: false,
        });
        entry.games[0].roms.push(Rom::new(String::new(), size, hashes.clone()));
        Ok(())
    }

    fn dats_for_rom(&self, hashes: &Hashes, size: u64) -> anyhow::Result<Vec<String>> {
        self.filtered_dats_for_rom(hashes, size, &|_, _| true)
    }

    fn complete_rom(&self, dat_name: &str, contains: &dyn Fn(&str) -> bool) -> anyhow::Result<bool> {
        let dats = self.dats.lock().unwrap();
        let Some(dat) = dats.get(dat_name) else {
            return Ok(false);
        };
        for game in &dat.games {
            for rom in &game.roms {
                let key = rom.hashes.sha1_hex().or(rom.hashes.md5_hex()).or(rom.hashes.crc32_hex());
                match key {
                    Some(hex) if contains(&hex) => {}
                    _ => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    fn resolve_hash(&self, hex: &str) -> anyhow::Result<Option<Hashes>> {
        let dats = self.dats.lock().unwrap();
        for dat in dats.values() {
            for game in &dat.games {
                for rom in &game.roms {
                    if rom.hashes.sha1_hex().as_deref() == Some(hex)
                        || rom.hashes.md5_hex().as_deref() == Some(hex)
                        || rom.hashes.crc32_hex().as_deref() == Some(hex)
                    {
                        return Ok(Some(rom.hashes.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    fn filtered_dats_for_rom(
        &self,
        hashes: &Hashes,
        size: u64,
        filter: &dyn Fn(&str, u64) -> bool,
    ) -> anyhow::Result<Vec<String>> {
        let dats = self.dats.lock().unwrap();
        let mut names = Vec::new();
        for dat in dats.values() {
            if dat.name == LOOSE_DAT_NAME || !filter(&dat.name, dat.generation) {
                continue;
            }
            let has_match = dat.games.iter().any(|g| {
                g.roms
                    .iter()
                    .any(|r| r.hashes.matches(hashes, r.size, size))
            });
            if has_match {
                names.push(dat.name.clone());
            }
        }
        Ok(names)
    }

    fn get_dat(&self, name: &str) -> anyhow::Result<Option<Dat>> {
        Ok(self.dats.lock().unwrap().get(name).cloned())
    }

    fn for_each_dat(&self, f: &mut dyn FnMut(&Dat) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let dats = self.dats.lock().unwrap();
        let mut names: Vec<&String> = dats.keys().filter(|n| n.as_str() != LOOSE_DAT_NAME).collect();
        names.sort();
        for name in names {
            f(&dats[name])?;
        }
        Ok(())
    }

    fn join_crc_md5(&self) -> anyhow::Result<Vec<(RomLocation, RomLocation)>> {
        let dats = self.dats.lock().unwrap();
        let mut by_key: HashMap<(String, u64), Vec<RomLocation>> = HashMap::new();
        for dat in dats.values() {
            for game in &dat.games {
                for rom in &game.roms {
                    if let (Some(crc32), Some(_md5)) = (rom.hashes.crc32_hex(), rom.hashes.md5_hex()) {
                        by_key.entry((crc32, rom.size)).or_default().push(RomLocation {
                            dat_name: dat.name.clone(),
                            game_name: game.name.clone(),
                            rom_name: rom.name.clone(),
                        });
                    }
                }
            }
        }
        let mut out = Vec::new();
        for locations in by_key.values() {
            for i in 0..locations.len() {
                for j in (i + 1)..locations.len() {
                    out.push((locations[i].clone(), locations[j].clone()));
                }
            }
        }
        Ok(out)
    }

    fn start_batch(&self) -> anyhow::Result<()> {
        *self.generation.lock().unwrap() += 1;
        Ok(())
    }

    fn generation(&self) -> anyhow::Result<u64> {
        Ok(*self.generation.lock().unwrap())
    }
}

pub fn open_dat_index(db_path: Option<&PathBuf>) -> anyhow::Result<SqliteDatIndex> {
    match db_path {
        Some(path) => SqliteDatIndex::open(path),
        None => SqliteDatIndex::open_in_memory(),
    }
}
