use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::DepotError;
use crate::types::{Dat, ForcePacking, Game, Hashes, Rom, RomStatus};

/// Parses the logiqx-style `<datafile>` XML grammar into a `Dat`, folding
/// `<software><part><dataarea><rom/></dataarea></part></software>` and
/// `<machine><rom/></machine>`/`<game><rom/></game>` forms into one flat
/// `games` list, then runs `normalize()`.
pub fn parse_dat_file(path: &Path) -> anyhow::Result<Dat> {
    let file = File::open(path)
        .map_err(|e| DepotError::Parse {
            path: path.display().to_string(),
            line: 0,
            message: e.to_string(),
        })?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.config_mut().trim_text(true);
    parse_dat_reader(&mut reader, path)
}

pub fn parse_dat_str(xml: &str, path: &Path) -> anyhow::Result<Dat> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    parse_dat_reader(&mut reader, path)
}

fn parse_dat_reader<R: std::io::BufRead>(
    reader: &mut Reader<R>,
    path: &Path,
) -> anyhow::Result<Dat> {
    let mut buf = Vec::new();
    let mut header_name = String::new();
    let mut header_description = String::new();
    let mut force_packing = None;
    let mut games: Vec<Game> = Vec::new();

    let mut in_header = false;
    let mut current_game: Option<Game> = None;
    let mut current_rom: Option<Rom> = None;
    let mut text_target: Option<TextTarget> = None;

    enum TextTarget {
        HeaderName,
        HeaderDescription,
    }

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| DepotError::Parse {
            path: path.display().to_string(),
            line: reader.buffer_position() as usize,
            message: e.to_string(),
        })?;

        let is_empty_event = matches!(event, Event::Empty(_));
        match event {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let is_empty = is_empty_event;
                let name = e.name().as_ref().to_vec();
                let name = String::from_utf8_lossy(&name).to_string();

                match name.as_str() {
                    "header" => in_header = true,
                    "name" if in_header => text_target = Some(TextTarget::HeaderName),
                    "description" if in_header => text_target = Some(TextTarget::HeaderDescription),
                    "clrmamepro" | "forcepacking" | "forcezipping" => {
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            if key == "forcepacking" || key == "forcezipping" {
                                force_packing = parse_force_packing(&value);
                            }
                        }
                    }
                    "game" | "machine" | "software" => {
                        let mut game_name = String::new();
                        let mut description = String::new();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"name" {
                                game_name = String::from_utf8_lossy(&attr.value).to_string();
                            }
                        }
                        if game_name.is_empty() {
                            description = String::new();
                        }
                        current_game = Some(Game {
                            name: game_name,
                            description,
                            roms: Vec::new(),
                        });
                    }
                    "rom" => {
                        let mut rom_name = String::new();
                        let mut size = 0u64;
                        let mut hashes = Hashes::default();
                        let mut status = None;
                        for attr in e.attributes().flatten() {
                            let key = attr.key.as_ref();
                            let value = String::from_utf8_lossy(&attr.value).to_string();
                            match key {
                                b"name" => rom_name = value,
                                b"size" => size = value.parse().unwrap_or(0),
                                b"crc" => hashes.crc32 = parse_hex_array(&value),
                                b"md5" => hashes.md5 = parse_hex_array(&value),
                                b"sha1" => hashes.sha1 = parse_hex_array(&value),
                                b"status" => status = parse_status(&value),
                                _ => {}
                            }
                        }
                        let mut rom = Rom::new(rom_name, size, hashes);
                        rom.status = status;
                        if is_empty {
                            if let Some(game) = current_game.as_mut() {
                                game.roms.push(rom);
                            }
                        } else {
                            current_rom = Some(rom);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().to_string();
                match text_target.take() {
                    Some(TextTarget::HeaderName) => header_name = text,
                    Some(TextTarget::HeaderDescription) => header_description = text,
                    None => {}
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "header" => in_header = false,
                    "rom" => {
                        if let (Some(game), Some(rom)) = (current_game.as_mut(), current_rom.take()) {
                            game.roms.push(rom);
                        }
                    }
                    "game" | "machine" | "software" => {
                        if let Some(game) = current_game.take() {
                            games.push(game);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    let dat = Dat {
        name: if header_name.is_empty() {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string()
        } else {
            header_name
        },
        description: header_description,
        path: path.to_path_buf(),
        force_packing,
        unzip_games: false,
        games,
        generation: 0,
        fixdat: false,
    };

    Ok(dat.normalize())
}

fn parse_force_packing(value: &str) -> Option<ForcePacking> {
    match value.to_ascii_lowercase().as_str() {
        "unzip" | "no" | "false" => Some(ForcePacking::Unzip),
        "zip" | "yes" | "true" => Some(ForcePacking::Zip),
        _ => None,
    }
}

fn parse_status(value: &str) -> Option<RomStatus> {
    match value.to_ascii_lowercase().as_str() {
        "baddump" => Some(RomStatus::BadDump),
        "nodump" => Some(RomStatus::NoDump),
        "verified" => Some(RomStatus::Verified),
        _ => Some(RomStatus::Good),
    }
}

fn parse_hex_array<const N: usize>(value: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(value.trim()).ok()?;
    bytes.try_into().ok()
}

/// Emits a minimal, parseable logiqx `<datafile>` document for a `Dat`. Used
/// by the build/fixdat pipelines to write `fix_<name>.dat` and by diff/dir2dat.
pub fn write_dat_file(dat: &Dat, out: &Path) -> anyhow::Result<()> {
    use std::fmt::Write as _;
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\"?>\n<datafile>\n  <header>\n");
    let _ = write!(xml, "    <name>{}</name>\n", xml_escape(&dat.name));
    let _ = write!(
        xml,
        "    <description>{}</description>\n",
        xml_escape(&dat.description)
    );
    xml.push_str("  </header>\n");

    for game in &dat.games {
        let _ = write!(xml, "  <game name=\"{}\">\n", xml_escape(&game.name));
        for rom in &game.roms {
            xml.push_str("    <rom");
            let _ = write!(xml, " name=\"{}\"", xml_escape(&rom.name));
            let _ = write!(xml, " size=\"{}\"", rom.size);
            if let Some(crc) = rom.hashes.crc32_hex() {
                let _ = write!(xml, " crc=\"{crc}\"");
            }
            if let Some(md5) = rom.hashes.md5_hex() {
                let _ = write!(xml, " md5=\"{md5}\"");
            }
            if let Some(sha1) = rom.hashes.sha1_hex() {
                let _ = write!(xml, " sha1=\"{sha1}\"");
            }
            xml.push_str("/>\n");
        }
        xml.push_str("  </game>\n");
    }
    xml.push_str("</datafile>\n");

    std::fs::write(out, xml)?;
    Ok(())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn discover_dat_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if root.is_file() {
        out.push(root.to_path_buf());
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("dat") || e.eq_ignore_ascii_case("xml"))
            .unwrap_or(false)
        {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<datafile>
  <header>
    <name>Demo Set</name>
    <description>a demo set</description>
    <clrmamepro forcezipping="unzip"/>
  </header>
  <game name="zebra">
    <rom name="b.bin" size="4" crc="deadbeef" md5="00112233445566778899aabbccddeeff0011223" sha1="0011223344556677889900112233445566778899"/>
  </game>
  <game name="alpha">
    <rom name="a.bin" size="2" crc="cafebabe"/>
    <rom name="nodump.bin" size="2" status="nodump"/>
  </game>
</datafile>
"#;

    #[test]
    fn parses_header_and_games_and_normalizes_order() {
        let dat = parse_dat_str(SAMPLE, Path::new("demo.dat")).unwrap();
        assert_eq!(dat.name, "Demo Set");
        assert!(dat.unzip_games);
        assert_eq!(dat.games.len(), 2);
        assert_eq!(dat.games[0].name, "alpha");
        assert_eq!(dat.games[1].name, "zebra");
    }

    #[test]
    fn drops_nodump_roms_during_normalize() {
        let dat = parse_dat_str(SAMPLE, Path::new("demo.dat")).unwrap();
        let alpha = dat.games.iter().find(|g| g.name == "alpha").unwrap();
        assert_eq!(alpha.roms.len(), 1);
        assert_eq!(alpha.roms[0].name, "a.bin");
    }

    #[test]
    fn write_then_parse_round_trips_rom_identity() {
        let dat = parse_dat_str(SAMPLE, Path::new("demo.dat")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.dat");
        write_dat_file(&dat, &out).unwrap();

        let reparsed = parse_dat_file(&out).unwrap();
        assert_eq!(reparsed.rom_count(), dat.rom_count());
    }
}
