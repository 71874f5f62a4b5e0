use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use crc32fast::Hasher as Crc32;
use zip::write::FileOptions;

use crate::types::ZipCompression;

// CP437 table: index -> Unicode char, used to encode filenames to CP437 by
// reverse-mapping characters to their byte value.
const CP437_TABLE: [char; 256] = [
    '\u{0000}', '\u{0001}', '\u{0002}', '\u{0003}', '\u{0004}', '\u{0005}', '\u{0006}', '\u{0007}',
    '\u{0008}', '\u{0009}', '\u{000A}', '\u{000B}', '\u{000C}', '\u{000D}', '\u{000E}', '\u{000F}',
    '\u{0010}', '\u{0011}', '\u{0012}', '\u{0013}', '\u{0014}', '\u{0015}', '\u{0016}', '\u{0017}',
    '\u{0018}', '\u{0019}', '\u{001A}', '\u{001B}', '\u{001C}', '\u{001D}', '\u{001E}', '\u{001F}',
    ' ', '!', '"', '#', '$', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', '0', '1', '2',
    '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', '@', 'A', 'B', 'C', 'D', 'E',
    'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X',
    'Y', 'Z', '[', '\\', ']', '^', '_', '`', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k',
    'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '{', '|', '}', '~',
    '\u{007F}', '\u{00C7}', '\u{00FC}', '\u{00E9}', '\u{00E2}', '\u{00E4}', '\u{00E0}', '\u{00E5}',
    '\u{00E7}', '\u{00EA}', '\u{00EB}', '\u{00E8}', '\u{00EF}', '\u{00EE}', '\u{00EC}', '\u{00C4}',
    '\u{00C5}', '\u{00C9}', '\u{00E6}', '\u{00C6}', '\u{00F4}', '\u{00F6}', '\u{00F2}', '\u{00FB}',
    '\u{00F9}', '\u{00FF}', '\u{00D6}', '\u{00DC}', '\u{00A2}', '\u{00A3}', '\u{00A5}', '\u{20A7}',
    '\u{0192}', '\u{00E1}', '\u{00ED}', '\u{00F3}', '\u{00FA}', '\u{00F1}', '\u{00D1}', '\u{00AA}',
    '\u{00BA}', '\u{00BF}', '\u{2310}', '\u{00AC}', '\u{00BD}', '\u{00BC}', '\u{00A1}', '\u{00AB}',
    '\u{00BB}', '\u{2591}', '\u{2592}', '\u{2593}', '\u{2502}', '\u{2524}', '\u{2561}', '\u{2562}',
    '\u{2556}', '\u{2555}', '\u{2563}', '\u{2551}', '\u{2557}', '\u{255D}', '\u{255C}', '\u{255B}',
    '\u{2510}', '\u{2514}', '\u{2534}', '\u{252C}', '\u{251C}', '\u{2500}', '\u{253C}', '\u{255E}',
    '\u{255F}', '\u{255A}', '\u{2554}', '\u{2569}', '\u{2566}', '\u{2560}', '\u{2550}', '\u{256C}',
    '\u{2567}', '\u{2568}', '\u{2564}', '\u{2565}', '\u{2559}', '\u{2558}', '\u{2552}', '\u{2553}',
    '\u{256B}', '\u{256A}', '\u{2518}', '\u{250C}', '\u{2588}', '\u{2584}', '\u{258C}', '\u{2590}',
    '\u{2580}', '\u{03B1}', '\u{00DF}', '\u{0393}', '\u{03C0}', '\u{03A3}', '\u{03C3}', '\u{00B5}',
    '\u{03C4}', '\u{03A6}', '\u{0398}', '\u{03A9}', '\u{03B4}', '\u{221E}', '\u{03C6}', '\u{03B5}',
    '\u{2229}', '\u{2261}', '\u{00B1}', '\u{2265}', '\u{2264}', '\u{2320}', '\u{2321}', '\u{00F7}',
    '\u{2248}', '\u{00B0}', '\u{2219}', '\u{00B7}', '\u{221A}', '\u{207F}', '\u{00B2}', '\u{25A0}',
    '\u{00A0}',
];

fn encode_cp437(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    for ch in s.chars() {
        if ch as u32 <= 0x7F {
            out.push(ch as u8);
            continue;
        }
        let mut found = false;
        for (i, &c) in CP437_TABLE.iter().enumerate() {
            if c == ch {
                out.push(i as u8);
                found = true;
                break;
            }
        }
        if !found {
            return None;
        }
    }
    Some(out)
}

/// Narrow capability the build pipeline depends on: start a new entry,
/// stream bytes into it, and finalize the archive once every entry is
/// written. Entries are buffered and flushed in name-sorted order at
/// `finish()` to make the produced archive byte-for-byte deterministic.
pub trait TorrentZipWriter {
    fn start_file(&mut self, name: &str) -> anyhow::Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn finish(self: Box<Self>) -> anyhow::Result<()>;
}

/// The depot's torrent-canonical zip encoder: CP437 names, entries in
/// name-sorted order, and a `TORRENTZIPPED-<crc>` EOCD comment matching the
/// format other romba-family tools use to detect a canonicalized archive.
pub struct CanonicalZipWriter {
    dest: std::path::PathBuf,
    compression: ZipCompression,
    entries: Vec<(String, Vec<u8>)>,
    current: Option<(String, Vec<u8>)>,
}

impl CanonicalZipWriter {
    pub fn create(dest: &Path, compression: ZipCompression) -> Self {
        Self {
            dest: dest.to_path_buf(),
            compression,
            entries: Vec::new(),
            current: None,
        }
    }
}

impl TorrentZipWriter for CanonicalZipWriter {
    fn start_file(&mut self, name: &str) -> anyhow::Result<()> {
        if let Some(entry) = self.current.take() {
            self.entries.push(entry);
        }
        self.current = Some((name.to_string(), Vec::new()));
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let (_, data) = self
            .current
            .as_mut()
            .context("write_all called before start_file")?;
        data.extend_from_slice(buf);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> anyhow::Result<()> {
        if let Some(entry) = self.current.take() {
            self.entries.push(entry);
        }
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        write_canonical_zip(&self.dest, &self.entries, self.compression)
    }
}

fn write_canonical_zip(
    dest: &Path,
    entries: &[(String, Vec<u8>)],
    compression: ZipCompression,
) -> anyhow::Result<()> {
    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)
        .with_context(|| format!("creating {dest:?}"))?;

    {
        let mut zip = zip::ZipWriter::new(&mut out);
        let method = match compression {
            ZipCompression::Stored => zip::CompressionMethod::Stored,
            ZipCompression::Deflated => zip::CompressionMethod::Deflated,
        };
        let options = FileOptions::default().compression_method(method);

        for (name, data) in entries {
            let zip_name = encode_cp437(name)
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| name.clone());
            zip.start_file::<_, ()>(zip_name, options)?;
            zip.write_all(data)?;
        }
        zip.finish()?;
    }

    patch_torrentzip_comment(&mut out)
}

/// Recomputes the EOCD comment as `TORRENTZIPPED-<crc32 of central directory>`,
/// the marker romba-family tools use to recognize a canonicalized archive.
fn patch_torrentzip_comment(out: &mut File) -> anyhow::Result<()> {
    out.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    out.read_to_end(&mut data)?;

    let eocd_sig = b"PK\x05\x06";
    let pos = data
        .windows(4)
        .rposition(|w| w == eocd_sig)
        .context("EOCD not found")?;

    if data.len() < pos + 22 {
        anyhow::bail!("EOCD truncated");
    }
    let cd_size =
        u32::from_le_bytes([data[pos + 12], data[pos + 13], data[pos + 14], data[pos + 15]]) as usize;
    let cd_offset =
        u32::from_le_bytes([data[pos + 16], data[pos + 17], data[pos + 18], data[pos + 19]]) as usize;

    let central_dir = &data[cd_offset..cd_offset + cd_size];
    let mut hasher = Crc32::new();
    hasher.update(central_dir);
    let comment = format!("TORRENTZIPPED-{:08X}", hasher.finalize());

    let comment_len = comment.len() as u16;
    let mut patched = data;
    patched[pos + 20] = (comment_len & 0xff) as u8;
    patched[pos + 21] = ((comment_len >> 8) & 0xff) as u8;
    let comment_start = pos + 22;
    patched.truncate(comment_start);
    patched.extend_from_slice(comment.as_bytes());

    out.seek(SeekFrom::Start(0))?;
    out.set_len(patched.len() as u64)?;
    out.write_all(&patched)?;
    out.flush()?;
    Ok(())
}
