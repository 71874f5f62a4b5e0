use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use zip::read::ZipArchive;

use crate::checksum::hash_stream;
use crate::types::{ContainerInclude, Hashes};

/// One hashed entry found inside (or standing in for) a container file,
/// carrying its raw bytes so a caller can both dedup-check and, on a miss,
/// write it straight into the depot without re-opening the source.
pub struct ContainerEntry {
    pub name: String,
    pub size: u64,
    pub hashes: Hashes,
    pub bytes: Vec<u8>,
}

/// Enumerates and hashes the entries of `path` according to `include`.
/// `Both`/`EntriesOnly` descend into zip/7z contents; `ContainerOnly` hashes
/// the container file itself as a single opaque blob. Uncontainered files
/// (anything not zip/7z) are always hashed as one opaque blob regardless of
/// `include`, since there is nothing to descend into.
pub fn scan_container(path: &Path, include: ContainerInclude) -> anyhow::Result<Vec<ContainerEntry>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let mut out = Vec::new();

    if include.includes_container() {
        out.push(hash_whole_file(path)?);
    }

    if include.includes_entries() {
        match ext.as_deref() {
            Some("zip") => out.extend(scan_zip_entries(path)?),
            Some("7z") => out.extend(scan_7z_entries(path)?),
            Some("gz") => out.push(scan_gzip_entry(path)?),
            _ => {
                if !include.includes_container() {
                    out.push(hash_whole_file(path)?);
                }
            }
        }
    }

    Ok(out)
}

fn hash_whole_file(path: &Path) -> anyhow::Result<ContainerEntry> {
    let bytes = fs::read(path).with_context(|| format!("reading file {path:?}"))?;
    let (hashes, size) = hash_stream(bytes.as_slice())?;
    Ok(ContainerEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size,
        hashes,
        bytes,
    })
}

/// Decompresses a single-member gzip file and hashes its inner content. Used
/// when re-ingesting gzip objects from a foreign source rather than this
/// depot's own sidecar-carrying objects.
fn scan_gzip_entry(path: &Path) -> anyhow::Result<ContainerEntry> {
    let file = File::open(path).with_context(|| format!("opening gzip file {path:?}"))?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    let (hashes, size) = hash_stream(bytes.as_slice())?;
    Ok(ContainerEntry {
        name: path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size,
        hashes,
        bytes,
    })
}

fn scan_zip_entries(path: &Path) -> anyhow::Result<Vec<ContainerEntry>> {
    let f = File::open(path).with_context(|| format!("opening archive: {path:?}"))?;
    let mut zip = ZipArchive::new(f)?;
    let mut out = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_file() {
            let name = entry.name().to_string();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            let (hashes, size) = hash_stream(bytes.as_slice())?;
            out.push(ContainerEntry {
                name,
                size,
                hashes,
                bytes,
            });
        }
    }

    Ok(out)
}

/// Lists and extracts a 7z archive via the system `7z`/`7za` binary. Returns
/// an empty list (not an error) when neither binary is on `PATH`, matching
/// the "optional external collaborator" treatment of 7z in the depot.
fn scan_7z_entries(path: &Path) -> anyhow::Result<Vec<ContainerEntry>> {
    let exe = match which::which("7z").or_else(|_| which::which("7za")) {
        Ok(exe) => exe,
        Err(_) => return Ok(Vec::new()),
    };

    let output = Command::new(&exe)
        .arg("l")
        .arg(path.as_os_str())
        .output()
        .with_context(|| format!("running 7z to list archive: {path:?}"))?;

    if !output.status.success() {
        return extract_7z_to_temp_and_scan(&exe, path, None);
    }

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    let mut entry_names: HashSet<String> = HashSet::new();
    if let Some(header_line) = text.lines().find(|l| l.contains("Name")) {
        if let Some(name_idx) = header_line.find("Name") {
            let mut in_table = false;
            for line in text.lines() {
                if !in_table {
                    if line.trim_start().starts_with("----") {
                        in_table = true;
                    }
                    continue;
                }
                if line.trim_start().starts_with("----") {
                    break;
                }
                if line.contains("Name") && line.contains("Size") {
                    continue;
                }
                if line.len() > name_idx {
                    let name = line[name_idx..].trim().to_string();
                    if !name.is_empty() {
                        entry_names.insert(name);
                    }
                }
            }
        }
    }

    if entry_names.is_empty() {
        return extract_7z_to_temp_and_scan(&exe, path, None);
    }

    let mut names: Vec<String> = entry_names.into_iter().collect();
    names.sort();
    extract_7z_to_temp_and_scan(&exe, path, Some(&names))
}

fn extract_7z_to_temp_and_scan(
    exe: &PathBuf,
    path: &Path,
    selection: Option<&[String]>,
) -> anyhow::Result<Vec<ContainerEntry>> {
    let tmp = tempfile::tempdir()?;
    let tmp_path = tmp.path();

    let mut cmd = Command::new(exe);
    cmd.arg("x")
        .arg(path.as_os_str())
        .arg(format!("-o{}", tmp_path.to_string_lossy()))
        .arg("-y");
    if let Some(files) = selection {
        if !files.is_empty() {
            cmd.args(files);
        }
    }

    let status = cmd
        .status()
        .with_context(|| format!("extracting 7z archive to tempdir: {path:?}"))?;
    if !status.success() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(tmp_path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let p = entry.into_path();
        let rel = p.strip_prefix(tmp_path).unwrap_or(&p).to_path_buf();
        let bytes = fs::read(&p).with_context(|| format!("reading extracted entry {p:?}"))?;
        let (hashes, size) = hash_stream(bytes.as_slice())?;
        out.push(ContainerEntry {
            name: rel.to_string_lossy().to_string(),
            size,
            hashes,
            bytes,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use zip::write::FileOptions;

    #[test]
    fn scan_zip_entries_hashes_each_file() {
        let f = NamedTempFile::new().unwrap();
        {
            let mut zipw = zip::ZipWriter::new(f.reopen().unwrap());
            zipw.start_file::<_, ()>("a.bin", FileOptions::default())
                .unwrap();
            zipw.write_all(b"hello").unwrap();
            zipw.finish().unwrap();
        }

        let entries = scan_container(f.path(), ContainerInclude::EntriesOnly).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.bin");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].bytes, b"hello");
    }

    #[test]
    fn container_only_hashes_the_archive_as_one_blob() {
        let f = NamedTempFile::new().unwrap();
        {
            let mut zipw = zip::ZipWriter::new(f.reopen().unwrap());
            zipw.start_file::<_, ()>("a.bin", FileOptions::default())
                .unwrap();
            zipw.write_all(b"hello").unwrap();
            zipw.finish().unwrap();
        }

        let entries = scan_container(f.path(), ContainerInclude::ContainerOnly).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].size > 0);
    }

    #[test]
    fn both_mode_yields_container_plus_entries() {
        let f = NamedTempFile::new().unwrap();
        {
            let mut zipw = zip::ZipWriter::new(f.reopen().unwrap());
            zipw.start_file::<_, ()>("a.bin", FileOptions::default())
                .unwrap();
            zipw.write_all(b"hello").unwrap();
            zipw.finish().unwrap();
        }

        let entries = scan_container(f.path(), ContainerInclude::Both).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn plain_file_is_hashed_as_one_opaque_blob() {
        let f = NamedTempFile::new().unwrap();
        std::fs::write(f.path(), b"not an archive").unwrap();

        let entries = scan_container(f.path(), ContainerInclude::EntriesOnly).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 14);
        assert_eq!(entries[0].bytes, b"not an archive");
    }
}
