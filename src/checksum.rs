use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use crc32fast::Hasher as Crc32;
use md5::{Digest as Md5Digest, Md5};
use sha1_smol::Sha1;

use crate::types::Hashes;

const STREAM_CHUNK_SIZE: usize = 256 * 1024;

/// Fans a single read out through CRC32, MD5 and SHA-1 in parallel, returning
/// the three digests plus the number of bytes consumed.
pub fn hash_stream<R: Read>(mut reader: R) -> anyhow::Result<(Hashes, u64)> {
    let mut crc32 = Crc32::new();
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let slice = &buf[..n];
        crc32.update(slice);
        md5.update(slice);
        sha1.update(slice);
        total = total.saturating_add(n as u64);
    }

    let crc_bytes = crc32.finalize().to_be_bytes();
    let md5_bytes: [u8; 16] = md5.finalize().into();
    let sha1_bytes: [u8; 20] = sha1.digest().bytes();

    Ok((
        Hashes {
            crc32: Some(crc_bytes),
            md5: Some(md5_bytes),
            sha1: Some(sha1_bytes),
        },
        total,
    ))
}

pub fn hash_file(path: &Path) -> anyhow::Result<(Hashes, u64)> {
    let file = File::open(path).with_context(|| format!("opening file for hashing: {path:?}"))?;
    hash_stream(file)
}
