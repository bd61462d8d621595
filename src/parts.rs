/* Splitting an encrypted payload into fixed-size, digest-tracked parts
 * and reassembling them in index order.
 */

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use log::debug;
use openssl::sha::Sha1;

use crate::{error::BundleError, IO_CHUNK};

/// One slice of the encrypted payload, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// Bare file name (`<prefix>.part.NN`), sibling to the manifest.
    pub filename: String,
    /// Hex SHA-1 over exactly this part's bytes.
    pub digest: String,
    /// Size of this part in bytes.
    pub size: u64,
}

/// Format the name of part `index` for a bundle named `prefix`.
pub fn part_filename(prefix: &str, index: usize) -> String {
    format!("{prefix}.part.{index:02}")
}

/// Split `source` into parts of at most `part_size` bytes under `dir`,
/// returning one [`PartInfo`] per part in index order.
///
/// Reads happen in [`IO_CHUNK`] chunks so that memory use stays bounded
/// no matter how large the stream is.  Concatenating the resulting files
/// in index order reproduces the source stream byte-for-byte.  An empty
/// source still produces a single (empty) part so that the manifest
/// always references at least one file.
///
/// Part files are left on disk for the caller to manage.
pub fn split_into_parts(
    source: &mut impl Read,
    dir: &Path,
    prefix: &str,
    part_size: u64,
) -> Result<Vec<PartInfo>, BundleError> {
    assert!(part_size > 0);

    let mut parts = vec![];
    let mut buf = vec![0u8; IO_CHUNK];
    let mut carry: Option<(usize, usize)> = None; // (offset, len) into buf

    loop {
        let filename = part_filename(prefix, parts.len());
        let mut file = File::create(dir.join(&filename))?;
        let mut sha = Sha1::new();
        let mut written = 0u64;
        let mut eof = false;

        debug!("writing part {filename}");

        while written < part_size {
            let (off, len) = match carry.take() {
                Some(range) => range,
                None => match source.read(&mut buf)? {
                    0 => {
                        eof = true;
                        break;
                    }
                    n => (0, n),
                },
            };

            // don't let one read chunk spill past the part boundary
            let room = (part_size - written) as usize;
            let take = len.min(room);
            file.write_all(&buf[off..off + take])?;
            sha.update(&buf[off..off + take]);
            written += take as u64;
            if take < len {
                carry = Some((off + take, len - take));
            }
        }

        if written == 0 && eof && !parts.is_empty() {
            // the input was an exact multiple of part_size; drop the
            // would-be empty trailing part instead of recording it
            drop(file);
            std::fs::remove_file(dir.join(&filename))?;
            break;
        }

        parts.push(PartInfo {
            filename,
            digest: hex::encode(sha.finish()),
            size: written,
        });

        if eof && carry.is_none() {
            break;
        }
    }

    Ok(parts)
}

/// Concatenate `parts` (resolved relative to `src_dir`) into `dest`, in
/// the order given.
///
/// When `verify` is set, each part's bytes are digested while being
/// copied and compared against the digest stored in its [`PartInfo`]; a
/// mismatch fails the whole reassembly with
/// [`BundleError::PartDigest`].
pub fn concatenate_parts(
    src_dir: &Path,
    parts: &[PartInfo],
    dest: &Path,
    verify: bool,
) -> Result<u64, BundleError> {
    let mut out = File::create(dest)?;
    let mut total = 0u64;
    let mut buf = vec![0u8; IO_CHUNK];

    for part in parts {
        let path = src_dir.join(&part.filename);
        let mut file = File::open(&path)?;
        let mut sha = Sha1::new();

        debug!("reading part {}", part.filename);

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            sha.update(&buf[..n]);
            total += n as u64;
        }

        if verify {
            let computed = hex::encode(sha.finish());
            if computed != part.digest {
                return Err(BundleError::PartDigest {
                    part: path,
                    expected: part.digest.clone(),
                    computed,
                });
            }
        }
    }

    Ok(total)
}

/// Remove the listed part files from `dir`, ignoring ones that are
/// already gone.  Used for cleanup after a failed bundle run.
pub(crate) fn remove_parts(dir: &Path, parts: &[PartInfo]) {
    for part in parts {
        remove_if_exists(&dir.join(&part.filename));
    }
}

pub(crate) fn remove_if_exists(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("unable to remove {}: {err}", path.display());
        }
    }
}

/// Hex SHA-1 of a whole file, read in [`IO_CHUNK`] chunks.
pub fn file_sha1(path: &Path) -> Result<String, BundleError> {
    let mut file = File::open(path)?;
    let mut sha = Sha1::new();
    let mut buf = vec![0u8; IO_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
    }
    Ok(hex::encode(sha.finish()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sha1_hex(data: &[u8]) -> String {
        let mut sha = Sha1::new();
        sha.update(data);
        hex::encode(sha.finish())
    }

    #[test]
    fn test_split_exact_multiple_has_no_empty_tail() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let data = vec![7u8; 4096 * 3];

        let parts = split_into_parts(&mut Cursor::new(&data), dir.path(), "img", 4096)?;

        assert_eq!(parts.len(), 3);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.filename, format!("img.part.{i:02}"));
            assert_eq!(part.size, 4096);
            assert_eq!(part.digest, sha1_hex(&data[i * 4096..(i + 1) * 4096]));
        }
        Ok(())
    }

    #[test]
    fn test_split_uneven_tail() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let data = vec![1u8; 10_000];

        let parts = split_into_parts(&mut Cursor::new(&data), dir.path(), "img", 4096)?;

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].size, 4096);
        assert_eq!(parts[1].size, 4096);
        assert_eq!(parts[2].size, 10_000 - 2 * 4096);
        Ok(())
    }

    #[test]
    fn test_split_empty_stream_yields_one_part() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let parts = split_into_parts(&mut Cursor::new(&[]), dir.path(), "img", 4096)?;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 0);
        assert_eq!(parts[0].digest, sha1_hex(b""));
        Ok(())
    }

    #[test]
    fn test_part_boundary_not_aligned_to_io_chunk() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        // part size deliberately not a multiple of the read chunk
        let parts = split_into_parts(&mut Cursor::new(&data), dir.path(), "img", 12_345)?;
        let total: u64 = parts.iter().map(|p| p.size).sum();
        assert_eq!(total, data.len() as u64);

        let dest = dir.path().join("reassembled");
        let size = concatenate_parts(dir.path(), &parts, &dest, true)?;
        assert_eq!(size, data.len() as u64);
        assert_eq!(std::fs::read(&dest)?, data);
        Ok(())
    }

    #[test]
    fn test_flipped_bit_fails_verification() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let data = vec![0xaau8; 9000];
        let parts = split_into_parts(&mut Cursor::new(&data), dir.path(), "img", 4096)?;

        // flip one bit in the middle part
        let victim = dir.path().join(&parts[1].filename);
        let mut bytes = std::fs::read(&victim)?;
        bytes[100] ^= 0x01;
        std::fs::write(&victim, &bytes)?;

        let dest = dir.path().join("reassembled");
        match concatenate_parts(dir.path(), &parts, &dest, true) {
            Err(BundleError::PartDigest { part, .. }) => assert_eq!(part, victim),
            other => panic!("expected digest mismatch, got {other:?}"),
        }
        Ok(())
    }
}
