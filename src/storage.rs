//! Bucket/key blob-store collaborator used by upload, download and
//! delete.
//!
//! The real object store is an external service; the pipeline only ever
//! treats it as a blob store with get/put/list/delete, so that is the
//! whole interface.  [`DirectoryStore`] is the filesystem-backed
//! implementation used by the CLI and by tests.  Uploads are sequential,
//! one part at a time, with a bounded per-object retry.

use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{error::BundleError, manifest, parts, IO_CHUNK};

/// Default number of attempts per object when retries are requested.
pub const UPLOAD_ATTEMPTS: u32 = 5;

pub trait BlobStore {
    fn put(&self, bucket: &str, key: &str, source: &mut dyn Read) -> Result<(), BundleError>;
    fn get(&self, bucket: &str, key: &str, dest: &mut dyn Write) -> Result<(), BundleError>;
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BundleError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), BundleError>;
}

/// A blob store rooted at a local directory: `<root>/<bucket>/<key>`.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryStore { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl BlobStore for DirectoryStore {
    fn put(&self, bucket: &str, key: &str, source: &mut dyn Read) -> Result<(), BundleError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        let mut buf = vec![0u8; IO_CHUNK];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str, dest: &mut dyn Write) -> Result<(), BundleError> {
        let mut file = File::open(self.object_path(bucket, key))?;
        let mut buf = vec![0u8; IO_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
        }
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BundleError> {
        let dir = self.root.join(bucket);
        let mut keys = vec![];
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), BundleError> {
        std::fs::remove_file(self.object_path(bucket, key))?;
        Ok(())
    }
}

fn put_with_retry(
    store: &dyn BlobStore,
    bucket: &str,
    key: &str,
    path: &Path,
    attempts: u32,
) -> Result<(), BundleError> {
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        let mut file = File::open(path)?;
        match store.put(bucket, key, &mut file) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!("upload of {key} failed (attempt {attempt}/{attempts}): {err}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

/// Upload a bundle: the manifest first, then every part in index order.
///
/// `first_part` allows resuming an interrupted upload from a given part
/// index.  Each object is retried up to `attempts` times; the upload as
/// a whole is otherwise strictly sequential.
pub fn upload_bundle(
    store: &dyn BlobStore,
    bucket: &str,
    manifest_path: &Path,
    part_dir: &Path,
    first_part: usize,
    attempts: u32,
) -> Result<(), BundleError> {
    let parsed = manifest::parse_file(manifest_path)?;
    let manifest_key = manifest_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BundleError::precondition("manifest path has no file name"))?;

    info!("uploading manifest {manifest_key} to {bucket}");
    put_with_retry(store, bucket, &manifest_key, manifest_path, attempts)?;

    for part in parsed.image.parts.iter().skip(first_part) {
        info!("uploading part {}", part.filename);
        put_with_retry(
            store,
            bucket,
            &part.filename,
            &part_dir.join(&part.filename),
            attempts,
        )?;
    }
    Ok(())
}

/// Download a bundle's manifest and all of its parts into `dest_dir`,
/// verifying each part against the digest recorded in the manifest.
/// Returns the local manifest path.
pub fn download_bundle(
    store: &dyn BlobStore,
    bucket: &str,
    manifest_key: &str,
    dest_dir: &Path,
) -> Result<PathBuf, BundleError> {
    std::fs::create_dir_all(dest_dir)?;

    let manifest_path = dest_dir.join(manifest_key);
    info!("downloading manifest {manifest_key}");
    let mut file = File::create(&manifest_path)?;
    store.get(bucket, manifest_key, &mut file)?;
    drop(file);

    let parsed = manifest::parse_file(&manifest_path)?;
    for part in &parsed.image.parts {
        info!("downloading part {}", part.filename);
        let path = dest_dir.join(&part.filename);
        let mut file = File::create(&path)?;
        store.get(bucket, &part.filename, &mut file)?;
        drop(file);

        let computed = parts::file_sha1(&path)?;
        if computed != part.digest {
            return Err(BundleError::PartDigest {
                part: path,
                expected: part.digest.clone(),
                computed,
            });
        }
    }
    Ok(manifest_path)
}

/// Delete a bundle's parts (and, unless `keep_manifest`, the manifest
/// itself) from the store.
pub fn delete_bundle(
    store: &dyn BlobStore,
    bucket: &str,
    manifest_key: &str,
    keep_manifest: bool,
) -> Result<(), BundleError> {
    let mut xml = Vec::new();
    store.get(bucket, manifest_key, &mut xml)?;
    let parsed = manifest::parse(&String::from_utf8_lossy(&xml))?;

    for part in &parsed.image.parts {
        info!("deleting part {}", part.filename);
        store.delete(bucket, &part.filename)?;
    }
    if !keep_manifest {
        info!("deleting manifest {manifest_key}");
        store.delete(bucket, manifest_key)?;
    }
    Ok(())
}
