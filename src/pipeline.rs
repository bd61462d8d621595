//! The bundle/unbundle orchestrator.
//!
//! Bundling sequences CheckImage → TarAndCompress → Encrypt → Split →
//! GenerateManifest; unbundling sequences ParseManifest →
//! ReassembleParts → Decrypt → Decompress.  Each stage fully
//! materializes its output before the next begins; there is no overlap,
//! no checkpointing, and no retry.  A failed run is restarted from the
//! beginning.
//!
//! The one recovery behavior is cleanup: intermediate files (the
//! compressed tar, the encrypted payload) are deleted on success, and on
//! failure everything the run created is removed before the error
//! propagates, so repeated invocations do not leak disk space.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::info;
use openssl::sha::Sha1;

use crate::{
    crypto::{self, BundleKey},
    error::BundleError,
    manifest::{ImageSection, MachineConfiguration, Manifest},
    parts::{self, PartInfo},
    DEFAULT_PART_SIZE,
};

/// Largest supported image: 10 GiB, matching the platform limit.
pub const MAX_IMAGE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Everything one bundle invocation needs, resolved up front.  Nothing
/// in the pipeline reads the environment.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// The disk image to bundle.
    pub image: PathBuf,
    /// Name prefix for all produced files; defaults to the image's file
    /// name.
    pub prefix: Option<String>,
    /// Directory receiving the manifest and part files.
    pub destination: PathBuf,
    /// Owning user (account) id, recorded in the manifest.
    pub user: String,
    /// Target architecture ("x86_64", "i386", ...).
    pub arch: String,
    /// The user's X.509 certificate (key recipient #1).
    pub cert: PathBuf,
    /// The cloud's X.509 certificate (key recipient #2).
    pub ec2cert: PathBuf,
    /// The user's RSA private key; when present the manifest is signed.
    pub private_key: Option<PathBuf>,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
    pub block_device_mapping: Vec<(String, String)>,
    pub product_codes: Vec<String>,
    pub ancestor_ami_ids: Vec<String>,
    /// Maximum part size in bytes.
    pub part_size: u64,
}

impl BundleConfig {
    pub fn new(
        image: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        user: impl Into<String>,
        cert: impl Into<PathBuf>,
        ec2cert: impl Into<PathBuf>,
    ) -> Self {
        BundleConfig {
            image: image.into(),
            prefix: None,
            destination: destination.into(),
            user: user.into(),
            arch: "x86_64".to_string(),
            cert: cert.into(),
            ec2cert: ec2cert.into(),
            private_key: None,
            kernel_id: None,
            ramdisk_id: None,
            block_device_mapping: vec![],
            product_codes: vec![],
            ancestor_ami_ids: vec![],
            part_size: DEFAULT_PART_SIZE,
        }
    }

    fn prefix(&self) -> String {
        match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => self
                .image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string()),
        }
    }
}

/// What one successful bundle run produced.
#[derive(Debug)]
pub struct BundleSummary {
    pub manifest: PathBuf,
    pub parts: Vec<PartInfo>,
    /// Plaintext image size in bytes.
    pub image_size: u64,
    /// Encrypted payload size: the sum of all part sizes.
    pub bundled_size: u64,
    /// Hex SHA-1 of the uncompressed tar stream.
    pub digest: String,
}

/// A `Write` adapter that feeds a SHA-1 alongside its inner writer.
/// Used to digest the tar stream while it is being compressed.
struct Sha1Writer<W: Write> {
    inner: W,
    sha: Sha1,
}

impl<W: Write> Sha1Writer<W> {
    fn new(inner: W) -> Self {
        Sha1Writer {
            inner,
            sha: Sha1::new(),
        }
    }
}

impl<W: Write> Write for Sha1Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.sha.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// CheckImage: validate preconditions and report the image size.
fn check_image(config: &BundleConfig) -> Result<u64, BundleError> {
    info!("checking image {}", config.image.display());

    let meta = std::fs::metadata(&config.image).map_err(|_| {
        BundleError::precondition(format!("image {} does not exist", config.image.display()))
    })?;
    if !meta.is_file() {
        return Err(BundleError::precondition(format!(
            "image {} is not a regular file",
            config.image.display()
        )));
    }
    if meta.len() > MAX_IMAGE_SIZE {
        return Err(BundleError::precondition(format!(
            "image is too large: {} bytes (limit {MAX_IMAGE_SIZE})",
            meta.len()
        )));
    }
    if config.part_size == 0 {
        return Err(BundleError::precondition("part size must be non-zero"));
    }
    std::fs::create_dir_all(&config.destination)?;
    Ok(meta.len())
}

/// TarAndCompress: archive the image under its bare file name, gzip the
/// archive, and digest the *uncompressed* tar bytes along the way.
fn tar_and_compress(config: &BundleConfig, targz: &Path) -> Result<String, BundleError> {
    info!("tarring and compressing image");

    let file = File::create(targz)?;
    let gz = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(Sha1Writer::new(gz));
    builder.follow_symlinks(true);

    let name = config
        .image
        .file_name()
        .ok_or_else(|| BundleError::precondition("image path has no file name"))?;
    builder.append_path_with_name(&config.image, name)?;

    let sha1 = builder.into_inner()?; // finishes the archive
    let digest = hex::encode(sha1.sha.finish());
    sha1.inner.finish()?.flush()?;

    Ok(digest)
}

/// Encrypt: stream the compressed tar through AES-128-CBC with a fresh
/// key/IV pair.
fn encrypt_payload(targz: &Path, enc: &Path) -> Result<(BundleKey, u64), BundleError> {
    info!("encrypting image");

    let key = BundleKey::generate()?;
    let mut source = BufReader::new(File::open(targz)?);
    let mut dest = BufWriter::new(File::create(enc)?);
    let bundled_size = crypto::encrypt_stream(&mut source, &mut dest, &key)?;
    dest.flush()?;
    Ok((key, bundled_size))
}

fn generate_manifest(
    config: &BundleConfig,
    key: &BundleKey,
    digest: String,
    image_size: u64,
    bundled_size: u64,
    part_infos: Vec<PartInfo>,
    manifest_path: &Path,
) -> Result<(), BundleError> {
    let machine = MachineConfiguration {
        architecture: config.arch.clone(),
        block_device_mapping: config.block_device_mapping.clone(),
        product_codes: config.product_codes.clone(),
        kernel_id: config.kernel_id.clone(),
        ramdisk_id: config.ramdisk_id.clone(),
    };

    let name = config
        .image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.prefix());

    // the same two secrets, wrapped once per recipient: four
    // independent ciphertexts
    let image = ImageSection {
        name,
        user: config.user.clone(),
        image_type: "machine".to_string(),
        ancestor_ami_ids: config.ancestor_ami_ids.clone(),
        digest,
        size: image_size,
        bundled_size,
        ec2_encrypted_key: crypto::wrap_for_recipient(&key.key_hex, &config.ec2cert)?,
        user_encrypted_key: crypto::wrap_for_recipient(&key.key_hex, &config.cert)?,
        ec2_encrypted_iv: crypto::wrap_for_recipient(&key.iv_hex, &config.ec2cert)?,
        user_encrypted_iv: crypto::wrap_for_recipient(&key.iv_hex, &config.cert)?,
        parts: part_infos,
    };

    let mut manifest = Manifest::new(machine, image);
    manifest.write(manifest_path, config.private_key.as_deref())?;
    Ok(())
}

/// Run the whole bundle pipeline.
pub fn bundle_image(config: &BundleConfig) -> Result<BundleSummary, BundleError> {
    let prefix = config.prefix();
    let dir = config.destination.clone();
    let targz = dir.join(format!("{prefix}.tar.gz"));
    let enc = dir.join(format!("{prefix}.part"));
    let manifest_path = dir.join(format!("{prefix}.manifest.xml"));

    let mut written_parts: Vec<PartInfo> = vec![];
    let result = (|| -> Result<BundleSummary, BundleError> {
        let image_size = check_image(config)?;
        let digest = tar_and_compress(config, &targz)?;
        let (key, bundled_size) = encrypt_payload(&targz, &enc)?;

        info!("splitting image into parts");
        let mut source = BufReader::new(File::open(&enc)?);
        written_parts = parts::split_into_parts(&mut source, &dir, &prefix, config.part_size)?;

        generate_manifest(
            config,
            &key,
            digest.clone(),
            image_size,
            bundled_size,
            written_parts.clone(),
            &manifest_path,
        )?;

        Ok(BundleSummary {
            manifest: manifest_path.clone(),
            parts: written_parts.clone(),
            image_size,
            bundled_size,
            digest,
        })
    })();

    // intermediates go away no matter what; parts and the manifest only
    // survive a fully successful run
    parts::remove_if_exists(&targz);
    parts::remove_if_exists(&enc);
    if result.is_err() {
        parts::remove_parts(&dir, &written_parts);
        parts::remove_if_exists(&manifest_path);
    }

    result
}

/// Everything one unbundle invocation needs.
#[derive(Debug, Clone)]
pub struct UnbundleConfig {
    /// Path to the manifest file.
    pub manifest: PathBuf,
    /// Directory containing the part files (defaults to the manifest's
    /// directory when constructed by the CLI).
    pub source: PathBuf,
    /// Directory receiving the unpacked image.
    pub destination: PathBuf,
    /// The user's RSA private key, matching the certificate the bundle
    /// was created for.
    pub private_key: PathBuf,
}

fn manifest_stem(manifest: &Path) -> String {
    let name = manifest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".manifest.xml")
        .unwrap_or(&name)
        .to_string()
}

/// Run the whole unbundle pipeline, returning the path of the unpacked
/// image.
pub fn unbundle(config: &UnbundleConfig) -> Result<PathBuf, BundleError> {
    let stem = manifest_stem(&config.manifest);
    let enc = config.destination.join(format!("{stem}.enc.tar.gz"));
    let targz = config.destination.join(format!("{stem}.tar.gz"));

    let result = (|| -> Result<PathBuf, BundleError> {
        info!("parsing manifest {}", config.manifest.display());
        let manifest = crate::manifest::parse_file(&config.manifest)?;

        std::fs::create_dir_all(&config.destination)?;

        info!("reassembling parts");
        parts::concatenate_parts(&config.source, &manifest.image.parts, &enc, true)?;

        info!("decrypting image");
        let key_hex =
            crypto::unwrap_with_private_key(&manifest.image.user_encrypted_key, &config.private_key)?;
        let iv_hex =
            crypto::unwrap_with_private_key(&manifest.image.user_encrypted_iv, &config.private_key)?;
        let key = BundleKey::from_hex(key_hex, iv_hex)?;

        let mut source = BufReader::new(File::open(&enc)?);
        let mut dest = BufWriter::new(File::create(&targz)?);
        crypto::decrypt_stream(&mut source, &mut dest, &key)?;
        dest.flush()?;
        drop(dest);

        info!("unpacking image");
        let tar_gz = BufReader::new(File::open(&targz)?);
        let mut archive = tar::Archive::new(GzDecoder::new(tar_gz));
        archive.unpack(&config.destination)?;

        Ok(config.destination.join(&manifest.image.name))
    })();

    // the unpacked image itself only appears on success, so removing
    // the two intermediates is all the cleanup either outcome needs
    parts::remove_if_exists(&enc);
    parts::remove_if_exists(&targz);

    result
}
