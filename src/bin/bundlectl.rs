use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bundlekit::{
    exec::SystemRunner,
    pipeline::{self, BundleConfig, UnbundleConfig},
    storage::{self, DirectoryStore, UPLOAD_ATTEMPTS},
    volume::{self, FstabSource, VolumeConfig},
    DEFAULT_PART_SIZE,
};

/// bundlectl
#[derive(Debug, Parser)]
#[clap(name = "bundlectl", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Parser)]
struct CertArgs {
    /// the user's X.509 certificate (default: $EC2_CERT)
    #[clap(long)]
    cert: Option<PathBuf>,
    /// the cloud's X.509 certificate (default: $EUCALYPTUS_CERT)
    #[clap(long)]
    ec2cert: Option<PathBuf>,
    /// the user's RSA private key, used to sign the manifest
    /// (default: $EC2_PRIVATE_KEY)
    #[clap(long)]
    privatekey: Option<PathBuf>,
    /// the user's account id (default: $EC2_USER_ID)
    #[clap(long)]
    user: Option<String>,
}

#[derive(Debug, Parser)]
struct BundleArgs {
    /// directory receiving the manifest and parts
    #[clap(long, short = 'd', default_value = ".")]
    destination: PathBuf,
    /// name prefix for produced files (default: the image file name)
    #[clap(long)]
    prefix: Option<String>,
    /// target architecture
    #[clap(long, default_value = "x86_64")]
    arch: String,
    /// kernel id to record in the manifest
    #[clap(long)]
    kernel: Option<String>,
    /// ramdisk id to record in the manifest
    #[clap(long)]
    ramdisk: Option<String>,
    /// block device mapping as virtual=device (repeatable)
    #[clap(long = "block-device-mapping", short = 'b')]
    block_device_mapping: Vec<String>,
    /// product code to attach (repeatable)
    #[clap(long = "productcode")]
    product_codes: Vec<String>,
    /// ancestor image id (repeatable)
    #[clap(long = "ancestor")]
    ancestor_ami_ids: Vec<String>,
    /// maximum part size in bytes
    #[clap(long)]
    part_size: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bundle a disk image: tar, compress, encrypt, split, and write a
    /// signed manifest.
    BundleImage {
        /// the disk image to bundle
        image: PathBuf,
        #[clap(flatten)]
        bundle: BundleArgs,
        #[clap(flatten)]
        certs: CertArgs,
    },
    /// Capture a volume into an image file, then bundle it.
    /// Requires root.
    BundleVol {
        /// the volume to capture
        #[clap(long, default_value = "/")]
        volume: PathBuf,
        /// image size in MiB
        #[clap(long, default_value_t = 10240)]
        size: u64,
        /// path to exclude from the copy (repeatable)
        #[clap(long = "exclude", short = 'e')]
        excludes: Vec<String>,
        /// skip the automatic mtab-based exclusions
        #[clap(long)]
        all: bool,
        /// filesystem type for the image
        #[clap(long)]
        fs_type: Option<String>,
        #[clap(long)]
        uuid: Option<String>,
        #[clap(long)]
        label: Option<String>,
        /// generate an fstab instead of copying the volume's
        /// ("legacy" or "modern")
        #[clap(long)]
        generate_fstab: Option<String>,
        /// fstab file to copy into the image
        #[clap(long)]
        fstab: Option<PathBuf>,
        #[clap(flatten)]
        bundle: BundleArgs,
        #[clap(flatten)]
        certs: CertArgs,
    },
    /// Reassemble, decrypt, and unpack a bundle.
    Unbundle {
        /// the bundle's manifest file
        manifest: PathBuf,
        /// directory containing the part files (default: the
        /// manifest's directory)
        #[clap(long, short = 's')]
        source: Option<PathBuf>,
        /// directory receiving the unpacked image
        #[clap(long, short = 'd', default_value = ".")]
        destination: PathBuf,
        /// the user's RSA private key (default: $EC2_PRIVATE_KEY)
        #[clap(long)]
        privatekey: Option<PathBuf>,
    },
    /// Upload a bundle's manifest and parts to a bucket.
    UploadBundle {
        #[clap(long, short = 'b')]
        bucket: String,
        #[clap(long, short = 'm')]
        manifest: PathBuf,
        /// directory containing the parts (default: the manifest's
        /// directory)
        #[clap(long)]
        directory: Option<PathBuf>,
        /// begin uploading with this part index
        #[clap(long, default_value_t = 0)]
        part: usize,
        /// retry failed uploads up to 5 times
        #[clap(long)]
        retry: bool,
        /// root directory of the blob store
        #[clap(long)]
        store_root: PathBuf,
    },
    /// Download a bundle's manifest and parts from a bucket, verifying
    /// part digests.
    DownloadBundle {
        #[clap(long, short = 'b')]
        bucket: String,
        /// key of the manifest within the bucket
        #[clap(long, short = 'm')]
        manifest: String,
        #[clap(long, short = 'd', default_value = ".")]
        directory: PathBuf,
        #[clap(long)]
        store_root: PathBuf,
    },
    /// Delete a bundle's parts (and optionally its manifest) from a
    /// bucket.
    DeleteBundle {
        #[clap(long, short = 'b')]
        bucket: String,
        #[clap(long, short = 'm')]
        manifest: String,
        /// leave the manifest in place
        #[clap(long)]
        clear_only_parts: bool,
        #[clap(long)]
        store_root: PathBuf,
    },
}

fn from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn resolve_path(flag: Option<PathBuf>, var: &str, what: &str) -> Result<PathBuf> {
    match flag.or_else(|| from_env(var).map(PathBuf::from)) {
        Some(path) => Ok(path),
        None => bail!("no {what} given; pass the flag or set ${var}"),
    }
}

fn parse_mapping(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((virtual_name, device)) => {
                Ok((virtual_name.to_string(), device.to_string()))
            }
            None => bail!("block device mapping {entry:?} is not of the form virtual=device"),
        })
        .collect()
}

fn build_config(image: PathBuf, bundle: BundleArgs, certs: CertArgs) -> Result<BundleConfig> {
    let cert = resolve_path(certs.cert, "EC2_CERT", "user certificate")?;
    let ec2cert = resolve_path(certs.ec2cert, "EUCALYPTUS_CERT", "cloud certificate")?;
    let user = match certs.user.or_else(|| from_env("EC2_USER_ID")) {
        Some(user) => user,
        None => bail!("no user id given; pass --user or set $EC2_USER_ID"),
    };
    // signing is skipped when no private key is available anywhere
    let private_key = certs
        .privatekey
        .or_else(|| from_env("EC2_PRIVATE_KEY").map(PathBuf::from));

    let mut config = BundleConfig::new(image, bundle.destination, user, cert, ec2cert);
    config.prefix = bundle.prefix;
    config.arch = bundle.arch;
    config.private_key = private_key;
    config.kernel_id = bundle.kernel;
    config.ramdisk_id = bundle.ramdisk;
    config.block_device_mapping = parse_mapping(&bundle.block_device_mapping)?;
    config.product_codes = bundle.product_codes;
    config.ancestor_ami_ids = bundle.ancestor_ami_ids;
    config.part_size = bundle.part_size.unwrap_or(DEFAULT_PART_SIZE);
    Ok(config)
}

fn fstab_source(generate: Option<String>, file: Option<PathBuf>) -> Result<Option<FstabSource>> {
    match (generate, file) {
        (Some(_), Some(_)) => bail!("--generate-fstab and --fstab are mutually exclusive"),
        (Some(kind), None) => match kind.as_str() {
            "legacy" | "old" => Ok(Some(FstabSource::Legacy)),
            "modern" | "new" => Ok(Some(FstabSource::Modern)),
            other => bail!("unknown fstab template {other:?}"),
        },
        (None, Some(path)) => Ok(Some(FstabSource::File(path))),
        (None, None) => Ok(None),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let app = App::parse();

    match app.cmd {
        Command::BundleImage {
            image,
            bundle,
            certs,
        } => {
            let config = build_config(image, bundle, certs)?;
            let summary = pipeline::bundle_image(&config)?;
            println!("wrote {}", summary.manifest.display());
            for part in &summary.parts {
                println!("part: {}", part.filename);
            }
        }
        Command::BundleVol {
            volume,
            size,
            excludes,
            all,
            fs_type,
            uuid,
            label,
            generate_fstab,
            fstab,
            bundle,
            certs,
        } => {
            let prefix = bundle.prefix.clone().unwrap_or_else(|| "image".to_string());
            let image = bundle.destination.join(format!("{prefix}.img"));
            std::fs::create_dir_all(&bundle.destination)?;

            let volume_config = VolumeConfig {
                volume,
                size_mb: size,
                excludes,
                include_all: all,
                fs_type,
                uuid,
                label,
                fstab: fstab_source(generate_fstab, fstab)?,
            };
            let runner = SystemRunner;
            if let Err(err) = volume::make_volume_image(&runner, &volume_config, &image) {
                let _ = std::fs::remove_file(&image);
                return Err(err).context("capturing volume");
            }

            let config = build_config(image.clone(), bundle, certs)?;
            let summary = pipeline::bundle_image(&config)?;
            println!("wrote {}", summary.manifest.display());
        }
        Command::Unbundle {
            manifest,
            source,
            destination,
            privatekey,
        } => {
            let source = match source {
                Some(dir) => dir,
                None => manifest
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let config = UnbundleConfig {
                manifest,
                source,
                destination,
                private_key: resolve_path(privatekey, "EC2_PRIVATE_KEY", "private key")?,
            };
            let image = pipeline::unbundle(&config)?;
            println!("wrote {}", image.display());
        }
        Command::UploadBundle {
            bucket,
            manifest,
            directory,
            part,
            retry,
            store_root,
        } => {
            let part_dir = match directory {
                Some(dir) => dir,
                None => manifest
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let store = DirectoryStore::new(store_root);
            let attempts = if retry { UPLOAD_ATTEMPTS } else { 1 };
            storage::upload_bundle(&store, &bucket, &manifest, &part_dir, part, attempts)?;
            println!("uploaded bundle to {bucket}");
        }
        Command::DownloadBundle {
            bucket,
            manifest,
            directory,
            store_root,
        } => {
            let store = DirectoryStore::new(store_root);
            let path = storage::download_bundle(&store, &bucket, &manifest, &directory)?;
            println!("wrote {}", path.display());
        }
        Command::DeleteBundle {
            bucket,
            manifest,
            clear_only_parts,
            store_root,
        } => {
            let store = DirectoryStore::new(store_root);
            storage::delete_bundle(&store, &bucket, &manifest, clear_only_parts)?;
            println!("deleted bundle from {bucket}");
        }
    }

    Ok(())
}
