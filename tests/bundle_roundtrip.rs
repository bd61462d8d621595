//! End-to-end bundle/unbundle scenarios with freshly generated
//! throwaway identities.

use std::path::{Path, PathBuf};

use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    pkey::PKey,
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder},
};

use bundlekit::{
    crypto, manifest,
    pipeline::{self, BundleConfig, UnbundleConfig},
    storage::{self, BlobStore, DirectoryStore},
    BundleError,
};

struct Identity {
    cert: PathBuf,
    key: PathBuf,
}

/// Generate a self-signed certificate and private key under `dir`.
fn identity(dir: &Path, cn: &str) -> Identity {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let cert_path = dir.join(format!("{cn}-cert.pem"));
    let key_path = dir.join(format!("{cn}-pk.pem"));
    std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    Identity {
        cert: cert_path,
        key: key_path,
    }
}

/// Deterministic, incompressible-ish bytes so that gzip doesn't
/// collapse the payload to nothing.
fn noisy_bytes(len: usize) -> Vec<u8> {
    let mut state = 0x2545f491_u64;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

struct Bundled {
    dir: tempfile::TempDir,
    user: Identity,
    cloud: Identity,
    image_data: Vec<u8>,
    summary: pipeline::BundleSummary,
}

fn bundle_fixture(image_len: usize, part_size: u64) -> Bundled {
    let dir = tempfile::tempdir().unwrap();
    let user = identity(dir.path(), "user");
    let cloud = identity(dir.path(), "cloud");

    let image_data = noisy_bytes(image_len);
    let image = dir.path().join("disk.img");
    std::fs::write(&image, &image_data).unwrap();

    let mut config = BundleConfig::new(
        &image,
        dir.path().join("bundle"),
        "123456789012",
        &user.cert,
        &cloud.cert,
    );
    config.private_key = Some(user.key.clone());
    config.part_size = part_size;
    config.kernel_id = Some("eki-0abc1234".to_string());

    let summary = pipeline::bundle_image(&config).unwrap();
    Bundled {
        dir,
        user,
        cloud,
        image_data,
        summary,
    }
}

#[test]
fn test_bundle_then_unbundle_reproduces_the_image() {
    let fixture = bundle_fixture(300_000, 64 * 1024);
    let bundle_dir = fixture.dir.path().join("bundle");

    // the manifest is the only artifact besides the parts; the tar.gz
    // and encrypted intermediates must be gone
    assert!(!bundle_dir.join("disk.img.tar.gz").exists());
    assert!(!bundle_dir.join("disk.img.part").exists());

    // the ciphertext is bigger than a 64 KiB part, so this bundle has
    // several parts, each present on disk
    assert!(fixture.summary.parts.len() >= 2);
    for part in &fixture.summary.parts {
        assert!(bundle_dir.join(&part.filename).exists());
    }

    let parsed = manifest::parse_file(&fixture.summary.manifest).unwrap();
    assert_eq!(parsed.image.parts.len(), fixture.summary.parts.len());
    assert_eq!(parsed.image.size, fixture.image_data.len() as u64);
    let total: u64 = fixture.summary.parts.iter().map(|p| p.size).sum();
    assert_eq!(parsed.image.bundled_size, total);
    assert_eq!(parsed.machine.kernel_id.as_deref(), Some("eki-0abc1234"));

    let out = fixture.dir.path().join("out");
    let config = UnbundleConfig {
        manifest: fixture.summary.manifest.clone(),
        source: bundle_dir,
        destination: out.clone(),
        private_key: fixture.user.key.clone(),
    };
    let image = pipeline::unbundle(&config).unwrap();

    assert_eq!(image, out.join("disk.img"));
    assert_eq!(std::fs::read(&image).unwrap(), fixture.image_data);

    // intermediates from the unbundle side are cleaned up too
    assert!(!out.join("disk.img.enc.tar.gz").exists());
    assert!(!out.join("disk.img.tar.gz").exists());
}

#[test]
fn test_unbundling_with_the_wrong_key_is_a_crypto_error() {
    let fixture = bundle_fixture(100_000, 64 * 1024);
    let intruder = identity(fixture.dir.path(), "intruder");

    let out = fixture.dir.path().join("out");
    let config = UnbundleConfig {
        manifest: fixture.summary.manifest.clone(),
        source: fixture.dir.path().join("bundle"),
        destination: out.clone(),
        private_key: intruder.key,
    };

    match pipeline::unbundle(&config) {
        Err(BundleError::Crypto(_)) => (),
        other => panic!("expected a crypto error, got {other:?}"),
    }
    // never silently produce corrupted output
    assert!(!out.join("disk.img").exists());
}

#[test]
fn test_both_recipients_recover_the_same_secret() {
    let fixture = bundle_fixture(50_000, 64 * 1024);
    let parsed = manifest::parse_file(&fixture.summary.manifest).unwrap();

    let user_key =
        crypto::unwrap_with_private_key(&parsed.image.user_encrypted_key, &fixture.user.key)
            .unwrap();
    let cloud_key =
        crypto::unwrap_with_private_key(&parsed.image.ec2_encrypted_key, &fixture.cloud.key)
            .unwrap();
    assert_eq!(user_key, cloud_key);

    let user_iv =
        crypto::unwrap_with_private_key(&parsed.image.user_encrypted_iv, &fixture.user.key)
            .unwrap();
    let cloud_iv =
        crypto::unwrap_with_private_key(&parsed.image.ec2_encrypted_iv, &fixture.cloud.key)
            .unwrap();
    assert_eq!(user_iv, cloud_iv);
    assert_ne!(user_key, user_iv);
}

#[test]
fn test_manifest_signature_validates_against_the_user_cert() {
    let fixture = bundle_fixture(50_000, 64 * 1024);
    let xml = std::fs::read_to_string(&fixture.summary.manifest).unwrap();
    assert!(manifest::verify_signature(&xml, &fixture.user.cert).unwrap());
    assert!(!manifest::verify_signature(&xml, &fixture.cloud.cert).unwrap());
}

#[test]
fn test_corrupted_part_fails_unbundle() {
    let fixture = bundle_fixture(200_000, 64 * 1024);
    let bundle_dir = fixture.dir.path().join("bundle");

    let victim = bundle_dir.join(&fixture.summary.parts[1].filename);
    let mut bytes = std::fs::read(&victim).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&victim, &bytes).unwrap();

    let config = UnbundleConfig {
        manifest: fixture.summary.manifest.clone(),
        source: bundle_dir,
        destination: fixture.dir.path().join("out"),
        private_key: fixture.user.key.clone(),
    };
    assert!(matches!(
        pipeline::unbundle(&config),
        Err(BundleError::PartDigest { .. })
    ));
}

#[test]
fn test_upload_download_round_trip() {
    let fixture = bundle_fixture(150_000, 64 * 1024);
    let bundle_dir = fixture.dir.path().join("bundle");
    let store = DirectoryStore::new(fixture.dir.path().join("store"));

    storage::upload_bundle(
        &store,
        "my-bucket",
        &fixture.summary.manifest,
        &bundle_dir,
        0,
        1,
    )
    .unwrap();

    let fetched_dir = fixture.dir.path().join("fetched");
    let manifest_path = storage::download_bundle(
        &store,
        "my-bucket",
        "disk.img.manifest.xml",
        &fetched_dir,
    )
    .unwrap();

    // the downloaded copy unbundles just like the local one
    let out = fixture.dir.path().join("out");
    let config = UnbundleConfig {
        manifest: manifest_path,
        source: fetched_dir,
        destination: out.clone(),
        private_key: fixture.user.key.clone(),
    };
    pipeline::unbundle(&config).unwrap();
    assert_eq!(
        std::fs::read(out.join("disk.img")).unwrap(),
        fixture.image_data
    );

    // delete-bundle leaves the bucket empty
    storage::delete_bundle(&store, "my-bucket", "disk.img.manifest.xml", false).unwrap();
    assert!(store.list("my-bucket", "").unwrap().is_empty());
}
