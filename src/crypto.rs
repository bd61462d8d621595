//! Symmetric and asymmetric primitives for the bundle pipeline.
//!
//! The payload is streamed through AES-128-CBC with a freshly generated
//! key/IV pair; the key and IV are then each RSA-wrapped (PKCS#1 v1.5)
//! for two recipients — the end user and the cloud platform — and only
//! the wrapped copies ever land on disk, inside the manifest.
//!
//! One wire-format quirk inherited from the original bundle format: the
//! key and IV travel as 32-character lowercase hex *strings*, and it is
//! the ASCII hex string (not the raw 16 bytes) that gets RSA-wrapped.
//! The raw bytes feed the cipher.

use std::{
    fs,
    io::{Read, Write},
    path::Path,
};

use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    sign::{Signer, Verifier},
    symm::{Cipher, Crypter, Mode},
    x509::X509,
};
use thiserror::Error;

use crate::IO_CHUNK;

/// AES-128-CBC key length (and IV length) in bytes.
const KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unable to read {path}: {source}")]
    ReadKeyMaterial {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse certificate {path}: {source}")]
    ParseCert {
        path: String,
        source: openssl::error::ErrorStack,
    },

    #[error("unable to parse private key {path}: {source}")]
    ParseKey {
        path: String,
        source: openssl::error::ErrorStack,
    },

    #[error("key or IV is not {expected} hex characters: {found} found")]
    BadKeyLength { expected: usize, found: usize },

    #[error("key or IV is not valid hex: {0}")]
    BadKeyEncoding(#[from] hex::FromHexError),

    /// RSA unwrap failed.  The usual cause is attempting to unbundle
    /// with a private key that does not match the certificate the
    /// bundle was created for.
    #[error(
        "unable to decrypt the bundle's key material; \
         the supplied private key most likely does not match the \
         certificate used at bundle time ({0})"
    )]
    Unwrap(openssl::error::ErrorStack),

    /// RSA unwrap produced bytes that are not an ASCII hex string.
    /// Can only happen with mismatched or malformed key material.
    #[error("decrypted key material is not a hex string; wrong private key?")]
    NotHexString,

    /// The cipher rejected the final block.  Wrong key/IV or corrupted
    /// ciphertext; never silently ignored.
    #[error("cipher error: {0}")]
    Cipher(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A freshly generated AES key and IV, kept as hex strings.
///
/// Exists only for the duration of one bundle invocation; the manifest
/// stores it exclusively in RSA-wrapped form.
#[derive(Clone)]
pub struct BundleKey {
    pub key_hex: String,
    pub iv_hex: String,
}

impl std::fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        f.debug_struct("BundleKey").finish_non_exhaustive()
    }
}

impl BundleKey {
    /// Generate a random key/IV pair from the library's CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; KEY_LEN];
        openssl::rand::rand_bytes(&mut key)?;
        openssl::rand::rand_bytes(&mut iv)?;
        Ok(BundleKey {
            key_hex: hex::encode(key),
            iv_hex: hex::encode(iv),
        })
    }

    /// Reconstitute from unwrapped hex strings, validating their shape.
    pub fn from_hex(key_hex: String, iv_hex: String) -> Result<Self, CryptoError> {
        for s in [&key_hex, &iv_hex] {
            if s.len() != KEY_LEN * 2 {
                return Err(CryptoError::BadKeyLength {
                    expected: KEY_LEN * 2,
                    found: s.len(),
                });
            }
        }
        Ok(BundleKey { key_hex, iv_hex })
    }

    fn key_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(hex::decode(&self.key_hex)?)
    }

    fn iv_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(hex::decode(&self.iv_hex)?)
    }
}

fn crypt_stream(
    source: &mut impl Read,
    dest: &mut impl Write,
    key: &BundleKey,
    mode: Mode,
) -> Result<u64, CryptoError> {
    let cipher = Cipher::aes_128_cbc();
    let mut crypter = Crypter::new(cipher, mode, &key.key_bytes()?, Some(&key.iv_bytes()?))?;

    let mut inbuf = vec![0u8; IO_CHUNK];
    let mut outbuf = vec![0u8; IO_CHUNK + cipher.block_size()];
    let mut written = 0u64;

    loop {
        let n = source.read(&mut inbuf)?;
        if n == 0 {
            break;
        }
        let out = crypter.update(&inbuf[..n], &mut outbuf)?;
        dest.write_all(&outbuf[..out])?;
        written += out as u64;
    }

    // a padding failure here means a wrong key or corrupt ciphertext
    let out = crypter.finalize(&mut outbuf)?;
    dest.write_all(&outbuf[..out])?;
    written += out as u64;

    Ok(written)
}

/// Stream `source` through AES-128-CBC in encrypt mode, returning the
/// number of ciphertext bytes written.
pub fn encrypt_stream(
    source: &mut impl Read,
    dest: &mut impl Write,
    key: &BundleKey,
) -> Result<u64, CryptoError> {
    crypt_stream(source, dest, key, Mode::Encrypt)
}

/// Inverse of [`encrypt_stream`].  A bad final block (wrong key/IV,
/// truncated or corrupted ciphertext) surfaces as [`CryptoError`].
pub fn decrypt_stream(
    source: &mut impl Read,
    dest: &mut impl Write,
    key: &BundleKey,
) -> Result<u64, CryptoError> {
    crypt_stream(source, dest, key, Mode::Decrypt)
}

fn load_cert(path: &Path) -> Result<X509, CryptoError> {
    let pem = fs::read(path).map_err(|source| CryptoError::ReadKeyMaterial {
        path: path.display().to_string(),
        source,
    })?;
    X509::from_pem(&pem).map_err(|source| CryptoError::ParseCert {
        path: path.display().to_string(),
        source,
    })
}

fn load_private_key(path: &Path) -> Result<PKey<Private>, CryptoError> {
    let pem = fs::read(path).map_err(|source| CryptoError::ReadKeyMaterial {
        path: path.display().to_string(),
        source,
    })?;
    PKey::private_key_from_pem(&pem).map_err(|source| CryptoError::ParseKey {
        path: path.display().to_string(),
        source,
    })
}

/// RSA-wrap `secret` (an ASCII hex string) with the public key found in
/// the X.509 certificate at `cert_path`, returning the ciphertext as
/// hex.  Called once per recipient per secret: four times per bundle.
pub fn wrap_for_recipient(secret: &str, cert_path: &Path) -> Result<String, CryptoError> {
    let rsa = load_cert(cert_path)?.public_key()?.rsa()?;
    let mut ciphertext = vec![0u8; rsa.size() as usize];
    let n = rsa.public_encrypt(secret.as_bytes(), &mut ciphertext, Padding::PKCS1)?;
    ciphertext.truncate(n);
    Ok(hex::encode(ciphertext))
}

/// Inverse of [`wrap_for_recipient`]: recover the hex-string secret
/// using the RSA private key at `key_path`.
pub fn unwrap_with_private_key(
    wrapped_hex: &str,
    key_path: &Path,
) -> Result<String, CryptoError> {
    let rsa = load_private_key(key_path)?.rsa()?;
    let ciphertext = hex::decode(wrapped_hex.trim())?;
    let mut plaintext = vec![0u8; rsa.size() as usize];
    let n = rsa
        .private_decrypt(&ciphertext, &mut plaintext, Padding::PKCS1)
        .map_err(CryptoError::Unwrap)?;
    plaintext.truncate(n);
    String::from_utf8(plaintext).map_err(|_| CryptoError::NotHexString)
}

/// RSA-SHA1 signature over `data`, hex-encoded.  Used for the manifest
/// signature (over the machine-configuration and image fragments).
pub fn sign_fragments(data: &[u8], key_path: &Path) -> Result<String, CryptoError> {
    let key = load_private_key(key_path)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
    signer.update(data)?;
    Ok(hex::encode(signer.sign_to_vec()?))
}

/// Check a hex signature produced by [`sign_fragments`] against the
/// public key in the certificate at `cert_path`.
pub fn verify_fragments(
    data: &[u8],
    signature_hex: &str,
    cert_path: &Path,
) -> Result<bool, CryptoError> {
    let key = load_cert(cert_path)?.public_key()?;
    let signature = hex::decode(signature_hex.trim())?;
    let mut verifier = Verifier::new(MessageDigest::sha1(), &key)?;
    verifier.update(data)?;
    Ok(verifier.verify(&signature)?)
}

#[cfg(test)]
pub(crate) mod testkeys {
    //! Throwaway RSA keys and self-signed certificates for tests.

    use openssl::{
        asn1::Asn1Time,
        hash::MessageDigest,
        pkey::{PKey, Private},
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder, X509},
    };
    use std::path::PathBuf;

    pub struct TestIdentity {
        pub cert_path: PathBuf,
        pub key_path: PathBuf,
        pub _dir: tempfile::TempDir,
    }

    pub fn self_signed(cn: &str) -> (PKey<Private>, X509) {
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

        (key, builder.build())
    }

    /// Write a fresh identity (cert + private key PEMs) into a tempdir.
    pub fn identity(cn: &str) -> TestIdentity {
        let (key, cert) = self_signed(cn);
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join(format!("{cn}-cert.pem"));
        let key_path = dir.path().join(format!("{cn}-pk.pem"));
        std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
        std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        TestIdentity {
            cert_path,
            key_path,
            _dir: dir,
        }
    }
}
