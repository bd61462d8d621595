use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::{crypto::CryptoError, manifest::ManifestError};

/// Error taxonomy for the bundle pipeline.
///
/// Every stage raises rather than returning sentinel values; the only
/// recovery behavior anywhere in the pipeline is best-effort cleanup of
/// intermediate files before the error propagates.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Missing or invalid input, checked before any work is done.
    /// Never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An external command exited with a non-zero status.
    #[error("'{program}' failed with {status}")]
    Command { program: String, status: ExitStatus },

    /// An external command could not be started at all.
    #[error("unable to run '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A part file failed digest verification during reassembly.
    #[error("digest mismatch for part {part:?}: expected {expected}, computed {computed}")]
    PartDigest {
        part: PathBuf,
        expected: String,
        computed: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BundleError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        BundleError::Precondition(msg.into())
    }
}
