pub mod crypto;
pub mod error;
pub mod exec;
pub mod manifest;
pub mod parts;
pub mod pipeline;
pub mod storage;
pub mod volume;

pub use error::BundleError;

/// Manifest schema version written into every manifest.
pub const MANIFEST_VERSION: &str = "2007-10-10";

/// Name and version of this bundler, recorded in the manifest's
/// `<bundler>` section so that consumers can identify the producer.
pub const BUNDLER_NAME: &str = "bundlekit";
pub const BUNDLER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUNDLER_RELEASE: &str = "1";

/// Symmetric algorithm used for the payload, as named in the manifest.
pub const PAYLOAD_CIPHER: &str = "AES-128-CBC";

/// Size of a single read/write during streaming I/O.  Every stage
/// (digest, cipher, split, reassemble) consumes its input in chunks of
/// this size so that memory use is bounded regardless of image size.
pub const IO_CHUNK: usize = 10 * 1024;

/// Default maximum size of one bundle part.
pub const DEFAULT_PART_SIZE: u64 = (IO_CHUNK as u64) * 1024;
