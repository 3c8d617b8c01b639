use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for container, share-file and key operations
#[derive(Error, Debug)]
pub enum FortifyError {
    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Input lacks the container magic number
    #[error("not a fortified input file")]
    NotFortified,

    /// Malformed JSON in a share record or container metadata
    #[error("malformed JSON record: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed base64url payload
    #[error("invalid payload encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A share-file line exceeded the scanner limit
    #[error("share record line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// A share file held no record at all
    #[error("no share record found in {}", .0.display())]
    NoShareRecord(PathBuf),

    #[error("unknown cipher mode name: {0}")]
    UnknownMode(String),

    #[error("unknown cipher key kind: {0}")]
    UnknownKeyKind(String),

    /// The container was written under a different cipher mode
    #[error("requires cipher mode: {0}")]
    RequiresMode(String),

    /// Key material is not of the supported type or encoding
    #[error("{0}")]
    UnsupportedKey(String),

    /// Unwrapping the symmetric key failed (bad key or passphrase)
    #[error("decrypting secret key failed: {0}")]
    KeyDecrypt(String),

    /// Wrapping the symmetric key failed
    #[error("encrypting secret key failed: {0}")]
    KeyWrap(String),

    /// The metadata block matching the key kind is absent
    #[error("missing '{0}' metadata in fortified file")]
    MissingMetadata(&'static str),

    #[error("invalid checksum of meta")]
    HeadChecksum,

    #[error("invalid checksum of file")]
    FileChecksum,

    #[error("expected data length {expected}, got {actual}")]
    DataLength { expected: u64, actual: u64 },

    #[error("secret digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("block mismatch: expected {expected}, got {actual}")]
    BlockMismatch { expected: u64, actual: u64 },

    /// Fewer share files than the recorded threshold
    #[error("need at least {needed} share files, got {got}")]
    InsufficientShares { needed: u8, got: usize },

    /// Share records disagree on block, threshold or digest
    #[error("inconsistent share records across files")]
    InconsistentShares,

    /// Shares fed to recovery have differing payload lengths
    #[error("inconsistent share lengths")]
    InconsistentShareLength,

    /// Duplicate or out-of-range share index
    #[error("duplicate or invalid share index {0}")]
    InvalidShareIndex(u32),

    #[error("invalid threshold value {0}")]
    InvalidThreshold(u8),

    #[error("invalid share count {0}")]
    InvalidShareCount(u8),

    #[error("threshold {threshold} exceeds total shares {parts}")]
    ThresholdTooLarge { threshold: u8, parts: u8 },

    #[error("{} is empty", .0.display())]
    EmptyInput(PathBuf),

    #[error("{} is not empty", .0.display())]
    OutputNotEmpty(PathBuf),

    #[error("{} is a directory, not a file", .0.display())]
    NotAFile(PathBuf),

    #[error("missing key file argument")]
    MissingKeyArgument,

    #[error("passphrase is required")]
    PassphraseRequired,
}

pub type Result<T> = std::result::Result<T, FortifyError>;
