//! Error kinds for the image-build pipeline.

use std::path::PathBuf;

/// Everything that can make a build fail. No partial image is ever
/// considered valid: any variant here aborts the whole pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    #[error("invalid option: {reason}")]
    InvalidOption { reason: String },

    #[error("I/O error reading source path {path:?}")]
    SourceIo {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("I/O error writing LEB {lnum}")]
    SinkIo {
        lnum: u32,
        #[source]
        cause: std::io::Error,
    },

    #[error("image needs {need} LEBs but max_leb_cnt is {max}")]
    TooManyLebs { need: u32, max: u32 },

    #[error("index does not fit within the available LEBs")]
    IndexTooBig,

    #[error("index corruption: two leaves share both key and name ({detail})")]
    IndexCorruption { detail: String },

    #[error("compression failed: {reason}")]
    CompressionFailed { reason: String },

    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    #[error("signing failed: {reason}")]
    SigningFailed { reason: String },

    #[error("device table invalid: {reason}")]
    DeviceTableInvalid { reason: String },

    /// Not a build failure: the host attribute (e.g. xattrs) is unavailable
    /// for this path. Callers that observe this should skip the attribute
    /// rather than abort. Kept as an error variant so `HostFs` can report it
    /// through the usual `Result` plumbing; [`crate::leaf_emitter`] treats it
    /// as non-fatal.
    #[error("host attribute unavailable for {path:?}: {reason}")]
    HostAttrUnavailable { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, BuildError>;
