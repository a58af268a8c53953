//! Error types for the image builder.
//!
//! All fallible operations in this crate return a [`Result<T>`] which is an
//! alias for `Result<T, Error>`.  Errors propagate to the top-level driver;
//! no partial image is ever considered valid.

use std::path::PathBuf;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for image building operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested flash geometry violates a UBIFS layout rule.
    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    /// An option is malformed or requires a capability this build lacks.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// I/O error while reading the source tree.
    #[error("source I/O error on '{path}'")]
    SourceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while writing a LEB to the output target.
    #[error("sink I/O error on LEB {lnum}")]
    SinkIo {
        lnum: u32,
        #[source]
        source: std::io::Error,
    },

    /// The image does not fit in the configured maximum LEB count.
    #[error("max LEB count too low ({need} needed, {max} available)")]
    TooManyLebs { need: u32, max: u32 },

    /// The index leaf list exceeds addressable bounds.
    #[error("index is too big ({0} entries)")]
    IndexTooBig(usize),

    /// A compression backend reported a hard failure.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// An encryption primitive failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Loading the signing material or producing the signature failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// A device table line could not be parsed or applied.
    #[error("invalid device table entry: {0}")]
    DeviceTableInvalid(String),

    /// The host filesystem cannot enumerate extended attributes for this
    /// inode.  Recoverable: the condition is noted in the log and the inode
    /// gets no xattr nodes; it never fails the build.
    #[error("host attributes unavailable on '{path}': {source}")]
    HostAttrUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A symbolic link target exceeds the inline data limit.
    #[error("symlink too long for '{path}'")]
    SymlinkTooLong { path: PathBuf },
}

impl Error {
    pub(crate) fn source_io(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Error::SourceIo {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn sink_io(lnum: u32, source: impl Into<std::io::Error>) -> Self {
        Error::SinkIo {
            lnum,
            source: source.into(),
        }
    }

    pub(crate) fn geometry(reason: impl Into<String>) -> Self {
        Error::InvalidGeometry {
            reason: reason.into(),
        }
    }
}
