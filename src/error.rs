use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure writing a single instance to local storage.
///
/// Scope is one C-STORE exchange: the caller NACKs that exchange and no
/// study timer is touched. Other instances and other studies are unaffected.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid {field} identifier: {value:?}")]
    InvalidIdentifier {
        field: &'static str,
        value: String,
    },

    #[error("failed to write instance at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure producing the study archive. Aborts that dispatch only.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("study directory {0} does not exist")]
    MissingStudyDir(PathBuf),

    #[error("study directory {0} contains no files")]
    EmptyStudy(PathBuf),

    #[error("archive i/o failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive worker failed: {0}")]
    Worker(String),
}

/// Failure in the optional encryption stage. Terminal for the dispatch;
/// study data stays on disk.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption key must be 64 hex characters (32 bytes): {0}")]
    InvalidKey(String),

    #[error("failed to seal archive: {0}")]
    SealFailed(String),

    #[error("failed to open sealed archive: {0}")]
    OpenFailed(String),
}

/// Failure delivering the archive upstream.
#[derive(Error, Debug)]
pub enum TransmitError {
    /// Transport-level failure (connect, timeout, TLS). Retriable.
    #[error("http transport error")]
    Http(#[from] reqwest::Error),

    /// Upstream returned 5xx. Retriable.
    #[error("upstream failed with status {status}")]
    Upstream { status: StatusCode },

    /// Upstream rejected the request (4xx, typically auth). Not retriable;
    /// retrying would burn the budget on a condition that will not clear.
    #[error("upstream rejected archive with status {status}")]
    Rejected { status: StatusCode },

    /// The whole retry budget was spent on transient failures.
    #[error("all {attempts} delivery attempts failed")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransmitError>,
    },
}

impl TransmitError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransmitError::Http(_) | TransmitError::Upstream { .. })
    }
}

/// Anything that sinks one dispatch. The tracker logs it and closes the
/// session; no variant here ever terminates the process.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transmit(#[from] TransmitError),
}

/// Inbound-surface errors, reported synchronously so the listener can NACK
/// at the protocol level.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay is draining; new instances are not accepted")]
    Draining,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
