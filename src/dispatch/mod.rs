//! Dispatch pipeline for completed studies.
//!
//! Runs on the timer path, fully off the instance-receipt path:
//! archive -> digest -> optional seal -> transmit (with retry) -> cleanup.
//!
//! Failure handling:
//! - a vanished study directory is a logged no-op, not an error
//! - any stage failure sinks this dispatch only; the study directory and
//!   archive stay on disk for manual recovery
//! - cleanup runs only after a confirmed 2xx

pub mod archive;
pub mod crypto;
pub mod transmit;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, DispatchError};
use crate::logger::warn_if_slow;

pub use crypto::ArchiveCipher;
pub use transmit::{ArchiveSender, HttpArchiveSender, RetryPolicy, SendAck};

/// Seam between the study tracker and the pipeline. Production uses
/// `DispatchPipeline`; tests inject recorders and failure scripts.
#[async_trait]
pub trait StudyDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, study_uid: &str) -> Result<DispatchOutcome, DispatchError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Archive delivered and acknowledged upstream.
    Sent { bytes: u64, digest: String },
    /// Study directory was already gone; nothing to do.
    Skipped,
}

/// Transient record of one built archive; lives for a single dispatch.
#[derive(Debug)]
struct ArchivePackage {
    path: PathBuf,
    len: u64,
    digest: String,
    /// The instance files this archive consumed. Cleanup deletes these and
    /// nothing else, so an instance stored mid-flight survives for the
    /// study's follow-up session.
    files: Vec<PathBuf>,
}

pub struct DispatchPipeline<S: ArchiveSender> {
    base_dir: PathBuf,
    sender: std::sync::Arc<S>,
    retry: RetryPolicy,
    cipher: Option<ArchiveCipher>,
    delete_after_send: bool,
}

impl<S: ArchiveSender> DispatchPipeline<S> {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        sender: std::sync::Arc<S>,
        retry: RetryPolicy,
        cipher: Option<ArchiveCipher>,
        delete_after_send: bool,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            sender,
            retry,
            cipher,
            delete_after_send,
        }
    }

    /// Builds the archive and returns it together with its bytes, so the
    /// digest and the wire body come from the same read.
    async fn build_package(
        &self,
        study_uid: &str,
    ) -> Result<(ArchivePackage, Vec<u8>), DispatchError> {
        let study_dir = self.base_dir.join(study_uid);
        let archive_path = self.base_dir.join(format!("{study_uid}.tar.gz"));

        // tar + gzip are synchronous; keep them off the runtime workers.
        let built = {
            let study_dir = study_dir.clone();
            let archive_path = archive_path.clone();
            warn_if_slow("build_study_archive", Duration::from_secs(5), async {
                tokio::task::spawn_blocking(move || {
                    archive::build_study_archive(&study_dir, &archive_path)
                })
                .await
                .map_err(|e| ArchiveError::Worker(e.to_string()))?
            })
            .await?
        };

        let bytes = tokio::fs::read(&archive_path)
            .await
            .map_err(|source| ArchiveError::Io {
                path: archive_path.clone(),
                source,
            })?;

        let digest = archive::sha256_hex(&bytes);

        Ok((
            ArchivePackage {
                path: archive_path,
                len: built.len,
                digest,
                files: built.files,
            },
            bytes,
        ))
    }

    /// Best-effort cleanup after a confirmed send. Never fails the
    /// dispatch: the archive was already delivered.
    ///
    /// Deletion covers exactly the files the archive consumed. Instances
    /// stored while the send was in flight belong to the study's next
    /// session, so they (and the directories holding them) stay on disk.
    async fn cleanup(&self, study_uid: &str, package: &ArchivePackage) {
        if let Err(e) = tokio::fs::remove_file(&package.path).await {
            warn!(
                target: "dispatch",
                archive = %package.path.display(),
                error = %e,
                "failed to remove sent archive"
            );
        }

        if !self.delete_after_send {
            return;
        }

        let study_dir = self.base_dir.join(study_uid);

        for file in &package.files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                warn!(
                    target: "dispatch",
                    study_uid,
                    path = %file.display(),
                    error = %e,
                    "failed to remove archived instance"
                );
            }
        }

        // Prune directories that emptied out, from each file's parent up
        // to (but not including) the study directory. remove_dir refuses
        // non-empty directories, which is exactly the guard needed: a late
        // instance keeps its series alive.
        for file in &package.files {
            let mut dir = file.parent();
            while let Some(d) = dir {
                if d == study_dir || !d.starts_with(&study_dir) {
                    break;
                }
                if tokio::fs::remove_dir(d).await.is_err() {
                    break;
                }
                dir = d.parent();
            }
        }

        match tokio::fs::remove_dir(&study_dir).await {
            Ok(()) => {
                info!(
                    target: "dispatch",
                    study_uid,
                    dir = %study_dir.display(),
                    "study directory deleted after send"
                );
            }
            Err(e) => {
                debug!(
                    target: "dispatch",
                    study_uid,
                    dir = %study_dir.display(),
                    error = %e,
                    "study directory kept; instances remain for a later session"
                );
            }
        }
    }
}

#[async_trait]
impl<S: ArchiveSender> StudyDispatcher for DispatchPipeline<S> {
    async fn dispatch(&self, study_uid: &str) -> Result<DispatchOutcome, DispatchError> {
        let study_dir = self.base_dir.join(study_uid);
        if !study_dir.is_dir() {
            // Already dispatched or removed externally.
            debug!(
                target: "dispatch",
                study_uid,
                dir = %study_dir.display(),
                "study directory missing; skipping dispatch"
            );
            return Ok(DispatchOutcome::Skipped);
        }

        let (package, bytes) = self.build_package(study_uid).await?;

        debug!(
            target: "dispatch",
            study_uid,
            archive = %package.path.display(),
            bytes = package.len,
            digest = %package.digest,
            "archive ready for transmission"
        );

        // Digest always covers the plaintext archive; sealing happens last.
        let body = match &self.cipher {
            Some(cipher) => cipher.seal(&bytes)?,
            None => bytes,
        };

        transmit::send_with_retry(self.sender.as_ref(), &body, &package.digest, &self.retry)
            .await?;

        self.cleanup(study_uid, &package).await;

        Ok(DispatchOutcome::Sent {
            bytes: package.len,
            digest: package.digest,
        })
    }
}
