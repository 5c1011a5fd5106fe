//! Durable storage for received instances.
//!
//! One file per instance at `<base>/<study>/<series>/<instance>.bin`.
//! Directory creation is idempotent and safe under concurrent C-STOREs for
//! the same study; a repeated (study, series, instance) triple overwrites
//! the earlier payload rather than erroring.

use std::path::PathBuf;

use tracing::{debug, instrument};

use crate::error::StorageError;

/// Identity of one stored payload.
///
/// The three UIDs come pre-validated from the protocol listener as far as
/// DICOM syntax goes, but they become filesystem path components here, so
/// anything that could escape the base directory is rejected outright.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
}

impl InstanceKey {
    pub fn new(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            instance_uid: instance_uid.into(),
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        check_component("study_uid", &self.study_uid)?;
        check_component("series_uid", &self.series_uid)?;
        check_component("instance_uid", &self.instance_uid)?;
        Ok(())
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), StorageError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0');

    if bad {
        return Err(StorageError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Writes instance payloads under a fixed base directory.
#[derive(Clone, Debug)]
pub struct InstanceStore {
    base_dir: PathBuf,
}

impl InstanceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding every instance of one study. This is the unit the
    /// dispatch pipeline archives and (optionally) deletes.
    pub fn study_dir(&self, study_uid: &str) -> PathBuf {
        self.base_dir.join(study_uid)
    }

    /// Persists one instance and returns the path it was written to.
    ///
    /// A failure here must NACK the triggering exchange; the caller must
    /// not touch the study timer for a payload that never hit disk.
    #[instrument(
        skip(self, payload),
        target = "storage",
        fields(
            study_uid = %key.study_uid,
            series_uid = %key.series_uid,
            instance_uid = %key.instance_uid,
            bytes = payload.len()
        )
    )]
    pub async fn store(&self, key: &InstanceKey, payload: &[u8]) -> Result<PathBuf, StorageError> {
        key.validate()?;

        let series_dir = self.study_dir(&key.study_uid).join(&key.series_uid);

        tokio::fs::create_dir_all(&series_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: series_dir.clone(),
                source,
            })?;

        let path = series_dir.join(format!("{}.bin", key.instance_uid));

        tokio::fs::write(&path, payload)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "instance stored");
        Ok(path)
    }
}
