//! Flattened study archives.
//!
//! The receiving side expects a flat bag of instance files, so the study's
//! series substructure is deliberately discarded: every regular file under
//! the study directory is added to a single `.tar.gz` under its base
//! filename only. Instance UIDs make base names unique in practice; a
//! colliding name is skipped (first wins) so archive entries never repeat.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ArchiveError;

/// One finished archive and the file snapshot it consumed (including any
/// name-collision skips).
///
/// Cleanup after a confirmed send must delete only `files`: instances
/// stored while the archive was in flight belong to the study's next
/// session and stay on disk.
#[derive(Debug)]
pub struct BuiltArchive {
    pub len: u64,
    pub files: Vec<PathBuf>,
}

/// Builds `archive_path` from every regular file under `study_dir`.
///
/// The walk is sorted, so a fixed file set yields the same entry order
/// within a run. An empty or missing study directory is an error: an empty
/// archive must never go upstream.
pub fn build_study_archive(
    study_dir: &Path,
    archive_path: &Path,
) -> Result<BuiltArchive, ArchiveError> {
    if !study_dir.is_dir() {
        return Err(ArchiveError::MissingStudyDir(study_dir.to_path_buf()));
    }

    let files = collect_instance_files(study_dir)?;
    if files.is_empty() {
        return Err(ArchiveError::EmptyStudy(study_dir.to_path_buf()));
    }

    let out = File::create(archive_path).map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut seen = HashSet::new();
    let mut entries = 0usize;

    for path in &files {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        if !seen.insert(name.clone()) {
            warn!(
                target: "archive",
                path = %path.display(),
                entry = %name,
                "duplicate base filename in study; skipping"
            );
            continue;
        }

        builder
            .append_path_with_name(path, &name)
            .map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        entries += 1;
    }

    let encoder = builder.into_inner().map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    encoder.finish().map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;

    let len = std::fs::metadata(archive_path)
        .map_err(|source| ArchiveError::Io {
            path: archive_path.to_path_buf(),
            source,
        })?
        .len();

    debug!(
        target: "archive",
        archive = %archive_path.display(),
        entries,
        bytes = len,
        "study archive built"
    );

    Ok(BuiltArchive { len, files })
}

fn collect_instance_files(study_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(study_dir).sort_by(|a, b| a.path().cmp(b.path())) {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| study_dir.to_path_buf());
            ArchiveError::Io {
                path,
                source: err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk failed")),
            }
        })?;

        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Hex SHA-256 over `bytes`, sent upstream as the integrity header. Always
/// computed on the plaintext archive; the receiver decrypts first, then
/// verifies.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Entry names of a gzipped tar, for tests and diagnostics.
pub fn list_entries(archive: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));

    let map_io = |source: std::io::Error| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in tar.entries().map_err(map_io)? {
        let entry = entry.map_err(map_io)?;
        let path = entry.path().map_err(map_io)?;
        names.push(path.to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Reads one entry's contents out of a gzipped tar.
pub fn read_entry(archive: &Path, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));

    let map_io = |source: std::io::Error| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    };

    for entry in tar.entries().map_err(map_io)? {
        let mut entry = entry.map_err(map_io)?;
        if entry.path().map_err(map_io)?.to_string_lossy() == name {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(map_io)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}
