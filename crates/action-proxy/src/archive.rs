//! Extraction of bundled application archives.
//!
//! Bundles are zip archives or tar archives, optionally gzip-compressed.
//! Entries that would land outside the destination directory are refused.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{ProxyError, ProxyResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Archive container detected from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `tar.gz`.
    TarGz,
    /// Uncompressed tar.
    Tar,
    /// Zip.
    Zip,
}

impl ArchiveFormat {
    /// Detect the format of `data`.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            Self::TarGz
        } else if data.starts_with(&ZIP_MAGIC) {
            Self::Zip
        } else {
            Self::Tar
        }
    }
}

/// Extract `data` into `dir`, creating it if needed.
///
/// Runs on the blocking pool. Returns the number of entries written.
pub async fn extract(data: Vec<u8>, dir: impl Into<PathBuf>) -> ProxyResult<usize> {
    let dir = dir.into();
    tokio::task::spawn_blocking(move || extract_sync(&data, &dir))
        .await
        .map_err(|e| ProxyError::extraction(format!("extraction task failed: {e}")))?
}

/// Synchronous body of [`extract`].
pub fn extract_sync(data: &[u8], dir: &Path) -> ProxyResult<usize> {
    let format = ArchiveFormat::detect(data);
    info!(dir = %dir.display(), bytes = data.len(), ?format, "extracting bundle");

    std::fs::create_dir_all(dir).map_err(|e| {
        ProxyError::extraction(format!("failed to create {}: {e}", dir.display()))
    })?;

    let count = match format {
        ArchiveFormat::TarGz => unpack(GzDecoder::new(data), dir)?,
        ArchiveFormat::Tar => unpack(data, dir)?,
        ArchiveFormat::Zip => unzip(data, dir)?,
    };

    if count == 0 {
        return Err(ProxyError::extraction("archive is empty"));
    }

    info!(entries = count, "bundle extracted");
    Ok(count)
}

fn unpack<R: Read>(reader: R, dir: &Path) -> ProxyResult<usize> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    let mut count = 0;
    for entry in archive
        .entries()
        .map_err(|e| ProxyError::extraction(format!("failed to read archive: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| ProxyError::extraction(format!("failed to read entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| ProxyError::extraction(format!("invalid path in archive: {e}")))?
            .to_string_lossy()
            .to_string();

        let written = entry
            .unpack_in(dir)
            .map_err(|e| ProxyError::extraction(format!("failed to unpack {path}: {e}")))?;
        if !written {
            return Err(ProxyError::extraction(format!(
                "entry escapes the bundle directory: {path}"
            )));
        }

        debug!(path = %path, "unpacked");
        count += 1;
    }

    Ok(count)
}

fn unzip(data: &[u8], dir: &Path) -> ProxyResult<usize> {
    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| ProxyError::extraction(format!("failed to read archive: {e}")))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ProxyError::extraction(format!("failed to read entry: {e}")))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(ProxyError::extraction(format!(
                "entry escapes the bundle directory: {}",
                entry.name()
            )));
        };
        let target = dir.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| {
                ProxyError::extraction(format!("failed to create {}: {e}", relative.display()))
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProxyError::extraction(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let mut file = File::create(&target).map_err(|e| {
            ProxyError::extraction(format!("failed to unpack {}: {e}", relative.display()))
        })?;
        std::io::copy(&mut entry, &mut file).map_err(|e| {
            ProxyError::extraction(format!("failed to unpack {}: {e}", relative.display()))
        })?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;

            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| {
                    ProxyError::extraction(format!(
                        "failed to set mode of {}: {e}",
                        relative.display()
                    ))
                })?;
        }

        debug!(path = %relative.display(), "unpacked");
    }

    Ok(archive.len())
}
