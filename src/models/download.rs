//! Blocking HTTP fetch and zip extraction for artifact files.
//!
//! Both run on the blocking thread pool; the asset manager owns the async
//! boundary and the state bookkeeping.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read buffer size for streaming downloads.
const CHUNK_SIZE: usize = 64 * 1024;

/// Why a fetch failed.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FetchError {
    /// The server answered with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),
    /// Connection or body read failure.
    #[error("transfer failed: {0}")]
    Transport(String),
    /// Local file write failure.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream `url` into `dest`, calling `on_progress(bytes_so_far, total)` after
/// every chunk.
///
/// The body is written to `<dest>.part` and renamed on completion so an
/// interrupted transfer never leaves a file at `dest`.
pub(crate) fn fetch(
    url: &str,
    dest: &Path,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, FetchError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let resp = match ureq::get(url).call() {
        Ok(resp) => resp,
        Err(ureq::Error::Status(code, _)) => return Err(FetchError::Status(code)),
        Err(e) => return Err(FetchError::Transport(e.to_string())),
    };

    let total_bytes = resp
        .header("content-length")
        .and_then(|v| v.parse::<u64>().ok());

    let file_label = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pb = ProgressBar::new(total_bytes.unwrap_or(0));
    if let Ok(style) = ProgressStyle::with_template(
        "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
    ) {
        pb.set_style(style);
    }
    pb.set_message(file_label);

    let tmp = part_path(dest);
    let mut file = std::fs::File::create(&tmp)?;
    let mut reader = resp.into_reader();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes_downloaded: u64 = 0;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        pb.inc(n as u64);
        bytes_downloaded += n as u64;
        on_progress(bytes_downloaded, total_bytes);
    }
    file.flush()?;
    pb.finish_and_clear();

    if let Some(expected) = total_bytes.filter(|&expected| bytes_downloaded < expected) {
        let _ = std::fs::remove_file(&tmp);
        return Err(FetchError::Transport(format!(
            "connection closed after {bytes_downloaded} of {expected} bytes"
        )));
    }

    std::fs::rename(&tmp, dest)?;
    info!(url, path = %dest.display(), bytes = bytes_downloaded, "download complete");
    Ok(bytes_downloaded)
}

/// Path of the in-progress download for `dest`.
pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Extract every entry of the zip at `archive` into `into`.
///
/// Returns the number of entries extracted.
pub(crate) fn extract_zip(archive: &Path, into: &Path) -> Result<usize, String> {
    let file = std::fs::File::open(archive).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    std::fs::create_dir_all(into).map_err(|e| e.to_string())?;
    let count = zip.len();
    zip.extract(into).map_err(|e| e.to_string())?;
    debug!(archive = %archive.display(), into = %into.display(), count, "archive extracted");
    Ok(count)
}

/// Remove whatever is at `path`, file or directory. Absent paths are fine.
pub(crate) fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
