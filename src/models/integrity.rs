//! On-disk validity checks for model artifacts.
//!
//! Full checksums are not performed; a file below its minimum size or a
//! voice directory with the wrong shape is treated as corrupt, which is
//! enough to catch interrupted downloads and truncated extractions.

use super::artifact::Validity;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Result of an artifact integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityResult {
    /// Present and passes the validity rule.
    Ok,
    /// Nothing at the expected path.
    Missing,
    /// Present but fails the validity rule (too small, wrong entry count,
    /// no model file).
    Corrupt,
}

impl IntegrityResult {
    /// Something exists at the expected path, valid or not.
    pub fn exists(self) -> bool {
        !matches!(self, Self::Missing)
    }
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Missing => write!(f, "missing"),
            Self::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Check `validity` against the files under `models_dir`.
pub fn verify(models_dir: &Path, validity: &Validity) -> IntegrityResult {
    match *validity {
        Validity::MinSize { file, min_bytes } => verify_min_size(&models_dir.join(file), min_bytes),
        Validity::Directory {
            dir,
            expected_entries,
            extension,
        } => verify_directory(&models_dir.join(dir), expected_entries, extension),
    }
}

fn verify_min_size(path: &Path, min_bytes: u64) -> IntegrityResult {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => {
            debug!(path = %path.display(), "model integrity: file missing");
            return IntegrityResult::Missing;
        }
    };
    if meta.len() > min_bytes {
        IntegrityResult::Ok
    } else {
        warn!(
            path = %path.display(),
            size = meta.len(),
            min_bytes,
            "model integrity: file below minimum size, treating as corrupt"
        );
        IntegrityResult::Corrupt
    }
}

fn verify_directory(dir: &Path, expected_entries: usize, extension: &str) -> IntegrityResult {
    let entries = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(_) => {
            debug!(path = %dir.display(), "model integrity: directory missing");
            return IntegrityResult::Missing;
        }
    };

    let mut count = 0usize;
    let mut has_model = false;
    for entry in entries.flatten() {
        count += 1;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        {
            has_model = true;
        }
    }

    if count == 0 {
        return IntegrityResult::Missing;
    }
    if count == expected_entries && has_model {
        IntegrityResult::Ok
    } else {
        warn!(
            path = %dir.display(),
            count,
            expected_entries,
            has_model,
            "model integrity: voice directory incomplete"
        );
        IntegrityResult::Corrupt
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let v = Validity::MinSize {
            file: "model.gguf",
            min_bytes: 10,
        };
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Missing);
    }

    #[test]
    fn undersized_file_is_corrupt_but_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"tiny").unwrap();
        let v = Validity::MinSize {
            file: "model.gguf",
            min_bytes: 10,
        };
        let r = verify(dir.path(), &v);
        assert_eq!(r, IntegrityResult::Corrupt);
        assert!(r.exists());
    }

    #[test]
    fn large_enough_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), vec![0u8; 64]).unwrap();
        let v = Validity::MinSize {
            file: "model.gguf",
            min_bytes: 10,
        };
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Ok);
    }

    #[test]
    fn voice_directory_needs_count_and_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let voice = dir.path().join("tts_models");
        std::fs::create_dir_all(&voice).unwrap();
        let v = Validity::Directory {
            dir: "tts_models",
            expected_entries: 3,
            extension: "onnx",
        };

        std::fs::write(voice.join("tokenizer.json"), b"{}").unwrap();
        std::fs::write(voice.join("voice.bin"), b"0000").unwrap();
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Corrupt);

        std::fs::write(voice.join("notes.txt"), b"x").unwrap();
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Corrupt);

        std::fs::remove_file(voice.join("notes.txt")).unwrap();
        std::fs::write(voice.join("kokoro.ONNX"), b"onnx").unwrap();
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Ok);
    }

    #[test]
    fn empty_voice_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tts_models")).unwrap();
        let v = Validity::Directory {
            dir: "tts_models",
            expected_entries: 3,
            extension: "onnx",
        };
        assert_eq!(verify(dir.path(), &v), IntegrityResult::Missing);
    }
}
