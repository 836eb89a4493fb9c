//! Artifact descriptor table.
//!
//! The three model artifacts differ only in data: which remote files make
//! them up, where those land locally, and how on-disk validity is judged.
//! Everything the asset manager does is driven from [`ArtifactDescriptor`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One of the three downloadable model artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Language model weights (GGUF).
    Llm,
    /// Speech synthesis voice bundle.
    Tts,
    /// Speech recognition weights plus optional platform encoder.
    Stt,
}

impl ArtifactKind {
    /// All artifacts in startup-check order.
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Llm, ArtifactKind::Tts, ArtifactKind::Stt];
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => write!(f, "language model"),
            Self::Tts => write!(f, "voice model"),
            Self::Stt => write!(f, "speech recognition model"),
        }
    }
}

/// Platform a companion resource is conditional on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    Ios,
    Macos,
    Android,
    Other,
}

impl TargetPlatform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else if cfg!(target_os = "android") {
            Self::Android
        } else {
            Self::Other
        }
    }
}

/// A single remote file that makes up (part of) an artifact.
#[derive(Debug, Clone, Copy)]
pub struct RemoteFile {
    /// File name relative to the base URL. `{voice}` is substituted with the
    /// selected companion voice.
    pub remote: &'static str,
    /// Local path relative to the models directory. For archives this is the
    /// directory the archive is extracted into.
    pub local: &'static str,
    /// Share of the artifact's overall progress bar.
    pub weight: u8,
    /// Whether the payload is a zip archive to be extracted and then deleted.
    pub archive: bool,
    /// Only fetched and required on this platform.
    pub only_on: Option<TargetPlatform>,
}

impl RemoteFile {
    /// Whether this file applies to `platform`.
    pub fn applies_to(&self, platform: TargetPlatform) -> bool {
        self.only_on.is_none_or(|p| p == platform)
    }

    /// Remote file name with the voice placeholder filled in.
    pub fn remote_name(&self, voice: &str) -> String {
        self.remote.replace("{voice}", voice)
    }
}

/// How on-disk validity is judged.
#[derive(Debug, Clone, Copy)]
pub enum Validity {
    /// A single file that must be at least `min_bytes` long.
    MinSize { file: &'static str, min_bytes: u64 },
    /// A directory holding `expected_entries` entries, at least one of which
    /// carries `extension`.
    Directory {
        dir: &'static str,
        expected_entries: usize,
        extension: &'static str,
    },
}

impl Validity {
    /// The primary on-disk path relative to `models_dir`.
    pub fn primary_path(&self, models_dir: &Path) -> PathBuf {
        match self {
            Self::MinSize { file, .. } => models_dir.join(file),
            Self::Directory { dir, .. } => models_dir.join(dir),
        }
    }
}

/// Everything needed to check, fetch and validate one artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub files: &'static [RemoteFile],
    pub validity: Validity,
}

impl ArtifactDescriptor {
    /// Files to fetch on `platform`, in download order.
    pub fn files_for(&self, platform: TargetPlatform) -> impl Iterator<Item = &RemoteFile> {
        self.files.iter().filter(move |f| f.applies_to(platform))
    }

    /// Platform-conditional companion resources required on `platform`.
    pub fn companions_for(&self, platform: TargetPlatform) -> impl Iterator<Item = &RemoteFile> {
        self.files
            .iter()
            .filter(move |f| f.only_on.is_some() && f.applies_to(platform))
    }

    /// Sum of weights of the files that apply to `platform`.
    pub fn total_weight(&self, platform: TargetPlatform) -> u32 {
        self.files_for(platform).map(|f| u32::from(f.weight)).sum()
    }
}

const LLM_FILES: &[RemoteFile] = &[RemoteFile {
    remote: "Llama-3.2-1B-Instruct-Q4_0.gguf",
    local: "Llama-3.2-1B-Instruct-Q4_0.gguf",
    weight: 100,
    archive: false,
    only_on: None,
}];

const TTS_FILES: &[RemoteFile] = &[RemoteFile {
    remote: "kokoro-{voice}.zip",
    local: "tts_models",
    weight: 100,
    archive: true,
    only_on: None,
}];

const STT_FILES: &[RemoteFile] = &[
    RemoteFile {
        remote: "ggml-base.bin",
        local: "ggml-base.en.bin",
        weight: 80,
        archive: false,
        only_on: None,
    },
    // whisper.cpp picks up `<model>-encoder.mlmodelc` next to the weights on
    // Apple mobile builds; without it the CoreML path refuses to initialise.
    RemoteFile {
        remote: "ggml-base-encoder.mlmodelc.zip",
        local: "ggml-base-encoder.mlmodelc",
        weight: 20,
        archive: true,
        only_on: Some(TargetPlatform::Ios),
    },
];

/// Descriptor for `kind`.
pub fn descriptor(kind: ArtifactKind) -> ArtifactDescriptor {
    match kind {
        ArtifactKind::Llm => ArtifactDescriptor {
            kind,
            files: LLM_FILES,
            validity: Validity::MinSize {
                file: "Llama-3.2-1B-Instruct-Q4_0.gguf",
                min_bytes: 500_000_000,
            },
        },
        ArtifactKind::Tts => ArtifactDescriptor {
            kind,
            files: TTS_FILES,
            validity: Validity::Directory {
                dir: "tts_models",
                expected_entries: 3,
                extension: "onnx",
            },
        },
        ArtifactKind::Stt => ArtifactDescriptor {
            kind,
            files: STT_FILES,
            validity: Validity::MinSize {
                file: "ggml-base.en.bin",
                min_bytes: 100_000_000,
            },
        },
    }
}
