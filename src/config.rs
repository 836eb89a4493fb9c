//! Configuration types for the companion runtime.
//!
//! Every section is `#[serde(default)]`, so a config file only needs to name
//! the values it overrides. Compiled-in defaults carry the remote URLs and
//! model filenames.

use crate::app_dirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Language model sampling settings.
    pub llm: LlmConfig,
    /// Speech recognition settings.
    pub stt: SttConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// Model artifact locations.
    pub models: ModelConfig,
    /// Conversation database location.
    pub store: StoreConfig,
    /// Prompt window and memory keywords.
    pub conversation: ConversationConfig,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Maximum tokens to generate per response.
    pub max_tokens: usize,
    /// Sampling temperature (0.0 = greedy, higher = more random).
    pub temperature: f64,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,
    /// Literal strings that end generation once produced.
    ///
    /// Chat-template turn delimiters for the families the default models use.
    pub stop_sequences: Vec<String>,
    /// Context window size for local GGUF inference (tokens).
    pub context_size_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: [
                "</s>",
                "<|end|>",
                "<|eot_id|>",
                "<|end_of_text|>",
                "<|im_end|>",
                "<|EOT|>",
                "<|END_OF_TURN_TOKEN|>",
                "<|end_of_turn|>",
                "<|endoftext|>",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            context_size_tokens: 2048,
        }
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Trailing silence after the last partial transcript that ends an
    /// utterance for engines without their own end-of-utterance signal.
    pub silence_timeout_ms: u64,
    /// Rolling audio window transcribed on each step (seconds).
    pub window_secs: f32,
    /// Interval between window transcriptions (milliseconds).
    pub step_ms: u64,
    /// Sample rate fed to the recognizer.
    pub sample_rate: u32,
    /// Preferred input device name. `None` uses the system default.
    pub input_device: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 2000,
            window_secs: 10.0,
            step_ms: 1000,
            sample_rate: 16_000,
            input_device: None,
        }
    }
}

impl SttConfig {
    /// The silence timeout as a [`Duration`].
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Speaking speed multiplier (0.5 to 2.0).
    pub speed: f32,
    /// Linear duration estimate used when playback has no level telemetry.
    pub timing: SpeechTimingConfig,
    /// Volume-polling completion settings.
    pub volume: VolumeCompletionConfig,
    /// Preferred output device name. `None` uses the system default.
    pub output_device: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            timing: SpeechTimingConfig::default(),
            volume: VolumeCompletionConfig::default(),
            output_device: None,
        }
    }
}

/// Linear model for estimating how long an utterance takes to speak.
///
/// `max(floor, words * per_word + punctuation * per_punctuation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechTimingConfig {
    pub per_word_ms: u64,
    pub per_punctuation_ms: u64,
    pub floor_ms: u64,
}

impl Default for SpeechTimingConfig {
    fn default() -> Self {
        Self {
            per_word_ms: 380,
            per_punctuation_ms: 250,
            floor_ms: 1500,
        }
    }
}

/// Completion detection from playback level telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCompletionConfig {
    /// RMS below which a level sample counts as silent.
    pub silence_threshold: f32,
    /// Consecutive silent samples (after audible output) that end playback.
    pub silent_samples: u32,
    /// Upper bound on waiting, as a multiple of the linear estimate.
    pub estimate_cap_factor: f32,
}

impl Default for VolumeCompletionConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.01,
            silent_samples: 6,
            estimate_cap_factor: 3.0,
        }
    }
}

/// Model artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory where artifacts are stored.
    pub models_dir: PathBuf,
    /// Base URL that artifact file names are resolved against.
    pub base_url: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            models_dir: app_dirs::models_dir(),
            base_url: "https://huggingface.co/shamil010/mymodel/resolve/main/".to_owned(),
        }
    }
}

/// Conversation store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: app_dirs::database_file(),
        }
    }
}

/// Prompt window and memory keyword configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Number of most-recent messages included in every prompt.
    pub window_size: usize,
    /// Any of these in a user message marks it `toRemember`.
    pub remember_keywords: Vec<String>,
    /// All of these in one user message clears every `toRemember` flag.
    pub forget_keywords: Vec<String>,
    /// Name the assistant introduces itself with in the system prompt.
    pub assistant_name: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window_size: 12,
            remember_keywords: vec!["remember".into(), "memorize".into(), "memorise".into()],
            forget_keywords: vec!["forget".into(), "memories".into()],
            assistant_name: "SAM".into(),
        }
    }
}

impl CompanionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::CompanionError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CompanionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        app_dirs::config_file()
    }
}
