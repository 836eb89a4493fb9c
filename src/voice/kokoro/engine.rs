//! Kokoro-82M ONNX inference: phonemes -> tokens -> 24 kHz mono audio.

use super::phonemize::{Phonemizer, split_sentences};
use crate::error::{CompanionError, Result};
use ort::session::Session;
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Maximum context length, pad tokens included.
const MAX_CONTEXT: usize = 512;
/// Characters per synthesis chunk; phoneme strings run longer than text.
const MAX_CHUNK_CHARS: usize = 200;
/// Style vector width.
const STYLE_DIM: usize = 256;
/// Silence inserted between sentence chunks.
const CHUNK_GAP_SECS: f32 = 0.12;

/// Output sample rate in Hz.
pub const SAMPLE_RATE: u32 = 24_000;

/// Files that make up an extracted voice bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceBundle {
    pub model_onnx: PathBuf,
    pub tokenizer_json: PathBuf,
    pub voice_bin: PathBuf,
}

impl VoiceBundle {
    /// Locate the model, tokenizer and voice style inside `dir`.
    pub fn locate(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CompanionError::SpeechSynthesis(format!("cannot read voice bundle {}: {e}", dir.display()))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let pick = |ext: &str| {
            files
                .iter()
                .find(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext)))
                .cloned()
                .ok_or_else(|| {
                    CompanionError::SpeechSynthesis(format!(
                        "voice bundle {} has no .{ext} file",
                        dir.display()
                    ))
                })
        };
        Ok(Self {
            model_onnx: pick("onnx")?,
            tokenizer_json: pick("json")?,
            voice_bin: pick("bin")?,
        })
    }

    /// Voice identifier from the style file name, e.g. `bf_emma`.
    pub fn voice_id(&self) -> String {
        self.voice_bin
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Identity of the files on disk. Re-extracting a bundle into the same
    /// directory changes it even when the directory path does not.
    pub fn fingerprint(&self) -> BundleFingerprint {
        let stamp = |path: &Path| {
            std::fs::metadata(path)
                .ok()
                .map(|m| (m.len(), m.modified().ok()))
        };
        BundleFingerprint {
            voice_bin: self.voice_bin.clone(),
            voice_stamp: stamp(&self.voice_bin),
            model_stamp: stamp(&self.model_onnx),
        }
    }

    /// British voices are prefixed `bf_`/`bm_`.
    pub fn is_british(&self) -> bool {
        let id = self.voice_id();
        id.starts_with("bf_") || id.starts_with("bm_")
    }
}

/// Length and modification time of one bundle file.
type FileStamp = Option<(u64, Option<SystemTime>)>;

/// See [`VoiceBundle::fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFingerprint {
    voice_bin: PathBuf,
    voice_stamp: FileStamp,
    model_stamp: FileStamp,
}

/// A loaded Kokoro model with one voice.
pub struct KokoroTts {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
    phonemizer: Phonemizer,
    /// Flat `(N, 1, 256)` style table indexed by token count.
    voice_styles: Vec<f32>,
    speed: f32,
}

impl KokoroTts {
    /// Load every part of `bundle`.
    ///
    /// # Errors
    ///
    /// [`CompanionError::SpeechSynthesis`] if any file is unreadable.
    pub fn load(bundle: &VoiceBundle, speed: f32) -> Result<Self> {
        info!(model = %bundle.model_onnx.display(), voice = %bundle.voice_id(), "loading Kokoro");
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(&bundle.model_onnx))
            .map_err(|e| synthesis_error(format!("failed to load Kokoro ONNX model: {e}")))?;
        let tokenizer = load_tokenizer(&bundle.tokenizer_json)?;
        let voice_styles = load_voice_styles(&bundle.voice_bin)?;

        Ok(Self {
            session,
            tokenizer,
            phonemizer: Phonemizer::new(bundle.is_british()),
            voice_styles,
            speed: speed.clamp(0.5, 2.0),
        })
    }

    /// Synthesize `text` sentence by sentence. Synchronous; callers on the
    /// async runtime wrap this in `block_in_place`.
    pub fn synthesize(&mut self, text: &str) -> Result<Vec<f32>> {
        let started = std::time::Instant::now();
        let gap = vec![0.0f32; (CHUNK_GAP_SECS * SAMPLE_RATE as f32) as usize];
        let mut audio = Vec::new();
        for chunk in split_sentences(text, MAX_CHUNK_CHARS) {
            let samples = self.synthesize_chunk(&chunk)?;
            if samples.is_empty() {
                continue;
            }
            if !audio.is_empty() {
                audio.extend_from_slice(&gap);
            }
            audio.extend_from_slice(&samples);
        }
        info!(
            samples = audio.len(),
            audio_secs = audio.len() as f32 / SAMPLE_RATE as f32,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synthesized reply"
        );
        Ok(audio)
    }

    fn synthesize_chunk(&mut self, text: &str) -> Result<Vec<f32>> {
        let ipa = self.phonemizer.phonemize(text)?;
        let encoding = self
            .tokenizer
            .encode(ipa.as_str(), false)
            .map_err(|e| synthesis_error(format!("tokenization failed: {e}")))?;

        let raw_ids = encoding.get_ids();
        if raw_ids.is_empty() {
            return Ok(Vec::new());
        }
        // The post-processor is stripped at load time, so pad (id 0) by hand.
        let mut token_ids: Vec<i64> = Vec::with_capacity(raw_ids.len() + 2);
        token_ids.push(0);
        token_ids.extend(raw_ids.iter().map(|&id| i64::from(id)));
        token_ids.push(0);
        if token_ids.len() > MAX_CONTEXT {
            return Err(synthesis_error(format!(
                "input too long: {} tokens (max {MAX_CONTEXT})",
                token_ids.len()
            )));
        }
        debug!(tokens = token_ids.len(), "kokoro chunk tokenized");

        let style = style_for(&self.voice_styles, raw_ids.len()).to_vec();
        self.run_inference(&token_ids, &style)
    }

    fn run_inference(&mut self, token_ids: &[i64], style: &[f32]) -> Result<Vec<f32>> {
        use ort::session::{SessionInputValue, SessionInputs};

        let input_ids = Tensor::from_array(([1_usize, token_ids.len()], token_ids.to_vec()))
            .map_err(|e| synthesis_error(format!("failed to create input_ids tensor: {e}")))?;
        let style_tensor = Tensor::from_array(([1_usize, STYLE_DIM], style.to_vec()))
            .map_err(|e| synthesis_error(format!("failed to create style tensor: {e}")))?;
        let speed_tensor = Tensor::from_array(([1_usize], vec![self.speed]))
            .map_err(|e| synthesis_error(format!("failed to create speed tensor: {e}")))?;

        let mut feed: HashMap<String, SessionInputValue> = HashMap::new();
        feed.insert("input_ids".to_string(), input_ids.into());
        feed.insert("style".to_string(), style_tensor.into());
        feed.insert("speed".to_string(), speed_tensor.into());

        let outputs = self
            .session
            .run(SessionInputs::from(feed))
            .map_err(|e| synthesis_error(format!("ONNX inference failed: {e}")))?;
        let (_shape, data) = outputs[0_usize]
            .try_extract_tensor::<f32>()
            .map_err(|e| synthesis_error(format!("failed to extract output tensor: {e}")))?;
        Ok(data.to_vec())
    }
}

/// Style row for a token count, clamped to the table.
fn style_for(styles: &[f32], content_tokens: usize) -> &[f32] {
    let rows = styles.len() / STYLE_DIM;
    let row = content_tokens.max(1).min(rows.saturating_sub(1));
    &styles[row * STYLE_DIM..(row + 1) * STYLE_DIM]
}

fn synthesis_error(message: impl Into<String>) -> CompanionError {
    CompanionError::SpeechSynthesis(message.into())
}

/// Load Kokoro's `tokenizer.json`, patching the parts `tokenizers` 0.22
/// cannot deserialize (the template post-processor and the untyped model).
fn load_tokenizer(path: &Path) -> Result<tokenizers::Tokenizer> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| synthesis_error(format!("failed to read tokenizer {}: {e}", path.display())))?;
    let patched = patch_tokenizer_json(&raw)?;
    tokenizers::Tokenizer::from_bytes(patched)
        .map_err(|e| synthesis_error(format!("failed to load tokenizer: {e}")))
}

fn patch_tokenizer_json(raw: &str) -> Result<String> {
    let mut json: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| synthesis_error(format!("failed to parse tokenizer JSON: {e}")))?;
    if let Some(obj) = json.as_object_mut() {
        obj.remove("post_processor");
        if let Some(model) = obj.get_mut("model").and_then(|m| m.as_object_mut()) {
            model
                .entry("type")
                .or_insert_with(|| serde_json::Value::String("WordLevel".into()));
            model
                .entry("unk_token")
                .or_insert_with(|| serde_json::Value::String("$".into()));
        }
    }
    serde_json::to_string(&json)
        .map_err(|e| synthesis_error(format!("failed to serialize patched tokenizer: {e}")))
}

/// Read a little-endian f32 style table whose length is a multiple of 256.
fn load_voice_styles(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)
        .map_err(|e| synthesis_error(format!("failed to read voice file {}: {e}", path.display())))?;
    parse_voice_styles(&bytes)
}

fn parse_voice_styles(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % (4 * STYLE_DIM) != 0 {
        return Err(synthesis_error(format!(
            "voice file size {} is not a whole number of {STYLE_DIM}-float rows",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
