//! Model artifact lifecycle: check, download, validate, load, release.
//!
//! Each of the three artifacts moves through
//! `Missing -> Downloading -> Present -> Loaded`. [`ModelAssetManager`] owns
//! that state, talks to the blocking fetcher on the blocking pool, and hands
//! loaded engines to the rest of the runtime.

pub mod artifact;
pub(crate) mod download;
pub mod engines;
pub mod integrity;
pub mod state;

pub use artifact::{
    ArtifactDescriptor, ArtifactKind, RemoteFile, TargetPlatform, Validity, descriptor,
};
pub use engines::{EngineFactory, NativeEngines};
pub use integrity::IntegrityResult;
pub use state::{AssetPhase, ModelAssetState};

use crate::config::ModelConfig;
use crate::error::{CompanionError, Result};
use crate::llm::InferenceSession;
use crate::progress::{PercentThrottle, ProgressCallback, ProgressEvent};
use crate::voice::SpeechRecognizer;
use download::{FetchError, extract_zip, fetch, remove_path};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{info, warn};

/// An engine made ready by [`ModelAssetManager::load`].
#[derive(Clone)]
pub enum LoadedSession {
    Language(Arc<InferenceSession>),
    Recognition(Arc<dyn SpeechRecognizer>),
    /// Voice bundles are initialised per utterance; loading only validates
    /// the directory.
    Voice(PathBuf),
}

type StateMap = Mutex<HashMap<ArtifactKind, ModelAssetState>>;

/// Owns model artifacts on disk and the engines loaded from them.
pub struct ModelAssetManager {
    models_dir: PathBuf,
    base_url: url::Url,
    platform: TargetPlatform,
    voice: RwLock<String>,
    descriptors: HashMap<ArtifactKind, ArtifactDescriptor>,
    states: Arc<StateMap>,
    factory: Arc<dyn EngineFactory>,
    inference: Mutex<Option<Arc<InferenceSession>>>,
    recognizer: Mutex<Option<Arc<dyn SpeechRecognizer>>>,
}

impl ModelAssetManager {
    /// Create a manager rooted at `config.models_dir` for the given voice.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Config`] for a malformed base URL, or an I/O error
    /// if the models directory cannot be created.
    pub fn new(config: &ModelConfig, voice: &str, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        std::fs::create_dir_all(&config.models_dir)?;
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = url::Url::parse(&base)
            .map_err(|e| CompanionError::Config(format!("invalid model base URL {base}: {e}")))?;
        info!(dir = %config.models_dir.display(), base = %base_url, "model asset manager ready");

        Ok(Self {
            models_dir: config.models_dir.clone(),
            base_url,
            platform: TargetPlatform::current(),
            voice: RwLock::new(voice.to_owned()),
            descriptors: ArtifactKind::ALL
                .into_iter()
                .map(|kind| (kind, descriptor(kind)))
                .collect(),
            states: Arc::new(Mutex::new(HashMap::new())),
            factory,
            inference: Mutex::new(None),
            recognizer: Mutex::new(None),
        })
    }

    /// Override the target platform (companion resources differ per platform).
    pub fn with_platform(mut self, platform: TargetPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Replace the descriptor for one artifact.
    pub fn with_descriptor(mut self, descriptor: ArtifactDescriptor) -> Self {
        self.descriptors.insert(descriptor.kind, descriptor);
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Voice whose bundle the TTS artifact refers to.
    pub fn voice(&self) -> String {
        self.voice.read().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn set_voice(&self, voice: &str) {
        if let Ok(mut v) = self.voice.write() {
            *v = voice.to_owned();
        }
    }

    /// Snapshot of one artifact's state.
    pub fn state(&self, kind: ArtifactKind) -> ModelAssetState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&kind).copied())
            .unwrap_or_default()
    }

    /// On-disk location of the artifact's primary file or directory.
    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.descriptor(kind).validity.primary_path(&self.models_dir)
    }

    // -----------------------------------------------------------------------
    // Checking
    // -----------------------------------------------------------------------

    /// Re-examine the artifact on disk and refresh its state.
    pub fn check(&self, kind: ArtifactKind) -> IntegrityResult {
        let desc = self.descriptor(kind);
        let mut result = integrity::verify(&self.models_dir, &desc.validity);
        if result == IntegrityResult::Ok {
            let missing_companion = desc
                .companions_for(self.platform)
                .find(|f| !self.models_dir.join(f.local).exists());
            if let Some(companion) = missing_companion {
                warn!(artifact = %kind, companion = companion.local, "companion resource missing");
                result = IntegrityResult::Corrupt;
            }
        }
        update_state(&self.states, kind, |s| {
            s.exists_on_disk = result.exists();
            s.size_valid = result == IntegrityResult::Ok;
            if result != IntegrityResult::Ok {
                s.is_loaded_in_memory = false;
            }
        });
        result
    }

    /// Whether the artifact is present and valid.
    pub fn check_exists(&self, kind: ArtifactKind) -> bool {
        self.check(kind) == IntegrityResult::Ok
    }

    /// Check every artifact.
    pub fn check_all(&self) -> Vec<(ArtifactKind, IntegrityResult)> {
        ArtifactKind::ALL
            .into_iter()
            .map(|kind| (kind, self.check(kind)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Downloading
    // -----------------------------------------------------------------------

    /// Fetch the artifact, replacing anything stale on disk.
    ///
    /// A present and valid artifact is left alone. On failure the artifact
    /// is `Missing` again and partial files are removed.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Download`] or [`CompanionError::Extraction`];
    /// [`CompanionError::Busy`] if this artifact is already downloading.
    pub async fn download(
        &self,
        kind: ArtifactKind,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        if self.check_exists(kind) {
            info!(artifact = %kind, "artifact already present");
            return Ok(self.artifact_path(kind));
        }

        let progress: Arc<Option<ProgressCallback>> = Arc::new(progress);
        // Resolve every URL before claiming the slot so a bad name cannot
        // leave the artifact marked as downloading.
        let plan = match self.plan(kind) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(artifact = %kind, error = %e, "cannot plan artifact download");
                emit(
                    &progress,
                    ProgressEvent::Error {
                        artifact: kind,
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let claimed = self
            .states
            .lock()
            .map(|mut states| {
                let s = states.entry(kind).or_default();
                if s.is_downloading {
                    false
                } else {
                    s.is_downloading = true;
                    s.download_progress_percent = 0;
                    true
                }
            })
            .unwrap_or(false);
        if !claimed {
            return Err(CompanionError::Busy(format!("{kind} is already downloading")));
        }

        emit(&progress, ProgressEvent::DownloadStarted { artifact: kind });

        let states = Arc::clone(&self.states);
        let worker_progress = Arc::clone(&progress);
        let outcome = tokio::task::spawn_blocking(move || {
            run_download(kind, &plan, &states, &worker_progress)
        })
        .await
        .unwrap_or_else(|e| {
            Err(CompanionError::Download {
                artifact: kind,
                message: format!("download task failed: {e}"),
            })
        });

        let outcome = outcome.and_then(|()| match self.check(kind) {
            IntegrityResult::Ok => Ok(self.artifact_path(kind)),
            other => Err(self.validation_error(kind, other)),
        });

        update_state(&self.states, kind, |s| {
            s.is_downloading = false;
            if outcome.is_ok() {
                s.download_progress_percent = 100;
            }
        });

        match &outcome {
            Ok(path) => {
                info!(artifact = %kind, path = %path.display(), "artifact downloaded");
                emit(&progress, ProgressEvent::DownloadComplete { artifact: kind });
            }
            Err(e) => {
                warn!(artifact = %kind, error = %e, "artifact download failed");
                self.remove_files(kind);
                self.check(kind);
                emit(
                    &progress,
                    ProgressEvent::Error {
                        artifact: kind,
                        message: e.to_string(),
                    },
                );
            }
        }
        outcome
    }

    /// Delete the artifact (releasing any loaded engine) and fetch it again.
    pub async fn force_redownload(
        &self,
        kind: ArtifactKind,
        progress: Option<ProgressCallback>,
    ) -> Result<PathBuf> {
        self.invalidate(kind);
        self.download(kind, progress).await
    }

    /// Release the engine and delete the artifact from disk.
    pub fn invalidate(&self, kind: ArtifactKind) {
        self.release(kind);
        self.remove_files(kind);
        self.check(kind);
        info!(artifact = %kind, "artifact invalidated");
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load the artifact into an engine, replacing any previous session.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Load`] if the artifact is not valid on disk or the
    /// engine rejects it. The on-disk state is left untouched.
    pub async fn load(&self, kind: ArtifactKind) -> Result<LoadedSession> {
        let integrity = self.check(kind);
        if integrity != IntegrityResult::Ok {
            return Err(CompanionError::load(
                kind,
                format!("artifact is {integrity} at {}", self.artifact_path(kind).display()),
            ));
        }
        self.release(kind);

        let started = Instant::now();
        let path = self.artifact_path(kind);
        info!(artifact = %kind, path = %path.display(), "loading engine");
        let session = match kind {
            ArtifactKind::Llm => {
                let engine = self.factory.load_language_model(&path).await?;
                let session = Arc::new(InferenceSession::new(engine));
                if let Ok(mut slot) = self.inference.lock() {
                    *slot = Some(Arc::clone(&session));
                }
                LoadedSession::Language(session)
            }
            ArtifactKind::Stt => {
                let recognizer = self.factory.load_recognizer(&path).await?;
                if let Ok(mut slot) = self.recognizer.lock() {
                    *slot = Some(Arc::clone(&recognizer));
                }
                LoadedSession::Recognition(recognizer)
            }
            ArtifactKind::Tts => LoadedSession::Voice(path),
        };

        update_state(&self.states, kind, |s| s.is_loaded_in_memory = true);
        info!(
            artifact = %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine loaded"
        );
        Ok(session)
    }

    /// [`Self::load`] that logs failures instead of returning them.
    pub async fn try_load(&self, kind: ArtifactKind) -> Option<LoadedSession> {
        match self.load(kind).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(artifact = %kind, error = %e, "engine load failed");
                None
            }
        }
    }

    /// Drop the loaded engine. In-flight inference is cancelled first.
    pub fn release(&self, kind: ArtifactKind) {
        match kind {
            ArtifactKind::Llm => {
                let previous = self.inference.lock().ok().and_then(|mut s| s.take());
                if let Some(session) = previous {
                    session.cancel();
                }
            }
            ArtifactKind::Stt => {
                if let Ok(mut slot) = self.recognizer.lock() {
                    *slot = None;
                }
            }
            ArtifactKind::Tts => {}
        }
        update_state(&self.states, kind, |s| s.is_loaded_in_memory = false);
    }

    /// The loaded language model session.
    pub fn inference(&self) -> Option<Arc<InferenceSession>> {
        self.inference.lock().ok().and_then(|s| s.clone())
    }

    /// The loaded speech recognizer.
    pub fn recognizer(&self) -> Option<Arc<dyn SpeechRecognizer>> {
        self.recognizer.lock().ok().and_then(|s| s.clone())
    }

    /// The voice bundle directory, when loaded.
    pub fn voice_model_dir(&self) -> Option<PathBuf> {
        self.state(ArtifactKind::Tts)
            .is_loaded_in_memory
            .then(|| self.artifact_path(ArtifactKind::Tts))
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn descriptor(&self, kind: ArtifactKind) -> ArtifactDescriptor {
        self.descriptors
            .get(&kind)
            .copied()
            .unwrap_or_else(|| descriptor(kind))
    }

    fn plan(&self, kind: ArtifactKind) -> Result<Vec<PlannedFile>> {
        let voice = self.voice();
        self.descriptor(kind)
            .files_for(self.platform)
            .map(|file| {
                let name = file.remote_name(&voice);
                let url = self.base_url.join(&name).map_err(|e| CompanionError::Download {
                    artifact: kind,
                    message: format!("bad file name {name}: {e}"),
                })?;
                let local = self.models_dir.join(file.local);
                let (dest, extract_into) = if file.archive {
                    (self.models_dir.join(&name), Some(local))
                } else {
                    (local, None)
                };
                Ok(PlannedFile {
                    url: url.to_string(),
                    dest,
                    extract_into,
                    weight: u64::from(file.weight),
                })
            })
            .collect()
    }

    fn remove_files(&self, kind: ArtifactKind) {
        let voice = self.voice();
        let desc = self.descriptor(kind);
        let mut paths = vec![desc.validity.primary_path(&self.models_dir)];
        for file in desc.files {
            let local = self.models_dir.join(file.local);
            paths.push(download::part_path(&local));
            paths.push(local);
            if file.archive {
                let archive = self.models_dir.join(file.remote_name(&voice));
                paths.push(download::part_path(&archive));
                paths.push(archive);
            }
        }
        for path in paths {
            if let Err(e) = remove_path(&path) {
                warn!(path = %path.display(), error = %e, "could not remove artifact file");
            }
        }
    }

    fn validation_error(&self, kind: ArtifactKind, result: IntegrityResult) -> CompanionError {
        let message = format!("downloaded artifact is {result}");
        if self.descriptor(kind).files.iter().any(|f| f.archive) {
            CompanionError::Extraction {
                artifact: kind,
                message,
            }
        } else {
            CompanionError::Download {
                artifact: kind,
                message,
            }
        }
    }
}

/// One file of a download, resolved to URLs and local paths.
#[derive(Debug, Clone)]
struct PlannedFile {
    url: String,
    dest: PathBuf,
    extract_into: Option<PathBuf>,
    weight: u64,
}

/// Units per weight point when folding byte progress into one percentage.
const PROGRESS_SCALE: u64 = 10_000;

fn run_download(
    kind: ArtifactKind,
    plan: &[PlannedFile],
    states: &StateMap,
    progress: &Option<ProgressCallback>,
) -> Result<()> {
    let total = plan.iter().map(|f| f.weight).sum::<u64>().max(1) * PROGRESS_SCALE;
    let mut completed = 0u64;
    let mut throttle = PercentThrottle::default();
    let mut report = |done: u64, throttle: &mut PercentThrottle| {
        if let Some(percent) = throttle.update(done, total) {
            update_state(states, kind, |s| s.download_progress_percent = percent);
            emit(
                progress,
                ProgressEvent::DownloadProgress {
                    artifact: kind,
                    percent,
                },
            );
        }
    };

    for file in plan {
        // Stale copies from an earlier attempt.
        let stale = [Some(&file.dest), file.extract_into.as_ref()];
        for path in stale.into_iter().flatten() {
            remove_path(path)?;
        }

        let share = file.weight * PROGRESS_SCALE;
        fetch(&file.url, &file.dest, &mut |bytes, len| {
            if let Some(len) = len.filter(|&l| l > 0) {
                let within = share * bytes.min(len) / len;
                report(completed + within, &mut throttle);
            }
        })
        .map_err(|e| fetch_error(kind, &file.url, e))?;
        completed += share;
        report(completed, &mut throttle);

        if let Some(into) = &file.extract_into {
            emit(progress, ProgressEvent::Extracting { artifact: kind });
            extract_zip(&file.dest, into).map_err(|message| CompanionError::Extraction {
                artifact: kind,
                message,
            })?;
            remove_path(&file.dest)?;
        }
    }
    Ok(())
}

fn fetch_error(kind: ArtifactKind, url: &str, err: FetchError) -> CompanionError {
    CompanionError::Download {
        artifact: kind,
        message: format!("{url}: {err}"),
    }
}

fn update_state(states: &StateMap, kind: ArtifactKind, f: impl FnOnce(&mut ModelAssetState)) {
    if let Ok(mut states) = states.lock() {
        f(states.entry(kind).or_default());
    }
}

fn emit(progress: &Option<ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = progress {
        cb(event);
    }
}


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::testing::{FakeEngines, tiny_llm};
    use super::*;
    use std::sync::atomic::Ordering;

    fn manager(dir: &Path, factory: Arc<FakeEngines>) -> ModelAssetManager {
        let config = ModelConfig {
            models_dir: dir.to_path_buf(),
            base_url: "http://127.0.0.1:9/models".into(),
        };
        ModelAssetManager::new(&config, "bf_emma", factory)
            .unwrap()
            .with_platform(TargetPlatform::Other)
            .with_descriptor(tiny_llm())
    }

    #[test]
    fn fresh_directory_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), Arc::default());
        for (_, result) in m.check_all() {
            assert_eq!(result, IntegrityResult::Missing);
        }
        assert_eq!(m.state(ArtifactKind::Llm).phase(), AssetPhase::Missing);
    }

    #[test]
    fn undersized_file_is_corrupt_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"short").unwrap();
        let m = manager(dir.path(), Arc::default());
        assert_eq!(m.check(ArtifactKind::Llm), IntegrityResult::Corrupt);
        let s = m.state(ArtifactKind::Llm);
        assert!(s.exists_on_disk);
        assert!(!s.size_valid);
    }

    #[tokio::test]
    async fn load_requires_a_valid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEngines::default());
        let m = manager(dir.path(), factory.clone());
        let err = m.load(ArtifactKind::Llm).await.err().unwrap();
        assert!(matches!(err, CompanionError::Load { .. }));
        assert_eq!(factory.llm_loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_failure_keeps_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), [7u8; 64]).unwrap();
        let factory = Arc::new(FakeEngines {
            fail_llm: true,
            ..FakeEngines::default()
        });
        let m = manager(dir.path(), factory);
        assert!(m.try_load(ArtifactKind::Llm).await.is_none());
        let s = m.state(ArtifactKind::Llm);
        assert!(s.exists_on_disk && s.size_valid);
        assert!(!s.is_loaded_in_memory);
        assert_eq!(s.phase(), AssetPhase::Present);
    }

    #[tokio::test]
    async fn reload_replaces_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), [7u8; 64]).unwrap();
        let factory = Arc::new(FakeEngines::default());
        let m = manager(dir.path(), factory.clone());

        let LoadedSession::Language(first) = m.load(ArtifactKind::Llm).await.unwrap() else {
            panic!("expected a language session");
        };
        let LoadedSession::Language(second) = m.load(ArtifactKind::Llm).await.unwrap() else {
            panic!("expected a language session");
        };
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&m.inference().unwrap(), &second));
        assert_eq!(factory.llm_loads.load(Ordering::SeqCst), 2);
        assert_eq!(m.state(ArtifactKind::Llm).phase(), AssetPhase::Loaded);

        m.release(ArtifactKind::Llm);
        assert!(m.inference().is_none());
        assert_eq!(m.state(ArtifactKind::Llm).phase(), AssetPhase::Present);
    }

    #[tokio::test]
    async fn voice_bundle_load_marks_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("tts_models");
        std::fs::create_dir_all(&bundle).unwrap();
        for name in ["kokoro.onnx", "tokenizer.json", "bf_emma.bin"] {
            std::fs::write(bundle.join(name), b"x").unwrap();
        }
        let m = manager(dir.path(), Arc::default());
        assert!(m.voice_model_dir().is_none());
        let LoadedSession::Voice(path) = m.load(ArtifactKind::Tts).await.unwrap() else {
            panic!("expected a voice session");
        };
        assert_eq!(path, bundle);
        assert_eq!(m.voice_model_dir(), Some(bundle));
    }

    #[test]
    fn invalidate_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("tts_models");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("kokoro.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("kokoro-bf_emma.zip.part"), b"partial").unwrap();

        let m = manager(dir.path(), Arc::default());
        m.invalidate(ArtifactKind::Tts);
        assert!(!bundle.exists());
        assert!(!dir.path().join("kokoro-bf_emma.zip.part").exists());
        assert_eq!(m.state(ArtifactKind::Tts).phase(), AssetPhase::Missing);
    }

    #[test]
    fn plan_resolves_urls_against_base() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), Arc::default()).with_platform(TargetPlatform::Ios);
        let plan = m.plan(ArtifactKind::Stt).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].url, "http://127.0.0.1:9/models/ggml-base.bin");
        assert_eq!(plan[0].dest, dir.path().join("ggml-base.en.bin"));
        assert!(plan[0].extract_into.is_none());
        assert_eq!(
            plan[1].extract_into.as_deref(),
            Some(dir.path().join("ggml-base-encoder.mlmodelc").as_path())
        );

        let tts = m.plan(ArtifactKind::Tts).unwrap();
        assert_eq!(tts[0].url, "http://127.0.0.1:9/models/kokoro-bf_emma.zip");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolvable_url_does_not_leave_the_artifact_busy() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), Arc::default());
        m.set_voice("http://[");

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Box::new(move |e| sink.lock().unwrap().push(e));
        let err = m.download(ArtifactKind::Tts, Some(callback)).await.unwrap_err();
        assert!(matches!(err, CompanionError::Download { .. }), "{err:?}");
        assert!(!m.state(ArtifactKind::Tts).is_downloading);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [ProgressEvent::Error { .. }]
        ));

        // Nothing listens on port 9, so the retry fails in transfer instead.
        m.set_voice("bf_emma");
        let err = m.download(ArtifactKind::Tts, None).await.unwrap_err();
        assert!(!matches!(err, CompanionError::Busy(_)), "{err:?}");
        assert!(!m.state(ArtifactKind::Tts).is_downloading);
    }
}
