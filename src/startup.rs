//! App-start sequence: check every artifact, load what is present, and
//! optionally fetch what is missing.
//!
//! Nothing here fails the whole startup. Each artifact gets its own status
//! so the presentation layer can say exactly which one needs attention.

use crate::error::Result;
use crate::models::{ArtifactKind, IntegrityResult, ModelAssetManager};
use crate::progress::{ProgressCallback, ProgressEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared progress sink, forwarded into one callback per artifact.
pub type SharedProgress = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// What [`prepare`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub statuses: Vec<(ArtifactKind, IntegrityResult)>,
    /// Artifacts whose engine loaded.
    pub loaded: Vec<ArtifactKind>,
}

impl StartupReport {
    /// Artifacts that are absent or failed validation.
    pub fn needs_download(&self) -> Vec<ArtifactKind> {
        self.statuses
            .iter()
            .filter(|(_, r)| *r != IntegrityResult::Ok)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Every artifact is present and loaded.
    pub fn is_ready(&self) -> bool {
        self.needs_download().is_empty() && self.loaded.len() == self.statuses.len()
    }

    /// One user-facing line per artifact.
    pub fn messages(&self) -> Vec<String> {
        self.statuses
            .iter()
            .map(|(kind, result)| status_message(*kind, *result))
            .collect()
    }
}

/// User-facing status line for one artifact.
pub fn status_message(kind: ArtifactKind, result: IntegrityResult) -> String {
    match result {
        IntegrityResult::Ok => format!("The {kind} is ready."),
        IntegrityResult::Missing => format!("The {kind} has not been downloaded yet."),
        IntegrityResult::Corrupt => {
            format!("The {kind} appears to be corrupted and must be downloaded again.")
        }
    }
}

/// Check all artifacts and load the ones that are present.
pub async fn prepare(assets: &ModelAssetManager, progress: Option<&SharedProgress>) -> StartupReport {
    let statuses = assets.check_all();
    for (kind, result) in &statuses {
        match result {
            IntegrityResult::Ok => info!(artifact = %kind, "artifact present"),
            other => warn!(artifact = %kind, status = %other, "artifact unavailable"),
        }
    }

    let mut loaded = Vec::new();
    for (kind, result) in &statuses {
        if *result == IntegrityResult::Ok && load_with_progress(assets, *kind, progress).await {
            loaded.push(*kind);
        }
    }
    StartupReport { statuses, loaded }
}

/// Download every artifact the report flagged, then load it.
///
/// # Errors
///
/// Stops at the first download error; artifacts fetched before it stay.
pub async fn download_missing(
    assets: &ModelAssetManager,
    report: &StartupReport,
    progress: Option<&SharedProgress>,
) -> Result<StartupReport> {
    for kind in report.needs_download() {
        assets.download(kind, progress.map(forward)).await?;
    }
    Ok(prepare(assets, progress).await)
}

async fn load_with_progress(
    assets: &ModelAssetManager,
    kind: ArtifactKind,
    progress: Option<&SharedProgress>,
) -> bool {
    if let Some(cb) = progress {
        cb(ProgressEvent::LoadStarted { artifact: kind });
    }
    let started = Instant::now();
    match assets.load(kind).await {
        Ok(_) => {
            if let Some(cb) = progress {
                cb(ProgressEvent::LoadComplete {
                    artifact: kind,
                    duration_secs: started.elapsed().as_secs_f64(),
                });
            }
            true
        }
        Err(e) => {
            warn!(artifact = %kind, error = %e, "load failed at startup");
            if let Some(cb) = progress {
                cb(ProgressEvent::Error {
                    artifact: kind,
                    message: e.to_string(),
                });
            }
            false
        }
    }
}

fn forward(shared: &SharedProgress) -> ProgressCallback {
    let shared = Arc::clone(shared);
    Box::new(move |event| shared(event))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::ModelConfig;
    use crate::models::TargetPlatform;
    use crate::models::testing::{FakeEngines, tiny_llm};
    use std::sync::Mutex;

    fn manager(dir: &std::path::Path) -> ModelAssetManager {
        let config = ModelConfig {
            models_dir: dir.to_path_buf(),
            base_url: "http://127.0.0.1:9/".into(),
        };
        ModelAssetManager::new(&config, "af_heart", Arc::new(FakeEngines::default()))
            .unwrap()
            .with_platform(TargetPlatform::Other)
            .with_descriptor(tiny_llm())
    }

    #[tokio::test]
    async fn reports_each_artifact_separately() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), [1u8; 64]).unwrap();
        std::fs::write(dir.path().join("ggml-base.en.bin"), b"truncated").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: SharedProgress = {
            let events = events.clone();
            Arc::new(move |e| events.lock().unwrap().push(e))
        };
        let report = prepare(&manager(dir.path()), Some(&sink)).await;

        assert_eq!(
            report.statuses,
            vec![
                (ArtifactKind::Llm, IntegrityResult::Ok),
                (ArtifactKind::Tts, IntegrityResult::Missing),
                (ArtifactKind::Stt, IntegrityResult::Corrupt),
            ]
        );
        assert_eq!(report.loaded, vec![ArtifactKind::Llm]);
        assert_eq!(report.needs_download(), vec![ArtifactKind::Tts, ArtifactKind::Stt]);
        assert!(!report.is_ready());

        let messages = report.messages();
        assert!(messages[1].contains("not been downloaded"));
        assert!(messages[2].contains("corrupted"));

        let events = events.lock().unwrap();
        assert!(matches!(events[0], ProgressEvent::LoadStarted { artifact: ArtifactKind::Llm }));
        assert!(matches!(events[1], ProgressEvent::LoadComplete { artifact: ArtifactKind::Llm, .. }));
    }
}
