//! Progress event types for artifact download and engine loading.
//!
//! Callback-based reporting decouples the asset manager from presentation
//! (terminal progress bar, host events, or a UI binding).

use crate::models::ArtifactKind;

/// Progress events emitted during artifact download and loading.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A download has started.
    DownloadStarted { artifact: ArtifactKind },

    /// Coarse overall download progress for one artifact (0 to 100).
    DownloadProgress { artifact: ArtifactKind, percent: u8 },

    /// A downloaded archive is being decompressed.
    Extracting { artifact: ArtifactKind },

    /// The artifact is on disk and passed the size check.
    DownloadComplete { artifact: ArtifactKind },

    /// Engine loading has started.
    LoadStarted { artifact: ArtifactKind },

    /// Engine loading completed.
    LoadComplete {
        artifact: ArtifactKind,
        /// Time taken to load in seconds.
        duration_secs: f64,
    },

    /// An error occurred while acquiring or loading an artifact.
    Error {
        artifact: ArtifactKind,
        message: String,
    },
}

/// Callback type for receiving progress events.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Converts byte counts into whole-percent updates, emitting only when the
/// integer percentage advances.
#[derive(Debug, Default)]
pub struct PercentThrottle {
    last: Option<u8>,
}

impl PercentThrottle {
    /// Returns `Some(percent)` when `done / total` crosses a new whole percent.
    ///
    /// `total == 0` (unknown length) never reports.
    pub fn update(&mut self, done: u64, total: u64) -> Option<u8> {
        if total == 0 {
            return None;
        }
        let percent = ((done.min(total) as u128 * 100) / total as u128) as u8;
        match self.last {
            Some(prev) if prev >= percent => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn throttle_reports_each_percent_once() {
        let mut t = PercentThrottle::default();
        assert_eq!(t.update(0, 1000), Some(0));
        assert_eq!(t.update(5, 1000), None);
        assert_eq!(t.update(10, 1000), Some(1));
        assert_eq!(t.update(11, 1000), None);
        assert_eq!(t.update(1000, 1000), Some(100));
        assert_eq!(t.update(1000, 1000), None);
    }

    #[test]
    fn throttle_ignores_unknown_length() {
        let mut t = PercentThrottle::default();
        assert_eq!(t.update(10, 0), None);
    }

    #[test]
    fn throttle_clamps_overshoot() {
        let mut t = PercentThrottle::default();
        assert_eq!(t.update(2000, 1000), Some(100));
    }

    #[test]
    fn callback_receives_events() {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cb: ProgressCallback = Box::new(move |e| sink.lock().unwrap().push(e));

        cb(ProgressEvent::DownloadStarted {
            artifact: ArtifactKind::Llm,
        });
        cb(ProgressEvent::DownloadProgress {
            artifact: ArtifactKind::Llm,
            percent: 42,
        });

        let got = events.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[1],
            ProgressEvent::DownloadProgress {
                artifact: ArtifactKind::Llm,
                percent: 42
            }
        );
    }
}
