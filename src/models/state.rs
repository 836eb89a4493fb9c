//! Per-artifact lifecycle state.

use serde::Serialize;

/// Observable state of one artifact.
///
/// A load failure leaves `exists_on_disk` untouched so "missing" and
/// "present but unloadable" stay distinguishable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelAssetState {
    pub exists_on_disk: bool,
    /// Coarse corruption check (minimum size / directory shape).
    pub size_valid: bool,
    pub is_downloading: bool,
    pub download_progress_percent: u8,
    pub is_loaded_in_memory: bool,
}

/// Position in the `Missing -> Downloading -> Present -> Loaded` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssetPhase {
    Missing,
    Downloading,
    Present,
    Loaded,
}

impl ModelAssetState {
    /// Derived phase.
    pub fn phase(&self) -> AssetPhase {
        if self.is_downloading {
            AssetPhase::Downloading
        } else if self.is_loaded_in_memory {
            AssetPhase::Loaded
        } else if self.is_usable() {
            AssetPhase::Present
        } else {
            AssetPhase::Missing
        }
    }

    /// On disk and valid, so a load may be attempted.
    pub fn is_usable(&self) -> bool {
        self.exists_on_disk && self.size_valid
    }
}
