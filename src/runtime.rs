//! Events and flags the orchestrator publishes to the presentation layer.
//!
//! The message log is observed as a stream of upserts and removals keyed by
//! log index; flags are published as whole snapshots whenever one changes.

use crate::error::Presentation;
use crate::message::Message;
use crate::models::ArtifactKind;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Orchestrator to presentation notifications.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The message at `index` was appended or replaced.
    MessageUpserted { index: usize, message: Message },
    /// The message at `index` was removed; later indices shift down.
    MessageRemoved { index: usize },
    /// The whole log was replaced (restore from store, bulk flag changes).
    LogReset { messages: Vec<Message> },
    Flags(FlagSnapshot),
    /// A caught error or status line for the user.
    Notice {
        presentation: Presentation,
        message: String,
    },
    DownloadProgress { artifact: ArtifactKind, percent: u8 },
}

/// Point-in-time copy of [`RuntimeFlags`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub is_generating: bool,
    pub is_listening: bool,
    pub is_speaking: bool,
    pub is_model_ready: bool,
    pub talking_mode: bool,
    pub download_progress: u8,
}

/// Observable boolean state of the turn loop.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    pub(crate) generating: AtomicBool,
    pub(crate) listening: AtomicBool,
    pub(crate) speaking: AtomicBool,
    pub(crate) model_ready: AtomicBool,
    pub(crate) talking_mode: AtomicBool,
    pub(crate) download_progress: AtomicU8,
}

impl RuntimeFlags {
    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            is_generating: self.generating.load(Ordering::Acquire),
            is_listening: self.listening.load(Ordering::Acquire),
            is_speaking: self.speaking.load(Ordering::Acquire),
            is_model_ready: self.model_ready.load(Ordering::Acquire),
            talking_mode: self.talking_mode.load(Ordering::Acquire),
            download_progress: self.download_progress.load(Ordering::Acquire),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    pub fn talking_mode(&self) -> bool {
        self.talking_mode.load(Ordering::Acquire)
    }
}
