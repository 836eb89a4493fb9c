//! SAM: an offline conversational companion.
//!
//! A user talks to a local language model by voice or text. Replies are
//! spoken by a local speech synthesizer and the user's speech is transcribed
//! by a local recognizer. The only network traffic is the one-time fetch of
//! the three model artifacts.
//!
//! # Architecture
//!
//! - **Models** ([`models`]): artifact descriptors, integrity checks,
//!   downloads and engine loading
//! - **Store** ([`store`]): SQLite message log and profile
//! - **LLM** ([`llm`]): single-flight streaming completion via `mistralrs`
//! - **Voice** ([`voice`]): whisper recognition from `cpal` capture, Kokoro
//!   synthesis played through `cpal`
//! - **Pipeline** ([`pipeline`]): the turn orchestrator that owns the log

// Fail early with a clear message when the metal feature is enabled but the
// Metal Toolchain is not installed. Without this, mistralrs panics deep in a
// build script with an opaque error.
#[cfg(missing_metal_toolchain)]
compile_error!(
    "The `metal` feature requires Apple's Metal Toolchain. Install it with:\n\n    \
     xcodebuild -downloadComponent MetalToolchain\n\n\
     This is a one-time ~700 MB download."
);

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod message;
pub mod models;
pub mod permissions;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod runtime;
pub mod session;
pub mod startup;
pub mod store;
pub mod voice;

pub use config::CompanionConfig;
pub use error::{CompanionError, Result};
pub use message::{Message, Role};
pub use pipeline::{TurnOrchestrator, TurnOutcome};
pub use progress::{ProgressCallback, ProgressEvent};
pub use runtime::RuntimeEvent;
