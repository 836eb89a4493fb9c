//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution, which is
//! sandbox-transparent on macOS and iOS (container-relative paths).
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/sam/` | `~/.local/share/sam/` |
//! | Config | `~/Library/Application Support/sam/` | `~/.config/sam/` |
//! | Cache | `~/Library/Caches/sam/` | `~/.cache/sam/` |
//!
//! Overrides for tests and custom deployments:
//! - `SAM_DATA_DIR` overrides [`data_dir`]
//! - `SAM_CONFIG_DIR` overrides [`config_dir`]
//! - `SAM_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

/// Application data root (conversation database, downloaded models, logs).
#[must_use]
pub fn data_dir() -> PathBuf {
    resolve("SAM_DATA_DIR", dirs::data_dir(), "/tmp/sam-data")
}

/// Application config directory (`config.toml`).
#[must_use]
pub fn config_dir() -> PathBuf {
    resolve("SAM_CONFIG_DIR", dirs::config_dir(), "/tmp/sam-config")
}

/// Expendable cached data (partial downloads).
#[must_use]
pub fn cache_dir() -> PathBuf {
    resolve("SAM_CACHE_DIR", dirs::cache_dir(), "/tmp/sam-cache")
}

/// Model artifacts (`data_dir()/models/`).
///
/// Models live under the data dir rather than the cache dir because they are
/// large and the OS may purge caches under storage pressure.
#[must_use]
pub fn models_dir() -> PathBuf {
    data_dir().join("models")
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Conversation database (`data_dir()/chatSam.db`).
#[must_use]
pub fn database_file() -> PathBuf {
    data_dir().join("chatSam.db")
}

/// Config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

fn resolve(env_key: &str, base: Option<PathBuf>, fallback: &str) -> PathBuf {
    if let Some(override_dir) = std::env::var_os(env_key) {
        return PathBuf::from(override_dir);
    }
    base.map(|d| d.join("sam"))
        .unwrap_or_else(|| PathBuf::from(fallback))
}
