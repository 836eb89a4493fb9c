//! Microphone permission gate.
//!
//! The platform is asked at most once per process. A denial is terminal for
//! the session: later recognition attempts fail immediately without
//! re-prompting, and the user is pointed at system settings instead.

use crate::error::{CompanionError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Platform-reported microphone authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// The user has not been asked yet.
    Undetermined,
    Granted,
    Denied,
}

/// Platform hook for querying and requesting microphone access.
#[async_trait::async_trait]
pub trait MicrophonePermission: Send + Sync {
    fn status(&self) -> PermissionStatus;

    /// Show the platform prompt. Returns whether access was granted.
    async fn request(&self) -> bool;
}

/// Desktop hosts have no runtime microphone prompt; capture simply fails if
/// the OS blocks the device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPermission;

#[async_trait::async_trait]
impl MicrophonePermission for SystemPermission {
    fn status(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request(&self) -> bool {
        true
    }
}

/// Caches the first permission decision for the lifetime of the process.
pub struct PermissionGate {
    provider: Arc<dyn MicrophonePermission>,
    decided: tokio::sync::Mutex<Option<bool>>,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn MicrophonePermission>) -> Self {
        Self {
            provider,
            decided: tokio::sync::Mutex::new(None),
        }
    }

    /// Ensure microphone access, prompting only if the platform has never
    /// asked.
    ///
    /// # Errors
    ///
    /// [`CompanionError::PermissionDenied`] if access is refused now or was
    /// refused earlier in this session.
    pub async fn ensure_granted(&self) -> Result<()> {
        let mut decided = self.decided.lock().await;
        if let Some(granted) = *decided {
            return if granted {
                Ok(())
            } else {
                Err(CompanionError::PermissionDenied)
            };
        }

        let granted = match self.provider.status() {
            PermissionStatus::Granted => true,
            PermissionStatus::Denied => false,
            PermissionStatus::Undetermined => {
                info!("requesting microphone permission");
                self.provider.request().await
            }
        };
        *decided = Some(granted);

        if granted {
            Ok(())
        } else {
            warn!("microphone permission denied; voice input disabled for this session");
            Err(CompanionError::PermissionDenied)
        }
    }

    /// The cached decision, if one has been made.
    pub async fn decision(&self) -> Option<bool> {
        *self.decided.lock().await
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(Arc::new(SystemPermission))
    }
}
