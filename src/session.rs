//! Session context: the profile and the settings derived from it.
//!
//! Built once at startup and shared by handle with the orchestrator and the
//! asset manager, so nothing has to look up "the current user" ambiently.

use crate::config::CompanionConfig;
use crate::profile::{CompanionVoice, UserProfile, persona_prompt};
use crate::voice::RecognitionOptions;
use std::sync::RwLock;

pub struct SessionContext {
    config: CompanionConfig,
    profile: RwLock<UserProfile>,
}

impl SessionContext {
    pub fn new(config: CompanionConfig, profile: UserProfile) -> Self {
        Self {
            config,
            profile: RwLock::new(profile),
        }
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    pub fn profile(&self) -> UserProfile {
        self.profile
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Replace the profile, returning the previous one.
    pub fn set_profile(&self, profile: UserProfile) -> UserProfile {
        match self.profile.write() {
            Ok(mut current) => std::mem::replace(&mut *current, profile),
            Err(_) => UserProfile::default(),
        }
    }

    pub fn voice(&self) -> CompanionVoice {
        self.profile().voice()
    }

    /// The persona message that opens every prompt window.
    pub fn system_prompt(&self) -> String {
        persona_prompt(&self.config.conversation.assistant_name, &self.profile())
    }

    /// Recognition settings: locale follows the companion accent, the
    /// silence window comes from `[stt]`.
    pub fn recognition_options(&self) -> RecognitionOptions {
        RecognitionOptions {
            locale: self.voice().locale().to_owned(),
            interim_results: true,
            silence_window: self.config.stt.silence_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    #[test]
    fn options_follow_accent_and_config() {
        let mut config = CompanionConfig::default();
        config.stt.silence_timeout_ms = 1500;
        let ctx = SessionContext::new(
            config,
            UserProfile::new("Ada", "witty", "calm", "male", "uk"),
        );
        let opts = ctx.recognition_options();
        assert_eq!(opts.locale, "en-GB");
        assert_eq!(opts.silence_window, Duration::from_millis(1500));
        assert_eq!(ctx.voice(), CompanionVoice::UkMale);
    }

    #[test]
    fn set_profile_returns_previous_and_updates_prompt() {
        let ctx = SessionContext::new(CompanionConfig::default(), UserProfile::default());
        let previous = ctx.set_profile(UserProfile::new("Bo", "kind", "curious", "female", "us"));
        assert_eq!(previous, UserProfile::default());
        assert!(ctx.system_prompt().contains("a user - Bo."));
    }
}
