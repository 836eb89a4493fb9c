//! User profile and the companion persona derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Onboarding answers stored in the single-row `user` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub trait1: String,
    pub trait2: String,
    /// Companion character, `"female"` or `"male"`.
    pub character: String,
    /// Companion accent, `"uk"` or `"us"`.
    pub accent: String,
}

impl UserProfile {
    pub fn new(
        name: impl Into<String>,
        trait1: impl Into<String>,
        trait2: impl Into<String>,
        character: impl Into<String>,
        accent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trait1: trait1.into(),
            trait2: trait2.into(),
            character: character.into(),
            accent: accent.into(),
        }
    }

    /// Voice implied by character and accent.
    pub fn voice(&self) -> CompanionVoice {
        CompanionVoice::from_profile(&self.character, &self.accent)
    }

    /// Display name, falling back to a neutral address when onboarding left
    /// it blank.
    pub fn display_name(&self) -> &str {
        let trimmed = self.name.trim();
        if trimmed.is_empty() { "the user" } else { trimmed }
    }
}

/// The four Kokoro voices the companion can speak with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompanionVoice {
    UkFemale,
    UkMale,
    UsFemale,
    UsMale,
}

impl CompanionVoice {
    /// Map free-form profile answers onto a voice. Unknown values fall back
    /// to the US female voice.
    pub fn from_profile(character: &str, accent: &str) -> Self {
        let male = character.trim().eq_ignore_ascii_case("male");
        let uk = matches!(
            accent.trim().to_ascii_lowercase().as_str(),
            "uk" | "gb" | "british" | "en-gb"
        );
        match (uk, male) {
            (true, false) => Self::UkFemale,
            (true, true) => Self::UkMale,
            (false, false) => Self::UsFemale,
            (false, true) => Self::UsMale,
        }
    }

    /// Voice identifier inside the Kokoro bundle, also used to build the
    /// bundle's download name.
    pub fn id(self) -> &'static str {
        match self {
            Self::UkFemale => "bf_emma",
            Self::UkMale => "bm_george",
            Self::UsFemale => "af_heart",
            Self::UsMale => "am_michael",
        }
    }

    pub fn is_british(self) -> bool {
        matches!(self, Self::UkFemale | Self::UkMale)
    }

    /// Locale handed to the speech recognizer.
    pub fn locale(self) -> &'static str {
        if self.is_british() { "en-GB" } else { "en-US" }
    }
}

impl fmt::Display for CompanionVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Persona instruction sent as the first message of every prompt window.
pub fn persona_prompt(assistant_name: &str, profile: &UserProfile) -> String {
    let name = profile.display_name();
    let character = if profile.character.trim().is_empty() {
        "friendly".to_owned()
    } else {
        profile.character.trim().to_owned()
    };
    let traits = match (profile.trait1.trim(), profile.trait2.trim()) {
        ("", "") => "kind and curious".to_owned(),
        (a, "") | ("", a) => a.to_owned(),
        (a, b) => format!("{a} and {b}"),
    };
    format!(
        "You are {assistant_name}, a {traits} {character} companion. \
         This is a conversation with a user - {name}. \
         Please respond clearly and concisely, using no more than 3 sentences per answer. \
         Do not repeat or paraphrase {name}'s input. \
         Do not use stage directions, emojis or markdown."
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn voice_mapping_covers_all_combinations() {
        assert_eq!(CompanionVoice::from_profile("female", "uk").id(), "bf_emma");
        assert_eq!(CompanionVoice::from_profile("Male", "UK").id(), "bm_george");
        assert_eq!(CompanionVoice::from_profile("female", "us").id(), "af_heart");
        assert_eq!(CompanionVoice::from_profile("male", "us").id(), "am_michael");
        assert_eq!(CompanionVoice::from_profile("", ""), CompanionVoice::UsFemale);
    }

    #[test]
    fn persona_mentions_name_and_traits() {
        let p = UserProfile::new("Ada", "witty", "calm", "female", "uk");
        let prompt = persona_prompt("SAM", &p);
        assert!(prompt.starts_with("You are SAM, a witty and calm female companion."));
        assert!(prompt.contains("conversation with a user - Ada."));
        assert!(prompt.contains("Do not repeat or paraphrase Ada's input."));
        assert!(prompt.contains("no more than 3 sentences"));
    }

    #[test]
    fn persona_tolerates_blank_profile() {
        let prompt = persona_prompt("SAM", &UserProfile::default());
        assert!(prompt.contains("kind and curious friendly companion"));
        assert!(prompt.contains("the user"));
    }
}
