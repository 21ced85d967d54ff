use serde::{Deserialize, Serialize};

use crate::protocol::ConfigPayload;

/// Configuration a client supplies for its session.
///
/// Set once from the client's first frame and never changed afterwards.
/// The bridge passes it to the upstream service unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub system_prompt: String,

    /// Prebuilt voice name. When present the upstream is also asked for audio.
    #[serde(default)]
    pub voice: Option<String>,
}

impl SessionConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

impl From<ConfigPayload> for SessionConfig {
    fn from(payload: ConfigPayload) -> Self {
        Self {
            system_prompt: payload.system_prompt,
            voice: payload
                .voice
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}
