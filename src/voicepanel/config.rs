//! Configuration for voicepanel.
//!
//! Provides the [`PanelConfig`] struct holding the arbitration tunables and the
//! persona table ([`AgentProfile`]) that agents are joined from. Users construct
//! it in code, optionally overlay environment variables with
//! [`PanelConfig::from_env`], or parse a JSON document with
//! [`PanelConfig::from_json`].
//!
//! # Example
//!
//! ```rust
//! use voicepanel::PanelConfig;
//!
//! // Defaults: MIN_CHARS = 3, context window = 6, Mark/Kevin/Lori panel
//! let config = PanelConfig::default();
//! assert_eq!(config.min_transcript_chars, 3);
//!
//! // Or tune it
//! let config = PanelConfig::default()
//!     .with_context_window(4)
//!     .with_rotation_seed(7);
//! assert_eq!(config.context_window, 4);
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Persona definition an agent is joined from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Agent identifier, also the key in `agent_order`.
    pub name: String,
    /// Voice preset handed to the realtime model.
    pub voice: String,
    /// Sampling temperature handed to the realtime model.
    pub temperature: f32,
    /// Persona system instructions.
    pub instructions: String,
}

impl AgentProfile {
    pub fn new(
        name: impl Into<String>,
        voice: impl Into<String>,
        temperature: f32,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            voice: voice.into(),
            temperature,
            instructions: instructions.into(),
        }
    }
}

/// Tunables for turn arbitration and agent joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Normalized transcripts shorter than this are dropped as noise.
    pub min_transcript_chars: usize,
    /// Number of founder utterances kept in a room's shared context.
    pub context_window: usize,
    /// TTL used when a [`TurnManager`](crate::turn_manager::TurnManager) coordinates commits.
    #[serde(with = "duration_secs")]
    pub turn_lock_ttl: Duration,
    /// Selects the external TurnManager backend when set.
    pub redis_url: Option<String>,
    /// Credential for the realtime model. Joining agents fails without it.
    pub model_api_key: Option<String>,
    /// Seed for each room's rotation RNG. `None` seeds from entropy.
    pub rotation_seed: Option<u64>,
    /// Transcripts equal to one of these (case-insensitive) are discarded before arbitration.
    pub noise_markers: Vec<String>,
    /// Instructions prepended to the context block on every committed reply.
    pub reply_preamble: String,
    /// Instructions for the one-shot opening greeting.
    pub greeting_instructions: String,
    /// Personas agents can be joined as.
    pub agents: Vec<AgentProfile>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            min_transcript_chars: 3,
            context_window: 6,
            turn_lock_ttl: Duration::from_secs(30),
            redis_url: None,
            model_api_key: None,
            rotation_seed: None,
            noise_markers: vec!["[noise]".into(), "(noise)".into(), "noise".into()],
            reply_preamble: "You are in a Shark Tank panel with other sharks. Keep your reply \
                             concise and directly continue the founder's pitch context."
                .into(),
            greeting_instructions: "Greet the founder briefly as the first shark to speak and \
                                    ask for a concise 30-second pitch."
                .into(),
            agents: default_profiles(),
        }
    }
}

impl PanelConfig {
    /// Build a config from defaults overlaid with environment variables.
    ///
    /// Recognised variables: `TURN_MIN_TRANSCRIPT_CHARS`, `TURN_CONTEXT_WINDOW`,
    /// `TURN_LOCK_TTL_SECS`, `REDIS_URL` and `GOOGLE_API_KEY`. Unparseable numbers
    /// are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_number("TURN_MIN_TRANSCRIPT_CHARS") {
            config.min_transcript_chars = value as usize;
        }
        if let Some(value) = env_number("TURN_CONTEXT_WINDOW") {
            config.context_window = value as usize;
        }
        match env_number("TURN_LOCK_TTL_SECS") {
            Some(0) => log::warn!("ignoring TURN_LOCK_TTL_SECS=0: turn claims need a TTL"),
            Some(value) => config.turn_lock_ttl = Duration::from_secs(value),
            None => {}
        }
        config.redis_url = non_empty_var("REDIS_URL");
        config.model_api_key = non_empty_var("GOOGLE_API_KEY");
        config
    }

    /// Parse a JSON config document. Missing fields take their defaults.
    ///
    /// ```rust
    /// use voicepanel::PanelConfig;
    ///
    /// let config = PanelConfig::from_json(r#"{"context_window": 2, "turn_lock_ttl": 5}"#).unwrap();
    /// assert_eq!(config.context_window, 2);
    /// assert_eq!(config.turn_lock_ttl.as_secs(), 5);
    /// assert_eq!(config.min_transcript_chars, 3);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_min_transcript_chars(mut self, chars: usize) -> Self {
        self.min_transcript_chars = chars;
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    pub fn with_turn_lock_ttl(mut self, ttl: Duration) -> Self {
        self.turn_lock_ttl = ttl;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_model_api_key(mut self, key: impl Into<String>) -> Self {
        self.model_api_key = Some(key.into());
        self
    }

    pub fn with_rotation_seed(mut self, seed: u64) -> Self {
        self.rotation_seed = Some(seed);
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentProfile>) -> Self {
        self.agents = agents;
        self
    }

    /// Look up a persona by agent name.
    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|profile| profile.name == name)
    }

    /// Names of the configured personas, in configuration order.
    pub fn default_agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|profile| profile.name.clone()).collect()
    }

    /// `true` when `text` is one of the configured noise markers.
    pub fn is_noise(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.noise_markers
            .iter()
            .any(|marker| marker.to_lowercase() == lowered)
    }
}

fn default_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new(
            "Mark",
            "Puck",
            0.6,
            "You are Mark Cuban from Shark Tank. You are bold, tech-focused, and look for scalability.",
        ),
        AgentProfile::new(
            "Kevin",
            "Puck",
            0.6,
            "You are Kevin O'Leary from Shark Tank. You are cynical, focused on royalties and margins.",
        ),
        AgentProfile::new(
            "Lori",
            "Kore",
            0.8,
            "You are Lori Greiner from Shark Tank. Queen of QVC. You look for hero products with mass-market appeal.",
        ),
    ]
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_number(key: &str) -> Option<u64> {
    let raw = non_empty_var(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a non-negative integer", key, raw);
            None
        }
    }
}

mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Zero is rejected; a claim that expires immediately can never be held.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match u64::deserialize(deserializer)? {
            0 => Err(de::Error::custom("turn_lock_ttl must be at least 1 second")),
            secs => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_panel_has_three_sharks_in_order() {
        let config = PanelConfig::default();
        assert_eq!(config.default_agent_names(), vec!["Mark", "Kevin", "Lori"]);
        assert_eq!(config.profile("Lori").map(|p| p.voice.as_str()), Some("Kore"));
        assert!(config.profile("Barbara").is_none());
    }

    #[test]
    fn noise_markers_match_case_insensitively() {
        let config = PanelConfig::default();
        assert!(config.is_noise("[NOISE]"));
        assert!(config.is_noise("Noise"));
        assert!(!config.is_noise("noisy market"));
    }

    #[test]
    fn json_overrides_keep_remaining_defaults() {
        let config = PanelConfig::from_json(
            r#"{"min_transcript_chars": 5, "agents": [{"name": "Robert", "voice": "Charon", "temperature": 0.5, "instructions": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(config.min_transcript_chars, 5);
        assert_eq!(config.context_window, 6);
        assert_eq!(config.default_agent_names(), vec!["Robert"]);
    }

    #[test]
    fn zero_turn_lock_ttl_is_rejected() {
        let err = PanelConfig::from_json(r#"{"turn_lock_ttl": 0}"#).unwrap_err();
        assert!(err.to_string().contains("turn_lock_ttl"));
        assert!(PanelConfig::from_json(r#"{"turn_lock_ttl": 1}"#).is_ok());
    }

    #[test]
    fn zero_turn_lock_ttl_from_env_keeps_default() {
        std::env::set_var("TURN_LOCK_TTL_SECS", "0");
        let config = PanelConfig::from_env();
        std::env::remove_var("TURN_LOCK_TTL_SECS");
        assert_eq!(config.turn_lock_ttl, Duration::from_secs(30));
    }
}
