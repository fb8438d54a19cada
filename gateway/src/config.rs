//! Operator configuration, loaded once at startup from the environment and
//! passed explicitly to components.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use voicebox_doubao::{SessionParams, UpstreamConfig};

/// Allowed range for the upstream receive timeout, in seconds.
pub const RECV_TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 10..=120;

/// Error type for caller-supplied configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Input modality for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMod {
    Audio,
    Text,
    AudioFile,
}

impl InputMod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMod::Audio => "audio",
            InputMod::Text => "text",
            InputMod::AudioFile => "audio_file",
        }
    }

    fn parse(s: &str) -> Option<InputMod> {
        match s {
            "audio" => Some(InputMod::Audio),
            "text" => Some(InputMod::Text),
            "audio_file" => Some(InputMod::AudioFile),
            _ => None,
        }
    }
}

impl Default for InputMod {
    fn default() -> Self {
        InputMod::Audio
    }
}

/// Session parameters a caller may choose when minting a session. Unknown
/// fields are rejected; omitted fields fill from operator defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mod: Option<InputMod>,
}

impl SessionConfig {
    /// Validates the value ranges. Shape errors are already rejected by
    /// deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.recv_timeout {
            if !RECV_TIMEOUT_RANGE.contains(&t) {
                return Err(ConfigError::Invalid(format!(
                    "recv_timeout must be within 10-120, got {}",
                    t
                )));
            }
        }
        Ok(())
    }
}

/// Operator defaults for session parameters.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub bot_name: String,
    pub speaker: String,
    pub recv_timeout: u32,
    pub input_mod: InputMod,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_audio_format: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            bot_name: String::new(),
            speaker: String::new(),
            recv_timeout: 60,
            input_mod: InputMod::Audio,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            output_audio_format: "pcm".to_string(),
        }
    }
}

/// Gateway configuration. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub upstream: UpstreamConfig,
    pub defaults: SessionDefaults,
    /// Base directory for the per-session journal files.
    pub history_dir: PathBuf,
    pub save_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            upstream: UpstreamConfig::default(),
            defaults: SessionDefaults::default(),
            history_dir: PathBuf::from("./history"),
            save_history: true,
        }
    }
}

impl Config {
    /// Loads configuration from the environment. Missing or unparsable
    /// values fall back to defaults; `recv_timeout` is clamped to its range.
    pub fn from_env() -> Config {
        let mut cfg = Config::default();

        cfg.host = env_str("HOST").unwrap_or(cfg.host);
        cfg.port = env_parse("PORT").unwrap_or(cfg.port);

        if let Some(url) = env_str("DOUBAO_REALTIME_BASE_URL") {
            cfg.upstream.base_url = url;
        }
        cfg.upstream.app_id = env_str("DOUBAO_APP_ID").unwrap_or_default();
        cfg.upstream.access_key = env_str("DOUBAO_ACCESS_KEY").unwrap_or_default();
        cfg.upstream.resource_id = env_str("DOUBAO_RESOURCE_ID").unwrap_or_default();
        cfg.upstream.app_key = env_str("DOUBAO_APP_KEY").unwrap_or_default();

        if let Some(name) = env_str("DOUBAO_BOT_NAME") {
            cfg.defaults.bot_name = name;
        }
        if let Some(speaker) = env_str("DOUBAO_SPEAKER") {
            cfg.defaults.speaker = speaker;
        }
        if let Some(t) = env_parse::<u32>("DOUBAO_RECV_TIMEOUT") {
            cfg.defaults.recv_timeout =
                t.clamp(*RECV_TIMEOUT_RANGE.start(), *RECV_TIMEOUT_RANGE.end());
        }
        if let Some(m) = env_str("DOUBAO_INPUT_MOD").and_then(|s| InputMod::parse(&s)) {
            cfg.defaults.input_mod = m;
        }
        if let Some(rate) = env_parse("DOUBAO_INPUT_SAMPLE_RATE") {
            cfg.defaults.input_sample_rate = rate;
        }
        if let Some(rate) = env_parse("DOUBAO_OUTPUT_SAMPLE_RATE") {
            cfg.defaults.output_sample_rate = rate;
        }
        if let Some(format) = env_str("DOUBAO_OUTPUT_AUDIO_FORMAT") {
            cfg.defaults.output_audio_format = format;
        }

        if let Some(dir) = env_str("HISTORY_DIR") {
            cfg.history_dir = PathBuf::from(dir);
        }
        if let Some(save) = env_str("SAVE_HISTORY") {
            cfg.save_history = !matches!(save.as_str(), "0" | "false" | "no" | "off");
        }

        cfg
    }

    /// Resolves a caller's session config against the operator defaults.
    pub fn session_params(&self, config: &SessionConfig) -> SessionParams {
        let recv_timeout = config
            .recv_timeout
            .unwrap_or(self.defaults.recv_timeout)
            .clamp(*RECV_TIMEOUT_RANGE.start(), *RECV_TIMEOUT_RANGE.end());

        SessionParams {
            speaker: config
                .speaker
                .clone()
                .unwrap_or_else(|| self.defaults.speaker.clone()),
            bot_name: config
                .bot_name
                .clone()
                .unwrap_or_else(|| self.defaults.bot_name.clone()),
            system_role: config.system_role.clone().unwrap_or_default(),
            speaking_style: config.speaking_style.clone().unwrap_or_default(),
            city: config.city.clone(),
            recv_timeout,
            input_mod: config
                .input_mod
                .unwrap_or(self.defaults.input_mod)
                .as_str()
                .to_string(),
            output_format: self.defaults.output_audio_format.clone(),
            output_sample_rate: self.defaults.output_sample_rate,
        }
    }

    /// Handshake timeout override, mainly for tests.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Config {
        self.upstream.handshake_timeout = timeout;
        self
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}
