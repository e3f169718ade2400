use avatalk_core::capture::CaptureConfig;
use avatalk_core::coordinator::CoordinatorConfig;
use avatalk_core::renderer::RendererConfig;
use secrecy::SecretString;
use tracing::Level;

pub const DEFAULT_SIGNED_URL_ENDPOINT: &str =
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url";
pub const DEFAULT_CONVERSATION_URL: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub agent_id: String,
    pub signed_url_endpoint: String,
    pub xi_api_key: Option<SecretString>,
    /// Public agents connect to `conversation_url` without a signed URL.
    pub agent_public: bool,
    pub conversation_url: String,
    pub renderer_url: Option<String>,
    pub renderer_api_key: Option<SecretString>,
    pub renderer_face_id: String,
    pub renderer_video_surface: Option<String>,
    pub renderer_audio_surface: Option<String>,
    pub input_device: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let agent_id = std::env::var("AGENT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("AGENT_ID".to_string()))?;

        let signed_url_endpoint = std::env::var("SIGNED_URL_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_SIGNED_URL_ENDPOINT.to_string());
        let xi_api_key = std::env::var("XI_API_KEY").ok().map(SecretString::from);

        let agent_public = match std::env::var("AGENT_PUBLIC") {
            Ok(value) => parse_bool("AGENT_PUBLIC", &value)?,
            Err(_) => false,
        };
        let conversation_url = std::env::var("CONVERSATION_URL")
            .unwrap_or_else(|_| DEFAULT_CONVERSATION_URL.to_string());

        let renderer_url = std::env::var("RENDERER_URL").ok();
        let renderer_api_key = std::env::var("RENDERER_API_KEY").ok().map(SecretString::from);
        let renderer_face_id = std::env::var("RENDERER_FACE_ID").unwrap_or_default();
        let renderer_video_surface = std::env::var("RENDERER_VIDEO_SURFACE").ok();
        let renderer_audio_surface = std::env::var("RENDERER_AUDIO_SURFACE").ok();

        let input_device = std::env::var("INPUT_DEVICE").unwrap_or_else(|_| "default".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            agent_id,
            signed_url_endpoint,
            xi_api_key,
            agent_public,
            conversation_url,
            renderer_url,
            renderer_api_key,
            renderer_face_id,
            renderer_video_surface,
            renderer_audio_surface,
            input_device,
            log_level,
        })
    }

    /// Builds the coordinator settings for this configuration.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let renderer = RendererConfig {
            face_id: self.renderer_face_id.clone(),
            video_surface: self.renderer_video_surface.clone(),
            audio_surface: self.renderer_audio_surface.clone(),
            ..Default::default()
        };
        let mut config = CoordinatorConfig::new(self.agent_id.clone(), renderer);
        config.capture = CaptureConfig {
            device: self.input_device.clone(),
            ..Default::default()
        };
        config
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("'{}' is not a boolean", other),
        )),
    }
}
