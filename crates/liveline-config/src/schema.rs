use serde::{Deserialize, Serialize};

/// Main liveline configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `liveline.jsonc` - JSON with comments
/// 2. `liveline.json` - Standard JSON
/// 3. `liveline.yml` / `liveline.yaml` - YAML format
///
/// Also checks hidden variants (`.liveline.*`) and `~/.config/liveline/` for global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivelineConfig {
    /// Listener settings for the client-facing WebSocket server
    #[serde(default)]
    pub server: ServerSettings,

    /// Upstream streaming service settings
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Per-session timing settings
    #[serde(default)]
    pub session: SessionSettings,
}

// ============================================================================
// Server Configuration
// ============================================================================

/// Client-facing server settings
///
/// # Example
///
/// ```yaml
/// server:
///   host: 0.0.0.0
///   port: 8000
///   allowed_origins:
///     - http://localhost:3000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind the server
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to bind the server
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Origins allowed by the CORS layer. Empty means any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

// ============================================================================
// Upstream Configuration
// ============================================================================

/// Upstream streaming endpoint settings
///
/// # Example
///
/// ```yaml
/// upstream:
///   model: models/gemini-2.0-flash-exp
///   api_key: ${GOOGLE_API_KEY}
///   connect_timeout_secs: 10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// WebSocket URL of the bidirectional streaming endpoint
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Model identifier sent in the setup frame
    #[serde(default = "default_upstream_model")]
    pub model: String,

    /// API key appended to the URL as `?key=`. Falls back to
    /// `GOOGLE_API_KEY` / `GEMINI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Timeout for opening the upstream WebSocket
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for the setup acknowledgement
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            model: default_upstream_model(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_upstream_url() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string()
}

fn default_upstream_model() -> String {
    "models/gemini-2.0-flash-exp".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Per-session timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// How long a new connection may take to send its config frame
    #[serde(default = "default_config_timeout")]
    pub config_timeout_secs: u64,

    /// Upper bound on waiting for the second pump once the first has exited
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            config_timeout_secs: default_config_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

fn default_config_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    2000
}
