pub mod loader;
pub mod schema;

pub use loader::{
    load_config, load_config_from_file, ConfigFormat, ResolvedConfig, API_KEY_ENV_VARS,
};
pub use schema::{LivelineConfig, ServerSettings, SessionSettings, UpstreamSettings};
