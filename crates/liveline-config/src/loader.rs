use crate::schema::LivelineConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variables consulted, in order, when no API key is configured.
pub const API_KEY_ENV_VARS: &[&str] = &["GOOGLE_API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Jsonc,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;

        match ext {
            "jsonc" => Some(Self::Jsonc),
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: LivelineConfig,
    pub path: PathBuf,
    pub format: ConfigFormat,
}

/// Load the configuration from `config_path`, or from the first discovered
/// candidate file. Falls back to defaults when nothing is found and no
/// explicit path was given.
pub fn load_config(config_path: Option<&Path>) -> Result<LivelineConfig> {
    match config_path {
        Some(path) => Ok(load_config_from_file(path)?.config),
        None => match find_config_file() {
            Some(path) => Ok(load_config_from_file(&path)?.config),
            None => Ok(apply_env_fallbacks(LivelineConfig::default())),
        },
    }
}

/// Parse one config file, expanding `${VAR}` references and filling a
/// missing API key from [`API_KEY_ENV_VARS`].
pub fn load_config_from_file(path: &Path) -> Result<ResolvedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unknown config format for: {}", path.display()))?;

    let config = parse_config_content(&content, format)?;

    Ok(ResolvedConfig {
        config: apply_env_fallbacks(expand_env_vars(config)),
        path: path.to_path_buf(),
        format,
    })
}

fn parse_config_content(content: &str, format: ConfigFormat) -> Result<LivelineConfig> {
    match format {
        ConfigFormat::Jsonc => json5::from_str(content).context("Failed to parse JSONC"),
        ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
        ConfigFormat::Yaml => serde_yaml_ng::from_str(content).context("Failed to parse YAML"),
    }
}

const CONFIG_CANDIDATES: &[&str] = &[
    "liveline.jsonc",
    "liveline.json",
    "liveline.yml",
    "liveline.yaml",
    ".liveline.jsonc",
    ".liveline.json",
    ".liveline.yml",
    ".liveline.yaml",
];

fn find_config_file() -> Option<PathBuf> {
    for candidate in CONFIG_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = env::var("HOME") {
        for candidate in CONFIG_CANDIDATES {
            let path = PathBuf::from(&home)
                .join(".config")
                .join("liveline")
                .join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
    }

    None
}

fn expand_env_vars(mut config: LivelineConfig) -> LivelineConfig {
    config.server.host = expand_env_string(&config.server.host);
    config.upstream.url = expand_env_string(&config.upstream.url);
    config.upstream.model = expand_env_string(&config.upstream.model);
    config.upstream.api_key = config
        .upstream
        .api_key
        .as_deref()
        .map(expand_env_string)
        // An unresolved `${VAR}` means the variable is unset; treat it as absent.
        .filter(|key| !key.is_empty() && !key.starts_with('$'));
    config
}

fn apply_env_fallbacks(config: LivelineConfig) -> LivelineConfig {
    fill_api_key(config, |name| env::var(name).ok())
}

fn fill_api_key<F>(mut config: LivelineConfig, lookup: F) -> LivelineConfig
where
    F: Fn(&str) -> Option<String>,
{
    if config.upstream.api_key.is_none() {
        config.upstream.api_key = API_KEY_ENV_VARS
            .iter()
            .find_map(|name| lookup(name).filter(|key| !key.is_empty()));
    }
    config
}

fn expand_env_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
            continue;
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                var_name.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if var_name.is_empty() {
            result.push('$');
        } else if let Ok(value) = env::var(&var_name) {
            result.push_str(&value);
        } else {
            result.push('$');
            result.push_str(&var_name);
        }
    }

    result
}
