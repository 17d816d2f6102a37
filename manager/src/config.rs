use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Default TTL for a session, in seconds.
    pub ttl_seconds: i64,
    /// Interval between expiry-sweep passes, in seconds.
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CollaboratorConfig {
    /// Base URL of the stage-collaborator services.
    pub base_url: String,
    /// Per-call timeout for collaborator invocations, in seconds.
    pub timeout_seconds: u64,
    /// Directory where generated documents are written by the builders.
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8082,
            },
            sessions: SessionConfig {
                ttl_seconds: 3600,
                sweep_interval_seconds: 3600,
            },
            collaborators: CollaboratorConfig {
                base_url: "http://127.0.0.1:8090".to_string(),
                timeout_seconds: 120,
                output_dir: get_default_output_dir(),
            },
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = get_config_path();

        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::Message(format!("Failed to create config directory: {e}"))
            })?;
        }

        // Create default config file if it doesn't exist
        if !config_path.exists() {
            let default_config = r#"
[server]
host = "127.0.0.1"
port = 8082

[sessions]
ttl_seconds = 3600
sweep_interval_seconds = 3600

[collaborators]
base_url = "http://127.0.0.1:8090"
timeout_seconds = 120
output_dir = "~/.local/share/testdoc/output"
"#;
            std::fs::write(&config_path, default_config).map_err(|e| {
                ConfigError::Message(format!("Failed to write default config: {e}"))
            })?;
        }

        let builder = Config::builder()
            .add_source(File::from(config_path.clone()))
            .build()?;

        let mut config: AppConfig = builder.try_deserialize()?;
        config.collaborators.output_dir = expand_tilde(&config.collaborators.output_dir);

        Ok(config)
    }

    pub fn load_from_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::Message(format!(
                "Configuration file not found: {}",
                config_path.display()
            )));
        }

        let builder = Config::builder()
            .add_source(File::from(config_path.to_path_buf()))
            .build()?;

        let mut config: AppConfig = builder.try_deserialize()?;
        config.collaborators.output_dir = expand_tilde(&config.collaborators.output_dir);

        Ok(config)
    }
}

fn get_config_path() -> PathBuf {
    if let Some(home) = home::home_dir() {
        home.join(".config/testdoc/manager.toml")
    } else {
        PathBuf::from("manager.toml")
    }
}

fn get_default_output_dir() -> PathBuf {
    if let Some(home) = home::home_dir() {
        home.join(".local/share/testdoc/output")
    } else {
        PathBuf::from("output")
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = home::home_dir() {
            let path_str = path.to_string_lossy();
            let expanded = path_str.replacen('~', &home.to_string_lossy(), 1);
            return PathBuf::from(expanded);
        }
    }
    path.to_path_buf()
}
