//! Configuration resolution: CLI flags > environment variables > a
//! `config.json` file next to the binary > built-in defaults.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "JARVIS_CORE_";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_auto_start() -> bool {
    true
}

/// Resolved application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub models_dir: PathBuf,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

impl AppConfig {
    /// Config as returned by `GET /config`, with the token masked.
    pub fn masked(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("AppConfig always serializes");
        if let Some(obj) = value.as_object_mut() {
            if obj.get("token").map(|t| !t.is_null()).unwrap_or(false) {
                obj.insert("token".into(), serde_json::json!("***"));
            }
        }
        value
    }
}

/// Partial configuration overlay; every field optional so layers can be
/// merged left-to-right with later layers winning.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    host: Option<String>,
    port: Option<u16>,
    models_dir: Option<PathBuf>,
    token: Option<String>,
    auto_start: Option<bool>,
}

impl ConfigLayer {
    fn merge(mut self, other: ConfigLayer) -> Self {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.models_dir.is_some() {
            self.models_dir = other.models_dir;
        }
        if other.token.is_some() {
            self.token = other.token;
        }
        if other.auto_start.is_some() {
            self.auto_start = other.auto_start;
        }
        self
    }
}

#[derive(Parser, Debug)]
#[command(name = "jarvis-core", about = "Local model lifecycle + chat HTTP service")]
pub struct CliArgs {
    /// Host/IP address to bind the server
    #[arg(long)]
    pub host: Option<String>,
    /// Port to expose the HTTP server
    #[arg(long)]
    pub port: Option<u16>,
    /// Path to the directory containing model artifacts and registry state
    #[arg(long)]
    pub models_dir: Option<PathBuf>,
    /// Optional API token for securing the service
    #[arg(long)]
    pub token: Option<String>,
    /// Load configuration but do not launch the HTTP server
    #[arg(long)]
    pub no_auto_start: bool,
}

impl From<CliArgs> for ConfigLayer {
    fn from(args: CliArgs) -> Self {
        ConfigLayer {
            host: args.host,
            port: args.port,
            models_dir: args.models_dir,
            token: args.token,
            auto_start: if args.no_auto_start { Some(false) } else { None },
        }
    }
}

fn load_file_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    if !path.exists() {
        return Ok(ConfigLayer::default());
    }
    let contents = std::fs::read_to_string(path)?;
    let layer = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("invalid JSON in configuration file {}: {e}", path.display()))?;
    Ok(layer)
}

fn load_env_layer() -> anyhow::Result<ConfigLayer> {
    let port = match std::env::var(format!("{ENV_PREFIX}PORT")) {
        Ok(v) => Some(
            v.parse::<u16>()
                .map_err(|_| anyhow::anyhow!("{ENV_PREFIX}PORT must be an integer"))?,
        ),
        Err(_) => None,
    };
    let auto_start = std::env::var(format!("{ENV_PREFIX}AUTO_START"))
        .ok()
        .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"));

    Ok(ConfigLayer {
        host: std::env::var(format!("{ENV_PREFIX}HOST")).ok(),
        port,
        models_dir: std::env::var(format!("{ENV_PREFIX}MODELS_DIR")).ok().map(PathBuf::from),
        token: std::env::var(format!("{ENV_PREFIX}TOKEN")).ok(),
        auto_start,
    })
}

/// Resolve configuration from all sources with `cli > env > file > defaults` precedence.
pub fn resolve_config(cli: CliArgs, config_file: &Path) -> anyhow::Result<AppConfig> {
    let file_layer = load_file_layer(config_file)?;
    let env_layer = load_env_layer()?;
    let cli_layer: ConfigLayer = cli.into();

    let merged = ConfigLayer::default()
        .merge(file_layer)
        .merge(env_layer)
        .merge(cli_layer);

    let models_dir = merged
        .models_dir
        .ok_or_else(|| anyhow::anyhow!("models_dir must be set via --models-dir, JARVIS_CORE_MODELS_DIR, or config.json"))?;

    let host = merged.host.unwrap_or_else(default_host);
    if host.is_empty() {
        anyhow::bail!("host cannot be empty");
    }

    Ok(AppConfig {
        host,
        port: merged.port.unwrap_or_else(default_port),
        models_dir,
        token: merged.token,
        auto_start: merged.auto_start.unwrap_or_else(default_auto_start),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_hides_token() {
        let config = AppConfig {
            host: "127.0.0.1".into(),
            port: 8000,
            models_dir: PathBuf::from("/tmp/models"),
            token: Some("secret".into()),
            auto_start: true,
        };
        let masked = config.masked();
        assert_eq!(masked["token"], "***");
    }

    #[test]
    fn masked_keeps_null_when_no_token() {
        let config = AppConfig {
            host: "127.0.0.1".into(),
            port: 8000,
            models_dir: PathBuf::from("/tmp/models"),
            token: None,
            auto_start: true,
        };
        let masked = config.masked();
        assert!(masked["token"].is_null());
    }

    #[test]
    fn cli_overrides_file_and_env() {
        let cli = CliArgs {
            host: Some("1.2.3.4".into()),
            port: None,
            models_dir: Some(PathBuf::from("/models")),
            token: None,
            no_auto_start: false,
        };
        let merged = ConfigLayer::default()
            .merge(ConfigLayer {
                host: Some("9.9.9.9".into()),
                ..Default::default()
            })
            .merge(cli.into());
        assert_eq!(merged.host.as_deref(), Some("1.2.3.4"));
    }
}
