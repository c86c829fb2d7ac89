// src/config.rs

//! Manages server configuration: loading the YAML file, applying CLI
//! overrides and validating the result.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// The `server` section of the configuration file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub auth_file: Option<String>,
    #[serde(default)]
    pub ban_file: Option<String>,
    #[serde(default = "default_motd_file")]
    pub motd_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    12000
}
fn default_name() -> String {
    "convoyd server".to_string()
}
fn default_motd_file() -> Option<String> {
    Some("motd.txt".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            name: default_name(),
            owner: String::new(),
            debug: false,
            auth_file: None,
            ban_file: None,
            motd_file: default_motd_file(),
            password: None,
        }
    }
}

/// The `api` section: the out-of-band registry endpoint. Both keys empty
/// means the server runs unadvertised (LAN mode).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// The `game` section.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GameConfig {
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    #[serde(default = "default_terrain")]
    pub terrain: String,
    /// Optional Lua script with lifecycle callbacks.
    #[serde(default)]
    pub script_file: Option<String>,
}

fn default_max_players() -> usize {
    16
}
fn default_terrain() -> String {
    "any".to_string()
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            max_players: default_max_players(),
            terrain: default_terrain(),
            script_file: None,
        }
    }
}

/// The complete, validated server configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub game: GameConfig,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a YAML file. A missing
    /// file yields the defaults, so a bare `convoyd` still starts.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file at '{path}'"));
            }
        };
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML from '{path}'"))?;
        Ok(config)
    }

    /// Applies one `--<section>.<key> <value>` CLI override. CLI values win
    /// over the file; unknown keys are a startup error.
    pub fn set_override(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server.ip" => self.server.ip = value.to_string(),
            "server.port" => {
                self.server.port = value
                    .parse()
                    .with_context(|| format!("invalid port '{value}'"))?;
            }
            "server.name" => self.server.name = value.to_string(),
            "server.owner" => self.server.owner = value.to_string(),
            "server.debug" => {
                self.server.debug = value
                    .parse()
                    .with_context(|| format!("invalid bool '{value}' for server.debug"))?;
            }
            "server.auth_file" => self.server.auth_file = Some(value.to_string()),
            "server.ban_file" => self.server.ban_file = Some(value.to_string()),
            "server.motd_file" => self.server.motd_file = Some(value.to_string()),
            "server.password" => self.server.password = Some(value.to_string()),
            "api.endpoint" => self.api.endpoint = Some(value.to_string()),
            "api.key" => self.api.key = Some(value.to_string()),
            "game.max_players" => {
                self.game.max_players = value
                    .parse()
                    .with_context(|| format!("invalid number '{value}' for game.max_players"))?;
            }
            "game.terrain" => self.game.terrain = value.to_string(),
            "game.script_file" => self.game.script_file = Some(value.to_string()),
            _ => return Err(anyhow!("unknown config field '{key}'")),
        }
        Ok(())
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server.port cannot be 0"));
        }
        if self.server.ip.trim().is_empty() {
            return Err(anyhow!("server.ip cannot be empty"));
        }
        if self.server.name.trim().is_empty() {
            return Err(anyhow!("server.name cannot be empty"));
        }
        if self.game.max_players == 0 {
            return Err(anyhow!("game.max_players cannot be 0"));
        }
        if self.api.endpoint.is_some() != self.api.key.is_some() {
            return Err(anyhow!(
                "api.endpoint and api.key must be configured together"
            ));
        }
        Ok(())
    }
}
