//! YAML configuration.
//!
//! Non-secret settings come from a config file found on a short search
//! path; client credentials come from the environment (optionally via a
//! `.env` file loaded in main).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::source::whoop::auth::{OAuthSettings, DEFAULT_AUTH_TIMEOUT_SECS};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub whoop: WhoopConfig,
    #[serde(default)]
    pub quest: QuestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/healthsync/healthsync.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhoopConfig {
    #[serde(default = "default_api_base")]
    pub api_base_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

impl Default for WhoopConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            redirect_uri: default_redirect_uri(),
            callback_port: default_callback_port(),
            scopes: default_scopes(),
            page_size: default_page_size(),
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.prod.whoop.com/developer".to_string()
}
fn default_auth_url() -> String {
    "https://api.prod.whoop.com/oauth/oauth2/auth".to_string()
}
fn default_token_url() -> String {
    "https://api.prod.whoop.com/oauth/oauth2/token".to_string()
}
fn default_redirect_uri() -> String {
    "http://localhost:8765/callback".to_string()
}
fn default_callback_port() -> u16 {
    8765
}
fn default_scopes() -> String {
    "offline read:profile read:body_measurement read:cycles read:sleep read:recovery read:workout"
        .to_string()
}
fn default_page_size() -> u32 {
    25
}
fn default_auth_timeout() -> u64 {
    DEFAULT_AUTH_TIMEOUT_SECS
}

impl WhoopConfig {
    /// Settings for the token manager. Secrets are read from the
    /// environment here, never from the config file.
    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            client_id: std::env::var("WHOOP_CLIENT_ID").ok().filter(|s| !s.is_empty()),
            client_secret: std::env::var("WHOOP_CLIENT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri: self.redirect_uri.clone(),
            callback_port: self.callback_port,
            scopes: self.scopes.clone(),
            auth_timeout_secs: self.auth_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct QuestConfig {
    pub path: Option<String>,
    pub patient_id: Option<String>,
}

impl Config {
    /// Load from an explicit path, or the first of `./healthsync.yaml`,
    /// `~/.config/healthsync/healthsync.yaml`. Missing files mean
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if path.exists() {
                return Self::from_file(path);
            }
            // An explicitly-given path that does not exist is still fine;
            // the default path from clap usually points nowhere.
            return Ok(Self::default());
        }
        for candidate in [
            PathBuf::from("healthsync.yaml"),
            PathBuf::from(
                shellexpand::tilde("~/.config/healthsync/healthsync.yaml").into_owned(),
            ),
        ] {
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).into_owned())
    }
}
