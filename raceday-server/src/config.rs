use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::autosave::AutoSaveConfig;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "raceday-server", about = "Kart championship race-day server")]
pub struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// HTTP / Socket.IO port
    #[arg(long)]
    pub port: Option<u16>,
    /// Championship backend base URL
    #[arg(long)]
    pub api_url: Option<String>,
    /// Local snapshot file
    #[arg(long)]
    pub state_file: Option<PathBuf>,
    /// Seed for reproducible kart draws
    #[arg(long)]
    pub seed: Option<u64>,
}

// ─── File config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            access_token: None,
            refresh_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DrawConfig {
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub autosave: AutoSaveConfig,
    pub draw: DrawConfig,
    pub stage: StageConfig,
}

impl ServiceConfig {
    /// File (or the built-in default), then environment, then CLI flags.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = Self::read_file(&args.config)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_args(args);
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Config {} not readable ({e}), using built-in defaults", path.display());
                DEFAULT_CONFIG.to_string()
            }
        };
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("PORT") {
            self.server.port = port.parse().with_context(|| format!("PORT={port} is not a port number"))?;
        }
        if let Some(url) = var("RACEDAY_API_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = var("RACEDAY_API_TOKEN") {
            self.api.access_token = Some(token);
        }
        if let Some(token) = var("RACEDAY_REFRESH_TOKEN") {
            self.api.refresh_token = Some(token);
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(url) = &args.api_url {
            self.api.base_url = url.clone();
        }
        if let Some(path) = &args.state_file {
            self.stage.state_file = Some(path.clone());
        }
        if args.seed.is_some() {
            self.draw.seed = args.seed;
        }
    }
}
