use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::dispatcher::DispatcherConfig;

/// Application name used for the default credential store location
const APP_NAME: &str = "booking-session";

/// Credential store file name
const STORE_FILE: &str = "credentials.json";

/// Booking Session - session lifecycle client for the booking API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Booking API base URL
    #[arg(short = 'u', long = "api-url", env = "BOOKING_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Path to the credential store file
    #[arg(short = 's', long, env = "SESSION_STORE_FILE")]
    pub store_file: Option<String>,

    /// Maximum simultaneous outbound requests
    #[arg(short = 'c', long = "max-concurrent", env = "MAX_CONCURRENT_REQUESTS", default_value = "6")]
    pub max_concurrent: usize,

    /// Dispatcher drain interval in milliseconds
    #[arg(long, env = "DRAIN_INTERVAL_MS", default_value = "50")]
    pub drain_interval_ms: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Restore the stored session and print its state
    Status,

    /// Sign in (password from BOOKING_PASSWORD or an interactive prompt)
    Login {
        username: String,
    },

    /// Sign out and clear stored credentials
    Logout,

    /// Fetch the signed-in user's profile through the request dispatcher
    Profile,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Booking API
    pub api_base_url: String,

    // Credential store
    pub store_file: PathBuf,

    // Dispatcher
    pub max_concurrent_requests: usize,
    pub drain_interval_ms: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Session
    pub token_refresh_threshold: u64,

    // Logging
    pub log_level: String,

    pub command: Command,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let store_file = match args.store_file {
            Some(path) => expand_tilde(&path),
            None => default_store_file()?,
        };

        let config = Config {
            api_base_url: args.api_url,
            store_file,

            max_concurrent_requests: args.max_concurrent,
            drain_interval_ms: args.drain_interval_ms,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 60),

            log_level: args.log_level,

            command: args.command.unwrap_or(Command::Status),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("MAX_CONCURRENT_REQUESTS must be at least 1");
        }

        if self.drain_interval_ms == 0 {
            anyhow::bail!("DRAIN_INTERVAL_MS must be at least 1");
        }

        reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("BOOKING_API_URL is not a valid URL: {}", self.api_base_url))?;

        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.max_concurrent_requests, self.drain_interval_ms)
    }
}

/// Parse an optional numeric environment variable, falling back to `default`
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_store_file() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not find config directory")?;
    Ok(config_dir.join(APP_NAME).join(STORE_FILE))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
