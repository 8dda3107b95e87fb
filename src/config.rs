//! Daemon configuration: layered defaults, dotfile, environment, CLI.
//!
//! Settings merge lowest-to-highest as defaults < `.formwire.toml` <
//! `FORMWIRE_*` environment variables < command-line flags, so every
//! binary exposes one consistent configuration surface.

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    codec::UnknownCodec,
    connection::DEFAULT_LINE_LIMIT,
    form::DEFAULT_SEPARATION,
    session::{DEFAULT_QUEUE_SIZE, SessionConfig},
};

/// Dotfile consulted below environment variables.
pub const CONFIG_FILE: &str = ".formwire.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FORMWIRE_";

/// Command-line flags. Every flag is optional; unset flags fall through
/// to the layered configuration.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "formwire", about = "Remote-command daemon over framed forms")]
pub struct Cli {
    /// Server bind address.
    #[arg(long)]
    pub bind: Option<String>,
    /// Separation sentinel between form bodies and appendix markers.
    #[arg(long)]
    pub separation: Option<String>,
    /// Per-exchange timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Keepalive interval in seconds; omit to disable polling.
    #[arg(long)]
    pub poll_interval_secs: Option<f64>,
    /// Bound of the client call queue.
    #[arg(long)]
    pub queue_size: Option<usize>,
    /// Appendix codec: "json" or "binary".
    #[arg(long)]
    pub codec: Option<String>,
}

/// Runtime configuration shared by all binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server bind address.
    pub bind: String,
    /// Separation sentinel between form bodies and appendix markers.
    pub separation: String,
    /// Per-exchange timeout in seconds.
    pub timeout_secs: u64,
    /// Keepalive interval in seconds; absent disables polling.
    pub poll_interval_secs: Option<f64>,
    /// Bound of the client call queue.
    pub queue_size: usize,
    /// Appendix codec name.
    pub codec: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7450".to_owned(),
            separation: DEFAULT_SEPARATION.to_owned(),
            timeout_secs: 10,
            poll_interval_secs: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            codec: "json".to_owned(),
        }
    }
}

impl AppConfig {
    /// Merge defaults, the dotfile, and the environment, then lay the
    /// given CLI flags on top.
    ///
    /// # Errors
    /// Returns figment's error for unreadable files or mistyped values.
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        let mut cfg: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        if let Some(bind) = &cli.bind {
            cfg.bind.clone_from(bind);
        }
        if let Some(separation) = &cli.separation {
            cfg.separation.clone_from(separation);
        }
        if let Some(timeout) = cli.timeout_secs {
            cfg.timeout_secs = timeout;
        }
        if let Some(interval) = cli.poll_interval_secs {
            cfg.poll_interval_secs = Some(interval);
        }
        if let Some(queue_size) = cli.queue_size {
            cfg.queue_size = queue_size;
        }
        if let Some(codec) = &cli.codec {
            cfg.codec.clone_from(codec);
        }
        Ok(cfg)
    }

    /// Derive the per-session tunables.
    ///
    /// # Errors
    /// [`UnknownCodec`] when the codec name is not recognized.
    pub fn session_config(&self) -> Result<SessionConfig, UnknownCodec> {
        Ok(SessionConfig {
            separation: self.separation.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: self.poll_interval_secs.map(Duration::from_secs_f64),
            queue_size: self.queue_size,
            codec: self.codec.parse()?,
            line_limit: DEFAULT_LINE_LIMIT,
        })
    }
}
