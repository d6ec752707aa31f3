//! Command-line interface.

use crate::config::ServerConfig;
use clap::{Parser, Subcommand};
use event_pipeline::{EMAIL_DLQ, EMAIL_QUEUE};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Live delivery tracking server.
#[derive(Parser, Debug)]
#[command(name = "tracking-server")]
#[command(about = "WebSocket fan-out for live delivery tracking, plus email and export workers")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on.
    #[arg(long, env = "TRACKING_BIND_ADDR", global = true)]
    pub bind: Option<SocketAddr>,

    /// Redis connection URL. Omit to run on in-memory brokers.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Heartbeat timeout in seconds.
    #[arg(long, env = "TRACKING_HEARTBEAT_TIMEOUT_SECS", global = true)]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Stop dead-lettering a message after this many retries.
    #[arg(long, env = "TRACKING_MAX_RETRIES", global = true)]
    pub max_retries: Option<u32>,

    /// Append JSONL logs to this file.
    #[arg(long, env = "TRACKING_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TRACKING_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve WebSocket viewers and run the queue workers (default).
    Serve,

    /// Move dead letters back onto a work queue.
    Redrive {
        #[arg(long, default_value = EMAIL_DLQ)]
        from: String,

        #[arg(long, default_value = EMAIL_QUEUE)]
        to: String,

        /// Maximum number of messages to move.
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Flags win over values loaded from the environment.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = Some(url.clone());
        }
        if let Some(secs) = self.heartbeat_timeout_secs {
            config.heartbeat_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(max) = self.max_retries {
            config.max_retries = Some(max);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}
