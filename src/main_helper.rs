use crate::constants::{DEFAULT_USER_ID, TOKEN_DEBOUNCE_WINDOW};
use crate::engine::EngineConfig;
use crate::pipeline::DeliveryPolicy;
use crate::types::*;
use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    /// Research service endpoint that streams events for a posted query
    #[arg(long, env = "DELVE_ENDPOINT", default_value = "http://127.0.0.1:8787/research/stream")]
    pub endpoint: String,
    #[arg(long, env = "DELVE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    #[arg(long, env = "DELVE_USER_ID", default_value = DEFAULT_USER_ID)]
    pub user_id: String,
    #[arg(long, default_value = "delve.db")]
    pub database: String,
    /// Coalesce token fragments for this many milliseconds instead of delivering each one
    #[arg(long)]
    pub debounce_ms: Option<u64>,
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
    #[arg(long, default_value_t = 250)]
    pub base_backoff_ms: u64,
    #[arg(long, default_value_t = 120)]
    pub attempt_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 600)]
    pub stage_dwell_ms: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask a research question and stream the answer
    Ask {
        question: String,
        /// Reference to an attached image
        #[arg(long)]
        image: Option<String>,
    },
    /// Print the answers of the current conversation
    History {
        /// Ignore the suspension check and load whatever is stored
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List past conversations
    Sessions,
    /// End the current conversation and start a new one
    New,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        let delivery_policy = match self.debounce_ms {
            Some(0) => DeliveryPolicy::Debounced {
                window: TOKEN_DEBOUNCE_WINDOW,
            },
            Some(ms) => DeliveryPolicy::Debounced {
                window: Duration::from_millis(ms),
            },
            None => DeliveryPolicy::Immediate,
        };
        let user_id = match self.user_id.trim() {
            "" => DEFAULT_USER_ID.to_string(),
            id => id.to_string(),
        };
        EngineConfig {
            user_id: UserId(user_id),
            delivery_policy,
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
            stage_dwell: Duration::from_millis(self.stage_dwell_ms),
            ..EngineConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
