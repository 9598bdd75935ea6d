//! Configuration types for graph-herder
//!
//! Defines CLI arguments, runtime options, live-reconfiguration patches,
//! and the queue weight parser.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Maximum reasonable worker loop count
pub const MAX_LOOPS: usize = 512;

/// Default queue weights: priority classes and their service shares
pub const DEFAULT_QUEUE_WEIGHTS: &str = "events:10,immediate:3,soon:2,normal:3,later:2";

/// Distributed flow control for an API-graph crawler
#[derive(Parser, Debug, Clone)]
#[command(
    name = "graph-herder",
    version,
    about = "Flow control and resource governance for a distributed API-graph crawler",
    long_about = "Runs a supervised pool of worker loops that pull crawl requests\n\
                  from weighted priority queues, borrow rate-limited API credentials,\n\
                  and deduplicate work cluster-wide through a shared tag store.\n\n\
                  Scales horizontally: every process pointed at the same Redis shares\n\
                  queues, credential budgets, and the at-most-once admission window.",
    after_help = "EXAMPLES:\n    \
        # Run four worker loops against shared queues\n    \
        graph-herder run --tokens '1111#admin,push;2222#public' --count 4\n\n    \
        # Watch queue depths\n    \
        graph-herder status --watch\n\n    \
        # Clear queues and tracker tags\n    \
        graph-herder flush --yes"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Redis URL for queues, locks, tags, and rate windows
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    pub redis: String,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a supervised pool of worker loops
    Run {
        /// Credential spec: "value#trait1,trait2;value2#trait3"
        #[arg(long, env = "HERDER_TOKENS", value_name = "SPEC")]
        tokens: String,

        /// Number of concurrent worker loops
        #[arg(short = 'c', long, default_value_t = default_loops(), value_name = "NUM")]
        count: usize,

        /// Pause between loop iterations in milliseconds
        #[arg(long, default_value = "0", value_name = "MS")]
        delay_ms: u64,

        /// Queue weights: "name:weight,name:weight"
        #[arg(long, default_value = DEFAULT_QUEUE_WEIGHTS, value_name = "WEIGHTS")]
        weights: String,

        /// Backend provider (redis, memory)
        #[arg(long, default_value = "redis", value_name = "NAME")]
        provider: String,

        /// Organizations to restrict crawling to (case-insensitive)
        #[arg(long = "org", value_name = "NAME", action = clap::ArgAction::Append)]
        orgs: Vec<String>,

        /// Key prefix for all shared state
        #[arg(long, default_value = "herder", value_name = "PREFIX")]
        prefix: String,

        /// Seed requests as "kind:url" (can be repeated)
        #[arg(long = "seed", value_name = "KIND:URL", action = clap::ArgAction::Append)]
        seeds: Vec<String>,
    },

    /// Show queue depths and statistics
    Status {
        /// Watch mode - continuously update status
        #[arg(short, long)]
        watch: bool,

        /// Update interval for watch mode (seconds)
        #[arg(long, default_value = "2", value_name = "SECS")]
        interval: u64,

        /// Output format (text, json)
        #[arg(long, default_value = "text", value_name = "FORMAT")]
        format: String,

        /// Backend provider (redis, memory)
        #[arg(long, default_value = "redis", value_name = "NAME")]
        provider: String,

        /// Key prefix for all shared state
        #[arg(long, default_value = "herder", value_name = "PREFIX")]
        prefix: String,

        /// Queue weights (names only are used here)
        #[arg(long, default_value = DEFAULT_QUEUE_WEIGHTS, value_name = "WEIGHTS")]
        weights: String,
    },

    /// Clear all queues and tracker tags
    Flush {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Backend provider (redis, memory)
        #[arg(long, default_value = "redis", value_name = "NAME")]
        provider: String,

        /// Key prefix for all shared state
        #[arg(long, default_value = "herder", value_name = "PREFIX")]
        prefix: String,

        /// Queue weights (names only are used here)
        #[arg(long, default_value = DEFAULT_QUEUE_WEIGHTS, value_name = "WEIGHTS")]
        weights: String,
    },
}

fn default_loops() -> usize {
    num_cpus::get()
}

/// Live options owned by the supervisor
#[derive(Debug, Clone, Serialize)]
pub struct CrawlerOptions {
    /// Desired number of concurrent worker loops
    pub count: usize,
    /// Pause between loop iterations
    pub delay: Duration,
    /// Organizations the crawl is restricted to, case-folded
    pub org_list: Vec<String>,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            count: default_loops(),
            delay: Duration::ZERO,
            org_list: Vec::new(),
        }
    }
}

impl CrawlerOptions {
    /// Validate CLI-supplied values
    pub fn from_run_args(
        count: usize,
        delay_ms: u64,
        orgs: &[String],
    ) -> Result<Self, ConfigError> {
        if count == 0 || count > MAX_LOOPS {
            return Err(ConfigError::InvalidLoopCount {
                count,
                max: MAX_LOOPS,
            });
        }
        Ok(Self {
            count,
            delay: Duration::from_millis(delay_ms),
            org_list: orgs.iter().map(|o| o.to_lowercase()).collect(),
        })
    }
}

/// Field-level patch applied to live crawler options
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlerPatch {
    /// New desired loop count; zero stops the supervisor
    pub count: Option<usize>,
    /// New inter-iteration delay in milliseconds
    pub delay_ms: Option<u64>,
    /// New organization list; case-folded on application
    pub org_list: Option<Vec<String>>,
}

/// Parse a queue weight string of the form `"name:weight,name:weight"`
pub fn parse_queue_weights(spec: &str) -> Result<Vec<(String, u32)>, ConfigError> {
    let mut weights = Vec::new();
    for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
        let Some((name, weight)) = entry.split_once(':') else {
            return Err(ConfigError::InvalidQueueWeight {
                entry: entry.to_string(),
                reason: "expected name:weight".into(),
            });
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidQueueWeight {
                entry: entry.to_string(),
                reason: "empty queue name".into(),
            });
        }
        let weight: u32 = weight.trim().parse().map_err(|_| ConfigError::InvalidQueueWeight {
            entry: entry.to_string(),
            reason: "weight is not a number".into(),
        })?;
        if weight == 0 {
            return Err(ConfigError::InvalidQueueWeight {
                entry: entry.to_string(),
                reason: "weight must be positive".into(),
            });
        }
        weights.push((name.to_string(), weight));
    }
    if weights.is_empty() {
        return Err(ConfigError::MissingRequired("queue weights".into()));
    }
    Ok(weights)
}

/// Unique identifier for this process, used to name worker loops
pub fn instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, &uuid::Uuid::new_v4().to_string()[..8])
}
