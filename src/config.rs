//! Configuration management for legwork.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required for the live reasoning backend.
//! - `PLANNER_MODEL` - Optional. Model used for request decomposition.
//! - `SYNTHESIS_MODEL` - Optional. Model used for answer synthesis.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `FAN_OUT_LIMIT` - Optional. Max concurrent nodes per stage. Defaults to `8`.
//! - `SOFT_UNIT_CEILING` - Optional. Budget units above which plans are narrowed.
//! - `HARD_UNIT_CEILING` - Optional. Budget units above which plans need explicit confirmation.
//! - `STAGE_TIMEOUT_SECS` - Optional. Soft deadline for one parallel stage.
//! - `NODE_ATTEMPT_LIMIT` - Optional. Attempts per node before it is declared failed.
//! - `REPLAN_LIMIT` - Optional. Maximum fresh decompositions after the first.
//! - `REPLAN_ITEM_FLOOR` - Optional. Terminal item count below which a replan is considered.
//! - `HISTORY_DB_PATH` - Optional. SQLite file for the run history; in-memory when unset.
//! - `EVIDENCE_FIXTURE_PATH` - Optional. JSON record file served by the built-in sources.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration for the orchestration engine and its HTTP surface.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key for the reasoning backend
    pub api_key: String,

    /// Model used to decompose requests into execution graphs
    pub planner_model: String,

    /// Model used to synthesize the final answer
    pub synthesis_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Maximum nodes executing concurrently within one parallel group
    pub fan_out_limit: usize,

    /// Predicted units above which the budget manager narrows the plan
    pub soft_unit_ceiling: u64,

    /// Predicted units above which execution needs explicit caller confirmation
    pub hard_unit_ceiling: u64,

    /// Soft deadline for a single parallel group
    pub stage_timeout: Duration,

    /// Attempts (including the first) before a node is declared failed
    pub node_attempt_limit: u32,

    /// Base delay for exponential retry backoff between node attempts
    pub retry_base_delay: Duration,

    /// How long in-flight nodes may keep running after a cancellation
    pub cancel_grace: Duration,

    /// Maximum fresh decompositions after the initial one
    pub replan_limit: u32,

    /// Terminal item count below which results are judged insufficient
    pub replan_item_floor: usize,

    /// Upper bound on recent-context characters fed to the planner
    pub recent_context_limit: usize,

    /// Output token cap for planner and synthesis calls
    pub completion_max_tokens: u64,

    /// SQLite file for run history; in-memory store when `None`
    pub history_db_path: Option<PathBuf>,

    /// JSON record file the built-in evidence sources serve; empty sources when `None`
    pub evidence_fixture_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let planner_model = std::env::var("PLANNER_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let synthesis_model = std::env::var("SYNTHESIS_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env("PORT", 3000)?;
        let fan_out_limit = parse_env("FAN_OUT_LIMIT", 8)?;
        let soft_unit_ceiling = parse_env("SOFT_UNIT_CEILING", 100_000)?;
        let hard_unit_ceiling = parse_env("HARD_UNIT_CEILING", 250_000)?;
        let stage_timeout = Duration::from_secs(parse_env("STAGE_TIMEOUT_SECS", 120)?);
        let node_attempt_limit = parse_env("NODE_ATTEMPT_LIMIT", 3)?;
        let replan_limit = parse_env("REPLAN_LIMIT", 1)?;
        let replan_item_floor = parse_env("REPLAN_ITEM_FLOOR", 3)?;

        let history_db_path = std::env::var("HISTORY_DB_PATH").ok().map(PathBuf::from);
        let evidence_fixture_path = std::env::var("EVIDENCE_FIXTURE_PATH").ok().map(PathBuf::from);

        Ok(Self {
            api_key,
            planner_model,
            synthesis_model,
            host,
            port,
            fan_out_limit,
            soft_unit_ceiling,
            hard_unit_ceiling,
            stage_timeout,
            node_attempt_limit,
            retry_base_delay: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(2),
            replan_limit,
            replan_item_floor,
            recent_context_limit: 2_000,
            completion_max_tokens: 4_096,
            history_db_path,
            evidence_fixture_path,
        })
    }

    /// Create a config with deterministic values for tests.
    ///
    /// Retry and grace delays are near-zero so failure paths run fast.
    pub fn for_tests() -> Self {
        Self {
            api_key: "test-key".to_string(),
            planner_model: "test/planner".to_string(),
            synthesis_model: "test/synthesis".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            fan_out_limit: 4,
            soft_unit_ceiling: 100_000,
            hard_unit_ceiling: 250_000,
            stage_timeout: Duration::from_secs(5),
            node_attempt_limit: 3,
            retry_base_delay: Duration::from_millis(1),
            cancel_grace: Duration::from_millis(50),
            replan_limit: 1,
            replan_item_floor: 3,
            recent_context_limit: 2_000,
            completion_max_tokens: 4_096,
            history_db_path: None,
            evidence_fixture_path: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
