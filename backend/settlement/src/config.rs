//! Application configuration loaded from environment variables.

use crate::aggregator::DEFAULT_MIN_HUMANITY_SCORE;
use crate::errors::{Result, SettlementError};
use crate::payout::DEFAULT_TOKEN_DECIMALS;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Contributions whose humanity score falls below this are ignored when scoring
    pub min_humanity_score: f64,
    /// Fixed-point decimals of the payout token (USDC-style tokens use 6)
    pub token_decimals: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .map_err(|_| SettlementError::Config("Invalid API_PORT".to_string()))?,
            min_humanity_score: parse_min_humanity_score(
                &env_var("MIN_HUMANITY_SCORE")
                    .unwrap_or_else(|_| DEFAULT_MIN_HUMANITY_SCORE.to_string()),
            )?,
            token_decimals: parse_token_decimals(
                &env_var("TOKEN_DECIMALS")
                    .unwrap_or_else(|_| DEFAULT_TOKEN_DECIMALS.to_string()),
            )?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SettlementError::Config(format!("Missing env var: {key}")))
}

fn parse_min_humanity_score(raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SettlementError::Config("Invalid MIN_HUMANITY_SCORE".to_string()))
}

/// Token decimals must be a non-negative integer; `"6.5"` or `"-1"` are rejected.
pub fn parse_token_decimals(raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| SettlementError::Config(format!("Invalid TOKEN_DECIMALS: {raw:?}")))
}
