use std::time::Duration as StdDuration;

use anyhow::bail;
use chrono::Duration;
use clap::Args;
use tracing::info;

use crate::client::BASE_API_URL;

pub const DEFAULT_LOOKBACK_YEARS: i64 = 10;

/// Connection settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// The Percipio Organization ID
    #[arg(long, env = "PERCIPIO_ORGANIZATION_ID")]
    pub organization_id: String,
    /// The Percipio Bearer Token
    #[arg(long, env = "PERCIPIO_API_TOKEN", hide_env_values = true)]
    pub api_token: String,
    /// How many days back of learning activity data to fetch
    #[arg(short = 'd', long)]
    pub lookback_days: Option<i64>,
    /// How many years back of learning activity data to fetch
    #[arg(short = 'y', long, default_value_t = DEFAULT_LOOKBACK_YEARS)]
    pub lookback_years: i64,
    #[arg(long, default_value = BASE_API_URL)]
    pub base_url: String,
    /// Abort the whole run after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl ConnectionArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.organization_id.trim().is_empty() {
            bail!("organization-id must not be empty");
        }
        if self.api_token.trim().is_empty() {
            bail!("api-token must not be empty");
        }
        Ok(())
    }

    /// Days take priority over years; neither set falls back to ten years.
    pub fn lookback(&self) -> Duration {
        match (self.lookback_days, self.lookback_years) {
            (Some(days), _) if days > 0 => {
                info!(days, "using days-based lookback");
                Duration::days(days)
            }
            (_, years) if years > 0 => {
                info!(years, "using years-based lookback");
                Duration::days(years * 365)
            }
            _ => {
                info!(years = DEFAULT_LOOKBACK_YEARS, "using default lookback");
                Duration::days(DEFAULT_LOOKBACK_YEARS * 365)
            }
        }
    }

    pub fn timeout(&self) -> Option<StdDuration> {
        self.timeout_secs.map(StdDuration::from_secs)
    }
}
