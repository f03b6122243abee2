use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser};

use crate::domain::{ManagerEndpoint, ShardEndpoint};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "docgate",
    about = "Scatter-gather gateway for a sharded document store",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        env = "DOCGATE_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:8002"
    )]
    pub bind: SocketAddr,

    /// Shard server base URL; repeat for every shard, order is significant.
    #[arg(
        long = "server",
        env = "DOCGATE_SERVERS",
        value_name = "URL",
        value_delimiter = ','
    )]
    pub servers: Vec<ShardEndpoint>,

    /// Manager base URL used for collection lookups and usage reports.
    #[arg(
        long = "manager",
        env = "DOCGATE_MANAGERS",
        value_name = "URL",
        value_delimiter = ','
    )]
    pub managers: Vec<ManagerEndpoint>,

    #[arg(
        long,
        env = "DOCGATE_SECRET",
        value_name = "SECRET",
        default_value = "",
        hide_env_values = true
    )]
    pub secret: String,

    /// Regex applied to the Host header; capture group 1 is the tenant.
    #[arg(
        long = "account-mapper",
        env = "DOCGATE_ACCOUNT_MAPPER",
        value_name = "REGEX",
        default_value = r"^(.+)\.docgate\.test$"
    )]
    pub account_mapper: String,

    #[arg(
        long = "usage-flush-interval-secs",
        env = "DOCGATE_USAGE_FLUSH_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub usage_flush_interval_secs: u64,

    #[arg(
        long = "shard-timeout-secs",
        env = "DOCGATE_SHARD_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub shard_timeout_secs: u64,
}

impl Config {
    pub fn usage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.usage_flush_interval_secs)
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_secs(self.shard_timeout_secs)
    }

    /// Checks the options clap cannot express on its own.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secret.trim().is_empty() {
            anyhow::bail!("--secret (DOCGATE_SECRET) is required but was not provided");
        }
        if self.servers.is_empty() {
            anyhow::bail!("at least one --server (DOCGATE_SERVERS) is required");
        }
        regex::Regex::new(&self.account_mapper)
            .map_err(|e| anyhow::anyhow!("invalid --account-mapper: {e}"))?;
        Ok(())
    }
}
