use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenvy::dotenv;

use crate::incoming::{IncomingConfig, DEFAULT_CONSUMER_BATCH_SIZE, DEFAULT_POLL_TIMEOUT};
use crate::scheduler::{SchedulerConfig, DEFAULT_NEW_BATCH_DELAY};
use crate::scoring::{ScoringConfig, DEFAULT_SCORING_BATCH_SIZE, DEFAULT_SCORING_POLL_TIMEOUT};

pub const DEFAULT_MAX_NEXT_REQUESTS: usize = 256;
pub const DEFAULT_OUTGOING_PARTITIONS: u32 = 4;

/// Where the worker's message bus lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusLocation {
    /// In-process bus, `memory://`.
    #[default]
    Memory,
}

impl FromStr for BusLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let scheme = s.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("memory") => Ok(BusLocation::Memory),
            Some(other) => bail!("unsupported bus scheme '{other}' in {s} (only memory:// is built in)"),
            None => bail!("bus location must be a URL like memory://, got '{s}'"),
        }
    }
}

impl fmt::Display for BusLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusLocation::Memory => f.write_str("memory://"),
        }
    }
}

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub bus: BusLocation,
    /// Consumer group shared by every stream the worker reads and by the
    /// outgoing lag lookup.
    pub group: String,
    pub incoming_topic: String,
    pub scoring_topic: String,
    pub outgoing_topic: String,
    /// Partition count used when the worker creates the outgoing topic.
    pub outgoing_partitions: u32,
    pub incoming: IncomingConfig,
    pub scoring: ScoringConfig,
    pub max_next_requests: usize,
    pub scheduler: SchedulerConfig,
    pub control_port: Option<u16>,
    /// URLs published as one `add_seeds` message at startup.
    pub seeds: Vec<String>,
    pub log_level: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bus: BusLocation::Memory,
            group: "frontier".to_string(),
            incoming_topic: "frontier-incoming".to_string(),
            scoring_topic: "frontier-scoring".to_string(),
            outgoing_topic: "frontier-outgoing".to_string(),
            outgoing_partitions: DEFAULT_OUTGOING_PARTITIONS,
            incoming: IncomingConfig::default(),
            scoring: ScoringConfig::default(),
            max_next_requests: DEFAULT_MAX_NEXT_REQUESTS,
            scheduler: SchedulerConfig::default(),
            control_port: None,
            seeds: Vec::new(),
            log_level: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any variable source. Unset variables take
    /// their defaults; set but unparseable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let bus = string("BUS_LOCATION", "memory://")
            .parse()
            .context("BUS_LOCATION is invalid")?;

        let outgoing_partitions: u32 = parse_or(&lookup, "OUTGOING_PARTITIONS", DEFAULT_OUTGOING_PARTITIONS)?;
        if outgoing_partitions == 0 {
            bail!("OUTGOING_PARTITIONS must be at least 1");
        }

        let incoming = IncomingConfig {
            batch_size: parse_nonzero(&lookup, "CONSUMER_BATCH_SIZE", DEFAULT_CONSUMER_BATCH_SIZE)?,
            poll_timeout: Duration::from_millis(parse_or(
                &lookup,
                "INCOMING_POLL_TIMEOUT_MS",
                DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            )?),
        };
        let scoring = ScoringConfig {
            batch_size: parse_nonzero(&lookup, "SCORING_BATCH_SIZE", DEFAULT_SCORING_BATCH_SIZE)?,
            poll_timeout: Duration::from_millis(parse_or(
                &lookup,
                "SCORING_POLL_TIMEOUT_MS",
                DEFAULT_SCORING_POLL_TIMEOUT.as_millis() as u64,
            )?),
        };
        let scheduler = SchedulerConfig {
            new_batch_delay: Duration::from_secs(parse_or(
                &lookup,
                "NEW_BATCH_DELAY_SECS",
                DEFAULT_NEW_BATCH_DELAY.as_secs(),
            )?),
            ..SchedulerConfig::default()
        };

        let control_port = lookup("CONTROL_PORT")
            .map(|port| port.parse::<u16>())
            .transpose()
            .context("CONTROL_PORT must be a valid port number")?;

        Ok(Self {
            bus,
            group: string("FRONTIER_GROUP", "frontier"),
            incoming_topic: string("INCOMING_TOPIC", "frontier-incoming"),
            scoring_topic: string("SCORING_TOPIC", "frontier-scoring"),
            outgoing_topic: string("OUTGOING_TOPIC", "frontier-outgoing"),
            outgoing_partitions,
            incoming,
            scoring,
            max_next_requests: parse_nonzero(&lookup, "MAX_NEXT_REQUESTS", DEFAULT_MAX_NEXT_REQUESTS)?,
            scheduler,
            control_port,
            seeds: Vec::new(),
            log_level: None,
        })
    }
}

fn parse_nonzero(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: usize) -> Result<usize> {
    let value = parse_or(lookup, name, default)?;
    if value == 0 {
        bail!("{name} must be at least 1");
    }
    Ok(value)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}

/// Command line flags. They override the environment.
#[derive(Debug, Parser, Default)]
#[command(name = "frontier-worker")]
#[command(about = "Crawl frontier worker")]
pub struct Cli {
    /// Disable generation of new batches
    #[arg(long)]
    pub no_batches: bool,

    /// Disable scoring log consumption
    #[arg(long)]
    pub no_scoring: bool,

    /// Disable spider log consumption
    #[arg(long)]
    pub no_incoming: bool,

    /// Port for the HTTP control surface
    #[arg(long)]
    pub port: Option<u16>,

    /// Log filter, e.g. "debug" or "info,frontier_worker=trace"
    #[arg(long)]
    pub log_level: Option<String>,

    /// Seed URL to inject at startup (repeatable)
    #[arg(long = "seed", value_name = "URL")]
    pub seeds: Vec<String>,
}

impl Cli {
    pub fn apply(self, config: &mut WorkerConfig) {
        let duties = &mut config.scheduler.duties;
        if self.no_batches {
            duties.batches = false;
        }
        if self.no_scoring {
            duties.scoring = false;
        }
        if self.no_incoming {
            duties.incoming = false;
        }
        if self.port.is_some() {
            config.control_port = self.port;
        }
        if self.log_level.is_some() {
            config.log_level = self.log_level;
        }
        config.seeds.extend(self.seeds);
    }
}
