//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use edgeprobe_core::RangeSource;
use std::path::PathBuf;

/// EdgeProbe - CDN edge-IP quality probing and ranking
///
/// Materializes each provider's published IP space, probes sampled IPs
/// for latency, loss and throughput, and maintains a quality-gated
/// best-IP set on a schedule.
#[derive(Parser, Debug)]
#[command(
    name = "edgeprobe",
    version,
    about = "CDN edge-IP quality probe and ranking service",
    after_help = "EXAMPLES:\n\
    # Register a provider with its range API\n\
    edgeprobe provider create cloudflare --api-url https://api.cloudflare.com/client/v4/ips\n\n\
    # Load ranges from the provider API\n\
    edgeprobe ranges update 1 --source api\n\n\
    # Load user CIDRs instead\n\
    edgeprobe ranges update 1 --source cidrs --cidr 104.16.0.0/13 --cidr 172.64.0.0/13\n\n\
    # Run the three-stage test cycle for a provider\n\
    edgeprobe test start 1\n\n\
    # Show the current best IP\n\
    edgeprobe best-ip --json\n\n\
    # Long-running worker: broker consumer plus cron schedule\n\
    edgeprobe worker",
    author = "EdgeProbe Contributors"
)]
pub struct Args {
    /// Database file (defaults to the environment-derived settings)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage providers
    Provider {
        #[command(subcommand)]
        command: ProviderCommand,
    },
    /// Manage a provider's IP ranges
    Ranges {
        #[command(subcommand)]
        command: RangesCommand,
    },
    /// Run probe cycles
    Test {
        #[command(subcommand)]
        command: TestCommand,
    },
    /// Show the best-ranked result row
    BestIp {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Read progress events
    Progress {
        #[command(subcommand)]
        command: ProgressCommand,
    },
    /// Run the worker: job consumer plus cron schedule
    Worker,
}

#[derive(Subcommand, Debug)]
pub enum ProviderCommand {
    /// Create a provider
    Create {
        name: String,
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        logo_url: Option<String>,
    },
    /// Update a provider's name and/or logo
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        logo_url: Option<String>,
    },
    /// Soft-delete a provider
    Delete { id: i64 },
    /// List live providers
    List,
}

/// `--source` values, mirroring the stored source tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Api,
    Cidrs,
    Single,
    Custom,
}

impl From<SourceArg> for RangeSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Api => RangeSource::Api,
            SourceArg::Cidrs => RangeSource::Cidrs,
            SourceArg::Single => RangeSource::Single,
            SourceArg::Custom => RangeSource::Custom,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum RangesCommand {
    /// Rewrite one source's ranges for a provider
    Update {
        provider_id: i64,
        /// Which input shape to rewrite
        #[arg(long, value_enum)]
        source: SourceArg,
        /// CIDR inputs (repeatable; source=cidrs)
        #[arg(long = "cidr", value_name = "CIDR")]
        cidrs: Vec<String>,
        /// Single IP inputs (repeatable; source=single)
        #[arg(long = "ip", value_name = "IP")]
        ips: Vec<String>,
        /// Custom "start,end" pairs (repeatable; source=custom)
        #[arg(long = "range", value_name = "START,END")]
        ranges: Vec<String>,
    },
    /// List a provider's stored ranges
    List { provider_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum TestCommand {
    /// Enqueue and run the provider's test cycle to completion
    Start { provider_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ProgressCommand {
    /// Pop the oldest buffered progress event
    Next,
    /// Stream progress events until interrupted
    Follow,
}
