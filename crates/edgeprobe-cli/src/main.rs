//! EdgeProbe CLI
//!
//! Command-line front-end and worker binary for the EdgeProbe probing
//! service. Admin commands run one operation against the store and
//! exit; `worker` stays up with the in-process job broker and the cron
//! schedule until interrupted.

mod args;
mod output;

use anyhow::{bail, Context, Result};
use args::{Args, Command, ProgressCommand, ProviderCommand, RangesCommand, TestCommand};
use clap::Parser;
use edgeprobe_core::{AppSettings, ProgressBus, PROGRESS_CHANNEL};
use edgeprobe_jobs::{
    register_jobs, start_testing, JobContext, JobGroupRunner, LocalBroker, Scheduler,
    TESTING_GROUP,
};
use edgeprobe_prober::RangeIngestor;
use edgeprobe_store::Store;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Print bus events as JSON lines as they arrive
fn spawn_progress_printer(bus: &ProgressBus) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe(PROGRESS_CHANNEL, tx);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("bad progress event: {}", e),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let settings = AppSettings::from_env().context("reading environment settings")?;
    let store = match &args.db {
        Some(path) => Store::open(path).await?,
        None => Store::from_settings(&settings.database).await?,
    };

    match args.command {
        Command::Provider { command } => provider_command(&store, command).await,
        Command::Ranges { command } => ranges_command(&store, command).await,
        Command::Test { command } => test_command(&store, command).await,
        Command::BestIp { json } => best_ip(&store, json).await,
        Command::Progress { command } => progress_command(command).await,
        Command::Worker => worker(store, settings).await,
    }
}

async fn provider_command(store: &Store, command: ProviderCommand) -> Result<()> {
    match command {
        ProviderCommand::Create {
            name,
            api_url,
            logo_url,
        } => {
            let provider = store
                .create_provider(&name, api_url.as_deref(), logo_url.as_deref())
                .await?;
            println!("created provider {} ({})", provider.id, provider.name);
        }
        ProviderCommand::Update { id, name, logo_url } => {
            let provider = store
                .update_provider(id, name.as_deref(), logo_url.as_deref())
                .await?;
            println!("updated provider {} ({})", provider.id, provider.name);
        }
        ProviderCommand::Delete { id } => {
            store.soft_delete_provider(id).await?;
            println!("deleted provider {}", id);
        }
        ProviderCommand::List => {
            output::print_providers(&store.list_providers().await?);
        }
    }
    Ok(())
}

async fn ranges_command(store: &Store, command: RangesCommand) -> Result<()> {
    match command {
        RangesCommand::Update {
            provider_id,
            source,
            cidrs,
            ips,
            ranges,
        } => {
            let ingestor = RangeIngestor::new(store.clone());
            let stored = match source {
                args::SourceArg::Api => ingestor.ingest_from_api(provider_id).await?,
                args::SourceArg::Cidrs => {
                    if cidrs.is_empty() {
                        bail!("--source cidrs requires at least one --cidr");
                    }
                    ingestor.ingest_cidrs(provider_id, &cidrs).await?
                }
                args::SourceArg::Single => {
                    if ips.is_empty() {
                        bail!("--source single requires at least one --ip");
                    }
                    let parsed: Vec<IpAddr> = ips
                        .iter()
                        .map(|raw| raw.parse().context("invalid --ip value"))
                        .collect::<Result<_>>()?;
                    ingestor.ingest_single_ips(provider_id, &parsed).await?
                }
                args::SourceArg::Custom => {
                    if ranges.is_empty() {
                        bail!("--source custom requires at least one --range START,END");
                    }
                    let mut pairs = Vec::with_capacity(ranges.len());
                    for raw in &ranges {
                        let (start, end) = raw
                            .split_once(',')
                            .context("--range wants START,END")?;
                        pairs.push((
                            start.trim().parse().context("invalid range start")?,
                            end.trim().parse().context("invalid range end")?,
                        ));
                    }
                    ingestor.ingest_custom_ranges(provider_id, &pairs).await?
                }
            };
            println!("stored {} ranges for provider {}", stored, provider_id);
        }
        RangesCommand::List { provider_id } => {
            output::print_ranges(&store.ranges_for_provider(provider_id).await?);
        }
    }
    Ok(())
}

async fn test_command(store: &Store, command: TestCommand) -> Result<()> {
    match command {
        TestCommand::Start { provider_id } => {
            let bus = ProgressBus::default();
            let printer = spawn_progress_printer(&bus);

            let ctx = JobContext::new(store.clone(), bus);
            let broker = register_jobs(LocalBroker::new(), ctx);
            let runner = Arc::new(JobGroupRunner::new(Arc::new(broker)));

            start_testing(&runner, store, provider_id).await?;
            runner.join_group(TESTING_GROUP).await?;
            printer.abort();

            if let Some(best) = store.results().best().await? {
                println!("--- best ip after cycle ---");
                output::print_result(&best);
            }
        }
    }
    Ok(())
}

async fn best_ip(store: &Store, json: bool) -> Result<()> {
    let best = store.results().best().await?;
    match (best, json) {
        (Some(result), true) => println!("{}", serde_json::to_string_pretty(&result)?),
        (Some(result), false) => output::print_result(&result),
        (None, true) => println!("{{}}"),
        (None, false) => println!("no results yet"),
    }
    Ok(())
}

async fn progress_command(command: ProgressCommand) -> Result<()> {
    // Progress lives on the in-process bus; these commands observe the
    // bus of THIS process (probe work started here), not a remote worker
    let bus = ProgressBus::default();
    match command {
        ProgressCommand::Next => match bus.pull_next() {
            Some(event) => println!("{}", serde_json::to_string(&event)?),
            None => println!("no progress event"),
        },
        ProgressCommand::Follow => {
            let printer = spawn_progress_printer(&bus);
            tokio::signal::ctrl_c().await?;
            printer.abort();
        }
    }
    Ok(())
}

async fn worker(store: Store, settings: AppSettings) -> Result<()> {
    info!(
        "Worker starting (db {}, broker {}:{}/{})",
        settings.database.database_file(),
        settings.broker.host,
        settings.broker.port,
        settings.broker.db
    );

    let bus = ProgressBus::default();
    let ctx = JobContext::new(store.clone(), bus);
    let broker = register_jobs(LocalBroker::new(), ctx);
    info!("Registered jobs: {:?}", broker.job_names());

    let runner = Arc::new(JobGroupRunner::new(Arc::new(broker)));
    let scheduler = Scheduler::new(Arc::clone(&runner), store);
    let mut schedule_handle = scheduler.start().await?;

    info!("Worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    schedule_handle
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler shutdown failed: {}", e))?;
    Ok(())
}
