use clap::Parser;
use scamp_runner::{
    balance,
    campaign::{Campaign, CampaignConfig},
    checkpoint::CheckpointStore,
    manifest::{Manifest, ManifestError},
    render,
    scheduler::pbs::PbsScheduler,
    status::{JobState, Reconciler},
};
use std::{fs, path::PathBuf, process::exit, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum SetupError {
    #[error("failed to load manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("failed to prepare the output directory: {0}")]
    Output(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "scamp", about = "Campaign runner for batch-scheduled benchmarks")]
struct Args {
    /// campaign manifest (YAML)
    manifest: PathBuf,

    /// directory for rendered artifacts and the checkpoint
    #[arg(short, long, default_value = "campaign")]
    output: PathBuf,

    /// maximum number of jobs in flight
    #[arg(short = 'j', long, default_value_t = 4)]
    cap: usize,

    /// seconds between polling rounds
    #[arg(short, long, default_value_t = 10)]
    interval: u64,

    /// bucket weight limit for the load balancer, in processor slots
    #[arg(short, long, default_value_t = 32)]
    bucket_limit: u64,

    /// workload executable the submission script starts
    #[arg(long, default_value = "./bench")]
    program: String,

    /// seconds before an external scheduler call is abandoned
    #[arg(long, default_value_t = 30)]
    command_timeout: u64,

    /// expand, balance and render without submitting anything
    #[arg(long)]
    dry_run: bool,
}

fn run(args: Args) -> Result<(), SetupError> {
    let manifest = Manifest::load(&args.manifest)?;
    let specs = manifest.expand()?;
    info!(jobs = specs.len(), "expanded manifest");

    let specs = balance::balance(specs, args.bucket_limit);

    fs::create_dir_all(&args.output)?;

    if args.dry_run {
        for spec in specs.iter() {
            render::write_artifacts(spec, &args.program, &args.output)?;
        }
        info!(
            jobs = specs.len(),
            output = ?args.output,
            "dry run, artifacts rendered without submission"
        );

        return Ok(());
    }

    let scheduler = PbsScheduler::new(
        args.output.clone(),
        args.program.clone(),
        Duration::from_secs(args.command_timeout),
    );
    let mut campaign = Campaign::new(
        &scheduler,
        Reconciler::new(args.output.clone()),
        CheckpointStore::new(args.output.join("checkpoint.yaml")),
        CampaignConfig {
            cap: args.cap,
            poll_interval: Duration::from_secs(args.interval),
            submit_throttle: Duration::from_millis(500),
        },
        specs,
    );

    let phase = campaign.run();
    info!(phase = ?phase, "campaign finished");

    let unresolved = campaign
        .records()
        .values()
        .filter(|record| record.state == JobState::Unknown)
        .count();
    if unresolved > 0 {
        warn!(
            jobs = unresolved,
            "campaign ended with unresolved jobs, inspect the checkpoint"
        );
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run(Args::parse()) {
        error!(error = %error, "campaign aborted before any submission");
        exit(1);
    }
}
