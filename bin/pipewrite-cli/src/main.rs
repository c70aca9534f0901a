//! pipewrite CLI - exercise the key write path
//!
//! Writes a generated payload through a `KeyWriter` into an in-memory
//! cluster, optionally breaking the cluster half-way through, then reads
//! the key back and reports where its bytes ended up.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use pipewrite_client::{KeyWriter, WriteStatsSnapshot};
use pipewrite_common::{
    BlockDescriptor, ChecksumCalculator, Config, ExcludeSnapshot, KeyName, PayloadDigest,
};
use pipewrite_minicluster::{CommitWatch, MiniCluster};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pipewrite-cli")]
#[command(about = "pipewrite key write path driver")]
#[command(version)]
struct Args {
    /// Config file path (TOML)
    #[arg(short, long, env = "PIPEWRITE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write one key, optionally injecting failures mid-write
    Put(PutArgs),
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
struct PutArgs {
    /// Key name
    #[arg(long, default_value = "vol1/bucket1/key1")]
    key: String,

    /// Payload size in bytes
    #[arg(long)]
    size: u64,

    /// Block size in bytes (overrides the config file)
    #[arg(long)]
    block_size: Option<u64>,

    /// Chunk size in bytes (overrides the config file)
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Number of storage nodes in the cluster
    #[arg(long, default_value = "10")]
    nodes: usize,

    /// Shut down this many members of the active pipeline half-way through
    #[arg(long, default_value = "0")]
    fail_nodes: usize,

    /// Close the active block's container half-way through
    #[arg(long)]
    close_container: bool,

    /// Replicas a commit must reach
    #[arg(long, value_enum, default_value = "majority")]
    commit_watch: WatchArg,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WatchArg {
    Majority,
    All,
}

impl From<WatchArg> for CommitWatch {
    fn from(arg: WatchArg) -> Self {
        match arg {
            WatchArg::Majority => Self::Majority,
            WatchArg::All => Self::All,
        }
    }
}

#[derive(Serialize)]
struct PutReport {
    key: String,
    size: u64,
    committed_length: u64,
    verified: bool,
    digest: PayloadDigest,
    blocks: Vec<BlockDescriptor>,
    excluded: ExcludeSnapshot,
    stats: WriteStatsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Commands::Put(put) => run_put(config, put).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_put(mut config: Config, args: PutArgs) -> Result<()> {
    if let Some(block_size) = args.block_size {
        config.client.block_size = block_size;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.client.chunk_size = chunk_size;
    }
    config.client.validate()?;

    let cluster = MiniCluster::builder()
        .nodes(args.nodes)
        .replication(config.client.replication)
        .commit_watch(args.commit_watch.into())
        .build()?;

    let key = KeyName::new(args.key.clone())?;
    let payload = generate_payload(args.size);
    let (head, tail) = payload.split_at(payload.len() / 2);

    info!(key = %key, size = args.size, "starting put");
    let mut writer = KeyWriter::open(key, args.size, config.client.clone(), cluster.clients())
        .await?;
    writer.write(head).await?;

    let inject = args.fail_nodes > 0 || args.close_container;
    let descriptors = writer.block_descriptors();
    if let Some(active) = descriptors.last().filter(|_| inject) {
        if args.close_container {
            let container = active.container_id();
            warn!(container = %container, "closing container");
            cluster.close_container(container)?;
        }
        if args.fail_nodes > 0 {
            let pipeline = cluster
                .pipeline(active.pipeline_id)
                .context("active block has no pipeline")?;
            for node in pipeline.nodes.iter().take(args.fail_nodes) {
                warn!(node = %node, "shutting down node");
                cluster.shutdown_node(*node)?;
            }
        }
    } else if inject {
        warn!("no block open after the first half of the payload, skipping fault injection");
    }

    writer.write(tail).await?;
    writer.flush().await?;
    let excluded = writer.exclude_list().snapshot();
    let commit = writer.close().await?;

    let read_back = cluster.read_key(commit.key.as_str())?;
    let written = digest(&payload);
    let read = digest(&read_back);
    let verified = written == read;
    if !verified {
        bail!(
            "read-back mismatch: wrote {} bytes (crc32c {:08x}), read {} bytes (crc32c {:08x})",
            written.len,
            written.crc32c,
            read.len,
            read.crc32c
        );
    }

    let report = PutReport {
        key: args.key,
        size: args.size,
        committed_length: commit.total_length,
        verified,
        digest: written,
        blocks: commit.blocks,
        excluded,
        stats: writer.stats(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn digest(data: &[u8]) -> PayloadDigest {
    let mut calc = ChecksumCalculator::with_sha256();
    calc.update(data);
    calc.finalize()
}

/// Deterministic, non-repeating-per-block payload
fn generate_payload(size: u64) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

fn print_report(report: &PutReport) {
    println!("Key: {}", report.key);
    println!("=====");
    println!("Size:      {}", report.size);
    println!("Committed: {}", report.committed_length);
    println!("Verified:  {}", report.verified);
    println!("CRC32C:    {:08x}", report.digest.crc32c);
    println!("XXH64:     {:016x}", report.digest.xxhash64);
    println!();
    println!("{:<6} {:<16} {:<38} {:>12} {:>12}", "#", "BLOCK", "PIPELINE", "OFFSET", "LENGTH");
    for (i, block) in report.blocks.iter().enumerate() {
        println!(
            "{:<6} {:<16} {:<38} {:>12} {:>12}",
            i,
            block.block_id.to_string(),
            block.pipeline_id.to_string(),
            block.offset,
            block.length
        );
    }
    println!();
    println!("Excluded containers: {}", report.excluded.containers.len());
    println!("Excluded pipelines:  {}", report.excluded.pipelines.len());
    println!("Excluded nodes:      {}", report.excluded.nodes.len());
    println!();
    println!("Chunks written:   {}", report.stats.chunks_written);
    println!("In-place retries: {}", report.stats.in_place_retries);
    println!("Replacements:     {}", report.stats.replacements);
    println!("Bytes replayed:   {}", report.stats.bytes_replayed);
}
