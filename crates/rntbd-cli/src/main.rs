//! # RNTBD CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a simulated replica with one document
//! rntbd serve -b 127.0.0.1:10251 --document 'dbs/d/colls/c/docs/x={"id":"x"}'
//!
//! # Read it with strong consistency from a three-replica set
//! rntbd read dbs/d/colls/c/docs/x -c strong \
//!   -r 127.0.0.1:10251 -r 127.0.0.1:10252 -r 127.0.0.1:10253
//! ```
//!
//! `read` prints one JSON line on stdout, also for replica errors, and
//! exits non-zero on failure.

use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use bytes::Bytes;
use rntbd_cli::replica::{ReplicaSettings, SimulatedReplica};
use rntbd_cli::summary::{ErrorSummary, ReadSummary};
use rntbd_client::DirectConfig;
use rntbd_common::transport::ReplicaServer;
use rntbd_common::{ConsistencyLevel, PartitionId, SessionToken, StoreRequest};
use rntbd_consistency::{DirectClient, StaticAddressResolver};

#[derive(FromArgs)]
/// RNTBD direct-mode tools
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Read(ReadArgs),
}

/// Arguments for running a simulated replica.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a simulated replica
struct ServeArgs {
    /// address to listen on
    #[argh(option, short = 'b', default = "\"127.0.0.1:10251\".into()")]
    bind: String,

    /// region id stamped into session tokens
    #[argh(option, long = "region", default = "1")]
    region: u32,

    /// LSN the replica starts at
    #[argh(option, long = "lsn", default = "1")]
    lsn: i64,

    /// write quorum reported to clients
    #[argh(option, long = "write-quorum", default = "1")]
    write_quorum: u32,

    /// number of read regions reported to clients
    #[argh(option, long = "read-regions", default = "0")]
    read_regions: u32,

    /// document to preload, as `resource-address=json`; repeatable
    #[argh(option, long = "document")]
    documents: Vec<String>,
}

/// Arguments for a single read through the consistency engine.
///
/// The first `--replica` is treated as the primary.
#[derive(FromArgs)]
#[argh(subcommand, name = "read")]
/// read one resource from a replica set
struct ReadArgs {
    /// resource address to read
    #[argh(positional)]
    resource_address: String,

    /// replica address; repeatable, first is the primary
    #[argh(option, short = 'r', long = "replica")]
    replicas: Vec<String>,

    /// consistency level: strong, bounded_staleness, session, eventual or
    /// consistent_prefix
    #[argh(option, short = 'c', long = "consistency", default = "\"session\".into()")]
    consistency: String,

    /// collection resource id
    #[argh(option, long = "collection", default = "\"coll\".into()")]
    collection: String,

    /// partition key range id
    #[argh(option, long = "range", default = "\"0\".into()")]
    range: String,

    /// session token to read at, as `region=lsn#region=lsn`
    #[argh(option, long = "session-token")]
    session_token: Option<String>,

    /// JSON file with `DirectConfig` overrides
    #[argh(option, long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // read keeps stdout clean for piping into jq
    if !matches!(cli.command, Commands::Read(_)) {
        // Set default log level to INFO, but allow RUST_LOG env var to override
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Read(args) => run_read(args).await,
    }
}

fn parse_document(entry: &str) -> Result<(String, Bytes)> {
    let (address, body) = entry
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid document '{}': expected resource-address=json", entry))?;
    serde_json::from_str::<serde_json::Value>(body)
        .map_err(|e| anyhow::anyhow!("Invalid JSON for document {}: {}", address, e))?;
    Ok((address.to_string(), Bytes::from(body.to_string())))
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let replica = Arc::new(SimulatedReplica::new(ReplicaSettings {
        region: args.region,
        initial_lsn: args.lsn,
        write_quorum: args.write_quorum,
        read_regions: args.read_regions,
    }));
    for entry in &args.documents {
        let (address, body) = parse_document(entry)?;
        replica.insert(address, body).await;
    }

    let server = ReplicaServer::bind(&args.bind).await?;
    tracing::info!(
        address = %server.local_addr()?,
        region = args.region,
        lsn = args.lsn,
        documents = args.documents.len(),
        "simulated replica listening"
    );
    replica.serve(server).await?;
    Ok(())
}

async fn run_read(args: ReadArgs) -> Result<()> {
    if args.replicas.is_empty() {
        anyhow::bail!("At least one --replica is required");
    }
    let level: ConsistencyLevel = args.consistency.parse()?;

    let mut config = match &args.config {
        Some(path) => DirectConfig::from_file(path)?,
        None => DirectConfig::default(),
    };
    config.consistency_level = level;

    let partition = PartitionId::new(args.collection, args.range);
    let resolver = Arc::new(StaticAddressResolver::new().with_partition(partition.clone(), args.replicas));
    let client = DirectClient::new(config, resolver)?;

    let mut request = StoreRequest::read(args.resource_address, partition).with_consistency(level);
    if let Some(token) = &args.session_token {
        request = request.with_session_token(token.parse::<SessionToken>()?);
    }

    let result = client.execute(request).await;
    client.close().await;

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string(&ReadSummary::from(&response))?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string(&ErrorSummary::from(&e))?);
            Err(e.into())
        }
    }
}
