use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use fleetcast::artifact::LocalBlobStore;
use fleetcast::config::DispatchConfig;
use fleetcast::directory::NodeDirectory;
use fleetcast::job::{EnvMode, JobRecord};
use fleetcast::queue::SpoolQueue;
use fleetcast::{Dispatcher, SubmitRequest};

#[derive(Parser, Debug)]
#[command(name = "fleetcast")]
#[command(version)]
#[command(about = "Run a command on many nodes through a shared job spool")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Spool directory shared with the node agents (one subdirectory per node)
    #[arg(long, global = true, default_value = "var/spool")]
    spool: PathBuf,

    /// Content-addressed blob directory shared with the node agents
    #[arg(long, global = true, default_value = "var/blobs")]
    blob_dir: PathBuf,

    /// Local cache for retrieved files
    #[arg(long, global = true, default_value = "var/cache")]
    cache_dir: PathBuf,

    /// Directory pushed by sys.rsync_module
    #[arg(long, global = true, default_value = "module")]
    module_dir: PathBuf,

    /// File holding the shared token used for aes envelopes
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Delay between result polls, in milliseconds
    #[arg(long, global = true, default_value = "200")]
    poll_interval_ms: u64,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a command to every node matching a pattern
    Submit {
        /// Command name (e.g. "sys.ping", "sys.copy")
        cmd: String,

        /// Positional arguments passed to the command
        args: Vec<String>,

        /// Node pattern (regex matched from the start of the node name)
        #[arg(long, short = 'n')]
        nodes: String,

        /// Pattern of nodes to leave out
        #[arg(long, short = 'x')]
        exclude: Option<String>,

        /// Named argument, KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "kw", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,

        /// Seconds to wait for results (0 returns right after queueing)
        #[arg(long, default_value = "0")]
        wait: u64,

        /// Concurrency hint for the node agent
        #[arg(long)]
        nthread: Option<u32>,

        /// Use this job id instead of a generated one
        #[arg(long)]
        jid: Option<String>,

        /// Encrypt payloads with the shared token (needs --token-file)
        #[arg(long)]
        aes: bool,
    },
    /// Read results for a job from several nodes
    Fetch {
        jid: String,

        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Show the record of one node's job
    Status { node: String, jid: String },
    /// Remove one node's job from the spool
    Delete { node: String, jid: String },
    /// Print a freshly generated job id
    Jid,
    /// List the nodes matching a pattern
    Nodes {
        #[arg(default_value = ".*")]
        pattern: String,

        #[arg(long, short = 'x')]
        exclude: Option<String>,
    },
    /// Add a node to the spool
    Register { node: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct FetchItem {
    node: String,
    env: Option<String>,
    status: Option<String>,
    #[serde(rename = "return")]
    ret: Option<Value>,
}

#[derive(Serialize)]
struct DeleteOutput {
    node: String,
    jid: String,
    deleted: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_kwarg(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn build_dispatcher(
    common: &CommonArgs,
    aes: bool,
) -> Result<Dispatcher, Box<dyn std::error::Error>> {
    let token = match &common.token_file {
        Some(path) => tokio::fs::read_to_string(path).await?.trim().to_string(),
        None => String::new(),
    };

    let mut config = DispatchConfig::new(&common.cache_dir)
        .with_module_dir(&common.module_dir)
        .with_poll_interval_ms(common.poll_interval_ms)
        .with_token(token);
    if aes {
        config.env = EnvMode::Aes;
    }

    let spool = Arc::new(SpoolQueue::new(&common.spool));
    let store = Arc::new(LocalBlobStore::new(&common.blob_dir));
    Ok(Dispatcher::new(config, spool.clone(), spool, store)?)
}

fn print_record(node: &str, record: &JobRecord, output: &OutputFormat) -> serde_json::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
        OutputFormat::Table => {
            println!("Node:    {}", node);
            println!("Job ID:  {}", record.jid);
            println!("Command: {}", record.cmd);
            println!("Status:  {}", record.status);
            if let Some(ret) = record.return_value() {
                println!("Return:");
                for line in render_value(ret).lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_submit(
    dispatcher: Dispatcher,
    cmd: String,
    args: Vec<String>,
    nodes: String,
    exclude: Option<String>,
    kwargs: Vec<(String, Value)>,
    wait: u64,
    nthread: Option<u32>,
    output: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut request = SubmitRequest::new(cmd, nodes).wait(Duration::from_secs(wait));
    request.node_exclude = exclude;
    request.nthread = nthread;
    for arg in args {
        request = request.arg(arg);
    }
    for (key, value) in kwargs {
        request = request.kwarg(key, value);
    }

    let report = dispatcher.submit(request).await;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            println!("Job ID:  {}", report.jid);
            println!("Message: {}", report.message);
            if wait > 0 && !report.extra_data.is_empty() {
                println!();
                println!("{:<24} RETURN", "NODE");
                println!("{}", "-".repeat(60));
                for (node, ret) in &report.extra_data {
                    println!("{:<24} {}", node, render_value(ret));
                }
            }
        }
    }
    Ok(report.is_success())
}

async fn handle_fetch(
    dispatcher: &Dispatcher,
    jid: String,
    nodes: Vec<String>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let pairs: Vec<(String, String)> = nodes.iter().map(|n| (n.clone(), jid.clone())).collect();
    let fetched = dispatcher.fetch(&pairs).await;

    let items: Vec<FetchItem> = nodes
        .iter()
        .map(|node| match fetched.get(node).and_then(Option::as_ref) {
            Some(job) => FetchItem {
                node: node.clone(),
                env: Some(job.env.to_string()),
                status: Some(job.record.status.to_string()),
                ret: job.record.return_value().cloned(),
            },
            None => FetchItem {
                node: node.clone(),
                env: None,
                status: None,
                ret: None,
            },
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Table => {
            println!("{:<24} {:<8} RETURN", "NODE", "STATUS");
            println!("{}", "-".repeat(60));
            for item in items {
                println!(
                    "{:<24} {:<8} {}",
                    item.node,
                    item.status.as_deref().unwrap_or("-"),
                    item.ret.as_ref().map(render_value).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let common = args.common;
    match args.command {
        Commands::Submit {
            cmd,
            args,
            nodes,
            exclude,
            kwargs,
            wait,
            nthread,
            jid,
            aes,
        } => {
            let mut dispatcher = build_dispatcher(&common, aes).await?;
            if let Some(jid) = jid {
                dispatcher = dispatcher.with_jid(jid);
            }
            let ok = handle_submit(
                dispatcher,
                cmd,
                args,
                nodes,
                exclude,
                kwargs,
                wait,
                nthread,
                &common.output,
            )
            .await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Fetch { jid, nodes } => {
            let dispatcher = build_dispatcher(&common, false).await?;
            handle_fetch(&dispatcher, jid, nodes, &common.output).await?;
        }
        Commands::Status { node, jid } => {
            let dispatcher = build_dispatcher(&common, false).await?;
            match dispatcher.fetch_one(&node, &jid).await {
                Some(record) => print_record(&node, &record, &common.output)?,
                None => {
                    eprintln!("No job {} on node {}", jid, node);
                    std::process::exit(1);
                }
            }
        }
        Commands::Delete { node, jid } => {
            let dispatcher = build_dispatcher(&common, false).await?;
            let deleted = dispatcher.delete(&node, &jid).await;
            match common.output {
                OutputFormat::Json => {
                    let output = DeleteOutput { node, jid, deleted };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if deleted {
                        println!("Deleted job {} on node {}", jid, node);
                    } else {
                        println!("Nothing to delete for job {} on node {}", jid, node);
                    }
                }
            }
        }
        Commands::Jid => {
            let dispatcher = build_dispatcher(&common, false).await?;
            println!("{}", dispatcher.jid());
        }
        Commands::Nodes { pattern, exclude } => {
            let spool = SpoolQueue::new(&common.spool);
            let nodes = spool.resolve(&pattern, exclude.as_deref()).await?;
            match common.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
                OutputFormat::Table => {
                    if nodes.is_empty() {
                        println!("No nodes found.");
                    }
                    for node in nodes {
                        println!("{}", node);
                    }
                }
            }
        }
        Commands::Register { node } => {
            let spool = SpoolQueue::new(&common.spool);
            spool.register_node(&node).await?;
            println!("Registered node {}", node);
        }
    }

    Ok(())
}
