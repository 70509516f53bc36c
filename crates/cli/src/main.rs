//! `blockctl`: operator CLI for the torus block-management core.
//!
//! Loads a `bluegene.conf`-style configuration file, builds an [`Engine`]
//! against an in-process [`EmulatedBridge`] (the real hardware bridge is out
//! of scope for this core, per spec.md §1), and exposes the thin
//! "smap/scontrol-style" surface SPEC_FULL.md §2 describes: print the block
//! table, submit/start/terminate a job against it, and drive a
//! reconciliation pass on demand.

use std::fs;
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use blockmgr_core::allocator::Request;
use blockmgr_core::block::ConnType;
use blockmgr_core::bridge::EmulatedBridge;
use blockmgr_core::config::Config;
use blockmgr_core::job_bridge::{Job, SubmitMode};
use blockmgr_core::lifecycle::JobEffects;
use blockmgr_core::registry::ListFilter;
use blockmgr_core::Engine;

#[derive(Parser, Debug)]
#[command(
    name = "blockctl",
    author,
    version,
    about = "Operator CLI for the torus block-management core",
    long_about = "Loads a bluegene.conf-style configuration file and drives the block-management \
core against an in-process emulated controller.\n\nExamples:\n  blockctl -c bluegene.conf list\n  \
blockctl -c bluegene.conf submit --job 42 --user alice --nodes 512\n  blockctl -c bluegene.conf reconcile"
)]
struct Cli {
    /// Path to the `bluegene.conf`-style configuration file.
    #[arg(short, long, default_value = "bluegene.conf")]
    config: String,

    /// Emit the block table as JSON instead of a plain table.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every configured block and its current state.
    List,

    /// Submit a job and (unless `--test-only`) reserve a block for it.
    Submit {
        #[arg(long)]
        job: u32,
        #[arg(long)]
        user: String,
        #[arg(long)]
        nodes: u32,
        #[arg(long, default_value = "torus")]
        conn_type: String,
        /// Evaluate placement only; do not reserve anything.
        #[arg(long)]
        test_only: bool,
    },

    /// Start a previously submitted job on its reserved block.
    Start {
        #[arg(long)]
        job: u32,
    },

    /// Report whether a started job's block has become ready.
    Ready {
        #[arg(long)]
        job: u32,
    },

    /// Terminate a job and free its block.
    Term {
        #[arg(long)]
        job: u32,
    },

    /// Re-run the startup reconciliation procedure against the controller.
    Reconcile,
}

/// Logs requeue/fail outcomes the lifecycle engine and health poller can't
/// report synchronously — the RPC layer that would otherwise carry these
/// back to a scheduler is out of scope here (spec.md §1).
struct LoggingEffects;

impl JobEffects for LoggingEffects {
    fn requeue(&self, job_id: u32) {
        tracing::info!(job_id, "job requeued");
    }

    fn fail(&self, job_id: u32, reason: String) {
        tracing::warn!(job_id, reason, "job failed");
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn parse_conn_type(s: &str) -> ConnType {
    match s.to_ascii_lowercase().as_str() {
        "mesh" => ConnType::Mesh,
        "small" => ConnType::Small,
        _ => ConnType::Torus,
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let text = fs::read_to_string(&cli.config).unwrap_or_else(|e| {
        eprintln!("error reading config '{}': {e}", cli.config);
        process::exit(1);
    });
    let config = Config::parse(&text).unwrap_or_else(|e| {
        eprintln!("error parsing config: {e}");
        process::exit(1);
    });

    let bridge = Arc::new(EmulatedBridge::new());
    let (engine, report) = Engine::start(
        config,
        bridge,
        Arc::new(LoggingEffects),
        Arc::new(|_job_id: u32| now_unix()),
        Arc::new(now_unix),
    )
    .unwrap_or_else(|e| {
        eprintln!("error starting engine: {e}");
        process::exit(1);
    });

    println!(
        "reconciled: {} matched, {} adopted, {} deleted, {} errored",
        report.matched, report.adopted, report.deleted, report.errored
    );

    match cli.command {
        Commands::List => cmd_list(&engine, cli.json),
        Commands::Submit { job, user, nodes, conn_type, test_only } => {
            cmd_submit(&engine, job, user, nodes, &conn_type, test_only);
        }
        Commands::Start { job } => cmd_start(&engine, job),
        Commands::Ready { job } => cmd_ready(&engine, job),
        Commands::Term { job } => cmd_term(&engine, job),
        Commands::Reconcile => cmd_reconcile(&engine),
    }

    engine.shutdown();
}

fn cmd_list(engine: &Engine, json: bool) {
    let blocks = engine.registry().list(ListFilter::Main);
    if json {
        match serde_json::to_string_pretty(&blocks.iter().map(block_summary).collect::<Vec<_>>()) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("error serializing block table: {e}"),
        }
        return;
    }
    println!("{:<16} {:>6} {:<12} {:<12} {:<8}", "BLOCK", "NODES", "STATE", "CONN", "JOB");
    for b in blocks {
        println!(
            "{:<16} {:>6} {:<12?} {:<12?} {:<8}",
            b.id,
            b.node_cnt,
            b.state,
            b.conn_type,
            b.job_running.job_id().map_or("-".to_string(), |j| j.to_string())
        );
    }
}

fn block_summary(b: &blockmgr_core::block::Block) -> serde_json::Value {
    serde_json::json!({
        "id": b.id,
        "node_cnt": b.node_cnt,
        "state": format!("{:?}", b.state),
        "conn_type": format!("{:?}", b.conn_type),
        "job": b.job_running.job_id(),
    })
}

fn cmd_submit(engine: &Engine, job: u32, user: String, nodes: u32, conn_type: &str, test_only: bool) {
    let request = Request {
        node_count: nodes,
        conn_type: parse_conn_type(conn_type),
        geometry_hint: (0, 0, 0),
        rotate: false,
        reboot: false,
        images: None,
    };
    let mode = if test_only { SubmitMode::TestOnly } else { SubmitMode::Normal };
    let outcome = engine.job_bridge().submit_job(&Job { id: job, user, images: None }, &request, mode);
    match (outcome.block_id, outcome.error) {
        (Some(block_id), _) => println!("job {job}: placed on {block_id}"),
        (None, Some(e)) => println!("job {job}: not placed yet ({e}); est_start={:?}", outcome.est_start),
        (None, None) => println!("job {job}: no placement and no error reported"),
    }
}

fn cmd_start(engine: &Engine, job: u32) {
    match engine.job_bridge().start_job(&Job { id: job, user: String::new(), images: None }) {
        Ok(()) => println!("job {job}: start requested"),
        Err(e) => println!("job {job}: {e}"),
    }
}

fn cmd_ready(engine: &Engine, job: u32) {
    println!("job {job}: {:?}", engine.job_bridge().job_ready(job));
}

fn cmd_term(engine: &Engine, job: u32) {
    engine.job_bridge().term_job(job);
    println!("job {job}: terminate requested");
}

fn cmd_reconcile(engine: &Engine) {
    match engine.reconcile() {
        Ok(report) => println!(
            "reconciled: {} matched, {} adopted, {} deleted, {} errored",
            report.matched, report.adopted, report.deleted, report.errored
        ),
        Err(e) => eprintln!("reconcile failed: {e}"),
    }
}
