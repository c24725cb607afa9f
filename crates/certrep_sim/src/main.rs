//! certsim
//!
//! Runs a simulated certification cluster and prints its counters.

use certrep_core::RollbackMode;
use certrep_sim::{SimParams, Simulator};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Load-test the replication state machine on an in-process cluster.
#[derive(Parser)]
#[command(name = "certsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of servers
    #[arg(long, default_value_t = 2)]
    servers: usize,

    /// Client connections per server
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Transactions per client
    #[arg(long, default_value_t = 100)]
    transactions: usize,

    /// Size of the key space
    #[arg(long, default_value_t = 1000)]
    keys: u64,

    /// Average applies between simulated lock conflicts (0 disables)
    #[arg(long, default_value_t = 0)]
    alg_freq: u64,

    /// Rollback mode for BF-aborted idle connections
    #[arg(long, value_enum, default_value = "async")]
    rollback_mode: RollbackArg,

    /// Commit through a separate prepare phase
    #[arg(long)]
    two_phase: bool,

    /// Connection debug log level
    #[arg(long, default_value_t = 0)]
    debug_log_level: u32,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    stats_json: bool,

    /// Status file for the first server
    #[arg(long)]
    reporter_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RollbackArg {
    Async,
    Sync,
}

impl From<RollbackArg> for RollbackMode {
    fn from(arg: RollbackArg) -> Self {
        match arg {
            RollbackArg::Async => RollbackMode::Async,
            RollbackArg::Sync => RollbackMode::Sync,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut params = SimParams::new()
        .servers(cli.servers)
        .clients(cli.clients)
        .transactions(cli.transactions)
        .keys(cli.keys)
        .alg_freq(cli.alg_freq)
        .rollback_mode(cli.rollback_mode.into())
        .two_phase(cli.two_phase)
        .debug_log_level(cli.debug_log_level);
    if let Some(seed) = cli.seed {
        params = params.seed(seed);
    }
    if let Some(path) = cli.reporter_file {
        params = params.reporter_file(path);
    }

    let report = Simulator::new(params).run()?;
    if cli.stats_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }
    Ok(())
}
