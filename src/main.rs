use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use raft_election::cluster::LocalCluster;
use raft_election::config::NodeConfig;
use raft_election::persist::PersistentState;
use raft_election::raft::NodeStatus;
use raft_election::transport::NetworkConditions;

#[derive(Parser, Debug)]
#[command(name = "raft-election")]
#[command(version)]
#[command(about = "Raft leader election running on a simulated local network")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a local cluster, disturb it and check that elections stay safe
    Simulate(SimulateArgs),

    /// Decode a persisted node state file
    Inspect {
        /// Path to a node-<id>.state file
        file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "5")]
    nodes: usize,

    /// How long to run before printing the report
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    /// Delay and randomly drop messages
    #[arg(long)]
    unreliable: bool,

    /// Probability of losing a message in unreliable mode
    #[arg(long, default_value = "0.1", requires = "unreliable")]
    drop_rate: f64,

    /// Probability of delivering a request twice in unreliable mode
    #[arg(long, default_value = "0.1", requires = "unreliable")]
    duplicate_rate: f64,

    /// Isolate the current leader this often (0 disables chaos)
    #[arg(long, default_value = "2000")]
    chaos_interval_ms: u64,

    /// Persist node state to files in this directory instead of memory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SafetyViolation {
    term: u64,
    leaders: Vec<u64>,
}

#[derive(Serialize)]
struct SimulationReport {
    nodes: usize,
    elapsed_ms: u64,
    rpc_count: u64,
    duplicated: u64,
    highest_term: u64,
    /// Leader observed for each term, in term order.
    leaders_by_term: BTreeMap<u64, u64>,
    isolations: u64,
    violations: Vec<SafetyViolation>,
    final_state: Vec<NodeStatus>,
}

#[derive(Serialize)]
struct InspectOutput {
    file: String,
    current_term: u64,
    voted_for: Option<u64>,
}

// =============================================================================
// Simulation
// =============================================================================

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Record every leader seen per term. More than one id for a term is a
/// safety violation.
#[derive(Default)]
struct LeaderLedger {
    by_term: BTreeMap<u64, Vec<u64>>,
}

impl LeaderLedger {
    fn observe(&mut self, leaders: &[(u64, u64)]) {
        for &(node_id, term) in leaders {
            let seen = self.by_term.entry(term).or_default();
            if !seen.contains(&node_id) {
                if !seen.is_empty() {
                    tracing::error!(term, node_id, others = ?seen, "Two leaders in one term");
                }
                seen.push(node_id);
            }
        }
    }

    fn leaders_by_term(&self) -> BTreeMap<u64, u64> {
        self.by_term
            .iter()
            .filter_map(|(&term, ids)| ids.first().map(|&id| (term, id)))
            .collect()
    }

    fn violations(&self) -> Vec<SafetyViolation> {
        self.by_term
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(&term, ids)| SafetyViolation {
                term,
                leaders: ids.clone(),
            })
            .collect()
    }
}

async fn run_simulation(
    args: SimulateArgs,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let conditions = if args.unreliable {
        NetworkConditions {
            duplicate_rate: args.duplicate_rate,
            ..NetworkConditions::unreliable(args.drop_rate)
        }
    } else {
        NetworkConditions::default()
    };

    if let Some(dir) = &args.state_dir {
        std::fs::create_dir_all(dir)?;
    }

    tracing::info!(
        nodes = args.nodes,
        duration_secs = args.duration_secs,
        unreliable = args.unreliable,
        chaos_interval_ms = args.chaos_interval_ms,
        "Starting simulation"
    );

    let mut cluster = LocalCluster::start(
        args.nodes,
        NodeConfig::default(),
        conditions,
        args.state_dir.as_deref(),
    )
    .await?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_secs);
    let chaos_interval = Duration::from_millis(args.chaos_interval_ms);
    let mut next_chaos = started + chaos_interval;
    let mut isolated: Option<u64> = None;
    let mut isolations = 0;
    let mut ledger = LeaderLedger::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while Instant::now() < deadline {
        ledger.observe(&cluster.leaders().await);

        if args.chaos_interval_ms > 0 && Instant::now() >= next_chaos {
            next_chaos += chaos_interval;
            if let Some(previous) = isolated.take() {
                cluster.heal(previous).await;
            }
            // Take the newest leader off the network.
            if let Some(&(leader, term)) =
                cluster.leaders().await.iter().max_by_key(|(_, term)| *term)
            {
                tracing::info!(node_id = leader, term, "Chaos: isolating leader");
                cluster.isolate(leader).await;
                isolated = Some(leader);
                isolations += 1;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, stopping simulation early");
                break;
            }
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let final_state = cluster.statuses().await;
    let rpc_count = cluster.network().rpc_count();
    let duplicated = cluster.network().duplicate_count();
    cluster.shutdown().await;

    Ok(SimulationReport {
        nodes: args.nodes,
        elapsed_ms,
        rpc_count,
        duplicated,
        highest_term: final_state.iter().map(|s| s.term).max().unwrap_or(0),
        leaders_by_term: ledger.leaders_by_term(),
        isolations,
        violations: ledger.violations(),
        final_state,
    })
}

fn print_report(
    report: &SimulationReport,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("Simulation Summary");
            println!("{}", "=".repeat(40));
            println!("Nodes:        {}", report.nodes);
            println!("Elapsed:      {} ms", report.elapsed_ms);
            println!("RPCs sent:    {}", report.rpc_count);
            println!("Duplicated:   {}", report.duplicated);
            println!("Highest term: {}", report.highest_term);
            println!("Isolations:   {}", report.isolations);
            println!();

            println!("{:<8} LEADER", "TERM");
            println!("{}", "-".repeat(20));
            for (term, leader) in &report.leaders_by_term {
                println!("{:<8} {}", term, leader);
            }
            println!();

            println!("{:<8} {:<8} {:<10} {:<10} LEADER", "NODE", "TERM", "ROLE", "VOTED");
            println!("{}", "-".repeat(46));
            for status in &report.final_state {
                println!(
                    "{:<8} {:<8} {:<10} {:<10} {}",
                    status.node_id,
                    status.term,
                    status.role,
                    format_id(status.voted_for),
                    format_id(status.leader_id),
                );
            }
            println!();

            if report.violations.is_empty() {
                println!("Election safety: OK");
            } else {
                for violation in &report.violations {
                    println!(
                        "Election safety VIOLATED in term {}: leaders {:?}",
                        violation.term, violation.leaders
                    );
                }
            }
        }
    }
    Ok(())
}

fn format_id(id: Option<u64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}

// =============================================================================
// Inspect
// =============================================================================

fn handle_inspect(
    file: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(&file)?;
    let state = PersistentState::decode(&data)?;

    match output_format {
        OutputFormat::Json => {
            let output = InspectOutput {
                file: file.display().to_string(),
                current_term: state.current_term,
                voted_for: state.voted_for,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("File:      {}", file.display());
            println!("Term:      {}", state.current_term);
            println!("Voted for: {}", format_id(state.voted_for));
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

    match args.command {
        Commands::Simulate(simulate_args) => {
            let output = simulate_args.output.clone();
            let report = run_simulation(simulate_args).await?;
            print_report(&report, &output)?;
            if !report.violations.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Inspect { file, output } => {
            handle_inspect(file, &output)?;
        }
    }

    Ok(())
}
