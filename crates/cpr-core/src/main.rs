//! Commons Simulation
//!
//! Runs scripted agents through repeated iterations of the common-pool
//! game and writes the turn log and run summary.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cpr_core::config::SimConfig;
use cpr_core::context::SimulationContext;
use cpr_core::error::SimError;
use cpr_core::output::{write_summary, JsonlRecorder};
use cpr_core::setup::spawn_agents;
use cpr_core::systems::RoundOrchestrator;

/// Seed offset for the population so agent ids do not share a stream with the game
const SPAWN_SEED_OFFSET: u64 = 0x5eed;

/// Command line arguments for the simulation
#[derive(Parser, Debug)]
#[command(name = "commons_sim")]
#[command(about = "Teams of agents governing a shared pool")]
struct Args {
    /// TOML configuration file (defaults to commons.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Number of iterations
    #[arg(long)]
    iterations: Option<u32>,

    /// Turns per iteration
    #[arg(long)]
    turns: Option<u32>,

    /// Number of agents
    #[arg(long)]
    agents: Option<usize>,

    /// Target team size
    #[arg(long)]
    team_size: Option<usize>,

    /// Output directory
    #[arg(long)]
    output: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long, short)]
    verbose: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,
}

impl Args {
    fn apply(&self, config: &mut SimConfig) {
        let sim = &mut config.simulation;
        if let Some(seed) = self.seed {
            sim.seed = seed;
        }
        if let Some(iterations) = self.iterations {
            sim.iterations = iterations;
        }
        if let Some(turns) = self.turns {
            sim.turns_per_iteration = turns;
        }
        if let Some(agents) = self.agents {
            sim.agent_count = agents;
        }
        if let Some(team_size) = self.team_size {
            sim.team_size = team_size;
        }
        if let Some(output) = &self.output {
            config.output.directory = output.display().to_string();
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), SimError> {
    if args.print_default_config {
        println!("{}", SimConfig::default().to_toml()?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::load_or_default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let sim = &config.simulation;
    tracing::info!(
        seed = sim.seed,
        iterations = sim.iterations,
        turns = sim.turns_per_iteration,
        agents = sim.agent_count,
        team_size = sim.team_size,
        "starting commons simulation"
    );

    let mut spawn_ctx = SimulationContext::seeded(sim.seed.wrapping_add(SPAWN_SEED_OFFSET));
    let agents = spawn_agents(&config, &mut spawn_ctx);

    let output_dir = PathBuf::from(&config.output.directory);
    fs::create_dir_all(&output_dir).map_err(cpr_core::error::RecorderError::from)?;

    let mut orchestrator = RoundOrchestrator::new(&config, agents)?;
    if config.output.record_turns {
        let recorder = JsonlRecorder::new(output_dir.join("turns.jsonl"))?;
        orchestrator = orchestrator.with_recorder(recorder);
    }

    let summary = orchestrator.run();
    let summary_path = output_dir.join("summary.json");
    write_summary(&summary, &summary_path)?;

    tracing::info!(
        survivors = summary.survivors,
        eliminated = summary.total_eliminated,
        expelled = summary.total_expelled,
        summary = %summary_path.display(),
        "simulation complete"
    );
    Ok(())
}
