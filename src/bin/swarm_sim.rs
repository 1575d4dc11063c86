use clap::Parser;
use std::io;
use std::path::PathBuf;
use swarm_engine::sim::{SimConfig, Swarm};

#[derive(Parser)]
#[command(version, about = "Round-driven swarm simulator")]
struct Args {
    /// JSON simulation config, defaults to a small mixed swarm
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the RNG seed of the config
    #[arg(short, long)]
    seed: Option<u64>,

    /// Override the round limit of the config
    #[arg(short, long)]
    rounds: Option<usize>,

    /// Print the effective config and exit
    #[arg(long)]
    dump_config: bool,

    /// Log per-round decisions (-v) or per-request detail (-vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Example usage:
/// ```
/// ./target/release/swarm_sim --seed=42 --rounds=300 -v
/// ```
fn main() -> io::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new()
        .with_threads(false)
        .with_level(log::LevelFilter::Off)
        .with_module_level("swarm_engine", level)
        .with_module_level("swarm_sim", level)
        .init()
        .map_err(io::Error::other)?;

    let mut config = match &args.config {
        Some(path) => SimConfig::load(path).map_err(io::Error::other)?,
        None => SimConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(rounds) = args.rounds {
        config.max_rounds = rounds;
    }

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut swarm = Swarm::new(config).map_err(io::Error::other)?;
    let report = swarm.run().map_err(io::Error::other)?;

    println!("rounds: {}", report.rounds);
    for participant in &report.participants {
        let completed = match participant.completed_at {
            _ if participant.seeding => "seed".to_string(),
            Some(round) => format!("round {round}"),
            None => "incomplete".to_string(),
        };
        println!(
            "{:<16} capacity={:<3} completed: {:<12} up={:<6} down={}",
            participant.id.as_str(),
            participant.upload_capacity,
            completed,
            participant.uploaded,
            participant.downloaded
        );
    }
    Ok(())
}
