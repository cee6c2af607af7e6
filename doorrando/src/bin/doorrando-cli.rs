use anyhow::{Result, bail};
use clap::Parser;
use doorrando::randomize::{Randomization, Randomizer, rng_from_seed};
use doorrando::settings::{RandomizerSettings, load_randomizer_settings};
use doorrando_game::World;
use log::info;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    world: PathBuf,

    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    random_seed: Option<u64>,

    #[arg(long, default_value_t = 100)]
    max_attempts: usize,

    #[arg(long)]
    output_spoiler_log: Option<PathBuf>,
}

fn get_randomization(
    args: &Args,
    world: &World,
    settings: &RandomizerSettings,
) -> Result<Randomization> {
    let root_seed = match args.random_seed {
        Some(s) => s,
        None => StdRng::from_entropy().next_u64() & 0xFFFFFFFF,
    };
    info!("Root seed: {root_seed}");
    let mut rng = rng_from_seed(root_seed);
    let max_attempts = args.max_attempts;
    let randomizer = Randomizer::new(world, settings);
    for attempt_num in 1..=max_attempts {
        let attempt_seed = rng.next_u64() & 0xFFFFFFFF;
        info!("Attempt {attempt_num}/{max_attempts}: seed={attempt_seed}");
        match randomizer.randomize(attempt_num, attempt_seed) {
            Ok(randomization) => {
                return Ok(randomization);
            }
            Err(e) if e.is_retryable() => {
                info!("Attempt {attempt_num}/{max_attempts}: Randomization failed: {e}");
            }
            Err(e) => {
                bail!("Attempt {attempt_num}/{max_attempts}: {e}");
            }
        }
    }
    bail!("Exhausted randomization attempts");
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let world = World::load(&args.world)?;
    let settings = match &args.settings {
        Some(path) => load_randomizer_settings(path)?,
        None => RandomizerSettings::default(),
    };

    let randomization = get_randomization(&args, &world, &settings)?;
    for dungeon in &randomization.dungeons {
        info!(
            "{}: {} connections, {} key doors",
            dungeon.name,
            dungeon.connections.len(),
            dungeon.key_doors_num
        );
    }

    if let Some(output_spoiler_log_path) = &args.output_spoiler_log {
        println!(
            "Writing spoiler log to {}",
            output_spoiler_log_path.display()
        );
        let spoiler_str = serde_json::to_string_pretty(&randomization.spoiler_log)?;
        std::fs::write(output_spoiler_log_path, spoiler_str)?;
    }

    Ok(())
}
