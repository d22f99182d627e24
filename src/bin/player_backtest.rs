use std::path::PathBuf;

use anyhow::{Context, Result};

use fpl_ratings::backtest::PlayerBacktest;
use fpl_ratings::dataset;
use fpl_ratings::params;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let players_path = parse_path_arg("--players").context("pass --players <players.json>")?;
    let params_dir = parse_path_arg("--params-dir").unwrap_or_else(|| PathBuf::from("params"));

    let rows = dataset::sort_player_rounds(dataset::load_player_rounds(&players_path)?);
    let params = params::load_params(&params_dir)?;

    let mut backtest = PlayerBacktest::new(&params, &rows)?;
    backtest.run()?;

    println!("Player goal/assist backtest");
    println!("Data: {}", players_path.display());
    println!("Rows: {}", rows.len());
    println!(
        "Observations: goals={} assists={}",
        backtest.goal_ratings.lhood.count(),
        backtest.assist_ratings.lhood.count()
    );
    println!("Fitness (emll): {:.7}", backtest.fitness()?);

    Ok(())
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(PathBuf::from(raw.trim()));
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(PathBuf::from(next.trim()));
        }
    }
    None
}
