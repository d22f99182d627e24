use std::path::PathBuf;

use anyhow::{Context, Result};

use fpl_ratings::backtest::TeamBacktest;
use fpl_ratings::dataset;
use fpl_ratings::params;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches_path = parse_path_arg("--matches").context("pass --matches <matches.json>")?;
    let params_dir = parse_path_arg("--params-dir").unwrap_or_else(|| PathBuf::from("params"));

    let records = dataset::load_match_records(&matches_path)?;
    let rounds = dataset::group_by_round(records);
    let params = params::load_params(&params_dir)?;

    let mut backtest = TeamBacktest::new(&params, &rounds)?;
    backtest.run()?;

    println!("Team/league backtest");
    println!("Data: {}", matches_path.display());
    println!("Rounds: {}", rounds.len());
    println!(
        "Observations: team={} league={}",
        backtest.team_ratings.lhood.count(),
        backtest.league_ratings.lhood.count()
    );
    let (l_h, l_a, _, _) = backtest.league_ratings.get_ratings();
    println!("League multipliers: home={l_h:.4} away={l_a:.4}");
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
