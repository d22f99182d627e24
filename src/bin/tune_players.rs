use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, anyhow};

use fpl_ratings::dataset;
use fpl_ratings::errors::TunerError;
use fpl_ratings::tuner::{Method, PlayerModel, Tuner, TunerOptions};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let players_path = parse_path_arg("--players").context("pass --players <players.json>")?;
    let rows = dataset::sort_player_rounds(dataset::load_player_rounds(&players_path)?);

    let method_raw = parse_value_arg("--method").unwrap_or_else(|| "nelder-mead".to_string());
    let method =
        Method::parse(&method_raw).ok_or_else(|| anyhow!("unknown method '{method_raw}'"))?;
    let options = TunerOptions {
        method,
        tol: parse_f64_arg("--tol").unwrap_or(1e-7),
        max_iters: parse_u64_arg("--max-iters").unwrap_or(400),
        parallel_gradient: has_flag("--multi-grad"),
        apply: has_flag("--apply"),
        params_dir: parse_path_arg("--params-dir").unwrap_or_else(|| PathBuf::from("params")),
    };
    let fixed = parse_list_arg("--fix").unwrap_or_default();
    let only_do = parse_list_arg("--only-do").unwrap_or_default();

    let tuner = Tuner::new(PlayerModel::new(rows), &fixed, &only_do, options)?;
    watch_stdin_for_quit(&tuner);

    match tuner.run() {
        Ok(outcome) => {
            println!("Best fitness: {:.7}", outcome.fitness);
            println!(
                "Evaluations: {} Iterations: {}",
                outcome.evaluations, outcome.iterations
            );
            Ok(())
        }
        Err(TunerError::Interrupted) => {
            println!("Optimisation interrupted; kept the last logged parameters.");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn watch_stdin_for_quit(tuner: &Tuner<PlayerModel>) {
    let cancel = tuner.cancel_flag();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) if text.trim() == "q" => {
                    cancel.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn parse_value_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_value_arg(name).map(PathBuf::from)
}

fn parse_f64_arg(name: &str) -> Option<f64> {
    parse_value_arg(name).and_then(|raw| raw.parse::<f64>().ok())
}

fn parse_u64_arg(name: &str) -> Option<u64> {
    parse_value_arg(name).and_then(|raw| raw.parse::<u64>().ok())
}

fn parse_list_arg(name: &str) -> Option<Vec<String>> {
    let raw = parse_value_arg(name)?;
    let out: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
