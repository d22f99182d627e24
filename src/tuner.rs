use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use log::info;
use rayon::prelude::*;
use serde_json::{Map, Value};

use crate::backtest::{PlayerBacktest, TeamBacktest};
use crate::dataset::{PlayerRound, Round};
use crate::errors::{ParamError, TunerError};
use crate::params::{FlatParams, TunerParams, bounds_for, load_params, save_params};

/// Forward-difference step, matched to the optimizer tolerances in use.
const GRADIENT_EPSILON: f64 = 1e-5;
const LBFGS_MEMORY: usize = 7;

pub const TEAM_TUNER_PARAMS: &[&str] = &[
    "team_home_att_init_sd",
    "team_home_def_init_sd",
    "team_away_att_init_sd",
    "team_away_def_init_sd",
    "team_process_sd",
    "league_home_init",
    "league_away_init",
    "league_home_init_sd",
    "league_away_init_sd",
    "league_process_sd",
];

pub const PLAYER_TUNER_PARAMS: &[&str] = &[
    "player_goal_init.gk",
    "player_goal_init.def",
    "player_goal_init.mid",
    "player_goal_init.fwd",
    "player_goal_init_sd",
    "player_goal_process_sd",
    "player_assist_init.gk",
    "player_assist_init.def",
    "player_assist_init.mid",
    "player_assist_init.fwd",
    "player_assist_init_sd",
    "player_assist_process_sd",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NelderMead,
    Lbfgs,
}

impl Method {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nelder-mead" | "neldermead" | "nm" => Some(Method::NelderMead),
            "lbfgs" | "l-bfgs" => Some(Method::Lbfgs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunerOptions {
    pub method: Method,
    pub tol: f64,
    pub max_iters: u64,
    /// Evaluate the finite-difference gradient with one rayon worker per
    /// parameter dimension instead of sequentially. Only the L-BFGS path
    /// asks for gradients at all.
    pub parallel_gradient: bool,
    /// Write tuned parameters back to their files. Off means dry run.
    pub apply: bool,
    pub params_dir: PathBuf,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            method: Method::NelderMead,
            tol: 1e-7,
            max_iters: 400,
            parallel_gradient: false,
            apply: false,
            params_dir: PathBuf::from("params"),
        }
    }
}

/// A backtest the tuner can treat as a black-box fitness function.
pub trait BacktestModel: Sync {
    fn init_params() -> &'static [&'static str]
    where
        Self: Sized;

    /// Pure evaluation: rebuild the engines from `params`, replay, return the
    /// blended fitness. Must be free of side effects so gradient workers can
    /// call it concurrently.
    fn evaluate(&self, params: &FlatParams) -> Result<f64, TunerError>;
}

pub struct TeamModel {
    rounds: Vec<Round>,
}

impl TeamModel {
    pub fn new(rounds: Vec<Round>) -> Self {
        Self { rounds }
    }
}

impl BacktestModel for TeamModel {
    fn init_params() -> &'static [&'static str] {
        TEAM_TUNER_PARAMS
    }

    fn evaluate(&self, params: &FlatParams) -> Result<f64, TunerError> {
        let mut backtest = TeamBacktest::new(params, &self.rounds)?;
        backtest.run()?;
        Ok(backtest.fitness()?)
    }
}

pub struct PlayerModel {
    rows: Vec<PlayerRound>,
}

impl PlayerModel {
    pub fn new(rows: Vec<PlayerRound>) -> Self {
        Self { rows }
    }
}

impl BacktestModel for PlayerModel {
    fn init_params() -> &'static [&'static str] {
        PLAYER_TUNER_PARAMS
    }

    fn evaluate(&self, params: &FlatParams) -> Result<f64, TunerError> {
        let mut backtest = PlayerBacktest::new(params, &self.rows)?;
        backtest.run()?;
        Ok(backtest.fitness()?)
    }
}

#[derive(Debug)]
pub struct TunerOutcome {
    pub params: Map<String, Value>,
    pub fitness: f64,
    pub evaluations: u64,
    pub iterations: u64,
}

#[derive(Debug)]
struct EvalState {
    params: TunerParams,
    /// The last parameter set that made it into the log. If the run is
    /// interrupted this is what gets persisted, never the in-flight vector.
    to_save: TunerParams,
    evaluations: u64,
}

/// Wraps a backtest model as a minimizable cost function: the optimizer sees
/// `-fitness`, with bound violations folded in as continuous penalties so
/// derivative-free methods are still steered back into the feasible region.
pub struct Tuner<M: BacktestModel> {
    model: M,
    all_params: FlatParams,
    state: Mutex<EvalState>,
    cancel: Arc<AtomicBool>,
    options: TunerOptions,
}

impl<M: BacktestModel> Tuner<M> {
    pub fn new(
        model: M,
        fixed: &[String],
        only_do: &[String],
        options: TunerOptions,
    ) -> Result<Self, ParamError> {
        let all_params = load_params(&options.params_dir)?;
        let params = TunerParams::new(&all_params, M::init_params(), fixed, only_do)?;
        Ok(Self {
            model,
            all_params,
            state: Mutex::new(EvalState {
                to_save: params.clone(),
                params,
                evaluations: 0,
            }),
            cancel: Arc::new(AtomicBool::new(false)),
            options,
        })
    }

    /// Cooperative cancellation: set from a signal or input watcher; the next
    /// evaluation aborts the run through the graceful-teardown path.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The last parameter set that was fully logged (see `EvalState`).
    pub fn last_logged(&self) -> FlatParams {
        self.state().to_save.values().clone()
    }

    fn state(&self) -> MutexGuard<'_, EvalState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Side-effect-free cost: overlay `vector` on the parameter view, replay
    /// the backtest, apply bounds penalties. Safe to call from gradient
    /// workers.
    fn evaluate_vector(&self, vector: &[f64]) -> Result<(f64, String), TunerError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(TunerError::Interrupted);
        }
        let mut view = self.state().params.clone();
        view.update_from_vector(vector);
        let full = view.overlay(&self.all_params);
        let fitness = self.model.evaluate(&full)?;
        Ok(penalise_boundaries(fitness, view.values()))
    }

    pub fn run(&self) -> Result<TunerOutcome, TunerError> {
        let x0 = {
            let state = self.state();
            state.params.log_header();
            state.params.x0()
        };

        let outcome = match self.options.method {
            Method::NelderMead => self.run_nelder_mead(x0),
            Method::Lbfgs => self.run_lbfgs(x0),
        };

        match outcome {
            Ok((best, best_cost, iterations)) => {
                let (params, evaluations) = {
                    let mut state = self.state();
                    state.params.update_from_vector(&best);
                    state.to_save.update_from_vector(&best);
                    (state.params.clone(), state.evaluations)
                };
                info!("finished having run {evaluations} evaluations over {iterations} iterations");
                self.teardown()?;
                Ok(TunerOutcome {
                    params: params.nested()?,
                    fitness: -best_cost,
                    evaluations,
                    iterations,
                })
            }
            Err(TunerError::Interrupted) => {
                info!("cancelling optimisation........");
                self.teardown()?;
                Err(TunerError::Interrupted)
            }
            Err(other) => Err(other),
        }
    }

    /// Housekeeping after the optimizer has stopped: show what we would
    /// write, and write it only when `apply` is set.
    fn teardown(&self) -> Result<(), ParamError> {
        let to_save = self.state().to_save.clone();
        to_save.log_output();
        if self.options.apply {
            let mut full = self.all_params.clone();
            for (key, value) in to_save.values() {
                full.insert(key.clone(), *value);
            }
            save_params(&self.options.params_dir, &full)?;
            info!(
                "wrote tuned parameters to {}",
                self.options.params_dir.display()
            );
        } else {
            info!("dry run: tuned parameters were not written");
        }
        Ok(())
    }

    fn run_nelder_mead(&self, x0: Vec<f64>) -> Result<(Vec<f64>, f64, u64), TunerError> {
        let solver = NelderMead::<Vec<f64>, f64>::new(build_simplex(&x0))
            .with_sd_tolerance(self.options.tol)
            .map_err(|e| TunerError::Optimizer(e.to_string()))?;
        let result = Executor::new(Adapter(self), solver)
            .configure(|state| state.max_iters(self.options.max_iters))
            .run()
            .map_err(unwrap_tuner_error)?;
        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| TunerError::Optimizer("no best parameter returned".to_string()))?;
        Ok((best, state.get_best_cost(), state.get_iter()))
    }

    fn run_lbfgs(&self, x0: Vec<f64>) -> Result<(Vec<f64>, f64, u64), TunerError> {
        let linesearch: MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> =
            MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, LBFGS_MEMORY)
            .with_tolerance_cost(self.options.tol)
            .map_err(|e| TunerError::Optimizer(e.to_string()))?;
        let result = Executor::new(Adapter(self), solver)
            .configure(|state| state.param(x0).max_iters(self.options.max_iters))
            .run()
            .map_err(unwrap_tuner_error)?;
        let state = result.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| TunerError::Optimizer("no best parameter returned".to_string()))?;
        Ok((best, state.get_best_cost(), state.get_iter()))
    }
}

/// Borrow-friendly bridge onto argmin's problem traits.
struct Adapter<'a, M: BacktestModel>(&'a Tuner<M>);

impl<M: BacktestModel> CostFunction for Adapter<'_, M> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, vector: &Self::Param) -> Result<Self::Output, ArgminError> {
        let (fitness, pen_str) = match self.0.evaluate_vector(vector) {
            Ok(result) => result,
            Err(TunerError::Rating(err)) => {
                // The optimizer cannot continue past a numeric failure; dump
                // the offending parameters so the bounds can be tightened.
                let mut state = self.0.state();
                state.params.update_from_vector(vector);
                info!("params produced a numeric failure ({err}), change the bounds:");
                state.params.log_output();
                return Err(TunerError::Rating(err).into());
            }
            Err(other) => return Err(other.into()),
        };
        let mut state = self.0.state();
        state.params.update_from_vector(vector);
        if !fitness.is_finite() {
            info!("error running with params:");
            state.params.log_output();
            return Err(TunerError::NonFiniteFitness.into());
        }
        state.params.log_row(fitness, &pen_str);
        state.evaluations += 1;
        // Only advance the persisted copy once the row is logged, so an
        // interrupt never saves a set we cannot see in the log.
        state.to_save.update_from_vector(vector);
        Ok(-fitness)
    }
}

impl<M: BacktestModel> Gradient for Adapter<'_, M> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    /// Forward finite differences on the cost. Every dimension is one full
    /// backtest; with `parallel_gradient` they run on the rayon pool and the
    /// parent joins before assembling the vector. A failed dimension fails
    /// the whole gradient.
    fn gradient(&self, vector: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        let f0 = -self.0.evaluate_vector(vector)?.0;
        let diff = |dim: usize| -> Result<f64, TunerError> {
            let mut shifted = vector.clone();
            shifted[dim] += GRADIENT_EPSILON;
            let fi = -self.0.evaluate_vector(&shifted)?.0;
            Ok((fi - f0) / GRADIENT_EPSILON)
        };
        let grad = if self.0.options.parallel_gradient {
            (0..vector.len())
                .into_par_iter()
                .map(diff)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            (0..vector.len())
                .map(diff)
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(grad)
    }
}

fn unwrap_tuner_error(err: ArgminError) -> TunerError {
    match err.downcast::<TunerError>() {
        Ok(tuner_err) => tuner_err,
        Err(other) => TunerError::Optimizer(other.to_string()),
    }
}

/// Initial Nelder-Mead simplex: x0 plus one vertex per dimension, nudged five
/// percent along that axis (scipy's construction).
fn build_simplex(x0: &[f64]) -> Vec<Vec<f64>> {
    let mut simplex = vec![x0.to_vec()];
    for dim in 0..x0.len() {
        let mut vertex = x0.to_vec();
        vertex[dim] += if vertex[dim].abs() > 1e-12 {
            0.05 * vertex[dim].abs()
        } else {
            0.00025
        };
        simplex.push(vertex);
    }
    simplex
}

/// Continuous penalty for parameters outside their box bounds: zero inside,
/// the excess beyond the nearer bound outside. Lets derivative-free methods
/// that cannot express bounds natively feel them anyway.
fn penalise_boundaries(fitness: f64, values: &FlatParams) -> (f64, String) {
    let mut cost = fitness;
    let mut pen_str = String::new();
    for (name, value) in values {
        let (lower, upper) = bounds_for(name);
        if let Some(lower) = lower
            && *value < lower
        {
            let excess = lower - value;
            cost -= excess;
            pen_str.push_str(&format!("\t(penalising {name}: {value} < {lower})"));
        }
        if let Some(upper) = upper
            && *value > upper
        {
            let excess = value - upper;
            cost -= excess;
            pen_str.push_str(&format!("\t(penalising {name}: {value} > {upper})"));
        }
    }
    (cost, pen_str)
}
