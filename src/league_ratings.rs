use nalgebra::{DMatrix, DVector};

use crate::errors::{ParamError, RatingError};
use crate::kalman;
use crate::likelihood::{LikelihoodAccumulator, poisson_log_pmf};
use crate::params::FlatParams;
use crate::team_ratings::SnapshotKind;

#[derive(Debug, Clone, Copy)]
pub struct LeagueConfig {
    pub home_init: f64,
    pub away_init: f64,
    pub home_init_var: f64,
    pub away_init_var: f64,
    pub process_var: f64,
}

impl LeagueConfig {
    pub fn from_params(params: &FlatParams) -> Result<Self, ParamError> {
        let get = |name: &str| -> Result<f64, ParamError> {
            params
                .get(name)
                .copied()
                .ok_or_else(|| ParamError::Missing(name.to_string()))
        };
        Ok(Self {
            home_init: get("league_home_init")?,
            away_init: get("league_away_init")?,
            home_init_var: get("league_home_init_sd")?.powi(2),
            away_init_var: get("league_away_init_sd")?.powi(2),
            process_var: get("league_process_sd")?.powi(2),
        })
    }
}

/// One match's contribution to the round-level batch update: pre-round team
/// ratings and the realized goals.
#[derive(Debug, Clone, Copy)]
pub struct MatchTerms {
    pub home_att: f64,
    pub home_def: f64,
    pub away_att: f64,
    pub away_def: f64,
    pub home_goals: u32,
    pub away_goals: u32,
}

#[derive(Debug, Clone, Copy)]
struct LeagueState {
    home: f64,
    away: f64,
    home_var: f64,
    away_var: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeagueSnapshot {
    pub round: u32,
    pub kind: SnapshotKind,
    pub home: f64,
    pub away: f64,
    pub home_var: f64,
    pub away_var: f64,
}

/// League-wide home/away multiplier filter. State dimension is fixed at two;
/// the observation dimension grows with the number of matches in the round,
/// and the whole round is absorbed in a single batched update.
#[derive(Debug)]
pub struct LeagueRatings {
    config: LeagueConfig,
    current: Option<LeagueState>,
    history: Vec<LeagueSnapshot>,
    pub lhood: LikelihoodAccumulator,
}

impl LeagueRatings {
    pub fn new(params: &FlatParams) -> Result<Self, ParamError> {
        Ok(Self {
            config: LeagueConfig::from_params(params)?,
            current: None,
            history: Vec::new(),
            lhood: LikelihoodAccumulator::default(),
        })
    }

    pub fn history(&self) -> &[LeagueSnapshot] {
        &self.history
    }

    /// (home, away, home_var, away_var), defaulting to configured initials.
    pub fn get_ratings(&self) -> (f64, f64, f64, f64) {
        match self.current {
            Some(state) => (state.home, state.away, state.home_var, state.away_var),
            None => (
                self.config.home_init,
                self.config.away_init,
                self.config.home_init_var,
                self.config.away_init_var,
            ),
        }
    }

    /// Batched update against every match of a round at once. `terms` must
    /// carry the attack/defence ratings as predicted for this round, before
    /// the round's team updates; feeding post-update values would let the
    /// league layer react to the very matches it is explaining.
    pub fn run_update_step(&mut self, terms: &[MatchTerms], round: u32) -> Result<(), RatingError> {
        if terms.is_empty() {
            return Ok(());
        }
        let (l_h, l_a, home_var, away_var) = self.get_ratings();

        // -- predict --
        let q = self.config.process_var;
        let x_minus = DVector::from_vec(vec![l_h, l_a]);
        let p_minus =
            DMatrix::from_diagonal(&DVector::from_vec(vec![home_var + q, away_var + q]));

        // Each match contributes one row to home-goal predictions and one to
        // away-goal predictions.
        let n = terms.len();
        let mut h = DMatrix::zeros(2 * n, 2);
        let mut observations = DVector::zeros(2 * n);
        for (i, term) in terms.iter().enumerate() {
            h[(2 * i, 0)] = term.home_att * term.away_def;
            h[(2 * i + 1, 1)] = term.home_def * term.away_att;
            observations[2 * i] = f64::from(term.home_goals);
            observations[2 * i + 1] = f64::from(term.away_goals);
        }
        let predictions = &h * &x_minus;

        let mut log_terms = Vec::with_capacity(2 * n);
        for i in 0..2 * n {
            log_terms.push(poisson_log_pmf(predictions[i], observations[i] as u32)?);
        }

        self.history.push(LeagueSnapshot {
            round,
            kind: SnapshotKind::Prior,
            home: x_minus[0],
            away: x_minus[1],
            home_var: p_minus[(0, 0)],
            away_var: p_minus[(1, 1)],
        });

        // -- update --
        let post = kalman::ekf_update(x_minus, p_minus, h, &predictions, &observations, round)?;
        self.current = Some(LeagueState {
            home: post.state[0],
            away: post.state[1],
            home_var: post.cov[(0, 0)],
            away_var: post.cov[(1, 1)],
        });
        self.history.push(LeagueSnapshot {
            round,
            kind: SnapshotKind::Posterior,
            home: post.state[0],
            away: post.state[1],
            home_var: post.cov[(0, 0)],
            away_var: post.cov[(1, 1)],
        });

        for term in log_terms {
            self.lhood.record(term);
        }
        Ok(())
    }
}
