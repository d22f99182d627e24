use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::errors::{ParamError, RatingError};
use crate::kalman;
use crate::likelihood::{LikelihoodAccumulator, poisson_log_pmf};
use crate::params::FlatParams;

/// Attack and defence means start at parity; the league multipliers carry the
/// scoring scale.
pub const INITIAL_RATING: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct TeamConfig {
    pub home_att_init_var: f64,
    pub home_def_init_var: f64,
    pub away_att_init_var: f64,
    pub away_def_init_var: f64,
    pub process_var: f64,
}

impl TeamConfig {
    pub fn from_params(params: &FlatParams) -> Result<Self, ParamError> {
        let sd = |name: &str| -> Result<f64, ParamError> {
            params
                .get(name)
                .copied()
                .ok_or_else(|| ParamError::Missing(name.to_string()))
        };
        Ok(Self {
            home_att_init_var: sd("team_home_att_init_sd")?.powi(2),
            home_def_init_var: sd("team_home_def_init_sd")?.powi(2),
            away_att_init_var: sd("team_away_att_init_sd")?.powi(2),
            away_def_init_var: sd("team_away_def_init_sd")?.powi(2),
            process_var: sd("team_process_sd")?.powi(2),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct RoleState {
    att: f64,
    def: f64,
    att_var: f64,
    def_var: f64,
}

/// Home-role and away-role statistics for the same team are independent
/// quantities; a promoted side can be solid at home and soft away.
#[derive(Debug, Clone, Copy, Default)]
struct TeamState {
    home: Option<RoleState>,
    away: Option<RoleState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Prior,
    Posterior,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamSnapshot {
    pub team_id: u32,
    pub round: u32,
    pub is_home: bool,
    pub kind: SnapshotKind,
    pub att: f64,
    pub def: f64,
    pub att_var: f64,
    pub def_var: f64,
}

/// Pre-update ratings for one match, in state-vector order.
#[derive(Debug, Clone, Copy)]
pub struct MatchPriors {
    pub h_att: f64,
    pub h_def: f64,
    pub a_att: f64,
    pub a_def: f64,
    pub h_att_var: f64,
    pub h_def_var: f64,
    pub a_att_var: f64,
    pub a_def_var: f64,
}

/// Per-team attack/defence extended Kalman filter over the four-component
/// state [h_att, h_def, a_att, a_def] of a match.
#[derive(Debug)]
pub struct TeamRatings {
    config: TeamConfig,
    ratings: HashMap<u32, TeamState>,
    history: Vec<TeamSnapshot>,
    pub lhood: LikelihoodAccumulator,
}

impl TeamRatings {
    pub fn new(params: &FlatParams) -> Result<Self, ParamError> {
        Ok(Self {
            config: TeamConfig::from_params(params)?,
            ratings: HashMap::new(),
            history: Vec::new(),
            lhood: LikelihoodAccumulator::default(),
        })
    }

    pub fn history(&self) -> &[TeamSnapshot] {
        &self.history
    }

    /// Current ratings for a pairing, falling back to the configured initial
    /// values for teams (or roles) not seen yet.
    pub fn get_ratings(&self, home_id: u32, away_id: u32) -> MatchPriors {
        let home = self
            .ratings
            .get(&home_id)
            .and_then(|state| state.home)
            .unwrap_or(RoleState {
                att: INITIAL_RATING,
                def: INITIAL_RATING,
                att_var: self.config.home_att_init_var,
                def_var: self.config.home_def_init_var,
            });
        let away = self
            .ratings
            .get(&away_id)
            .and_then(|state| state.away)
            .unwrap_or(RoleState {
                att: INITIAL_RATING,
                def: INITIAL_RATING,
                att_var: self.config.away_att_init_var,
                def_var: self.config.away_def_init_var,
            });
        MatchPriors {
            h_att: home.att,
            h_def: home.def,
            a_att: away.att,
            a_def: away.def,
            h_att_var: home.att_var,
            h_def_var: home.def_var,
            a_att_var: away.att_var,
            a_def_var: away.def_var,
        }
    }

    /// One EKF step for one match. The observation model is bilinear
    /// (home rate = h_att * l_h * a_def, away rate = h_def * l_a * a_att), so
    /// the measurement matrix is the Jacobian at the predicted state.
    pub fn run_update_step(
        &mut self,
        home_id: u32,
        away_id: u32,
        l_h: f64,
        l_a: f64,
        home_goals: u32,
        away_goals: u32,
        round: u32,
    ) -> Result<(), RatingError> {
        let pri = self.get_ratings(home_id, away_id);

        // -- predict --
        let q = self.config.process_var;
        let x_minus = DVector::from_vec(vec![pri.h_att, pri.h_def, pri.a_att, pri.a_def]);
        let p_minus = DMatrix::from_diagonal(&DVector::from_vec(vec![
            pri.h_att_var + q,
            pri.h_def_var + q,
            pri.a_att_var + q,
            pri.a_def_var + q,
        ]));

        let predictions = DVector::from_vec(vec![
            pri.h_att * l_h * pri.a_def,
            pri.h_def * l_a * pri.a_att,
        ]);
        // Score before mutating so a degenerate rate leaves state untouched.
        let home_term = poisson_log_pmf(predictions[0], home_goals)?;
        let away_term = poisson_log_pmf(predictions[1], away_goals)?;

        self.snapshot(home_id, away_id, round, SnapshotKind::Prior, &x_minus, &[
            p_minus[(0, 0)],
            p_minus[(1, 1)],
            p_minus[(2, 2)],
            p_minus[(3, 3)],
        ]);

        // -- update --
        let h = DMatrix::from_row_slice(2, 4, &[
            l_h * pri.a_def,
            0.0,
            0.0,
            l_h * pri.h_att,
            0.0,
            l_a * pri.a_att,
            l_a * pri.h_def,
            0.0,
        ]);
        let observations = DVector::from_vec(vec![f64::from(home_goals), f64::from(away_goals)]);
        let post = kalman::ekf_update(x_minus, p_minus, h, &predictions, &observations, round)?;

        let state = self.ratings.entry(home_id).or_default();
        state.home = Some(RoleState {
            att: post.state[0],
            def: post.state[1],
            att_var: post.cov[(0, 0)],
            def_var: post.cov[(1, 1)],
        });
        let state = self.ratings.entry(away_id).or_default();
        state.away = Some(RoleState {
            att: post.state[2],
            def: post.state[3],
            att_var: post.cov[(2, 2)],
            def_var: post.cov[(3, 3)],
        });
        self.snapshot(home_id, away_id, round, SnapshotKind::Posterior, &post.state, &[
            post.cov[(0, 0)],
            post.cov[(1, 1)],
            post.cov[(2, 2)],
            post.cov[(3, 3)],
        ]);

        self.lhood.record(home_term);
        self.lhood.record(away_term);
        Ok(())
    }

    fn snapshot(
        &mut self,
        home_id: u32,
        away_id: u32,
        round: u32,
        kind: SnapshotKind,
        state: &DVector<f64>,
        vars: &[f64; 4],
    ) {
        self.history.push(TeamSnapshot {
            team_id: home_id,
            round,
            is_home: true,
            kind,
            att: state[0],
            def: state[1],
            att_var: vars[0],
            def_var: vars[1],
        });
        self.history.push(TeamSnapshot {
            team_id: away_id,
            round,
            is_home: false,
            kind,
            att: state[2],
            def: state[3],
            att_var: vars[2],
            def_var: vars[3],
        });
    }
}
