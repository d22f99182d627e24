use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ParamError, RatingError};
use crate::likelihood::{LikelihoodAccumulator, poisson_log_pmf};
use crate::params::FlatParams;
use crate::team_ratings::SnapshotKind;

/// Propensity means may not collapse to zero; a zero mean would pin the
/// predicted rate (and its gradient) at zero forever.
const MEAN_FLOOR: f64 = 1e-6;

/// FPL element types 1-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Position {
    Goalkeeper,
    Defender,
    Midfielder,
    Forward,
}

impl TryFrom<u8> for Position {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Position::Goalkeeper),
            2 => Ok(Position::Defender),
            3 => Ok(Position::Midfielder),
            4 => Ok(Position::Forward),
            other => Err(format!("unknown position code {other}")),
        }
    }
}

impl From<Position> for u8 {
    fn from(position: Position) -> u8 {
        match position {
            Position::Goalkeeper => 1,
            Position::Defender => 2,
            Position::Midfielder => 3,
            Position::Forward => 4,
        }
    }
}

/// Which per-player statistic an engine instance models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Goals,
    Assists,
}

impl StatKind {
    fn prefix(self) -> &'static str {
        match self {
            StatKind::Goals => "player_goal",
            StatKind::Assists => "player_assist",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    pub init_gk: f64,
    pub init_def: f64,
    pub init_mid: f64,
    pub init_fwd: f64,
    pub init_var: f64,
    pub process_var: f64,
}

impl PlayerConfig {
    pub fn from_params(params: &FlatParams, stat: StatKind) -> Result<Self, ParamError> {
        let prefix = stat.prefix();
        let get = |name: String| -> Result<f64, ParamError> {
            params.get(&name).copied().ok_or(ParamError::Missing(name))
        };
        Ok(Self {
            init_gk: get(format!("{prefix}_init.gk"))?,
            init_def: get(format!("{prefix}_init.def"))?,
            init_mid: get(format!("{prefix}_init.mid"))?,
            init_fwd: get(format!("{prefix}_init.fwd"))?,
            init_var: get(format!("{prefix}_init_sd"))?.powi(2),
            process_var: get(format!("{prefix}_process_sd"))?.powi(2),
        })
    }

    fn initial_mean(&self, position: Position) -> f64 {
        match position {
            Position::Goalkeeper => self.init_gk,
            Position::Defender => self.init_def,
            Position::Midfielder => self.init_mid,
            Position::Forward => self.init_fwd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub player_id: u32,
    pub round: u32,
    pub kind: SnapshotKind,
    pub mean: f64,
    pub var: f64,
}

/// Scalar propensity filter: one (mean, variance) pair per player for a
/// single statistic. Gain and update are closed-form scalar arithmetic.
#[derive(Debug)]
pub struct PlayerRatings {
    config: PlayerConfig,
    ratings: HashMap<u32, (f64, f64)>,
    history: Vec<PlayerSnapshot>,
    pub lhood: LikelihoodAccumulator,
}

impl PlayerRatings {
    pub fn new(params: &FlatParams, stat: StatKind) -> Result<Self, ParamError> {
        Ok(Self {
            config: PlayerConfig::from_params(params, stat)?,
            ratings: HashMap::new(),
            history: Vec::new(),
            lhood: LikelihoodAccumulator::default(),
        })
    }

    pub fn history(&self) -> &[PlayerSnapshot] {
        &self.history
    }

    pub fn get_rating(&self, player_id: u32, position: Position) -> (f64, f64) {
        self.ratings.get(&player_id).copied().unwrap_or((
            self.config.initial_mean(position),
            self.config.init_var,
        ))
    }

    /// One scalar filter step. The measurement rate is exposure (the team's
    /// total for the statistic that round) times the latent propensity, with
    /// measurement variance equal to the rate. Zero exposure makes that model
    /// degenerate, so the observation is skipped outright and does not count.
    pub fn run_update_step(
        &mut self,
        round: u32,
        player_id: u32,
        observed: u32,
        exposure: u32,
        position: Position,
    ) -> Result<(), RatingError> {
        if exposure == 0 {
            return Ok(());
        }

        let (prev_mean, prev_var) = self.get_rating(player_id, position);

        // -- predict --
        let x_minus = prev_mean;
        let p_minus = prev_var + self.config.process_var;

        let h = f64::from(exposure);
        let prediction = h * x_minus;
        let log_term = poisson_log_pmf(prediction, observed)?;

        self.history.push(PlayerSnapshot {
            player_id,
            round,
            kind: SnapshotKind::Prior,
            mean: x_minus,
            var: p_minus,
        });

        // -- update --
        let s = h * p_minus * h + prediction;
        let k = p_minus * h / s;
        let mean = (x_minus + k * (f64::from(observed) - prediction)).max(MEAN_FLOOR);
        let var = (1.0 - k * h) * p_minus;

        self.ratings.insert(player_id, (mean, var));
        self.history.push(PlayerSnapshot {
            player_id,
            round,
            kind: SnapshotKind::Posterior,
            mean,
            var,
        });
        self.lhood.record(log_term);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::load_params;
    use std::path::Path;

    fn engine(stat: StatKind) -> PlayerRatings {
        let params = load_params(Path::new("/nonexistent")).unwrap();
        PlayerRatings::new(&params, stat).unwrap()
    }

    #[test]
    fn initial_means_come_from_the_position_priors() {
        let goals = engine(StatKind::Goals);
        assert_eq!(goals.get_rating(1, Position::Goalkeeper).0, 0.0012744);
        assert_eq!(goals.get_rating(2, Position::Forward).0, 0.18767);
        let assists = engine(StatKind::Assists);
        assert_eq!(assists.get_rating(3, Position::Midfielder).0, 0.12527);
    }

    #[test]
    fn update_matches_the_scalar_closed_form() {
        let mut ratings = engine(StatKind::Goals);
        ratings
            .run_update_step(1, 7, 1, 3, Position::Forward)
            .unwrap();

        let x0 = 0.18767;
        let p = 0.091535_f64.powi(2) + 0.017468_f64.powi(2);
        let h = 3.0;
        let pred = h * x0;
        let s = h * p * h + pred;
        let k = p * h / s;
        let expected_mean = x0 + k * (1.0 - pred);
        let expected_var = (1.0 - k * h) * p;

        let (mean, var) = ratings.get_rating(7, Position::Forward);
        assert!((mean - expected_mean).abs() < 1e-14);
        assert!((var - expected_var).abs() < 1e-14);
        assert_eq!(ratings.lhood.count(), 1);
    }

    #[test]
    fn zero_exposure_is_skipped_entirely() {
        let mut ratings = engine(StatKind::Assists);
        let before = ratings.get_rating(9, Position::Defender);
        ratings
            .run_update_step(4, 9, 0, 0, Position::Defender)
            .unwrap();
        assert_eq!(ratings.get_rating(9, Position::Defender), before);
        assert_eq!(ratings.lhood.count(), 0);
        assert!(ratings.history().is_empty());
    }

    #[test]
    fn posterior_mean_never_goes_below_the_floor() {
        let mut ratings = engine(StatKind::Goals);
        // A goalkeeper blanking over huge exposure drags the mean hard toward
        // zero; the floor must hold.
        for round in 1..=50 {
            ratings
                .run_update_step(round, 11, 0, 8, Position::Goalkeeper)
                .unwrap();
        }
        let (mean, var) = ratings.get_rating(11, Position::Goalkeeper);
        assert!(mean >= MEAN_FLOOR);
        assert!(var > 0.0);
    }

    #[test]
    fn position_codes_round_trip_through_serde() {
        let position: Position = serde_json::from_str("3").unwrap();
        assert_eq!(position, Position::Midfielder);
        assert_eq!(serde_json::to_string(&position).unwrap(), "3");
        assert!(serde_json::from_str::<Position>("9").is_err());
    }
}
