use thiserror::Error;

/// Numeric failures raised inside the rating filters and backtests. These are
/// fatal for the evaluation that produced them and are never retried locally.
#[derive(Debug, Error)]
pub enum RatingError {
    #[error("innovation covariance is not positive definite in round {round}")]
    SingularInnovation { round: u32 },
    #[error("degenerate predicted rate {rate} for observed count {count}")]
    DegenerateRate { rate: f64, count: u32 },
    #[error("fitness requested before any observations were processed")]
    NoObservations,
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("cannot flatten more than two levels of nesting under '{0}'")]
    TooDeep(String),
    #[error("flattening key appears more than once in '{0}'")]
    BadKey(String),
    #[error("parameter '{0}' is not numeric")]
    NotNumeric(String),
    #[error("parameter '{0}' appears in more than one category file")]
    Duplicate(String),
    #[error("parameter '{0}' matches no category acronym")]
    UnmatchedAcronym(String),
    #[error("parameter '{0}' matches more than one category acronym")]
    AmbiguousAcronym(String),
    #[error("parameter file '{0}' does not hold a JSON object")]
    BadFile(String),
    #[error("'{0}' is not one of this tuner's parameters")]
    Unknown(String),
    #[error("missing parameter '{0}'")]
    Missing(String),
    #[error("fixed and only_do were both supplied; make one of them empty")]
    FixedAndOnlyDo,
    #[error("every parameter is fixed; nothing left to optimise")]
    NothingToOptimise,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TunerError {
    #[error("optimisation interrupted")]
    Interrupted,
    #[error("non-finite fitness for the current parameter set")]
    NonFiniteFitness,
    #[error("optimiser failure: {0}")]
    Optimizer(String),
    #[error(transparent)]
    Rating(#[from] RatingError),
    #[error(transparent)]
    Params(#[from] ParamError),
}
