use crate::errors::RatingError;

/// Log of the Poisson pmf at `count` under mean `rate`. A non-positive or
/// non-finite rate cannot be scored and aborts the evaluation that asked.
pub fn poisson_log_pmf(rate: f64, count: u32) -> Result<f64, RatingError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(RatingError::DegenerateRate { rate, count });
    }
    Ok(-rate + f64::from(count) * rate.ln() - ln_factorial(count))
}

fn ln_factorial(n: u32) -> f64 {
    (2..=n).map(|k| f64::from(k).ln()).sum()
}

/// Running sum of per-observation log-likelihood for one sub-model.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LikelihoodAccumulator {
    total_log_lhood: f64,
    n_obs: usize,
}

impl LikelihoodAccumulator {
    pub fn record(&mut self, log_lhood: f64) {
        self.total_log_lhood += log_lhood;
        self.n_obs += 1;
    }

    pub fn total(&self) -> f64 {
        self.total_log_lhood
    }

    pub fn count(&self) -> usize {
        self.n_obs
    }

    pub fn mean(&self) -> Option<f64> {
        if self.n_obs == 0 {
            return None;
        }
        Some(self.total_log_lhood / self.n_obs as f64)
    }
}

/// Observation-count-weighted blend of two sub-model likelihoods, mapped back
/// to likelihood scale: exp(w_a * mean_a + w_b * mean_b).
pub fn blended_fitness(
    a: &LikelihoodAccumulator,
    b: &LikelihoodAccumulator,
) -> Result<f64, RatingError> {
    let n = a.count() + b.count();
    if n == 0 {
        return Err(RatingError::NoObservations);
    }
    let mut weighted = 0.0;
    for acc in [a, b] {
        if let Some(mean) = acc.mean() {
            weighted += (acc.count() as f64 / n as f64) * mean;
        }
    }
    Ok(weighted.exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisson_log_pmf_matches_hand_values() {
        // P(k=0 | rate=2) = e^-2
        let p0 = poisson_log_pmf(2.0, 0).unwrap();
        assert!((p0 - (-2.0)).abs() < 1e-12);
        // P(k=3 | rate=1.5) = e^-1.5 * 1.5^3 / 6
        let p3 = poisson_log_pmf(1.5, 3).unwrap();
        let expected = (-1.5_f64) + 3.0 * 1.5_f64.ln() - 6.0_f64.ln();
        assert!((p3 - expected).abs() < 1e-12);
    }

    #[test]
    fn non_positive_rate_is_an_error() {
        assert!(poisson_log_pmf(0.0, 1).is_err());
        assert!(poisson_log_pmf(-0.3, 0).is_err());
        assert!(poisson_log_pmf(f64::NAN, 2).is_err());
    }

    #[test]
    fn blend_weights_by_observation_counts() {
        let mut a = LikelihoodAccumulator::default();
        let mut b = LikelihoodAccumulator::default();
        for _ in 0..3 {
            a.record(-1.0);
        }
        b.record(-2.0);
        // 3 obs at mean -1, 1 obs at mean -2 -> exp(0.75 * -1 + 0.25 * -2)
        let fitness = blended_fitness(&a, &b).unwrap();
        assert!((fitness - (-1.25_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn empty_sub_model_contributes_nothing() {
        let mut a = LikelihoodAccumulator::default();
        a.record(-0.5);
        let b = LikelihoodAccumulator::default();
        let fitness = blended_fitness(&a, &b).unwrap();
        assert!((fitness - (-0.5_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn no_observations_at_all_is_an_error() {
        let a = LikelihoodAccumulator::default();
        let b = LikelihoodAccumulator::default();
        assert!(blended_fitness(&a, &b).is_err());
    }
}
