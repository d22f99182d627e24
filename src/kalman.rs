use nalgebra::{DMatrix, DVector};

use crate::errors::RatingError;

#[derive(Debug, Clone)]
pub(crate) struct Posterior {
    pub state: DVector<f64>,
    pub cov: DMatrix<f64>,
}

/// Shared EKF measurement update used by the team and league engines. The
/// measurement noise is diag(predictions): predicted counts are Poisson, so
/// mean equals variance.
///
///   S = H P- H' + diag(pred)
///   K = P- H' S^-1
///   x = x- + K (z - pred)
///   P = (I - K H) P-
///
/// A non-positive-definite S is a fatal numeric failure for the caller.
pub(crate) fn ekf_update(
    x_minus: DVector<f64>,
    p_minus: DMatrix<f64>,
    h: DMatrix<f64>,
    predictions: &DVector<f64>,
    observations: &DVector<f64>,
    round: u32,
) -> Result<Posterior, RatingError> {
    let innovation = observations - predictions;
    let s = &h * &p_minus * h.transpose() + DMatrix::from_diagonal(predictions);
    let chol = s
        .cholesky()
        .ok_or(RatingError::SingularInnovation { round })?;
    // K = P- H' S^-1, computed as (S^-1 H P-)' since S and P- are symmetric.
    let gain = chol.solve(&(&h * &p_minus)).transpose();
    let state = &x_minus + &gain * innovation;
    let dim = x_minus.len();
    let cov = (DMatrix::identity(dim, dim) - &gain * &h) * &p_minus;
    // The one-sided update form drifts off symmetric; pull it back.
    let cov = (&cov + cov.transpose()) * 0.5;
    Ok(Posterior { state, cov })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn scalar_case_reduces_to_closed_form() {
        // One state, one observation: the matrix path must agree with the
        // scalar Kalman formulas.
        let x = DVector::from_vec(vec![1.4]);
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![0.09]));
        let h = DMatrix::from_row_slice(1, 1, &[2.0]);
        let pred = DVector::from_vec(vec![2.8]);
        let obs = DVector::from_vec(vec![4.0]);

        let post = ekf_update(x, p, h, &pred, &obs, 1).unwrap();

        let s = 2.0 * 0.09 * 2.0 + 2.8;
        let k = 0.09 * 2.0 / s;
        assert!((post.state[0] - (1.4 + k * 1.2)).abs() < 1e-12);
        assert!((post.cov[(0, 0)] - (1.0 - k * 2.0) * 0.09).abs() < 1e-12);
    }

    #[test]
    fn posterior_covariance_stays_positive_semi_definite() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..200 {
            let x = DVector::from_vec(vec![
                rng.gen_range(0.5..2.0),
                rng.gen_range(0.5..2.0),
                rng.gen_range(0.5..2.0),
                rng.gen_range(0.5..2.0),
            ]);
            let p = DMatrix::from_diagonal(&DVector::from_vec(vec![
                rng.gen_range(0.01..0.5),
                rng.gen_range(0.01..0.5),
                rng.gen_range(0.01..0.5),
                rng.gen_range(0.01..0.5),
            ]));
            let l_h = rng.gen_range(0.8..1.6);
            let l_a = rng.gen_range(0.8..1.4);
            let h = DMatrix::from_row_slice(
                2,
                4,
                &[l_h * x[3], 0.0, 0.0, l_h * x[0], 0.0, l_a * x[2], l_a * x[1], 0.0],
            );
            let pred = DVector::from_vec(vec![x[0] * l_h * x[3], x[1] * l_a * x[2]]);
            let obs = DVector::from_vec(vec![
                f64::from(rng.gen_range(0u32..6)),
                f64::from(rng.gen_range(0u32..6)),
            ]);

            let post = ekf_update(x, p, h, &pred, &obs, 1).unwrap();
            let sym_diff = (&post.cov - post.cov.transpose()).abs().max();
            assert!(sym_diff < 1e-10);
            let eigen = post.cov.clone().symmetric_eigen();
            for ev in eigen.eigenvalues.iter() {
                assert!(*ev > -1e-10, "negative eigenvalue {ev}");
            }
        }
    }
}
