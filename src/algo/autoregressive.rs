use super::stats;

/// AR(p) model: x̂ₜ = μ + Σ φᵢ (xₜ₋ᵢ − μ).
#[derive(Debug, Clone, PartialEq)]
pub struct ArModel {
    pub mean: f64,
    pub coefficients: Vec<f64>,
}

impl ArModel {
    pub fn new(mean: f64, coefficients: Vec<f64>) -> Self {
        Self { mean, coefficients }
    }

    pub fn order(&self) -> usize {
        self.coefficients.len()
    }

    /// Estimate coefficients with the Yule-Walker equations, solved by
    /// Levinson-Durbin recursion on the biased autocovariance.
    ///
    /// A series with zero variance yields all-zero coefficients.
    pub fn fit(data: &[f64], order: usize) -> Self {
        let mean = stats::mean(data);
        let n = data.len();
        let mut acov = vec![0.0; order + 1];
        for (k, slot) in acov.iter_mut().enumerate() {
            if k >= n {
                break;
            }
            let sum: f64 = (k..n).map(|t| (data[t] - mean) * (data[t - k] - mean)).sum();
            *slot = sum / n as f64;
        }

        let mut phi = vec![0.0; order];
        if order == 0 || acov[0].abs() < 1e-12 {
            return Self::new(mean, phi);
        }

        let mut error = acov[0];
        for k in 0..order {
            let mut acc = acov[k + 1];
            for j in 0..k {
                acc -= phi[j] * acov[k - j];
            }
            let reflection = acc / error;
            let prev = phi.clone();
            phi[k] = reflection;
            for j in 0..k {
                phi[j] = prev[j] - reflection * prev[k - 1 - j];
            }
            error *= 1.0 - reflection * reflection;
            if error <= 1e-12 {
                break;
            }
        }

        Self::new(mean, phi)
    }

    /// One-step-ahead prediction of `history[t]` from the `p` values before it.
    pub fn predict(&self, history: &[f64], t: usize) -> f64 {
        self.coefficients
            .iter()
            .enumerate()
            .map(|(i, phi)| phi * (history[t - 1 - i] - self.mean))
            .sum::<f64>()
            + self.mean
    }

    /// Residuals for positions `p..n`.
    pub fn residuals(&self, data: &[f64]) -> Vec<f64> {
        let p = self.order();
        (p..data.len()).map(|t| data[t] - self.predict(data, t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_recovers_ar1_coefficient() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut data = vec![0.0; 5000];
        for t in 1..data.len() {
            data[t] = 0.7 * data[t - 1] + noise.sample(&mut rng);
        }
        let model = ArModel::fit(&data, 1);
        assert!((model.coefficients[0] - 0.7).abs() < 0.05, "{:?}", model);
    }

    #[test]
    fn test_recovers_ar2_coefficients() {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let mut data = vec![0.0; 8000];
        for t in 2..data.len() {
            data[t] = 0.5 * data[t - 1] - 0.3 * data[t - 2] + noise.sample(&mut rng);
        }
        let model = ArModel::fit(&data, 2);
        assert!((model.coefficients[0] - 0.5).abs() < 0.05, "{:?}", model);
        assert!((model.coefficients[1] + 0.3).abs() < 0.05, "{:?}", model);
    }

    #[test]
    fn test_constant_series_has_zero_coefficients() {
        let model = ArModel::fit(&[4.0; 30], 2);
        assert_eq!(model.coefficients, vec![0.0, 0.0]);
        assert_eq!(model.mean, 4.0);
        assert!(model.residuals(&[4.0; 30]).iter().all(|r| *r == 0.0));
    }

    #[test]
    fn test_residual_alignment() {
        let model = ArModel::new(0.0, vec![1.0]);
        let residuals = model.residuals(&[1.0, 2.0, 4.0]);
        assert_eq!(residuals, vec![1.0, 2.0]);
    }
}
