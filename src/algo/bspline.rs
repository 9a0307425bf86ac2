use crate::error::FitError;

/// Cubic splines everywhere in the pipeline.
pub const DEGREE: usize = 3;

/// Position of the `index`-th of `count` samples on the unit interval.
/// Samples are spaced by order, not by wall-clock time.
pub fn sample_position(index: usize, count: usize) -> f64 {
    if count <= 1 {
        0.0
    } else {
        index as f64 / (count - 1) as f64
    }
}

/// `count` evenly spaced knots on `[0, 1]`, ends included.
pub fn uniform_knots(count: usize) -> Vec<f64> {
    (0..count).map(|i| sample_position(i, count)).collect()
}

/// Clamped B-spline basis over a set of knots spanning `[0, 1]`.
///
/// The end knots are repeated `degree` extra times, so `k` knots give
/// `k + degree - 1` basis functions (`k + 2` for cubics).
#[derive(Debug, Clone)]
pub struct BSplineBasis {
    augmented: Vec<f64>,
    degree: usize,
}

impl BSplineBasis {
    pub fn new(knots: &[f64], degree: usize) -> Self {
        let lo = knots.first().copied().unwrap_or(0.0);
        let hi = knots.last().copied().unwrap_or(1.0);
        let mut augmented = Vec::with_capacity(knots.len() + 2 * degree);
        augmented.extend(std::iter::repeat_n(lo, degree));
        augmented.extend_from_slice(knots);
        augmented.extend(std::iter::repeat_n(hi, degree));
        Self { augmented, degree }
    }

    pub fn num_basis(&self) -> usize {
        self.augmented.len().saturating_sub(self.degree + 1)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Index of the last basis function that is non-zero at `x`.
    fn find_span(&self, x: f64) -> usize {
        let n = self.num_basis() - 1;
        let u = &self.augmented;
        if x >= u[n + 1] {
            return n;
        }
        if x <= u[self.degree] {
            return self.degree;
        }
        let (mut low, mut high) = (self.degree, n + 1);
        let mut mid = (low + high) / 2;
        while x < u[mid] || x >= u[mid + 1] {
            if x < u[mid] {
                high = mid;
            } else {
                low = mid;
            }
            mid = (low + high) / 2;
        }
        mid
    }

    /// The `degree + 1` non-zero basis values at `x`, for functions
    /// `span - degree ..= span` (Cox-de Boor recursion).
    fn basis_funs(&self, span: usize, x: f64) -> Vec<f64> {
        let p = self.degree;
        let u = &self.augmented;
        let mut n = vec![0.0; p + 1];
        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];
        n[0] = 1.0;
        for j in 1..=p {
            left[j] = x - u[span + 1 - j];
            right[j] = u[span + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom != 0.0 { n[r] / denom } else { 0.0 };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }
        n
    }

    /// First basis index and the non-zero basis values at `x`.
    pub fn nonzero(&self, x: f64) -> (usize, Vec<f64>) {
        let span = self.find_span(x);
        (span - self.degree, self.basis_funs(span, x))
    }

    pub fn evaluate(&self, x: f64, coefficients: &[f64]) -> f64 {
        if self.num_basis() == 0 || coefficients.len() != self.num_basis() {
            return f64::NAN;
        }
        let (first, values) = self.nonzero(x.clamp(0.0, 1.0));
        values
            .iter()
            .enumerate()
            .map(|(i, b)| b * coefficients[first + i])
            .sum()
    }
}

/// Result of a least-squares spline fit over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineSolution {
    pub knots: Vec<f64>,
    pub coefficients: Vec<f64>,
    pub fitted: Vec<f64>,
    pub mse: f64,
}

/// Least-squares cubic spline through `values` placed at evenly spaced
/// positions, with `num_knots` uniform knots.
pub fn fit(values: &[f64], num_knots: usize) -> Result<SplineSolution, FitError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite);
    }
    let knots = uniform_knots(num_knots.max(2));
    let basis = BSplineBasis::new(&knots, DEGREE);
    let m = basis.num_basis();
    if values.len() < m {
        return Err(FitError::TooFewPoints {
            required: m,
            actual: values.len(),
        });
    }

    // Normal equations BᵀB c = Bᵀy. BᵀB is banded with half-bandwidth `DEGREE`;
    // band[i][d] holds entry (i, i + d).
    let p = DEGREE;
    let mut band = vec![vec![0.0; p + 1]; m];
    let mut rhs = vec![0.0; m];
    let rows: Vec<(usize, Vec<f64>)> = (0..values.len())
        .map(|i| basis.nonzero(sample_position(i, values.len())))
        .collect();
    for ((first, b), y) in rows.iter().zip(values) {
        for a in 0..=p {
            rhs[first + a] += b[a] * y;
            for c in a..=p {
                band[first + a][c - a] += b[a] * b[c];
            }
        }
    }

    let coefficients = solve_banded_spd(&band, &rhs)?;

    let fitted: Vec<f64> = rows
        .iter()
        .map(|(first, b)| b.iter().enumerate().map(|(i, v)| v * coefficients[first + i]).sum())
        .collect();
    if fitted.iter().any(|v: &f64| !v.is_finite()) {
        return Err(FitError::NonFinite);
    }
    let mse = values
        .iter()
        .zip(&fitted)
        .map(|(y, f)| (y - f).powi(2))
        .sum::<f64>()
        / values.len() as f64;

    Ok(SplineSolution {
        knots,
        coefficients,
        fitted,
        mse,
    })
}

/// Solve a symmetric positive-definite banded system by Cholesky.
/// `band[i][d]` is entry `(i, i + d)` for `d <= p`.
fn solve_banded_spd(band: &[Vec<f64>], rhs: &[f64]) -> Result<Vec<f64>, FitError> {
    let m = rhs.len();
    if m == 0 {
        return Ok(Vec::new());
    }
    let p = band[0].len() - 1;
    let scale = band.iter().map(|r| r[0].abs()).fold(0.0, f64::max);
    let tol = scale * 1e-12;

    // l[i][d] = L(i, i - d)
    let mut l = vec![vec![0.0; p + 1]; m];
    let lij = |l: &Vec<Vec<f64>>, i: usize, j: usize| -> f64 {
        if i >= j && i - j <= p { l[i][i - j] } else { 0.0 }
    };

    for i in 0..m {
        let start = i.saturating_sub(p);
        for j in start..i {
            let mut sum = band[j][i - j];
            for k in start..j {
                sum -= lij(&l, i, k) * lij(&l, j, k);
            }
            l[i][i - j] = sum / l[j][0];
        }
        let mut diag = band[i][0];
        for k in start..i {
            diag -= lij(&l, i, k).powi(2);
        }
        if !(diag > tol) {
            return Err(FitError::Singular {
                column: i,
                pivot: diag,
            });
        }
        l[i][0] = diag.sqrt();
    }

    // L z = rhs
    let mut z = vec![0.0; m];
    for i in 0..m {
        let mut sum = rhs[i];
        for k in i.saturating_sub(p)..i {
            sum -= lij(&l, i, k) * z[k];
        }
        z[i] = sum / l[i][0];
    }
    // Lᵀ c = z
    let mut c = vec![0.0; m];
    for i in (0..m).rev() {
        let mut sum = z[i];
        for r in (i + 1)..m.min(i + p + 1) {
            sum -= lij(&l, r, i) * c[r];
        }
        c[i] = sum / l[i][0];
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basis_count_and_partition_of_unity() {
        let basis = BSplineBasis::new(&uniform_knots(6), DEGREE);
        assert_eq!(basis.num_basis(), 8);

        let ones = vec![1.0; basis.num_basis()];
        for i in 0..=50 {
            let x = i as f64 / 50.0;
            assert!((basis.evaluate(x, &ones) - 1.0).abs() < 1e-12, "x = {x}");
        }
    }

    #[test]
    fn test_fit_reproduces_cubic() {
        let n = 24;
        let values: Vec<f64> = (0..n)
            .map(|i| {
                let x = sample_position(i, n);
                2.0 - 3.0 * x + 0.5 * x * x + 4.0 * x * x * x
            })
            .collect();
        let sol = fit(&values, 6).unwrap();
        assert!(sol.mse < 1e-18, "mse = {}", sol.mse);
        for (y, f) in values.iter().zip(&sol.fitted) {
            assert!((y - f).abs() < 1e-9);
        }

        let basis = BSplineBasis::new(&sol.knots, DEGREE);
        let mid = basis.evaluate(0.5, &sol.coefficients);
        assert!((mid - (2.0 - 1.5 + 0.125 + 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_fit_smooths_spike() {
        let mut values = vec![10.0; 40];
        values[20] = 60.0;
        let sol = fit(&values, 10).unwrap();
        let residual = values[20] - sol.fitted[20];
        assert!(residual > 20.0);
        assert!(sol.mse > 0.0);
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        assert_eq!(
            fit(&[1.0, 2.0, 3.0], 2).unwrap_err(),
            FitError::TooFewPoints {
                required: 4,
                actual: 3
            }
        );
        assert_eq!(fit(&[1.0, f64::NAN, 3.0, 4.0], 2).unwrap_err(), FitError::NonFinite);
    }

    #[test]
    fn test_singular_system_detected() {
        // [[1, 1], [1, 1]] has a zero second pivot.
        let band = vec![vec![1.0, 1.0], vec![1.0, 0.0]];
        let err = solve_banded_spd(&band, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, FitError::Singular { column: 1, .. }));
    }

    #[test]
    fn test_banded_solve_matches_dense() {
        // Tridiagonal SPD system with known solution [1, 2, 3].
        let band = vec![vec![4.0, 1.0], vec![4.0, 1.0], vec![4.0, 0.0]];
        let rhs = [6.0, 12.0, 14.0];
        let c = solve_banded_spd(&band, &rhs).unwrap();
        for (got, want) in c.iter().zip([1.0, 2.0, 3.0]) {
            assert!((got - want).abs() < 1e-12);
        }
    }
}
