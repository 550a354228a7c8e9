use crate::types::{ClassError, ClassResult, ProbCube};
use ndarray::Array2;

/// Probabilistic label relaxation parameters
#[derive(Debug, Clone)]
pub struct RelaxationParams {
    /// Square neighborhood size (must be odd); 1 disables relaxation
    pub window_size: usize,
    /// Number of relaxation passes; 0 disables relaxation
    pub iterations: usize,
}

impl Default for RelaxationParams {
    fn default() -> Self {
        Self {
            window_size: 3,
            iterations: 3,
        }
    }
}

impl RelaxationParams {
    /// True when the configuration reduces to the identity
    pub fn is_identity(&self) -> bool {
        self.window_size <= 1 || self.iterations == 0
    }

    /// Padding the prediction pipeline must add around each tile so the
    /// relaxation window has full context at the crop boundary
    pub fn required_pad(&self) -> usize {
        if self.is_identity() {
            0
        } else {
            self.window_size
        }
    }
}

/// Iterative neighborhood-weighted re-scoring of a class-probability cube
/// (class x rows x cols).
///
/// Each pass replaces a pixel's probability vector with its product
/// against the distance-weighted mean of the neighborhood's vectors,
/// renormalized per pixel. Pixels whose vector sums to zero (null pixels)
/// stay at zero: the product keeps them there and the renormalization
/// guard never divides by their zero mass.
pub fn relax_probabilities(
    probabilities: &mut ProbCube,
    params: &RelaxationParams,
) -> ClassResult<()> {
    if params.is_identity() {
        return Ok(());
    }
    if params.window_size % 2 == 0 {
        return Err(ClassError::Configuration(format!(
            "Relaxation window size must be odd, got {}",
            params.window_size
        )));
    }

    let (n_classes, rows, cols) = probabilities.dim();
    let half = params.window_size / 2;
    log::debug!(
        "Relaxing {} probability planes over {}x{} pixels ({} iterations, window {})",
        n_classes,
        rows,
        cols,
        params.iterations,
        params.window_size
    );

    let mut support = vec![0.0f64; n_classes];
    for _ in 0..params.iterations {
        let previous = probabilities.clone();
        for r in 0..rows {
            for c in 0..cols {
                let r_lo = r.saturating_sub(half);
                let r_hi = (r + half + 1).min(rows);
                let c_lo = c.saturating_sub(half);
                let c_hi = (c + half + 1).min(cols);

                support.iter_mut().for_each(|s| *s = 0.0);
                let mut weight_sum = 0.0f64;
                for nr in r_lo..r_hi {
                    for nc in c_lo..c_hi {
                        let dr = nr as f64 - r as f64;
                        let dc = nc as f64 - c as f64;
                        let weight = 1.0 / (1.0 + dr * dr + dc * dc);
                        weight_sum += weight;
                        for k in 0..n_classes {
                            support[k] += weight * previous[[k, nr, nc]] as f64;
                        }
                    }
                }

                let mut norm = 0.0f64;
                for k in 0..n_classes {
                    let updated =
                        previous[[k, r, c]] as f64 * (support[k] / weight_sum);
                    probabilities[[k, r, c]] = updated as f32;
                    norm += updated;
                }
                if norm > 0.0 {
                    for k in 0..n_classes {
                        probabilities[[k, r, c]] /= norm as f32;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Zero out the probability vectors of null pixels so they can neither
/// receive nor propagate a spurious class during relaxation
pub fn mask_null_pixels(probabilities: &mut ProbCube, null_mask: &Array2<bool>) {
    let (n_classes, rows, cols) = probabilities.dim();
    for r in 0..rows {
        for c in 0..cols {
            if null_mask[[r, c]] {
                for k in 0..n_classes {
                    probabilities[[k, r, c]] = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn uniform_cube(n_classes: usize, rows: usize, cols: usize) -> ProbCube {
        Array3::from_elem((n_classes, rows, cols), 1.0 / n_classes as f32)
    }

    #[test]
    fn test_identity_at_window_one() {
        let mut cube = uniform_cube(3, 4, 4);
        cube[[0, 1, 1]] = 0.9;
        cube[[1, 1, 1]] = 0.05;
        cube[[2, 1, 1]] = 0.05;
        let original = cube.clone();

        let params = RelaxationParams {
            window_size: 1,
            iterations: 5,
        };
        relax_probabilities(&mut cube, &params).unwrap();
        assert_eq!(cube, original);
    }

    #[test]
    fn test_identity_at_zero_iterations() {
        let mut cube = uniform_cube(2, 3, 3);
        let original = cube.clone();
        let params = RelaxationParams {
            window_size: 5,
            iterations: 0,
        };
        relax_probabilities(&mut cube, &params).unwrap();
        assert_eq!(cube, original);
    }

    #[test]
    fn test_even_window_rejected() {
        let mut cube = uniform_cube(2, 3, 3);
        let params = RelaxationParams {
            window_size: 4,
            iterations: 1,
        };
        assert!(relax_probabilities(&mut cube, &params).is_err());
    }

    #[test]
    fn test_isolated_outlier_pulled_toward_neighborhood() {
        // Strong class-0 field with one class-1 outlier in the middle
        let mut cube = Array3::zeros((2, 5, 5));
        for r in 0..5 {
            for c in 0..5 {
                cube[[0, r, c]] = 0.9;
                cube[[1, r, c]] = 0.1;
            }
        }
        cube[[0, 2, 2]] = 0.4;
        cube[[1, 2, 2]] = 0.6;

        let params = RelaxationParams::default();
        relax_probabilities(&mut cube, &params).unwrap();
        assert!(
            cube[[0, 2, 2]] > cube[[1, 2, 2]],
            "outlier should take the neighborhood's class"
        );
    }

    #[test]
    fn test_probabilities_stay_normalized() {
        let mut cube = uniform_cube(3, 4, 4);
        cube[[0, 0, 0]] = 0.8;
        cube[[1, 0, 0]] = 0.1;
        cube[[2, 0, 0]] = 0.1;
        let params = RelaxationParams {
            window_size: 3,
            iterations: 2,
        };
        relax_probabilities(&mut cube, &params).unwrap();
        for r in 0..4 {
            for c in 0..4 {
                let sum: f32 = (0..3).map(|k| cube[[k, r, c]]).sum();
                assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_null_pixels_stay_zero() {
        let mut cube = uniform_cube(2, 3, 3);
        let mut null_mask = Array2::from_elem((3, 3), false);
        null_mask[[1, 1]] = true;
        mask_null_pixels(&mut cube, &null_mask);

        let params = RelaxationParams {
            window_size: 3,
            iterations: 3,
        };
        relax_probabilities(&mut cube, &params).unwrap();
        assert_eq!(cube[[0, 1, 1]], 0.0);
        assert_eq!(cube[[1, 1, 1]], 0.0);
    }

    #[test]
    fn test_all_null_tile_stays_all_zero() {
        let mut cube: ProbCube = Array3::zeros((2, 3, 3));
        let params = RelaxationParams::default();
        relax_probabilities(&mut cube, &params).unwrap();
        assert!(cube.iter().all(|&p| p == 0.0));
    }
}
