//! Dynamic features of time series stored as `(time, features)` arrays.

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::error::{Error, Result};

fn check_lag(lag: usize, name: &str) -> Result<()> {
    if lag == 0 {
        return Err(Error::Value(format!("'{}' must be positive.", name)));
    }
    Ok(())
}

/// Difference between the values at `t + lag` and `t - lag`, for every time step `t`.
/// Values past either end of the series are replaced by the nearest edge value.
pub fn simple_difference(x: ArrayView2<'_, f32>, lag: usize) -> Result<Array2<f32>> {
    check_lag(lag, "lag")?;
    let n = x.nrows();
    let mut diff = Array2::zeros(x.raw_dim());
    for (t, mut row) in diff.outer_iter_mut().enumerate() {
        let future = x.row((t + lag).min(n - 1));
        let past = x.row(t.saturating_sub(lag));
        row.assign(&(&future - &past));
    }
    Ok(diff)
}

/// Delta features over a half-window of `window` lags: `sum_i i * diff_i / (2 sum_i i^2)`.
pub fn delta_features(x: ArrayView2<'_, f32>, window: usize) -> Result<Array2<f32>> {
    check_lag(window, "window")?;
    let norm = 2. * (1..=window).map(|i| (i * i) as f32).sum::<f32>();
    let mut delta = Array2::zeros(x.raw_dim());
    for lag in 1..=window {
        delta.scaled_add(lag as f32, &simple_difference(x, lag)?);
    }
    Ok(delta / norm)
}

/// Stack static, delta and delta-delta features along the features axis.
pub fn add_dynamic_features(x: ArrayView2<'_, f32>, window: usize) -> Result<Array2<f32>> {
    let delta = delta_features(x, window)?;
    let delta_delta = delta_features(delta.view(), window)?;
    concatenate(Axis(1), &[x.view(), delta.view(), delta_delta.view()])
        .map_err(|e| Error::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn difference_replicates_edges() {
        let x = array![[0.], [1.], [3.], [6.]];
        let diff = simple_difference(x.view(), 1).unwrap();
        assert_eq!(diff, array![[1.], [3.], [5.], [3.]]);

        let diff = simple_difference(x.view(), 10).unwrap();
        assert_eq!(diff, array![[6.], [6.], [6.], [6.]]);
    }

    #[test]
    fn zero_lag() {
        let x = array![[0.], [1.]];
        assert!(matches!(simple_difference(x.view(), 0), Err(Error::Value(_))));
        assert!(matches!(delta_features(x.view(), 0), Err(Error::Value(_))));
    }

    #[test]
    fn delta_of_a_ramp_is_its_slope() {
        let x = Array2::from_shape_fn((20, 2), |(t, j)| t as f32 * (j + 1) as f32);
        let delta = delta_features(x.view(), 3).unwrap();
        // Away from the edges.
        for t in 3..17 {
            assert_relative_eq!(delta[[t, 0]], 1., epsilon = 1e-5);
            assert_relative_eq!(delta[[t, 1]], 2., epsilon = 1e-5);
        }
    }

    #[test]
    fn dynamic_features_shape() {
        let x = Array2::from_shape_fn((12, 4), |(t, j)| (t * j) as f32);
        let full = add_dynamic_features(x.view(), 2).unwrap();
        assert_eq!(full.dim(), (12, 12));
        assert_eq!(full.slice(ndarray::s![.., ..4]), x);
    }
}
