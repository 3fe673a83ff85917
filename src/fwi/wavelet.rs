use std::f64::consts::PI;

use super::time_steps;

/// Source signature sampled on `[0, max_t)` every `dt`, peak frequency `f0`.
///
/// Zero outside `(-0.9 / f0, 2.9 / f0)`.
pub fn ricker(max_t: f64, dt: f64, f0: f64) -> Vec<f64> {
    let period = 1.0 / f0;

    (0..time_steps(max_t, dt))
        .map(|i| {
            let t = dt * i as f64;
            if t <= -0.9 * period || t >= 2.9 * period {
                0.0
            } else {
                let shifted = (f0 * t - 1.0) * PI;
                let gaussian = (-2.0 * shifted * shifted).exp();
                -(t - 1.0) * gaussian
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count() {
        assert_eq!(ricker(2.0, 0.001, 5.0).len(), 2000);
        assert_eq!(ricker(0.5, 0.002, 5.0).len(), 250);
        assert!(ricker(0.0, 0.001, 5.0).is_empty());
    }

    #[test]
    fn test_zero_after_cutoff() {
        let dt = 0.01;
        let values = ricker(1.0, dt, 5.0);
        // cutoff at 2.9 / 5 = 0.58s
        for (i, v) in values.iter().enumerate() {
            if dt * i as f64 >= 0.6 {
                assert_eq!(*v, 0.0);
            }
        }
    }

    #[test]
    fn test_peak_at_one_period() {
        let values = ricker(1.0, 0.001, 5.0);
        // gaussian is 1 at t = 1/f0 = 0.2s, value -(0.2 - 1) = 0.8
        assert!((values[200] - 0.8).abs() < 1e-12);
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        assert!((max - values[200]).abs() < 1e-3);
    }
}
