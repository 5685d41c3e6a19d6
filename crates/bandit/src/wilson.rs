use inbox_core::types::Interval;

/// Wilson score interval for `successes` out of `trials` at the given z.
///
/// Zero trials yields `[0, 0]`. Bounds are clamped to `[0, 1]`.
pub fn wilson_interval(successes: u64, trials: u64, z: f64) -> Interval {
    if trials == 0 {
        return Interval::ZERO;
    }
    let n = trials as f64;
    let p = successes.min(trials) as f64 / n;
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let stderr = (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();

    Interval {
        lower: ((center - z * stderr) / denom).clamp(0.0, 1.0),
        upper: ((center + z * stderr) / denom).clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_trials() {
        assert_eq!(wilson_interval(0, 0, 1.96), Interval::ZERO);
    }

    #[test]
    fn test_half_of_hundred() {
        let ci = wilson_interval(50, 100, 1.96);
        assert!((ci.lower - 0.4038).abs() < 1e-4, "lower {}", ci.lower);
        assert!((ci.upper - 0.5962).abs() < 1e-4, "upper {}", ci.upper);
    }

    #[test]
    fn test_extremes_stay_in_range() {
        let none = wilson_interval(0, 20, 1.96);
        assert!(none.lower.abs() < 1e-12);
        assert!(none.upper > 0.0 && none.upper < 0.2);

        let all = wilson_interval(20, 20, 1.96);
        assert!(all.upper <= 1.0);
        assert!(all.lower > 0.8);
    }

    #[test]
    fn test_interval_narrows_with_more_trials() {
        let small = wilson_interval(5, 10, 1.96);
        let large = wilson_interval(500, 1000, 1.96);
        assert!(large.upper - large.lower < small.upper - small.lower);
        assert!(large.contains(0.5) && small.contains(0.5));
    }
}
