use rand::Rng;

/// Draw from Beta(successes + 1, failures + 1).
///
/// Uses X / (X + Y) with X ~ Gamma(alpha), Y ~ Gamma(beta).
pub fn posterior_sample<R: Rng + ?Sized>(rng: &mut R, served: u64, succeeded: u64) -> f64 {
    let alpha = succeeded as f64 + 1.0;
    let beta = served.saturating_sub(succeeded) as f64 + 1.0;
    beta_sample(rng, alpha, beta)
}

pub fn beta_sample<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let x = gamma_sample(rng, alpha);
    let y = gamma_sample(rng, beta);
    if x + y > 0.0 {
        x / (x + y)
    } else {
        0.5
    }
}

/// Sample from Gamma(shape, 1).
///
/// Marsaglia-Tsang for shape >= 1; smaller shapes are boosted via
/// Gamma(a) = Gamma(a + 1) * U^(1/a).
pub fn gamma_sample<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> f64 {
    if shape < 1.0 {
        let u: f64 = rng.gen();
        return gamma_sample(rng, shape + 1.0) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        // Box-Muller standard normal
        let u1: f64 = rng.gen::<f64>().max(1e-15);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();

        let v = (1.0 + c * z).powi(3);
        if v <= 0.0 {
            continue;
        }

        let u: f64 = rng.gen();
        if u < 1.0 - 0.0331 * z.powi(4) || u.ln() < 0.5 * z * z + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}
