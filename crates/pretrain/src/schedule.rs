use anyhow::{bail, Result};
use tch::{Kind, Tensor};

/// Degree-1 polynomial decay from `base` to 0.0 over `total_steps`, no
/// cycling. Steps past the budget stay at 0.0.
pub fn polynomial_decay(base: f64, step: i64, total_steps: i64) -> f64 {
    let fraction = step as f64 / total_steps as f64;
    base * (1.0 - fraction).max(0.0)
}

/// Rescales the gradients of `variables` in place so their global L2 norm
/// does not exceed `max_norm`; gradients already within the ceiling are left
/// untouched. Returns the pre-clip norm.
///
/// A non-finite norm means the backward pass produced NaN/Inf gradients;
/// that is reported as an error before any parameter can be corrupted.
pub fn clip_global_norm(variables: &[Tensor], max_norm: f64) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in variables {
        let grad = var.grad();
        if grad.defined() {
            total_norm_sq += grad.square().sum(Kind::Float).double_value(&[]);
        }
    }
    let global_norm = total_norm_sq.sqrt();

    if !global_norm.is_finite() {
        bail!("non-finite gradient norm: {}", global_norm);
    }

    if global_norm > max_norm {
        let scale = max_norm / (global_norm + 1e-6);
        tch::no_grad(|| {
            for var in variables {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.g_mul_scalar_(scale);
                }
            }
        });
    }

    Ok(global_norm)
}
