use tch::{nn, Kind, Tensor};

#[derive(Debug)]
pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(vs: &nn::Path, width: i64) -> Self {
        let gamma = vs.var("gamma", &[width], nn::Init::Const(1.0));
        let beta = vs.var("beta", &[width], nn::Init::Const(0.0));
        Self {
            gamma,
            beta,
            eps: 1e-12,
        }
    }

    /// Standardizes the last axis to zero mean / unit variance, then applies
    /// the learned scale and shift.
    /// x: [..., width]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let mean = x.mean_dim(Some(&[-1i64][..]), true, Kind::Float);
        let centered = x - &mean;
        let variance = centered
            .pow_tensor_scalar(2.0)
            .mean_dim(Some(&[-1i64][..]), true, Kind::Float);
        let normalized = &centered / (variance + self.eps).sqrt();
        normalized * &self.gamma + &self.beta
    }
}
