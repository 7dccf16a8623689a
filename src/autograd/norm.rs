//! Normalisation operations with analytic backward rules.
//!
//! Both operations normalise, then apply a per-channel affine transform
//! `gamma * x_hat + beta`. Layer norm takes statistics over the channel
//! axis of every position; batch norm takes them per channel over every
//! other axis.

use super::grad_fn::GradFn;
use super::ops::track;
use super::tensor::Tensor;

/// Per-channel statistics gathered by a training-mode batch norm.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    /// Mean of every channel
    pub mean: Vec<f32>,
    /// Biased variance of every channel
    pub variance: Vec<f32>,
}

fn check_affine(x: &Tensor, gamma: &Tensor, beta: &Tensor, op: &str) -> usize {
    let channels = x.last_dim();
    assert_eq!(
        gamma.shape(),
        &[channels],
        "{op}: gamma shape {:?} does not match {channels} channels",
        gamma.shape()
    );
    assert_eq!(
        beta.shape(),
        &[channels],
        "{op}: beta shape {:?} does not match {channels} channels",
        beta.shape()
    );
    channels
}

// ============================================================================
// Layer norm
// ============================================================================

struct LayerNormBackward {
    x_hat: Vec<f32>,
    inv_std: Vec<f32>,
    gamma: Tensor,
    shape: Vec<usize>,
}

impl GradFn for LayerNormBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = grad_outputs[0].data();
        let gamma = self.gamma.data();
        let c = gamma.len();
        let n = c as f32;

        let mut grad_x = vec![0.0; g.len()];
        let mut grad_gamma = vec![0.0; c];
        let mut grad_beta = vec![0.0; c];

        for (row, ((g_row, xh_row), gx_row)) in g
            .chunks(c)
            .zip(self.x_hat.chunks(c))
            .zip(grad_x.chunks_mut(c))
            .enumerate()
        {
            let mut sum_dxh = 0.0;
            let mut sum_dxh_xh = 0.0;
            for k in 0..c {
                let dxh = g_row[k] * gamma[k];
                sum_dxh += dxh;
                sum_dxh_xh += dxh * xh_row[k];
                grad_gamma[k] += g_row[k] * xh_row[k];
                grad_beta[k] += g_row[k];
            }
            let scale = self.inv_std[row] / n;
            for k in 0..c {
                let dxh = g_row[k] * gamma[k];
                gx_row[k] = scale * (n * dxh - sum_dxh - xh_row[k] * sum_dxh_xh);
            }
        }

        vec![
            Tensor::from_vec(grad_x, &self.shape),
            Tensor::from_vec(grad_gamma, &[c]),
            Tensor::from_vec(grad_beta, &[c]),
        ]
    }

    fn name(&self) -> &'static str {
        "LayerNormBackward"
    }
}

// ============================================================================
// Batch norm
// ============================================================================

struct BatchNormBackward {
    x_hat: Vec<f32>,
    inv_std: Vec<f32>,
    gamma: Tensor,
    shape: Vec<usize>,
    /// Whether the statistics came from the batch itself
    batch_stats: bool,
}

impl GradFn for BatchNormBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = grad_outputs[0].data();
        let gamma = self.gamma.data();
        let c = gamma.len();
        let rows = g.len() / c;
        let m = rows as f32;

        let mut grad_gamma = vec![0.0; c];
        let mut grad_beta = vec![0.0; c];
        let mut sum_dxh = vec![0.0; c];
        let mut sum_dxh_xh = vec![0.0; c];

        for (g_row, xh_row) in g.chunks(c).zip(self.x_hat.chunks(c)) {
            for k in 0..c {
                let dxh = g_row[k] * gamma[k];
                grad_gamma[k] += g_row[k] * xh_row[k];
                grad_beta[k] += g_row[k];
                sum_dxh[k] += dxh;
                sum_dxh_xh[k] += dxh * xh_row[k];
            }
        }

        let mut grad_x = vec![0.0; g.len()];
        for ((g_row, xh_row), gx_row) in g
            .chunks(c)
            .zip(self.x_hat.chunks(c))
            .zip(grad_x.chunks_mut(c))
        {
            for k in 0..c {
                let dxh = g_row[k] * gamma[k];
                gx_row[k] = if self.batch_stats {
                    self.inv_std[k] / m * (m * dxh - sum_dxh[k] - xh_row[k] * sum_dxh_xh[k])
                } else {
                    dxh * self.inv_std[k]
                };
            }
        }

        vec![
            Tensor::from_vec(grad_x, &self.shape),
            Tensor::from_vec(grad_gamma, &[c]),
            Tensor::from_vec(grad_beta, &[c]),
        ]
    }

    fn name(&self) -> &'static str {
        "BatchNormBackward"
    }
}

fn affine_normalize(
    x: &Tensor,
    mean: &[f32],
    inv_std: &[f32],
    gamma: &Tensor,
    beta: &Tensor,
) -> (Vec<f32>, Vec<f32>) {
    let c = gamma.numel();
    let mut x_hat = Vec::with_capacity(x.numel());
    let mut out = Vec::with_capacity(x.numel());
    for row in x.data().chunks(c) {
        for (k, &v) in row.iter().enumerate() {
            let xh = (v - mean[k]) * inv_std[k];
            x_hat.push(xh);
            out.push(gamma.data()[k] * xh + beta.data()[k]);
        }
    }
    (x_hat, out)
}

impl Tensor {
    /// Normalise every position over its channel axis:
    /// `gamma * (x - mean) / sqrt(var + eps) + beta`.
    ///
    /// # Panics
    ///
    /// Panics if `gamma` or `beta` is not `[channels]`.
    #[must_use]
    pub fn layer_norm(&self, gamma: &Tensor, beta: &Tensor, eps: f32) -> Tensor {
        let c = check_affine(self, gamma, beta, "layer_norm");
        let n = c as f32;

        let rows = self.numel() / c;
        let mut x_hat = Vec::with_capacity(self.numel());
        let mut inv_std = Vec::with_capacity(rows);
        let mut out = Vec::with_capacity(self.numel());

        for row in self.data().chunks(c) {
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let istd = 1.0 / (var + eps).sqrt();
            inv_std.push(istd);
            for (k, &v) in row.iter().enumerate() {
                let xh = (v - mean) * istd;
                x_hat.push(xh);
                out.push(gamma.data()[k] * xh + beta.data()[k]);
            }
        }

        let result = Tensor::from_vec(out, self.shape());
        track(result, &[self, gamma, beta], |_| LayerNormBackward {
            x_hat,
            inv_std,
            gamma: gamma.clone(),
            shape: self.shape().to_vec(),
        })
    }

    /// Batch norm with statistics taken from this batch, per channel over
    /// every other axis. Returns the statistics alongside the output so
    /// callers can maintain moving averages.
    ///
    /// # Panics
    ///
    /// Panics if `gamma` or `beta` is not `[channels]`.
    #[must_use]
    pub fn batch_norm_train(&self, gamma: &Tensor, beta: &Tensor, eps: f32) -> (Tensor, BatchStats) {
        let c = check_affine(self, gamma, beta, "batch_norm");
        let m = (self.numel() / c) as f32;

        let mut mean = vec![0.0; c];
        for row in self.data().chunks(c) {
            for (acc, &v) in mean.iter_mut().zip(row) {
                *acc += v;
            }
        }
        mean.iter_mut().for_each(|v| *v /= m);

        let mut variance = vec![0.0; c];
        for row in self.data().chunks(c) {
            for k in 0..c {
                let d = row[k] - mean[k];
                variance[k] += d * d;
            }
        }
        variance.iter_mut().for_each(|v| *v /= m);

        let inv_std: Vec<f32> = variance.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
        let (x_hat, out) = affine_normalize(self, &mean, &inv_std, gamma, beta);

        let result = Tensor::from_vec(out, self.shape());
        let result = track(result, &[self, gamma, beta], |_| BatchNormBackward {
            x_hat,
            inv_std,
            gamma: gamma.clone(),
            shape: self.shape().to_vec(),
            batch_stats: true,
        });
        (result, BatchStats { mean, variance })
    }

    /// Batch norm with fixed (moving) statistics.
    ///
    /// # Panics
    ///
    /// Panics if `gamma`, `beta`, `mean` or `variance` do not have one
    /// entry per channel.
    #[must_use]
    pub fn batch_norm_eval(
        &self,
        stats: &BatchStats,
        gamma: &Tensor,
        beta: &Tensor,
        eps: f32,
    ) -> Tensor {
        let c = check_affine(self, gamma, beta, "batch_norm");
        assert!(
            stats.mean.len() == c && stats.variance.len() == c,
            "batch_norm: statistics must have {c} entries"
        );

        let inv_std: Vec<f32> = stats
            .variance
            .iter()
            .map(|v| 1.0 / (v + eps).sqrt())
            .collect();
        let (x_hat, out) = affine_normalize(self, &stats.mean, &inv_std, gamma, beta);

        let result = Tensor::from_vec(out, self.shape());
        track(result, &[self, gamma, beta], |_| BatchNormBackward {
            x_hat,
            inv_std,
            gamma: gamma.clone(),
            shape: self.shape().to_vec(),
            batch_stats: false,
        })
    }
}
