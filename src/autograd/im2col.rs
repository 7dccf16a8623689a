//! Kernels behind [`Tensor::conv2d`](super::Tensor::conv2d).
//!
//! Large convolutions are lowered to matrix products: `im2col` gathers every
//! dilated receptive field of an NHWC input into one row of a
//! `[n * oh * ow, fh * fw * cin]` matrix, which multiplies the HWIO weight
//! viewed as `[fh * fw * cin, cout]` and yields the NHWC output directly.
//! The products run on `trueno`'s SIMD matmul. Small convolutions skip the
//! lowering and use a direct loop.

/// Below this many multiply-adds the direct loop beats building the
/// column matrix.
pub(crate) const DIRECT_CONV_MAX_MACS: usize = 16 * 1024;

/// Everything needed to index a stride-1 dilated convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub in_channels: usize,
    pub filter_h: usize,
    pub filter_w: usize,
    pub out_channels: usize,
    pub dilation: (usize, usize),
    /// Implicit zero rows above and columns to the left
    pub offset: (usize, usize),
    pub out_h: usize,
    pub out_w: usize,
}

impl ConvGeometry {
    /// Rows of the column matrix.
    fn patches(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    /// Columns of the column matrix (= rows of the reshaped weight).
    fn patch_len(&self) -> usize {
        self.filter_h * self.filter_w * self.in_channels
    }

    fn macs(&self) -> usize {
        self.patches() * self.patch_len() * self.out_channels
    }

    pub fn uses_gemm(&self) -> bool {
        self.macs() > DIRECT_CONV_MAX_MACS
    }

    /// Input offset of filter tap `(ky, kx)` for output pixel `(oy, ox)`,
    /// or `None` when the tap lands in the zero padding.
    fn tap(&self, b: usize, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<usize> {
        let iy = (oy + ky * self.dilation.0).checked_sub(self.offset.0)?;
        let ix = (ox + kx * self.dilation.1).checked_sub(self.offset.1)?;
        (iy < self.height && ix < self.width)
            .then(|| ((b * self.height + iy) * self.width + ix) * self.in_channels)
    }

    /// Visit every in-bounds `(output pixel, filter tap)` pair.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        for b in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    let pixel = (b * self.out_h + oy) * self.out_w + ox;
                    for ky in 0..self.filter_h {
                        for kx in 0..self.filter_w {
                            if let Some(x_base) = self.tap(b, oy, ox, ky, kx) {
                                f(pixel, ky * self.filter_w + kx, x_base);
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn forward(&self, x: &[f32], weight: &[f32]) -> Vec<f32> {
        if self.uses_gemm() {
            self.forward_gemm(x, weight)
        } else {
            self.forward_direct(x, weight)
        }
    }

    /// Returns `(grad_input, grad_weight)`.
    pub fn backward(&self, x: &[f32], weight: &[f32], grad: &[f32]) -> (Vec<f32>, Vec<f32>) {
        if self.uses_gemm() {
            self.backward_gemm(x, weight, grad)
        } else {
            self.backward_direct(x, weight, grad)
        }
    }

    pub(crate) fn forward_direct(&self, x: &[f32], weight: &[f32]) -> Vec<f32> {
        let (cin, cout) = (self.in_channels, self.out_channels);
        let mut out = vec![0.0; self.patches() * cout];
        self.for_each_tap(|pixel, tap, x_base| {
            let o_row = &mut out[pixel * cout..][..cout];
            for ic in 0..cin {
                let xv = x[x_base + ic];
                let w_row = &weight[(tap * cin + ic) * cout..][..cout];
                for (o, &wv) in o_row.iter_mut().zip(w_row) {
                    *o += xv * wv;
                }
            }
        });
        out
    }

    pub(crate) fn backward_direct(&self, x: &[f32], weight: &[f32], grad: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let (cin, cout) = (self.in_channels, self.out_channels);
        let mut grad_x = vec![0.0; x.len()];
        let mut grad_w = vec![0.0; weight.len()];
        self.for_each_tap(|pixel, tap, x_base| {
            let g_row = &grad[pixel * cout..][..cout];
            for ic in 0..cin {
                let w_base = (tap * cin + ic) * cout;
                let xv = x[x_base + ic];
                let mut acc = 0.0;
                for (oc, &gv) in g_row.iter().enumerate() {
                    acc += gv * weight[w_base + oc];
                    grad_w[w_base + oc] += gv * xv;
                }
                grad_x[x_base + ic] += acc;
            }
        });
        (grad_x, grad_w)
    }

    /// Gather receptive fields into a `[patches, patch_len]` matrix.
    fn im2col(&self, x: &[f32]) -> Vec<f32> {
        let (cin, k) = (self.in_channels, self.patch_len());
        let mut cols = vec![0.0; self.patches() * k];
        self.for_each_tap(|pixel, tap, x_base| {
            cols[pixel * k + tap * cin..][..cin].copy_from_slice(&x[x_base..x_base + cin]);
        });
        cols
    }

    /// Scatter-add a `[patches, patch_len]` matrix back onto the input.
    fn col2im(&self, cols: &[f32], len: usize) -> Vec<f32> {
        let (cin, k) = (self.in_channels, self.patch_len());
        let mut x = vec![0.0; len];
        self.for_each_tap(|pixel, tap, x_base| {
            let src = &cols[pixel * k + tap * cin..][..cin];
            for (d, &s) in x[x_base..x_base + cin].iter_mut().zip(src) {
                *d += s;
            }
        });
        x
    }

    pub(crate) fn forward_gemm(&self, x: &[f32], weight: &[f32]) -> Vec<f32> {
        let cols = matrix(self.patches(), self.patch_len(), self.im2col(x));
        let w = matrix(self.patch_len(), self.out_channels, weight.to_vec());
        product(&cols, &w)
    }

    pub(crate) fn backward_gemm(&self, x: &[f32], weight: &[f32], grad: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let cols = matrix(self.patches(), self.patch_len(), self.im2col(x));
        let w = matrix(self.patch_len(), self.out_channels, weight.to_vec());
        let g = matrix(self.patches(), self.out_channels, grad.to_vec());

        // dW = cols^T @ g, dcols = g @ W^T
        let grad_w = product(&cols.transpose(), &g);
        let grad_cols = product(&g, &w.transpose());
        (self.col2im(&grad_cols, x.len()), grad_w)
    }
}

fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> trueno::Matrix<f32> {
    trueno::Matrix::from_vec(rows, cols, data).expect("valid matrix dimensions")
}

fn product(a: &trueno::Matrix<f32>, b: &trueno::Matrix<f32>) -> Vec<f32> {
    a.matmul(b).expect("matmul should succeed").as_slice().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(len: usize, phase: f32) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.37 + phase).sin()).collect()
    }

    fn geometry(dilation: (usize, usize), offset: (usize, usize)) -> ConvGeometry {
        let (height, width, filter_h, filter_w) = (6, 5, 3, 3);
        let out_h = height + 2 * offset.0 - (filter_h - 1) * dilation.0;
        let out_w = width + 2 * offset.1 - (filter_w - 1) * dilation.1;
        ConvGeometry {
            batch: 2,
            height,
            width,
            in_channels: 3,
            filter_h,
            filter_w,
            out_channels: 4,
            dilation,
            offset,
            out_h,
            out_w,
        }
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < 1e-4, "element {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_gemm_forward_matches_direct() {
        for (dilation, offset) in [((1, 1), (0, 0)), ((2, 1), (2, 1)), ((1, 2), (1, 2))] {
            let g = geometry(dilation, offset);
            let x = values(g.batch * g.height * g.width * g.in_channels, 0.1);
            let w = values(g.patch_len() * g.out_channels, 1.7);
            assert_close(&g.forward_gemm(&x, &w), &g.forward_direct(&x, &w));
        }
    }

    #[test]
    fn test_gemm_backward_matches_direct() {
        for (dilation, offset) in [((1, 1), (1, 1)), ((2, 2), (2, 2))] {
            let g = geometry(dilation, offset);
            let x = values(g.batch * g.height * g.width * g.in_channels, 0.4);
            let w = values(g.patch_len() * g.out_channels, 2.3);
            let grad = values(g.patches() * g.out_channels, 0.9);

            let (gx_gemm, gw_gemm) = g.backward_gemm(&x, &w, &grad);
            let (gx_direct, gw_direct) = g.backward_direct(&x, &w, &grad);
            assert_close(&gx_gemm, &gx_direct);
            assert_close(&gw_gemm, &gw_direct);
        }
    }

    #[test]
    fn test_path_selection() {
        let small = geometry((1, 1), (0, 0));
        assert!(!small.uses_gemm());
        let large = ConvGeometry {
            batch: 8,
            out_h: 16,
            out_w: 16,
            height: 16,
            width: 16,
            offset: (1, 1),
            ..small
        };
        assert!(large.uses_gemm());
    }
}
