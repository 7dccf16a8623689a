//! Differentiable operations on rank-4 `[batch, height, width, channels]` tensors.
//!
//! Convolution weights use the `[filter_h, filter_w, in_channels, out_channels]`
//! layout. All convolutions run with stride 1; padding is either explicit
//! ([`Tensor::pad_spatial`]) or implicit through [`SpatialPadding`].

use super::grad_fn::GradFn;
use super::im2col::ConvGeometry;
use super::ops::track;
use super::tensor::Tensor;

/// Rows/columns of implicit zero padding around the spatial axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpatialPadding {
    /// Rows added above
    pub top: usize,
    /// Rows added below
    pub bottom: usize,
    /// Columns added on the left
    pub left: usize,
    /// Columns added on the right
    pub right: usize,
}

impl SpatialPadding {
    /// No padding at all.
    pub const NONE: Self = Self {
        top: 0,
        bottom: 0,
        left: 0,
        right: 0,
    };

    /// Padding for a filter covering `span` rows/columns (`(f - 1) * d + 1`)
    /// so that the output keeps the input size. The odd pixel goes after.
    #[must_use]
    pub fn same(span_h: usize, span_w: usize) -> Self {
        let (total_h, total_w) = (span_h.saturating_sub(1), span_w.saturating_sub(1));
        Self {
            top: total_h / 2,
            bottom: total_h - total_h / 2,
            left: total_w / 2,
            right: total_w - total_w / 2,
        }
    }
}

fn dims4(t: &Tensor, op: &str) -> [usize; 4] {
    let s = t.shape();
    assert_eq!(s.len(), 4, "{op} requires a rank-4 tensor, got {s:?}");
    [s[0], s[1], s[2], s[3]]
}

// ============================================================================
// Spatial padding
// ============================================================================

struct PadBackward {
    input_shape: [usize; 4],
    top: usize,
    left: usize,
}

impl GradFn for PadBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let [_, gh, gw, _] = dims4(g, "PadBackward");
        let [n, h, w, c] = self.input_shape;
        let src = g.data();

        let mut out = Vec::with_capacity(n * h * w * c);
        for b in 0..n {
            for y in 0..h {
                let row = (b * gh + y + self.top) * gw + self.left;
                out.extend_from_slice(&src[row * c..(row + w) * c]);
            }
        }
        vec![Tensor::from_vec(out, &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "PadBackward"
    }
}

// ============================================================================
// Dilated convolution
// ============================================================================

struct Conv2dBackward {
    input: Tensor,
    weight: Tensor,
    geometry: ConvGeometry,
}

impl GradFn for Conv2dBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let (grad_x, grad_w) =
            self.geometry
                .backward(self.input.data(), self.weight.data(), grad_outputs[0].data());
        vec![
            Tensor::from_vec(grad_x, self.input.shape()),
            Tensor::from_vec(grad_w, self.weight.shape()),
        ]
    }

    fn name(&self) -> &'static str {
        "Conv2dBackward"
    }
}

// ============================================================================
// Channel concat / narrow
// ============================================================================

struct ConcatChannelsBackward {
    widths: Vec<usize>,
    leading: Vec<usize>,
}

impl GradFn for ConcatChannelsBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = grad_outputs[0].data();
        let total: usize = self.widths.iter().sum();
        let rows = g.len() / total;

        let mut parts: Vec<Vec<f32>> = self
            .widths
            .iter()
            .map(|&c| Vec::with_capacity(rows * c))
            .collect();
        for row in g.chunks(total) {
            let mut offset = 0;
            for (part, &c) in parts.iter_mut().zip(&self.widths) {
                part.extend_from_slice(&row[offset..offset + c]);
                offset += c;
            }
        }

        parts
            .into_iter()
            .zip(&self.widths)
            .map(|(data, &c)| {
                let mut shape = self.leading.clone();
                shape.push(c);
                Tensor::from_vec(data, &shape)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "ConcatChannelsBackward"
    }
}

struct NarrowChannelsBackward {
    input_shape: Vec<usize>,
    start: usize,
}

impl GradFn for NarrowChannelsBackward {
    fn backward(&self, grad_outputs: &[Tensor]) -> Vec<Tensor> {
        let g = &grad_outputs[0];
        let len = g.last_dim();
        let channels = *self.input_shape.last().unwrap_or(&0);

        let mut out = vec![0.0; self.input_shape.iter().product()];
        for (dst, src) in out.chunks_mut(channels).zip(g.data().chunks(len)) {
            dst[self.start..self.start + len].copy_from_slice(src);
        }
        vec![Tensor::from_vec(out, &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "NarrowChannelsBackward"
    }
}

impl Tensor {
    /// Zero-pad the height and width axes of an NHWC tensor.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not rank 4.
    #[must_use]
    pub fn pad_spatial(&self, padding: SpatialPadding) -> Tensor {
        let [n, h, w, c] = dims4(self, "pad_spatial");
        let SpatialPadding {
            top,
            bottom,
            left,
            right,
        } = padding;
        let (ph, pw) = (h + top + bottom, w + left + right);

        let src = self.data();
        let mut out = vec![0.0; n * ph * pw * c];
        for b in 0..n {
            for y in 0..h {
                let dst_row = (b * ph + y + top) * pw + left;
                let src_row = (b * h + y) * w;
                out[dst_row * c..(dst_row + w) * c]
                    .copy_from_slice(&src[src_row * c..(src_row + w) * c]);
            }
        }

        let result = Tensor::from_vec(out, &[n, ph, pw, c]);
        track(result, &[self], |_| PadBackward {
            input_shape: [n, h, w, c],
            top,
            left,
        })
    }

    /// Stride-1 dilated 2-D convolution with implicit zero padding.
    ///
    /// `weight` has shape `[filter_h, filter_w, in_channels, out_channels]`.
    /// The output has `h + top + bottom - (filter_h - 1) * dilation_h` rows
    /// and the analogous number of columns.
    ///
    /// # Panics
    ///
    /// Panics if either tensor is not rank 4, the channel counts disagree,
    /// a dilation is zero, or the dilated filter is larger than the padded
    /// input.
    #[must_use]
    pub fn conv2d(&self, weight: &Tensor, dilation: (usize, usize), padding: SpatialPadding) -> Tensor {
        let [n, h, w, cin] = dims4(self, "conv2d");
        let [fh, fw, wcin, cout] = dims4(weight, "conv2d");
        let (dh, dw) = dilation;
        assert_eq!(
            cin, wcin,
            "conv2d: input has {cin} channels but weight expects {wcin}"
        );
        assert!(dh > 0 && dw > 0, "conv2d: dilation must be positive");

        let span_h = (fh - 1) * dh + 1;
        let span_w = (fw - 1) * dw + 1;
        let (ph, pw) = (h + padding.top + padding.bottom, w + padding.left + padding.right);
        assert!(
            span_h <= ph && span_w <= pw,
            "conv2d: dilated filter {span_h}x{span_w} exceeds padded input {ph}x{pw}"
        );
        let geometry = ConvGeometry {
            batch: n,
            height: h,
            width: w,
            in_channels: cin,
            filter_h: fh,
            filter_w: fw,
            out_channels: cout,
            dilation,
            offset: (padding.top, padding.left),
            out_h: ph - span_h + 1,
            out_w: pw - span_w + 1,
        };

        let out = geometry.forward(self.data(), weight.data());
        let result = Tensor::from_vec(out, &[n, geometry.out_h, geometry.out_w, cout]);
        track(result, &[self, weight], |_| Conv2dBackward {
            input: self.clone(),
            weight: weight.clone(),
            geometry,
        })
    }

    /// Concatenate tensors along the last (channel) axis.
    ///
    /// # Panics
    ///
    /// Panics if `parts` is empty or the leading dimensions differ.
    #[must_use]
    pub fn concat_channels(parts: &[&Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_channels needs at least one tensor");
        let leading = parts[0].shape()[..parts[0].ndim() - 1].to_vec();
        for p in parts {
            assert_eq!(
                &p.shape()[..p.ndim() - 1],
                leading.as_slice(),
                "concat_channels: leading dimensions differ"
            );
        }

        let widths: Vec<usize> = parts.iter().map(|p| p.last_dim()).collect();
        let total: usize = widths.iter().sum();
        let rows: usize = leading.iter().product();

        let mut out = Vec::with_capacity(rows * total);
        for r in 0..rows {
            for (p, &c) in parts.iter().zip(&widths) {
                out.extend_from_slice(&p.data()[r * c..(r + 1) * c]);
            }
        }

        let mut shape = leading.clone();
        shape.push(total);
        let result = Tensor::from_vec(out, &shape);
        track(result, parts, |_| ConcatChannelsBackward { widths, leading })
    }

    /// Select `len` channels starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the channel axis.
    #[must_use]
    pub fn narrow_channels(&self, start: usize, len: usize) -> Tensor {
        let channels = self.last_dim();
        assert!(
            start + len <= channels,
            "narrow_channels: range {start}..{} exceeds {channels} channels",
            start + len
        );

        let mut out = Vec::with_capacity(self.numel() / channels * len);
        for row in self.data().chunks(channels) {
            out.extend_from_slice(&row[start..start + len]);
        }

        let mut shape = self.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = len;
        }
        let result = Tensor::from_vec(out, &shape);
        track(result, &[self], |_| NarrowChannelsBackward {
            input_shape: self.shape().to_vec(),
            start,
        })
    }

    /// Split the channel axis into `n` equal chunks.
    ///
    /// # Panics
    ///
    /// Panics if the channel count is not divisible by `n`.
    #[must_use]
    pub fn split_channels(&self, n: usize) -> Vec<Tensor> {
        let channels = self.last_dim();
        assert!(
            n > 0 && channels % n == 0,
            "split_channels: {channels} channels cannot be split into {n} parts"
        );
        let size = channels / n;
        (0..n).map(|i| self.narrow_channels(i * size, size)).collect()
    }
}
