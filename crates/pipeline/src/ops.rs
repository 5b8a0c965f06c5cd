//! Dense tensor kernels over `H x W x C` arrays.
//!
//! Semantics follow the usual NHWC conventions with the batch axis dropped:
//! bilinear resize samples at `dst * in / out` (no corner alignment), and
//! "same" padding splits any odd remainder toward the bottom/right edge.

use ndarray::{Array1, Array3, Array4, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Pointwise nonlinearity applied after a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    /// Bounded to `[-1, 1]`.
    Tanh,
}

impl Activation {
    pub fn apply(self, data: &mut Array3<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => data.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => data.mapv_inplace(f32::tanh),
        }
    }
}

/// Bilinear resize to `out_h x out_w`, channel count unchanged.
pub fn resize_bilinear(input: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (in_h, in_w, channels) = input.dim();
    let mut out = Array3::<f32>::zeros((out_h, out_w, channels));
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return out;
    }

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    // Horizontal taps are the same for every row.
    let taps_x: Vec<(usize, usize, f32)> = (0..out_w)
        .map(|x| {
            let sx = x as f32 * scale_x;
            let x0 = (sx.floor() as usize).min(in_w - 1);
            (x0, (x0 + 1).min(in_w - 1), sx - x0 as f32)
        })
        .collect();

    for y in 0..out_h {
        let sy = y as f32 * scale_y;
        let y0 = (sy.floor() as usize).min(in_h - 1);
        let y1 = (y0 + 1).min(in_h - 1);
        let dy = sy - y0 as f32;

        for (x, &(x0, x1, dx)) in taps_x.iter().enumerate() {
            for c in 0..channels {
                let top = input[[y0, x0, c]] * (1.0 - dx) + input[[y0, x1, c]] * dx;
                let bottom = input[[y1, x0, c]] * (1.0 - dx) + input[[y1, x1, c]] * dx;
                out[[y, x, c]] = top * (1.0 - dy) + bottom * dy;
            }
        }
    }
    out
}

/// Stride-1 convolution with "same" padding.
///
/// `kernel` is laid out `(kh, kw, in_channels, out_channels)`.
pub fn conv2d_same(
    input: ArrayView3<'_, f32>,
    kernel: &Array4<f32>,
    bias: &Array1<f32>,
) -> Result<Array3<f32>, PipelineError> {
    let (h, w, cin) = input.dim();
    let (kh, kw, cout) = check_kernel(cin, kernel, bias)?;
    let src: Vec<f32> = input.iter().copied().collect();
    let k: Vec<f32> = kernel.iter().copied().collect();
    let b: Vec<f32> = bias.iter().copied().collect();

    let pad_y = (kh as isize - 1) / 2;
    let pad_x = (kw as isize - 1) / 2;
    let mut out = vec![0.0f32; h * w * cout];

    for y in 0..h {
        for x in 0..w {
            let o = &mut out[(y * w + x) * cout..][..cout];
            o.copy_from_slice(&b);
            for ky in 0..kh {
                let iy = y as isize + ky as isize - pad_y;
                if iy < 0 || iy >= h as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = x as isize + kx as isize - pad_x;
                    if ix < 0 || ix >= w as isize {
                        continue;
                    }
                    let px = &src[(iy as usize * w + ix as usize) * cin..][..cin];
                    let kbase = (ky * kw + kx) * cin * cout;
                    accumulate(o, px, &k[kbase..kbase + cin * cout]);
                }
            }
        }
    }

    Ok(Array3::from_shape_vec((h, w, cout), out)?)
}

/// Transposed convolution with "same" padding: output is `stride` times
/// the input on both spatial axes.
pub fn conv2d_transpose_same(
    input: ArrayView3<'_, f32>,
    kernel: &Array4<f32>,
    bias: &Array1<f32>,
    stride: usize,
) -> Result<Array3<f32>, PipelineError> {
    if stride == 0 {
        return Err(PipelineError::Unclassified(
            "transposed convolution stride must be positive".to_string(),
        ));
    }
    let (h, w, cin) = input.dim();
    let (kh, kw, cout) = check_kernel(cin, kernel, bias)?;
    let src: Vec<f32> = input.iter().copied().collect();
    let k: Vec<f32> = kernel.iter().copied().collect();

    let (oh, ow) = (h * stride, w * stride);
    let pad_top = same_padding(h, kh, stride, oh) / 2;
    let pad_left = same_padding(w, kw, stride, ow) / 2;
    let mut out = vec![0.0f32; oh * ow * cout];

    for iy in 0..h {
        for ix in 0..w {
            let px = &src[(iy * w + ix) * cin..][..cin];
            for ky in 0..kh {
                let oy = (iy * stride + ky) as isize - pad_top;
                if oy < 0 || oy >= oh as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ox = (ix * stride + kx) as isize - pad_left;
                    if ox < 0 || ox >= ow as isize {
                        continue;
                    }
                    let o = &mut out[(oy as usize * ow + ox as usize) * cout..][..cout];
                    let kbase = (ky * kw + kx) * cin * cout;
                    accumulate(o, px, &k[kbase..kbase + cin * cout]);
                }
            }
        }
    }

    let mut out = Array3::from_shape_vec((oh, ow, cout), out)?;
    out += bias;
    Ok(out)
}

/// `o[co] += sum_ci px[ci] * k[ci][co]`.
fn accumulate(o: &mut [f32], px: &[f32], k: &[f32]) {
    let cout = o.len();
    for (ci, &v) in px.iter().enumerate() {
        if v == 0.0 {
            continue;
        }
        let row = &k[ci * cout..][..cout];
        for (acc, &wgt) in o.iter_mut().zip(row) {
            *acc += v * wgt;
        }
    }
}

fn same_padding(input: usize, kernel: usize, stride: usize, output: usize) -> isize {
    ((input as isize - 1) * stride as isize + kernel as isize - output as isize).max(0)
}

fn check_kernel(
    in_channels: usize,
    kernel: &Array4<f32>,
    bias: &Array1<f32>,
) -> Result<(usize, usize, usize), PipelineError> {
    let (kh, kw, kcin, cout) = kernel.dim();
    if kcin != in_channels {
        return Err(PipelineError::Shape(format!(
            "kernel expects {kcin} input channels, tensor has {in_channels}"
        )));
    }
    if bias.len() != cout {
        return Err(PipelineError::Shape(format!(
            "bias has {} entries for {cout} filters",
            bias.len()
        )));
    }
    if kh == 0 || kw == 0 || cout == 0 {
        return Err(PipelineError::Shape("kernel has an empty dimension".to_string()));
    }
    Ok((kh, kw, cout))
}
