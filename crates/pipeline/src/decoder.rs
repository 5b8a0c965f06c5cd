//! Progressive decoder: two doubling upsamplers, a refinement layer and a
//! 3-channel output layer.
//!
//! Parameters are either Glorot-normal initialised from a seed, or loaded
//! from a JSON weights file written by [`DecoderWeights::save`]. Seeded
//! layers depend on the embedding depth, so they are built the first time
//! a given depth is seen and cached for the decoder's lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ndarray::{Array1, Array4, Ix3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ops::{self, Activation};
use crate::tensor::{BufferTracker, Tensor};

/* --------------------------------------------------------------------------
Layer stack
-------------------------------------------------------------------------- */

pub const KERNEL_SIZE: usize = 3;
pub const UPSAMPLE_STRIDE: usize = 2;

/// `(filters, kind, activation)` for each layer, in order.
const LAYOUT: [(usize, LayerKind, Activation); 4] = [
    (64, LayerKind::Transpose, Activation::Relu),
    (32, LayerKind::Transpose, Activation::Relu),
    (16, LayerKind::Conv, Activation::Relu),
    (3, LayerKind::Conv, Activation::Tanh),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Transposed convolution, stride 2.
    Transpose,
    /// Stride-1 convolution.
    Conv,
}

/// Serialized parameters of one layer. `kernel` is row-major over
/// `(kh, kw, in_channels, filters)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerWeights {
    pub kind: LayerKind,
    pub activation: Activation,
    pub kernel_shape: [usize; 4],
    pub kernel: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Full decoder parameter set for one embedding depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderWeights {
    pub in_channels: usize,
    pub layers: Vec<LayerWeights>,
}

impl DecoderWeights {
    /// Glorot-normal kernels and zero biases, reproducible for a given
    /// `(seed, in_channels)`.
    pub fn glorot(seed: u64, in_channels: usize) -> Self {
        let mixed = seed ^ (in_channels as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(mixed);

        let mut cin = in_channels;
        let layers = LAYOUT
            .iter()
            .map(|&(filters, kind, activation)| {
                let shape = [KERNEL_SIZE, KERNEL_SIZE, cin, filters];
                let fan_in = KERNEL_SIZE * KERNEL_SIZE * cin;
                let fan_out = KERNEL_SIZE * KERNEL_SIZE * filters;
                let kernel = glorot_normal(&mut rng, fan_in, fan_out, shape.iter().product());
                cin = filters;
                LayerWeights {
                    kind,
                    activation,
                    kernel_shape: shape,
                    kernel,
                    bias: vec![0.0; filters],
                }
            })
            .collect();

        Self { in_channels, layers }
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Unclassified(format!("reading weights {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Unclassified(format!("parsing weights {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let raw = serde_json::to_string(self)
            .map_err(|e| PipelineError::Unclassified(format!("serializing weights: {e}")))?;
        std::fs::write(path, raw).map_err(|e| {
            PipelineError::Unclassified(format!("writing weights {}: {e}", path.display()))
        })
    }
}

/// Truncated normal with Keras' Glorot scaling: samples beyond two standard
/// deviations are redrawn.
fn glorot_normal(rng: &mut StdRng, fan_in: usize, fan_out: usize, count: usize) -> Vec<f32> {
    // Corrects the variance lost by truncating at 2 sigma.
    const TRUNCATION_CORRECTION: f64 = 0.879_625_661_034_239_8;
    let stddev = (2.0 / (fan_in + fan_out) as f64).sqrt() / TRUNCATION_CORRECTION;

    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        // Box-Muller yields two independent standard normals.
        let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.random::<f64>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f64::consts::TAU * u2;
        for z in [r * theta.cos(), r * theta.sin()] {
            if z.abs() <= 2.0 && out.len() < count {
                out.push((z * stddev) as f32);
            }
        }
    }
    out
}

/* --------------------------------------------------------------------------
Runtime layers
-------------------------------------------------------------------------- */

#[derive(Debug)]
struct Layer {
    kind: LayerKind,
    activation: Activation,
    kernel: Array4<f32>,
    bias: Array1<f32>,
}

#[derive(Debug)]
struct LayerStack {
    in_channels: usize,
    layers: Vec<Layer>,
}

impl LayerStack {
    fn from_weights(weights: DecoderWeights) -> Result<Self, PipelineError> {
        if weights.layers.len() != LAYOUT.len() {
            return Err(PipelineError::Unclassified(format!(
                "decoder expects {} layers, weights have {}",
                LAYOUT.len(),
                weights.layers.len()
            )));
        }

        let mut cin = weights.in_channels;
        let mut layers = Vec::with_capacity(weights.layers.len());
        for (idx, lw) in weights.layers.into_iter().enumerate() {
            let (_, kind, activation) = LAYOUT[idx];
            if lw.kind != kind || lw.activation != activation {
                return Err(PipelineError::Shape(format!(
                    "layer {idx}: expected {kind:?}/{activation:?}, weights have {:?}/{:?}",
                    lw.kind, lw.activation
                )));
            }
            let [kh, kw, kcin, filters] = lw.kernel_shape;
            if kcin != cin || lw.bias.len() != filters {
                return Err(PipelineError::Shape(format!(
                    "layer {idx}: kernel {:?} does not follow {cin} input channels",
                    lw.kernel_shape
                )));
            }
            let kernel = Array4::from_shape_vec((kh, kw, kcin, filters), lw.kernel)?;
            layers.push(Layer {
                kind: lw.kind,
                activation: lw.activation,
                kernel,
                bias: Array1::from_vec(lw.bias),
            });
            cin = filters;
        }
        if cin != 3 {
            return Err(PipelineError::Shape(format!(
                "decoder must end in 3 channels, weights end in {cin}"
            )));
        }

        Ok(Self {
            in_channels: weights.in_channels,
            layers,
        })
    }
}

#[derive(Debug)]
enum Parameters {
    Seeded {
        seed: u64,
        cache: Mutex<HashMap<usize, Arc<LayerStack>>>,
    },
    Fixed(Arc<LayerStack>),
}

/// Decodes a `grid x grid x C` embedding into a `4*grid x 4*grid x 3`
/// tensor with values in `[-1, 1]`.
#[derive(Debug)]
pub struct ProgressiveDecoder {
    params: Parameters,
}

impl ProgressiveDecoder {
    pub fn seeded(seed: u64) -> Self {
        Self {
            params: Parameters::Seeded {
                seed,
                cache: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn from_weights(weights: DecoderWeights) -> Result<Self, PipelineError> {
        Ok(Self {
            params: Parameters::Fixed(Arc::new(LayerStack::from_weights(weights)?)),
        })
    }

    pub fn seed(&self) -> Option<u64> {
        match &self.params {
            Parameters::Seeded { seed, .. } => Some(*seed),
            Parameters::Fixed(_) => None,
        }
    }

    /// Run every layer. Each intermediate result is tracked and dropped as
    /// soon as the next layer has consumed it.
    pub fn decode(
        &self,
        input: &Tensor<Ix3>,
        tracker: &BufferTracker,
    ) -> Result<Tensor<Ix3>, PipelineError> {
        let in_channels = input.dim().2;
        let stack = self.stack_for(in_channels)?;

        let mut current: Option<Tensor<Ix3>> = None;
        for layer in &stack.layers {
            let view = match &current {
                Some(t) => t.view(),
                None => input.view(),
            };
            let mut out = match layer.kind {
                LayerKind::Transpose => {
                    ops::conv2d_transpose_same(view, &layer.kernel, &layer.bias, UPSAMPLE_STRIDE)?
                }
                LayerKind::Conv => ops::conv2d_same(view, &layer.kernel, &layer.bias)?,
            };
            layer.activation.apply(&mut out);
            current = Some(tracker.track(out));
        }

        current.ok_or_else(|| PipelineError::Unclassified("decoder has no layers".to_string()))
    }

    fn stack_for(&self, in_channels: usize) -> Result<Arc<LayerStack>, PipelineError> {
        match &self.params {
            Parameters::Fixed(stack) => {
                if stack.in_channels != in_channels {
                    return Err(PipelineError::Shape(format!(
                        "decoder weights expect {} channels, embedding has {in_channels}",
                        stack.in_channels
                    )));
                }
                Ok(Arc::clone(stack))
            }
            Parameters::Seeded { seed, cache } => {
                let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(stack) = cache.get(&in_channels) {
                    return Ok(Arc::clone(stack));
                }
                let stack = Arc::new(LayerStack::from_weights(DecoderWeights::glorot(
                    *seed,
                    in_channels,
                ))?);
                tracing::debug!(seed, in_channels, "Initialised decoder layers");
                cache.insert(in_channels, Arc::clone(&stack));
                Ok(stack)
            }
        }
    }
}
