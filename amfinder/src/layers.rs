//! Layer definitions for the sequential CNN runtime.
//!
//! Tensors are NHWC (`[batch, height, width, channels]`) for spatial layers and
//! `[batch, features]` after flattening, mirroring the Keras layout the models
//! are exported from. Every layer has a forward pass; every layer except
//! `Conv2D` also has a backward pass (vector-Jacobian product), which is all the
//! classifier tail of a model needs.

use anyhow::{bail, ensure, Result};
use ndarray::{Array1, Array2, Array4, ArrayD, ArrayView2, Axis, Ix2, Ix4, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::AmfError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    /// Apply in place. Softmax normalizes along the last axis.
    pub fn apply(self, z: &mut ArrayD<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => z.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => z.mapv_inplace(f32::tanh),
            Activation::Softmax => {
                let last = Axis(z.ndim() - 1);
                for mut lane in z.lanes_mut(last) {
                    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max).exp());
                    let sum = lane.sum();
                    lane.mapv_inplace(|v| v / sum);
                }
            }
        }
    }

    /// Gradient with respect to the pre-activation, given the activated output.
    pub fn backward(self, output: &ArrayD<f32>, grad: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Activation::Linear => grad.clone(),
            Activation::Relu => {
                Zip::from(output)
                    .and(grad)
                    .map_collect(|&y, &g| if y > 0.0 { g } else { 0.0 })
            }
            Activation::Sigmoid => Zip::from(output)
                .and(grad)
                .map_collect(|&y, &g| g * y * (1.0 - y)),
            Activation::Tanh => Zip::from(output)
                .and(grad)
                .map_collect(|&y, &g| g * (1.0 - y * y)),
            Activation::Softmax => {
                let last = Axis(output.ndim() - 1);
                let mut result = ArrayD::<f32>::zeros(output.raw_dim());
                Zip::from(result.lanes_mut(last))
                    .and(output.lanes(last))
                    .and(grad.lanes(last))
                    .for_each(|mut out, y, g| {
                        let dot = y.dot(&g);
                        Zip::from(&mut out)
                            .and(&y)
                            .and(&g)
                            .for_each(|o, &yv, &gv| *o = yv * (gv - dot));
                    });
                result
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

fn unit_strides() -> [usize; 2] {
    [1, 1]
}

fn default_bn_epsilon() -> f32 {
    1e-3
}

/// 2D convolution with an HWIO kernel (`[kh, kw, in_channels, filters]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub kernel_shape: [usize; 4],
    pub kernel: Vec<f32>,
    #[serde(default)]
    pub bias: Vec<f32>,
    #[serde(default = "unit_strides")]
    pub strides: [usize; 2],
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool2d {
    pub pool_size: [usize; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strides: Option<[usize; 2]>,
}

impl Pool2d {
    fn strides(&self) -> [usize; 2] {
        self.strides.unwrap_or(self.pool_size)
    }
}

/// Fully connected layer with an `[in, units]` kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub kernel_shape: [usize; 2],
    pub kernel: Vec<f32>,
    #[serde(default)]
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

/// Inference-mode batch normalization over the last axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub moving_mean: Vec<f32>,
    pub moving_variance: Vec<f32>,
    #[serde(default = "default_bn_epsilon")]
    pub epsilon: f32,
}

impl BatchNorm {
    /// Per-channel `(scale, shift)` so that `y = x * scale + shift`.
    fn affine(&self) -> (Array1<f32>, Array1<f32>) {
        let scale: Array1<f32> = self
            .gamma
            .iter()
            .zip(&self.moving_variance)
            .map(|(g, v)| g / (v + self.epsilon).sqrt())
            .collect();
        let shift: Array1<f32> = self
            .beta
            .iter()
            .zip(&self.moving_mean)
            .zip(scale.iter())
            .map(|((b, m), s)| b - m * s)
            .collect();
        (scale, shift)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d(Conv2d),
    MaxPooling2d(Pool2d),
    GlobalAveragePooling2d,
    Flatten,
    Dense(Dense),
    Dropout {
        #[serde(default)]
        rate: f32,
    },
    Activation {
        activation: Activation,
    },
    BatchNormalization(BatchNorm),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: LayerKind,
}

/// Summary of one layer, for logging and introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerDescriptor {
    pub index: usize,
    pub kind: &'static str,
    pub convolutional: bool,
    pub output_shape: Vec<usize>,
}

/// Output size and leading padding of one spatial axis.
fn spatial_output(
    size: usize,
    window: usize,
    stride: usize,
    padding: Padding,
) -> Option<(usize, usize)> {
    if stride == 0 || window == 0 || size == 0 {
        return None;
    }
    match padding {
        Padding::Valid => {
            if size < window {
                None
            } else {
                Some(((size - window) / stride + 1, 0))
            }
        }
        Padding::Same => {
            let out = size.div_ceil(stride);
            let pad_total = ((out - 1) * stride + window).saturating_sub(size);
            Some((out, pad_total / 2))
        }
    }
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self { name: None, kind }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            LayerKind::Conv2d(_) => "conv2d",
            LayerKind::MaxPooling2d(_) => "max_pooling2d",
            LayerKind::GlobalAveragePooling2d => "global_average_pooling2d",
            LayerKind::Flatten => "flatten",
            LayerKind::Dense(_) => "dense",
            LayerKind::Dropout { .. } => "dropout",
            LayerKind::Activation { .. } => "activation",
            LayerKind::BatchNormalization(_) => "batch_normalization",
        }
    }

    pub fn is_convolutional(&self) -> bool {
        matches!(self.kind, LayerKind::Conv2d(_))
    }

    /// Channel count this layer produces, when it decides one.
    pub fn output_channels(&self) -> Option<usize> {
        match &self.kind {
            LayerKind::Conv2d(conv) => Some(conv.kernel_shape[3]),
            LayerKind::Dense(dense) => Some(dense.kernel_shape[1]),
            LayerKind::BatchNormalization(bn) => Some(bn.gamma.len()),
            _ => None,
        }
    }

    fn shape_error(&self, index: usize, reason: impl Into<String>) -> AmfError {
        AmfError::LayerShape {
            index,
            kind: self.kind_name(),
            reason: reason.into(),
        }
    }

    /// Check that weight vectors agree with their declared shapes.
    pub fn validate(&self, index: usize) -> Result<(), AmfError> {
        match &self.kind {
            LayerKind::Conv2d(conv) => {
                let expected: usize = conv.kernel_shape.iter().product();
                if expected == 0 || conv.kernel.len() != expected {
                    return Err(self.shape_error(
                        index,
                        format!(
                            "kernel has {} values, shape {:?} needs {expected}",
                            conv.kernel.len(),
                            conv.kernel_shape
                        ),
                    ));
                }
                if !conv.bias.is_empty() && conv.bias.len() != conv.kernel_shape[3] {
                    return Err(self.shape_error(index, "bias length differs from filter count"));
                }
                if conv.strides.contains(&0) {
                    return Err(self.shape_error(index, "strides must be positive"));
                }
            }
            LayerKind::Dense(dense) => {
                let expected = dense.kernel_shape[0] * dense.kernel_shape[1];
                if expected == 0 || dense.kernel.len() != expected {
                    return Err(self.shape_error(
                        index,
                        format!(
                            "kernel has {} values, shape {:?} needs {expected}",
                            dense.kernel.len(),
                            dense.kernel_shape
                        ),
                    ));
                }
                if !dense.bias.is_empty() && dense.bias.len() != dense.kernel_shape[1] {
                    return Err(self.shape_error(index, "bias length differs from unit count"));
                }
            }
            LayerKind::MaxPooling2d(pool) => {
                if pool.pool_size.contains(&0) || pool.strides().contains(&0) {
                    return Err(self.shape_error(index, "pool size and strides must be positive"));
                }
            }
            LayerKind::BatchNormalization(bn) => {
                let n = bn.gamma.len();
                if n == 0
                    || bn.beta.len() != n
                    || bn.moving_mean.len() != n
                    || bn.moving_variance.len() != n
                {
                    return Err(self.shape_error(index, "parameter vectors differ in length"));
                }
            }
            LayerKind::Dropout { rate } => {
                if !(0.0..1.0).contains(rate) {
                    return Err(self.shape_error(index, format!("dropout rate {rate} out of range")));
                }
            }
            LayerKind::GlobalAveragePooling2d | LayerKind::Flatten | LayerKind::Activation { .. } => {}
        }
        Ok(())
    }

    /// Infer the per-sample output shape (batch dimension excluded).
    pub fn output_shape(&self, index: usize, input: &[usize]) -> Result<Vec<usize>, AmfError> {
        let spatial = |what: &str| -> Result<(usize, usize, usize), AmfError> {
            match input {
                [h, w, c] => Ok((*h, *w, *c)),
                _ => Err(self.shape_error(
                    index,
                    format!("{what} needs a [height, width, channels] input, got {input:?}"),
                )),
            }
        };
        match &self.kind {
            LayerKind::Conv2d(conv) => {
                let (h, w, c) = spatial("convolution")?;
                let [kh, kw, cin, cout] = conv.kernel_shape;
                if c != cin {
                    return Err(self.shape_error(
                        index,
                        format!("expects {cin} input channels, got {c}"),
                    ));
                }
                let (oh, _) = spatial_output(h, kh, conv.strides[0], conv.padding)
                    .ok_or_else(|| self.shape_error(index, "input smaller than kernel"))?;
                let (ow, _) = spatial_output(w, kw, conv.strides[1], conv.padding)
                    .ok_or_else(|| self.shape_error(index, "input smaller than kernel"))?;
                Ok(vec![oh, ow, cout])
            }
            LayerKind::MaxPooling2d(pool) => {
                let (h, w, c) = spatial("pooling")?;
                let strides = pool.strides();
                let (oh, _) = spatial_output(h, pool.pool_size[0], strides[0], Padding::Valid)
                    .ok_or_else(|| self.shape_error(index, "input smaller than pool window"))?;
                let (ow, _) = spatial_output(w, pool.pool_size[1], strides[1], Padding::Valid)
                    .ok_or_else(|| self.shape_error(index, "input smaller than pool window"))?;
                Ok(vec![oh, ow, c])
            }
            LayerKind::GlobalAveragePooling2d => {
                let (_, _, c) = spatial("global pooling")?;
                Ok(vec![c])
            }
            LayerKind::Flatten => Ok(vec![input.iter().product()]),
            LayerKind::Dense(dense) => match input {
                [n] if *n == dense.kernel_shape[0] => Ok(vec![dense.kernel_shape[1]]),
                _ => Err(self.shape_error(
                    index,
                    format!("expects [{}] input, got {input:?}", dense.kernel_shape[0]),
                )),
            },
            LayerKind::BatchNormalization(bn) => match input.last() {
                Some(&c) if c == bn.gamma.len() => Ok(input.to_vec()),
                _ => Err(self.shape_error(
                    index,
                    format!("expects {} channels, got {input:?}", bn.gamma.len()),
                )),
            },
            LayerKind::Dropout { .. } | LayerKind::Activation { .. } => Ok(input.to_vec()),
        }
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match &self.kind {
            LayerKind::Conv2d(conv) => conv2d_forward(conv, input),
            LayerKind::MaxPooling2d(pool) => max_pool_forward(pool, input),
            LayerKind::GlobalAveragePooling2d => {
                let x = input.view().into_dimensionality::<Ix4>()?;
                let (n, h, w, c) = x.dim();
                let area = (h * w) as f32;
                let pooled = Array2::from_shape_fn((n, c), |(b, ch)| {
                    x.slice(ndarray::s![b, .., .., ch]).sum() / area
                });
                Ok(pooled.into_dyn())
            }
            LayerKind::Flatten => {
                let n = input.shape()[0];
                let rest: usize = input.shape()[1..].iter().product();
                Ok(input
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(IxDyn(&[n, rest]))?)
            }
            LayerKind::Dense(dense) => {
                let x = input.view().into_dimensionality::<Ix2>()?;
                let kernel = ArrayView2::from_shape(
                    (dense.kernel_shape[0], dense.kernel_shape[1]),
                    &dense.kernel,
                )?;
                ensure!(
                    x.ncols() == kernel.nrows(),
                    "dense layer expects {} features, got {}",
                    kernel.nrows(),
                    x.ncols()
                );
                let mut z = x.dot(&kernel);
                if !dense.bias.is_empty() {
                    z += &ndarray::ArrayView1::from(dense.bias.as_slice());
                }
                let mut y = z.into_dyn();
                dense.activation.apply(&mut y);
                Ok(y)
            }
            LayerKind::Dropout { .. } => Ok(input.clone()),
            LayerKind::Activation { activation } => {
                let mut y = input.clone();
                activation.apply(&mut y);
                Ok(y)
            }
            LayerKind::BatchNormalization(bn) => {
                ensure!(
                    input.shape().last() == Some(&bn.gamma.len()),
                    "batch normalization expects {} channels, got shape {:?}",
                    bn.gamma.len(),
                    input.shape()
                );
                let (scale, shift) = bn.affine();
                let mut y = input.clone();
                y *= &scale;
                y += &shift;
                Ok(y)
            }
        }
    }

    /// Gradient with respect to `input`, given the forward `output` and the
    /// gradient flowing back into `output`.
    pub fn backward(
        &self,
        input: &ArrayD<f32>,
        output: &ArrayD<f32>,
        grad_output: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        ensure!(
            output.shape() == grad_output.shape(),
            "{} gradient shape {:?} differs from output shape {:?}",
            self.kind_name(),
            grad_output.shape(),
            output.shape()
        );
        match &self.kind {
            LayerKind::Conv2d(_) => {
                bail!("backward pass through a Conv2D layer is not supported")
            }
            LayerKind::MaxPooling2d(pool) => max_pool_backward(pool, input, grad_output),
            LayerKind::GlobalAveragePooling2d => {
                let g = grad_output.view().into_dimensionality::<Ix2>()?;
                let shape = input.shape();
                let (n, h, w, c) = (shape[0], shape[1], shape[2], shape[3]);
                let area = (h * w) as f32;
                let grad = Array4::from_shape_fn((n, h, w, c), |(b, _, _, ch)| g[[b, ch]] / area);
                Ok(grad.into_dyn())
            }
            LayerKind::Flatten => Ok(grad_output
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(input.raw_dim())?),
            LayerKind::Dense(dense) => {
                let grad_z = dense.activation.backward(output, grad_output);
                let grad_z = grad_z.into_dimensionality::<Ix2>()?;
                let kernel = ArrayView2::from_shape(
                    (dense.kernel_shape[0], dense.kernel_shape[1]),
                    &dense.kernel,
                )?;
                Ok(grad_z.dot(&kernel.t()).into_dyn())
            }
            LayerKind::Dropout { .. } => Ok(grad_output.clone()),
            LayerKind::Activation { activation } => Ok(activation.backward(output, grad_output)),
            LayerKind::BatchNormalization(bn) => {
                let (scale, _) = bn.affine();
                let mut grad = grad_output.clone();
                grad *= &scale;
                Ok(grad)
            }
        }
    }
}

fn conv2d_forward(conv: &Conv2d, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let x = input.view().into_dimensionality::<Ix4>()?;
    let (n, h, w, c) = x.dim();
    let [kh, kw, cin, cout] = conv.kernel_shape;
    ensure!(c == cin, "conv2d expects {cin} input channels, got {c}");

    let (oh, pad_top) = spatial_output(h, kh, conv.strides[0], conv.padding)
        .ok_or_else(|| anyhow::anyhow!("conv2d input height {h} smaller than kernel {kh}"))?;
    let (ow, pad_left) = spatial_output(w, kw, conv.strides[1], conv.padding)
        .ok_or_else(|| anyhow::anyhow!("conv2d input width {w} smaller than kernel {kw}"))?;

    // im2col: one row per output position, columns ordered like the HWIO kernel
    let patch_len = kh * kw * cin;
    let mut patches = Array2::<f32>::zeros((n * oh * ow, patch_len));
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut patch = patches.row_mut((b * oh + oy) * ow + ox);
                for ky in 0..kh {
                    let iy = (oy * conv.strides[0] + ky) as isize - pad_top as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..kw {
                        let ix = (ox * conv.strides[1] + kx) as isize - pad_left as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let base = (ky * kw + kx) * cin;
                        for ch in 0..cin {
                            patch[base + ch] = x[[b, iy as usize, ix as usize, ch]];
                        }
                    }
                }
            }
        }
    }

    let kernel = ArrayView2::from_shape((patch_len, cout), &conv.kernel)?;
    let mut z = patches.dot(&kernel);
    if !conv.bias.is_empty() {
        z += &ndarray::ArrayView1::from(conv.bias.as_slice());
    }
    let mut y = z.into_shape_with_order(IxDyn(&[n, oh, ow, cout]))?;
    conv.activation.apply(&mut y);
    Ok(y)
}

/// Position of the maximum inside one pooling window (first one on ties).
fn window_argmax(
    x: &ndarray::ArrayView4<f32>,
    b: usize,
    y0: usize,
    x0: usize,
    ch: usize,
    pool: [usize; 2],
) -> (usize, usize) {
    let mut best = (y0, x0);
    let mut best_value = f32::NEG_INFINITY;
    for dy in 0..pool[0] {
        for dx in 0..pool[1] {
            let v = x[[b, y0 + dy, x0 + dx, ch]];
            if v > best_value {
                best_value = v;
                best = (y0 + dy, x0 + dx);
            }
        }
    }
    best
}

fn max_pool_forward(pool: &Pool2d, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let x = input.view().into_dimensionality::<Ix4>()?;
    let (n, h, w, c) = x.dim();
    let strides = pool.strides();
    let (oh, _) = spatial_output(h, pool.pool_size[0], strides[0], Padding::Valid)
        .ok_or_else(|| anyhow::anyhow!("pooling input {h}x{w} smaller than window"))?;
    let (ow, _) = spatial_output(w, pool.pool_size[1], strides[1], Padding::Valid)
        .ok_or_else(|| anyhow::anyhow!("pooling input {h}x{w} smaller than window"))?;

    let y = Array4::from_shape_fn((n, oh, ow, c), |(b, oy, ox, ch)| {
        let (my, mx) = window_argmax(&x, b, oy * strides[0], ox * strides[1], ch, pool.pool_size);
        x[[b, my, mx, ch]]
    });
    Ok(y.into_dyn())
}

fn max_pool_backward(
    pool: &Pool2d,
    input: &ArrayD<f32>,
    grad_output: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let x = input.view().into_dimensionality::<Ix4>()?;
    let g = grad_output.view().into_dimensionality::<Ix4>()?;
    let strides = pool.strides();
    let mut grad = Array4::<f32>::zeros(x.raw_dim());
    let (n, oh, ow, c) = g.dim();
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for ch in 0..c {
                    let (my, mx) =
                        window_argmax(&x, b, oy * strides[0], ox * strides[1], ch, pool.pool_size);
                    grad[[b, my, mx, ch]] += g[[b, oy, ox, ch]];
                }
            }
        }
    }
    Ok(grad.into_dyn())
}
