//! Class activation maps (Grad-CAM with guided gradients).
//!
//! The model is split at its last convolution. The feature extractor turns a
//! tile into a feature map `A`; the classifier tail turns `A` into class
//! scores. Back-propagating a one-hot seed through the tail gives `dScore/dA`,
//! which weights the channels of `A` into a coarse spatial map per class.

use anyhow::{ensure, Context, Result};
use image::{imageops, RgbImage};
use log::debug;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix2, Ix4, Zip};

use crate::error::AmfError;
use crate::heatmap::{blend_over, muted_background, render_heatmap, HeatmapStyle};
use crate::layers::Layer;
use crate::model::{run_layers, Classifier};
use crate::prediction_table::argmax;

/// Index of the last convolutional layer, scanning from the output backwards.
pub fn last_conv_index(layers: &[Layer]) -> Option<usize> {
    layers.iter().rposition(Layer::is_convolutional)
}

/// Like [`last_conv_index`], but a model without convolutions is an error.
pub fn locate_last_conv<C: Classifier + ?Sized>(model: &C) -> Result<usize, AmfError> {
    last_conv_index(model.layers()).ok_or_else(|| AmfError::InvalidModel {
        model: model.name().to_string(),
    })
}

/// Layers `0..=last_conv`: tile to feature map.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor<'a> {
    layers: &'a [Layer],
}

/// Layers after the last convolution: feature map to class scores.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierTail<'a> {
    layers: &'a [Layer],
    offset: usize,
}

/// Split a model into feature extractor and classifier tail.
pub fn split_at_last_conv<C: Classifier + ?Sized>(
    model: &C,
) -> Result<(FeatureExtractor<'_>, ClassifierTail<'_>), AmfError> {
    let last = locate_last_conv(model)?;
    let (head, tail) = model.layers().split_at(last + 1);
    Ok((
        FeatureExtractor { layers: head },
        ClassifierTail {
            layers: tail,
            offset: last + 1,
        },
    ))
}

impl FeatureExtractor<'_> {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        run_layers(self.layers, 0, input)
    }
}

impl ClassifierTail<'_> {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        run_layers(self.layers, self.offset, input)
    }

    /// Forward pass keeping every intermediate value; the first entry is the
    /// input and the last the output.
    fn trace(&self, input: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let mut values = Vec::with_capacity(self.layers.len() + 1);
        values.push(input);
        for (i, layer) in self.layers.iter().enumerate() {
            let next = layer
                .forward(&values[i])
                .with_context(|| format!("layer {} ({})", self.offset + i, layer.kind_name()))?;
            values.push(next);
        }
        Ok(values)
    }

    /// Push `seed` (shaped like the output) back to the tail input.
    fn backward(&self, values: &[ArrayD<f32>], seed: ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.layers
            .iter()
            .enumerate()
            .rev()
            .try_fold(seed, |grad, (i, layer)| {
                layer
                    .backward(&values[i], &values[i + 1], &grad)
                    .with_context(|| {
                        format!("gradient of layer {} ({})", self.offset + i, layer.kind_name())
                    })
            })
    }
}

/// Coarse activation map of one class for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationMap {
    /// `h × w` map at the resolution of the last convolution.
    pub cam: Array2<f32>,
    /// Whether the class has the highest score for this tile.
    pub best_match: bool,
}

/// One tile pushed through both halves, ready for per-class gradients.
pub struct TileAnalysis<'a> {
    tail: ClassifierTail<'a>,
    features: Array3<f32>,
    values: Vec<ArrayD<f32>>,
    scores: Array1<f32>,
}

impl<'a> TileAnalysis<'a> {
    /// Run a `[edge, edge, 3]` tile through the extractor and the tail.
    pub fn new(
        tile: ArrayView3<f32>,
        extractor: &FeatureExtractor<'_>,
        tail: &ClassifierTail<'a>,
    ) -> Result<Self> {
        let input = tile.insert_axis(Axis(0)).to_owned().into_dyn();
        let features = extractor.forward(input)?;
        let feature_map = features
            .view()
            .into_dimensionality::<Ix4>()
            .context("last convolution does not produce a [1, h, w, k] feature map")?
            .index_axis(Axis(0), 0)
            .to_owned();

        let values = tail.trace(features)?;
        let output = values
            .last()
            .map(|v| v.view().into_dimensionality::<Ix2>())
            .transpose()
            .context("classifier tail does not produce a [1, classes] score matrix")?;
        let scores = match output {
            Some(out) if out.nrows() == 1 => out.row(0).to_owned(),
            _ => anyhow::bail!("classifier tail does not produce one score vector per tile"),
        };

        Ok(Self {
            tail: *tail,
            features: feature_map,
            values,
            scores,
        })
    }

    pub fn scores(&self) -> &Array1<f32> {
        &self.scores
    }

    pub fn best_class(&self) -> usize {
        argmax(self.scores.iter().copied())
    }

    /// Grad-CAM for `class`.
    pub fn activation_map(&self, class: usize) -> Result<ActivationMap> {
        ensure!(
            class < self.scores.len(),
            "class {class} out of range for {} model outputs",
            self.scores.len()
        );
        let mut seed = Array2::<f32>::zeros((1, self.scores.len()));
        seed[[0, class]] = 1.0;

        let grads = self.tail.backward(&self.values, seed.into_dyn())?;
        let grads = grads
            .into_dimensionality::<Ix4>()
            .context("gradient does not match the feature map")?;
        let grads = grads.index_axis(Axis(0), 0);
        ensure!(
            grads.dim() == self.features.dim(),
            "gradient shape {:?} differs from feature map shape {:?}",
            grads.dim(),
            self.features.dim()
        );

        Ok(ActivationMap {
            cam: weighted_activation(&self.features, grads),
            best_match: class == self.best_class(),
        })
    }
}

/// Spatial mean of the guided gradients per channel, used to weight the
/// channels of the feature map.
fn weighted_activation(features: &Array3<f32>, grads: ArrayView3<f32>) -> Array2<f32> {
    let (h, w, _) = features.dim();
    let guided = Zip::from(features)
        .and(&grads)
        .map_collect(|&a, &g| if a > 0.0 && g > 0.0 { g } else { 0.0 });
    let area = (h * w).max(1) as f32;
    let weights = guided.sum_axis(Axis(0)).sum_axis(Axis(0)) / area;
    Array2::from_shape_fn((h, w), |(y, x)| features.slice(s![y, x, ..]).dot(&weights))
}

/// Single-tile convenience wrapper around [`TileAnalysis`].
pub fn compute_activation_map(
    class: usize,
    tile: ArrayView3<f32>,
    extractor: &FeatureExtractor<'_>,
    tail: &ClassifierTail<'_>,
) -> Result<ActivationMap> {
    TileAnalysis::new(tile, extractor, tail)?.activation_map(class)
}

/// Per-image activation mosaics, one per class.
///
/// Every operation is a no-op when disabled.
#[derive(Debug, Clone)]
pub struct ActivationMapper {
    enabled: bool,
    tile_edge: u32,
    class_count: usize,
    style: HeatmapStyle,
    mosaics: Vec<RgbImage>,
}

impl ActivationMapper {
    pub fn new(enabled: bool, tile_edge: u32, class_count: usize, style: HeatmapStyle) -> Self {
        Self {
            enabled,
            tile_edge,
            class_count,
            style,
            mosaics: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, 0, HeatmapStyle::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace any previous state with blank mosaics for an `nrows × ncols` grid.
    pub fn initialize(&mut self, nrows: u32, ncols: u32) {
        if !self.enabled {
            return;
        }
        let width = ncols * self.tile_edge;
        let height = nrows * self.tile_edge;
        self.mosaics = (0..self.class_count)
            .map(|_| RgbImage::new(width, height))
            .collect();
    }

    /// Paint the activation maps of every tile of row `r` into the mosaics.
    pub fn generate<C: Classifier + ?Sized>(
        &mut self,
        model: &C,
        row: &Array4<f32>,
        r: u32,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let (extractor, tail) = split_at_last_conv(model)?;
        let edge = self.tile_edge;

        for (c, tile) in row.axis_iter(Axis(0)).enumerate() {
            let analysis = TileAnalysis::new(tile, &extractor, &tail)
                .with_context(|| format!("activation maps for tile ({r}, {c})"))?;
            ensure!(
                analysis.scores().len() == self.mosaics.len(),
                "model returns {} scores but {} mosaics are allocated",
                analysis.scores().len(),
                self.mosaics.len()
            );
            let background = muted_background(tile);

            for (class, mosaic) in self.mosaics.iter_mut().enumerate() {
                let map = analysis.activation_map(class)?;
                let heat = render_heatmap(&map.cam, map.best_match, edge, &self.style);
                let composite = blend_over(&heat, &background);
                imageops::replace(
                    mosaic,
                    &composite,
                    (c as u32 * edge) as i64,
                    (r * edge) as i64,
                );
            }
        }
        debug!("Activation maps written for row {r}");
        Ok(())
    }

    pub fn retrieve(&self) -> Option<&[RgbImage]> {
        self.enabled.then_some(self.mosaics.as_slice())
    }
}
