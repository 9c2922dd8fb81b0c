//! Sequential CNN classifier loaded from a JSON model file.
//!
//! The model is a plain list of layers, so the activation mapper can inspect it
//! and split it at its last convolution. Prediction runs the whole stack over
//! a tile batch in chunks of `batch_size`.

use anyhow::{ensure, Context, Result};
use log::debug;
use ndarray::{concatenate, Array2, Array4, ArrayD, Axis, Ix2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::color_utils::symbols;
use crate::error::AmfError;
use crate::layers::{Layer, LayerDescriptor};

/// Anything that can classify a batch of tiles.
pub trait Classifier {
    /// Human-readable model name used in logs and settings.
    fn name(&self) -> &str;

    /// Ordered layers, input first.
    fn layers(&self) -> &[Layer];

    /// Number of class probabilities produced per tile.
    fn class_count(&self) -> usize;

    /// Classify `[n, edge, edge, 3]` tiles, `batch_size` tiles at a time.
    fn predict(&self, batch: &Array4<f32>, batch_size: usize) -> Result<Array2<f32>>;
}

fn default_model_name() -> String {
    "unnamed".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialModel {
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Per-sample input shape `[height, width, channels]`, when fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_shape: Option<[usize; 3]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_names: Vec<String>,
    pub layers: Vec<Layer>,
}

impl SequentialModel {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            input_shape: None,
            class_names: Vec::new(),
            layers,
        }
    }

    /// Load and validate a model file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file: {}", path.display()))?;
        let model = Self::from_json(&content)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        debug!(
            "{} Loaded model '{}' with {} layers from {}",
            symbols::model_loaded(),
            model.name,
            model.layers.len(),
            path.display()
        );
        if let Some(descriptors) = model.describe() {
            for d in descriptors {
                debug!(
                    "   layer {:>2}: {:<26} -> {:?}",
                    d.index, d.kind, d.output_shape
                );
            }
        }

        Ok(model)
    }

    pub fn from_json(content: &str) -> Result<Self, AmfError> {
        let model: SequentialModel =
            serde_json::from_str(content).map_err(|e| AmfError::ModelFormat(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    /// Check weights, and the full shape chain when the input shape is known.
    pub fn validate(&self) -> Result<(), AmfError> {
        if self.layers.is_empty() {
            return Err(AmfError::ModelFormat("model has no layers".to_string()));
        }
        for (index, layer) in self.layers.iter().enumerate() {
            layer.validate(index)?;
        }
        if let Some(shape) = self.input_shape {
            let mut current = shape.to_vec();
            for (index, layer) in self.layers.iter().enumerate() {
                current = layer.output_shape(index, &current)?;
            }
            if current.len() != 1 {
                return Err(AmfError::ModelFormat(format!(
                    "model output must be a class vector, got shape {current:?}"
                )));
            }
        }
        if self.output_units().is_none() {
            return Err(AmfError::ModelFormat(
                "cannot determine the number of output classes".to_string(),
            ));
        }
        if !self.class_names.is_empty() && Some(self.class_names.len()) != self.output_units() {
            return Err(AmfError::HeaderMismatch {
                model: self.output_units().unwrap_or_default(),
                header: self.class_names.len(),
            });
        }
        Ok(())
    }

    fn output_units(&self) -> Option<usize> {
        self.layers.iter().rev().find_map(Layer::output_channels)
    }

    /// Per-layer summary; needs a declared input shape.
    pub fn describe(&self) -> Option<Vec<LayerDescriptor>> {
        let mut current = self.input_shape?.to_vec();
        let mut descriptors = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate() {
            current = layer.output_shape(index, &current).ok()?;
            descriptors.push(LayerDescriptor {
                index,
                kind: layer.kind_name(),
                convolutional: layer.is_convolutional(),
                output_shape: current.clone(),
            });
        }
        Some(descriptors)
    }

    /// Reject tile sizes the model cannot take as input.
    pub fn check_tile_edge(&self, tile_edge: u32) -> Result<(), AmfError> {
        match self.input_shape {
            Some([height, width, _])
                if height != tile_edge as usize || width != tile_edge as usize =>
            {
                Err(AmfError::TileSizeMismatch {
                    tile_edge,
                    height,
                    width,
                })
            }
            _ => Ok(()),
        }
    }

    /// Run every layer on one batch.
    pub fn forward(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        run_layers(&self.layers, 0, input)
    }
}

/// Forward through a slice of layers; `offset` is the index of the first one
/// in the full model, for error messages.
pub(crate) fn run_layers(layers: &[Layer], offset: usize, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
    layers
        .iter()
        .enumerate()
        .try_fold(input, |x, (i, layer)| {
            layer
                .forward(&x)
                .with_context(|| format!("layer {} ({})", offset + i, layer.kind_name()))
        })
}

impl Classifier for SequentialModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn class_count(&self) -> usize {
        self.output_units().unwrap_or_default()
    }

    fn predict(&self, batch: &Array4<f32>, batch_size: usize) -> Result<Array2<f32>> {
        ensure!(batch_size > 0, "batch size must be positive");
        if batch.len_of(Axis(0)) == 0 {
            return Ok(Array2::zeros((0, self.class_count())));
        }

        let mut outputs = Vec::new();
        for chunk in batch.axis_chunks_iter(Axis(0), batch_size) {
            let out = self.forward(chunk.to_owned().into_dyn())?;
            let out = out
                .into_dimensionality::<Ix2>()
                .context("model output is not a [batch, classes] matrix")?;
            outputs.push(out);
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::tests::{conv, dense};
    use crate::layers::{Activation, LayerKind, Padding, Pool2d};

    /// Small conv → pool → GAP → dense softmax classifier for `classes` outputs.
    pub(crate) fn tiny_cnn(classes: usize) -> SequentialModel {
        let filters = 4;
        let kernel: Vec<f32> = (0..3 * 3 * 3 * filters)
            .map(|i| ((i as f32) * 0.61).sin() * 0.5)
            .collect();
        let mut first = conv([3, 3, 3, filters], kernel, Padding::Same);
        if let LayerKind::Conv2d(c) = &mut first.kind {
            c.activation = Activation::Relu;
            c.bias = vec![0.05; filters];
        }
        let dense_kernel: Vec<f32> = (0..filters * classes)
            .map(|i| ((i as f32) * 1.3).cos())
            .collect();
        SequentialModel::new(
            "tiny",
            vec![
                first,
                Layer::new(LayerKind::MaxPooling2d(Pool2d {
                    pool_size: [2, 2],
                    strides: None,
                })),
                Layer::new(LayerKind::GlobalAveragePooling2d),
                Layer::new(LayerKind::Dropout { rate: 0.2 }),
                dense([filters, classes], dense_kernel, Activation::Softmax),
            ],
        )
    }

    fn tile_batch(n: usize, edge: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, edge, edge, 3), |(b, y, x, c)| {
            (((b * 7 + y * 3 + x * 5 + c) % 17) as f32) / 17.0
        })
    }

    #[test]
    fn test_predict_outputs_probabilities() {
        let model = tiny_cnn(3);
        let probs = model.predict(&tile_batch(5, 8), 2).unwrap();
        assert_eq!(probs.dim(), (5, 3));
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_predict_independent_of_batch_size() {
        let model = tiny_cnn(2);
        let batch = tile_batch(7, 8);
        let all_at_once = model.predict(&batch, 7).unwrap();
        for batch_size in [1, 3, 4, 100] {
            let chunked = model.predict(&batch, batch_size).unwrap();
            for (a, b) in all_at_once.iter().zip(chunked.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_predict_rejects_zero_batch_size() {
        let model = tiny_cnn(2);
        assert!(model.predict(&tile_batch(1, 8), 0).is_err());
    }

    #[test]
    fn test_class_count_from_last_dense() {
        assert_eq!(tiny_cnn(3).class_count(), 3);
    }

    #[test]
    fn test_json_round_trip_keeps_predictions() {
        let model = tiny_cnn(2);
        let json = serde_json::to_string(&model).unwrap();
        let loaded = SequentialModel::from_json(&json).unwrap();
        let batch = tile_batch(2, 6);
        assert_eq!(
            model.predict(&batch, 2).unwrap(),
            loaded.predict(&batch, 2).unwrap()
        );
    }

    #[test]
    fn test_shape_chain_checked_against_input_shape() {
        let mut model = tiny_cnn(2);
        model.input_shape = Some([8, 8, 3]);
        assert!(model.validate().is_ok());
        let descriptors = model.describe().unwrap();
        assert_eq!(descriptors[0].output_shape, vec![8, 8, 4]);
        assert!(descriptors[0].convolutional);
        assert_eq!(descriptors[1].output_shape, vec![4, 4, 4]);
        assert_eq!(descriptors.last().unwrap().output_shape, vec![2]);

        model.input_shape = Some([8, 8, 1]);
        assert!(matches!(
            model.validate(),
            Err(AmfError::LayerShape { index: 0, .. })
        ));
    }

    #[test]
    fn test_class_names_must_match_outputs() {
        let mut model = tiny_cnn(2);
        model.class_names = vec!["Y".into(), "N".into(), "X".into()];
        assert!(matches!(
            model.validate(),
            Err(AmfError::HeaderMismatch {
                model: 2,
                header: 3
            })
        ));
    }

    #[test]
    fn test_tile_edge_checked_against_input_shape() {
        let mut model = tiny_cnn(2);
        assert!(model.check_tile_edge(126).is_ok());
        model.input_shape = Some([126, 126, 3]);
        assert!(model.check_tile_edge(126).is_ok());
        assert!(matches!(
            model.check_tile_edge(64),
            Err(AmfError::TileSizeMismatch { tile_edge: 64, .. })
        ));
    }

    #[test]
    fn test_malformed_json_is_model_format_error() {
        let err = SequentialModel::from_json("{\"layers\": 3}").unwrap_err();
        assert!(matches!(err, AmfError::ModelFormat(_)));
        let err = SequentialModel::from_json("{\"layers\": []}").unwrap_err();
        assert!(matches!(err, AmfError::ModelFormat(_)));
    }
}
