//! Tiled prediction over mosaic images.
//!
//! Images run strictly in input order and rows in increasing index order.
//! The activation mapper is the only mutable state; it is owned by the batch
//! loop and lent to each row.

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info, warn};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::activation_map::{locate_last_conv, ActivationMapper};
use crate::archive::{ArchiveWriter, ResultSink};
use crate::color_utils::{progress::create_row_progress_bar, symbols};
use crate::config::{InferenceSettings, PredictionConfig};
use crate::error::{is_fatal_error, AmfError};
use crate::heatmap::HeatmapStyle;
use crate::image_input::{collect_images_from_sources, load_mosaic, ImageInputConfig};
use crate::model::{Classifier, SequentialModel};
use crate::output_manager::plan_archive_paths;
use crate::prediction_table::PredictionTable;
use crate::progress::remove_progress_bar;
use crate::tiling::{row_batch, TileGrid};

/// What happened to one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Processed,
    /// Smaller than one tile in either direction.
    Skipped,
}

/// Counts for a whole batch of images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

/// Predict one row of tiles and paint its activation maps.
pub fn process_row<C: Classifier + ?Sized>(
    model: &C,
    image: &RgbImage,
    r: u32,
    grid: &TileGrid,
    settings: &InferenceSettings,
    mapper: &mut ActivationMapper,
) -> Result<Array2<f32>> {
    let batch = row_batch(image, r, grid);
    let predictions = model
        .predict(&batch, settings.batch_size)
        .with_context(|| format!("Prediction failed on row {r}"))?;
    mapper.generate(model, &batch, r)?;
    Ok(predictions)
}

/// Run every row of `image` and assemble the prediction table.
pub fn row_wise_processing<C: Classifier + ?Sized>(
    model: &C,
    image: &RgbImage,
    grid: &TileGrid,
    settings: &InferenceSettings,
    mapper: &mut ActivationMapper,
    name: &str,
) -> Result<PredictionTable> {
    mapper.initialize(grid.nrows, grid.ncols);

    let progress = create_row_progress_bar(name, grid.nrows);
    let mut fragments = Vec::with_capacity(grid.nrows as usize);
    for r in 0..grid.nrows {
        fragments.push(process_row(model, image, r, grid, settings, mapper)?);
        if let Some(pb) = &progress {
            pb.inc(1);
        }
        debug!("Row {}/{} done for {name}", r + 1, grid.nrows);
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
        remove_progress_bar(&pb);
    }

    Ok(PredictionTable::from_rows(
        &fragments,
        grid.ncols as usize,
        &settings.header,
    )?)
}

/// Tile, predict and persist one decoded mosaic.
pub fn predict_mosaic<C: Classifier + ?Sized>(
    model: &C,
    image: &RgbImage,
    source: &Path,
    settings: &InferenceSettings,
    mapper: &mut ActivationMapper,
    sink: &mut dyn ResultSink,
) -> Result<ImageOutcome> {
    let (width, height) = image.dimensions();
    let Some(grid) = TileGrid::new(width, height, settings.tile_edge) else {
        warn!(
            "{}Skipping {}: {width}x{height} image is smaller than one {}-pixel tile",
            symbols::warning(),
            source.display(),
            settings.tile_edge
        );
        return Ok(ImageOutcome::Skipped);
    };

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (tiled_width, tiled_height) = grid.pixel_size();
    info!(
        "{} {}: {} x {} tiles of {} px ({} tiles covering {tiled_width}x{tiled_height})",
        symbols::prediction_start(),
        name,
        grid.nrows,
        grid.ncols,
        grid.tile_edge,
        grid.tile_count()
    );

    let table = row_wise_processing(model, image, &grid, settings, mapper, &name)?;
    debug!("{name}: {}", best_class_counts(&table));
    sink.save(&table, mapper.retrieve(), source)
        .with_context(|| format!("Failed to save results for {}", source.display()))?;
    Ok(ImageOutcome::Processed)
}

/// Per-label tally of the most likely class over all tiles, e.g. `Y=3 N=1`.
fn best_class_counts(table: &PredictionTable) -> String {
    let labels = table.class_labels();
    let mut counts = vec![0usize; labels.len()];
    for class in table.best_classes() {
        counts[class] += 1;
    }
    labels
        .iter()
        .zip(&counts)
        .map(|(label, count)| format!("{label}={count}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Process `paths` in order with one shared model and sink.
///
/// In strict mode the first failure stops the batch. Otherwise failures are
/// logged and counted; errors that no later image could avoid still stop it.
pub fn predict_mosaics<C: Classifier + ?Sized>(
    model: &C,
    paths: &[PathBuf],
    settings: &InferenceSettings,
    strict: bool,
    sink: &mut dyn ResultSink,
) -> Result<RunSummary> {
    if settings.generate_cams {
        let last = locate_last_conv(model)?;
        debug!("Activation maps taken after layer {last}");
    }
    if settings.header.len() != model.class_count() {
        return Err(AmfError::HeaderMismatch {
            model: model.class_count(),
            header: settings.header.len(),
        }
        .into());
    }

    let mut mapper = ActivationMapper::new(
        settings.generate_cams,
        settings.tile_edge,
        model.class_count(),
        HeatmapStyle::with_best_match(settings.best_match_colormap),
    );
    let mut summary = RunSummary::default();

    for (index, path) in paths.iter().enumerate() {
        let start = Instant::now();
        let outcome = match load_mosaic(path) {
            Ok(image) => predict_mosaic(model, &image, path, settings, &mut mapper, &mut *sink),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ImageOutcome::Processed) => {
                summary.processed += 1;
                info!(
                    "{} Processed {} ({}/{}) in {:.1}s",
                    symbols::completed_successfully(),
                    path.display(),
                    index + 1,
                    paths.len(),
                    start.elapsed().as_secs_f64()
                );
            }
            Ok(ImageOutcome::Skipped) => summary.skipped += 1,
            Err(e) => {
                summary.failed += 1;
                if strict || is_fatal_error(&e) {
                    return Err(e.context(format!("Failed to process {}", path.display())));
                }
                warn!(
                    "{}Failed to process {} ({}/{}): {e:#}",
                    symbols::warning(),
                    path.display(),
                    index + 1,
                    paths.len()
                );
            }
        }
    }

    if summary.failed > 0 {
        warn!(
            "{} {} processed, {} skipped, {} failed of {} images",
            symbols::completed_partially_successfully(),
            summary.processed,
            summary.skipped,
            summary.failed,
            summary.total()
        );
    } else if summary.skipped > 0 {
        info!(
            "{} {} processed, {} skipped of {} images",
            symbols::completed_partially_successfully(),
            summary.processed,
            summary.skipped,
            summary.total()
        );
    }
    Ok(summary)
}

/// Entry point of the `predict` subcommand.
pub fn run_prediction(config: PredictionConfig) -> Result<RunSummary> {
    let started = Instant::now();
    let image_config = ImageInputConfig::from_strict_flag(config.base.strict);
    let images = collect_images_from_sources(&config.base.sources, &image_config)?;
    if images.is_empty() {
        warn!("No valid images found to process");
        return Ok(RunSummary::default());
    }
    info!("{} image(s) to process", images.len());

    let model = SequentialModel::load(&config.model_path)?;
    model.check_tile_edge(config.tile_edge)?;
    let settings = config.inference_settings(&model.class_names, model.class_count())?;

    let output_dir = config.base.output_dir.as_ref().map(PathBuf::from);
    plan_archive_paths(&images, output_dir.as_deref(), config.base.force)?;

    let mut sink = ArchiveWriter::new(output_dir, settings.clone(), model.name.clone());
    let summary = predict_mosaics(&model, &images, &settings, config.base.strict, &mut sink)?;

    if summary.processed > 0 {
        info!(
            "{} Processed {} image(s) in {:.1}s",
            symbols::completed_successfully(),
            summary.processed,
            started.elapsed().as_secs_f64()
        );
    }
    Ok(summary)
}
