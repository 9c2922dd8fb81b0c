//! Persistence of per-image results as one ZIP archive.
//!
//! Entries: `<stem>.tsv` (prediction table), `settings.toml` (run settings)
//! and, with activation maps, one `<stem>_CAM_<label>.jpg` per class.

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use log::info;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::color_utils::symbols;
use crate::config::InferenceSettings;
use crate::output_manager::OutputManager;
use crate::prediction_table::PredictionTable;

pub const SETTINGS_ENTRY: &str = "settings.toml";

/// Receives the finished results of one image.
pub trait ResultSink {
    fn save(
        &mut self,
        table: &PredictionTable,
        mosaics: Option<&[RgbImage]>,
        source: &Path,
    ) -> Result<()>;
}

/// Settings recorded alongside every prediction table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRecord {
    pub source: String,
    pub model: String,
    pub amfinder_version: String,
    pub timestamp: DateTime<Utc>,
    pub inference: InferenceSettings,
    pub grid: GridRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRecord {
    pub nrows: usize,
    pub ncols: usize,
    /// Pixel size of the tiled area.
    pub width: u32,
    pub height: u32,
}

/// Writes `<stem>.zip` next to each image or into one output directory.
pub struct ArchiveWriter {
    output_dir: Option<PathBuf>,
    settings: InferenceSettings,
    model_name: String,
}

impl ArchiveWriter {
    pub fn new(
        output_dir: Option<PathBuf>,
        settings: InferenceSettings,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            output_dir,
            settings,
            model_name: model_name.into(),
        }
    }

    fn settings_record(&self, table: &PredictionTable, source: &Path) -> SettingsRecord {
        let edge = self.settings.tile_edge;
        SettingsRecord {
            source: source.to_string_lossy().to_string(),
            model: self.model_name.clone(),
            amfinder_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            inference: self.settings.clone(),
            grid: GridRecord {
                nrows: table.nrows(),
                ncols: table.ncols(),
                width: table.ncols() as u32 * edge,
                height: table.nrows() as u32 * edge,
            },
        }
    }

    /// Build the whole archive in memory so a failure leaves no partial file.
    fn build_archive(
        &self,
        manager: &OutputManager<'_>,
        table: &PredictionTable,
        mosaics: Option<&[RgbImage]>,
        source: &Path,
    ) -> Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        zip.start_file(manager.table_entry(), options)?;
        table.write_tsv(&mut zip)?;

        let record = self.settings_record(table, source);
        zip.start_file(SETTINGS_ENTRY, options)?;
        zip.write_all(toml::to_string_pretty(&record)?.as_bytes())?;

        if let Some(mosaics) = mosaics {
            let labels = table.class_labels();
            ensure!(
                mosaics.len() == labels.len(),
                "{} activation mosaics for {} class labels",
                mosaics.len(),
                labels.len()
            );
            for (label, mosaic) in labels.iter().zip(mosaics) {
                let mut jpeg = Cursor::new(Vec::new());
                mosaic
                    .write_to(&mut jpeg, ImageFormat::Jpeg)
                    .with_context(|| format!("Failed to encode activation map for {label}"))?;
                zip.start_file(manager.cam_entry(label), options)?;
                zip.write_all(jpeg.get_ref())?;
            }
        }

        Ok(zip.finish()?.into_inner())
    }
}

impl ResultSink for ArchiveWriter {
    fn save(
        &mut self,
        table: &PredictionTable,
        mosaics: Option<&[RgbImage]>,
        source: &Path,
    ) -> Result<()> {
        let manager = OutputManager::new(self.output_dir.as_deref(), source);
        let bytes = self.build_archive(&manager, table, mosaics, source)?;

        manager.ensure_output_dir()?;
        let path = manager.archive_path();
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write archive: {}", path.display()))?;
        info!("{} Saved {}", symbols::archive_saved(), path.display());
        Ok(())
    }
}
