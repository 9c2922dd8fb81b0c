//! Input collection and mosaic loading.

use anyhow::{anyhow, Context, Result};
use image::{ImageReader, RgbImage};
use log::warn;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;

/// How to treat missing or unsupported sources.
#[derive(Debug, Clone)]
pub struct ImageInputConfig {
    pub strict_mode: bool,
    pub require_glob_matches: bool,
}

impl Default for ImageInputConfig {
    fn default() -> Self {
        Self::strict()
    }
}

impl ImageInputConfig {
    pub fn strict() -> Self {
        Self {
            strict_mode: true,
            require_glob_matches: true,
        }
    }

    pub fn permissive() -> Self {
        Self {
            strict_mode: false,
            require_glob_matches: false,
        }
    }

    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            Self::strict()
        } else {
            Self::permissive()
        }
    }
}

/// Supported extensions: jpg, jpeg, png, tif, tiff, bmp, webp.
pub fn is_supported_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            matches!(
                ext.as_str(),
                "jpg" | "jpeg" | "png" | "tif" | "tiff" | "bmp" | "webp"
            )
        })
}

/// Images directly inside `dir_path`, sorted by name.
pub fn find_images_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();
    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read directory: {}", dir_path.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_supported_image_file(&path) {
            image_files.push(path);
        }
    }
    image_files.sort();
    Ok(image_files)
}

fn looks_like_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

fn missing_source(source: &str, config: &ImageInputConfig, message: &str) -> Result<()> {
    if config.strict_mode {
        Err(anyhow!("{message}: {source}"))
    } else {
        warn!("{}{message}: {source}", symbols::warning());
        Ok(())
    }
}

/// Expand files, directories and glob patterns into image paths.
///
/// Sources keep their command-line order; directory listings and glob
/// matches are sorted. A path reached twice is kept at its first position.
pub fn collect_images_from_sources(
    sources: &[String],
    config: &ImageInputConfig,
) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();

    for source in sources {
        let source_path = Path::new(source);

        if source_path.is_file() {
            if is_supported_image_file(source_path) {
                collected.push(source_path.to_path_buf());
            } else if config.strict_mode {
                return Err(anyhow!(
                    "File is not a supported image format: {}",
                    source_path.display()
                ));
            }
        } else if source_path.is_dir() {
            collected.extend(find_images_in_directory(source_path)?);
        } else if !looks_like_glob(source) {
            missing_source(source, config, "File does not exist")?;
        } else {
            match glob::glob(source) {
                Ok(paths) => {
                    let mut matches = Vec::new();
                    for entry in paths {
                        match entry {
                            Ok(path) if path.is_file() && is_supported_image_file(&path) => {
                                matches.push(path)
                            }
                            Ok(_) => {}
                            Err(e) => warn!(
                                "{}Error reading path in glob {source}: {e}",
                                symbols::warning()
                            ),
                        }
                    }
                    if matches.is_empty() && config.require_glob_matches {
                        return Err(anyhow!("No image files found matching pattern: {source}"));
                    }
                    matches.sort();
                    collected.extend(matches);
                }
                Err(_) => missing_source(
                    source,
                    config,
                    "Source path does not exist and is not a valid glob pattern",
                )?,
            }
        }
    }

    let mut seen = HashSet::new();
    collected.retain(|path| seen.insert(path.clone()));

    if collected.is_empty() && config.strict_mode {
        return Err(anyhow!("No image files found in the specified sources"));
    }
    Ok(collected)
}

/// Decode a mosaic as 8-bit RGB, without the decoder's size limits.
pub fn load_mosaic(path: &Path) -> Result<RgbImage> {
    let mut reader = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to detect image format: {}", path.display()))?;
    reader.no_limits();
    let image = reader
        .decode()
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    Ok(image.to_rgb8())
}
