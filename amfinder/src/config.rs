//! Configuration layer separating CLI arguments from the settings the
//! prediction pipeline runs with.
//!
//! - `GlobalArgs` / `PredictCommand`: clap argument structs
//! - `BaseConfig` / `PredictionConfig`: what the run needs, built from them
//! - `InferenceSettings`: the per-run values recorded next to every result

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::AmfError;
use crate::heatmap::ColorMap;

pub const DEFAULT_TILE_SIZE: u32 = 126;
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Parse a strictly positive integer.
pub fn parse_positive(s: &str) -> Result<usize, String> {
    let val = s
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if val == 0 {
        return Err("Must be greater than 0".to_string());
    }
    Ok(val)
}

/// Parse a tile edge in pixels.
pub fn parse_tile_size(s: &str) -> Result<u32, String> {
    let val = parse_positive(s)?;
    u32::try_from(val).map_err(|_| format!("Tile size too large: {val}"))
}

/// Parse class labels from a comma-separated string like "Y,N,X".
pub fn parse_header(s: &str) -> Result<Vec<String>, String> {
    let labels: Vec<String> = s
        .split(',')
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect();
    if labels.is_empty() {
        return Err("No class labels specified".to_string());
    }
    let mut seen = HashSet::new();
    if let Some(dup) = labels.iter().find(|label| !seen.insert(label.as_str())) {
        return Err(format!("Duplicate class label: '{dup}'"));
    }
    Ok(labels)
}

/// Arguments shared by every subcommand.
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Write archives to this directory instead of next to each image
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Log failed images and keep going instead of stopping at the first error
    #[arg(long, global = true)]
    pub permissive: bool,

    /// Disable colored output (also respects NO_COLOR and AMFINDER_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Allow overwriting outputs when two inputs map to the same archive
    #[arg(long, global = true)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaseConfig {
    /// Images, directories or glob patterns
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Opposite of `--permissive`.
    pub strict: bool,
    pub force: bool,
}

impl From<GlobalArgs> for BaseConfig {
    fn from(global: GlobalArgs) -> Self {
        Self {
            sources: Vec::new(),
            output_dir: global.output_dir,
            strict: !global.permissive,
            force: global.force,
        }
    }
}

/// Tiled prediction with optional class activation maps.
#[derive(Parser, Debug, Clone)]
pub struct PredictCommand {
    /// Path(s) to mosaic images or directories. Supports glob patterns like *.tif
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Model file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub model: PathBuf,

    /// Tile edge in pixels
    #[arg(short = 't', long, default_value_t = DEFAULT_TILE_SIZE, value_parser = parse_tile_size)]
    pub tile_size: u32,

    /// Tiles per inference call
    #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_positive)]
    pub batch_size: usize,

    /// Class labels as a comma-separated list (defaults to the model's class names)
    #[arg(long, value_name = "LABELS")]
    pub header: Option<String>,

    /// Generate class activation maps
    #[arg(long)]
    pub cams: bool,

    /// Palette for the best-matching class in activation maps
    #[arg(long, value_enum, default_value_t = ColorMap::Jet)]
    pub colormap: ColorMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub model_path: PathBuf,
    pub tile_edge: u32,
    pub batch_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<Vec<String>>,
    pub generate_cams: bool,
    pub colormap: ColorMap,
}

impl PredictionConfig {
    pub fn from_args(global: GlobalArgs, cmd: PredictCommand) -> Result<Self, String> {
        if cmd.colormap == ColorMap::Bone {
            return Err(
                "Bone is reserved for non-best classes; choose jet, hot or turbo".to_string(),
            );
        }
        let header = cmd.header.as_deref().map(parse_header).transpose()?;

        let mut base: BaseConfig = global.into();
        base.sources = cmd.sources;

        Ok(Self {
            base,
            model_path: cmd.model,
            tile_edge: cmd.tile_size,
            batch_size: cmd.batch_size,
            header,
            generate_cams: cmd.cams,
            colormap: cmd.colormap,
        })
    }

    /// Resolve the class labels against the model and freeze the settings.
    ///
    /// An explicit header wins over the model's class names; a model without
    /// names gets `class_0`, `class_1`, ...
    pub fn inference_settings(
        &self,
        class_names: &[String],
        class_count: usize,
    ) -> Result<InferenceSettings, AmfError> {
        let header = match &self.header {
            Some(labels) => labels.clone(),
            None if !class_names.is_empty() => class_names.to_vec(),
            None => (0..class_count).map(|k| format!("class_{k}")).collect(),
        };
        if header.len() != class_count {
            return Err(AmfError::HeaderMismatch {
                model: class_count,
                header: header.len(),
            });
        }
        Ok(InferenceSettings {
            batch_size: self.batch_size,
            tile_edge: self.tile_edge,
            header,
            generate_cams: self.generate_cams,
            best_match_colormap: self.colormap,
        })
    }
}

/// Values one prediction run uses for every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub batch_size: usize,
    pub tile_edge: u32,
    pub header: Vec<String>,
    pub generate_cams: bool,
    pub best_match_colormap: ColorMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(permissive: bool) -> GlobalArgs {
        GlobalArgs {
            output_dir: Some("/tmp".to_string()),
            verbosity: Verbosity::new(0, 0),
            permissive,
            no_color: false,
            force: false,
        }
    }

    fn command() -> PredictCommand {
        PredictCommand {
            sources: vec!["root.jpg".to_string()],
            model: PathBuf::from("model.json"),
            tile_size: 64,
            batch_size: 8,
            header: None,
            cams: true,
            colormap: ColorMap::Jet,
        }
    }

    fn names(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_global_args_conversion() {
        let config: BaseConfig = global(true).into();
        assert!(config.sources.is_empty());
        assert_eq!(config.output_dir, Some("/tmp".to_string()));
        assert!(!config.strict);
        assert!(!config.force);
    }

    #[test]
    fn test_predict_command_conversion() {
        let mut cmd = command();
        cmd.header = Some(" Y, N ,X".to_string());
        let config = PredictionConfig::from_args(global(false), cmd).unwrap();
        assert_eq!(config.base.sources, vec!["root.jpg"]);
        assert!(config.base.strict);
        assert_eq!(config.tile_edge, 64);
        assert_eq!(config.header, Some(names(&["Y", "N", "X"])));
    }

    #[test]
    fn test_bone_rejected_as_best_match_palette() {
        let mut cmd = command();
        cmd.colormap = ColorMap::Bone;
        assert!(PredictionConfig::from_args(global(false), cmd).is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("A,B").unwrap(), names(&["A", "B"]));
        assert!(parse_header(" , ").is_err());
        assert!(parse_header("A,B,A").is_err());
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("32").unwrap(), 32);
        assert!(parse_positive("0").is_err());
        assert!(parse_positive("-3").is_err());
        assert!(parse_tile_size("99999999999").is_err());
    }

    #[test]
    fn test_header_resolution() {
        let config = PredictionConfig::from_args(global(false), command()).unwrap();
        let settings = config.inference_settings(&names(&["Y", "N"]), 2).unwrap();
        assert_eq!(settings.header, names(&["Y", "N"]));
        assert_eq!(settings.batch_size, 8);

        let settings = config.inference_settings(&[], 3).unwrap();
        assert_eq!(settings.header, names(&["class_0", "class_1", "class_2"]));

        let mut cmd = command();
        cmd.header = Some("A,B,C".to_string());
        let config = PredictionConfig::from_args(global(false), cmd).unwrap();
        assert!(matches!(
            config.inference_settings(&names(&["Y", "N"]), 2),
            Err(AmfError::HeaderMismatch {
                model: 2,
                header: 3
            })
        ));
    }
}
