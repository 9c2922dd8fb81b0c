pub mod activation_map;
pub mod archive;
pub mod color_utils;
pub mod config;
pub mod error;
pub mod heatmap;
pub mod image_input;
pub mod layers;
pub mod model;
pub mod mosaic_processing;
pub mod output_manager;
pub mod prediction_table;
pub mod progress;
pub mod tiling;
