//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use image::{Rgb, RgbImage};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Two-class model: 1x1 conv (3 -> 2, relu), global average pooling, softmax.
pub const CNN_MODEL: &str = r#"{
  "name": "test-cnn",
  "class_names": ["Y", "N"],
  "layers": [
    {"type": "conv2d", "kernel_shape": [1, 1, 3, 2],
     "kernel": [0.5, -0.2, 0.3, 0.4, -0.1, 0.6], "bias": [0.1, 0.0],
     "activation": "relu"},
    {"type": "global_average_pooling2d"},
    {"type": "dropout", "rate": 0.25},
    {"type": "dense", "kernel_shape": [2, 2], "kernel": [1.0, -1.0, -0.5, 0.5],
     "activation": "softmax"}
  ]
}"#;

/// Valid model without any convolution.
pub const DENSE_ONLY_MODEL: &str = r#"{
  "name": "dense-only",
  "class_names": ["Y", "N"],
  "layers": [
    {"type": "global_average_pooling2d"},
    {"type": "dense", "kernel_shape": [3, 2], "kernel": [0.2, -0.2, 0.1, 0.3, -0.4, 0.5],
     "activation": "softmax"}
  ]
}"#;

pub fn write_model(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, json).unwrap();
    path
}

/// Textured RGB mosaic saved as PNG.
pub fn write_mosaic(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            20 + (x * 3 % 200) as u8,
            20 + (y * 5 % 200) as u8,
            20 + ((x * y) % 180) as u8,
        ])
    })
    .save(&path)
    .unwrap();
    path
}

/// Run the binary with colours disabled.
pub fn run_amfinder(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_amfinder"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute amfinder")
}

pub fn archive_entries(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

pub fn read_archive_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}
