//! Output placement: one archive per input image, named after its stem,
//! either next to the image or inside `--output-dir`.

use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct OutputManager<'a> {
    output_dir: Option<&'a Path>,
    input_path: &'a Path,
}

impl<'a> OutputManager<'a> {
    pub fn new(output_dir: Option<&'a Path>, input_path: &'a Path) -> Self {
        Self {
            output_dir,
            input_path,
        }
    }

    /// File name without extension, `output` when there is none.
    pub fn input_stem(&self) -> &str {
        self.input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
    }

    pub fn archive_path(&self) -> PathBuf {
        let filename = format!("{}.zip", self.input_stem());
        match self.output_dir {
            Some(dir) => dir.join(filename),
            None => self
                .input_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(filename),
        }
    }

    /// Archive entry holding the prediction table.
    pub fn table_entry(&self) -> String {
        format!("{}.tsv", self.input_stem())
    }

    /// Archive entry holding the activation mosaic of one class.
    pub fn cam_entry(&self, label: &str) -> String {
        format!("{}_CAM_{}.jpg", self.input_stem(), sanitize_label(label))
    }

    /// Create the output directory when one is configured.
    pub fn ensure_output_dir(&self) -> Result<()> {
        if let Some(dir) = self.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Keep labels usable as file name parts.
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Archive path for every input, failing when two inputs share one unless
/// `force` is set.
pub fn plan_archive_paths(
    inputs: &[PathBuf],
    output_dir: Option<&Path>,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let mut owners: HashMap<PathBuf, &Path> = HashMap::new();
    let mut planned = Vec::with_capacity(inputs.len());

    for input in inputs {
        let archive = OutputManager::new(output_dir, input).archive_path();
        if let Some(previous) = owners.get(&archive) {
            if !force {
                bail!(
                    "Output path collision detected: {} and {} both write to {}. \
                     Use --force to overwrite, or run them separately.",
                    previous.display(),
                    input.display(),
                    archive.display()
                );
            }
            debug!(
                "{} overwrites the output of {} (--force)",
                input.display(),
                previous.display()
            );
        } else {
            owners.insert(archive.clone(), input);
        }
        planned.push(archive);
    }
    Ok(planned)
}
