//! Deep Zoom descriptor (`.dzi`) output.

use std::fs;
use std::path::{Path, PathBuf};

use crate::enums::TileFormat;
use crate::error::ConvertError;

pub const DEEPZOOM_NAMESPACE: &str = "http://schemas.microsoft.com/deepzoom/2008";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DziDescriptor {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: TileFormat,
}

impl DziDescriptor {
    pub fn to_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Image xmlns="{DEEPZOOM_NAMESPACE}"
       TileSize="{}"
       Overlap="{}"
       Format="{}">
  <Size Width="{}" Height="{}" />
</Image>
"#,
            self.tile_size,
            self.overlap,
            self.format.extension(),
            self.width,
            self.height
        )
    }

    pub fn write(&self, path: &Path) -> Result<(), ConvertError> {
        fs::write(path, self.to_xml()).map_err(|e| ConvertError::write(path, e))
    }
}

/// Locations of one pyramid: `<dir>/<name>.dzi` and `<dir>/<name>_files/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub descriptor: PathBuf,
    pub tiles_dir: PathBuf,
    pub format: TileFormat,
}

impl OutputPaths {
    pub fn new(output_dir: &Path, name: &str, format: TileFormat) -> Self {
        Self {
            descriptor: output_dir.join(format!("{name}.dzi")),
            tiles_dir: output_dir.join(format!("{name}_files")),
            format,
        }
    }

    pub fn level_dir(&self, level: u32) -> PathBuf {
        self.tiles_dir.join(level.to_string())
    }

    /// `<name>_files/<level>/<col>_<row>.<ext>`, the address a viewer requests.
    pub fn tile_path(&self, level: u32, col: u32, row: u32) -> PathBuf {
        self.level_dir(level)
            .join(format!("{col}_{row}.{}", self.format.extension()))
    }
}
