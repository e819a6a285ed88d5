use std::path::PathBuf;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Unsupported image format for {}: {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error(
        "Image {} is {width}x{height} pixels, above the {limit} pixel limit for formats without streaming decode",
        .path.display()
    )]
    ImageTooLarge {
        path: PathBuf,
        width: u32,
        height: u32,
        limit: u64,
    },

    #[error("Frame index {index} out of range for {} ({count} frames)", .path.display())]
    FrameIndexOutOfRange {
        path: PathBuf,
        index: u32,
        count: u32,
    },

    #[error("Unsupported photometric interpretation in {}: {interpretation}", .path.display())]
    UnsupportedPhotometric {
        path: PathBuf,
        interpretation: String,
    },

    #[error("No pixel data element in {}", .path.display())]
    MissingPixelData { path: PathBuf },

    #[error(
        "{} has {frame_count} frames; select a frame index or all frames",
        .path.display()
    )]
    MultiFrameSelectionRequired { path: PathBuf, frame_count: u32 },

    #[error("Failed to write {}: {source}", .path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode tile {}: {source}", .path.display())]
    TileEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Output already exists: {}", .path.display())]
    OutputExists { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConvertError {
    pub(crate) fn decode(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::Decode {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::OutputWrite {
            path: path.into(),
            source,
        }
    }
}
