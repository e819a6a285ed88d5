//! # DICOM-DZI library
//!
//! This crate converts large raster images and DICOM scans into Deep Zoom
//! Image (DZI) tile pyramids that web viewers such as OpenSeadragon can
//! stream.

//!
//! A pyramid is a `<name>.dzi` XML descriptor next to a `<name>_files/`
//! directory holding one sub-directory per zoom level. Level 0 is a single
//! pixel, the highest level is the full-resolution image, and every level in
//! between is a 2x2 box average of the one above it. Each level is cut into
//! square JPEG tiles named `<col>_<row>.jpg`.
//!
//! Inputs are read through a [`PixelSource`]:
//!  - PNG files are streamed row by row, so their size is only bounded by
//!    disk space
//!  - JPEG, BMP, TIFF, WebP and GIF are decoded whole, guarded by a pixel
//!    limit
//!  - DICOM frames are rescaled, windowed and mapped to 8 bits by the
//!    [`DicomNormalizer`]
//!
//! Sources above a pixel threshold are tiled in row strips, keeping only a
//! few tile rows per level in memory. Tiles of one tile row are encoded in
//! parallel using rayon.
//!
//! # Examples
//!
//! ## Converting a PNG
//!
//! ```no_run
//! # use dicom_dzi::{convert, ConvertOptions};
//! # use std::path::Path;
//! let options = ConvertOptions::default()
//!     .with_output_dir("tiles")
//!     .with_tile_size(512);
//! let output = convert(Path::new("slide.png"), None, &options)
//!     .expect("should have converted the image");
//! println!("{} tiles", output.report.tile_count);
//! ```
//!
//! ## Converting every frame of a DICOM series
//!
//! ```no_run
//! # use dicom_dzi::{convert_dicom, ConvertOptions, FrameSelector};
//! # use std::path::Path;
//! let conversion = convert_dicom(
//!     Path::new("cine.dcm"),
//!     None,
//!     &ConvertOptions::default(),
//!     FrameSelector::All,
//! )
//! .expect("should have converted all frames");
//! assert_eq!(conversion.frames.len() as u32, conversion.total_frames);
//! ```

pub mod convert;
pub mod dicom_normalizer;
mod downsample;
pub mod dzi;
pub mod enums;
pub mod error;
pub mod pixel_source;
pub mod pyramid;
pub mod pyramid_builder;

pub use convert::{
    ConversionOutput, ConvertOptions, DicomConversion, FrameConversion, convert, convert_dataset,
    convert_dicom,
};
pub use dicom_normalizer::{DicomDataset, DicomNormalizer, NormalizeOptions};
pub use dzi::{DziDescriptor, OutputPaths};
pub use enums::{FrameSelector, PhotometricInterpretation, TileFormat};
pub use error::ConvertError;
pub use pixel_source::{Channels, PixelBuffer, PixelSource, SourceOptions};
pub use pyramid::PyramidGeometry;
pub use pyramid_builder::{PyramidBuilder, PyramidConfig, PyramidReport};
