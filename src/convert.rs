//! End-to-end conversions: input file in, `.dzi` plus tile tree out.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use web_time::Instant;

use crate::dicom_normalizer::{DicomDataset, DicomMetadata, DicomNormalizer, NormalizeOptions};
use crate::dzi::OutputPaths;
use crate::enums::{FrameSelector, TileFormat};
use crate::error::ConvertError;
use crate::pixel_source::{DEFAULT_MAX_DECODED_PIXELS, PixelSource, SourceOptions, open_source};
use crate::pyramid::DEFAULT_TILE_SIZE;
use crate::pyramid_builder::{
    DEFAULT_QUALITY, DEFAULT_STRIP_THRESHOLD_PIXELS, PyramidBuilder, PyramidConfig, PyramidReport,
};

pub const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom"];

pub const DEFAULT_OUTPUT_DIR: &str = "output/dzi";

#[derive(Clone, Debug, PartialEq)]
pub struct ConvertOptions {
    pub output_dir: PathBuf,
    pub tile_size: u32,
    pub overlap: u32,
    pub quality: u8,
    /// Replace existing outputs. When unset, an existing single output is an
    /// error and existing frames of a series are skipped.
    pub overwrite: bool,
    pub max_decoded_pixels: u64,
    pub strip_threshold_pixels: u64,
    pub normalize: NormalizeOptions,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            tile_size: DEFAULT_TILE_SIZE,
            overlap: 0,
            quality: DEFAULT_QUALITY,
            overwrite: true,
            max_decoded_pixels: DEFAULT_MAX_DECODED_PIXELS,
            strip_threshold_pixels: DEFAULT_STRIP_THRESHOLD_PIXELS,
            normalize: NormalizeOptions::default(),
        }
    }
}

impl ConvertOptions {
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_overlap(mut self, overlap: u32) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_max_decoded_pixels(mut self, max_decoded_pixels: u64) -> Self {
        self.max_decoded_pixels = max_decoded_pixels;
        self
    }

    pub fn with_strip_threshold_pixels(mut self, strip_threshold_pixels: u64) -> Self {
        self.strip_threshold_pixels = strip_threshold_pixels;
        self
    }

    pub fn with_normalize(mut self, normalize: NormalizeOptions) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn pyramid_config(&self) -> PyramidConfig {
        PyramidConfig::default()
            .with_tile_size(self.tile_size)
            .with_overlap(self.overlap)
            .with_quality(self.quality)
            .with_strip_threshold_pixels(self.strip_threshold_pixels)
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions::default().with_max_decoded_pixels(self.max_decoded_pixels)
    }
}

/// One finished pyramid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionOutput {
    pub descriptor_path: PathBuf,
    pub tiles_dir: PathBuf,
    pub report: PyramidReport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameConversion {
    pub index: u32,
    pub output: ConversionOutput,
}

/// Result of converting some or all frames of a DICOM dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DicomConversion {
    pub base_name: String,
    pub metadata: DicomMetadata,
    pub total_frames: u32,
    pub frames: Vec<FrameConversion>,
    /// Frames left alone because their descriptor already existed
    pub skipped_frames: Vec<u32>,
    /// `<name>_series.json`, written for frame-indexed conversions only
    pub series_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct SeriesManifest<'a> {
    base_name: &'a str,
    total_frames: u32,
    converted_frames: Vec<u32>,
    skipped_frames: &'a [u32],
    /// Descriptor file names of every frame present on disk
    descriptors: Vec<String>,
    tile_size: u32,
    overlap: u32,
    quality: u8,
    metadata: &'a DicomMetadata,
}

/// `true` for `.dcm` / `.dicom`, case-insensitively.
pub fn is_dicom_path(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| DICOM_EXTENSIONS.iter().any(|d| ext.eq_ignore_ascii_case(d)))
}

/// `<base>_frame_NNNN`
pub fn frame_name(base_name: &str, index: u32) -> String {
    format!("{base_name}_frame_{index:04}")
}

/// Convert a raster image, or a single-frame DICOM file, into one pyramid.
///
/// `output_name` defaults to the input file stem.
pub fn convert(
    input: &Path,
    output_name: Option<&str>,
    options: &ConvertOptions,
) -> Result<ConversionOutput, ConvertError> {
    if is_dicom_path(input) {
        let mut conversion = convert_dicom(input, output_name, options, FrameSelector::Single)?;
        return conversion
            .frames
            .pop()
            .map(|frame| frame.output)
            .ok_or_else(|| ConvertError::MissingPixelData {
                path: input.to_path_buf(),
            });
    }

    let builder = PyramidBuilder::new(options.pyramid_config())?;
    let name = resolve_output_name(input, output_name)?;
    let paths = OutputPaths::new(&options.output_dir, &name, TileFormat::Jpeg);
    log_input(input, options)?;

    prepare_output(&options.output_dir, &paths, options.overwrite)?;
    let mut source = open_source(input, &options.source_options())?;
    build_pyramid(&builder, source.as_mut(), paths)
}

/// Open a DICOM file and convert the frames picked by `selector`.
pub fn convert_dicom(
    input: &Path,
    output_name: Option<&str>,
    options: &ConvertOptions,
    selector: FrameSelector,
) -> Result<DicomConversion, ConvertError> {
    let builder = PyramidBuilder::new(options.pyramid_config())?;
    let base_name = resolve_output_name(input, output_name)?;
    log_input(input, options)?;

    let dataset = DicomDataset::open(input, &options.source_options())?;
    convert_frames(&builder, &dataset, &base_name, options, selector)
}

/// Convert frames of an already loaded dataset.
pub fn convert_dataset(
    dataset: &DicomDataset,
    base_name: &str,
    options: &ConvertOptions,
    selector: FrameSelector,
) -> Result<DicomConversion, ConvertError> {
    let builder = PyramidBuilder::new(options.pyramid_config())?;
    convert_frames(&builder, dataset, base_name, options, selector)
}

fn convert_frames(
    builder: &PyramidBuilder,
    dataset: &DicomDataset,
    base_name: &str,
    options: &ConvertOptions,
    selector: FrameSelector,
) -> Result<DicomConversion, ConvertError> {
    let metadata = dataset.metadata().clone();
    let total_frames = dataset.frame_count();
    info!(
        "DICOM {}: patient {} ({}), study {} {}, modality {}, {}x{}, {} bits, {}, {} frame(s)",
        dataset.path().display(),
        metadata.patient_name,
        metadata.patient_id,
        metadata.study_date,
        metadata.study_description,
        metadata.modality,
        metadata.columns,
        metadata.rows,
        metadata.bits_stored,
        metadata.photometric,
        total_frames
    );

    let mut conversion = DicomConversion {
        base_name: base_name.to_string(),
        metadata,
        total_frames,
        frames: Vec::new(),
        skipped_frames: Vec::new(),
        series_path: None,
    };

    let indices: Vec<u32> = match selector {
        FrameSelector::Single => {
            if total_frames != 1 {
                return Err(ConvertError::MultiFrameSelectionRequired {
                    path: dataset.path().to_path_buf(),
                    frame_count: total_frames,
                });
            }
            let paths = OutputPaths::new(&options.output_dir, base_name, TileFormat::Jpeg);
            let output = convert_frame(builder, dataset, 0, paths, options)?;
            conversion.frames.push(FrameConversion { index: 0, output });
            return Ok(conversion);
        }
        FrameSelector::Index(index) => {
            if index >= total_frames {
                return Err(ConvertError::FrameIndexOutOfRange {
                    path: dataset.path().to_path_buf(),
                    index,
                    count: total_frames,
                });
            }
            vec![index]
        }
        FrameSelector::All => DicomNormalizer::list_frames(dataset).collect(),
    };

    for index in indices {
        let paths = OutputPaths::new(
            &options.output_dir,
            &frame_name(base_name, index),
            TileFormat::Jpeg,
        );
        if !options.overwrite && paths.descriptor.exists() {
            info!("Frame {index}: {} exists, skipping", paths.descriptor.display());
            conversion.skipped_frames.push(index);
            continue;
        }
        info!("Frame {}/{}", index + 1, total_frames);
        let output = convert_frame(builder, dataset, index, paths, options)?;
        conversion.frames.push(FrameConversion { index, output });
    }

    conversion.series_path = Some(write_series(&conversion, options)?);
    Ok(conversion)
}

/// Normalize one frame and tile it. The frame buffer is dropped on return.
fn convert_frame(
    builder: &PyramidBuilder,
    dataset: &DicomDataset,
    index: u32,
    paths: OutputPaths,
    options: &ConvertOptions,
) -> Result<ConversionOutput, ConvertError> {
    prepare_output(&options.output_dir, &paths, options.overwrite)?;
    let mut frame = DicomNormalizer::normalize_frame(dataset, index, &options.normalize)?;
    build_pyramid(builder, &mut frame, paths)
}

fn build_pyramid(
    builder: &PyramidBuilder,
    source: &mut dyn PixelSource,
    paths: OutputPaths,
) -> Result<ConversionOutput, ConvertError> {
    let start = Instant::now();
    let report = builder.build(source, &paths)?;
    info!(
        "Created {}: {} levels, {} tiles, {} in {:.2?}",
        paths.descriptor.display(),
        report.levels,
        report.tile_count,
        format_bytes(report.tile_bytes),
        start.elapsed()
    );

    Ok(ConversionOutput {
        descriptor_path: paths.descriptor,
        tiles_dir: paths.tiles_dir,
        report,
    })
}

/// Apply the overwrite policy to one output and make sure its parent exists.
fn prepare_output(
    output_dir: &Path,
    paths: &OutputPaths,
    overwrite: bool,
) -> Result<(), ConvertError> {
    if !overwrite && (paths.descriptor.exists() || paths.tiles_dir.exists()) {
        return Err(ConvertError::OutputExists {
            path: paths.descriptor.clone(),
        });
    }
    // The descriptor goes first so a failed rerun never leaves one behind.
    if paths.descriptor.exists() {
        fs::remove_file(&paths.descriptor)
            .map_err(|e| ConvertError::write(&paths.descriptor, e))?;
    }
    if paths.tiles_dir.exists() {
        warn!("Removing existing {}", paths.tiles_dir.display());
        fs::remove_dir_all(&paths.tiles_dir)
            .map_err(|e| ConvertError::write(&paths.tiles_dir, e))?;
    }
    fs::create_dir_all(output_dir).map_err(|e| ConvertError::write(output_dir, e))
}

fn write_series(
    conversion: &DicomConversion,
    options: &ConvertOptions,
) -> Result<PathBuf, ConvertError> {
    let mut present: Vec<u32> = conversion
        .frames
        .iter()
        .map(|f| f.index)
        .chain(conversion.skipped_frames.iter().copied())
        .collect();
    present.sort_unstable();

    let manifest = SeriesManifest {
        base_name: &conversion.base_name,
        total_frames: conversion.total_frames,
        converted_frames: conversion.frames.iter().map(|f| f.index).collect(),
        skipped_frames: &conversion.skipped_frames,
        descriptors: present
            .into_iter()
            .map(|index| format!("{}.dzi", frame_name(&conversion.base_name, index)))
            .collect(),
        tile_size: options.tile_size,
        overlap: options.overlap,
        quality: options.quality,
        metadata: &conversion.metadata,
    };

    let path = options
        .output_dir
        .join(format!("{}_series.json", conversion.base_name));
    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| ConvertError::write(&path, e.into()))?;
    fs::write(&path, json).map_err(|e| ConvertError::write(&path, e))?;
    info!("Series metadata written to {}", path.display());
    Ok(path)
}

fn resolve_output_name(input: &Path, output_name: Option<&str>) -> Result<String, ConvertError> {
    match output_name {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => input
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ConvertError::InvalidConfig(format!(
                    "cannot derive an output name from {}",
                    input.display()
                ))
            }),
    }
}

fn log_input(input: &Path, options: &ConvertOptions) -> Result<(), ConvertError> {
    let size = fs::metadata(input)
        .map_err(|e| ConvertError::decode(input, e))?
        .len();
    info!(
        "Converting {} ({}) to {}: tile size {}, overlap {}, quality {}",
        input.display(),
        format_bytes(size),
        options.output_dir.display(),
        options.tile_size,
        options.overlap,
        options.quality
    );
    Ok(())
}

/// Human-readable byte count, binary units.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom_normalizer::FrameAttributes;
    use tempfile::TempDir;

    fn options(temp_dir: &TempDir) -> ConvertOptions {
        ConvertOptions::default()
            .with_output_dir(temp_dir.path().join("out"))
            .with_tile_size(128)
    }

    fn cine(frames: u32) -> DicomDataset {
        let attributes = FrameAttributes {
            number_of_frames: frames,
            ..FrameAttributes::new(3, 5, "MONOCHROME2")
        };
        let pixels = (0..frames * 15).map(|v| (v * 7 % 256) as u8).collect();
        DicomDataset::from_parts("cine.dcm", attributes, Some(pixels)).unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = ConvertOptions::default();
        assert_eq!(options.output_dir, Path::new("output/dzi"));
        assert_eq!(options.tile_size, 256);
        assert_eq!(options.overlap, 0);
        assert_eq!(options.quality, 90);
        assert!(options.overwrite);
        assert_eq!(options.pyramid_config(), PyramidConfig::default());
    }

    #[test]
    fn test_is_dicom_path() {
        assert!(is_dicom_path(Path::new("scan.dcm")));
        assert!(is_dicom_path(Path::new("scan.DICOM")));
        assert!(!is_dicom_path(Path::new("scan.png")));
        assert!(!is_dicom_path(Path::new("dcm")));
    }

    #[test]
    fn test_output_names() {
        assert_eq!(frame_name("cine", 7), "cine_frame_0007");
        assert_eq!(frame_name("cine", 12345), "cine_frame_12345");
        assert_eq!(
            resolve_output_name(Path::new("dir/slide.tiff"), None).unwrap(),
            "slide"
        );
        assert_eq!(
            resolve_output_name(Path::new("dir/slide.tiff"), Some("custom")).unwrap(),
            "custom"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_single_selector_rejects_multi_frame() {
        let temp_dir = TempDir::new().unwrap();
        let result = convert_dataset(&cine(3), "cine", &options(&temp_dir), FrameSelector::Single);
        assert!(matches!(
            result,
            Err(ConvertError::MultiFrameSelectionRequired { frame_count: 3, .. })
        ));
    }

    #[test]
    fn test_single_frame_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir);
        let conversion =
            convert_dataset(&cine(1), "single", &options, FrameSelector::Single).unwrap();

        assert_eq!(conversion.frames.len(), 1);
        assert!(conversion.series_path.is_none());
        let output = &conversion.frames[0].output;
        assert_eq!(output.descriptor_path, options.output_dir.join("single.dzi"));
        assert!(output.descriptor_path.exists());
        assert_eq!((output.report.width, output.report.height), (5, 3));
    }

    #[test]
    fn test_all_frames_and_series_file() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir);
        let conversion = convert_dataset(&cine(3), "cine", &options, FrameSelector::All).unwrap();

        let indices: Vec<u32> = conversion.frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        for index in 0..3 {
            let name = frame_name("cine", index);
            assert!(options.output_dir.join(format!("{name}.dzi")).exists());
            assert!(options.output_dir.join(format!("{name}_files/0/0_0.jpg")).exists());
        }

        let series_path = conversion.series_path.unwrap();
        assert_eq!(series_path, options.output_dir.join("cine_series.json"));
        let series: serde_json::Value =
            serde_json::from_slice(&fs::read(series_path).unwrap()).unwrap();
        assert_eq!(series["base_name"], "cine");
        assert_eq!(series["total_frames"], 3);
        assert_eq!(series["converted_frames"], serde_json::json!([0, 1, 2]));
        assert_eq!(series["descriptors"][2], "cine_frame_0002.dzi");
        assert_eq!(series["metadata"]["modality"], "Unknown");
    }

    #[test]
    fn test_existing_frames_skipped_without_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir);
        convert_dataset(&cine(3), "cine", &options, FrameSelector::Index(1)).unwrap();

        let conversion = convert_dataset(
            &cine(3),
            "cine",
            &options.clone().with_overwrite(false),
            FrameSelector::All,
        )
        .unwrap();
        let indices: Vec<u32> = conversion.frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(conversion.skipped_frames, vec![1]);
    }

    #[test]
    fn test_frame_index_out_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let result = convert_dataset(&cine(2), "cine", &options(&temp_dir), FrameSelector::Index(2));
        assert!(matches!(
            result,
            Err(ConvertError::FrameIndexOutOfRange {
                index: 2,
                count: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_overwrite_removes_stale_tiles() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir);
        let stale = options.output_dir.join("single_files/30/0_0.jpg");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"stale").unwrap();

        convert_dataset(&cine(1), "single", &options, FrameSelector::Single).unwrap();
        assert!(!stale.exists());
        assert!(options.output_dir.join("single_files/3/0_0.jpg").exists());
    }

    #[test]
    fn test_invalid_config_fails_before_output() {
        let temp_dir = TempDir::new().unwrap();
        let options = options(&temp_dir).with_tile_size(300);
        let result = convert_dataset(&cine(1), "single", &options, FrameSelector::Single);
        assert!(matches!(result, Err(ConvertError::InvalidConfig(_))));
        assert!(!options.output_dir.exists());
    }
}
