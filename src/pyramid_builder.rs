use std::fs;
use std::ops::AddAssign;

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::downsample::Downsampler;
use crate::dzi::{DziDescriptor, OutputPaths};
use crate::enums::TileFormat;
use crate::error::ConvertError;
use crate::pixel_source::{Channels, PixelBuffer, PixelSource};
use crate::pyramid::{ALLOWED_TILE_SIZES, DEFAULT_TILE_SIZE, PyramidGeometry};

pub const DEFAULT_QUALITY: u8 = 90;

/// Sources up to 64 Mi pixels are tiled level by level in memory; larger
/// ones go through row strips.
pub const DEFAULT_STRIP_THRESHOLD_PIXELS: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PyramidConfig {
    pub tile_size: u32,
    pub overlap: u32,
    /// JPEG quality, 1-100
    pub quality: u8,
    pub format: TileFormat,
    pub strip_threshold_pixels: u64,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: 0,
            quality: DEFAULT_QUALITY,
            format: TileFormat::Jpeg,
            strip_threshold_pixels: DEFAULT_STRIP_THRESHOLD_PIXELS,
        }
    }
}

impl PyramidConfig {
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

    pub fn with_strip_threshold_pixels(mut self, strip_threshold_pixels: u64) -> Self {
        self.strip_threshold_pixels = strip_threshold_pixels;
        self
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if !ALLOWED_TILE_SIZES.contains(&self.tile_size) {
            return Err(ConvertError::InvalidConfig(format!(
                "tile size {} is not one of {:?}",
                self.tile_size, ALLOWED_TILE_SIZES
            )));
        }
        if self.overlap >= self.tile_size {
            return Err(ConvertError::InvalidConfig(format!(
                "overlap {} must be smaller than the tile size {}",
                self.overlap, self.tile_size
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(ConvertError::InvalidConfig(format!(
                "quality {} is outside 1-100",
                self.quality
            )));
        }
        Ok(())
    }

    /// The descriptor matching tiles produced with this configuration.
    pub fn descriptor(&self, width: u32, height: u32) -> DziDescriptor {
        DziDescriptor {
            width,
            height,
            tile_size: self.tile_size,
            overlap: self.overlap,
            format: self.format,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PyramidReport {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub tile_count: u64,
    pub tile_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct TileStats {
    tiles: u64,
    bytes: u64,
}

impl AddAssign for TileStats {
    fn add_assign(&mut self, other: Self) {
        self.tiles += other.tiles;
        self.bytes += other.bytes;
    }
}

pub struct PyramidBuilder {
    config: PyramidConfig,
}

impl PyramidBuilder {
    pub fn new(config: PyramidConfig) -> Result<Self, ConvertError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Tile `source` into `output` and write its descriptor.
    ///
    /// The descriptor is written after the last tile, so a tree without one
    /// is incomplete. Nothing is cleaned up on failure.
    pub fn build(
        &self,
        source: &mut dyn PixelSource,
        output: &OutputPaths,
    ) -> Result<PyramidReport, ConvertError> {
        let (width, height) = (source.width(), source.height());
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidConfig(
                "source image has zero width or height".to_string(),
            ));
        }

        let geometry = PyramidGeometry::new(
            width,
            height,
            self.config.tile_size,
            self.config.overlap,
        );
        for level in 0..=geometry.max_level() {
            let dir = output.level_dir(level);
            fs::create_dir_all(&dir).map_err(|e| ConvertError::write(dir, e))?;
        }

        let writer = TileWriter {
            output,
            quality: self.config.quality,
            channels: source.channels(),
        };
        let in_memory = width as u64 * height as u64 <= self.config.strip_threshold_pixels;
        info!(
            "Tiling {}x{} into {} levels ({} tiles), {}",
            width,
            height,
            geometry.level_count(),
            geometry.total_tiles(),
            if in_memory { "in memory" } else { "in row strips" }
        );

        let stats = if in_memory {
            Self::build_in_memory(source, &geometry, &writer)?
        } else {
            Self::build_in_strips(source, &geometry, &writer)?
        };

        self.config
            .descriptor(width, height)
            .write(&output.descriptor)?;

        Ok(PyramidReport {
            width,
            height,
            levels: geometry.level_count(),
            tile_count: stats.tiles,
            tile_bytes: stats.bytes,
        })
    }

    fn build_in_memory(
        source: &mut dyn PixelSource,
        geometry: &PyramidGeometry,
        writer: &TileWriter<'_>,
    ) -> Result<TileStats, ConvertError> {
        let mut current = match source.take_buffer() {
            Some(buffer) => buffer,
            None => {
                let data = source.read_rows(0, geometry.height())?;
                PixelBuffer::from_raw_parts(
                    geometry.width(),
                    geometry.height(),
                    source.channels(),
                    data,
                )
            }
        };
        let mut stats = TileStats::default();

        for level in (0..=geometry.max_level()).rev() {
            let (cols, rows) = geometry.tile_grid(level);
            debug!(
                "Level {}: {}x{} pixels, {}x{} tiles",
                level,
                current.width(),
                current.height(),
                cols,
                rows
            );
            let row_bytes = current.row_bytes();
            for row in 0..rows {
                let (y0, y1) = geometry.row_span(level, row);
                let band = &current.data()[y0 as usize * row_bytes..y1 as usize * row_bytes];
                stats += writer.write_tile_row(geometry, level, row, band)?;
            }

            if level > 0 {
                // Replacing the slot frees the finer level.
                current = Downsampler::downsample_level(&current);
            }
        }

        Ok(stats)
    }

    fn build_in_strips(
        source: &mut dyn PixelSource,
        geometry: &PyramidGeometry,
        writer: &TileWriter<'_>,
    ) -> Result<TileStats, ConvertError> {
        let channels = source.channels();
        let mut levels: Vec<StripLevel> = (0..=geometry.max_level())
            .map(|level| StripLevel::new(*geometry, level, channels))
            .collect();
        let mut stats = TileStats::default();

        let strip_rows = geometry.tile_size();
        let mut y = 0;
        while y < geometry.height() {
            let count = strip_rows.min(geometry.height() - y);
            let strip = source.read_rows(y, count)?;
            stats += Self::feed(&mut levels, geometry.max_level(), strip, writer)?;
            y += count;
        }

        debug_assert!(levels.iter().all(StripLevel::is_complete));
        Ok(stats)
    }

    /// Push rows into `level` and cascade the downsampled rows towards level 0.
    fn feed(
        levels: &mut [StripLevel],
        level: u32,
        strip: Vec<u8>,
        writer: &TileWriter<'_>,
    ) -> Result<TileStats, ConvertError> {
        let mut stats = TileStats::default();
        let mut pending = Some((level, strip));
        while let Some((level, strip)) = pending.take() {
            let (written, downsampled) = levels[level as usize].push(&strip, writer)?;
            stats += written;
            if !downsampled.is_empty() {
                pending = Some((level - 1, downsampled));
            }
        }
        Ok(stats)
    }
}

/// Rows of one level still needed by its next tile row or its next
/// downsample pair. Everything above both is dropped.
struct StripLevel {
    geometry: PyramidGeometry,
    level: u32,
    width: u32,
    height: u32,
    channels: Channels,
    row_bytes: usize,
    tile_rows: u32,
    /// Level row stored at the start of `rows`
    first_row: u32,
    rows: Vec<u8>,
    received: u32,
    next_tile_row: u32,
    next_pair: u32,
}

impl StripLevel {
    fn new(geometry: PyramidGeometry, level: u32, channels: Channels) -> Self {
        let (width, height) = geometry.level_dimensions(level);
        let (_, tile_rows) = geometry.tile_grid(level);
        Self {
            geometry,
            level,
            width,
            height,
            channels,
            row_bytes: width as usize * channels.count(),
            tile_rows,
            first_row: 0,
            rows: Vec::new(),
            received: 0,
            next_tile_row: 0,
            next_pair: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.height
            && self.next_tile_row == self.tile_rows
            && (self.level == 0 || self.next_pair >= self.height)
    }

    /// Returns the tiles written and the rows produced for the next coarser level.
    fn push(
        &mut self,
        strip: &[u8],
        writer: &TileWriter<'_>,
    ) -> Result<(TileStats, Vec<u8>), ConvertError> {
        self.rows.extend_from_slice(strip);
        self.received += (strip.len() / self.row_bytes) as u32;

        let stats = self.write_ready_tiles(writer)?;
        let downsampled = if self.level > 0 {
            self.downsample_ready_pairs()
        } else {
            Vec::new()
        };
        self.discard_consumed();

        Ok((stats, downsampled))
    }

    fn write_ready_tiles(&mut self, writer: &TileWriter<'_>) -> Result<TileStats, ConvertError> {
        let mut stats = TileStats::default();
        while self.next_tile_row < self.tile_rows {
            let (y0, y1) = self.geometry.row_span(self.level, self.next_tile_row);
            if self.received < y1 {
                break;
            }
            let start = (y0 - self.first_row) as usize * self.row_bytes;
            let end = (y1 - self.first_row) as usize * self.row_bytes;
            stats += writer.write_tile_row(
                &self.geometry,
                self.level,
                self.next_tile_row,
                &self.rows[start..end],
            )?;
            self.next_tile_row += 1;
        }
        if self.next_tile_row == self.tile_rows && stats.tiles > 0 {
            debug!("Level {} complete", self.level);
        }
        Ok(stats)
    }

    fn downsample_ready_pairs(&mut self) -> Vec<u8> {
        let out_row_bytes = Downsampler::half(self.width) as usize * self.channels.count();
        let mut out = Vec::new();

        while self.next_pair < self.height {
            let y = self.next_pair;
            let has_bottom = y + 1 < self.height;
            let needed = if has_bottom { y + 2 } else { y + 1 };
            if self.received < needed {
                break;
            }

            let top_start = (y - self.first_row) as usize * self.row_bytes;
            let top = &self.rows[top_start..top_start + self.row_bytes];
            let bottom = has_bottom
                .then(|| &self.rows[top_start + self.row_bytes..top_start + 2 * self.row_bytes]);
            let out_start = out.len();
            out.resize(out_start + out_row_bytes, 0);
            Downsampler::downsample_rows(top, bottom, self.width, self.channels, &mut out[out_start..]);

            self.next_pair += 2;
        }
        out
    }

    fn discard_consumed(&mut self) {
        let tile_keep = if self.next_tile_row < self.tile_rows {
            self.geometry.row_span(self.level, self.next_tile_row).0
        } else {
            self.height
        };
        let pair_keep = if self.level > 0 {
            self.next_pair.min(self.height)
        } else {
            self.height
        };
        let keep_from = tile_keep.min(pair_keep).min(self.received);

        if keep_from > self.first_row {
            let consumed = (keep_from - self.first_row) as usize * self.row_bytes;
            self.rows.drain(..consumed);
            self.first_row = keep_from;
        }
    }
}

struct TileWriter<'a> {
    output: &'a OutputPaths,
    quality: u8,
    channels: Channels,
}

impl TileWriter<'_> {
    /// Encode and write every tile of one tile row. `band` holds the full-width
    /// level rows spanned by that tile row, overlap included.
    fn write_tile_row(
        &self,
        geometry: &PyramidGeometry,
        level: u32,
        row: u32,
        band: &[u8],
    ) -> Result<TileStats, ConvertError> {
        let (cols, _) = geometry.tile_grid(level);
        let (level_width, _) = geometry.level_dimensions(level);
        let row_bytes = level_width as usize * self.channels.count();
        let band_height = (band.len() / row_bytes) as u32;

        let sizes = (0..cols)
            .into_par_iter()
            .map(|col| {
                let (x0, x1) = geometry.column_span(level, col);
                let pixels = self.crop(band, row_bytes, x0, x1);
                let path = self.output.tile_path(level, col, row);
                let bytes = self
                    .encode(&pixels, x1 - x0, band_height)
                    .map_err(|source| ConvertError::TileEncode {
                        path: path.clone(),
                        source,
                    })?;
                fs::write(&path, &bytes).map_err(|e| ConvertError::write(&path, e))?;
                Ok(bytes.len() as u64)
            })
            .collect::<Result<Vec<u64>, ConvertError>>()?;

        Ok(TileStats {
            tiles: sizes.len() as u64,
            bytes: sizes.iter().sum(),
        })
    }

    /// Copy columns `[x0, x1)` of every band row, dropping alpha.
    fn crop(&self, band: &[u8], row_bytes: usize, x0: u32, x1: u32) -> Vec<u8> {
        let c = self.channels.count();
        let (start, end) = (x0 as usize * c, x1 as usize * c);
        let mut pixels = Vec::with_capacity(band.len() / row_bytes * (end - start));
        for line in band.chunks_exact(row_bytes) {
            let span = &line[start..end];
            match self.channels {
                Channels::Rgba => {
                    for pixel in span.chunks_exact(4) {
                        pixels.extend_from_slice(&pixel[..3]);
                    }
                }
                Channels::Gray | Channels::Rgb => pixels.extend_from_slice(span),
            }
        }
        pixels
    }

    fn encode(&self, pixels: &[u8], width: u32, height: u32) -> image::ImageResult<Vec<u8>> {
        let color_type = match self.channels {
            Channels::Gray => ExtendedColorType::L8,
            Channels::Rgb | Channels::Rgba => ExtendedColorType::Rgb8,
        };
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.quality).encode(
            pixels,
            width,
            height,
            color_type,
        )?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn gradient(width: u32, height: u32, channels: Channels) -> PixelBuffer {
        let c = channels.count();
        let data = (0..height)
            .flat_map(|y| {
                (0..width).flat_map(move |x| {
                    (0..c).map(move |channel| ((x * 3 + y * 5 + channel as u32 * 40) % 256) as u8)
                })
            })
            .collect();
        PixelBuffer::new(width, height, channels, data).unwrap()
    }

    fn build(
        buffer: &PixelBuffer,
        config: PyramidConfig,
        dir: &Path,
        name: &str,
    ) -> (PyramidReport, OutputPaths) {
        let output = OutputPaths::new(dir, name, TileFormat::Jpeg);
        let report = PyramidBuilder::new(config)
            .unwrap()
            .build(&mut buffer.clone(), &output)
            .unwrap();
        (report, output)
    }

    fn tile_files(output: &OutputPaths) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for level_entry in fs::read_dir(&output.tiles_dir).unwrap() {
            let level_dir = level_entry.unwrap().path();
            for tile_entry in fs::read_dir(&level_dir).unwrap() {
                let path = tile_entry.unwrap().path();
                let key = path
                    .strip_prefix(&output.tiles_dir)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                files.push((key, fs::read(&path).unwrap()));
            }
        }
        files.sort();
        files
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        for config in [
            PyramidConfig::default().with_tile_size(300),
            PyramidConfig::default().with_quality(0),
            PyramidConfig::default().with_quality(101),
            PyramidConfig::default().with_overlap(256),
        ] {
            assert!(matches!(
                PyramidBuilder::new(config),
                Err(ConvertError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_single_pixel_gives_one_tile() {
        let temp_dir = TempDir::new().unwrap();
        let buffer = gradient(1, 1, Channels::Gray);
        let (report, output) = build(&buffer, PyramidConfig::default(), temp_dir.path(), "dot");

        assert_eq!(report.levels, 1);
        assert_eq!(report.tile_count, 1);
        assert!(output.tile_path(0, 0, 0).exists());
        assert!(output.descriptor.exists());
    }

    #[test]
    fn test_every_level_has_full_tile_grid() {
        let temp_dir = TempDir::new().unwrap();
        let buffer = gradient(300, 130, Channels::Rgb);
        let config = PyramidConfig::default().with_tile_size(128);
        let (report, output) = build(&buffer, config, temp_dir.path(), "grid");

        let geometry = PyramidGeometry::new(300, 130, 128, 0);
        assert_eq!(report.levels, 10);
        assert_eq!(report.tile_count, geometry.total_tiles());
        for level in 0..=geometry.max_level() {
            let (cols, rows) = geometry.tile_grid(level);
            let count = fs::read_dir(output.level_dir(level)).unwrap().count();
            assert_eq!(count as u32, cols * rows, "level {level}");
            for row in 0..rows {
                for col in 0..cols {
                    let rect = geometry.tile_rect(level, col, row);
                    let dims = image::image_dimensions(output.tile_path(level, col, row)).unwrap();
                    assert_eq!(dims, (rect.width, rect.height));
                }
            }
        }
    }

    #[test]
    fn test_overlap_tiles_include_borders() {
        let temp_dir = TempDir::new().unwrap();
        let buffer = gradient(300, 200, Channels::Gray);
        let config = PyramidConfig::default().with_tile_size(128).with_overlap(2);
        let (_, output) = build(&buffer, config, temp_dir.path(), "overlap");

        assert_eq!(image::image_dimensions(output.tile_path(9, 0, 0)).unwrap(), (130, 130));
        assert_eq!(image::image_dimensions(output.tile_path(9, 1, 1)).unwrap(), (132, 74));
        assert_eq!(image::image_dimensions(output.tile_path(9, 2, 0)).unwrap(), (46, 130));
        assert!(fs::read_to_string(&output.descriptor).unwrap().contains("Overlap=\"2\""));
    }

    #[test]
    fn test_strip_mode_matches_in_memory_mode() {
        let temp_dir = TempDir::new().unwrap();
        for (channels, overlap) in [(Channels::Gray, 0), (Channels::Rgb, 1), (Channels::Rgba, 3)] {
            let buffer = gradient(397, 283, channels);
            let base = PyramidConfig::default().with_tile_size(128).with_overlap(overlap);

            let (memory_report, memory) =
                build(&buffer, base.clone(), temp_dir.path(), &format!("memory_{overlap}"));
            let (strip_report, strips) = build(
                &buffer,
                base.with_strip_threshold_pixels(0),
                temp_dir.path(),
                &format!("strips_{overlap}"),
            );

            assert_eq!(memory_report, strip_report);
            assert_eq!(tile_files(&memory), tile_files(&strips));
        }
    }

    #[test]
    fn test_in_memory_build_takes_buffer_without_copy() {
        let temp_dir = TempDir::new().unwrap();
        let output = OutputPaths::new(temp_dir.path(), "taken", TileFormat::Jpeg);
        let mut buffer = gradient(40, 30, Channels::Rgb);

        let report = PyramidBuilder::new(PyramidConfig::default())
            .unwrap()
            .build(&mut buffer, &output)
            .unwrap();

        assert_eq!((report.width, report.height), (40, 30));
        assert!(buffer.data().is_empty());
        assert!(output.tile_path(6, 0, 0).exists());
    }

    #[test]
    fn test_tile_write_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocked_files");
        fs::write(&blocker, b"not a directory").unwrap();

        let output = OutputPaths::new(temp_dir.path(), "blocked", TileFormat::Jpeg);
        let result = PyramidBuilder::new(PyramidConfig::default())
            .unwrap()
            .build(&mut gradient(4, 4, Channels::Gray), &output);
        assert!(matches!(result, Err(ConvertError::OutputWrite { .. })));
        assert!(!output.descriptor.exists());
    }
}
