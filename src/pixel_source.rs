//! Uniform access to decoded pixels.
//!
//! Every input, whether a PNG streamed row by row, a fully decoded JPEG or a
//! normalized DICOM frame, is exposed through [`PixelSource`] so the pyramid
//! builder only ever sees 8-bit rows with a known channel layout.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageReader};
use tracing::debug;

use crate::error::ConvertError;

/// Raster extensions accepted by [`open_source`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "tif", "webp", "gif"];

/// 256 Mi pixels, about 1 GiB of RGBA.
pub const DEFAULT_MAX_DECODED_PIXELS: u64 = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channels {
    Gray = 1,
    Rgb = 3,
    Rgba = 4,
}

impl Channels {
    pub fn count(self) -> usize {
        self as usize
    }
}

/// An immutable 8-bit image held entirely in memory, row-major, top-left origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: Channels,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Returns `None` if `data` does not hold exactly `width * height` pixels.
    pub fn new(width: u32, height: u32, channels: Channels, data: Vec<u8>) -> Option<Self> {
        let expected = width as usize * height as usize * channels.count();
        (data.len() == expected).then_some(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub(crate) fn from_raw_parts(width: u32, height: u32, channels: Channels, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * channels.count());
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    /// Convert any decoded image to the 8-bit layouts the pyramid understands.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        let (channels, data) = match image {
            DynamicImage::ImageLuma8(buffer) => (Channels::Gray, buffer.into_raw()),
            DynamicImage::ImageRgb8(buffer) => (Channels::Rgb, buffer.into_raw()),
            DynamicImage::ImageRgba8(buffer) => (Channels::Rgba, buffer.into_raw()),
            other if other.color().has_alpha() => (Channels::Rgba, other.to_rgba8().into_raw()),
            other if other.color().has_color() => (Channels::Rgb, other.to_rgb8().into_raw()),
            other => (Channels::Gray, other.to_luma8().into_raw()),
        };
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.channels.count()
    }
}

/// A readable image of known size, delivered as strips of whole rows.
///
/// Callers request strips in increasing, contiguous order starting at row 0.
/// Streaming implementations reject any other order.
pub trait PixelSource {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn channels(&self) -> Channels;

    /// Read `count` rows starting at `y`, returning `count * row_bytes()` bytes.
    fn read_rows(&mut self, y: u32, count: u32) -> Result<Vec<u8>, ConvertError>;

    fn row_bytes(&self) -> usize {
        self.width() as usize * self.channels().count()
    }

    /// Hand over the whole image without copying, if the source already
    /// holds it in memory. The source is left empty.
    fn take_buffer(&mut self) -> Option<PixelBuffer> {
        None
    }
}

impl PixelSource for PixelBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn channels(&self) -> Channels {
        self.channels
    }

    fn read_rows(&mut self, y: u32, count: u32) -> Result<Vec<u8>, ConvertError> {
        if y.checked_add(count).is_none_or(|end| end > self.height) {
            return Err(ConvertError::decode(
                "<memory>",
                format!("rows {y}..{} outside image of height {}", y as u64 + count as u64, self.height),
            ));
        }
        let row_bytes = PixelBuffer::row_bytes(self);
        let start = y as usize * row_bytes;
        Ok(self.data[start..start + count as usize * row_bytes].to_vec())
    }

    fn take_buffer(&mut self) -> Option<PixelBuffer> {
        let taken = PixelBuffer {
            data: std::mem::take(&mut self.data),
            ..*self
        };
        self.width = 0;
        self.height = 0;
        Some(taken)
    }
}

/// Decode-time limits.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Formats without streaming decode fail with `ImageTooLarge` above this.
    pub max_decoded_pixels: u64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            max_decoded_pixels: DEFAULT_MAX_DECODED_PIXELS,
        }
    }
}

impl SourceOptions {
    pub fn with_max_decoded_pixels(mut self, max_decoded_pixels: u64) -> Self {
        self.max_decoded_pixels = max_decoded_pixels;
        self
    }
}

/// Row-by-row PNG decoder; never holds more than one row of the file.
pub struct PngStripSource {
    path: PathBuf,
    reader: png::Reader<BufReader<File>>,
    width: u32,
    height: u32,
    channels: Channels,
    gray_alpha: bool,
    next_row: u32,
}

impl PngStripSource {
    /// Returns `Ok(None)` for interlaced files, whose rows arrive in passes.
    pub fn open(path: &Path) -> Result<Option<Self>, ConvertError> {
        let file = File::open(path).map_err(|e| ConvertError::decode(path, e))?;
        let mut decoder = png::Decoder::new_with_limits(
            BufReader::new(file),
            png::Limits { bytes: usize::MAX },
        );
        decoder.set_transformations(png::Transformations::normalize_to_color8());
        let reader = decoder
            .read_info()
            .map_err(|e| ConvertError::decode(path, e))?;

        let info = reader.info();
        if info.interlaced {
            return Ok(None);
        }
        let (width, height) = (info.width, info.height);
        let (color_type, _) = reader.output_color_type();
        let channels = match color_type {
            png::ColorType::Grayscale => Channels::Gray,
            png::ColorType::Rgb | png::ColorType::Indexed => Channels::Rgb,
            png::ColorType::GrayscaleAlpha | png::ColorType::Rgba => Channels::Rgba,
        };
        debug!(
            "Streaming {} ({}x{}, {:?})",
            path.display(),
            width,
            height,
            color_type
        );

        Ok(Some(Self {
            path: path.to_path_buf(),
            reader,
            width,
            height,
            channels,
            gray_alpha: color_type == png::ColorType::GrayscaleAlpha,
            next_row: 0,
        }))
    }
}

impl PixelSource for PngStripSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn channels(&self) -> Channels {
        self.channels
    }

    fn read_rows(&mut self, y: u32, count: u32) -> Result<Vec<u8>, ConvertError> {
        if y != self.next_row || y as u64 + count as u64 > self.height as u64 {
            return Err(ConvertError::decode(
                &self.path,
                format!(
                    "rows {y}..{} requested, next readable row is {}",
                    y as u64 + count as u64,
                    self.next_row
                ),
            ));
        }

        let row_bytes = PixelSource::row_bytes(self);
        let mut strip = Vec::with_capacity(row_bytes * count as usize);
        for _ in 0..count {
            let row = self
                .reader
                .next_row()
                .map_err(|e| ConvertError::decode(&self.path, e))?
                .ok_or_else(|| ConvertError::decode(&self.path, "image data ended early"))?;
            if self.gray_alpha {
                for pair in row.data().chunks_exact(2) {
                    strip.extend_from_slice(&[pair[0], pair[0], pair[0], pair[1]]);
                }
            } else {
                strip.extend_from_slice(row.data());
            }
        }
        if strip.len() != row_bytes * count as usize {
            return Err(ConvertError::decode(&self.path, "unexpected row length"));
        }

        self.next_row += count;
        Ok(strip)
    }
}

/// Open a raster file as a pixel source.
///
/// Non-interlaced PNGs stream; everything else is decoded whole after a
/// dimension check against `options.max_decoded_pixels`.
pub fn open_source(
    path: &Path,
    options: &SourceOptions,
) -> Result<Box<dyn PixelSource>, ConvertError> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!(
                "extension {extension:?} is not one of {}",
                SUPPORTED_EXTENSIONS.join(", ")
            ),
        });
    }

    if extension == "png" {
        if let Some(source) = PngStripSource::open(path)? {
            return Ok(Box::new(source));
        }
        debug!("{} is interlaced, decoding whole image", path.display());
    }

    Ok(Box::new(decode_whole(path, options)?))
}

/// Fully decode `path` with the `image` crate, refusing oversized images
/// before any pixel allocation.
pub fn decode_whole(path: &Path, options: &SourceOptions) -> Result<PixelBuffer, ConvertError> {
    let reader = open_reader(path)?;
    if reader.format().is_none() {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "unrecognised image content".to_string(),
        });
    }
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| image_error(path, e))?;

    if width as u64 * height as u64 > options.max_decoded_pixels {
        return Err(ConvertError::ImageTooLarge {
            path: path.to_path_buf(),
            width,
            height,
            limit: options.max_decoded_pixels,
        });
    }

    let mut reader = open_reader(path)?;
    reader.no_limits();
    let image = reader.decode().map_err(|e| image_error(path, e))?;
    Ok(PixelBuffer::from_dynamic(image))
}

fn open_reader(path: &Path) -> Result<ImageReader<BufReader<File>>, ConvertError> {
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| ConvertError::decode(path, e))
}

fn image_error(path: &Path, error: ImageError) -> ConvertError {
    match error {
        ImageError::Unsupported(e) => ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        other => ConvertError::decode(path, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, ImageBuffer, LumaA, Rgb, RgbImage};
    use tempfile::TempDir;

    fn gradient_rgb(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 7]))
    }

    #[test]
    fn test_pixel_buffer_rejects_wrong_length() {
        assert!(PixelBuffer::new(2, 2, Channels::Rgb, vec![0; 11]).is_none());
        assert!(PixelBuffer::new(2, 2, Channels::Rgb, vec![0; 12]).is_some());
    }

    #[test]
    fn test_pixel_buffer_read_rows() {
        let data: Vec<u8> = (0..12).collect();
        let mut buffer = PixelBuffer::new(3, 4, Channels::Gray, data).unwrap();
        assert_eq!(buffer.read_rows(1, 2).unwrap(), vec![3, 4, 5, 6, 7, 8]);
        assert!(buffer.read_rows(3, 2).is_err());
    }

    #[test]
    fn test_take_buffer_moves_pixels_out() {
        let data: Vec<u8> = (0..6).collect();
        let mut buffer = PixelBuffer::new(2, 1, Channels::Rgb, data.clone()).unwrap();

        let taken = buffer.take_buffer().unwrap();
        assert_eq!((taken.width(), taken.height()), (2, 1));
        assert_eq!(taken.into_raw(), data);
        assert_eq!((buffer.width(), buffer.height()), (0, 0));
        assert!(buffer.data().is_empty());
        assert!(buffer.read_rows(0, 1).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let result = open_source(Path::new("scan.xyz"), &SourceOptions::default());
        assert!(matches!(result, Err(ConvertError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_png_streams_rows_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gradient.png");
        let image = gradient_rgb(5, 3);
        image.save(&path).unwrap();

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!((source.width(), source.height()), (5, 3));
        assert_eq!(source.channels(), Channels::Rgb);

        let mut rows = source.read_rows(0, 2).unwrap();
        rows.extend(source.read_rows(2, 1).unwrap());
        assert_eq!(rows, image.into_raw());
    }

    #[test]
    fn test_png_rejects_out_of_order_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gradient.png");
        gradient_rgb(4, 4).save(&path).unwrap();

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert!(matches!(
            source.read_rows(2, 1),
            Err(ConvertError::Decode { .. })
        ));
    }

    #[test]
    fn test_png_gray_alpha_expands_to_rgba() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mask.png");
        GrayAlphaImage::from_pixel(2, 1, LumaA([90, 200]))
            .save(&path)
            .unwrap();

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!(source.channels(), Channels::Rgba);
        assert_eq!(
            source.read_rows(0, 1).unwrap(),
            vec![90, 90, 90, 200, 90, 90, 90, 200]
        );
    }

    fn write_indexed_png(path: &Path, with_transparency: bool) {
        let file = std::fs::File::create(path).unwrap();
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), 3, 2);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(vec![255, 0, 0, 0, 255, 0, 0, 0, 255]);
        if with_transparency {
            encoder.set_trns(vec![255, 128, 0]);
        }
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[0, 1, 2, 2, 1, 0]).unwrap();
    }

    fn read_all(source: &mut dyn PixelSource) -> Vec<u8> {
        let height = source.height();
        source.read_rows(0, height).unwrap()
    }

    #[test]
    fn test_png_palette_expands_to_rgb() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("palette.png");
        write_indexed_png(&path, false);

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!(source.channels(), Channels::Rgb);
        let expected = image::open(&path).unwrap().to_rgb8().into_raw();
        assert_eq!(read_all(source.as_mut()), expected);
    }

    #[test]
    fn test_png_palette_transparency_expands_to_rgba() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("palette_trns.png");
        write_indexed_png(&path, true);

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!(source.channels(), Channels::Rgba);
        let expected = image::open(&path).unwrap().to_rgba8().into_raw();
        assert_eq!(read_all(source.as_mut()), expected);
    }

    #[test]
    fn test_png_sixteen_bit_reduced_to_eight() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deep.png");
        // Multiples of 257 so high-byte stripping and rescaling agree.
        ImageBuffer::<Rgb<u16>, Vec<u16>>::from_fn(4, 3, |x, y| {
            Rgb([(x * 60) as u16 * 257, (y * 90) as u16 * 257, 7 * 257])
        })
        .save(&path)
        .unwrap();

        let mut source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!(source.channels(), Channels::Rgb);
        let expected = image::open(&path).unwrap().to_rgb8().into_raw();
        assert_eq!(read_all(source.as_mut()), expected);
    }

    #[test]
    fn test_whole_decode_respects_pixel_limit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.bmp");
        gradient_rgb(10, 10).save(&path).unwrap();

        let options = SourceOptions::default().with_max_decoded_pixels(50);
        let result = open_source(&path, &options);
        assert!(matches!(
            result,
            Err(ConvertError::ImageTooLarge {
                width: 10,
                height: 10,
                limit: 50,
                ..
            })
        ));

        let source = open_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!((source.width(), source.height()), (10, 10));
    }

    #[test]
    fn test_corrupt_file_is_decode_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let result = open_source(&path, &SourceOptions::default());
        assert!(matches!(result, Err(ConvertError::Decode { .. })));
    }
}
