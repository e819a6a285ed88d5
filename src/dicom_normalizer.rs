use std::ops::Range;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions as SampleOptions, ModalityLutOption, PixelDecoder};
use dicom_dictionary_std::{tags, uids};
use ndarray::{Array3, Axis};
use serde::Serialize;
use tracing::debug;

use crate::enums::PhotometricInterpretation;
use crate::error::ConvertError;
use crate::pixel_source::{Channels, PixelBuffer, SourceOptions};

/// One VOI window (center/width pair).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

/// Image pixel module attributes shared by every frame of a dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameAttributes {
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    /// Pixel Representation 1 (two's complement samples)
    pub signed: bool,
    pub number_of_frames: u32,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
    /// All window center/width pairs in dataset order
    pub windows: Vec<WindowLevel>,
    pub photometric: String,
}

impl FrameAttributes {
    /// Unsigned 8-bit, single-frame attributes without rescale or window.
    pub fn new(rows: u32, columns: u32, photometric: &str) -> Self {
        let samples_per_pixel = PhotometricInterpretation::parse(photometric)
            .map(|p| p.samples_per_pixel())
            .unwrap_or(1);
        Self {
            rows,
            columns,
            samples_per_pixel,
            bits_allocated: 8,
            bits_stored: 8,
            signed: false,
            number_of_frames: 1,
            rescale_slope: 1.0,
            rescale_intercept: 0.0,
            windows: Vec::new(),
            photometric: photometric.to_string(),
        }
    }
}

/// Descriptive attributes recorded alongside converted series.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DicomMetadata {
    pub patient_id: String,
    pub patient_name: String,
    pub study_date: String,
    pub study_description: String,
    pub modality: String,
    pub rows: u32,
    pub columns: u32,
    pub bits_stored: u16,
    pub photometric: String,
}

const UNKNOWN: &str = "Unknown";

/// Instance UID given to datasets assembled in memory.
const IN_MEMORY_INSTANCE_UID: &str = "2.25.1";

/// A parsed DICOM dataset. Pixel data stays encoded until a frame is
/// normalized.
pub struct DicomDataset {
    path: PathBuf,
    attributes: FrameAttributes,
    metadata: DicomMetadata,
    object: DefaultDicomObject,
    has_pixel_data: bool,
}

impl DicomDataset {
    /// Read a DICOM file and its attributes.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the file cannot be parsed and `ImageTooLarge` if
    /// one frame holds more than `options.max_decoded_pixels` pixels. A
    /// dataset without pixel data loads fine and fails later in
    /// [`DicomNormalizer::normalize_frame`].
    pub fn open(path: impl AsRef<Path>, options: &SourceOptions) -> Result<Self, ConvertError> {
        let path = path.as_ref();
        let dicom_object = open_file(path).map_err(|e| ConvertError::decode(path, e))?;
        Self::from_dicom_object(path, dicom_object, options)
    }

    pub fn from_dicom_object(
        path: impl AsRef<Path>,
        dicom_object: DefaultDicomObject,
        options: &SourceOptions,
    ) -> Result<Self, ConvertError> {
        let dataset = Self::from_object(path.as_ref(), dicom_object);
        let attributes = &dataset.attributes;
        if dataset.has_pixel_data
            && attributes.rows as u64 * attributes.columns as u64 > options.max_decoded_pixels
        {
            return Err(ConvertError::ImageTooLarge {
                path: dataset.path,
                width: attributes.columns,
                height: attributes.rows,
                limit: options.max_decoded_pixels,
            });
        }
        Ok(dataset)
    }

    /// Assemble a dataset from attributes and native little-endian samples
    /// of all frames, back to back.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the attributes do not fit their DICOM value
    /// representations.
    pub fn from_parts(
        path: impl Into<PathBuf>,
        attributes: FrameAttributes,
        pixel_data: Option<Vec<u8>>,
    ) -> Result<Self, ConvertError> {
        let path = path.into();
        let narrow = |value: u32, name: &str| {
            u16::try_from(value)
                .map_err(|_| ConvertError::decode(&path, format!("{name} {value} exceeds 65535")))
        };

        let mut object = InMemDicomObject::new_empty();
        let mut put_us = |tag: Tag, value: u16| {
            object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        };
        put_us(tags::ROWS, narrow(attributes.rows, "rows")?);
        put_us(tags::COLUMNS, narrow(attributes.columns, "columns")?);
        put_us(tags::SAMPLES_PER_PIXEL, attributes.samples_per_pixel);
        put_us(tags::BITS_ALLOCATED, attributes.bits_allocated);
        put_us(tags::BITS_STORED, attributes.bits_stored);
        put_us(tags::HIGH_BIT, attributes.bits_stored.saturating_sub(1));
        put_us(tags::PIXEL_REPRESENTATION, u16::from(attributes.signed));
        if attributes.samples_per_pixel > 1 {
            put_us(tags::PLANAR_CONFIGURATION, 0);
        }

        object.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from(attributes.photometric.as_str()),
        ));
        object.put(DataElement::new(
            tags::NUMBER_OF_FRAMES,
            VR::IS,
            PrimitiveValue::from(attributes.number_of_frames.to_string()),
        ));
        object.put(DataElement::new(
            tags::RESCALE_SLOPE,
            VR::DS,
            PrimitiveValue::from(attributes.rescale_slope),
        ));
        object.put(DataElement::new(
            tags::RESCALE_INTERCEPT,
            VR::DS,
            PrimitiveValue::from(attributes.rescale_intercept),
        ));
        if !attributes.windows.is_empty() {
            object.put(DataElement::new(
                tags::WINDOW_CENTER,
                VR::DS,
                PrimitiveValue::F64(attributes.windows.iter().map(|w| w.center).collect()),
            ));
            object.put(DataElement::new(
                tags::WINDOW_WIDTH,
                VR::DS,
                PrimitiveValue::F64(attributes.windows.iter().map(|w| w.width).collect()),
            ));
        }

        if let Some(bytes) = pixel_data {
            let (vr, value) = match attributes.bits_allocated {
                16 => (
                    VR::OW,
                    PrimitiveValue::U16(bytemuck::pod_collect_to_vec::<u8, u16>(&bytes).into()),
                ),
                32 => (
                    VR::OL,
                    PrimitiveValue::U32(bytemuck::pod_collect_to_vec::<u8, u32>(&bytes).into()),
                ),
                _ => (VR::OB, PrimitiveValue::from(bytes)),
            };
            object.put(DataElement::new(tags::PIXEL_DATA, vr, value));
        }

        let object = object
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(IN_MEMORY_INSTANCE_UID),
            )
            .map_err(|e| ConvertError::decode(&path, e))?;
        Ok(Self::from_object(&path, object))
    }

    fn from_object(path: &Path, dicom_object: DefaultDicomObject) -> Self {
        let attributes = Self::read_attributes(&dicom_object);
        let metadata = DicomMetadata {
            patient_id: read_string(&dicom_object, tags::PATIENT_ID),
            patient_name: read_string(&dicom_object, tags::PATIENT_NAME),
            study_date: read_string(&dicom_object, tags::STUDY_DATE),
            study_description: read_string(&dicom_object, tags::STUDY_DESCRIPTION),
            modality: read_string(&dicom_object, tags::MODALITY),
            rows: attributes.rows,
            columns: attributes.columns,
            bits_stored: attributes.bits_stored,
            photometric: attributes.photometric.clone(),
        };
        let has_pixel_data = dicom_object.element(tags::PIXEL_DATA).is_ok();

        debug!(
            "Loaded {}: {}x{}, {} frame(s), {} bits, {}",
            path.display(),
            attributes.columns,
            attributes.rows,
            attributes.number_of_frames,
            attributes.bits_allocated,
            attributes.photometric
        );

        Self {
            path: path.to_path_buf(),
            attributes,
            metadata,
            object: dicom_object,
            has_pixel_data,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn attributes(&self) -> &FrameAttributes {
        &self.attributes
    }

    pub fn metadata(&self) -> &DicomMetadata {
        &self.metadata
    }

    pub fn frame_count(&self) -> u32 {
        self.attributes.number_of_frames.max(1)
    }

    fn read_attributes(dicom_object: &InMemDicomObject) -> FrameAttributes {
        let bits_allocated = read_u16(dicom_object, tags::BITS_ALLOCATED).unwrap_or(8);
        let photometric = dicom_object
            .element(tags::PHOTOMETRIC_INTERPRETATION)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
            .unwrap_or_else(|| "MONOCHROME2".to_string());

        let centers = read_multi_f64(dicom_object, tags::WINDOW_CENTER);
        let widths = read_multi_f64(dicom_object, tags::WINDOW_WIDTH);
        let windows = centers
            .into_iter()
            .zip(widths)
            .map(|(center, width)| WindowLevel { center, width })
            .collect();

        FrameAttributes {
            rows: read_u32(dicom_object, tags::ROWS).unwrap_or(0),
            columns: read_u32(dicom_object, tags::COLUMNS).unwrap_or(0),
            samples_per_pixel: read_u16(dicom_object, tags::SAMPLES_PER_PIXEL).unwrap_or(1),
            bits_allocated,
            bits_stored: read_u16(dicom_object, tags::BITS_STORED).unwrap_or(bits_allocated),
            signed: read_u16(dicom_object, tags::PIXEL_REPRESENTATION) == Some(1),
            number_of_frames: read_u32(dicom_object, tags::NUMBER_OF_FRAMES)
                .unwrap_or(1)
                .max(1),
            rescale_slope: read_f64(dicom_object, tags::RESCALE_SLOPE).unwrap_or(1.0),
            rescale_intercept: read_f64(dicom_object, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
            windows,
            photometric,
        }
    }
}

fn read_u16(dicom_object: &InMemDicomObject, tag: Tag) -> Option<u16> {
    dicom_object.element(tag).ok()?.to_int::<u16>().ok()
}

fn read_u32(dicom_object: &InMemDicomObject, tag: Tag) -> Option<u32> {
    dicom_object.element(tag).ok()?.to_int::<u32>().ok()
}

fn read_f64(dicom_object: &InMemDicomObject, tag: Tag) -> Option<f64> {
    dicom_object.element(tag).ok()?.to_float64().ok()
}

fn read_multi_f64(dicom_object: &InMemDicomObject, tag: Tag) -> Vec<f64> {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .unwrap_or_default()
}

fn read_string(dicom_object: &InMemDicomObject, tag: Tag) -> String {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Use the dataset's first VOI window when present instead of a full
    /// dynamic-range stretch.
    pub use_window: bool,
    /// Replicate grayscale frames to three channels.
    pub rgb_output: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            use_window: true,
            rgb_output: false,
        }
    }
}

pub struct DicomNormalizer;

impl DicomNormalizer {
    /// Frame indices of `dataset`. The range is cheap to clone, so the
    /// sequence can be restarted at will.
    pub fn list_frames(dataset: &DicomDataset) -> Range<u32> {
        0..dataset.frame_count()
    }

    /// Produce the 8-bit display image of one frame.
    ///
    /// Only the requested frame is decoded. Samples are rescaled with
    /// slope/intercept, mapped from the display range (window or min/max)
    /// onto 0-255 and inverted for MONOCHROME1.
    ///
    /// # Errors
    ///
    /// `MissingPixelData`, `FrameIndexOutOfRange`, `Decode` when the frame
    /// cannot be decoded, or `UnsupportedPhotometric` for decoded samples
    /// that are neither grayscale nor RGB.
    pub fn normalize_frame(
        dataset: &DicomDataset,
        frame_index: u32,
        options: &NormalizeOptions,
    ) -> Result<PixelBuffer, ConvertError> {
        let path = dataset.path();
        let attributes = dataset.attributes();
        if !dataset.has_pixel_data {
            return Err(ConvertError::MissingPixelData {
                path: path.to_path_buf(),
            });
        }

        let count = dataset.frame_count();
        if frame_index >= count {
            return Err(ConvertError::FrameIndexOutOfRange {
                path: path.to_path_buf(),
                index: frame_index,
                count,
            });
        }

        let decoded = dataset
            .object
            .decode_pixel_data_frame(frame_index)
            .map_err(|e| ConvertError::decode(path, e))?;

        // Compressed YBR data comes out of the decoder as RGB.
        let interpretation = decoded.photometric_interpretation().as_str();
        let samples_per_pixel = decoded.samples_per_pixel();
        let photometric = PhotometricInterpretation::parse(interpretation)
            .filter(|p| p.samples_per_pixel() == samples_per_pixel)
            .ok_or_else(|| ConvertError::UnsupportedPhotometric {
                path: path.to_path_buf(),
                interpretation: format!(
                    "{interpretation} with {samples_per_pixel} sample(s) per pixel"
                ),
            })?;

        let sample_options = SampleOptions::new().with_modality_lut(ModalityLutOption::None);
        let mut samples: Array3<f64> = decoded
            .to_ndarray_with_options::<f64>(&sample_options)
            .map_err(|e| ConvertError::decode(path, e))?
            .index_axis_move(Axis(0), 0);

        let (slope, intercept) = (attributes.rescale_slope, attributes.rescale_intercept);
        samples.par_mapv_inplace(|v| v.mul_add(slope, intercept));

        let (low, high) = Self::display_range(&samples, attributes, options);
        let invert = photometric.should_invert();
        let display = samples.mapv(|v| Self::to_display(v, low, high, invert));

        let (rows, columns, _) = display.dim();
        let (channels, data) = match photometric {
            PhotometricInterpretation::Rgb => (Channels::Rgb, display.iter().copied().collect()),
            _ if options.rgb_output => (
                Channels::Rgb,
                display.iter().flat_map(|&v| [v, v, v]).collect(),
            ),
            _ => (Channels::Gray, display.iter().copied().collect()),
        };

        Ok(PixelBuffer::from_raw_parts(
            columns as u32,
            rows as u32,
            channels,
            data,
        ))
    }

    /// `[low, high]` mapped onto 0-255.
    fn display_range(
        samples: &Array3<f64>,
        attributes: &FrameAttributes,
        options: &NormalizeOptions,
    ) -> (f64, f64) {
        if options.use_window {
            if let Some(window) = attributes.windows.first().filter(|w| w.width > 0.0) {
                let half = window.width / 2.0;
                return (window.center - half, window.center + half);
            }
        }
        samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), &v| {
                (low.min(v), high.max(v))
            })
    }

    #[inline]
    fn to_display(value: f64, low: f64, high: f64, invert: bool) -> u8 {
        let mapped = if high > low {
            ((value - low) / (high - low) * 255.0).round().clamp(0.0, 255.0) as u8
        } else {
            0
        };
        if invert { 255 - mapped } else { mapped }
    }
}
