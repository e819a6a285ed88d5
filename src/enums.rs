use std::fmt;

/// Encoding used for every tile of a pyramid.
///
/// The descriptor's `Format` attribute and the tile file extension both come
/// from here so they cannot disagree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TileFormat {
    #[default]
    Jpeg,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Which frames of a DICOM dataset to convert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameSelector {
    /// The dataset must hold exactly one frame.
    #[default]
    Single,
    All,
    Index(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhotometricInterpretation {
    /// Low values render bright
    Monochrome1,
    /// Low values render dark
    Monochrome2,
    Rgb,
}

impl PhotometricInterpretation {
    /// Parse the attribute value, ignoring DICOM space/NUL padding.
    /// Returns `None` for interpretations this crate does not handle.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim_end_matches(['\0', ' ']).trim_start() {
            "MONOCHROME1" => Some(Self::Monochrome1),
            "MONOCHROME2" => Some(Self::Monochrome2),
            "RGB" => Some(Self::Rgb),
            _ => None,
        }
    }

    pub fn samples_per_pixel(&self) -> u16 {
        match self {
            Self::Monochrome1 | Self::Monochrome2 => 1,
            Self::Rgb => 3,
        }
    }

    pub fn should_invert(&self) -> bool {
        matches!(self, Self::Monochrome1)
    }
}
