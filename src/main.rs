//! Convert an image or DICOM file into a Deep Zoom tile pyramid.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dicom_dzi::{
    ConvertError, ConvertOptions, FrameSelector, NormalizeOptions, convert, convert::is_dicom_path,
    convert_dicom,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert large images and DICOM scans into Deep Zoom (DZI) tile pyramids"
)]
struct Args {
    #[arg(help = "Input image (png, jpg, jpeg, bmp, tiff, tif, webp, gif) or DICOM file")]
    input: PathBuf,

    #[arg(help = "Output name, defaults to the input file stem")]
    output_name: Option<String>,

    #[arg(
        short = 'o',
        long,
        default_value = "output/dzi",
        help = "Directory receiving <name>.dzi and <name>_files/"
    )]
    output_dir: PathBuf,

    #[arg(
        short = 't',
        long,
        default_value = "256",
        value_parser = clap::value_parser!(u32),
        help = "Tile edge length in pixels: 128, 256 or 512"
    )]
    tile_size: u32,

    #[arg(
        short = 'q',
        long,
        default_value = "90",
        value_parser = clap::value_parser!(u8).range(1..=100),
        help = "JPEG quality"
    )]
    quality: u8,

    #[arg(long, default_value = "0", help = "Pixels shared with neighbouring tiles")]
    overlap: u32,

    #[arg(long, help = "Convert every frame of a multi-frame DICOM file")]
    all_frames: bool,

    #[arg(
        long,
        value_name = "N",
        conflicts_with = "all_frames",
        help = "Convert a single frame (0-indexed) of a multi-frame DICOM file"
    )]
    frame: Option<u32>,

    #[arg(long, help = "Fail on existing outputs and skip existing frames")]
    no_overwrite: bool,

    #[arg(long, help = "Ignore the DICOM window and stretch the full value range")]
    no_window: bool,

    #[arg(long, help = "Write grayscale DICOM frames as RGB tiles")]
    rgb: bool,
}

impl Args {
    fn options(&self) -> ConvertOptions {
        ConvertOptions::default()
            .with_output_dir(&self.output_dir)
            .with_tile_size(self.tile_size)
            .with_quality(self.quality)
            .with_overlap(self.overlap)
            .with_overwrite(!self.no_overwrite)
            .with_normalize(NormalizeOptions {
                use_window: !self.no_window,
                rgb_output: self.rgb,
            })
    }

    fn frame_selector(&self) -> FrameSelector {
        match (self.all_frames, self.frame) {
            (true, _) => FrameSelector::All,
            (false, Some(index)) => FrameSelector::Index(index),
            (false, None) => FrameSelector::Single,
        }
    }
}

fn run(args: &Args) -> Result<(), ConvertError> {
    let options = args.options();
    let output_name = args.output_name.as_deref();

    if is_dicom_path(&args.input) {
        let conversion = convert_dicom(&args.input, output_name, &options, args.frame_selector())?;
        info!(
            "Converted {} of {} frame(s), skipped {}",
            conversion.frames.len(),
            conversion.total_frames,
            conversion.skipped_frames.len()
        );
        if let Some(series_path) = &conversion.series_path {
            info!(
                "Open {}/{}_frame_*.dzi, series in {}",
                options.output_dir.display(),
                conversion.base_name,
                series_path.display()
            );
        }
    } else {
        let output = convert(&args.input, output_name, &options)?;
        info!("Open {} in a Deep Zoom viewer", output.descriptor_path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_tile_size_reaches_validation() {
        let args = Args::try_parse_from(["dicom-dzi", "scan.png", "--tile-size", "300"]).unwrap();
        assert_eq!(args.tile_size, 300);
        assert!(matches!(
            args.options().pyramid_config().validate(),
            Err(ConvertError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_flags_map_onto_options() {
        let args = Args::try_parse_from([
            "dicom-dzi",
            "cine.dcm",
            "--frame",
            "3",
            "--no-overwrite",
            "--no-window",
            "--rgb",
        ])
        .unwrap();
        let options = args.options();
        assert_eq!(args.frame_selector(), FrameSelector::Index(3));
        assert!(!options.overwrite);
        assert!(!options.normalize.use_window);
        assert!(options.normalize.rgb_output);
        assert!(options.pyramid_config().validate().is_ok());
    }
}
