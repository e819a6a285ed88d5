use rayon::prelude::*;

use crate::pixel_source::{Channels, PixelBuffer};

pub(crate) struct Downsampler;

impl Downsampler {
    /// Width of the row produced from a row of `width` pixels.
    #[inline]
    pub(crate) fn half(extent: u32) -> u32 {
        extent.div_ceil(2).max(1)
    }

    /// Box-average a pair of rows into one row of half the width.
    ///
    /// `bottom` is `None` for the last row of an odd-height level. Pixels past
    /// the right edge of an odd-width row are not sampled; only the available
    /// ones are averaged, rounding to nearest.
    pub(crate) fn downsample_rows(
        top: &[u8],
        bottom: Option<&[u8]>,
        width: u32,
        channels: Channels,
        out: &mut [u8],
    ) {
        let c = channels.count();
        let width = width as usize;
        debug_assert_eq!(top.len(), width * c);
        debug_assert_eq!(out.len(), Self::half(width as u32) as usize * c);

        for (out_x, out_pixel) in out.chunks_exact_mut(c).enumerate() {
            let x0 = out_x * 2;
            let x1 = (x0 + 2).min(width);
            let rows = if bottom.is_some() { 2 } else { 1 };
            let samples = ((x1 - x0) * rows) as u32;

            for (channel, value) in out_pixel.iter_mut().enumerate() {
                let mut sum = 0u32;
                for x in x0..x1 {
                    sum += top[x * c + channel] as u32;
                    if let Some(bottom) = bottom {
                        sum += bottom[x * c + channel] as u32;
                    }
                }
                *value = ((sum + samples / 2) / samples) as u8;
            }
        }
    }

    /// Derive the next coarser level from a whole level image.
    pub(crate) fn downsample_level(level: &PixelBuffer) -> PixelBuffer {
        let (width, height) = (level.width(), level.height());
        let channels = level.channels();
        let out_width = Self::half(width);
        let out_height = Self::half(height);
        let row_bytes = level.row_bytes();
        let out_row_bytes = out_width as usize * channels.count();

        let mut data = vec![0u8; out_row_bytes * out_height as usize];
        data.par_chunks_mut(out_row_bytes)
            .enumerate()
            .for_each(|(out_y, out_row)| {
                let y = out_y * 2;
                let top = &level.data()[y * row_bytes..(y + 1) * row_bytes];
                let bottom = (y + 1 < height as usize)
                    .then(|| &level.data()[(y + 1) * row_bytes..(y + 2) * row_bytes]);
                Self::downsample_rows(top, bottom, width, channels, out_row);
            });

        PixelBuffer::from_raw_parts(out_width, out_height, channels, data)
    }
}
