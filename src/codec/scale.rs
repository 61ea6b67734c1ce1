//! Downscale and pixel-format conversion.
//!
//! Runs after decode when the bot asked for smaller dimensions than the
//! source delivers. Packed formats are resized with a nearest-neighbour
//! scaler into buffers loaned from the pipeline's [`FramePool`]; frames
//! already small enough pass through untouched.

use std::rc::Rc;

use tracing::warn;

use crate::media::{FramePool, ImageFrame, PixelFormat};
use crate::streams::{map, Map};

/// Resize packed frames larger than `width x height` and convert them to
/// `format`, writing into buffers from `pool`.
///
/// Planar inputs pass through unscaled; converting between planar and
/// packed layouts belongs to the decoder, which can ask its codec for the
/// packed format directly.
pub fn downscale(
    width: u32,
    height: u32,
    format: PixelFormat,
    pool: FramePool,
) -> Map<impl FnMut(ImageFrame) -> ImageFrame> {
    map(move |frame: ImageFrame| {
        if frame.width <= width && frame.height <= height && frame.pixel_format == format {
            return frame;
        }
        match convert_packed(&frame, width, height, format, &pool) {
            Some(converted) => converted,
            None => {
                warn!(
                    from = ?frame.pixel_format,
                    to = ?format,
                    "unsupported conversion, passing frame through"
                );
                frame
            }
        }
    })
}

fn convert_packed(
    frame: &ImageFrame,
    max_width: u32,
    max_height: u32,
    format: PixelFormat,
    pool: &FramePool,
) -> Option<ImageFrame> {
    let src_bpp = frame.pixel_format.bytes_per_pixel()?;
    let dst_bpp = format.bytes_per_pixel()?;

    // Fit inside the requested box, preserving aspect ratio and never
    // upscaling.
    let scale_w = f64::from(max_width) / f64::from(frame.width);
    let scale_h = f64::from(max_height) / f64::from(frame.height);
    let scale = scale_w.min(scale_h).min(1.0);
    let out_width = ((f64::from(frame.width) * scale) as u32).max(1);
    let out_height = ((f64::from(frame.height) * scale) as u32).max(1);

    let src = frame.primary_plane();
    let src_stride = frame.strides[0] as usize;
    let dst_stride = out_width as usize * dst_bpp;
    let mut buffer = pool.acquire(dst_stride * out_height as usize);

    {
        let dst: &mut [u8] = &mut buffer;
        for y in 0..out_height as usize {
            let sy = y * frame.height as usize / out_height as usize;
            let src_row = &src[sy * src_stride..];
            let dst_row = &mut dst[y * dst_stride..(y + 1) * dst_stride];
            for x in 0..out_width as usize {
                let sx = x * frame.width as usize / out_width as usize;
                let pixel = &src_row[sx * src_bpp..sx * src_bpp + src_bpp];
                let out = &mut dst_row[x * dst_bpp..(x + 1) * dst_bpp];
                write_pixel(pixel, frame.pixel_format, out, format);
            }
        }
    }

    Some(ImageFrame::packed(
        frame.id,
        out_width,
        out_height,
        format,
        Rc::new(buffer),
        dst_stride as u32,
    ))
}

/// Convert one pixel between packed layouts. Inputs were validated to be
/// packed by `bytes_per_pixel`.
fn write_pixel(src: &[u8], from: PixelFormat, dst: &mut [u8], to: PixelFormat) {
    let (r, g, b) = match from {
        PixelFormat::Rgb24 | PixelFormat::Rgb0 => (src[0], src[1], src[2]),
        PixelFormat::Bgr24 | PixelFormat::Bgr0 => (src[2], src[1], src[0]),
        PixelFormat::Yuv420p => unreachable!("planar input rejected earlier"),
    };
    match to {
        PixelFormat::Rgb24 => dst.copy_from_slice(&[r, g, b]),
        PixelFormat::Bgr24 => dst.copy_from_slice(&[b, g, r]),
        PixelFormat::Rgb0 => dst.copy_from_slice(&[r, g, b, 0]),
        PixelFormat::Bgr0 => dst.copy_from_slice(&[b, g, r, 0]),
        PixelFormat::Yuv420p => unreachable!("planar output rejected earlier"),
    }
}
