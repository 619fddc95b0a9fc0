//! Pure thumbnail codec: decode, bound to the pixel budget, re-encode.

use std::sync::Arc;

use fast_image_resize::images::Image as FastImage;
use fast_image_resize::{PixelType, ResizeOptions, Resizer};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType};
use zune_jpeg::JpegDecoder as ZuneDecoder;

use crate::error::ThumbnailError;

/// Encoded, resized thumbnail. Owned by the bitmap cache once stored;
/// the byte buffer is shared out to display handles via the `Arc`.
#[derive(Debug, Clone)]
pub struct CachedBitmap {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

/// Decode `bytes`, scale the longer side down to `max_px` (no-op when the
/// image already fits), and re-encode as JPEG at `quality`.
pub fn create_thumbnail(
    name: &str,
    bytes: &[u8],
    max_px: u32,
    quality: u8,
) -> Result<CachedBitmap, ThumbnailError> {
    let decoded = decode_image(name, bytes)?;
    let rgb = decoded.to_rgb8();
    let (w, h) = (rgb.width(), rgb.height());
    if w == 0 || h == 0 {
        return Err(ThumbnailError::Decode {
            name: name.to_string(),
            reason: "zero-sized image".to_string(),
        });
    }

    let (target_w, target_h) = target_dimensions(w, h, max_px);

    let (out_w, out_h, pixels) = if (target_w, target_h) == (w, h) {
        (w, h, rgb.into_raw())
    } else {
        let resized = resize_rgb(name, w, h, rgb.into_raw(), target_w, target_h)?;
        (target_w, target_h, resized)
    };

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality)
        .encode(&pixels, out_w, out_h, ExtendedColorType::Rgb8)
        .map_err(|e| ThumbnailError::Context {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    Ok(CachedBitmap { data: encoded.into(), width: out_w, height: out_h })
}

/// Scale the longer of (w, h) down to `max_px`, preserving aspect ratio.
fn target_dimensions(w: u32, h: u32, max_px: u32) -> (u32, u32) {
    let longer = w.max(h);
    if longer <= max_px {
        return (w, h);
    }
    let scale = max_px as f64 / longer as f64;
    let new_w = ((w as f64 * scale).round() as u32).max(1);
    let new_h = ((h as f64 * scale).round() as u32).max(1);
    (new_w, new_h)
}

/// JPEGs go through zune-jpeg first (much faster than the generic path);
/// everything else, and any zune failure, falls back to the image crate.
fn decode_image(name: &str, bytes: &[u8]) -> Result<DynamicImage, ThumbnailError> {
    if is_jpeg(name, bytes)
        && let Some(img) = decode_jpeg_fast(bytes)
    {
        return Ok(img);
    }

    image::load_from_memory(bytes).map_err(|e| ThumbnailError::Decode {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn is_jpeg(name: &str, bytes: &[u8]) -> bool {
    let ext_jpeg = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false);
    ext_jpeg || bytes.starts_with(&[0xFF, 0xD8])
}

fn decode_jpeg_fast(bytes: &[u8]) -> Option<DynamicImage> {
    let mut zune = ZuneDecoder::new(std::io::Cursor::new(bytes));
    let pixels = zune.decode().ok()?;
    let info = zune.info()?;
    let w = info.width as u32;
    let h = info.height as u32;
    let len = pixels.len();

    // Zune's output layout depends on the source colorspace; the buffer
    // length tells grayscale, RGB, and RGBA apart.
    if len == (w * h) as usize {
        image::ImageBuffer::<image::Luma<u8>, _>::from_raw(w, h, pixels)
            .map(DynamicImage::ImageLuma8)
    } else if len == (w * h * 3) as usize {
        image::ImageBuffer::<image::Rgb<u8>, _>::from_raw(w, h, pixels)
            .map(DynamicImage::ImageRgb8)
    } else if len == (w * h * 4) as usize {
        image::ImageBuffer::<image::Rgba<u8>, _>::from_raw(w, h, pixels)
            .map(DynamicImage::ImageRgba8)
    } else {
        None
    }
}

fn resize_rgb(
    name: &str,
    w: u32,
    h: u32,
    pixels: Vec<u8>,
    target_w: u32,
    target_h: u32,
) -> Result<Vec<u8>, ThumbnailError> {
    let src = FastImage::from_vec_u8(w, h, pixels, PixelType::U8x3).map_err(|e| {
        ThumbnailError::Context { name: name.to_string(), reason: e.to_string() }
    })?;
    let mut dst = FastImage::new(target_w, target_h, PixelType::U8x3);

    let mut resizer = Resizer::new();
    resizer
        .resize(&src, &mut dst, &ResizeOptions::default())
        .map_err(|e| ThumbnailError::Context { name: name.to_string(), reason: e.to_string() })?;

    Ok(dst.buffer().to_vec())
}
