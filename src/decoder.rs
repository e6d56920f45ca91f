//! Image decoding and thumbnailing.
//!
//! Uses zune-jpeg for fast SIMD-accelerated decoding.

use bytes::Bytes;
use zune_jpeg::JpegDecoder as ZuneJpegDecoder;

use crate::error::DecodeError;
use crate::request::ImageSize;

/// Bytes per pixel of decoded images (RGB8).
pub const RGB_CHANNELS: usize = 3;

/// Decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Raw RGB pixel data.
    pub pixels: Bytes,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Image {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels: Bytes::from(pixels),
            width,
            height,
        }
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    /// Approximate memory footprint, used as the memory cache weight.
    pub fn cost(&self) -> usize {
        self.pixels.len()
    }
}

/// Bytes to image transform.
///
/// Called on the decode thread pool, never on an async task.
pub trait Decoder: Send + Sync {
    fn decode(&self, data: &[u8], size: Option<ImageSize>) -> Result<Image, DecodeError>;
}

/// JPEG decoder producing RGB thumbnails.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegDecoder;

impl Decoder for JpegDecoder {
    fn decode(&self, data: &[u8], size: Option<ImageSize>) -> Result<Image, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut decoder = ZuneJpegDecoder::new(data);

        let pixels = decoder
            .decode()
            .map_err(|e| DecodeError::Malformed(format!("{:?}", e)))?;

        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::Malformed("Failed to get image info".into()))?;

        let width = info.width as u32;
        let height = info.height as u32;

        let rgb = if info.components == 1 {
            pixels.iter().flat_map(|&gray| [gray, gray, gray]).collect()
        } else {
            pixels
        };

        let image = Image::new(rgb, width, height);
        match size {
            Some(target) => thumbnail(&image, target),
            None => Ok(image),
        }
    }
}

/// Output dimensions when fitting `width`x`height` to fill `target`.
///
/// Aspect ratio is preserved and the image is never upscaled, so one side may
/// exceed the target (1024x680 into 256x256 gives 386x256).
pub fn thumbnail_size(
    width: u32,
    height: u32,
    target: ImageSize,
) -> Result<(u32, u32), DecodeError> {
    if target.width == 0 || target.height == 0 {
        return Err(DecodeError::InvalidTargetSize {
            width: target.width,
            height: target.height,
        });
    }
    if width == 0 || height == 0 {
        return Ok((width, height));
    }
    let scale = f64::max(
        target.width as f64 / width as f64,
        target.height as f64 / height as f64,
    );
    if scale >= 1.0 {
        return Ok((width, height));
    }
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    Ok((w, h))
}

/// Downscale an RGB image with nearest-neighbour sampling.
pub fn thumbnail(image: &Image, target: ImageSize) -> Result<Image, DecodeError> {
    let (out_w, out_h) = thumbnail_size(image.width, image.height, target)?;
    if (out_w, out_h) == (image.width, image.height) {
        return Ok(image.clone());
    }

    let expected = image.width as usize * image.height as usize * RGB_CHANNELS;
    if image.pixels.len() < expected {
        return Err(DecodeError::Malformed(format!(
            "Pixel buffer too small: {} < {}",
            image.pixels.len(),
            expected
        )));
    }

    let src = image.pixels.as_ref();
    let src_stride = image.width as usize * RGB_CHANNELS;
    let mut out = Vec::with_capacity(out_w as usize * out_h as usize * RGB_CHANNELS);

    for y in 0..out_h as usize {
        let sy = (y * image.height as usize / out_h as usize).min(image.height as usize - 1);
        let row = &src[sy * src_stride..(sy + 1) * src_stride];
        for x in 0..out_w as usize {
            let sx = (x * image.width as usize / out_w as usize).min(image.width as usize - 1);
            out.extend_from_slice(&row[sx * RGB_CHANNELS..(sx + 1) * RGB_CHANNELS]);
        }
    }

    Ok(Image::new(out, out_w, out_h))
}
