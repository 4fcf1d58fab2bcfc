// Grayscale conversion for motion detection
//
// Writes into a caller-owned plane so the detector can reuse the same
// allocation for every sampled frame.

use ndarray::Array2;

use super::{Frame, FrameEncoding};
use crate::recording::motion::DetectError;

/// Fixed-point BT.601 luma weights (scaled by 2^14), same as OpenCV's BGR2GRAY
const LUMA_B: u32 = 1868;
const LUMA_G: u32 = 9617;
const LUMA_R: u32 = 4899;
const LUMA_SHIFT: u32 = 14;
const LUMA_ROUND: u32 = 1 << (LUMA_SHIFT - 1);

/// Decode `frame` into `out`, which must already have the configured
/// `(height, width)` shape.
pub fn decode_luma_into(frame: &Frame, out: &mut Array2<u8>) -> Result<(), DetectError> {
    match frame.encoding {
        FrameEncoding::RawBgr => bgr_to_luma_into(&frame.payload, out),
        FrameEncoding::Jpeg => jpeg_to_luma_into(&frame.payload, out),
        FrameEncoding::H264Unit => Err(DetectError::UnsupportedEncoding(frame.encoding)),
    }
}

/// Convert packed BGR24 to 8-bit luma.
pub fn bgr_to_luma_into(payload: &[u8], out: &mut Array2<u8>) -> Result<(), DetectError> {
    let expected = out.len() * 3;
    if payload.len() != expected {
        return Err(DetectError::PayloadSize {
            expected,
            actual: payload.len(),
        });
    }

    for (dst, px) in out.iter_mut().zip(payload.chunks_exact(3)) {
        let luma = px[0] as u32 * LUMA_B + px[1] as u32 * LUMA_G + px[2] as u32 * LUMA_R;
        *dst = ((luma + LUMA_ROUND) >> LUMA_SHIFT) as u8;
    }
    Ok(())
}

/// Decode a JPEG still and convert it to 8-bit luma.
pub fn jpeg_to_luma_into(payload: &[u8], out: &mut Array2<u8>) -> Result<(), DetectError> {
    let image = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
        .map_err(|e| DetectError::Decode(e.to_string()))?;
    let luma = image.to_luma8();

    let (height, width) = out.dim();
    if luma.width() as usize != width || luma.height() as usize != height {
        return Err(DetectError::DimensionMismatch {
            expected_width: width as u32,
            expected_height: height as u32,
            actual_width: luma.width(),
            actual_height: luma.height(),
        });
    }

    for (dst, src) in out.iter_mut().zip(luma.as_raw().iter()) {
        *dst = *src;
    }
    Ok(())
}
