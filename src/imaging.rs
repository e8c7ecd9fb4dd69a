//! Default transform backend — pure Rust, via the `image` crate.
//!
//! Decoders and encoders are compiled in for exactly the formats on the
//! default allow-list (JPEG, PNG). Resizing uses Lanczos3, the same filter
//! quality bar as any serious thumbnailer.
//!
//! Metadata stripping falls out of the pipeline shape: the source is fully
//! decoded to pixels and re-encoded, so EXIF/IPTC/ICC blocks never survive
//! into the output.

use crate::geometry::{Dimensions, GeometryPlan, ResizeRequest};
use crate::transform::{ImageTransform, TransformError, quality_for};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;

/// Pure Rust transform using the `image` crate.
pub struct RasterTransform;

impl RasterTransform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RasterTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTransform for RasterTransform {
    fn probe(&self, bytes: &[u8], _extension: &str) -> Result<Dimensions, TransformError> {
        // Format sniffing over trusting the extension: the source hook may
        // hand back bytes that don't match the request's suffix.
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(TransformError::Io)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| TransformError::ProcessingFailed(format!("Failed to probe: {e}")))?;
        Ok(Dimensions { width, height })
    }

    fn apply(
        &self,
        bytes: &[u8],
        request: &ResizeRequest,
        plan: &GeometryPlan,
    ) -> Result<Vec<u8>, TransformError> {
        let image = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(TransformError::Io)?
            .decode()
            .map_err(|e| TransformError::ProcessingFailed(format!("Failed to decode: {e}")))?;

        let resized = match (plan.resize_width, plan.resize_height) {
            (Some(width), Some(height)) => {
                // Equal aspect ratios by construction; exact keeps us honest
                // about the output dimensions either way.
                image.resize_exact(width, height, FilterType::Lanczos3)
            }
            (Some(width), None) => image.resize(width, u32::MAX, FilterType::Lanczos3),
            (None, Some(height)) => image.resize(u32::MAX, height, FilterType::Lanczos3),
            (None, None) => image,
        };

        // A crop is only ever planned when both target dimensions exist.
        let framed = match (plan.crop, request.target_width, request.target_height) {
            (Some(offset), Some(width), Some(height)) => {
                resized.crop_imm(offset.x, offset.y, width, height)
            }
            _ => resized,
        };

        encode(&framed, &request.extension)
    }
}

/// Encode at the fixed quality policy for the extension.
fn encode(image: &DynamicImage, extension: &str) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    match extension {
        ".png" => {
            // PNG is lossless; the quality-100 policy is the format itself.
            image
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(|e| TransformError::ProcessingFailed(format!("PNG encode: {e}")))?;
        }
        ".jpg" | ".jpeg" => {
            // JPEG has no alpha channel; flatten before encoding.
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut out, quality_for(extension));
            rgb.write_with_encoder(encoder)
                .map_err(|e| TransformError::ProcessingFailed(format!("JPEG encode: {e}")))?;
        }
        other => {
            return Err(TransformError::ProcessingFailed(format!(
                "no encoder for `{other}`"
            )));
        }
    }
    Ok(out)
}
