//! Transform capability seam — the pixel work lives behind this trait.
//!
//! The pipeline never touches pixels itself. It probes the source for its
//! dimensions, computes a [`GeometryPlan`](crate::geometry::GeometryPlan),
//! and hands both to an [`ImageTransform`] implementation. The default is
//! [`RasterTransform`](crate::imaging::RasterTransform); tests substitute
//! their own.
//!
//! Implementations are synchronous — the work is CPU-bound and the pipeline
//! runs it on the blocking pool.

use crate::geometry::{Dimensions, GeometryPlan, ResizeRequest};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image processing failed: {0}")]
    ProcessingFailed(String),
}

/// Trait for image transform backends.
///
/// Both operations take the full source bytes; `probe` must not do pixel
/// work beyond reading the header. Errors from either map to an upstream
/// failure (HTTP 500) — the pipeline never retries.
pub trait ImageTransform: Send + Sync {
    /// Read the source image's dimensions.
    fn probe(&self, bytes: &[u8], extension: &str) -> Result<Dimensions, TransformError>;

    /// Apply the plan's resize and optional center-crop, strip embedded
    /// metadata, and encode at the fixed quality for the extension.
    fn apply(
        &self,
        bytes: &[u8],
        request: &ResizeRequest,
        plan: &GeometryPlan,
    ) -> Result<Vec<u8>, TransformError>;
}

/// Fixed output quality per extension. Policy, not configuration: PNG is
/// lossless-leaning, JPEG tolerates more compression.
pub fn quality_for(extension: &str) -> u8 {
    if extension == ".png" { 100 } else { 85 }
}
