//! Request path parsing and resize/crop geometry.
//!
//! Everything here is pure: no I/O, no clocks, no images. The rest of the
//! crate turns a URL path into pixel work by way of these two functions:
//!
//! 1. [`parse_request`] — extracts the target size from the filename. Paths
//!    follow the `<width>x<height>.<ext>` convention (`/photos/200x300.jpg`);
//!    either dimension may be empty (`200x.jpg`, `x300.jpg`) meaning
//!    "derive from aspect ratio". Filenames that don't match the pattern are
//!    requests for the original image.
//!
//! 2. [`plan_geometry`] — given the source image's actual dimensions,
//!    computes the resize dimensions and optional center-crop offset that
//!    produce exactly the requested size. Upscaling is never performed; a
//!    target larger than the source is a rejection (`None`).
//!
//! ## Crop math
//!
//! When both target dimensions are given and the aspect ratios differ, the
//! image is resized so the "tight" axis matches the target exactly, then
//! center-cropped on the other axis. Offsets use floor division, so results
//! are reproducible to the pixel:
//!
//! ```text
//! source 500x500, target 250x300  →  resize height to 300, crop x=25
//! source 226x223, target 200x200  →  resize height to 200, crop x=1
//! source 600x400, target 300x200  →  straight resize, no crop
//! ```

use std::time::SystemTime;

/// Source image dimensions as reported by the transform capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A parsed resize request, created once per inbound path.
///
/// Mutated in place as processing proceeds (cache durations stamped at
/// dispatch, `cropped` set when a crop op is applied) and discarded at
/// request end — never shared across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeRequest {
    /// Basename of the request path (e.g. `200x300.jpg`).
    pub filename: String,
    /// Directory part of the request path (e.g. `/photos`).
    pub folder: String,
    /// Lower-cased extension including the leading dot (e.g. `.jpg`).
    /// Empty if the filename has no extension.
    pub extension: String,
    /// Requested output width, if the filename specified one.
    pub target_width: Option<u32>,
    /// Requested output height, if the filename specified one.
    pub target_height: Option<u32>,
    /// True iff the filename does not match `<width>x<height>.<ext>` —
    /// the client wants the source image untouched.
    pub is_original: bool,
    /// Parsed `If-Modified-Since` request header, stamped by the gateway.
    pub modified_since: Option<SystemTime>,
    /// Set by the pipeline when a crop op was applied; visible to the
    /// through/dest hooks.
    pub cropped: bool,
    /// `s-maxage` seconds for the response, stamped from config at dispatch.
    pub server_cache_duration: u64,
    /// `max-age` seconds for the response, stamped from config at dispatch.
    pub client_cache_duration: u64,
}

/// Parse a request path into a [`ResizeRequest`].
///
/// Structurally invalid filenames are not an error — they are treated as
/// requests for the original image (`is_original = true`). Extension
/// matching is case-insensitive; `200X300.JPG` parses the same as
/// `200x300.jpg`.
pub fn parse_request(path: &str) -> ResizeRequest {
    let (folder, filename) = split_path(path);
    let extension = match filename.rfind('.') {
        Some(dot) if dot + 1 < filename.len() => filename[dot..].to_ascii_lowercase(),
        _ => String::new(),
    };

    let mut request = ResizeRequest {
        filename: filename.to_string(),
        folder: folder.to_string(),
        extension,
        target_width: None,
        target_height: None,
        is_original: false,
        modified_since: None,
        cropped: false,
        server_cache_duration: 0,
        client_cache_duration: 0,
    };

    match parse_target_size(filename) {
        Some((width, height)) => {
            request.target_width = width;
            request.target_height = height;
        }
        None => request.is_original = true,
    }
    request
}

/// Split a path into (folder, filename) like the usual dirname/basename pair.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => (".", path),
    }
}

/// Match a filename against `^(\d*)[xX](\d*)\.\w+$`.
///
/// Returns the two (possibly absent) dimensions on a match, `None` if the
/// filename doesn't follow the convention.
fn parse_target_size(filename: &str) -> Option<(Option<u32>, Option<u32>)> {
    let dot = filename.rfind('.')?;
    let (stem, ext) = (&filename[..dot], &filename[dot + 1..]);
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let sep = stem.find(['x', 'X'])?;
    let (width_part, height_part) = (&stem[..sep], &stem[sep + 1..]);
    if !width_part.chars().all(|c| c.is_ascii_digit())
        || !height_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let width = parse_dimension(width_part);
    let height = parse_dimension(height_part);
    Some((width, height))
}

/// An empty part means "derive from aspect ratio". A digit string too large
/// for `u32` saturates instead, so [`plan_geometry`] rejects it as an
/// upscale rather than treating the axis as unspecified.
fn parse_dimension(digits: &str) -> Option<u32> {
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse::<u32>().unwrap_or(u32::MAX))
}

/// Center-crop offset in pixels, applied after the resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropOffset {
    pub x: u32,
    pub y: u32,
}

/// Concrete resize-and/or-crop instructions for the transform capability.
///
/// At most one of `resize_width`/`resize_height` is cleared when a crop is
/// present: the kept axis is resized to match the target exactly and the
/// overshooting axis is derived from the source aspect ratio, then cropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPlan {
    pub resize_width: Option<u32>,
    pub resize_height: Option<u32>,
    pub crop: Option<CropOffset>,
}

/// Compute the geometry plan for a request against actual source dimensions.
///
/// Returns `None` when either requested dimension exceeds the source — the
/// request is geometrically unsatisfiable without upscaling, which this
/// system never does.
///
/// Pure function of integer and floor arithmetic: re-invoking with the same
/// inputs yields bit-identical offsets.
pub fn plan_geometry(source: Dimensions, request: &ResizeRequest) -> Option<GeometryPlan> {
    let target_width = request.target_width;
    let target_height = request.target_height;

    if target_width.is_some_and(|w| w > source.width)
        || target_height.is_some_and(|h| h > source.height)
    {
        return None;
    }

    let mut plan = GeometryPlan {
        resize_width: target_width,
        resize_height: target_height,
        crop: None,
    };

    if let (Some(width), Some(height)) = (target_width, target_height) {
        let src_aspect = source.width as f64 / source.height as f64;
        let dest_aspect = width as f64 / height as f64;

        if dest_aspect > src_aspect {
            // Target is wider than the source: width matches exactly,
            // the derived height overshoots and is cropped vertically.
            let derived_height = (width as f64 / src_aspect).floor() as u32;
            plan.resize_height = None;
            plan.crop = Some(CropOffset {
                x: 0,
                y: (derived_height - height) / 2,
            });
        } else if dest_aspect < src_aspect {
            // Target is narrower: height matches, crop horizontally.
            let derived_width = (height as f64 * src_aspect).floor() as u32;
            plan.resize_width = None;
            plan.crop = Some(CropOffset {
                x: (derived_width - width) / 2,
                y: 0,
            });
        }
        // Equal aspect ratios: straight resize, no crop.
    }

    Some(plan)
}
