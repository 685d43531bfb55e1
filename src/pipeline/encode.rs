//! Image encoding: restored page → base64 PNG wrapped in `ImageData`.
//!
//! Vision APIs accept images as base64 data embedded in the JSON request
//! body. PNG is lossless and a two-level image compresses extremely well, so
//! a binarized A4 page at 200 DPI is usually well under 200 KB.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, GrayImage};
use std::io::Cursor;
use tracing::debug;

/// Encode a restored page as a base64 PNG ready for the vision API.
///
/// ## Why `detail: "high"`?
/// Handwritten doses and dates are small. With `detail: "low"` the provider
/// downsamples the page to a single 512 px tile and the strokes merge.
pub fn encode_page(img: &GrayImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
