//! Image restoration: turn a noisy scan into a clean two-level image.
//!
//! ## Filter chain
//!
//! ```text
//! PageImage ─▶ grayscale ─▶ median ─▶ CLAHE ─▶ Sauvola ─▶ PreprocessedImage
//!              (luma8)      (denoise)  (local    (local
//!                                      contrast)  threshold)
//! ```
//!
//! The order is fixed. Each stage computes statistics over the previous
//! stage's output: the median filter removes salt-and-pepper specks before
//! CLAHE can amplify them, and Sauvola needs CLAHE's stretched local
//! contrast to separate faint pencil strokes from paper texture.
//!
//! ## Determinism
//!
//! Every stage is integer arithmetic or `f32`/`f64` arithmetic in a fixed
//! evaluation order, with no randomness and no thread-dependent reduction.
//! The same page bytes and the same [`PreprocessConfig`] produce
//! byte-identical output, which is what makes re-processing a document
//! reproduce the same transcription input.
//!
//! ## Why spawn_blocking?
//!
//! A 2500 px page is several million pixels through four full passes.
//! [`preprocess_page`] moves the work onto tokio's blocking pool so the
//! async workers keep serving external calls for other pages.

use crate::config::PreprocessConfig;
use crate::error::PipelineError;
use crate::model::{PageImage, PreprocessedImage};
use image::{DynamicImage, GrayImage, Luma};
use tracing::debug;

const BLACK: u8 = 0;
const WHITE: u8 = 255;

/// Run the restoration chain on one page, off the async runtime.
pub async fn preprocess_page(
    page: PageImage,
    config: PreprocessConfig,
) -> Result<PreprocessedImage, PipelineError> {
    let page_index = page.page_index;
    tokio::task::spawn_blocking(move || preprocess_page_blocking(&page, &config))
        .await
        .map_err(|e| PipelineError::Preprocessing {
            page: page_index,
            detail: format!("preprocess task panicked: {}", e),
        })?
}

/// Blocking implementation of the restoration chain.
///
/// Fails only when the image has no pixels or the configuration is invalid;
/// degraded but non-empty input always yields an image.
pub fn preprocess_page_blocking(
    page: &PageImage,
    config: &PreprocessConfig,
) -> Result<PreprocessedImage, PipelineError> {
    let (w, h) = (page.image.width(), page.image.height());
    if w == 0 || h == 0 {
        return Err(PipelineError::Preprocessing {
            page: page.page_index,
            detail: format!("image has zero dimension ({}x{})", w, h),
        });
    }
    config.validate().map_err(|e| PipelineError::Preprocessing {
        page: page.page_index,
        detail: e.to_string(),
    })?;

    let gray = to_grayscale(&page.image);
    let denoised = median_filter(&gray, config.median_window);
    let enhanced = clahe(&denoised, config.clahe_clip_limit, config.clahe_tiles);
    let binary = sauvola(
        &enhanced,
        config.sauvola_window,
        config.sauvola_k,
        config.sauvola_r,
    );

    debug!("Page {}: restored {}x{} px", page.page_index, w, h);

    Ok(PreprocessedImage {
        page_index: page.page_index,
        image: binary,
    })
}

// ── Stage 1: Grayscale ───────────────────────────────────────────────────────

/// Collapse colour to a single luma channel (Rec. 601 weights, via `image`).
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

// ── Stage 2: Median filter ───────────────────────────────────────────────────

/// Median over a `window`×`window` neighbourhood, edges clamped.
pub fn median_filter(img: &GrayImage, window: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let radius = (window / 2) as i64;
    let mut out = GrayImage::new(w, h);
    let mut buf: Vec<u8> = Vec::with_capacity((window * window) as usize);
    let mid = (window * window / 2) as usize;

    for y in 0..h {
        for x in 0..w {
            buf.clear();
            for dy in -radius..=radius {
                let sy = clamp_coord(y as i64 + dy, h);
                for dx in -radius..=radius {
                    let sx = clamp_coord(x as i64 + dx, w);
                    buf.push(img.get_pixel(sx, sy)[0]);
                }
            }
            let (_, median, _) = buf.select_nth_unstable(mid);
            out.put_pixel(x, y, Luma([*median]));
        }
    }
    out
}

fn clamp_coord(v: i64, len: u32) -> u32 {
    v.clamp(0, len as i64 - 1) as u32
}

// ── Stage 3: CLAHE ───────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalisation.
///
/// The image is split into at most `tiles`×`tiles` regions. Each region's
/// histogram is clipped at `clip_limit` times its mean bin height, the
/// clipped excess is spread over all bins, and the resulting CDF becomes the
/// region's lookup table. Pixels blend the four nearest region tables
/// bilinearly so tile borders do not show.
pub fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let tile_w = w.div_ceil(tiles.clamp(1, w));
    let tile_h = h.div_ceil(tiles.clamp(1, h));
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts.push(tile_lut(img, x0, y0, x1, y1, clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let grid_pos = |p: u32, tile: u32, count: u32| -> (u32, u32, f32) {
        let g = ((p as f32 + 0.5) / tile as f32 - 0.5).clamp(0.0, (count - 1) as f32);
        let lo = g.floor() as u32;
        let hi = (lo + 1).min(count - 1);
        (lo, hi, g - lo as f32)
    };

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let (y_lo, y_hi, fy) = grid_pos(y, tile_h, tiles_y);
        for x in 0..w {
            let (x_lo, x_hi, fx) = grid_pos(x, tile_w, tiles_x);
            let v = img.get_pixel(x, y)[0] as usize;
            let top = (1.0 - fx) * lut_at(x_lo, y_lo)[v] as f32 + fx * lut_at(x_hi, y_lo)[v] as f32;
            let bottom = (1.0 - fx) * lut_at(x_lo, y_hi)[v] as f32 + fx * lut_at(x_hi, y_hi)[v] as f32;
            let blended = (1.0 - fy) * top + fy * bottom;
            out.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn tile_lut(img: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let n = (x1 - x0) * (y1 - y0);

    let limit = ((clip_limit * n as f32 / 256.0).ceil() as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let per_bin = excess / 256;
    let remainder = excess % 256;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin;
        if (i as u32) < remainder {
            *bin += 1;
        }
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    let total = n as u64;
    for (i, bin) in hist.iter().enumerate() {
        cdf += *bin as u64;
        lut[i] = ((cdf * 255 + total / 2) / total).min(255) as u8;
    }
    lut
}

// ── Stage 4: Sauvola binarization ────────────────────────────────────────────

/// Sauvola local thresholding.
///
/// For each pixel, with `m` and `s` the mean and standard deviation of its
/// `window`×`window` neighbourhood (clipped at the borders), the threshold is
/// `m * (1 + k * (s / r - 1))`. Pixels above the threshold become white,
/// everything else black.
pub fn sauvola(img: &GrayImage, window: u32, k: f32, r: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    let stride = (w + 1) as usize;
    let mut sum = vec![0u64; stride * (h + 1) as usize];
    let mut sq = vec![0u64; stride * (h + 1) as usize];

    for y in 0..h as usize {
        let mut row_sum = 0u64;
        let mut row_sq = 0u64;
        for x in 0..w as usize {
            let v = img.get_pixel(x as u32, y as u32)[0] as u64;
            row_sum += v;
            row_sq += v * v;
            let i = (y + 1) * stride + x + 1;
            sum[i] = sum[i - stride] + row_sum;
            sq[i] = sq[i - stride] + row_sq;
        }
    }

    let radius = (window / 2) as i64;
    let k = k as f64;
    let r = r as f64;
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        let top = (y as i64 - radius).max(0) as usize;
        let bottom = ((y as i64 + radius).min(h as i64 - 1) + 1) as usize;
        for x in 0..w {
            let left = (x as i64 - radius).max(0) as usize;
            let right = ((x as i64 + radius).min(w as i64 - 1) + 1) as usize;

            let area = |t: &[u64]| {
                t[bottom * stride + right] + t[top * stride + left]
                    - t[top * stride + right]
                    - t[bottom * stride + left]
            };
            let n = ((bottom - top) * (right - left)) as f64;
            let mean = area(&sum) as f64 / n;
            let variance = (area(&sq) as f64 / n - mean * mean).max(0.0);
            let threshold = mean * (1.0 + k * (variance.sqrt() / r - 1.0));

            let v = img.get_pixel(x, y)[0] as f64;
            out.put_pixel(x, y, Luma([if v > threshold { WHITE } else { BLACK }]));
        }
    }
    out
}
