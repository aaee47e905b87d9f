use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::dct;

/// Maximum grey-level difference from the corner pixel still treated as border.
pub const CROP_THRESHOLD: i32 = 10;

/// Side of the square preview the hash is computed from.
pub const PREVIEW_SIZE: u32 = 128;

/// Side of the grid fed to the DCT.
pub const HASH_GRID: u32 = 32;

/// Number of low-frequency columns transformed in the second DCT pass.
const HASH_COLUMNS: usize = 8;

/// Grey level transparent pixels are composited onto before hashing.
const BACKGROUND_GREY: u8 = 128;

/// SHA-256 of the raw encoded bytes, lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// 64-bit DCT perceptual hash of a decoded image.
///
/// Pipeline: flatten alpha onto mid grey, convert to 8-bit luma, area-resize
/// to a `PREVIEW_SIZE` square, auto-crop uniform borders, area-resize to a
/// `HASH_GRID` square, then [`dct_hash`]. Every resampling step uses
/// [`area_resize`] so the result does not depend on a library default filter.
pub fn perceptual_hash(image: &DynamicImage) -> u64 {
    let gray = to_gray(image);
    let preview = area_resize(&gray, PREVIEW_SIZE, PREVIEW_SIZE);
    let cropped = auto_crop(&preview, CROP_THRESHOLD);
    let grid = area_resize(&cropped, HASH_GRID, HASH_GRID);
    dct_hash(&grid)
}

fn to_gray(image: &DynamicImage) -> GrayImage {
    if !image.color().has_alpha() {
        return image.to_luma8();
    }

    let rgba = image.to_rgba8();
    let flattened = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y);
        let a = p[3] as u32;
        let blend = |c: u8| ((c as u32 * a + BACKGROUND_GREY as u32 * (255 - a) + 127) / 255) as u8;
        Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    });
    DynamicImage::ImageRgb8(flattened).to_luma8()
}

/// Hash a `HASH_GRID`×`HASH_GRID` grey image.
///
/// Rows are transformed, then the first eight columns. The 64 coefficients
/// following the DC term in row-major order over an 8-wide window are
/// compared against their mean; bits are emitted most significant first.
pub fn dct_hash(grid: &GrayImage) -> u64 {
    let n = HASH_GRID as usize;
    debug_assert_eq!(grid.dimensions(), (HASH_GRID, HASH_GRID));

    let mut mat = vec![vec![0.0f64; n]; n];
    for (y, row) in mat.iter_mut().enumerate() {
        for (x, cell) in row.iter_mut().enumerate() {
            *cell = grid.get_pixel(x as u32, y as u32)[0] as f64;
        }
    }

    for row in mat.iter_mut() {
        dct::transform(row);
    }

    let mut col = vec![0.0f64; n];
    for x in 0..HASH_COLUMNS {
        for y in 0..n {
            col[y] = mat[y][x];
        }
        dct::transform(&mut col);
        for y in 0..n {
            mat[y][x] = col[y];
        }
    }

    let coefficient = |i: usize| mat[i / HASH_COLUMNS][i % HASH_COLUMNS];

    let mean = (1..65).map(coefficient).sum::<f64>() / 64.0;

    (1..65).fold(0u64, |hash, i| (hash << 1) | (coefficient(i) > mean) as u64)
}

/// Trim uniform borders that match the top-left pixel within `threshold`.
///
/// The top edge keeps the last border row above the content; the other
/// edges are cut exactly. An image with no content collapses to its 1×1
/// top-left corner.
pub fn auto_crop(image: &GrayImage, threshold: i32) -> GrayImage {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
        return image.clone();
    }

    let base = image.get_pixel(0, 0)[0] as i32;
    let differs = |x: i64, y: i64| {
        (image.get_pixel(x as u32, y as u32)[0] as i32 - base).abs() > threshold
    };

    let mut top = 0;
    let mut left = w;
    let mut bottom = h;
    let mut right = 0;

    let mut y = 0;
    while y < h && left > 0 {
        let mut x = 0;
        while x < left && !differs(x, y) {
            x += 1;
        }
        if x == w {
            top = y;
        } else if x < left {
            left = x;
        }
        y += 1;
    }

    let mut y = h - 1;
    while y >= 0 && right < w {
        let mut x = w - 1;
        while x >= right && !differs(x, y) {
            x -= 1;
        }
        if x == -1 {
            bottom = y;
        } else if x >= right {
            right = x + 1;
        }
        y -= 1;
    }

    if bottom <= top {
        left = 0;
        top = 0;
        right = 1;
        bottom = 1;
    }

    if right != w || bottom != h || left != 0 || top != 0 {
        return image::imageops::crop_imm(
            image,
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
        .to_image();
    }

    image.clone()
}

/// Source pixels and weights contributing to each destination pixel along one axis.
fn axis_weights(src: u32, dst: u32) -> Vec<Vec<(usize, f64)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut weights = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src as usize {
                let lo = start.max(s as f64);
                let hi = end.min(s as f64 + 1.0);
                if hi > lo {
                    weights.push((s, (hi - lo) / scale));
                }
                s += 1;
            }
            weights
        })
        .collect()
}

/// Area-averaging (box) resample, separable, horizontal pass first.
///
/// Each output pixel is the coverage-weighted mean of the source pixels its
/// footprint overlaps, rounded half away from zero. When enlarging, the
/// footprint falls inside a single source pixel and the value is copied.
pub fn area_resize(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (sw, sh) = image.dimensions();
    if (sw, sh) == (width, height) {
        return image.clone();
    }

    let xw = axis_weights(sw, width);
    let yw = axis_weights(sh, height);
    let stride = width as usize;

    let mut rows = vec![0.0f64; sh as usize * stride];
    for y in 0..sh {
        for (dx, weights) in xw.iter().enumerate() {
            rows[y as usize * stride + dx] = weights
                .iter()
                .map(|&(sx, wt)| image.get_pixel(sx as u32, y)[0] as f64 * wt)
                .sum();
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let value: f64 = yw[y as usize]
            .iter()
            .map(|&(sy, wt)| rows[sy * stride + x as usize] * wt)
            .sum();
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}
