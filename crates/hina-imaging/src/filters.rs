//! Grayscale filters: non-local means denoising, CLAHE and sharpening.

use image::{GrayImage, Luma};

/// Non-local means denoising.
///
/// Every pixel becomes a weighted mean of the pixels in its search window,
/// weighted by how similar their surrounding patches are. `strength` plays the
/// role of the filter parameter `h`: larger values smooth more. Borders are
/// handled by edge replication.
///
/// Patch distances for each search offset are read from an integral image of
/// squared differences, so the cost does not grow with the patch size.
pub fn denoise(gray: &GrayImage, strength: f32, patch_radius: u32, search_radius: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 || strength <= 0.0 {
        return gray.clone();
    }

    let pad = (patch_radius + search_radius) as i64;
    let (w, h) = (width as i64, height as i64);
    let padded_w = w + 2 * pad;
    let padded_h = h + 2 * pad;

    let padded: Vec<f32> = (0..padded_h)
        .flat_map(|py| {
            (0..padded_w).map(move |px| {
                let sx = (px - pad).clamp(0, w - 1) as u32;
                let sy = (py - pad).clamp(0, h - 1) as u32;
                gray.get_pixel(sx, sy)[0] as f32
            })
        })
        .collect();
    let at = |x: i64, y: i64| padded[(y * padded_w + x) as usize];

    let pr = patch_radius as i64;
    let sr = search_radius as i64;
    let side = (2 * pr + 1) as usize;
    let patch_len = (side * side) as f64;
    let h2 = f64::from(strength) * f64::from(strength);

    // Region covered by the centre patches, starting at padded (sr, sr).
    let (rw, rh) = (w + 2 * pr, h + 2 * pr);
    let stride = (rw + 1) as usize;
    let mut integral = vec![0.0f64; stride * (rh + 1) as usize];

    let n = width as usize * height as usize;
    let mut acc = vec![0.0f64; n];
    let mut weight_sum = vec![0.0f64; n];

    for dy in -sr..=sr {
        for dx in -sr..=sr {
            for ry in 0..rh {
                let mut row = 0.0f64;
                for rx in 0..rw {
                    let (px, py) = (rx + sr, ry + sr);
                    let diff = f64::from(at(px, py) - at(px + dx, py + dy));
                    row += diff * diff;
                    let i = (ry + 1) as usize * stride + (rx + 1) as usize;
                    integral[i] = integral[i - stride] + row;
                }
            }

            for y in 0..h {
                for x in 0..w {
                    let (x0, y0) = (x as usize, y as usize);
                    let (x1, y1) = (x0 + side, y0 + side);
                    let dist2 = integral[y1 * stride + x1] - integral[y0 * stride + x1] - integral[y1 * stride + x0]
                        + integral[y0 * stride + x0];
                    let weight = (-(dist2.max(0.0) / patch_len) / h2).exp();
                    let i = y0 * width as usize + x0;
                    acc[i] += weight * f64::from(at(x + pad + dx, y + pad + dy));
                    weight_sum[i] += weight;
                }
            }
        }
    }

    // weight_sum >= 1.0: the centre patch always compares equal to itself.
    GrayImage::from_fn(width, height, |x, y| {
        let i = y as usize * width as usize + x as usize;
        Luma([(acc[i] / weight_sum[i]).round().clamp(0.0, 255.0) as u8])
    })
}

/// Contrast-Limited Adaptive Histogram Equalization, in place.
///
/// The image is split into a `tiles` × `tiles` grid. Each tile's histogram is
/// clipped at `clip_limit` times the uniform bin height (`tile_pixels / 256`),
/// the excess is spread evenly over all bins, and the resulting CDF becomes
/// the tile's lookup table. Pixels are mapped by bilinear interpolation
/// between the four nearest tile centres. A non-positive `clip_limit`
/// disables clipping.
pub fn clahe(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 || tiles == 0 {
        return;
    }

    let tx = tiles.min(width) as usize;
    let ty = tiles.min(height) as usize;
    let w = width as usize;
    let h = height as usize;

    // Tile bounds cover every pixel; tiles differ by at most one pixel in size.
    let bound = |i: usize, n: usize, len: usize| i * len / n;

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(tx * ty);
    for row in 0..ty {
        for col in 0..tx {
            let (x0, x1) = (bound(col, tx, w), bound(col + 1, tx, w));
            let (y0, y1) = (bound(row, ty, h), bound(row + 1, ty, h));
            let tile_pixels = ((x1 - x0) * (y1 - y0)) as u32;

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }

            if clip_limit > 0.0 {
                let limit = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
                let mut excess = 0u32;
                for bin in hist.iter_mut() {
                    if *bin > limit {
                        excess += *bin - limit;
                        *bin = limit;
                    }
                }
                let per_bin = excess / 256;
                let leftover = (excess % 256) as usize;
                for (i, bin) in hist.iter_mut().enumerate() {
                    *bin += per_bin;
                    if i < leftover {
                        *bin += 1;
                    }
                }
            }

            let scale = 255.0 / tile_pixels.max(1) as f32;
            let mut lut = [0u8; 256];
            let mut cdf = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                cdf += count;
                lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    let tile_w = w as f32 / tx as f32;
    let tile_h = h as f32 / ty as f32;

    for y in 0..h {
        let fy = ((y as f32 + 0.5) / tile_h - 0.5).clamp(0.0, (ty - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(ty - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 + 0.5) / tile_w - 0.5).clamp(0.0, (tx - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tx - 1);
            let dx = fx - c0 as f32;

            let pixel = gray.get_pixel(x as u32, y as u32)[0] as usize;
            let tl = luts[r0 * tx + c0][pixel] as f32;
            let tr = luts[r0 * tx + c1][pixel] as f32;
            let bl = luts[r1 * tx + c0][pixel] as f32;
            let br = luts[r1 * tx + c1][pixel] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray.put_pixel(x as u32, y as u32, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }
}

/// Sharpness enhancement with a fixed gain.
///
/// Blends the image away from a 3×3 smoothed copy:
/// `out = smooth + factor * (image - smooth)`. A factor of 1.0 is the
/// identity, 2.0 doubles local detail. The one-pixel border is left as is.
pub fn sharpen(gray: &GrayImage, factor: f32) -> GrayImage {
    // 3×3 smoothing kernel, centre weight 5, normalized by 13.
    const KERNEL: [[f32; 3]; 3] = [[1.0, 1.0, 1.0], [1.0, 5.0, 1.0], [1.0, 1.0, 1.0]];
    const KERNEL_SUM: f32 = 13.0;

    let (width, height) = gray.dimensions();
    let mut out = gray.clone();
    if width < 3 || height < 3 {
        return out;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut smooth = 0.0f32;
            for (ky, row) in KERNEL.iter().enumerate() {
                for (kx, k) in row.iter().enumerate() {
                    smooth += k * gray.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1)[0] as f32;
                }
            }
            smooth /= KERNEL_SUM;

            let original = gray.get_pixel(x, y)[0] as f32;
            let val = smooth + factor * (original - smooth);
            out.put_pixel(x, y, Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }

    out
}
