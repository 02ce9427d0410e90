//! Per-line sample conversions applied after reassembly.
//!
//! 16-bit samples are little-endian throughout the pipeline.

use std::f64::consts::PI;

use crate::request::LineartParams;

/// Lower and upper bound of the adaptive threshold curve.
const LUT_MIN: i32 = 50;
const LUT_MAX: i32 = 205;

/// Normalization leaves lines alone whose darkest pixel is brighter, or
/// whose brightest pixel is darker, than this.
const NORMALIZE_GUARD: u8 = 80;

/// Average of the three channels. `depth` is 8 or 16.
pub fn rgb_to_gray(line: &[u8], depth: u8) -> Vec<u8> {
    if depth == 16 {
        line.chunks_exact(6)
            .flat_map(|px| {
                let sum: u32 = px
                    .chunks_exact(2)
                    .map(|s| u16::from_le_bytes([s[0], s[1]]) as u32)
                    .sum();
                ((sum / 3) as u16).to_le_bytes()
            })
            .collect()
    } else {
        line.chunks_exact(3)
            .map(|px| ((px[0] as u32 + px[1] as u32 + px[2] as u32) / 3) as u8)
            .collect()
    }
}

/// The infra-red image travels in the red channel.
pub fn red_plane(line: &[u8], depth: u8) -> Vec<u8> {
    let sample = if depth == 16 { 2 } else { 1 };
    line.chunks_exact(3 * sample)
        .flat_map(|px| px[..sample].iter().copied())
        .collect()
}

/// Keep the high byte of every 16-bit sample.
pub fn pack_16_to_8(line: &[u8]) -> Vec<u8> {
    line.chunks_exact(2).map(|s| s[1]).collect()
}

/// Tone curve with `entries` steps mapping onto 0..=255.
pub fn gamma_table(gamma: f64, entries: usize) -> Vec<u8> {
    let last = entries.saturating_sub(1).max(1) as f64;
    let inv = if gamma > 0.0 { 1.0 / gamma } else { 1.0 };
    (0..entries)
        .map(|i| (255.0 * (i as f64 / last).powf(inv) + 0.5).clamp(0.0, 255.0) as u8)
        .collect()
}

/// Threshold lookup table for adaptive binarization.
///
/// `slope` in 0..=127 steepens the curve around the midpoint; `offset`
/// moves it up or down. Output is limited to 50..=205.
pub fn threshold_lut(slope: u8, offset: i32) -> [u8; 256] {
    let slope = slope.min(127) as f64;
    let rise = (slope / 127.0 * PI / 2.0).tan();
    let shift = 255.0 / 2.0 - rise * 255.0 / 2.0 + offset as f64 / 127.0 * 255.0 / 2.0;

    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let j = (rise * i as f64 + shift) as i32;
        *entry = j.clamp(LUT_MIN, LUT_MAX) as u8;
    }
    lut
}

/// Stretch a gray line to the full 0..=255 range.
fn normalize(gray: &[u8]) -> Vec<u8> {
    let mut min = gray.iter().copied().min().unwrap_or(0);
    let mut max = gray.iter().copied().max().unwrap_or(255);
    if min > NORMALIZE_GUARD {
        min = 0;
    }
    if max < NORMALIZE_GUARD {
        max = 255;
    }
    if max <= min {
        return gray.to_vec();
    }
    let span = (max - min) as u32;
    gray.iter()
        .map(|&v| (v.saturating_sub(min) as u32 * 255 / span).min(255) as u8)
        .collect()
}

/// Reduce an 8-bit gray line to 1 bit per pixel, most significant bit
/// first, 1 = black.
///
/// With a zero `threshold_curve` every pixel is compared against the
/// fixed threshold. Otherwise the threshold follows the local brightness
/// over a window of roughly one millimetre.
pub fn binarize(gray: &[u8], xdpi: u32, params: &LineartParams) -> Vec<u8> {
    let width = gray.len();
    let src = normalize(gray);
    let mut out = vec![0u8; width.div_ceil(8)];

    let mut window = (6 * xdpi / 150).max(1) as usize;
    if window % 2 == 0 {
        window += 1;
    }
    let half = window / 2;
    let lut = threshold_lut(params.threshold_curve, params.threshold as i32 - 127);

    // Prefix sums give the windowed average in O(1) per pixel.
    let mut prefix = Vec::with_capacity(width + 1);
    prefix.push(0u32);
    for &v in &src {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + v as u32);
    }

    for (j, &v) in src.iter().enumerate() {
        let threshold = if params.threshold_curve == 0 {
            params.threshold
        } else {
            let lo = j.saturating_sub(half);
            let hi = (j + half + 1).min(width);
            let avg = (prefix[hi] - prefix[lo]) / (hi - lo) as u32;
            lut[avg.min(255) as usize]
        };
        if v <= threshold {
            out[j / 8] |= 0x80 >> (j % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gray_average() {
        assert_eq!(rgb_to_gray(&[30, 60, 90, 255, 255, 254], 8), vec![60, 254]);
        let px16: Vec<u8> = [1000u16, 2000, 3000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(rgb_to_gray(&px16, 16), 2000u16.to_le_bytes().to_vec());
    }

    #[test]
    fn test_red_plane_and_pack() {
        assert_eq!(red_plane(&[1, 2, 3, 4, 5, 6], 8), vec![1, 4]);
        assert_eq!(red_plane(&[1, 2, 3, 4, 5, 6], 16), vec![1, 2]);
        assert_eq!(pack_16_to_8(&[0x34, 0x12, 0xFF, 0x80]), vec![0x12, 0x80]);
    }

    #[test]
    fn test_gamma_table_endpoints() {
        let table = gamma_table(2.0, 4096);
        assert_eq!(table.len(), 4096);
        assert_eq!(table[0], 0);
        assert_eq!(table[4095], 255);
        // Gamma > 1 brightens mid-tones.
        assert!(table[2048] > 128);
        let linear = gamma_table(1.0, 256);
        assert_eq!(linear[100], 100);
    }

    #[test]
    fn test_threshold_lut_shape() {
        let lut = threshold_lut(64, 0);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lut[0], 50);
        assert_eq!(lut[255], 205);
        // Flat curve sits at the midpoint shifted by the offset.
        let flat = threshold_lut(0, 0);
        assert!(flat.iter().all(|&v| v == 127));
    }

    #[test]
    fn test_binarize_fixed_threshold() {
        let gray = [0u8, 255, 0, 255, 0, 255, 0, 255, 0, 255];
        let bits = binarize(&gray, 150, &LineartParams::default());
        assert_eq!(bits, vec![0b1010_1010, 0b1000_0000]);
    }

    #[test]
    fn test_binarize_uniform_lines() {
        let params = LineartParams::default();
        assert_eq!(binarize(&[255; 16], 300, &params), vec![0, 0]);
        assert_eq!(binarize(&[0; 16], 300, &params), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_binarize_adaptive_follows_local_level() {
        let params = LineartParams {
            threshold: 127,
            threshold_curve: 40,
        };
        let mut gray = vec![220u8; 32];
        gray[10] = 20;
        let bits = binarize(&gray, 150, &params);
        assert_eq!(bits.len(), 4);
        assert_eq!(bits[1], 0b0010_0000);
        assert_eq!(bits[0] | bits[2] | bits[3], 0);
    }
}
