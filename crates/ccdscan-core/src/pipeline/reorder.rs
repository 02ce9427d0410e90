//! Sub-pixel reordering.
//!
//! Above its native resolution a sensor reads `n` sub-images of width
//! `m = w / n` side by side. These functions weave them back into one row.
//! All of them are pure permutations over whole pixels of `px` bytes;
//! pixels past the last complete group stay where they are.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReorderStage {
    /// `dst[n * (i % m) + i / m] = src[i]`
    Interleave,
    /// Like `Interleave`, but the sensor emits pixel pairs per sub-image.
    Pairs,
    /// Fix-up within groups of 8 pixels on sensors that read even and odd
    /// elements in separate passes.
    Octet,
    /// Swap pixel pairs within groups of 16 pixels after `Pairs`.
    PairSwap,
}

/// Apply `stages` in order. `factor` is the interleave factor `n`.
pub fn apply(stages: &[ReorderStage], line: Vec<u8>, px: usize, factor: u32) -> Vec<u8> {
    stages.iter().fold(line, |line, stage| match stage {
        ReorderStage::Interleave => interleave(&line, px, factor as usize),
        ReorderStage::Pairs => pairs(&line, px, factor as usize),
        ReorderStage::Octet => octet(&line, px),
        ReorderStage::PairSwap => pair_swap(&line, px),
    })
}

fn permute(src: &[u8], px: usize, covered: usize, dst_of: impl Fn(usize) -> usize) -> Vec<u8> {
    let mut out = src.to_vec();
    for i in 0..covered {
        let d = dst_of(i);
        out[d * px..(d + 1) * px].copy_from_slice(&src[i * px..(i + 1) * px]);
    }
    out
}

pub fn interleave(src: &[u8], px: usize, n: usize) -> Vec<u8> {
    let w = src.len() / px.max(1);
    if n <= 1 || w < n {
        return src.to_vec();
    }
    let m = w / n;
    permute(src, px, n * m, |i| n * (i % m) + i / m)
}

pub fn pairs(src: &[u8], px: usize, n: usize) -> Vec<u8> {
    let w = src.len() / px.max(1);
    if n <= 1 || w < 2 * n {
        return src.to_vec();
    }
    // Sub-images must hold whole pairs.
    let m = (w / n) & !1;
    permute(src, px, n * m, |i| {
        let odd = i % 2;
        n * ((i - odd) % m) + odd + 2 * (i / m)
    })
}

pub fn octet(src: &[u8], px: usize) -> Vec<u8> {
    let w = src.len() / px.max(1);
    permute(src, px, w - w % 8, |i| {
        let i8 = i % 8;
        if i8 > 3 { i + i8 - 7 } else { i + i8 }
    })
}

pub fn pair_swap(src: &[u8], px: usize) -> Vec<u8> {
    const SHIFTS: [isize; 8] = [2, 4, 6, 8, -8, -6, -4, -2];
    let w = src.len() / px.max(1);
    permute(src, px, w - w % 16, |i| {
        let pair = i / 2;
        (i as isize + SHIFTS[pair % 8]) as usize
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: usize) -> Vec<u8> {
        (0..w as u8).collect()
    }

    fn is_permutation(out: &[u8], w: usize) -> bool {
        let mut sorted = out.to_vec();
        sorted.sort();
        sorted == ramp(w)
    }

    #[test]
    fn test_factor_one_is_identity() {
        let line = ramp(37);
        assert_eq!(interleave(&line, 1, 1), line);
        assert_eq!(interleave(&line, 1, 0), line);
        assert_eq!(pairs(&line, 1, 1), line);
        assert_eq!(apply(&[ReorderStage::Interleave], line.clone(), 1, 1), line);
    }

    #[test]
    fn test_interleave_weaves_sub_images() {
        // Two sub-images: evens then odds.
        let src = [0u8, 2, 4, 6, 1, 3, 5, 7];
        assert_eq!(interleave(&src, 1, 2), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_interleave_multibyte_pixels() {
        let src = [10u8, 11, 30, 31, 20, 21, 40, 41];
        assert_eq!(interleave(&src, 2, 2), vec![10, 11, 20, 21, 30, 31, 40, 41]);
    }

    #[test]
    fn test_interleave_keeps_tail() {
        let src = [0u8, 2, 1, 3, 9];
        assert_eq!(interleave(&src, 1, 2), vec![0, 1, 2, 3, 9]);
    }

    #[test]
    fn test_pairs_two_banks() {
        // Bank 0 carries pairs 0,2; bank 1 carries pairs 1,3.
        let src = [0u8, 1, 4, 5, 2, 3, 6, 7];
        assert_eq!(pairs(&src, 1, 2), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_octet_permutation() {
        let out = octet(&ramp(16), 1);
        assert_eq!(&out[..8], &[0, 4, 1, 5, 2, 6, 3, 7]);
        assert!(is_permutation(&out, 16));
    }

    #[test]
    fn test_pair_swap_permutation() {
        let out = pair_swap(&ramp(32), 1);
        assert!(is_permutation(&out, 32));
        // Pair 4 (pixels 8, 9) moves to the front.
        assert_eq!(&out[..2], &[8, 9]);
    }

    #[test]
    fn test_eight_bank_pairs_is_permutation() {
        let out = pairs(&ramp(64), 1, 8);
        assert!(is_permutation(&out, 64));
    }
}
