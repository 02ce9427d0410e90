//! Color-plane and stripe de-shifting.
//!
//! A CCD reads the red, green and blue rows of one physical line at
//! different times, so plane `p` of output line `L` arrives in raw line
//! `L + plane[p]`. Staggered sensor elements add `stripe` lines to even
//! columns; banked sensors add `jump` (and `stripe2`) to the second half.

use super::ring::LineRing;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShiftProfile {
    /// Line offset per plane (R, G, B).
    pub planes: [u32; 3],
    /// Base color shift; the largest plane offset is twice this.
    pub color_shift: u32,
    pub stripe: u32,
    pub stripe2: u32,
    pub jump: u32,
    pub split_halves: bool,
}

impl ShiftProfile {
    pub fn none() -> Self {
        Self::default()
    }

    /// Raw lines consumed before the first output line.
    pub fn lead_in(&self) -> u32 {
        2 * self.color_shift + self.stripe + self.jump
    }

    /// Largest lookahead any column of any plane needs.
    pub fn max_offset(&self) -> u32 {
        let extra = if self.split_halves {
            self.stripe.max(self.jump + self.stripe2)
        } else {
            self.stripe
        };
        self.planes.iter().max().copied().unwrap_or(0) + extra
    }

    /// Every offset stays within the lead-in.
    pub fn fits_lead_in(&self) -> bool {
        self.max_offset() <= self.lead_in()
    }

    pub fn is_identity(&self) -> bool {
        self.planes == [0; 3] && self.stripe == 0 && self.stripe2 == 0 && self.jump == 0
    }

    /// Lines between output line and the raw line holding column `col` of
    /// plane `plane`, for a row `width` pixels wide.
    pub fn offset(&self, plane: usize, col: usize, width: usize) -> u32 {
        let even = col % 2 == 0;
        let extra = if self.split_halves && col >= width / 2 {
            self.jump + if even { self.stripe2 } else { 0 }
        } else if even {
            self.stripe
        } else {
            0
        };
        self.planes[plane] + extra
    }
}

/// Assemble output line `line` from the ring.
///
/// `sample` is the byte width of one channel sample. Returns `None` when a
/// needed raw line is not buffered.
pub fn deshift_line(
    ring: &LineRing,
    line: u64,
    shift: &ShiftProfile,
    width: usize,
    sample: usize,
) -> Option<Vec<u8>> {
    let px = 3 * sample;
    let mut out = vec![0u8; width * px];
    for col in 0..width {
        for plane in 0..3 {
            let src = ring.get(line + shift.offset(plane, col, width) as u64)?;
            let at = col * px + plane * sample;
            out[at..at + sample].copy_from_slice(src.get(at..at + sample)?);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_in() {
        let shift = ShiftProfile {
            planes: [0, 6, 12],
            color_shift: 6,
            stripe: 3,
            stripe2: 3,
            jump: 33,
            split_halves: true,
        };
        assert_eq!(shift.lead_in(), 12 + 3 + 33);
        assert_eq!(shift.max_offset(), shift.lead_in());
        assert_eq!(ShiftProfile::none().lead_in(), 0);
    }

    #[test]
    fn test_second_stripe_past_lead_in() {
        let shift = ShiftProfile {
            planes: [4, 2, 0],
            color_shift: 2,
            stripe: 0,
            stripe2: 5,
            jump: 10,
            split_halves: true,
        };
        assert_eq!(shift.lead_in(), 14);
        assert_eq!(shift.max_offset(), 19);
        assert!(!shift.fits_lead_in());
    }

    #[test]
    fn test_offsets_for_banked_sensor() {
        let shift = ShiftProfile {
            planes: [2, 1, 0],
            color_shift: 1,
            stripe: 3,
            stripe2: 3,
            jump: 10,
            split_halves: true,
        };
        assert_eq!(shift.offset(0, 0, 8), 5);
        assert_eq!(shift.offset(2, 1, 8), 0);
        assert_eq!(shift.offset(2, 4, 8), 13);
        assert_eq!(shift.offset(1, 5, 8), 11);
    }

    #[test]
    fn test_deshift_picks_planes_from_later_lines() {
        // Raw line r holds value 10*r + plane in every sample.
        let shift = ShiftProfile {
            planes: [0, 1, 2],
            color_shift: 1,
            ..ShiftProfile::default()
        };
        let mut ring = LineRing::new(3);
        for r in 0..3u8 {
            ring.push((0..2).flat_map(|_| [10 * r, 10 * r + 1, 10 * r + 2]).collect());
        }
        let out = deshift_line(&ring, 0, &shift, 2, 1).unwrap();
        assert_eq!(out, vec![0, 11, 22, 0, 11, 22]);
        assert!(deshift_line(&ring, 1, &shift, 2, 1).is_none());
    }
}
