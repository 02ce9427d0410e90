//! Image reassembly pipeline.
//!
//! Raw block data goes in through [`Pipeline::push`]; corrected scanlines
//! come out of [`Pipeline::next_line`]. Raw lines are cut from the byte
//! backlog only when the next output line needs them, so the lookback ring
//! never holds more than `lead_in + 1` lines.
//!
//! Per output line: color-plane and stripe de-shift, sub-pixel reorder on
//! the full raw width, crop to the requested columns, sample conversion.

pub mod convert;
pub mod reorder;
pub mod ring;
pub mod shift;

use std::collections::VecDeque;

use tracing::trace;

use crate::error::DriverError;
use crate::negotiate::{Conversion, OutputFormat, RawGeometry, ReorderPlan, ScanPlan};
use ring::LineRing;
use shift::ShiftProfile;

#[derive(Debug)]
pub struct Pipeline {
    geometry: RawGeometry,
    shift: ShiftProfile,
    reorder: ReorderPlan,
    conversion: Conversion,
    pack: bool,
    output: OutputFormat,
    backlog: VecDeque<u8>,
    ring: LineRing,
    raw_lines: u64,
    emitted: u64,
}

impl Pipeline {
    pub fn new(plan: &ScanPlan) -> Self {
        let lead_in = plan.geometry.lead_in as usize;
        Self {
            geometry: plan.geometry,
            shift: plan.shift,
            reorder: plan.reorder.clone(),
            conversion: plan.conversion,
            pack: plan.pack_16_to_8,
            output: plan.output,
            backlog: VecDeque::new(),
            ring: LineRing::new(lead_in + 1),
            raw_lines: 0,
            emitted: 0,
        }
    }

    /// Append raw bytes as they arrived from the device. Data past the end
    /// of the image is dropped.
    pub fn push(&mut self, data: &[u8]) {
        if self.is_complete() {
            return;
        }
        self.backlog.extend(data);
    }

    /// Next corrected scanline, or `None` until enough raw data is buffered.
    ///
    /// Fails when every raw line the output line depends on is buffered and
    /// it still cannot be assembled.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        if self.is_complete() {
            return Ok(None);
        }
        let needed = self.emitted + self.geometry.lead_in as u64;
        while !self.ring.contains(needed) {
            let Some(raw) = self.take_raw_line() else {
                return Ok(None);
            };
            self.ring.push(raw);
            self.raw_lines += 1;
        }
        let line = self.assemble(self.emitted).ok_or_else(|| {
            DriverError::Protocol(format!(
                "line {} not assembled from {} buffered raw lines",
                self.emitted,
                self.geometry.lead_in + 1
            ))
        })?;
        self.emitted += 1;
        Ok(Some(line))
    }

    /// A blank output line for images the device ended early.
    pub fn pad_line(&mut self) -> Option<Vec<u8>> {
        if self.is_complete() {
            return None;
        }
        self.emitted += 1;
        let fill = match self.conversion {
            Conversion::Lineart(_) => 0x00,
            _ => 0xFF,
        };
        Some(vec![fill; self.output.bytes_per_line])
    }

    fn take_raw_line(&mut self) -> Option<Vec<u8>> {
        let len = self.geometry.transfer_line_bytes();
        if len == 0 || self.backlog.len() < len {
            return None;
        }
        let line: Vec<u8> = self.backlog.drain(..len).collect();
        Some(if self.pack {
            convert::pack_16_to_8(&line)
        } else {
            line
        })
    }

    fn assemble(&self, line: u64) -> Option<Vec<u8>> {
        let g = &self.geometry;
        let px = g.raw_pixel_bytes();
        let sample = (g.raw_depth / 8).max(1) as usize;

        let mut row = if g.raw_channels == 3 && !self.shift.is_identity() {
            shift::deshift_line(&self.ring, line, &self.shift, g.raw_width as usize, sample)?
        } else {
            self.ring.get(line)?.to_vec()
        };

        if !self.reorder.is_identity() {
            row = reorder::apply(&self.reorder.stages, row, px, self.reorder.factor);
        }

        let start = g.x_offset as usize * px;
        let end = start + g.width as usize * px;
        let cropped = row.get(start..end)?;

        let out = match self.conversion {
            Conversion::None => cropped.to_vec(),
            Conversion::Gray => convert::rgb_to_gray(cropped, g.raw_depth),
            Conversion::Infrared => convert::red_plane(cropped, g.raw_depth),
            Conversion::Lineart(params) => {
                let gray = if g.raw_channels == 3 {
                    convert::rgb_to_gray(cropped, 8)
                } else {
                    cropped.to_vec()
                };
                convert::binarize(&gray, g.xdpi, &params)
            }
        };
        trace!(line, len = out.len(), "Line assembled");
        Some(out)
    }

    pub fn output(&self) -> &OutputFormat {
        &self.output
    }

    /// Output lines produced so far, padding included.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Raw lines taken from the backlog so far.
    pub fn raw_lines(&self) -> u64 {
        self.raw_lines
    }

    pub fn height(&self) -> u64 {
        self.geometry.height as u64
    }

    pub fn is_complete(&self) -> bool {
        self.emitted >= self.height()
    }

    /// Bytes received but not yet cut into raw lines.
    pub fn pending_bytes(&self) -> usize {
        self.backlog.len()
    }
}
