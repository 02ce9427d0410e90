//! Scan parameter negotiation.
//!
//! Turns a `ScanRequest` into what the device is actually asked for: a
//! supported source and resolution, a crop clamped to the addressable
//! area, a raw line padded to the sensor alignment and tall enough to feed
//! the de-shift lead-in, plus the list of corrections the pipeline has to
//! apply to get the requested image back.

use tracing::{debug, warn};

use crate::error::DriverError;
use crate::pipeline::reorder::ReorderStage;
use crate::pipeline::shift::ShiftProfile;
use crate::profile::{Capabilities, DeviceProfile, ResolutionLimits, SensorKind};
use crate::protocol::commands::ScanParams;
use crate::protocol::constants::BASE_DPI;
use crate::request::{ColorMode, LineartParams, PaperSource, ScanArea, ScanRequest};

/// Smallest crop edge in pixels.
const MIN_EXTENT: u32 = 16;

/// Device-side geometry of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGeometry {
    pub xdpi: u32,
    pub ydpi: u32,
    /// Left edge sent to the device.
    pub x: u32,
    /// Top edge sent to the device, transparency offset included.
    pub y: u32,
    /// Output size in pixels.
    pub width: u32,
    pub height: u32,
    /// Pixels between the device's left edge and the requested one.
    pub x_offset: u32,
    /// Pixels per raw line, alignment padding included.
    pub raw_width: u32,
    /// Raw lines requested, lead-in included.
    pub raw_height: u32,
    /// Samples per raw pixel.
    pub raw_channels: u8,
    /// Bits per sample in the reassembly pipeline.
    pub raw_depth: u8,
    /// Bits per sample on the wire.
    pub transfer_depth: u8,
    pub lead_in: u32,
}

impl RawGeometry {
    pub fn raw_pixel_bytes(&self) -> usize {
        self.raw_channels as usize * self.raw_depth as usize / 8
    }

    pub fn raw_line_bytes(&self) -> usize {
        self.raw_width as usize * self.raw_pixel_bytes()
    }

    pub fn transfer_line_bytes(&self) -> usize {
        self.raw_width as usize * self.raw_channels as usize * self.transfer_depth as usize / 8
    }

    /// Bytes the device will deliver for the whole image.
    pub fn transfer_bytes(&self) -> u64 {
        self.transfer_line_bytes() as u64 * self.raw_height as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderPlan {
    /// Number of interleaved sub-images; 1 disables reordering.
    pub factor: u32,
    pub stages: Vec<ReorderStage>,
}

impl ReorderPlan {
    pub fn is_identity(&self) -> bool {
        self.factor <= 1
            && self
                .stages
                .iter()
                .all(|s| matches!(s, ReorderStage::Interleave | ReorderStage::Pairs))
    }
}

/// Sample conversion after cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    None,
    /// Three-channel average.
    Gray,
    /// Red channel of a transparency scan.
    Infrared,
    Lineart(LineartParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub channels: u8,
    pub depth: u8,
    pub bytes_per_line: usize,
}

/// Everything the session and pipeline need for one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// The request as it will be honored, after fallbacks and clamping.
    pub request: ScanRequest,
    pub geometry: RawGeometry,
    pub shift: ShiftProfile,
    pub reorder: ReorderPlan,
    pub conversion: Conversion,
    /// Device sends 16-bit samples that the pipeline narrows to 8.
    pub pack_16_to_8: bool,
    pub output: OutputFormat,
    pub params: ScanParams,
}

/// Resolve `request` against `profile`.
pub fn resolve(request: &ScanRequest, profile: &DeviceProfile) -> Result<ScanPlan, DriverError> {
    if request.xdpi == 0 || request.ydpi == 0 {
        return Err(DriverError::InvalidParameter("resolution must be non-zero".into()));
    }
    if request.area.width == 0 || request.area.height == 0 {
        return Err(DriverError::InvalidParameter("scan area is empty".into()));
    }

    let source = fallback_source(request.source, &profile.capabilities);
    let mode = request.mode;
    check_mode(mode, source, profile)?;
    let infrared = mode == ColorMode::Infrared;

    // Both axes run at the same step.
    let limits = profile.resolutions.for_source(source, infrared);
    let wanted = request.xdpi.min(request.ydpi);
    let dpi = step_resolution(wanted, limits);
    if dpi != request.xdpi || dpi != request.ydpi {
        debug!(xdpi = request.xdpi, ydpi = request.ydpi, dpi, "Resolution adjusted");
    }
    let area = ScanArea::new(
        rescale(request.area.x, request.xdpi, dpi),
        rescale(request.area.y, request.ydpi, dpi),
        rescale(request.area.width, request.xdpi, dpi).max(1),
        rescale(request.area.height, request.ydpi, dpi).max(1),
    );

    let tpu_geometry = profile
        .tpu_geometry
        .filter(|_| source == PaperSource::Tpu);
    let height_units = match tpu_geometry {
        Some(tpu) => tpu.max_height.min(profile.height),
        None => profile.height,
    };
    let max_w = profile.width * dpi / BASE_DPI;
    let max_h = height_units * dpi / BASE_DPI;
    let (x, mut width) = clamp_axis(area.x, area.width, max_w, "x")?;
    let (mut y, height) = clamp_axis(area.y, area.height, max_h, "y")?;

    if mode == ColorMode::Lineart {
        let room = (max_w - x) & !7;
        width = width.next_multiple_of(8).min(room.max(8));
    }

    if let Some(tpu) = tpu_geometry
        && y > 0
    {
        y += tpu.offset_y * dpi / 300;
    }

    let raw_channels = raw_channels(mode, profile);
    let raw_depth = if mode.is_high_depth() { 16 } else { 8 };
    let transfer_depth = if source == PaperSource::Tpu && profile.tpu_transfers_48bit {
        16
    } else {
        raw_depth
    };

    let shift = shift_profile(profile, source, dpi);
    if !shift.fits_lead_in() {
        return Err(DriverError::InvalidParameter(format!(
            "{} at {dpi} dpi: shift tables reach {} lines with a {}-line lead-in",
            profile.model,
            shift.max_offset(),
            shift.lead_in()
        )));
    }
    let lead_in = shift.lead_in();

    let x_offset = x % profile.alignment.origin.max(1);
    let alignment = profile.alignment.width_alignment(raw_channels).max(1);
    let raw_width = (width + x_offset).next_multiple_of(alignment);
    let raw_height = height + lead_in;

    let (factor, stages) = profile.reorder.resolve(dpi);
    let reorder = ReorderPlan {
        factor: factor.max(1),
        stages,
    };

    let conversion = match mode {
        ColorMode::Color | ColorMode::Color48 => Conversion::None,
        ColorMode::Gray | ColorMode::Gray16 if raw_channels == 3 => Conversion::Gray,
        ColorMode::Gray | ColorMode::Gray16 => Conversion::None,
        ColorMode::Infrared => Conversion::Infrared,
        ColorMode::Lineart => Conversion::Lineart(request.lineart),
    };

    let output = OutputFormat {
        channels: mode.channels(),
        depth: mode.depth(),
        bytes_per_line: if mode == ColorMode::Lineart {
            width.div_ceil(8) as usize
        } else {
            width as usize * mode.channels() as usize * mode.depth() as usize / 8
        },
    };

    let geometry = RawGeometry {
        xdpi: dpi,
        ydpi: dpi,
        x: x - x_offset,
        y,
        width,
        height,
        x_offset,
        raw_width,
        raw_height,
        raw_channels,
        raw_depth,
        transfer_depth,
        lead_in,
    };

    let params = ScanParams {
        source,
        infrared,
        xdpi: dpi,
        ydpi: dpi,
        x: geometry.x,
        y,
        raw_width,
        raw_height,
        single_channel: raw_channels == 1,
        bits_per_pixel: raw_channels * transfer_depth,
    };

    let mut effective = request.clone();
    effective.source = source;
    effective.xdpi = dpi;
    effective.ydpi = dpi;
    effective.area = ScanArea::new(x, y, width, height);

    debug!(
        source = %source,
        mode = %mode,
        dpi,
        raw_width,
        raw_height,
        lead_in,
        factor = reorder.factor,
        "Scan parameters negotiated"
    );

    Ok(ScanPlan {
        request: effective,
        geometry,
        shift,
        reorder,
        conversion,
        pack_16_to_8: transfer_depth == 16 && raw_depth == 8,
        output,
        params,
    })
}

/// Replace a source the model lacks with the nearest one it has.
pub fn fallback_source(source: PaperSource, caps: &Capabilities) -> PaperSource {
    let mut current = source;
    while !caps.supports(current) {
        let next = match current {
            PaperSource::AdfDuplex => PaperSource::Adf,
            _ => PaperSource::Flatbed,
        };
        warn!(requested = %current, fallback = %next, "Source not available");
        current = next;
    }
    current
}

fn check_mode(mode: ColorMode, source: PaperSource, profile: &DeviceProfile) -> Result<(), DriverError> {
    let caps = &profile.capabilities;
    match mode {
        ColorMode::Lineart if source == PaperSource::Tpu => Err(DriverError::Unsupported(
            "lineart from the transparency unit".into(),
        )),
        ColorMode::Infrared if source != PaperSource::Tpu || !caps.tpu_infrared => Err(
            DriverError::Unsupported(format!("infrared on {} from {source}", profile.model)),
        ),
        m if m.is_high_depth() && !caps.high_depth => Err(DriverError::Unsupported(format!(
            "16-bit samples on {}",
            profile.model
        ))),
        _ => Ok(()),
    }
}

/// Largest `75 * 2^k` within `limits` not above `dpi`.
pub fn step_resolution(dpi: u32, limits: ResolutionLimits) -> u32 {
    let target = dpi.clamp(limits.min, limits.max.max(limits.min));
    let mut step = BASE_DPI;
    while step * 2 <= target {
        step *= 2;
    }
    step.max(limits.min)
}

fn rescale(value: u32, from: u32, to: u32) -> u32 {
    if from == to {
        value
    } else {
        (value as u64 * to as u64 / from as u64) as u32
    }
}

/// Keep an origin/extent pair inside `0..max`, at least `MIN_EXTENT` wide.
fn clamp_axis(origin: u32, extent: u32, max: u32, axis: &str) -> Result<(u32, u32), DriverError> {
    if origin >= max {
        return Err(DriverError::InvalidParameter(format!(
            "{axis} origin {origin} outside the scan area of {max} pixels"
        )));
    }
    let origin = origin.min(max.saturating_sub(MIN_EXTENT));
    let extent = extent.min(max - origin).max(MIN_EXTENT.min(max));
    Ok((origin, extent))
}

/// Samples per raw pixel. CCD models always scan three channels.
fn raw_channels(mode: ColorMode, profile: &DeviceProfile) -> u8 {
    match profile.sensor {
        SensorKind::Ccd => 3,
        SensorKind::Contact => mode.channels(),
    }
}

fn shift_profile(profile: &DeviceProfile, source: PaperSource, dpi: u32) -> ShiftProfile {
    if profile.sensor == SensorKind::Contact {
        return ShiftProfile::none();
    }
    let mut shift = ShiftProfile::none();
    if let Some(rule) = profile.color_shift
        && dpi > rule.above_ydpi
    {
        let color_shift = dpi / rule.divisor.max(1);
        shift.color_shift = color_shift;
        shift.planes = rule.planes.map(|p| p * color_shift);
    }
    if let Some(entry) = profile.stripe_entry(dpi) {
        let stripe = if source == PaperSource::Tpu {
            entry.tpu
        } else {
            entry.flatbed
        };
        shift.stripe = stripe.stripe;
        shift.stripe2 = stripe.stripe2;
        shift.jump = stripe.jump;
        shift.split_halves = entry.split_halves;
    }
    shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::builtin_profiles;

    fn profile(model: &str) -> DeviceProfile {
        DeviceProfile::find(model).unwrap()
    }

    fn request(dpi: u32, area: ScanArea, mode: ColorMode, source: PaperSource) -> ScanRequest {
        ScanRequest::new(dpi, area, mode, source)
    }

    #[test]
    fn test_raw_width_alignment_property() {
        for p in builtin_profiles() {
            for mode in [ColorMode::Color, ColorMode::Gray, ColorMode::Lineart] {
                for x in [0u32, 5, 33, 100] {
                    for w in [16u32, 17, 31, 33, 101, 250, 300] {
                        let req = request(75, ScanArea::new(x, 0, w, 100), mode, PaperSource::Flatbed);
                        let plan = resolve(&req, &p).unwrap();
                        let g = plan.geometry;
                        let a = p.alignment.width_alignment(g.raw_channels);
                        assert_eq!(g.raw_width % a, 0, "{} w={w}", p.model);
                        assert!(g.raw_width >= g.width + g.x_offset, "{} w={w}", p.model);
                        assert!(g.width >= w.min(16), "{} w={w}", p.model);
                        assert_eq!(g.x % p.alignment.origin, 0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_contact_sensor_has_no_lead_in() {
        let req = request(300, ScanArea::new(0, 0, 1001, 40), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP150")).unwrap();
        assert_eq!(plan.geometry.raw_width, 1004);
        assert_eq!(plan.geometry.lead_in, 0);
        assert_eq!(plan.geometry.raw_height, 40);
        assert_eq!(plan.params.bits_per_pixel, 24);
        assert!(plan.shift.is_identity());
    }

    #[test]
    fn test_ccd_lead_in_added_to_height() {
        // 300 dpi on the MP810: color shift 300 / 50 = 6.
        let req = request(300, ScanArea::new(0, 0, 320, 100), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP810")).unwrap();
        assert_eq!(plan.shift.color_shift, 6);
        assert_eq!(plan.shift.planes, [12, 6, 0]);
        assert_eq!(plan.geometry.lead_in, 12);
        assert_eq!(plan.geometry.raw_height, 112);
        assert_eq!(plan.params.raw_height, 112);
    }

    #[test]
    fn test_stripe_and_jump_counted() {
        let req = request(4800, ScanArea::new(0, 0, 640, 50), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP810")).unwrap();
        assert_eq!(plan.shift.color_shift, 96);
        assert_eq!(plan.geometry.lead_in, 2 * 96 + 3 + 33);
        assert!(plan.shift.split_halves);
        assert_eq!(plan.reorder.stages, vec![ReorderStage::Pairs]);
        assert_eq!(plan.reorder.factor, 2);
    }

    #[test]
    fn test_shift_tables_past_lead_in_rejected() {
        let mut mp810 = profile("MP810");
        for entry in &mut mp810.stripes {
            entry.flatbed.stripe = 0;
            entry.flatbed.stripe2 = 5;
        }
        let req = request(4800, ScanArea::new(0, 0, 64, 20), ColorMode::Color, PaperSource::Flatbed);
        assert!(matches!(resolve(&req, &mp810), Err(DriverError::InvalidParameter(_))));
    }

    #[test]
    fn test_resolution_steps_and_rescale() {
        let req = request(1000, ScanArea::new(100, 100, 1000, 1000), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP150")).unwrap();
        assert_eq!(plan.geometry.xdpi, 600);
        assert_eq!(plan.geometry.width, 600);
        assert_eq!(plan.request.area.x, 60);

        let req = request(9600, ScanArea::new(0, 0, 100, 100), ColorMode::Color, PaperSource::Flatbed);
        assert_eq!(resolve(&req, &profile("MP150")).unwrap().geometry.xdpi, 1200);

        let mut req = request(150, ScanArea::new(0, 0, 100, 100), ColorMode::Color, PaperSource::Tpu);
        req.ydpi = 600;
        assert_eq!(resolve(&req, &profile("9000F")).unwrap().geometry.xdpi, 300);
    }

    #[test]
    fn test_crop_clamped_to_device() {
        // 638 units at 75 dpi.
        let req = request(75, ScanArea::new(630, 0, 200, 5), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP150")).unwrap();
        assert_eq!(plan.request.area.x, 622);
        assert_eq!(plan.geometry.width, 16);
        assert_eq!(plan.geometry.height, 16);
    }

    #[test]
    fn test_origin_outside_area_is_invalid() {
        let req = request(75, ScanArea::new(638, 0, 10, 10), ColorMode::Color, PaperSource::Flatbed);
        let err = resolve(&req, &profile("MP150")).unwrap_err();
        assert!(matches!(err, DriverError::InvalidParameter(_)));

        let req = request(75, ScanArea::new(0, 0, 0, 10), ColorMode::Color, PaperSource::Flatbed);
        assert!(matches!(
            resolve(&req, &profile("MP150")),
            Err(DriverError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_source_fallback() {
        let req = request(300, ScanArea::new(0, 0, 100, 100), ColorMode::Color, PaperSource::Tpu);
        let plan = resolve(&req, &profile("MX850")).unwrap();
        assert_eq!(plan.params.source, PaperSource::Flatbed);

        let caps = Capabilities {
            adf: true,
            ..Capabilities::default()
        };
        assert_eq!(fallback_source(PaperSource::AdfDuplex, &caps), PaperSource::Adf);
        assert_eq!(
            fallback_source(PaperSource::AdfDuplex, &Capabilities::default()),
            PaperSource::Flatbed
        );
    }

    #[test]
    fn test_unsupported_modes() {
        let area = ScanArea::new(0, 0, 100, 100);
        let lineart_tpu = request(300, area, ColorMode::Lineart, PaperSource::Tpu);
        assert!(matches!(
            resolve(&lineart_tpu, &profile("9000F")),
            Err(DriverError::Unsupported(_))
        ));
        let ir_flatbed = request(600, area, ColorMode::Infrared, PaperSource::Flatbed);
        assert!(matches!(
            resolve(&ir_flatbed, &profile("9000F")),
            Err(DriverError::Unsupported(_))
        ));
        let deep = request(300, area, ColorMode::Color48, PaperSource::Flatbed);
        assert!(matches!(
            resolve(&deep, &profile("MP810")),
            Err(DriverError::Unsupported(_))
        ));
    }

    #[test]
    fn test_lineart_width_multiple_of_eight() {
        let req = request(150, ScanArea::new(0, 0, 45, 20), ColorMode::Lineart, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MX850")).unwrap();
        assert_eq!(plan.geometry.width, 48);
        assert_eq!(plan.output.bytes_per_line, 6);
        assert_eq!(plan.geometry.raw_channels, 1);
        assert!(plan.params.single_channel);
    }

    #[test]
    fn test_ccd_gray_scans_color() {
        let req = request(150, ScanArea::new(0, 0, 100, 20), ColorMode::Gray, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP970")).unwrap();
        assert_eq!(plan.geometry.raw_channels, 3);
        assert_eq!(plan.conversion, Conversion::Gray);
        assert_eq!(plan.output.bytes_per_line, 100);
    }

    #[test]
    fn test_tpu_geometry_and_48bit_transfer() {
        let req = request(600, ScanArea::new(64, 100, 640, 9000), ColorMode::Color, PaperSource::Tpu);
        let plan = resolve(&req, &profile("8800F")).unwrap();
        let g = plan.geometry;
        // 740 units of film at 600 dpi, minus the origin.
        assert_eq!(g.height, 740 * 8 - 100);
        assert_eq!(g.y, 100 + 140 * 2);
        assert_eq!(g.transfer_depth, 16);
        assert_eq!(g.raw_depth, 8);
        assert!(plan.pack_16_to_8);
        assert_eq!(plan.params.bits_per_pixel, 48);
        assert_eq!(g.transfer_line_bytes(), 2 * g.raw_line_bytes());
    }

    #[test]
    fn test_origin_alignment_offset() {
        let req = request(300, ScanArea::new(70, 0, 100, 20), ColorMode::Color, PaperSource::Flatbed);
        let plan = resolve(&req, &profile("MP970")).unwrap();
        let g = plan.geometry;
        assert_eq!(g.x, 64);
        assert_eq!(g.x_offset, 6);
        assert_eq!(g.raw_width, 128);
    }
}
