//! Per-model device profiles.
//!
//! Everything that differs between scanner models is data here: geometry,
//! resolution ranges, alignment and the calibration tables that drive the
//! reassembly pipeline. The negotiator and pipeline never branch on a
//! model id.
//!
//! The stripe, jump and reorder entries are empirical calibration data
//! measured on real units; they are not derivable from the protocol.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::DriverError;
use crate::pipeline::reorder::ReorderStage;
use crate::protocol::ProtocolFamily;
use crate::protocol::commands::{ButtonCode, CommandTable};
use crate::protocol::constants::*;
use crate::request::PaperSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    /// Contact image sensor: all colors sampled on the same row.
    Contact,
    /// Charge-coupled sensor with physically separated color rows.
    Ccd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub adf: bool,
    pub adf_duplex: bool,
    pub tpu: bool,
    pub tpu_infrared: bool,
    /// 16 bits per channel modes.
    pub high_depth: bool,
}

impl Capabilities {
    pub fn supports(&self, source: PaperSource) -> bool {
        match source {
            PaperSource::Flatbed => true,
            PaperSource::Adf => self.adf || self.adf_duplex,
            PaperSource::AdfDuplex => self.adf_duplex,
            PaperSource::Tpu => self.tpu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionLimits {
    pub min: u32,
    pub max: u32,
}

impl ResolutionLimits {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

/// Independent resolution ranges per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionTable {
    pub flatbed: ResolutionLimits,
    pub adf: Option<ResolutionLimits>,
    pub tpu: Option<ResolutionLimits>,
    pub infrared: Option<ResolutionLimits>,
}

impl ResolutionTable {
    pub fn for_source(&self, source: PaperSource, infrared: bool) -> ResolutionLimits {
        let specific = match source {
            PaperSource::Flatbed => None,
            PaperSource::Adf | PaperSource::AdfDuplex => self.adf,
            PaperSource::Tpu if infrared => self.infrared.or(self.tpu),
            PaperSource::Tpu => self.tpu,
        };
        specific.unwrap_or(self.flatbed)
    }
}

/// Raw line width alignment in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentRule {
    /// Three-channel transfers.
    pub color: u32,
    /// Single-channel transfers.
    pub gray: u32,
    /// The left edge sent to the device is moved down to a multiple of this.
    pub origin: u32,
}

impl AlignmentRule {
    pub fn width_alignment(&self, channels: u8) -> u32 {
        if channels == 1 { self.gray } else { self.color }
    }
}

/// How far the color rows are apart, as a function of vertical resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorShiftRule {
    /// No shift at or below this resolution.
    pub above_ydpi: u32,
    /// `color_shift = ydpi / divisor`.
    pub divisor: u32,
    /// Per-plane multiple of `color_shift` (R, G, B). Largest must be 2.
    pub planes: [u32; 3],
}

/// Stripe offsets for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeShift {
    /// Extra lines for even columns.
    pub stripe: u32,
    /// Extra lines for even columns of the second half.
    pub stripe2: u32,
    /// Extra lines for the whole second half.
    pub jump: u32,
}

/// Stripe table entry for one horizontal resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeEntry {
    pub xdpi: u32,
    pub flatbed: StripeShift,
    pub tpu: StripeShift,
    /// The two halves of a line come from separate sensor banks.
    pub split_halves: bool,
}

/// Reorder stages for one horizontal resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderOverride {
    pub xdpi: u32,
    /// Forces the interleave factor.
    pub factor: Option<u32>,
    pub stages: Vec<ReorderStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRule {
    /// Above this resolution the sensor emits `xdpi / native_dpi` sub-images.
    pub native_dpi: u32,
    pub max_factor: Option<u32>,
    #[serde(default)]
    pub overrides: Vec<ReorderOverride>,
}

impl ReorderRule {
    /// Interleave factor and stage list for a resolution.
    pub fn resolve(&self, xdpi: u32) -> (u32, Vec<ReorderStage>) {
        let mut factor = xdpi / self.native_dpi.max(1);
        if let Some(max) = self.max_factor {
            factor = factor.min(max);
        }
        match self.overrides.iter().find(|o| o.xdpi == xdpi) {
            Some(o) => (o.factor.unwrap_or(factor), o.stages.clone()),
            None => (factor, vec![ReorderStage::Interleave]),
        }
    }
}

/// Transparency unit geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpuGeometry {
    /// Vertical offset at 300 dpi added to non-zero origins.
    pub offset_y: u32,
    /// Maximum film height in 1/75 inch.
    pub max_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub model: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub family: ProtocolFamily,
    pub generation: u8,
    pub sensor: SensorKind,
    /// Scan area in 1/75 inch.
    pub width: u32,
    pub height: u32,
    pub capabilities: Capabilities,
    pub resolutions: ResolutionTable,
    pub alignment: AlignmentRule,
    pub color_shift: Option<ColorShiftRule>,
    #[serde(default)]
    pub stripes: Vec<StripeEntry>,
    pub reorder: ReorderRule,
    pub tpu_geometry: Option<TpuGeometry>,
    /// Transparency scans always transfer 16 bits per channel.
    #[serde(default)]
    pub tpu_transfers_48bit: bool,
    #[serde(default)]
    pub button_code: Option<ButtonCode>,
}

impl DeviceProfile {
    pub fn needs_calibration(&self) -> bool {
        self.sensor == SensorKind::Ccd
    }

    /// Command table of the model's family with per-model overrides.
    pub fn command_table(&self) -> CommandTable {
        let mut table = CommandTable::for_family(self.family);
        if self.button_code.is_some() {
            table.interrupt.button_code = self.button_code;
        }
        table
    }

    pub fn stripe_entry(&self, xdpi: u32) -> Option<&StripeEntry> {
        self.stripes.iter().find(|s| s.xdpi == xdpi)
    }

    /// Look up a built-in profile by model name or product id.
    pub fn find(name: &str) -> Option<Self> {
        let pid = u16::from_str_radix(name.trim_start_matches("0x"), 16).ok();
        builtin_profiles().into_iter().find(|p| {
            p.model.eq_ignore_ascii_case(name)
                || p.name.eq_ignore_ascii_case(name)
                || Some(p.product_id) == pid
        })
    }

    /// Load a profile from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading profile {}", path.as_ref().display()))?;
        let profile: Self = toml::from_str(&content)?;
        profile
            .validate()
            .with_context(|| format!("profile {}", path.as_ref().display()))?;
        Ok(profile)
    }

    /// Check the shift tables against the lead-in the pipeline buffers:
    /// no plane may lag more than twice the color shift and the second-half
    /// stripe may not exceed the first.
    pub fn validate(&self) -> Result<(), DriverError> {
        if let Some(rule) = self.color_shift
            && rule.planes.iter().any(|&p| p > 2)
        {
            return Err(DriverError::InvalidParameter(format!(
                "{}: plane multiples {:?} exceed 2",
                self.model, rule.planes
            )));
        }
        for entry in &self.stripes {
            for shift in [entry.flatbed, entry.tpu] {
                if shift.stripe2 > shift.stripe {
                    return Err(DriverError::InvalidParameter(format!(
                        "{}: stripe2 {} above stripe {} at {} dpi",
                        self.model, shift.stripe2, shift.stripe, entry.xdpi
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

const LETTER_WIDTH: u32 = 638;
const LETTER_HEIGHT: u32 = 877;
const LEGAL_HEIGHT: u32 = 1050;

fn contact(name: &str, model: &str, pid: u16, generation: u8, max_dpi: u32) -> DeviceProfile {
    let family = if generation == 1 {
        ProtocolFamily::Legacy
    } else {
        ProtocolFamily::Standard
    };
    DeviceProfile {
        name: name.into(),
        model: model.into(),
        vendor_id: CANON_VENDOR_ID,
        product_id: pid,
        family,
        generation,
        sensor: SensorKind::Contact,
        width: LETTER_WIDTH,
        height: LETTER_HEIGHT,
        capabilities: Capabilities::default(),
        resolutions: ResolutionTable {
            flatbed: ResolutionLimits::new(75, max_dpi),
            adf: None,
            tpu: None,
            infrared: None,
        },
        alignment: alignment_for(generation),
        color_shift: None,
        stripes: Vec::new(),
        reorder: ReorderRule {
            native_dpi: if generation >= 3 { 600 } else { 2400 },
            max_factor: None,
            overrides: Vec::new(),
        },
        tpu_geometry: None,
        tpu_transfers_48bit: false,
        button_code: None,
    }
}

fn ccd(name: &str, model: &str, pid: u16, generation: u8) -> DeviceProfile {
    let family = if generation >= 3 {
        ProtocolFamily::Extended
    } else {
        ProtocolFamily::Standard
    };
    DeviceProfile {
        name: name.into(),
        model: model.into(),
        vendor_id: CANON_VENDOR_ID,
        product_id: pid,
        family,
        generation,
        sensor: SensorKind::Ccd,
        width: LETTER_WIDTH,
        height: LETTER_HEIGHT,
        capabilities: Capabilities {
            tpu: true,
            ..Capabilities::default()
        },
        resolutions: ResolutionTable {
            flatbed: ResolutionLimits::new(75, 4800),
            adf: None,
            tpu: Some(ResolutionLimits::new(300, 4800)),
            infrared: None,
        },
        alignment: alignment_for(generation),
        color_shift: None,
        stripes: Vec::new(),
        reorder: ReorderRule {
            native_dpi: if generation >= 3 { 600 } else { 2400 },
            max_factor: None,
            overrides: Vec::new(),
        },
        tpu_geometry: None,
        tpu_transfers_48bit: generation >= 3,
        button_code: None,
    }
}

fn alignment_for(generation: u8) -> AlignmentRule {
    if generation >= 2 {
        AlignmentRule {
            color: 32,
            gray: 32,
            origin: 32,
        }
    } else {
        AlignmentRule {
            color: 4,
            gray: 12,
            origin: 1,
        }
    }
}

fn stripe(xdpi: u32, flatbed: u32, tpu: u32) -> StripeEntry {
    StripeEntry {
        xdpi,
        flatbed: StripeShift {
            stripe: flatbed,
            ..StripeShift::default()
        },
        tpu: StripeShift {
            stripe: tpu,
            ..StripeShift::default()
        },
        split_halves: false,
    }
}

fn banked(xdpi: u32, flatbed: u32, tpu: u32, jump: u32, split_halves: bool) -> StripeEntry {
    StripeEntry {
        xdpi,
        flatbed: StripeShift {
            stripe: flatbed,
            stripe2: flatbed,
            jump,
        },
        tpu: StripeShift {
            stripe: tpu,
            stripe2: tpu,
            jump,
        },
        split_halves,
    }
}

fn octet_reorder(xdpi: u32) -> ReorderOverride {
    ReorderOverride {
        xdpi,
        factor: None,
        stages: vec![ReorderStage::Interleave, ReorderStage::Octet],
    }
}

/// Profiles for the models this crate knows about.
pub fn builtin_profiles() -> Vec<DeviceProfile> {
    let mp150 = contact("Canon PIXMA MP150", "MP150", MP150_PID, 1, 1200);

    let mut mx850 = contact("Canon PIXMA MX850", "MX850", MX850_PID, 2, 2400);
    mx850.height = LEGAL_HEIGHT;
    mx850.capabilities.adf = true;
    mx850.capabilities.adf_duplex = true;
    mx850.resolutions.adf = Some(ResolutionLimits::new(75, 600));

    // Second generation CCD: planes run blue-first.
    let mut mp810 = ccd("Canon PIXMA MP810", "MP810", MP810_PID, 2);
    mp810.color_shift = Some(ColorShiftRule {
        above_ydpi: 75,
        divisor: 50,
        planes: [2, 1, 0],
    });
    mp810.stripes = vec![stripe(2400, 3, 6), banked(4800, 3, 6, 33, true)];
    mp810.reorder.overrides = vec![ReorderOverride {
        xdpi: 4800,
        factor: None,
        stages: vec![ReorderStage::Pairs],
    }];

    let mut mp960 = mp810.clone();
    mp960.name = "Canon PIXMA MP960".into();
    mp960.model = "MP960".into();
    mp960.product_id = MP960_PID;

    let mut mp970 = ccd("Canon PIXMA MP970", "MP970", MP970_PID, 3);
    mp970.color_shift = Some(ColorShiftRule {
        above_ydpi: 75,
        divisor: 50,
        planes: [0, 1, 2],
    });
    mp970.stripes = vec![stripe(4800, 3, 6)];
    mp970.reorder.max_factor = Some(4);
    mp970.reorder.overrides = vec![octet_reorder(4800)];

    let mut cs8800f = mp970.clone();
    cs8800f.name = "Canon CanoScan 8800F".into();
    cs8800f.model = "8800F".into();
    cs8800f.product_id = CS8800F_PID;
    cs8800f.capabilities.high_depth = true;
    cs8800f.tpu_geometry = Some(TpuGeometry {
        offset_y: 140,
        max_height: 740,
    });
    cs8800f.button_code = Some(ButtonCode {
        offset: 1,
        button_2: 0x70,
    });

    let mut mp990 = ccd("Canon PIXMA MP990", "MP990", MP990_PID, 4);
    mp990.color_shift = Some(ColorShiftRule {
        above_ydpi: 150,
        divisor: 75,
        planes: [0, 1, 2],
    });
    // Bank offsets are consumed as lead-in but the halves are not split.
    mp990.stripes = vec![banked(4800, 3, 6, 34, false)];
    mp990.reorder.max_factor = Some(4);
    mp990.reorder.overrides = vec![octet_reorder(4800)];

    let mut cs9000f = ccd("Canon CanoScan 9000F", "9000F", CS9000F_PID, 4);
    cs9000f.capabilities.tpu_infrared = true;
    cs9000f.capabilities.high_depth = true;
    cs9000f.resolutions.tpu = Some(ResolutionLimits::new(300, 9600));
    cs9000f.resolutions.infrared = Some(ResolutionLimits::new(600, 2400));
    cs9000f.color_shift = Some(ColorShiftRule {
        above_ydpi: 75,
        divisor: 30,
        planes: [0, 1, 2],
    });
    cs9000f.stripes = vec![
        stripe(4800, 3, 6),
        StripeEntry {
            xdpi: 9600,
            flatbed: StripeShift::default(),
            tpu: StripeShift {
                stripe: 6,
                stripe2: 6,
                jump: 32,
            },
            split_halves: true,
        },
    ];
    cs9000f.reorder.max_factor = Some(4);
    cs9000f.reorder.overrides = vec![
        octet_reorder(4800),
        ReorderOverride {
            xdpi: 9600,
            factor: Some(8),
            stages: vec![ReorderStage::Pairs, ReorderStage::PairSwap],
        },
    ];
    cs9000f.tpu_geometry = Some(TpuGeometry {
        offset_y: 146,
        max_height: 740,
    });
    cs9000f.button_code = Some(ButtonCode {
        offset: 1,
        button_2: 0x50,
    });

    vec![mp150, mx850, mp810, mp960, mp970, cs8800f, mp990, cs9000f]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_model_and_pid() {
        assert_eq!(DeviceProfile::find("mp810").unwrap().product_id, MP810_PID);
        assert_eq!(DeviceProfile::find("0x1908").unwrap().model, "9000F");
        assert!(DeviceProfile::find("LiDE 20").is_none());
    }

    #[test]
    fn test_builtin_tables_consistent() {
        for p in builtin_profiles() {
            if let Some(rule) = p.color_shift {
                assert_eq!(rule.planes.iter().max(), Some(&2), "{}", p.model);
            }
            p.validate().unwrap();
            assert_eq!(p.needs_calibration(), p.sensor == SensorKind::Ccd);
        }
    }

    #[test]
    fn test_loaded_profile_with_long_second_stripe_rejected() {
        let mut profile = DeviceProfile::find("MP810").unwrap();
        for entry in &mut profile.stripes {
            entry.flatbed.stripe = 0;
            entry.flatbed.stripe2 = 5;
        }
        assert!(matches!(profile.validate(), Err(DriverError::InvalidParameter(_))));

        let path = std::env::temp_dir().join(format!("ccdscan-profile-{}.toml", std::process::id()));
        profile.save_to_file(&path).unwrap();
        let err = DeviceProfile::load_from_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{err:#}").contains("stripe2 5 above stripe 0"));
    }

    #[test]
    fn test_plane_multiple_above_two_rejected() {
        let mut profile = DeviceProfile::find("MP810").unwrap();
        if let Some(rule) = profile.color_shift.as_mut() {
            rule.planes = [3, 1, 0];
        }
        assert!(matches!(profile.validate(), Err(DriverError::InvalidParameter(_))));
    }

    #[test]
    fn test_reorder_resolution() {
        let cs9000f = DeviceProfile::find("9000F").unwrap();
        assert_eq!(cs9000f.reorder.resolve(1200), (2, vec![ReorderStage::Interleave]));
        assert_eq!(cs9000f.reorder.resolve(4800).0, 4);
        assert_eq!(
            cs9000f.reorder.resolve(9600),
            (8, vec![ReorderStage::Pairs, ReorderStage::PairSwap])
        );
        let mp810 = DeviceProfile::find("MP810").unwrap();
        assert_eq!(mp810.reorder.resolve(2400).0, 1);
    }

    #[test]
    fn test_resolution_table_fallback() {
        let mx850 = DeviceProfile::find("MX850").unwrap();
        assert_eq!(mx850.resolutions.for_source(PaperSource::Adf, false).max, 600);
        assert_eq!(mx850.resolutions.for_source(PaperSource::Flatbed, false).max, 2400);
        let cs9000f = DeviceProfile::find("9000F").unwrap();
        assert_eq!(cs9000f.resolutions.for_source(PaperSource::Tpu, true).max, 2400);
    }

    #[test]
    fn test_profile_toml_roundtrip() {
        let profile = DeviceProfile::find("8800F").unwrap();
        let text = toml::to_string_pretty(&profile).unwrap();
        let back: DeviceProfile = toml::from_str(&text).unwrap();
        assert_eq!(back, profile);
    }
}
