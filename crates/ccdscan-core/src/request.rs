//! User-level scan request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the document is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaperSource {
    #[default]
    Flatbed,
    /// Sheet feeder, front side only.
    Adf,
    /// Sheet feeder, both sides.
    AdfDuplex,
    /// Transparency unit for film and slides.
    Tpu,
}

impl PaperSource {
    pub fn is_feeder(&self) -> bool {
        matches!(self, Self::Adf | Self::AdfDuplex)
    }
}

impl fmt::Display for PaperSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flatbed => write!(f, "flatbed"),
            Self::Adf => write!(f, "adf"),
            Self::AdfDuplex => write!(f, "adf-duplex"),
            Self::Tpu => write!(f, "tpu"),
        }
    }
}

impl FromStr for PaperSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flatbed" => Ok(Self::Flatbed),
            "adf" => Ok(Self::Adf),
            "adf-duplex" | "duplex" => Ok(Self::AdfDuplex),
            "tpu" | "film" => Ok(Self::Tpu),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    #[default]
    Color,
    /// 16 bits per channel.
    Color48,
    Gray,
    Gray16,
    /// 1 bit per pixel, binarized in software.
    Lineart,
    /// Infra-red plane from the transparency unit.
    Infrared,
}

impl ColorMode {
    /// Channels in the delivered image.
    pub fn channels(&self) -> u8 {
        match self {
            Self::Color | Self::Color48 => 3,
            _ => 1,
        }
    }

    /// Bits per channel in the delivered image.
    pub fn depth(&self) -> u8 {
        match self {
            Self::Color48 | Self::Gray16 => 16,
            Self::Lineart => 1,
            _ => 8,
        }
    }

    pub fn is_high_depth(&self) -> bool {
        self.depth() == 16
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Color => write!(f, "color"),
            Self::Color48 => write!(f, "color48"),
            Self::Gray => write!(f, "gray"),
            Self::Gray16 => write!(f, "gray16"),
            Self::Lineart => write!(f, "lineart"),
            Self::Infrared => write!(f, "infrared"),
        }
    }
}

impl FromStr for ColorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "color" | "colour" => Ok(Self::Color),
            "color48" => Ok(Self::Color48),
            "gray" | "grey" => Ok(Self::Gray),
            "gray16" => Ok(Self::Gray16),
            "lineart" | "bw" => Ok(Self::Lineart),
            "infrared" | "ir" => Ok(Self::Infrared),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Crop rectangle in pixels at the requested resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ScanArea {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Software binarization settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineartParams {
    /// Fixed threshold, or the centre of the adaptive curve.
    pub threshold: u8,
    /// Slope of the adaptive curve; 0 selects the fixed threshold.
    pub threshold_curve: u8,
}

impl Default for LineartParams {
    fn default() -> Self {
        Self {
            threshold: 127,
            threshold_curve: 0,
        }
    }
}

/// A scan as the caller asks for it. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub xdpi: u32,
    pub ydpi: u32,
    pub area: ScanArea,
    pub mode: ColorMode,
    pub source: PaperSource,
    /// Tone curve exponent; the session default applies when unset.
    pub gamma: Option<f64>,
    pub lineart: LineartParams,
}

impl ScanRequest {
    pub fn new(dpi: u32, area: ScanArea, mode: ColorMode, source: PaperSource) -> Self {
        Self {
            xdpi: dpi,
            ydpi: dpi,
            area,
            mode,
            source,
            gamma: None,
            lineart: LineartParams::default(),
        }
    }
}

impl Default for ScanRequest {
    fn default() -> Self {
        // Letter-sized flatbed area at 75 dpi.
        Self::new(
            75,
            ScanArea::new(0, 0, 638, 877),
            ColorMode::Color,
            PaperSource::Flatbed,
        )
    }
}
