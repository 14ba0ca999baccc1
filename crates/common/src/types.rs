//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

use crate::error::{PipelineError, PipelineResult};

/// Frame number (position in the encode order).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Add<u64> for FrameNumber {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Rational number for frame rates (e.g., 30000/1001 for 29.97fps).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const FPS_25: Self = Self { num: 25, den: 1 };
    pub const FPS_30: Self = Self { num: 30, den: 1 };
    pub const FPS_29_97: Self = Self {
        num: 30000,
        den: 1001,
    };
    pub const FPS_60: Self = Self { num: 60, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        assert!(den > 0, "Rational denominator must be > 0");
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Frame rate rounded to the nearest whole frame.
    pub fn rounded(self) -> u32 {
        self.as_f64().round() as u32
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Picture resolution in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width in 16x16 macroblocks, rounded up.
    pub fn width_in_mbs(self) -> u32 {
        self.width.div_ceil(16)
    }

    /// Height in 16x16 macroblocks, rounded up.
    pub fn height_in_mbs(self) -> u32 {
        self.height.div_ceil(16)
    }

    pub fn num_mbs(self) -> u32 {
        self.width_in_mbs() * self.height_in_mbs()
    }

    /// Resolution after downscaling by `factor` in each dimension.
    pub fn downscaled(self, factor: u32) -> Self {
        Self {
            width: self.width.div_ceil(factor),
            height: self.height.div_ceil(factor),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Picture coding type. The discriminants are the codec's raw values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PictureCodingType {
    I = 1,
    P = 2,
    B = 3,
}

impl PictureCodingType {
    /// Parse a raw picture coding type; anything other than I/P/B is fatal.
    pub fn from_raw(raw: u8) -> PipelineResult<Self> {
        match raw {
            1 => Ok(Self::I),
            2 => Ok(Self::P),
            3 => Ok(Self::B),
            other => Err(PipelineError::invalid(format!(
                "invalid picture coding type {other}"
            ))),
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Row index into per-frame-type constant tables (I=0, P=1, B=2).
    pub fn table_index(self) -> usize {
        self as usize - 1
    }

    /// Frame type as consumed by the rate-control kernels (P=0, B=1, I=2).
    pub fn brc_frame_type(self) -> u8 {
        (self.raw() + 1) % 3
    }

    pub fn is_intra(self) -> bool {
        self == Self::I
    }
}

impl fmt::Display for PictureCodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I => "I",
            Self::P => "P",
            Self::B => "B",
        };
        f.write_str(name)
    }
}

/// Frame or field structure of the current picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PictureStructure {
    #[default]
    Frame,
    TopField,
    BottomField,
}

impl PictureStructure {
    pub fn is_field(self) -> bool {
        !matches!(self, Self::Frame)
    }

    pub fn is_bottom_field(self) -> bool {
        matches!(self, Self::BottomField)
    }
}

/// Downscale / hierarchical motion estimation reduction factor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScaleFactor {
    X4,
    X16,
    X32,
}

impl ScaleFactor {
    /// Coarsest first.
    pub const COARSE_TO_FINE: [Self; 3] = [Self::X32, Self::X16, Self::X4];

    pub fn factor(self) -> u32 {
        match self {
            Self::X4 => 4,
            Self::X16 => 16,
            Self::X32 => 32,
        }
    }

    /// The next finer level, if any.
    pub fn finer(self) -> Option<Self> {
        match self {
            Self::X32 => Some(Self::X16),
            Self::X16 => Some(Self::X4),
            Self::X4 => None,
        }
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.factor())
    }
}

/// Reference picture list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefList {
    L0,
    L1,
}

impl fmt::Display for RefList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L0 => f.write_str("L0"),
            Self::L1 => f.write_str("L1"),
        }
    }
}

/// Rotating slot identifier for CPU/device overlap across frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecycleIndex(pub usize);

impl RecycleIndex {
    /// Round-robin successor within `count` slots.
    pub fn advance(self, count: usize) -> Self {
        Self((self.0 + 1) % count.max(1))
    }
}

impl fmt::Display for RecycleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}
