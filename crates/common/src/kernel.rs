//! GPU kernel identification: kernel binary families, operations and the
//! header slot each (operation, variant) pair occupies in its binary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, PipelineResult};

/// A multi-kernel binary as handed out by the kernel-binary provider.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelFamily {
    /// Macroblock encode, rate control, weighted prediction and scoreboard kernels.
    AvcEncode,
    /// 4x and 2x downscale kernels.
    Scaling,
    /// Hierarchical motion estimation kernels (P and B variants).
    Hme,
}

impl KernelFamily {
    /// Number of kernel headers the family's binary carries.
    pub fn header_count(self) -> usize {
        match self {
            Self::AvcEncode => AVC_ENCODE_HEADER_COUNT,
            Self::Scaling => 2,
            Self::Hme => 2,
        }
    }
}

/// Operation key used to look up a kernel inside a family binary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelOperation {
    Scaling,
    Me,
    MbEnc,
    MbEncAdv,
    Brc,
    WeightedPrediction,
    SwScoreboard,
}

impl KernelOperation {
    pub fn family(self) -> KernelFamily {
        match self {
            Self::Scaling => KernelFamily::Scaling,
            Self::Me => KernelFamily::Hme,
            Self::MbEnc
            | Self::MbEncAdv
            | Self::Brc
            | Self::WeightedPrediction
            | Self::SwScoreboard => KernelFamily::AvcEncode,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scaling => "scaling",
            Self::Me => "me",
            Self::MbEnc => "mbenc",
            Self::MbEncAdv => "mbenc_adv",
            Self::Brc => "brc",
            Self::WeightedPrediction => "weighted_prediction",
            Self::SwScoreboard => "sw_scoreboard",
        }
    }
}

impl fmt::Display for KernelOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rate-control kernels, in header order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BrcKernel {
    InitReset = 0,
    FrameUpdate = 1,
    Reset = 2,
    IFrameDistortion = 3,
    BlockCopy = 4,
    MbUpdate = 5,
}

// Header layout of the AvcEncode binary:
//   0..12   macroblock encode: quality I/P/B, normal I/P/B, performance I/P/B, advanced I/P/B
//   12..18  rate control (see BrcKernel)
//   18      weighted prediction
//   19      software scoreboard init
const MBENC_HEADERS: u32 = 9;
const MBENC_ADV_BASE: u32 = 9;
const BRC_BASE: u32 = 12;
const BRC_HEADERS: u32 = 6;
const WP_BASE: u32 = 18;
const SW_SCOREBOARD_BASE: u32 = 19;
pub const AVC_ENCODE_HEADER_COUNT: usize = 20;

/// (operation, variant index) pair selecting one kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelKey {
    pub operation: KernelOperation,
    pub variant: u32,
}

impl KernelKey {
    pub fn new(operation: KernelOperation, variant: u32) -> Self {
        Self { operation, variant }
    }

    pub fn brc(kernel: BrcKernel) -> Self {
        Self::new(KernelOperation::Brc, kernel as u32)
    }

    /// Position of this kernel's header within its family binary.
    pub fn header_index(self) -> PipelineResult<usize> {
        let (base, count) = match self.operation {
            KernelOperation::MbEnc => (0, MBENC_HEADERS),
            KernelOperation::MbEncAdv => (MBENC_ADV_BASE, 3),
            KernelOperation::Brc => (BRC_BASE, BRC_HEADERS),
            KernelOperation::WeightedPrediction => (WP_BASE, 1),
            KernelOperation::SwScoreboard => (SW_SCOREBOARD_BASE, 1),
            KernelOperation::Scaling | KernelOperation::Me => (0, 2),
        };
        if self.variant >= count {
            return Err(PipelineError::invalid(format!(
                "{} has no kernel variant {}",
                self.operation, self.variant
            )));
        }
        Ok((base + self.variant) as usize)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.operation, self.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_indices_follow_binary_layout() {
        assert_eq!(KernelKey::new(KernelOperation::MbEnc, 0).header_index().unwrap(), 0);
        assert_eq!(KernelKey::new(KernelOperation::MbEnc, 8).header_index().unwrap(), 8);
        assert_eq!(KernelKey::new(KernelOperation::MbEncAdv, 2).header_index().unwrap(), 11);
        assert_eq!(KernelKey::brc(BrcKernel::InitReset).header_index().unwrap(), 12);
        assert_eq!(KernelKey::brc(BrcKernel::MbUpdate).header_index().unwrap(), 17);
        assert_eq!(
            KernelKey::new(KernelOperation::WeightedPrediction, 0)
                .header_index()
                .unwrap(),
            18
        );
        assert_eq!(
            KernelKey::new(KernelOperation::SwScoreboard, 0)
                .header_index()
                .unwrap(),
            AVC_ENCODE_HEADER_COUNT - 1
        );
    }

    #[test]
    fn out_of_range_variant_is_invalid() {
        let err = KernelKey::new(KernelOperation::MbEncAdv, 3)
            .header_index()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { .. }));
        assert!(KernelKey::new(KernelOperation::Scaling, 2).header_index().is_err());
    }

    #[test]
    fn operations_map_to_families() {
        assert_eq!(KernelOperation::Me.family(), KernelFamily::Hme);
        assert_eq!(KernelOperation::Brc.family(), KernelFamily::AvcEncode);
        assert_eq!(KernelFamily::AvcEncode.header_count(), 20);
    }

    #[test]
    fn key_display() {
        assert_eq!(KernelKey::brc(BrcKernel::FrameUpdate).to_string(), "brc[1]");
    }
}
