//! Init / Reset derivation of the rate-control settings.
//!
//! Everything here is a pure function of [`SequenceParams`]; the model in
//! [`super::RateControlModel`] owns the result together with the running
//! buffer fullness.

use kp_common::config::{FrameSizeTolerance, RateControlMode, SequenceParams};
use kp_common::error::PipelineResult;
use kp_common::types::Rational;

/// Lower clamp of the buffer-relative bits-per-frame ratio.
pub const BPS_RATIO_MIN: f64 = 0.1;
/// Upper clamp of the buffer-relative bits-per-frame ratio.
pub const BPS_RATIO_MAX: f64 = 3.5;
/// Longest frame-size sliding window, in frames.
pub const MAX_SLIDING_WINDOW: u32 = 60;

/// Number of thresholds per frame class.
pub const THRESHOLDS_PER_CLASS: usize = 8;

/// (scale, base) pairs; each threshold is `scale * base^bps_ratio`.
const PB_THRESHOLDS: [(f64, f64); THRESHOLDS_PER_CLASS] = [
    (-50.0, 0.9),
    (-50.0, 0.66),
    (-50.0, 0.46),
    (-50.0, 0.3),
    (50.0, 0.3),
    (50.0, 0.46),
    (50.0, 0.7),
    (50.0, 0.9),
];

const VBR_THRESHOLDS: [(f64, f64); THRESHOLDS_PER_CLASS] = [
    (-50.0, 0.9),
    (-50.0, 0.7),
    (-50.0, 0.5),
    (-50.0, 0.3),
    (100.0, 0.4),
    (100.0, 0.5),
    (100.0, 0.75),
    (100.0, 0.9),
];

const I_THRESHOLDS: [(f64, f64); THRESHOLDS_PER_CLASS] = [
    (-50.0, 0.8),
    (-50.0, 0.6),
    (-50.0, 0.34),
    (-50.0, 0.2),
    (50.0, 0.2),
    (50.0, 0.4),
    (50.0, 0.66),
    (50.0, 0.9),
];

/// Frame class used to pick a threshold row and QP-adjust row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviationClass {
    PB = 0,
    Vbr = 1,
    I = 2,
}

/// Frame-size deviation thresholds (percent of target) for the three
/// frame classes. Each row is non-decreasing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviationThresholds {
    pub pb: [i8; THRESHOLDS_PER_CLASS],
    pub vbr: [i8; THRESHOLDS_PER_CLASS],
    pub i: [i8; THRESHOLDS_PER_CLASS],
}

impl DeviationThresholds {
    pub fn for_ratio(bps_ratio: f64) -> Self {
        Self {
            pb: threshold_row(&PB_THRESHOLDS, bps_ratio),
            vbr: threshold_row(&VBR_THRESHOLDS, bps_ratio),
            i: threshold_row(&I_THRESHOLDS, bps_ratio),
        }
    }

    pub fn row(&self, class: DeviationClass) -> &[i8; THRESHOLDS_PER_CLASS] {
        match class {
            DeviationClass::PB => &self.pb,
            DeviationClass::Vbr => &self.vbr,
            DeviationClass::I => &self.i,
        }
    }

    /// Bin (0..=8) of a deviation in percent: the number of thresholds it
    /// reaches.
    pub fn bin(&self, class: DeviationClass, deviation_pct: f64) -> usize {
        self.row(class)
            .iter()
            .filter(|&&t| deviation_pct >= f64::from(t))
            .count()
    }
}

fn threshold_row(row: &[(f64, f64); THRESHOLDS_PER_CLASS], ratio: f64) -> [i8; THRESHOLDS_PER_CLASS] {
    let mut out = [0i8; THRESHOLDS_PER_CLASS];
    for (slot, (scale, base)) in out.iter_mut().zip(row.iter()) {
        // Float-to-int `as` truncates toward zero and saturates.
        *slot = (scale * base.powf(ratio)) as i8;
    }
    out
}

/// Rate-control settings derived at Init and re-derived at Reset.
#[derive(Clone, Debug, PartialEq)]
pub struct BrcSettings {
    pub rc_mode: RateControlMode,
    pub frame_rate: Rational,
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    /// Adaptive QP ceiling for ICQ / QVBR.
    pub quality_factor: Option<u16>,
    pub input_bits_per_frame: f64,
    pub buffer_size_bits: u32,
    pub init_fullness_bits: u32,
    pub bps_ratio: f64,
    pub thresholds: DeviationThresholds,
    pub gop_p: u32,
    pub gop_b: u32,
    pub min_qp: u8,
    pub max_qp: u8,
    pub sliding_window_size: u32,
    pub field_coding: bool,
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub frame_size_tolerance: FrameSizeTolerance,
    pub auto_max_pb_frame_size: bool,
    pub multi_ref_qp: bool,
    pub avbr_accuracy: u16,
    pub avbr_convergence: u16,
}

impl BrcSettings {
    pub fn derive(seq: &SequenceParams) -> PipelineResult<Self> {
        seq.validate()?;

        let mut average = f64::from(seq.target_bitrate);
        let mut max = f64::from(seq.effective_max_bitrate());
        match seq.rc_mode {
            RateControlMode::Cbr | RateControlMode::Avbr => max = average,
            RateControlMode::Vbr | RateControlMode::Qvbr if max < average => average = max,
            _ => {}
        }
        let quality_factor = seq
            .rc_mode
            .uses_quality_factor()
            .then_some(seq.icq_quality_factor);

        let fps = seq.frame_rate;
        let mut ibpf = max * f64::from(fps.den) / f64::from(fps.num);
        if seq.field_coding {
            ibpf *= 0.5;
        }

        let mut buffer = seq.vbv_buffer_size_bits;
        if buffer == 0 {
            buffer = (ibpf as u32).saturating_mul(4);
        }

        let mut init = seq.init_vbv_fullness_bits;
        if init == 0 {
            init = (u64::from(buffer) * 7 / 8) as u32;
        }
        let floor = (2.0 * ibpf) as u32;
        if init < floor {
            init = floor;
        }
        if init > buffer {
            init = buffer;
        }

        if seq.rc_mode == RateControlMode::Avbr {
            buffer = seq.target_bitrate.saturating_mul(2);
            init = (0.75 * f64::from(buffer)) as u32;
        }

        let bps_ratio = if buffer == 0 {
            BPS_RATIO_MIN
        } else {
            (ibpf / (f64::from(buffer) / 30.0)).clamp(BPS_RATIO_MIN, BPS_RATIO_MAX)
        };

        let (gop_p, gop_b) = gop_counts(seq.gop_size, seq.gop_ref_dist);

        Ok(Self {
            rc_mode: seq.rc_mode,
            frame_rate: fps,
            average_bitrate: average as u32,
            max_bitrate: max as u32,
            quality_factor,
            input_bits_per_frame: ibpf,
            buffer_size_bits: buffer,
            init_fullness_bits: init,
            bps_ratio,
            thresholds: DeviationThresholds::for_ratio(bps_ratio),
            gop_p,
            gop_b,
            min_qp: seq.min_qp,
            max_qp: seq.max_qp,
            sliding_window_size: fps.rounded().min(MAX_SLIDING_WINDOW),
            field_coding: seq.field_coding,
            width_in_mbs: seq.resolution.width_in_mbs(),
            height_in_mbs: seq.resolution.height_in_mbs(),
            frame_size_tolerance: seq.frame_size_tolerance,
            auto_max_pb_frame_size: seq.auto_max_pb_frame_size,
            multi_ref_qp: seq.multi_ref_qp,
            avbr_accuracy: seq.avbr_accuracy,
            avbr_convergence: seq.avbr_convergence,
        })
    }

    /// Threshold / QP-adjust class for a frame of this coding type.
    pub fn deviation_class(&self, intra: bool) -> DeviationClass {
        if intra {
            DeviationClass::I
        } else if self.rc_mode == RateControlMode::Cbr {
            DeviationClass::PB
        } else {
            DeviationClass::Vbr
        }
    }
}

/// P and B frame counts in one GOP.
pub fn gop_counts(gop_size: u32, ref_dist: u32) -> (u32, u32) {
    let non_intra = gop_size.saturating_sub(1);
    let p = if ref_dist == 0 { 0 } else { non_intra / ref_dist };
    (p, non_intra - p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_params(rc_mode: RateControlMode) -> SequenceParams {
        SequenceParams {
            rc_mode,
            target_bitrate: 2_000_000,
            frame_rate: Rational::FPS_30,
            ..SequenceParams::default()
        }
    }

    // ── Buffer derivation ───────────────────────────────────────────

    #[test]
    fn cbr_default_buffer_is_four_frames() {
        let s = BrcSettings::derive(&make_params(RateControlMode::Cbr)).unwrap();
        let ibpf = 2_000_000.0 / 30.0;
        assert!((s.input_bits_per_frame - ibpf).abs() < 1e-6);
        assert_eq!(s.buffer_size_bits, 4 * (ibpf as u32));
        assert!(s.init_fullness_bits >= (2.0 * ibpf) as u32);
        assert!(s.init_fullness_bits <= s.buffer_size_bits);
        assert_eq!(s.init_fullness_bits, (u64::from(s.buffer_size_bits) * 7 / 8) as u32);
    }

    #[test]
    fn small_initial_fullness_is_raised() {
        let params = SequenceParams {
            init_vbv_fullness_bits: 1000,
            ..make_params(RateControlMode::Cbr)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert_eq!(s.init_fullness_bits, (2.0 * s.input_bits_per_frame) as u32);
    }

    #[test]
    fn oversized_initial_fullness_is_capped() {
        let params = SequenceParams {
            vbv_buffer_size_bits: 500_000,
            init_vbv_fullness_bits: 900_000,
            ..make_params(RateControlMode::Cbr)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert_eq!(s.init_fullness_bits, 500_000);
    }

    #[test]
    fn field_coding_halves_bits_per_picture() {
        let params = SequenceParams {
            field_coding: true,
            ..make_params(RateControlMode::Cbr)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert!((s.input_bits_per_frame - 2_000_000.0 / 60.0).abs() < 1e-6);
    }

    // ── Mode adjustments ────────────────────────────────────────────

    #[test]
    fn cbr_peak_equals_average() {
        let params = SequenceParams {
            max_bitrate: 4_000_000,
            ..make_params(RateControlMode::Cbr)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert_eq!(s.max_bitrate, 2_000_000);
    }

    #[test]
    fn vbr_average_limited_by_peak() {
        let params = SequenceParams {
            max_bitrate: 1_500_000,
            ..make_params(RateControlMode::Vbr)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert_eq!(s.average_bitrate, 1_500_000);
        assert_eq!(s.max_bitrate, 1_500_000);
    }

    #[test]
    fn avbr_overrides_buffer() {
        let s = BrcSettings::derive(&make_params(RateControlMode::Avbr)).unwrap();
        assert_eq!(s.buffer_size_bits, 4_000_000);
        assert_eq!(s.init_fullness_bits, 3_000_000);
    }

    #[test]
    fn quality_factor_only_for_icq_and_qvbr() {
        let s = BrcSettings::derive(&make_params(RateControlMode::Icq)).unwrap();
        assert_eq!(s.quality_factor, Some(26));
        let s = BrcSettings::derive(&make_params(RateControlMode::Qvbr)).unwrap();
        assert_eq!(s.quality_factor, Some(26));
        let s = BrcSettings::derive(&make_params(RateControlMode::Vbr)).unwrap();
        assert_eq!(s.quality_factor, None);
    }

    #[test]
    fn icq_without_bitrate_derives_zero_buffer() {
        let params = SequenceParams {
            target_bitrate: 0,
            ..make_params(RateControlMode::Icq)
        };
        let s = BrcSettings::derive(&params).unwrap();
        assert_eq!(s.buffer_size_bits, 0);
        assert_eq!(s.bps_ratio, BPS_RATIO_MIN);
    }

    // ── Thresholds ──────────────────────────────────────────────────

    #[test]
    fn bps_ratio_is_clamped() {
        let tiny_buffer = SequenceParams {
            vbv_buffer_size_bits: 1000,
            ..make_params(RateControlMode::Cbr)
        };
        assert_eq!(BrcSettings::derive(&tiny_buffer).unwrap().bps_ratio, BPS_RATIO_MAX);

        let huge_buffer = SequenceParams {
            vbv_buffer_size_bits: u32::MAX,
            ..make_params(RateControlMode::Cbr)
        };
        assert_eq!(BrcSettings::derive(&huge_buffer).unwrap().bps_ratio, BPS_RATIO_MIN);
    }

    #[test]
    fn thresholds_monotonic_over_ratio_range() {
        let mut ratio = BPS_RATIO_MIN;
        while ratio <= BPS_RATIO_MAX {
            let t = DeviationThresholds::for_ratio(ratio);
            for row in [&t.pb, &t.vbr, &t.i] {
                assert!(
                    row.windows(2).all(|w| w[0] <= w[1]),
                    "row {row:?} not monotonic at ratio {ratio}"
                );
            }
            ratio += 0.05;
        }
    }

    #[test]
    fn thresholds_at_unit_ratio() {
        let t = DeviationThresholds::for_ratio(1.0);
        assert_eq!(t.pb, [-45, -33, -23, -15, 15, 23, 35, 45]);
        assert_eq!(t.vbr, [-45, -35, -25, -15, 40, 50, 75, 90]);
        assert_eq!(t.i, [-40, -30, -17, -10, 10, 20, 33, 45]);
    }

    #[test]
    fn deviation_bins() {
        let t = DeviationThresholds::for_ratio(1.0);
        assert_eq!(t.bin(DeviationClass::PB, -80.0), 0);
        assert_eq!(t.bin(DeviationClass::PB, 0.0), 4);
        assert_eq!(t.bin(DeviationClass::PB, 100.0), 8);
    }

    // ── GOP ─────────────────────────────────────────────────────────

    #[test]
    fn gop_counts_split() {
        assert_eq!(gop_counts(30, 1), (29, 0));
        assert_eq!(gop_counts(31, 3), (10, 20));
        assert_eq!(gop_counts(30, 0), (0, 29));
        assert_eq!(gop_counts(1, 1), (0, 0));
    }

    #[test]
    fn sliding_window_caps_at_sixty() {
        let params = SequenceParams {
            frame_rate: Rational::new(120, 1),
            ..make_params(RateControlMode::Cbr)
        };
        assert_eq!(BrcSettings::derive(&params).unwrap().sliding_window_size, 60);
        let s = BrcSettings::derive(&make_params(RateControlMode::Cbr)).unwrap();
        assert_eq!(s.sliding_window_size, 30);
    }
}
