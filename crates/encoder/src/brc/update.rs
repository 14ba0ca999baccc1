//! Per-frame Update and statistics feedback.

use tracing::{debug, trace};

use kp_common::config::{FrameSizeTolerance, RateControlMode};
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::types::FrameNumber;

use super::{torn_down, AwaitingStats, RateControlModel, RcState};
use crate::frame::{BrcFrameInput, FrameContext, FrameStatistics, IntraRefresh, IntraRefreshMode};
use crate::tables::BRC_QP_ADJUST;

/// Intra rounding value handed to the update kernel.
pub const ROUNDING_INTRA: u8 = 5;

/// Where the rolling intra refresh band sits in this frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntraRefreshPosition {
    pub mode: IntraRefreshMode,
    /// First refreshed column or row, in macroblocks.
    pub first_mb: u32,
    pub unit_in_mbs: u32,
    pub qp_delta: i8,
}

/// Values the frame-update stage consumes for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct BrcUpdateOutput {
    pub frame: FrameNumber,
    /// Accumulated buffer fullness after carry-over and skip accounting.
    pub target_size: u32,
    /// Set when the fullness wrapped past one buffer size.
    pub target_size_flag: bool,
    pub num_skip_frames: u32,
    pub size_skip_frames: u32,
    pub header_bits: u32,
    /// 0 = P, 1 = B, 2 = I.
    pub frame_type: u8,
    pub field: bool,
    pub bottom_field: bool,
    pub is_reference: bool,
    pub actual_qp_index: Option<u8>,
    pub min_qp: u8,
    pub max_qp: u8,
    /// Sliding-window length in frames, 0 when the limiter is off.
    pub sliding_window_size: u32,
    pub extreme_low_delay: bool,
    pub auto_pb_frame_size: bool,
    pub start_global_adjust: [u32; 4],
    pub rate_ratio_thresholds: [u8; 6],
    pub intra_refresh: Option<IntraRefreshPosition>,
    pub suggested_qp: Option<u8>,
    pub rounding_intra: u8,
}

impl RateControlModel {
    /// Advance the model by one frame.
    ///
    /// Fails with `InvalidParameter` before Init, after teardown, or when
    /// the previous frame's statistics were never recorded.
    pub fn update(&mut self, ctx: &FrameContext, input: &BrcFrameInput) -> PipelineResult<BrcUpdateOutput> {
        if self.state == RcState::Torndown {
            return Err(torn_down());
        }
        if let Some(awaiting) = self.awaiting {
            return Err(PipelineError::invalid(format!(
                "statistics for frame {} must be recorded before updating frame {}",
                awaiting.frame, ctx.frame
            )));
        }
        let settings = self.settings()?.clone();
        let ibpf = settings.input_bits_per_frame;
        let buffer = f64::from(settings.buffer_size_bits);

        let intra_refresh = match input.intra_refresh {
            Some(refresh) => Some(self.next_intra_refresh(&refresh, settings.width_in_mbs, settings.height_in_mbs)?),
            None => None,
        };

        let mut target_size_flag = false;
        if self.fullness > buffer {
            self.fullness -= buffer;
            target_size_flag = true;
        }

        // Skipped frames are folded in after the carry-over, so they can
        // push the target past the buffer until the next Update wraps it.
        if input.num_skip_frames > 0 {
            self.fullness += ibpf * f64::from(input.num_skip_frames);
        }
        let target_size = self.fullness.max(0.0) as u32;

        let avbr = settings.rc_mode == RateControlMode::Avbr;
        let output = BrcUpdateOutput {
            frame: ctx.frame,
            target_size,
            target_size_flag,
            num_skip_frames: input.num_skip_frames,
            size_skip_frames: input.size_skip_frames,
            header_bits: input.header_bytes.saturating_mul(8),
            frame_type: ctx.coding_type.brc_frame_type(),
            field: ctx.structure.is_field(),
            bottom_field: ctx.structure.is_bottom_field(),
            is_reference: ctx.is_reference,
            actual_qp_index: if settings.multi_ref_qp { input.qp_index } else { None },
            min_qp: settings.min_qp,
            max_qp: settings.max_qp,
            sliding_window_size: if settings.frame_size_tolerance == FrameSizeTolerance::Low {
                settings.sliding_window_size
            } else {
                0
            },
            extreme_low_delay: settings.frame_size_tolerance == FrameSizeTolerance::ExtremelyLow,
            auto_pb_frame_size: settings.auto_max_pb_frame_size,
            start_global_adjust: if avbr {
                start_global_adjust(settings.avbr_convergence)
            } else {
                [0; 4]
            },
            rate_ratio_thresholds: if avbr {
                rate_ratio_thresholds(settings.avbr_accuracy)
            } else {
                [0; 6]
            },
            intra_refresh,
            suggested_qp: self.suggested_qp,
            rounding_intra: ROUNDING_INTRA,
        };

        self.fullness += ibpf;
        self.awaiting = Some(AwaitingStats {
            frame: ctx.frame,
            target_bits: target_size,
            class: settings.deviation_class(ctx.coding_type.is_intra()),
        });
        self.state = RcState::Steady;

        debug!(
            frame = ctx.frame.0,
            target = output.target_size,
            wrapped = output.target_size_flag,
            skipped = input.num_skip_frames,
            fullness = self.fullness,
            "Rate control update"
        );

        Ok(output)
    }

    /// Feed back what the macroblock-encode stage produced for `stats.frame`.
    ///
    /// Must follow the Update of the same frame and precede the next one.
    pub fn record_statistics(&mut self, stats: &FrameStatistics) -> PipelineResult<()> {
        if self.state == RcState::Torndown {
            return Err(torn_down());
        }
        let awaiting = match self.awaiting {
            Some(a) if a.frame == stats.frame => a,
            Some(a) => {
                return Err(PipelineError::invalid(format!(
                    "statistics for {} arrived while {} is outstanding",
                    stats.frame, a.frame
                )))
            }
            None => {
                return Err(PipelineError::invalid(format!(
                    "no update is waiting for statistics of {}",
                    stats.frame
                )))
            }
        };
        let settings = self.settings()?;
        let window_len = settings.sliding_window_size.max(1) as usize;
        let (min_qp, max_qp) = (settings.min_qp, settings.max_qp);
        let bin = {
            let deviation = deviation_percent(stats.bits_produced, awaiting.target_bits);
            settings.thresholds.bin(awaiting.class, deviation)
        };

        self.history.frames_coded += 1;
        self.history.total_bits += stats.bits_produced;
        self.history.window.push_back(stats.bits_produced);
        while self.history.window.len() > window_len {
            self.history.window.pop_front();
        }
        self.history.last_qp = Some(stats.average_qp);

        let delta = BRC_QP_ADJUST[awaiting.class as usize][bin];
        let qp = (i16::from(stats.average_qp) + i16::from(delta))
            .clamp(i16::from(min_qp), i16::from(max_qp)) as u8;
        self.suggested_qp = Some(qp);
        self.awaiting = None;

        trace!(
            frame = stats.frame.0,
            bits = stats.bits_produced,
            target = awaiting.target_bits,
            bin,
            suggested_qp = qp,
            "Recorded frame statistics"
        );
        Ok(())
    }

    fn next_intra_refresh(
        &mut self,
        refresh: &IntraRefresh,
        width_in_mbs: u32,
        height_in_mbs: u32,
    ) -> PipelineResult<IntraRefreshPosition> {
        if refresh.unit_in_mbs == 0 {
            return Err(PipelineError::invalid("intra refresh unit must be at least one macroblock"));
        }
        let extent = match refresh.mode {
            IntraRefreshMode::Column => width_in_mbs,
            IntraRefreshMode::Row => height_in_mbs,
        };
        if self.intra_refresh_cursor >= extent {
            self.intra_refresh_cursor = 0;
        }
        let position = IntraRefreshPosition {
            mode: refresh.mode,
            first_mb: self.intra_refresh_cursor,
            unit_in_mbs: refresh.unit_in_mbs,
            qp_delta: refresh.qp_delta,
        };
        self.intra_refresh_cursor += refresh.unit_in_mbs;
        Ok(position)
    }
}

/// Frame-size deviation from target in percent.
pub fn deviation_percent(actual_bits: u64, target_bits: u32) -> f64 {
    if target_bits == 0 {
        return 0.0;
    }
    (actual_bits as f64 - f64::from(target_bits)) / f64::from(target_bits) * 100.0
}

/// AVBR global-adjust start frames, scaled by the convergence period.
pub fn start_global_adjust(convergence: u16) -> [u32; 4] {
    let conv = u32::from(convergence);
    [10, 50, 100, 150].map(|frames| frames * conv / 150)
}

/// AVBR rate-ratio thresholds around 100%, spread by the accuracy.
pub fn rate_ratio_thresholds(accuracy: u16) -> [u8; 6] {
    let acc = f64::from(accuracy) / 30.0;
    [-60.0, -25.0, -3.0, 3.0, 25.0, 60.0].map(|spread| (100.0 + acc * spread).clamp(0.0, 255.0) as u8)
}
