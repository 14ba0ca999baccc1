//! Rate control state machine.
//!
//! ```text
//! Uninitialized --init--> InitPending --update--> Steady --reset--> ResetPending
//!                                                   ^                    |
//!                                                   +------update--------+
//! any --teardown--> Torndown (terminal)
//! ```
//!
//! [`RateControlModel`] is plain data and `Clone`: the pipeline runs a
//! frame's Update on a copy and only commits it once the whole frame has
//! been dispatched.

pub mod init;
pub mod update;

use std::collections::VecDeque;

use tracing::{debug, info};

use kp_common::config::SequenceParams;
use kp_common::error::{PipelineError, PipelineResult};
use kp_common::types::FrameNumber;

use crate::graph::BrcPending;

pub use init::{BrcSettings, DeviationClass, DeviationThresholds};
pub use update::{BrcUpdateOutput, IntraRefreshPosition};

/// Lifecycle state of the model.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RcState {
    Uninitialized,
    /// Init derived; the init stage has not been dispatched yet.
    InitPending,
    /// Reset derived; the reset stage has not been dispatched yet.
    ResetPending,
    Steady,
    Torndown,
}

/// Running statistics fed by [`RateControlModel::record_statistics`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RcHistory {
    pub frames_coded: u64,
    pub total_bits: u64,
    /// Bits of the most recent frames, at most `sliding_window_size` long.
    pub window: VecDeque<u64>,
    pub last_qp: Option<u8>,
}

impl RcHistory {
    /// Average frame size over the sliding window.
    pub fn window_average(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<u64>() as f64 / self.window.len() as f64)
    }
}

/// Target and class of the frame that still awaits its statistics.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct AwaitingStats {
    pub frame: FrameNumber,
    pub target_bits: u32,
    pub class: DeviationClass,
}

/// Persistent per-sequence rate-control model.
#[derive(Clone, Debug)]
pub struct RateControlModel {
    pub(crate) state: RcState,
    pub(crate) settings: Option<BrcSettings>,
    /// Current virtual buffer fullness in bits.
    pub(crate) fullness: f64,
    pub(crate) history: RcHistory,
    pub(crate) awaiting: Option<AwaitingStats>,
    pub(crate) suggested_qp: Option<u8>,
    pub(crate) intra_refresh_cursor: u32,
}

impl Default for RateControlModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RateControlModel {
    pub fn new() -> Self {
        Self {
            state: RcState::Uninitialized,
            settings: None,
            fullness: 0.0,
            history: RcHistory::default(),
            awaiting: None,
            suggested_qp: None,
            intra_refresh_cursor: 0,
        }
    }

    /// Derive the settings for a new sequence and set the initial fullness.
    pub fn init(&mut self, seq: &SequenceParams) -> PipelineResult<()> {
        match self.state {
            RcState::Uninitialized => {}
            RcState::Torndown => return Err(torn_down()),
            _ => {
                return Err(PipelineError::invalid(
                    "rate control already initialized; use reset",
                ))
            }
        }
        let settings = BrcSettings::derive(seq)?;
        info!(
            mode = ?settings.rc_mode,
            buffer_bits = settings.buffer_size_bits,
            init_fullness = settings.init_fullness_bits,
            bits_per_frame = settings.input_bits_per_frame,
            bps_ratio = settings.bps_ratio,
            "Rate control initialized"
        );
        self.fullness = f64::from(settings.init_fullness_bits);
        self.settings = Some(settings);
        self.state = RcState::InitPending;
        Ok(())
    }

    /// Re-derive the settings with new parameters. History and the current
    /// fullness are kept.
    pub fn reset(&mut self, seq: &SequenceParams) -> PipelineResult<()> {
        match self.state {
            RcState::Uninitialized => {
                return Err(PipelineError::invalid("rate control reset before init"))
            }
            RcState::Torndown => return Err(torn_down()),
            _ => {}
        }
        let settings = BrcSettings::derive(seq)?;
        info!(
            mode = ?settings.rc_mode,
            buffer_bits = settings.buffer_size_bits,
            fullness = self.fullness,
            "Rate control reset"
        );
        self.settings = Some(settings);
        // An Init that was never dispatched still has to run as Init.
        if self.state != RcState::InitPending {
            self.state = RcState::ResetPending;
        }
        Ok(())
    }

    /// Release the model. Every later operation fails.
    pub fn teardown(&mut self) {
        if self.state != RcState::Torndown {
            debug!(frames = self.history.frames_coded, "Rate control torn down");
        }
        self.state = RcState::Torndown;
        self.settings = None;
        self.awaiting = None;
    }

    /// Setup the device still has to receive.
    pub fn pending(&self) -> BrcPending {
        match self.state {
            RcState::InitPending => BrcPending::Init,
            RcState::ResetPending => BrcPending::Reset,
            _ => BrcPending::None,
        }
    }

    pub fn state(&self) -> RcState {
        self.state
    }

    /// Derived settings; fails before Init and after teardown.
    pub fn settings(&self) -> PipelineResult<&BrcSettings> {
        match self.state {
            RcState::Torndown => Err(torn_down()),
            _ => self
                .settings
                .as_ref()
                .ok_or_else(|| PipelineError::invalid("rate control not initialized")),
        }
    }

    pub fn fullness(&self) -> f64 {
        self.fullness
    }

    pub fn history(&self) -> &RcHistory {
        &self.history
    }

    /// QP suggested for the next frame from the last frame's deviation.
    pub fn suggested_qp(&self) -> Option<u8> {
        self.suggested_qp
    }

    /// Frame whose statistics are still outstanding.
    pub fn awaiting_statistics(&self) -> Option<FrameNumber> {
        self.awaiting.map(|a| a.frame)
    }
}

fn torn_down() -> PipelineError {
    PipelineError::invalid("rate control model has been torn down")
}
