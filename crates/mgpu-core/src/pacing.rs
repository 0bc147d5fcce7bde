use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::DeviceGroupContext;
use crate::error::Result;
use crate::events::GroupEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    InFrame,
}

/// Frame boundary state machine: Idle -> InFrame -> Idle.
#[derive(Debug, Default)]
pub(crate) struct FramePacer {
    state: FrameState,
    started_at: Option<Instant>,
}

impl FramePacer {
    fn begin(&mut self) -> bool {
        if self.state == FrameState::InFrame {
            return false;
        }
        self.state = FrameState::InFrame;
        self.started_at = Some(Instant::now());
        true
    }

    fn end(&mut self) -> Option<Instant> {
        self.state = FrameState::Idle;
        self.started_at.take()
    }
}

impl DeviceGroupContext {
    /// Toggle frame pacing. An interval of 0 means no artificial delay.
    pub fn set_frame_pacing(&mut self, enabled: bool, interval_ms: u32) -> Result<()> {
        self.config.frame_pacing_enabled = enabled;
        self.config.frame_interval_ms = interval_ms;
        debug!(enabled, interval_ms, "frame pacing updated");
        Ok(())
    }

    /// Mark the start of a frame. Ignored while a frame is already open.
    pub fn frame_begin(&mut self) {
        if !self.pacer.begin() {
            debug!("frame_begin while already in a frame, ignoring");
        }
    }

    /// Close the current frame and return the new frame count.
    ///
    /// With pacing enabled this sleeps for whatever is left of the interval
    /// since `frame_begin`. A `frame_end` without a matching `frame_begin`
    /// still counts the frame but never sleeps.
    pub fn frame_end(&mut self) -> u64 {
        let started_at = self.pacer.end();
        let frame = self.stats.record_frame();

        let Some(started_at) = started_at else {
            debug!(frame, "frame_end without frame_begin");
            return frame;
        };

        if self.config.frame_pacing_enabled && self.config.frame_interval_ms > 0 {
            let interval = Duration::from_millis(u64::from(self.config.frame_interval_ms));
            let elapsed = started_at.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        self.events.emit(&GroupEvent::FrameCompleted {
            frame,
            frame_time: started_at.elapsed(),
        });
        frame
    }

    pub fn frame_state(&self) -> FrameState {
        self.pacer.state
    }

    pub fn total_frames(&self) -> u64 {
        self.stats.total_frames()
    }
}
