//! Timestamp reconstruction.
//!
//! The eDVS only sends a 16-bit microsecond counter that wraps roughly every
//! 65 ms. The host extends it to 32 bits by adding `TS_WRAP_ADD` on every wrap.
//! The extension is kept inside the positive `i32` range; once it would leave
//! that range a "big wrap" restarts the extended clock at zero and bumps the
//! overflow epoch, so timestamps never go backwards within one epoch.

use crate::event::SpecialEvent;
use crate::logging::SessionLog;

/// Increment applied to the extended timestamp on each 16-bit wrap.
pub const TS_WRAP_ADD: u32 = 0x10000;

/// Largest `wrap_add` value; the next wrap past it is a big wrap.
const WRAP_ADD_CEILING: u32 = i32::MAX as u32 - (TS_WRAP_ADD - 1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBaseState {
    pub wrap_overflow: u32,
    pub wrap_add: u32,
    pub last_short: u16,
    pub last: u32,
    pub current: u32,
}

/// Outcome of feeding one short timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Extended timestamp for the current frame.
    Timestamp(u32),
    /// State was cleared because a reset was requested; no timestamp.
    Reset,
    /// The extended clock overflowed and restarted at zero.
    BigWrap(SpecialEvent),
}

#[derive(Debug, Default)]
pub struct TimeBase {
    state: TimeBaseState,
}

impl TimeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an arbitrary state, mostly useful to exercise the big wrap.
    pub fn with_state(state: TimeBaseState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &TimeBaseState {
        &self.state
    }

    pub fn current(&self) -> u32 {
        self.state.current
    }

    pub fn wrap_overflow(&self) -> u32 {
        self.state.wrap_overflow
    }

    pub fn reset(&mut self) {
        self.state = TimeBaseState::default();
    }

    pub fn advance(&mut self, short_ts: u16, reset_requested: bool, log: &SessionLog) -> Advance {
        if reset_requested {
            self.reset();
            return Advance::Reset;
        }

        let state = &mut self.state;
        let wrapped = short_ts < state.last_short;

        if wrapped && state.wrap_add >= WRAP_ADD_CEILING {
            state.wrap_add = 0;
            state.last_short = 0;
            state.last = 0;
            state.current = 0;
            state.wrap_overflow = state.wrap_overflow.wrapping_add(1);
            log.debug(format_args!(
                "timestamp big wrap, overflow epoch now {}",
                state.wrap_overflow
            ));
            return Advance::BigWrap(SpecialEvent::timestamp_wrap());
        }

        if wrapped {
            state.wrap_add += TS_WRAP_ADD;
            state.last_short = 0;
        } else {
            state.last_short = short_ts;
        }

        state.last = state.current;
        state.current = state.wrap_add + u32::from(short_ts);

        if state.current < state.last {
            log.warn(format_args!(
                "non-monotonic timestamp: current {} < last {}",
                state.current, state.last
            ));
        }

        Advance::Timestamp(state.current)
    }
}
