//! SWD line bring-up and nRESET pulse

use std::time::Duration;

use cmsisdebug_common::Transport;

use crate::adi::dp;
use crate::commands::{
    Connect, ConnectPort, Pins, SwdConfiguration, SwdConfigure, SwjClock, SwjPins, SwjSequence,
    TransferConfigure, WriteAbort,
};
use crate::{Dap, DapError};

/// Longest pulse the probe can time itself
const MAX_RESET_PULSE: Duration = Duration::from_secs(3);

/// At least 50 clocks with SWDIO high
const LINE_RESET: [u8; 7] = [0xFF; 7];
/// JTAG-to-SWD switch pattern, LSB first
const JTAG_TO_SWD: [u8; 2] = [0x9E, 0xE7];
const IDLE: [u8; 2] = [0x00, 0x00];

/// Steps of the line bring-up, in order. Entering a state performs its
/// step: one or more fixed reports, or the DPIDR read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// DAP_Connect in SWD mode
    SwjSwitch,
    /// Clock, transfer and SWD parameters
    Configure,
    LineReset,
    JtagToSwd,
    SecondLineReset,
    /// 16 idle cycles
    IdleCycles,
    IdRead,
    Connected,
}

impl LinkState {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::SwjSwitch,
            Self::SwjSwitch => Self::Configure,
            Self::Configure => Self::LineReset,
            Self::LineReset => Self::JtagToSwd,
            Self::JtagToSwd => Self::SecondLineReset,
            Self::SecondLineReset => Self::IdleCycles,
            Self::IdleCycles => Self::IdRead,
            Self::IdRead | Self::Connected => Self::Connected,
        }
    }
}

impl<T: Transport> Dap<T> {
    fn sequence(&mut self, bits: &[u8]) -> Result<(), DapError> {
        self.send_lenient(&SwjSequence {
            bit_count: (bits.len() * 8) as u8,
            bit_data: bits.to_vec(),
        })
    }

    /// Switches the probe to SWD, applies the link parameters, resets the
    /// line and reads DPIDR. Returns DPIDR.
    ///
    /// Status errors from the configuration commands are logged and ignored.
    /// A failed DPIDR read fails the connect.
    pub fn connect_line(&mut self) -> Result<u32, DapError> {
        self.session.invalidate();
        let mut state = LinkState::Idle;
        let mut dpidr = 0;
        loop {
            log::debug!("link: {state:?}");
            match state {
                LinkState::Idle => {}
                LinkState::SwjSwitch => {
                    let port = self.send(&Connect {
                        port: ConnectPort::Swd,
                    })?;
                    if port == ConnectPort::Swd as u8 {
                        self.session.note("SWD connected");
                    } else {
                        log::warn!("probe connected port {port}, expected SWD");
                        self.session.note("SWD not connected");
                    }
                }
                LinkState::Configure => {
                    self.send_lenient(&SwjClock {
                        clock_hz: self.config.clock_hz,
                    })?;
                    self.send_lenient(&TransferConfigure {
                        idle_cycles: self.config.idle_cycles,
                        wait_retry: self.config.wait_retry,
                        match_retry: self.config.match_retry,
                    })?;
                    self.send_lenient(&SwdConfigure {
                        config: SwdConfiguration::from(self.config.swd_configure),
                    })?;
                }
                LinkState::LineReset | LinkState::SecondLineReset => self.sequence(&LINE_RESET)?,
                LinkState::JtagToSwd => self.sequence(&JTAG_TO_SWD)?,
                LinkState::IdleCycles => self.sequence(&IDLE)?,
                LinkState::IdRead => {
                    dpidr = self.read_dpidr()?;
                    self.session.note(format!("IdCode: {dpidr:#010x}"));
                }
                LinkState::Connected => break,
            }
            state = state.next();
        }
        Ok(dpidr)
    }

    /// Clears sticky errors, pulses nRESET, then drops the probe connection
    /// and brings the line up again. Returns the new DPIDR.
    ///
    /// The abort may fail on a lost link; the pin reset goes ahead regardless.
    pub fn reset_and_reconnect(&mut self) -> Result<u32, DapError> {
        self.send_lenient(&WriteAbort {
            abort: dp::ABORT_CLEAR_STICKY,
        })?;

        let pulse = self.config.reset_pulse.min(MAX_RESET_PULSE);
        self.send(&SwjPins {
            output: Pins::nreset_only(false),
            select: Pins::nreset_only(true),
            wait_us: 0,
        })?;
        std::thread::sleep(pulse);
        let pins = self.send(&SwjPins {
            output: Pins::nreset_only(true),
            select: Pins::nreset_only(true),
            wait_us: 0,
        })?;
        if !pins.nreset() {
            log::warn!("nRESET still low after release");
        }
        self.session.note(format!("Reset pulse {} ms", pulse.as_millis()));

        self.disconnect()?;
        self.connect_line()
    }
}
