//! CMSIS-DAP protocol engine.
//!
//! Tunnels ARM Debug Port / Access Port register accesses through CMSIS-DAP
//! reports, brings up the SWD link and builds the MEM-AP and Cortex-M debug
//! primitives (memory words, core registers, halt/run, pin reset) on top.
//!
//! Every operation is a chain of blocking report exchanges; nothing is
//! pipelined and nothing is retried.

pub mod adi;
pub mod commands;
pub mod cortex_m;
mod memory;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod swd;

use std::time::Duration;

use cmsisdebug_common::{
    ApRegister, CommandId, DpRegister, InvalidOffset, RegisterAddress, Transport, TransportError,
};
use commands::{
    Capabilities, HostStatus, Info, InfoId, Led, Request, Status, Transfer, TransferAck,
    TransferBlock, TransferStatus,
};

pub use swd::LinkState;

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("response echoed command {actual:#04x}, expected {expected:#04x}")]
    EchoMismatch { expected: u8, actual: u8 },
    #[error("probe completed {actual} of {expected} transfers")]
    TransferCount { expected: u16, actual: u16 },
    #[error("target answered {0:?}")]
    Ack(TransferAck),
    #[error("SWD protocol error (parity or framing)")]
    SwdProtocol,
    #[error("probe reported an error for {0:?}")]
    Status(CommandId),
    #[error("sticky error flags set, CTRL/STAT = {0:#010x}")]
    StickyError(u32),
    #[error(transparent)]
    InvalidRegister(#[from] InvalidOffset),
    #[error("core register {0} does not exist")]
    InvalidCoreRegister(u8),
    #[error("truncated {0:?} response")]
    ShortResponse(CommandId),
}

/// Link parameters applied by the connect sequence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwdConfig {
    pub clock_hz: u32,
    pub idle_cycles: u8,
    pub wait_retry: u16,
    pub match_retry: u16,
    /// Raw DAP_SWD_Configure byte
    pub swd_configure: u8,
    /// How long nRESET is held low by a pin reset
    pub reset_pulse: Duration,
}

impl Default for SwdConfig {
    fn default() -> Self {
        Self {
            clock_hz: 100_000,
            idle_cycles: 0,
            wait_retry: 64,
            match_retry: 0,
            swd_configure: 0,
            reset_pulse: Duration::from_millis(100),
        }
    }
}

/// Live protocol state, valid between a successful line bring-up and disconnect
#[derive(Clone, Debug, Default)]
pub struct DebugSession {
    /// Last value written to DP.SELECT
    pub selected_bank: Option<u32>,
    /// Last value written to the MEM-AP CSW
    pub csw: Option<u32>,
    pub firmware_version: Option<String>,
    pub dpidr: Option<u32>,
    pub log: Vec<String>,
}

impl DebugSession {
    fn invalidate(&mut self) {
        self.selected_bank = None;
        self.csw = None;
        self.dpidr = None;
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.log.push(message);
    }
}

/// Protocol engine bound to one claimed transport and its report size
pub struct Dap<T> {
    transport: T,
    packet_size: usize,
    config: SwdConfig,
    session: DebugSession,
}

impl<T: Transport> Dap<T> {
    pub fn new(transport: T, config: SwdConfig) -> Self {
        let packet_size = transport.packet_size();
        Self {
            transport,
            packet_size,
            config,
            session: DebugSession::default(),
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn config(&self) -> &SwdConfig {
        &self.config
    }

    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    /// Appends to the session message log
    pub fn note(&mut self, message: impl Into<String>) {
        self.session.note(message);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// One command/response round trip. The response must echo the command id.
    pub fn send<R: Request>(&mut self, request: &R) -> Result<R::Response, DapError> {
        let mut frame = vec![R::COMMAND as u8];
        request.payload(&mut frame);
        log::trace!("-> {:02X?}", frame);
        let response = self.transport.exchange(&frame)?;
        log::trace!(
            "<- {:02X?}",
            &response[..response.len().min(frame.len().max(8))]
        );
        match response.first() {
            Some(&id) if id == R::COMMAND as u8 => {}
            Some(&actual) => {
                return Err(DapError::EchoMismatch {
                    expected: R::COMMAND as u8,
                    actual,
                })
            }
            None => return Err(DapError::ShortResponse(R::COMMAND)),
        }
        request.parse_response(&response[1..])
    }

    /// Sends a command whose response is a bare status byte. A non-OK status
    /// is logged and otherwise ignored.
    fn send_lenient<R: Request<Response = Status>>(&mut self, request: &R) -> Result<(), DapError> {
        if !self.send(request)?.is_ok() {
            log::warn!("{:?} returned an error status, continuing", R::COMMAND);
        }
        Ok(())
    }

    fn send_checked<R: Request<Response = Status>>(&mut self, request: &R) -> Result<(), DapError> {
        match self.send(request)? {
            Status::Ok => Ok(()),
            Status::Err => Err(DapError::Status(R::COMMAND)),
        }
    }

    pub fn info(&mut self, id: InfoId) -> Result<Vec<u8>, DapError> {
        self.send(&Info(id))
    }

    pub fn info_string(&mut self, id: InfoId) -> Result<String, DapError> {
        self.info(id).map(|data| commands::info_string(&data))
    }

    pub fn firmware_version(&mut self) -> Result<String, DapError> {
        let version = self.info_string(InfoId::FirmwareVersion)?;
        self.session.firmware_version = Some(version.clone());
        Ok(version)
    }

    pub fn capabilities(&mut self) -> Result<Capabilities, DapError> {
        let data = self.info(InfoId::Capabilities)?;
        Ok(Capabilities::from(data.first().copied().unwrap_or(0)))
    }

    /// Packet size the firmware reports, which may be smaller than the endpoint's
    pub fn reported_packet_size(&mut self) -> Result<Option<u16>, DapError> {
        let data = self.info(InfoId::PacketSize)?;
        Ok(match *data.as_slice() {
            [lo, hi] => Some(u16::from_le_bytes([lo, hi])),
            _ => None,
        })
    }

    pub fn led_on(&mut self) -> Result<(), DapError> {
        self.send_lenient(&HostStatus {
            led: Led::Connect,
            on: true,
        })
    }

    pub fn led_off(&mut self) -> Result<(), DapError> {
        self.send_lenient(&HostStatus {
            led: Led::Connect,
            on: false,
        })
    }

    /// DAP_Disconnect. Drops the cached link state.
    pub fn disconnect(&mut self) -> Result<(), DapError> {
        self.session.invalidate();
        self.send_lenient(&commands::Disconnect)
    }

    pub fn write_abort(&mut self, abort: u32) -> Result<(), DapError> {
        self.send_checked(&commands::WriteAbort { abort })
    }

    pub fn read_dp(&mut self, register: DpRegister) -> Result<u32, DapError> {
        self.transfer(register.into(), None)
    }

    pub fn write_dp(&mut self, register: DpRegister, value: u32) -> Result<(), DapError> {
        self.transfer(register.into(), Some(value))?;
        if register == DpRegister::Select {
            self.session.selected_bank = Some(value);
        }
        Ok(())
    }

    /// Reads an AP register in the bank DP.SELECT currently designates
    pub fn read_ap(&mut self, register: ApRegister) -> Result<u32, DapError> {
        let mut data = self.transfer_block(register.into(), 1, Vec::new())?;
        data.pop().ok_or(DapError::ShortResponse(CommandId::TransferBlock))
    }

    /// Writes an AP register in the bank DP.SELECT currently designates
    pub fn write_ap(&mut self, register: ApRegister, value: u32) -> Result<(), DapError> {
        self.transfer_block(register.into(), 1, vec![value])?;
        if register == ApRegister::Csw {
            match self.session.selected_bank {
                Some(select) if select == memory::bank_select(0) => {
                    self.session.csw = Some(value)
                }
                Some(_) => {}
                None => self.session.csw = None,
            }
        }
        Ok(())
    }

    pub fn read_register(&mut self, address: RegisterAddress) -> Result<u32, DapError> {
        match address {
            RegisterAddress::DebugPort(register) => self.read_dp(register),
            RegisterAddress::AccessPort(register) => self.read_ap(register),
        }
    }

    pub fn write_register(&mut self, address: RegisterAddress, value: u32) -> Result<(), DapError> {
        match address {
            RegisterAddress::DebugPort(register) => self.write_dp(register, value),
            RegisterAddress::AccessPort(register) => self.write_ap(register, value),
        }
    }

    /// A FAULT leaves the sticky flags set and every later AP access would
    /// fault too, so they are cleared before the error is returned.
    pub(crate) fn check_status(&mut self, status: TransferStatus) -> Result<(), DapError> {
        let result = status.check();
        if let Err(DapError::Ack(TransferAck::Fault)) = result {
            log::warn!("transfer FAULT, clearing sticky errors");
            if let Err(e) = self.write_abort(adi::dp::ABORT_CLEAR_STICKY) {
                log::debug!("abort after FAULT: {e}");
            }
        }
        result
    }

    fn transfer(&mut self, address: RegisterAddress, data: Option<u32>) -> Result<u32, DapError> {
        let rnw = data.is_none();
        let response = self.send(&Transfer {
            request: address.request(rnw),
            data,
        })?;
        if response.transfer_count != 1 {
            self.check_status(response.status)?;
            return Err(DapError::TransferCount {
                expected: 1,
                actual: response.transfer_count as u16,
            });
        }
        self.check_status(response.status)?;
        let value = match data {
            Some(value) => value,
            None => response
                .data
                .ok_or(DapError::ShortResponse(CommandId::Transfer))?,
        };
        log::debug!(
            "{}:{}[{:#x}] {} {:#010x}",
            if rnw { "R" } else { "W" },
            address.port(),
            address.offset(),
            if rnw { "→" } else { "←" },
            value
        );
        Ok(value)
    }

    fn transfer_block(
        &mut self,
        address: RegisterAddress,
        count: u16,
        data: Vec<u32>,
    ) -> Result<Vec<u32>, DapError> {
        let rnw = data.is_empty();
        let response = self.send(&TransferBlock {
            transfer_count: count,
            request: address.request(rnw),
            data,
        })?;
        if response.transfer_count != count {
            self.check_status(response.status)?;
            return Err(DapError::TransferCount {
                expected: count,
                actual: response.transfer_count,
            });
        }
        self.check_status(response.status)?;
        log::debug!(
            "{}:{}[{:#x}] x{}",
            if rnw { "R" } else { "W" },
            address.port(),
            address.offset(),
            count
        );
        Ok(response.data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{Access, SimProbe};

    fn dap() -> Dap<SimProbe> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut dap = Dap::new(SimProbe::claimed(), SwdConfig::default());
        dap.connect_line().unwrap();
        dap
    }

    #[test]
    fn dp_write_then_read_back() {
        let mut dap = dap();
        dap.write_dp(DpRegister::CtrlStat, adi::dp::CTRL_POWER_UP)
            .unwrap();
        let ctrl = dap.read_dp(DpRegister::CtrlStat).unwrap();
        // ACK bits are read-only and follow the requests
        assert_eq!(ctrl & adi::dp::CTRL_POWER_UP, adi::dp::CTRL_POWER_UP);
        assert_ne!(ctrl & adi::dp::CTRL_CDBGPWRUPACK, 0);
    }

    #[test]
    fn ap_write_then_read_back() {
        let mut dap = dap();
        dap.write_dp(DpRegister::Select, 0).unwrap();
        dap.write_ap(ApRegister::Tar, 0x2000_0010).unwrap();
        assert_eq!(dap.read_ap(ApRegister::Tar).unwrap(), 0x2000_0010);
        dap.write_ap(ApRegister::Csw, 0x2300_0012).unwrap();
        assert_eq!(dap.read_ap(ApRegister::Csw).unwrap() & 0x7F00_003F, 0x2300_0012);
    }

    #[test]
    fn dp_frames_on_the_wire() {
        let mut dap = dap();
        dap.transport_mut().clear_frames();
        dap.write_dp(DpRegister::Select, 0x0000_00F0).unwrap();
        dap.read_dp(DpRegister::IdrAbort).unwrap();
        assert_eq!(
            dap.transport().frames(),
            &[
                vec![0x05, 0x00, 0x01, 0x08, 0xF0, 0x00, 0x00, 0x00],
                vec![0x05, 0x00, 0x01, 0x02],
            ]
        );
        assert_eq!(dap.session().selected_bank, Some(0xF0));
    }

    #[test]
    fn nack_is_an_error_not_a_zero() {
        let mut dap = dap();
        dap.transport_mut().force_next_ack(0x4);
        assert!(matches!(
            dap.read_dp(DpRegister::CtrlStat),
            Err(DapError::Ack(TransferAck::Fault))
        ));
        // Next access succeeds again
        assert_eq!(dap.read_dp(DpRegister::IdrAbort).unwrap(), SimProbe::DPIDR);
    }

    #[test]
    fn echo_mismatch_is_detected() {
        let mut dap = dap();
        dap.transport_mut().corrupt_next_echo();
        assert!(matches!(
            dap.read_dp(DpRegister::IdrAbort),
            Err(DapError::EchoMismatch {
                expected: 0x05,
                ..
            })
        ));
    }

    #[test]
    fn transfers_before_line_reset_are_rejected() {
        let mut dap = Dap::new(SimProbe::claimed(), SwdConfig::default());
        assert!(matches!(
            dap.read_dp(DpRegister::IdrAbort),
            Err(DapError::Ack(TransferAck::NoAck))
        ));
    }

    #[test]
    fn firmware_version_is_cached_in_session() {
        let mut dap = dap();
        assert_eq!(dap.firmware_version().unwrap(), SimProbe::FIRMWARE_VERSION);
        assert_eq!(
            dap.session().firmware_version.as_deref(),
            Some(SimProbe::FIRMWARE_VERSION)
        );
        assert!(dap.capabilities().unwrap().swd());
        assert_eq!(dap.reported_packet_size().unwrap(), Some(64));
    }

    #[test]
    fn register_trace_records_port_and_offset() {
        let mut dap = dap();
        dap.transport_mut().clear_accesses();
        dap.read_register(RegisterAddress::dp(0x4).unwrap()).unwrap();
        assert_eq!(
            dap.transport().accesses().first(),
            Some(&Access::Dp {
                rnw: true,
                offset: 0x4,
                value: dap.transport().ctrl_stat(),
            })
        );
    }
}
