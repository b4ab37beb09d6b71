//! Simulated CMSIS-DAP probe wired to a simulated Cortex-M target.
//!
//! The probe answers reports the way DAPLink firmware does and keeps a log of
//! every frame it received. The target models one MEM-AP in front of a flat
//! word-addressed memory plus the SCS debug registers, and records every
//! DP/AP access it serves.

use std::collections::HashMap;
use std::ops::Range;

use cmsisdebug_common::{
    pad_report, DescriptorStrings, ProbeDescriptor, Transport, TransportError, USB_CLASS_HID,
};

use crate::adi::{ap, dp};
use crate::cortex_m;

const ACK_OK: u8 = 0x1;
const ACK_FAULT: u8 = 0x4;
const ACK_NONE: u8 = 0x7;

const DAP_INVALID: u8 = 0xFF;

const STATUS_OK: u8 = 0x00;
const STATUS_ERR: u8 = 0xFF;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineState {
    /// No line reset seen since power-up, disconnect or pin reset
    Dormant,
    /// Line reset clocked, waiting for idle cycles
    Reset,
    Active,
}

/// One register access served by the target
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Dp { rnw: bool, offset: u8, value: u32 },
    Ap { rnw: bool, offset: u8, value: u32 },
    Abort(u32),
}

#[derive(Clone, Debug)]
pub struct SimTarget {
    select: dp::Select,
    ctrl: u32,
    sticky: u32,
    csw: u32,
    tar: u32,
    memory: HashMap<u32, u32>,
    cpuid: u32,
    debug_enabled: bool,
    halted: bool,
    reset_since_read: bool,
    dcrdr: u32,
    core_registers: [u32; 21],
    rejected_dhcsr_writes: usize,
    fault_regions: Vec<Range<u32>>,
    resets: usize,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self {
            select: dp::Select::from(0u32),
            ctrl: 0,
            sticky: 0,
            csw: 0,
            tar: 0,
            memory: HashMap::new(),
            cpuid: SimProbe::CPUID,
            debug_enabled: false,
            halted: false,
            reset_since_read: false,
            dcrdr: 0,
            core_registers: [0; 21],
            rejected_dhcsr_writes: 0,
            fault_regions: Vec::new(),
            resets: 0,
        }
    }
}

impl SimTarget {
    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn rejected_dhcsr_writes(&self) -> usize {
        self.rejected_dhcsr_writes
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn set_cpuid(&mut self, cpuid: u32) {
        self.cpuid = cpuid;
    }

    pub fn core_register(&self, index: usize) -> u32 {
        self.core_registers.get(index).copied().unwrap_or(0)
    }

    pub fn set_core_register(&mut self, index: usize, value: u32) {
        if let Some(register) = self.core_registers.get_mut(index) {
            *register = value;
        }
    }

    /// Bus accesses inside `region` raise STICKYERR
    pub fn add_fault_region(&mut self, region: Range<u32>) {
        self.fault_regions.push(region);
    }

    pub fn poke(&mut self, address: u32, value: u32) {
        self.memory.insert(address & !0x3, value);
    }

    pub fn peek(&self, address: u32) -> u32 {
        self.memory.get(&(address & !0x3)).copied().unwrap_or(0)
    }

    fn ctrl_stat(&self) -> u32 {
        let mut value = self.ctrl | self.sticky;
        if self.ctrl & (1 << 28) != 0 {
            value |= dp::CTRL_CDBGPWRUPACK;
        }
        if self.ctrl & (1 << 30) != 0 {
            value |= dp::CTRL_CSYSPWRUPACK;
        }
        value
    }

    fn abort(&mut self, abort: u32) {
        if abort & (1 << 1) != 0 {
            self.sticky &= !dp::STAT_STICKYCMP;
        }
        if abort & (1 << 2) != 0 {
            self.sticky &= !dp::STAT_STICKYERR;
        }
        if abort & (1 << 4) != 0 {
            self.sticky &= !dp::STAT_STICKYORUN;
        }
    }

    /// nRESET released after being driven low
    fn pin_reset(&mut self) {
        self.resets += 1;
        self.halted = false;
        self.debug_enabled = false;
        self.reset_since_read = true;
        self.core_registers = [0; 21];
        self.csw = 0;
        self.tar = 0;
    }

    fn dhcsr(&mut self) -> u32 {
        let mut value = self.debug_enabled as u32
            | (self.halted as u32) << 1
            // S_REGRDY
            | 1 << 16
            | (self.halted as u32) << 17;
        if self.reset_since_read {
            value |= 1 << 25;
            self.reset_since_read = false;
        }
        value
    }

    fn bus_read(&mut self, address: u32) -> u32 {
        if self.fault_regions.iter().any(|r| r.contains(&address)) {
            self.sticky |= dp::STAT_STICKYERR;
            return 0;
        }
        match address & !0x3 {
            cortex_m::CPUID => self.cpuid,
            cortex_m::DHCSR => self.dhcsr(),
            cortex_m::DCRDR => self.dcrdr,
            address => self.peek(address),
        }
    }

    fn bus_write(&mut self, address: u32, value: u32) {
        if self.fault_regions.iter().any(|r| r.contains(&address)) {
            self.sticky |= dp::STAT_STICKYERR;
            return;
        }
        match address & !0x3 {
            cortex_m::CPUID => {}
            cortex_m::DHCSR => {
                if (value >> 16) as u16 != cortex_m::DBGKEY {
                    log::trace!("sim: DHCSR write without key: {value:#010x}");
                    self.rejected_dhcsr_writes += 1;
                    return;
                }
                self.debug_enabled = value & cortex_m::C_DEBUGEN as u32 != 0;
                self.halted = self.debug_enabled && value & cortex_m::C_HALT as u32 != 0;
            }
            cortex_m::DCRSR => {
                let index = (value & 0x1F) as usize;
                if value & cortex_m::DCRSR_REGWNR != 0 {
                    let dcrdr = self.dcrdr;
                    self.set_core_register(index, dcrdr);
                } else {
                    self.dcrdr = self.core_register(index);
                }
            }
            cortex_m::DCRDR => self.dcrdr = value,
            address => self.poke(address, value),
        }
    }

    fn dp_access(&mut self, rnw: bool, offset: u8, value: u32) -> u32 {
        match (offset, rnw) {
            (0x0, true) => SimProbe::DPIDR,
            (0x0, false) => {
                self.abort(value);
                value
            }
            (0x4, true) => self.ctrl_stat(),
            (0x4, false) => {
                self.ctrl = value
                    & !(dp::STAT_STICKY_MASK | dp::CTRL_CDBGPWRUPACK | dp::CTRL_CSYSPWRUPACK);
                value
            }
            (0x8, false) => {
                self.select = dp::Select::from(value);
                value
            }
            // RESEND/RDBUFF are not modelled
            _ => 0,
        }
    }

    fn ap_access(&mut self, rnw: bool, offset: u8, value: u32) -> u32 {
        if self.select.apsel() != 0 {
            return 0;
        }
        match (self.select.apbanksel().value(), offset, rnw) {
            (0x0, 0x0, true) => self.csw | 1 << 6,
            (0x0, 0x0, false) => {
                self.csw = value;
                value
            }
            (0x0, 0x4, true) => self.tar,
            (0x0, 0x4, false) => {
                self.tar = value;
                value
            }
            (0x0, 0xC, rnw) => {
                let address = self.tar;
                let value = if rnw {
                    self.bus_read(address)
                } else {
                    self.bus_write(address, value);
                    value
                };
                self.auto_increment();
                value
            }
            (ap::ID_BANK, 0x8, true) => 0xE00F_F003,
            (ap::ID_BANK, 0xC, true) => SimProbe::AP_IDR,
            _ => 0,
        }
    }

    fn auto_increment(&mut self) {
        let single = (self.csw >> 4) & 0x3 == 0b01;
        if single {
            let wrap = ap::AUTO_INCREMENT_WRAP;
            self.tar = (self.tar & !(wrap - 1)) | (self.tar.wrapping_add(4) & (wrap - 1));
        }
    }
}

/// Probe side of the simulation, implements [`Transport`]
pub struct SimProbe {
    descriptor: ProbeDescriptor,
    target: SimTarget,
    line: LineState,
    nreset: bool,
    claimed: bool,
    frames: Vec<Vec<u8>>,
    accesses: Vec<Access>,
    clock_hz: u32,
    forced_ack: Option<u8>,
    corrupt_echo: bool,
    fail_dpidr: bool,
    reject_swd_configure: bool,
    refuse_swd: bool,
    reject_write_abort: bool,
}

impl Default for SimProbe {
    fn default() -> Self {
        Self::new(ProbeDescriptor {
            vendor_id: Self::VENDOR_ID,
            product_id: Self::PRODUCT_ID,
            interface_class: Some(USB_CLASS_HID),
        })
    }
}

impl SimProbe {
    pub const VENDOR_ID: u16 = 0x0D28;
    pub const PRODUCT_ID: u16 = 0x0204;
    pub const PACKET_SIZE: usize = 64;
    pub const FIRMWARE_VERSION: &'static str = "0254";
    pub const DPIDR: u32 = 0x2BA0_1477;
    pub const AP_IDR: u32 = 0x2477_0011;
    /// Cortex-M4 r0p1
    pub const CPUID: u32 = 0x410F_C241;

    pub fn new(descriptor: ProbeDescriptor) -> Self {
        Self {
            descriptor,
            target: SimTarget::default(),
            line: LineState::Dormant,
            nreset: true,
            claimed: false,
            frames: Vec::new(),
            accesses: Vec::new(),
            clock_hz: 0,
            forced_ack: None,
            corrupt_echo: false,
            fail_dpidr: false,
            reject_swd_configure: false,
            refuse_swd: false,
            reject_write_abort: false,
        }
    }

    /// Default probe with its interface already claimed
    pub fn claimed() -> Self {
        let mut probe = Self::default();
        probe.claimed = true;
        probe
    }

    pub fn target(&self) -> &SimTarget {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut SimTarget {
        &mut self.target
    }

    pub fn line(&self) -> LineState {
        self.line
    }

    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    pub fn ctrl_stat(&self) -> u32 {
        self.target.ctrl_stat()
    }

    /// Every request frame received, without padding
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn clear_frames(&mut self) {
        self.frames.clear();
    }

    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn clear_accesses(&mut self) {
        self.accesses.clear();
    }

    /// The next transfer is answered with `ack` and not performed
    pub fn force_next_ack(&mut self, ack: u8) {
        self.forced_ack = Some(ack);
    }

    /// The next response carries a wrong command id
    pub fn corrupt_next_echo(&mut self) {
        self.corrupt_echo = true;
    }

    /// DPIDR reads answer FAULT
    pub fn fail_dpidr(&mut self, fail: bool) {
        self.fail_dpidr = fail;
    }

    /// DAP_SWD_Configure answers with an error status
    pub fn reject_swd_configure(&mut self, reject: bool) {
        self.reject_swd_configure = reject;
    }

    /// DAP_Connect answers with port 0
    pub fn refuse_swd(&mut self, refuse: bool) {
        self.refuse_swd = refuse;
    }

    /// DAP_WriteABORT answers with an error status and does nothing
    pub fn reject_write_abort(&mut self, reject: bool) {
        self.reject_write_abort = reject;
    }

    fn sequence(&mut self, bit_count: usize, data: &[u8]) {
        let bit = |i: usize| data.get(i / 8).is_some_and(|&b| (b >> (i % 8)) & 1 == 1);
        let ones = (0..bit_count).filter(|&i| bit(i)).count();
        if ones == bit_count && bit_count >= 50 {
            self.line = LineState::Reset;
        } else if ones == 0 && self.line == LineState::Reset {
            self.line = LineState::Active;
        }
        log::trace!("sim: {bit_count} bit sequence, line {:?}", self.line);
    }

    fn set_nreset(&mut self, level: bool) {
        if !level {
            self.line = LineState::Dormant;
        } else if !self.nreset {
            self.target.pin_reset();
        }
        self.nreset = level;
    }

    /// Runs one transfer, returning the ack and the read value
    fn transfer(&mut self, request: u8, write: u32) -> (u8, u32) {
        if let Some(ack) = self.forced_ack.take() {
            return (ack, 0);
        }
        if self.line != LineState::Active {
            return (ACK_NONE, 0);
        }
        let apndp = request & 0x1 != 0;
        let rnw = request & 0x2 != 0;
        let offset = request & 0xC;
        if apndp {
            if self.target.sticky & dp::STAT_STICKYERR != 0 {
                return (ACK_FAULT, 0);
            }
            let value = self.target.ap_access(rnw, offset, write);
            self.accesses.push(Access::Ap { rnw, offset, value });
            (ACK_OK, value)
        } else {
            if rnw && offset == 0 && self.fail_dpidr {
                return (ACK_FAULT, 0);
            }
            let value = self.target.dp_access(rnw, offset, write);
            self.accesses.push(Access::Dp { rnw, offset, value });
            (ACK_OK, value)
        }
    }

    fn dap_transfer(&mut self, request: &[u8], response: &mut Vec<u8>) {
        let count = request.get(2).copied().unwrap_or(0);
        let mut at = 3;
        let mut done = 0u8;
        let mut ack = ACK_OK;
        let mut data = Vec::new();
        for _ in 0..count {
            let req = request.get(at).copied().unwrap_or(0);
            at += 1;
            let rnw = req & 0x2 != 0;
            let write = if rnw {
                0
            } else {
                at += 4;
                word(request, at - 4)
            };
            let (status, value) = self.transfer(req, write);
            ack = status;
            if status != ACK_OK {
                break;
            }
            if rnw {
                data.extend_from_slice(&value.to_le_bytes());
            }
            done += 1;
        }
        response.extend_from_slice(&[done, ack]);
        response.extend_from_slice(&data);
    }

    fn dap_transfer_block(&mut self, request: &[u8], response: &mut Vec<u8>) {
        let count = u16::from_le_bytes([
            request.get(2).copied().unwrap_or(0),
            request.get(3).copied().unwrap_or(0),
        ]);
        let req = request.get(4).copied().unwrap_or(0);
        let rnw = req & 0x2 != 0;
        let mut done = 0u16;
        let mut ack = ACK_OK;
        let mut data = Vec::new();
        for i in 0..count as usize {
            let write = if rnw { 0 } else { word(request, 5 + 4 * i) };
            let (status, value) = self.transfer(req, write);
            ack = status;
            if status != ACK_OK {
                break;
            }
            if rnw {
                data.extend_from_slice(&value.to_le_bytes());
            }
            done += 1;
        }
        response.extend_from_slice(&done.to_le_bytes());
        response.push(ack);
        response.extend_from_slice(&data);
    }

    fn info(&self, id: u8, response: &mut Vec<u8>) {
        let data: Vec<u8> = match id {
            0x01 => b"ARM\0".to_vec(),
            0x02 => b"DAPLink CMSIS-DAP\0".to_vec(),
            0x03 => b"0240000032044e4500\0".to_vec(),
            0x04 => format!("{}\0", Self::FIRMWARE_VERSION).into_bytes(),
            // SWD only
            0xF0 => vec![0x01],
            0xFF => (Self::PACKET_SIZE as u16).to_le_bytes().to_vec(),
            _ => Vec::new(),
        };
        response.push(data.len() as u8);
        response.extend_from_slice(&data);
    }

    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let Some(&command) = request.first() else {
            return vec![DAP_INVALID];
        };
        let mut response = vec![command];
        match command {
            0x00 => self.info(request.get(1).copied().unwrap_or(0), &mut response),
            0x01 => response.push(STATUS_OK),
            0x02 => {
                let port = request.get(1).copied().unwrap_or(0);
                response.push(if port <= 1 && !self.refuse_swd { 1 } else { 0 });
            }
            0x03 => {
                self.line = LineState::Dormant;
                response.push(STATUS_OK);
            }
            0x04 => response.push(STATUS_OK),
            0x05 => self.dap_transfer(request, &mut response),
            0x06 => self.dap_transfer_block(request, &mut response),
            0x08 if self.reject_write_abort => response.push(STATUS_ERR),
            0x08 => {
                let abort = word(request, 2);
                self.target.abort(abort);
                self.accesses.push(Access::Abort(abort));
                response.push(STATUS_OK);
            }
            0x10 => {
                let output = request.get(1).copied().unwrap_or(0);
                let select = request.get(2).copied().unwrap_or(0);
                if select & 0x80 != 0 {
                    self.set_nreset(output & 0x80 != 0);
                }
                // SWDIO and nRESET pulled up
                response.push(if self.nreset { 0x82 } else { 0x02 });
            }
            0x11 => {
                self.clock_hz = word(request, 1);
                response.push(STATUS_OK);
            }
            0x12 => {
                let bits = match request.get(1).copied().unwrap_or(0) {
                    0 => 256,
                    n => n as usize,
                };
                let data = request.get(2..).unwrap_or_default();
                self.sequence(bits, data);
                response.push(STATUS_OK);
            }
            0x13 => response.push(if self.reject_swd_configure {
                STATUS_ERR
            } else {
                STATUS_OK
            }),
            _ => response[0] = DAP_INVALID,
        }
        if self.corrupt_echo {
            self.corrupt_echo = false;
            response[0] ^= 0x80;
        }
        response
    }
}

fn word(bytes: &[u8], at: usize) -> u32 {
    let mut le = [0u8; 4];
    for (i, b) in le.iter_mut().enumerate() {
        *b = bytes.get(at + i).copied().unwrap_or(0);
    }
    u32::from_le_bytes(le)
}

impl Transport for SimProbe {
    fn descriptor(&self) -> ProbeDescriptor {
        self.descriptor
    }

    fn descriptor_strings(&mut self) -> Option<DescriptorStrings> {
        Some(DescriptorStrings {
            manufacturer: "ARM".into(),
            product: "DAPLink CMSIS-DAP".into(),
        })
    }

    fn claim(&mut self) -> Result<(), TransportError> {
        if self.descriptor.interface_class != Some(USB_CLASS_HID) {
            return Err(TransportError::NoHidInterface);
        }
        self.claimed = true;
        Ok(())
    }

    fn release(&mut self) {
        self.claimed = false;
    }

    fn packet_size(&self) -> usize {
        if self.claimed {
            Self::PACKET_SIZE
        } else {
            0
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let report = pad_report(request, self.packet_size())?;
        self.frames.push(request.to_vec());
        let mut response = self.respond(&report);
        response.resize(Self::PACKET_SIZE, 0);
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unclaimed_probe_refuses_exchange() {
        let mut probe = SimProbe::default();
        assert!(matches!(
            probe.exchange(&[0x00, 0x04]),
            Err(TransportError::NotClaimed)
        ));
        probe.claim().unwrap();
        assert_eq!(probe.packet_size(), 64);
        let response = probe.exchange(&[0x00, 0x04]).unwrap();
        assert_eq!(&response[..7], &[0x00, 0x05, b'0', b'2', b'5', b'4', 0x00]);
        assert_eq!(response.len(), 64);
    }

    #[test]
    fn line_needs_reset_then_idle() {
        let mut probe = SimProbe::claimed();
        probe.exchange(&[0x12, 0x38, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(probe.line(), LineState::Reset);
        probe.exchange(&[0x12, 0x10, 0x9E, 0xE7]).unwrap();
        assert_eq!(probe.line(), LineState::Reset);
        probe.exchange(&[0x12, 0x10, 0x00, 0x00]).unwrap();
        assert_eq!(probe.line(), LineState::Active);
        // nRESET low
        probe.exchange(&[0x10, 0x00, 0x80, 0, 0, 0, 0]).unwrap();
        assert_eq!(probe.line(), LineState::Dormant);
    }

    #[test]
    fn unknown_command_is_invalid() {
        let mut probe = SimProbe::claimed();
        assert_eq!(probe.exchange(&[0x7F]).unwrap()[0], 0xFF);
    }

    #[test]
    fn tar_wraps_within_1k() {
        let mut target = SimTarget::default();
        target.csw = u32::from(ap::Csw::word_auto_increment());
        target.tar = 0x2000_03FC;
        target.auto_increment();
        assert_eq!(target.tar, 0x2000_0000);
    }

    #[test]
    fn dhcsr_reset_flag_clears_on_read() {
        let mut target = SimTarget::default();
        target.pin_reset();
        assert_ne!(target.bus_read(cortex_m::DHCSR) & 1 << 25, 0);
        assert_eq!(target.bus_read(cortex_m::DHCSR) & 1 << 25, 0);
    }
}
