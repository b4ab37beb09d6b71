//! CMSIS-DAP command frames.
//!
//! Each request knows its command id, how to lay out its payload after the
//! id byte and how to decode the payload of the matching response (the echoed
//! id byte is checked by the engine before `parse_response` is called).

use bilge::prelude::*;
use cmsisdebug_common::{CommandId, TransferRequest};

use crate::DapError;

pub trait Request {
    const COMMAND: CommandId;
    type Response;

    fn payload(&self, buf: &mut Vec<u8>);

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    Err = 0xFF,
}

impl Status {
    fn parse(command: CommandId, payload: &[u8]) -> Result<Self, DapError> {
        match payload.first() {
            Some(0x00) => Ok(Self::Ok),
            Some(_) => Ok(Self::Err),
            None => Err(DapError::ShortResponse(command)),
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }
}

fn read_u32(command: CommandId, payload: &[u8], at: usize) -> Result<u32, DapError> {
    let bytes = payload
        .get(at..at + 4)
        .ok_or(DapError::ShortResponse(command))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InfoId {
    Vendor = 0x01,
    Product = 0x02,
    SerialNumber = 0x03,
    FirmwareVersion = 0x04,
    Capabilities = 0xF0,
    PacketSize = 0xFF,
}

#[derive(Clone, Debug)]
pub struct Info(pub InfoId);

impl Request for Info {
    const COMMAND: CommandId = CommandId::Info;
    type Response = Vec<u8>;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.0 as u8);
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        let len = *payload.first().ok_or(DapError::ShortResponse(Self::COMMAND))? as usize;
        let data = payload
            .get(1..1 + len)
            .ok_or(DapError::ShortResponse(Self::COMMAND))?;
        Ok(data.to_vec())
    }
}

/// Decodes an info string, dropping the NUL terminator most probes append
pub fn info_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[bitsize(8)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct Capabilities {
    pub swd: bool,
    pub jtag: bool,
    pub swo_uart: bool,
    pub swo_manchester: bool,
    pub atomic_commands: bool,
    pub test_domain_timer: bool,
    pub swo_streaming: bool,
    pub uart_com_port: bool,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Led {
    Connect = 0x00,
    Running = 0x01,
}

#[derive(Clone, Debug)]
pub struct HostStatus {
    pub led: Led,
    pub on: bool,
}

impl Request for HostStatus {
    const COMMAND: CommandId = CommandId::Led;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[self.led as u8, self.on as u8]);
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectPort {
    Default = 0x00,
    Swd = 0x01,
    Jtag = 0x02,
}

#[derive(Clone, Debug)]
pub struct Connect {
    pub port: ConnectPort,
}

impl Request for Connect {
    const COMMAND: CommandId = CommandId::Connect;
    /// Port the probe switched to, 0 if the connect failed
    type Response = u8;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.port as u8);
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        payload
            .first()
            .copied()
            .ok_or(DapError::ShortResponse(Self::COMMAND))
    }
}

#[derive(Clone, Debug)]
pub struct Disconnect;

impl Request for Disconnect {
    const COMMAND: CommandId = CommandId::Disconnect;
    type Response = Status;

    fn payload(&self, _buf: &mut Vec<u8>) {}

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[derive(Clone, Debug)]
pub struct TransferConfigure {
    pub idle_cycles: u8,
    pub wait_retry: u16,
    pub match_retry: u16,
}

impl Request for TransferConfigure {
    const COMMAND: CommandId = CommandId::TransferConfigure;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.idle_cycles);
        buf.extend_from_slice(&self.wait_retry.to_le_bytes());
        buf.extend_from_slice(&self.match_retry.to_le_bytes());
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[bitsize(3)]
#[repr(u8)]
#[derive(FromBits, Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferAck {
    // Ok for SWD, OK or FAULT for JTAG
    Ok = 1,
    Wait = 2,
    Fault = 4,
    NoAck = 7,
    #[fallback]
    Invalid(u3),
}

#[bitsize(8)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct TransferStatus {
    pub ack: TransferAck,
    pub protocol_error: bool,
    pub value_mismatch: bool,
    pub res5: u3,
}

impl TransferStatus {
    /// Ok only if the target acknowledged and the probe saw no parity error
    pub fn check(&self) -> Result<(), DapError> {
        if self.protocol_error() {
            return Err(DapError::SwdProtocol);
        }
        match self.ack() {
            TransferAck::Ok => Ok(()),
            ack => Err(DapError::Ack(ack)),
        }
    }
}

/// DAP_Transfer with a single register access
#[derive(Clone, Debug)]
pub struct Transfer {
    pub request: TransferRequest,
    /// Present for writes
    pub data: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct TransferResponse {
    pub transfer_count: u8,
    pub status: TransferStatus,
    pub data: Option<u32>,
}

impl Request for Transfer {
    const COMMAND: CommandId = CommandId::Transfer;
    type Response = TransferResponse;

    fn payload(&self, buf: &mut Vec<u8>) {
        // DAP index is ignored for SWD
        buf.extend_from_slice(&[0x00, 0x01, u8::from(self.request)]);
        if let Some(data) = self.data {
            buf.extend_from_slice(&data.to_le_bytes());
        }
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        let &[transfer_count, status, ..] = payload else {
            return Err(DapError::ShortResponse(Self::COMMAND));
        };
        let status = TransferStatus::from(status);
        let data = if self.request.rnw() && status.ack() == TransferAck::Ok {
            Some(read_u32(Self::COMMAND, payload, 2)?)
        } else {
            None
        };
        Ok(TransferResponse {
            transfer_count,
            status,
            data,
        })
    }
}

/// DAP_TransferBlock, repeated accesses to one register
#[derive(Clone, Debug)]
pub struct TransferBlock {
    pub transfer_count: u16,
    pub request: TransferRequest,
    /// One word per transfer for writes, empty for reads
    pub data: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct TransferBlockResponse {
    pub transfer_count: u16,
    pub status: TransferStatus,
    pub data: Vec<u32>,
}

impl Request for TransferBlock {
    const COMMAND: CommandId = CommandId::TransferBlock;
    type Response = TransferBlockResponse;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(0x00);
        buf.extend_from_slice(&self.transfer_count.to_le_bytes());
        buf.push(u8::from(self.request));
        for word in &self.data {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        let &[count_lo, count_hi, status, ..] = payload else {
            return Err(DapError::ShortResponse(Self::COMMAND));
        };
        let transfer_count = u16::from_le_bytes([count_lo, count_hi]);
        let status = TransferStatus::from(status);
        let mut data = Vec::new();
        if self.request.rnw() {
            for i in 0..transfer_count as usize {
                data.push(read_u32(Self::COMMAND, payload, 3 + 4 * i)?);
            }
        }
        Ok(TransferBlockResponse {
            transfer_count,
            status,
            data,
        })
    }
}

#[derive(Clone, Debug)]
pub struct WriteAbort {
    pub abort: u32,
}

impl Request for WriteAbort {
    const COMMAND: CommandId = CommandId::WriteAbort;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(0x00);
        buf.extend_from_slice(&self.abort.to_le_bytes());
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[bitsize(8)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct Pins {
    pub swclk_tck: bool,
    pub swdio_tms: bool,
    pub tdi: bool,
    pub tdo: bool,
    pub res4: bool,
    pub ntrst: bool,
    pub res6: bool,
    pub nreset: bool,
}

impl Pins {
    pub fn nreset_only(level: bool) -> Self {
        let mut pins = Self::from(0u8);
        pins.set_nreset(level);
        pins
    }
}

#[derive(Clone, Debug)]
pub struct SwjPins {
    pub output: Pins,
    pub select: Pins,
    /// Time the probe waits for the selected pins to settle, at most 3 s
    pub wait_us: u32,
}

impl Request for SwjPins {
    const COMMAND: CommandId = CommandId::SwjPins;
    /// Pin levels read back after the write
    type Response = Pins;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[u8::from(self.output), u8::from(self.select)]);
        buf.extend_from_slice(&self.wait_us.to_le_bytes());
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        payload
            .first()
            .map(|&pins| Pins::from(pins))
            .ok_or(DapError::ShortResponse(Self::COMMAND))
    }
}

#[derive(Clone, Debug)]
pub struct SwjClock {
    pub clock_hz: u32,
}

impl Request for SwjClock {
    const COMMAND: CommandId = CommandId::SwjClock;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.clock_hz.to_le_bytes());
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[derive(Clone, Debug)]
pub struct SwjSequence {
    /// 1..=255 bits, clocked LSB first
    pub bit_count: u8,
    pub bit_data: Vec<u8>,
}

impl Request for SwjSequence {
    const COMMAND: CommandId = CommandId::SwjSequence;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.bit_count);
        buf.extend_from_slice(&self.bit_data);
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[bitsize(8)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct SwdConfiguration {
    /// Turnaround period minus one clock cycle
    pub turnaround: u2,
    pub data_phase: bool,
    pub res3: u5,
}

#[derive(Clone, Debug)]
pub struct SwdConfigure {
    pub config: SwdConfiguration,
}

impl Request for SwdConfigure {
    const COMMAND: CommandId = CommandId::SwdConfigure;
    type Response = Status;

    fn payload(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(self.config));
    }

    fn parse_response(&self, payload: &[u8]) -> Result<Self::Response, DapError> {
        Status::parse(Self::COMMAND, payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cmsisdebug_common::{ApRegister, DpRegister, RegisterAddress};

    fn frame<R: Request>(request: &R) -> Vec<u8> {
        let mut buf = vec![R::COMMAND as u8];
        request.payload(&mut buf);
        buf
    }

    #[test]
    fn transfer_write_frame() {
        let request = Transfer {
            request: RegisterAddress::from(DpRegister::Select).request(false),
            data: Some(0x0000_00F0),
        };
        assert_eq!(
            frame(&request),
            [0x05, 0x00, 0x01, 0x08, 0xF0, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn transfer_read_response() {
        let request = Transfer {
            request: RegisterAddress::from(DpRegister::IdrAbort).request(true),
            data: None,
        };
        let response = request
            .parse_response(&[0x01, 0x01, 0x77, 0x14, 0xA0, 0x2B])
            .unwrap();
        assert_eq!(response.transfer_count, 1);
        assert_eq!(response.status.ack(), TransferAck::Ok);
        assert_eq!(response.data, Some(0x2BA0_1477));
    }

    #[test]
    fn transfer_status_rejects_fault_and_parity() {
        assert!(TransferStatus::from(0x01u8).check().is_ok());
        assert!(matches!(
            TransferStatus::from(0x04u8).check(),
            Err(DapError::Ack(TransferAck::Fault))
        ));
        assert!(matches!(
            TransferStatus::from(0x07u8).check(),
            Err(DapError::Ack(TransferAck::NoAck))
        ));
        assert!(matches!(
            TransferStatus::from(0x09u8).check(),
            Err(DapError::SwdProtocol)
        ));
    }

    #[test]
    fn transfer_block_frames() {
        let read = TransferBlock {
            transfer_count: 1,
            request: RegisterAddress::from(ApRegister::Drw).request(true),
            data: vec![],
        };
        assert_eq!(frame(&read), [0x06, 0x00, 0x01, 0x00, 0x0F]);
        let response = read
            .parse_response(&[0x01, 0x00, 0x01, 0x41, 0xC2, 0x0F, 0x41])
            .unwrap();
        assert_eq!(response.transfer_count, 1);
        assert_eq!(response.data, vec![0x410F_C241]);

        let write = TransferBlock {
            transfer_count: 1,
            request: RegisterAddress::from(ApRegister::Tar).request(false),
            data: vec![0xE000_ED00],
        };
        assert_eq!(
            frame(&write),
            [0x06, 0x00, 0x01, 0x00, 0x05, 0x00, 0xED, 0x00, 0xE0]
        );
    }

    #[test]
    fn short_read_response_is_an_error() {
        let request = TransferBlock {
            transfer_count: 2,
            request: RegisterAddress::from(ApRegister::Drw).request(true),
            data: vec![],
        };
        assert!(matches!(
            request.parse_response(&[0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]),
            Err(DapError::ShortResponse(CommandId::TransferBlock))
        ));
    }

    #[test]
    fn swj_frames() {
        assert_eq!(
            frame(&SwjClock { clock_hz: 100_000 }),
            [0x11, 0xA0, 0x86, 0x01, 0x00]
        );
        assert_eq!(
            frame(&SwjSequence {
                bit_count: 16,
                bit_data: vec![0x9E, 0xE7]
            }),
            [0x12, 0x10, 0x9E, 0xE7]
        );
        assert_eq!(
            frame(&SwjPins {
                output: Pins::nreset_only(false),
                select: Pins::nreset_only(true),
                wait_us: 0,
            }),
            [0x10, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            frame(&TransferConfigure {
                idle_cycles: 0,
                wait_retry: 64,
                match_retry: 0
            }),
            [0x04, 0x00, 0x40, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn info_strings() {
        let request = Info(InfoId::FirmwareVersion);
        assert_eq!(frame(&request), [0x00, 0x04]);
        let data = request
            .parse_response(&[0x06, b'0', b'2', b'5', b'4', b'.', 0x00, 0xAA])
            .unwrap();
        assert_eq!(info_string(&data), "0254.");
        assert!(matches!(
            request.parse_response(&[0x08, b'1']),
            Err(DapError::ShortResponse(CommandId::Info))
        ));
    }

    #[test]
    fn status_byte() {
        let request = Disconnect;
        assert_eq!(request.parse_response(&[0x00]).unwrap(), Status::Ok);
        assert_eq!(request.parse_response(&[0xFF]).unwrap(), Status::Err);
        assert!(request.parse_response(&[]).is_err());
    }
}
