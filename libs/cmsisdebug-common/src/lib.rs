use std::fmt::Display;

use bilge::prelude::*;

/// USB interface class code for HID
pub const USB_CLASS_HID: u8 = 0x03;

/// USB descriptor type for string descriptors
pub const USB_DT_STRING: u8 = 0x03;

/// First byte of every CMSIS-DAP report, echoed back by the probe in its response.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandId {
    Info = 0x00,
    Led = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    WriteAbort = 0x08,
    SwjPins = 0x10,
    SwjClock = 0x11,
    SwjSequence = 0x12,
    SwdConfigure = 0x13,
}

impl CommandId {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let id = match byte {
            0x00 => Self::Info,
            0x01 => Self::Led,
            0x02 => Self::Connect,
            0x03 => Self::Disconnect,
            0x04 => Self::TransferConfigure,
            0x05 => Self::Transfer,
            0x06 => Self::TransferBlock,
            0x08 => Self::WriteAbort,
            0x10 => Self::SwjPins,
            0x11 => Self::SwjClock,
            0x12 => Self::SwjSequence,
            0x13 => Self::SwdConfigure,
            _ => return None,
        };
        Some(id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    Dp,
    Ap,
}

impl Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Dp => f.write_str("DP"),
            Port::Ap => f.write_str("AP"),
        }
    }
}

/// Debug Port registers reachable without DP bank switching
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DpRegister {
    /// DPIDR on read, ABORT on write
    IdrAbort = 0x0,
    CtrlStat = 0x4,
    Select = 0x8,
}

/// Access Port registers within the bank designated by DP.SELECT.
///
/// In bank 0x0 of a MEM-AP these are CSW/TAR/DRW. In bank 0xF the same
/// offsets address CFG/BASE/IDR, which is how the AP identification is read.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApRegister {
    Csw = 0x0,
    Tar = 0x4,
    Drw = 0xC,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{port} register offset {offset:#x} is not supported")]
pub struct InvalidOffset {
    pub port: Port,
    pub offset: u8,
}

impl TryFrom<u8> for DpRegister {
    type Error = InvalidOffset;

    fn try_from(offset: u8) -> Result<Self, Self::Error> {
        match offset {
            0x0 => Ok(Self::IdrAbort),
            0x4 => Ok(Self::CtrlStat),
            0x8 => Ok(Self::Select),
            offset => Err(InvalidOffset {
                port: Port::Dp,
                offset,
            }),
        }
    }
}

impl TryFrom<u8> for ApRegister {
    type Error = InvalidOffset;

    fn try_from(offset: u8) -> Result<Self, Self::Error> {
        match offset {
            0x0 => Ok(Self::Csw),
            0x4 => Ok(Self::Tar),
            0xC => Ok(Self::Drw),
            offset => Err(InvalidOffset {
                port: Port::Ap,
                offset,
            }),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterAddress {
    DebugPort(DpRegister),
    AccessPort(ApRegister),
}

impl RegisterAddress {
    pub fn dp(offset: u8) -> Result<Self, InvalidOffset> {
        DpRegister::try_from(offset).map(Self::DebugPort)
    }

    pub fn ap(offset: u8) -> Result<Self, InvalidOffset> {
        ApRegister::try_from(offset).map(Self::AccessPort)
    }

    pub fn port(&self) -> Port {
        match self {
            Self::DebugPort(_) => Port::Dp,
            Self::AccessPort(_) => Port::Ap,
        }
    }

    pub fn offset(&self) -> u8 {
        match *self {
            Self::DebugPort(r) => r as u8,
            Self::AccessPort(r) => r as u8,
        }
    }

    /// A[3:2] as carried in the SWD packet header
    pub fn a(&self) -> u2 {
        u2::new(self.offset() >> 2)
    }

    /// Request byte of a single DAP_Transfer/DAP_TransferBlock access
    pub fn request(&self, rnw: bool) -> TransferRequest {
        TransferRequest::new(
            self.port() == Port::Ap,
            rnw,
            self.a(),
            false,
            false,
            false,
            false,
        )
    }
}

impl From<DpRegister> for RegisterAddress {
    fn from(value: DpRegister) -> Self {
        Self::DebugPort(value)
    }
}

impl From<ApRegister> for RegisterAddress {
    fn from(value: ApRegister) -> Self {
        Self::AccessPort(value)
    }
}

#[bitsize(8)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct TransferRequest {
    pub apndp: bool,
    pub rnw: bool,
    /// 2nd and 3rd bit of the register offset
    pub a: u2,
    pub value_match: bool,
    pub match_mask: bool,
    pub res6: bool,
    pub timestamp_request: bool,
}

impl TransferRequest {
    pub fn offset(&self) -> u8 {
        self.a().value() << 2
    }
}

/// Identifies a candidate USB device before any interface is claimed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Class of the first HID-class interface, if the device exposes one
    pub interface_class: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorStrings {
    pub manufacturer: String,
    pub product: String,
}

impl Display for DescriptorStrings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.manufacturer.is_empty(), self.product.is_empty()) {
            (false, false) => write!(f, "{} {}", self.manufacturer, self.product),
            (false, true) => f.write_str(&self.manufacturer),
            (true, _) => f.write_str(&self.product),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

impl Display for EndpointDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointDirection::In => f.write_str("interrupt IN"),
            EndpointDirection::Out => f.write_str("interrupt OUT"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport interface is not claimed")]
    NotClaimed,
    #[error("device exposes no claimable HID interface")]
    NoHidInterface,
    #[error("HID interface has no {0} endpoint")]
    MissingEndpoint(EndpointDirection),
    #[error("report of {len} bytes exceeds the {max} byte packet size")]
    ReportTooLarge { len: usize, max: usize },
    #[error("short write: {actual} of {expected} bytes sent")]
    ShortWrite { expected: usize, actual: usize },
    #[error("USB error: {0}")]
    Usb(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A report-oriented link to a CMSIS-DAP probe.
///
/// Every exchange is one blocking request/response pair. Implementations
/// pad the request to [`Transport::packet_size`] with zeroes and return the
/// full response report.
pub trait Transport {
    fn descriptor(&self) -> ProbeDescriptor;

    fn descriptor_strings(&mut self) -> Option<DescriptorStrings>;

    /// Claim the HID interface and resolve its interrupt endpoints
    fn claim(&mut self) -> Result<(), TransportError>;

    /// Release the claimed interface. Calling it on an unclaimed transport is a no-op.
    fn release(&mut self);

    /// Maximum report size, 0 while no interface is claimed
    fn packet_size(&self) -> usize;

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn descriptor(&self) -> ProbeDescriptor {
        (**self).descriptor()
    }

    fn descriptor_strings(&mut self) -> Option<DescriptorStrings> {
        (**self).descriptor_strings()
    }

    fn claim(&mut self) -> Result<(), TransportError> {
        (**self).claim()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn packet_size(&self) -> usize {
        (**self).packet_size()
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).exchange(request)
    }
}

/// Zero-pads `request` to a full report of `packet_size` bytes
pub fn pad_report(request: &[u8], packet_size: usize) -> Result<Vec<u8>, TransportError> {
    if packet_size == 0 {
        return Err(TransportError::NotClaimed);
    }
    if request.len() > packet_size {
        return Err(TransportError::ReportTooLarge {
            len: request.len(),
            max: packet_size,
        });
    }
    let mut report = vec![0; packet_size];
    report[..request.len()].copy_from_slice(request);
    Ok(report)
}

/// Decodes a raw USB string descriptor (`bLength`, `bDescriptorType`, UTF-16LE payload)
pub fn decode_string_descriptor(raw: &[u8]) -> Option<String> {
    if raw.len() <= 2 || raw[1] != USB_DT_STRING {
        return None;
    }
    let length = (raw[0] as usize).min(raw.len());
    let units = raw
        .get(2..length)?
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let decoded: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Some(decoded)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_offsets_are_validated_per_port() {
        assert_eq!(
            RegisterAddress::dp(0x8),
            Ok(RegisterAddress::DebugPort(DpRegister::Select))
        );
        assert_eq!(
            RegisterAddress::ap(0xC),
            Ok(RegisterAddress::AccessPort(ApRegister::Drw))
        );
        assert_eq!(
            RegisterAddress::dp(0xC),
            Err(InvalidOffset {
                port: Port::Dp,
                offset: 0xC
            })
        );
        assert_eq!(
            RegisterAddress::ap(0x8),
            Err(InvalidOffset {
                port: Port::Ap,
                offset: 0x8
            })
        );
    }

    #[test]
    fn request_byte_layout() {
        let dp_idr_read = RegisterAddress::from(DpRegister::IdrAbort).request(true);
        assert_eq!(u8::from(dp_idr_read), 0x02);
        let dp_select_write = RegisterAddress::from(DpRegister::Select).request(false);
        assert_eq!(u8::from(dp_select_write), 0x08);
        let ap_drw_read = RegisterAddress::from(ApRegister::Drw).request(true);
        assert_eq!(u8::from(ap_drw_read), 0x0F);
        let ap_tar_write = RegisterAddress::from(ApRegister::Tar).request(false);
        assert_eq!(u8::from(ap_tar_write), 0x05);
        assert_eq!(TransferRequest::from(0x0Fu8).offset(), 0xC);
    }

    #[test]
    fn reports_are_zero_padded() {
        let report = pad_report(&[0x05, 0x00, 0x01, 0x02], 8).unwrap();
        assert_eq!(report, vec![0x05, 0x00, 0x01, 0x02, 0, 0, 0, 0]);
        assert!(matches!(
            pad_report(&[0; 9], 8),
            Err(TransportError::ReportTooLarge { len: 9, max: 8 })
        ));
        assert!(matches!(
            pad_report(&[0x00], 0),
            Err(TransportError::NotClaimed)
        ));
    }

    #[test]
    fn string_descriptor_is_utf16le() {
        // "ARM" with bLength = 8
        let raw = [8, USB_DT_STRING, b'A', 0, b'R', 0, b'M', 0, 0xAA, 0xBB];
        assert_eq!(decode_string_descriptor(&raw).as_deref(), Some("ARM"));
        assert_eq!(decode_string_descriptor(&[2, USB_DT_STRING]), None);
        assert_eq!(decode_string_descriptor(&[4, 0x02, b'A', 0]), None);
    }

    #[test]
    fn string_descriptor_with_short_length_byte() {
        assert_eq!(decode_string_descriptor(&[1, USB_DT_STRING, 0]), None);
        assert_eq!(decode_string_descriptor(&[0, USB_DT_STRING, b'A', 0]), None);
        // Length byte shorter than the buffer wins
        assert_eq!(
            decode_string_descriptor(&[4, USB_DT_STRING, b'A', 0, b'B', 0]).as_deref(),
            Some("A")
        );
    }

    #[test]
    fn descriptor_strings_display() {
        let strings = DescriptorStrings {
            manufacturer: "ARM".into(),
            product: "DAPLink CMSIS-DAP".into(),
        };
        assert_eq!(strings.to_string(), "ARM DAPLink CMSIS-DAP");
    }
}
