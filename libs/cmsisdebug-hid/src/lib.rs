//! CMSIS-DAP v1 transport over a USB HID-class interface.
//!
//! The HID interface is driven directly through its interrupt endpoints with
//! libusb, without going through a HID report parser. Reports are fixed size
//! (the interrupt endpoint's max packet size) and zero padded.

use std::fmt::Display;
use std::time::Duration;

use cmsisdebug_common::{
    decode_string_descriptor, pad_report, DescriptorStrings, EndpointDirection, ProbeDescriptor,
    Transport, TransportError, USB_CLASS_HID, USB_DT_STRING,
};
use rusb::{Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType, TransferType};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// GET_DESCRIPTOR
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// English (United States)
const LANGUAGE_ID: u16 = 0x0409;

fn usb(error: rusb::Error) -> TransportError {
    TransportError::Usb(Box::new(error))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Endpoint {
    address: u8,
    direction: EndpointDirection,
    interrupt: bool,
    max_packet_size: usize,
}

/// Picks the first interrupt IN and interrupt OUT endpoint of an interface.
/// The report size is the smaller of their packet sizes.
fn pick_endpoints(endpoints: &[Endpoint]) -> Result<(u8, u8, usize), TransportError> {
    let find = |direction| {
        endpoints
            .iter()
            .find(|ep| ep.interrupt && ep.direction == direction)
            .ok_or(TransportError::MissingEndpoint(direction))
    };
    let ep_in = find(EndpointDirection::In)?;
    let ep_out = find(EndpointDirection::Out)?;
    Ok((
        ep_in.address,
        ep_out.address,
        ep_in.max_packet_size.min(ep_out.max_packet_size),
    ))
}

struct Claimed {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    packet_size: usize,
}

/// A USB device that may expose a CMSIS-DAP HID interface
pub struct HidTransport {
    device: Device<GlobalContext>,
    descriptor: ProbeDescriptor,
    timeout: Duration,
    claimed: Option<Claimed>,
}

impl HidTransport {
    pub fn open(device: Device<GlobalContext>, timeout: Duration) -> Result<Self, TransportError> {
        let device_descriptor = device.device_descriptor().map_err(usb)?;
        let interface_class = hid_interface(&device)?.map(|_| USB_CLASS_HID);
        Ok(Self {
            descriptor: ProbeDescriptor {
                vendor_id: device_descriptor.vendor_id(),
                product_id: device_descriptor.product_id(),
                interface_class,
            },
            device,
            timeout,
            claimed: None,
        })
    }

    /// Every attached device exposing a HID-class interface
    pub fn list(timeout: Duration) -> Result<Vec<Self>, TransportError> {
        let mut transports = Vec::new();
        for device in rusb::devices().map_err(usb)?.iter() {
            match Self::open(device, timeout) {
                Ok(transport) if transport.descriptor.interface_class.is_some() => {
                    transports.push(transport)
                }
                Ok(_) => {}
                Err(e) => log::debug!("skipping USB device: {e}"),
            }
        }
        Ok(transports)
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    fn read_string(
        &self,
        handle: &DeviceHandle<GlobalContext>,
        index: Option<u8>,
    ) -> Option<String> {
        let index = index?;
        let mut buf = [0u8; 255];
        let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let len = handle
            .read_control(
                request_type,
                REQUEST_GET_DESCRIPTOR,
                (USB_DT_STRING as u16) << 8 | index as u16,
                LANGUAGE_ID,
                &mut buf,
                self.timeout,
            )
            .map_err(|e| log::debug!("string descriptor {index}: {e}"))
            .ok()?;
        decode_string_descriptor(&buf[..len])
    }
}

impl Display for HidTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bus {:03} device {:03} {:04x}:{:04x}",
            self.bus_number(),
            self.address(),
            self.descriptor.vendor_id,
            self.descriptor.product_id
        )
    }
}

/// Interface number and endpoints of the first HID-class interface
fn hid_interface(device: &Device<GlobalContext>) -> Result<Option<(u8, Vec<Endpoint>)>, TransportError> {
    let config = device.active_config_descriptor().map_err(usb)?;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != USB_CLASS_HID {
                continue;
            }
            let endpoints = descriptor
                .endpoint_descriptors()
                .map(|ep| Endpoint {
                    address: ep.address(),
                    direction: match ep.direction() {
                        Direction::In => EndpointDirection::In,
                        Direction::Out => EndpointDirection::Out,
                    },
                    interrupt: ep.transfer_type() == TransferType::Interrupt,
                    max_packet_size: ep.max_packet_size() as usize,
                })
                .collect();
            return Ok(Some((descriptor.interface_number(), endpoints)));
        }
    }
    Ok(None)
}

impl Transport for HidTransport {
    fn descriptor(&self) -> ProbeDescriptor {
        self.descriptor
    }

    fn descriptor_strings(&mut self) -> Option<DescriptorStrings> {
        let device_descriptor = self.device.device_descriptor().ok()?;
        let opened;
        let handle = match &self.claimed {
            Some(claimed) => &claimed.handle,
            None => {
                opened = self
                    .device
                    .open()
                    .map_err(|e| log::debug!("open for descriptor strings: {e}"))
                    .ok()?;
                &opened
            }
        };
        let manufacturer = self.read_string(handle, device_descriptor.manufacturer_string_index());
        let product = self.read_string(handle, device_descriptor.product_string_index());
        if manufacturer.is_none() && product.is_none() {
            return None;
        }
        Some(DescriptorStrings {
            manufacturer: manufacturer.unwrap_or_default(),
            product: product.unwrap_or_default(),
        })
    }

    fn claim(&mut self) -> Result<(), TransportError> {
        if self.claimed.is_some() {
            return Ok(());
        }
        let (interface, endpoints) =
            hid_interface(&self.device)?.ok_or(TransportError::NoHidInterface)?;
        let (ep_in, ep_out, packet_size) = pick_endpoints(&endpoints)?;

        let mut handle = self.device.open().map_err(usb)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("kernel driver auto-detach unavailable: {e}");
        }
        handle.claim_interface(interface).map_err(usb)?;
        log::info!(
            "claimed interface {interface} of {}, IN {ep_in:#04x} OUT {ep_out:#04x}, {packet_size} byte reports",
            self
        );
        self.claimed = Some(Claimed {
            handle,
            interface,
            ep_in,
            ep_out,
            packet_size,
        });
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut claimed) = self.claimed.take() {
            if let Err(e) = claimed.handle.release_interface(claimed.interface) {
                log::warn!("releasing interface {}: {e}", claimed.interface);
            }
        }
    }

    fn packet_size(&self) -> usize {
        self.claimed.as_ref().map_or(0, |c| c.packet_size)
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let claimed = self.claimed.as_ref().ok_or(TransportError::NotClaimed)?;
        let report = pad_report(request, claimed.packet_size)?;
        let written = claimed
            .handle
            .write_interrupt(claimed.ep_out, &report, self.timeout)
            .map_err(usb)?;
        if written != report.len() {
            return Err(TransportError::ShortWrite {
                expected: report.len(),
                actual: written,
            });
        }
        let mut response = vec![0u8; claimed.packet_size];
        let read = claimed
            .handle
            .read_interrupt(claimed.ep_in, &mut response, self.timeout)
            .map_err(usb)?;
        response.truncate(read);
        Ok(response)
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ep(address: u8, interrupt: bool, max_packet_size: usize) -> Endpoint {
        Endpoint {
            address,
            direction: if address & 0x80 != 0 {
                EndpointDirection::In
            } else {
                EndpointDirection::Out
            },
            interrupt,
            max_packet_size,
        }
    }

    #[test]
    fn interrupt_endpoints_are_picked() {
        let endpoints = [ep(0x02, false, 512), ep(0x81, true, 64), ep(0x01, true, 64)];
        assert_eq!(pick_endpoints(&endpoints).unwrap(), (0x81, 0x01, 64));
    }

    #[test]
    fn report_size_is_the_smaller_endpoint() {
        let endpoints = [ep(0x81, true, 64), ep(0x02, true, 1024)];
        assert_eq!(pick_endpoints(&endpoints).unwrap().2, 64);
    }

    #[test]
    fn missing_endpoint_is_reported_by_direction() {
        assert!(matches!(
            pick_endpoints(&[ep(0x81, true, 64)]),
            Err(TransportError::MissingEndpoint(EndpointDirection::Out))
        ));
        assert!(matches!(
            pick_endpoints(&[ep(0x01, true, 64), ep(0x82, false, 64)]),
            Err(TransportError::MissingEndpoint(EndpointDirection::In))
        ));
    }
}
