//! Deciding whether a USB device is a CMSIS-DAP probe

use cmsisdebug_common::ProbeDescriptor;

/// Keil (ARM), mbed/DAPLink and Atmel EDBG
pub const KNOWN_PROBE_VENDORS: [u16; 3] = [0xC251, 0x0D28, 0x03EB];

pub trait ProbeClassifier {
    fn classify(&self, vendor_id: u16, product_id: u16, interface_class: Option<u8>) -> bool;

    fn classify_descriptor(&self, descriptor: &ProbeDescriptor) -> bool {
        self.classify(
            descriptor.vendor_id,
            descriptor.product_id,
            descriptor.interface_class,
        )
    }
}

/// Accepts any device whose vendor id is on the list. Product id and
/// interface are not looked at, so a non-probe HID device from one of these
/// vendors is a false positive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorAllowList {
    vendors: Vec<u16>,
}

impl VendorAllowList {
    pub fn new(vendors: impl Into<Vec<u16>>) -> Self {
        Self {
            vendors: vendors.into(),
        }
    }
}

impl Default for VendorAllowList {
    fn default() -> Self {
        Self::new(KNOWN_PROBE_VENDORS)
    }
}

impl ProbeClassifier for VendorAllowList {
    fn classify(&self, vendor_id: u16, _product_id: u16, _interface_class: Option<u8>) -> bool {
        self.vendors.contains(&vendor_id)
    }
}

impl<F> ProbeClassifier for F
where
    F: Fn(u16, u16, Option<u8>) -> bool,
{
    fn classify(&self, vendor_id: u16, product_id: u16, interface_class: Option<u8>) -> bool {
        self(vendor_id, product_id, interface_class)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cmsisdebug_common::USB_CLASS_HID;

    #[test]
    fn vendor_only() {
        let classifier = VendorAllowList::default();
        assert!(classifier.classify(0xC251, 0xF001, Some(USB_CLASS_HID)));
        assert!(classifier.classify(0x0D28, 0x0204, None));
        assert!(classifier.classify(0x03EB, 0x2111, Some(USB_CLASS_HID)));
        assert!(!classifier.classify(0x0483, 0x3748, Some(USB_CLASS_HID)));
    }

    #[test]
    fn closures_can_be_stricter() {
        let strict = |vendor_id: u16, product_id: u16, interface_class: Option<u8>| {
            vendor_id == 0x0D28 && product_id == 0x0204 && interface_class == Some(USB_CLASS_HID)
        };
        let descriptor = ProbeDescriptor {
            vendor_id: 0x0D28,
            product_id: 0x0204,
            interface_class: None,
        };
        assert!(!strict.classify_descriptor(&descriptor));
        assert!(VendorAllowList::default().classify_descriptor(&descriptor));
    }
}
