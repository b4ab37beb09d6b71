//! ARM Debug Interface register layouts used by the engine

use bilge::prelude::*;
use std::fmt::Display;

pub mod dp {
    use super::*;

    #[bitsize(32)]
    #[derive(Default, FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
    pub struct Select {
        pub dpbanksel: u4,
        pub apbanksel: u4,
        pub res8: u16,
        pub apsel: u8,
    }

    impl Select {
        pub fn ap_bank(apsel: u8, apbanksel: u4) -> Self {
            let mut select = Self::from(0u32);
            select.set_apsel(apsel);
            select.set_apbanksel(apbanksel);
            select
        }
    }

    #[bitsize(32)]
    #[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
    pub struct Dpidr {
        pub ra0: bool,
        pub designer: u11,
        pub version: u4,
        pub min: bool,
        pub res17: u3,
        pub partno: u8,
        pub revision: u4,
    }

    /// Debug and system power-up requests
    pub const CTRL_POWER_UP: u32 = 0x5000_0000;
    pub const CTRL_CDBGPWRUPACK: u32 = 1 << 29;
    pub const CTRL_CSYSPWRUPACK: u32 = 1 << 31;
    pub const STAT_STICKYORUN: u32 = 1 << 1;
    pub const STAT_STICKYCMP: u32 = 1 << 4;
    pub const STAT_STICKYERR: u32 = 1 << 5;
    pub const STAT_STICKY_MASK: u32 = STAT_STICKYORUN | STAT_STICKYCMP | STAT_STICKYERR;

    /// ORUNERRCLR | WDERRCLR | STKERRCLR | STKCMPCLR
    pub const ABORT_CLEAR_STICKY: u32 = 0x0000_001E;
}

pub mod ap {
    use super::*;

    #[bitsize(32)]
    #[derive(Default, TryFromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
    pub struct Csw {
        pub size: CswSize,
        pub reserved: u1,
        pub addr_inc: CswAddrInc,
        pub device_en: bool,
        pub transfer_in_progress: bool,
        pub reserved: u15,
        pub secure_debug: bool,
        pub protection: u7, // HPROT on AHB-AP, meaning is bus specific
        pub dbg_sw_enable: bool,
    }

    impl Csw {
        /// 32-bit accesses with single auto-increment, privileged data
        pub fn word_auto_increment() -> Self {
            let mut csw = Self::default();
            csw.set_size(CswSize::Word);
            csw.set_addr_inc(CswAddrInc::Single);
            csw.set_protection(u7::new(0x23));
            csw
        }
    }

    #[bitsize(2)]
    #[derive(Default, TryFromBits, Copy, Clone, Debug, PartialEq, Eq)]
    pub enum CswAddrInc {
        #[default]
        Disabled = 0b00,
        Single = 0b01,
        // Packed increment is not supported
        // Packed = 0b10,
    }

    #[bitsize(3)]
    #[derive(Default, TryFromBits, Copy, Clone, Debug, PartialEq, Eq)]
    pub enum CswSize {
        #[default]
        Byte = 0b000,
        Halfword = 0b001,
        Word = 0b010,
        // MEM-AP Large Data Extension is not supported
        // Doubleword = 0b011,
        // Bits128 = 0b100,
        // Bits256 = 0b101,
    }

    /// TAR auto-increment is only guaranteed within a 1 KiB block
    pub const AUTO_INCREMENT_WRAP: u32 = 0x400;

    /// Bank holding CFG, BASE and IDR (offsets 0x4, 0x8, 0xC within it)
    pub const ID_BANK: u8 = 0xF;

    #[bitsize(32)]
    #[derive(Default, FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
    pub struct Idr {
        pub type_: IdrType,
        pub variant: u4,
        pub res0: u5,
        pub class: IdrClass,
        pub designer: u11,
        pub revision: u4,
    }

    impl Display for Idr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(
                f,
                "{:?} {:?} rev {}",
                self.class(),
                self.type_(),
                self.revision().value()
            )
        }
    }

    #[bitsize(4)]
    #[repr(u8)]
    #[derive(FromBits, Copy, Clone, Debug, PartialEq, Eq)]
    pub enum IdrType {
        JtagConnectionOrComAp = 0x0,
        AmbaAhb3Bus = 0x1,
        AmbaApb2OrApb3Bus = 0x2,
        AmbaAxi3OrAxi4BusWithOptionalAceLiteSupport = 0x4,
        AmbaAhb5Bus = 0x5,
        AmbaApb4AndApb5Bus = 0x6,
        AmbaAxi5Bus = 0x7,
        AmbaAhb5WithEnhancedHprot = 0x8,
        #[fallback]
        Reserved(u4),
    }

    impl Default for IdrType {
        fn default() -> Self {
            Self::Reserved(u4::new(0b0))
        }
    }

    #[bitsize(4)]
    #[derive(Default, FromBits, Copy, Clone, Debug, PartialEq, Eq)]
    pub enum IdrClass {
        #[default]
        #[fallback]
        Undefined = 0b0000,
        ComAccessPort = 0b0001,
        MemoryAccessPort = 0b1000,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn word_csw_matches_probe_firmware_value() {
        assert_eq!(u32::from(ap::Csw::word_auto_increment()), 0x2300_0012);
    }

    #[test]
    fn select_designates_ap_bank() {
        assert_eq!(u32::from(dp::Select::ap_bank(0, u4::new(0))), 0x0000_0000);
        assert_eq!(
            u32::from(dp::Select::ap_bank(0, u4::new(ap::ID_BANK))),
            0x0000_00F0
        );
        assert_eq!(u32::from(dp::Select::ap_bank(1, u4::new(0x2))), 0x0100_0020);
    }

    #[test]
    fn ahb_ap_idr_decodes() {
        let idr = ap::Idr::from(0x2477_0011);
        assert_eq!(idr.type_(), ap::IdrType::AmbaAhb3Bus);
        assert_eq!(idr.class(), ap::IdrClass::MemoryAccessPort);
        assert_eq!(idr.designer().value(), 0x23B);
        assert_eq!(idr.revision().value(), 0x2);
        assert_eq!(idr.to_string(), "MemoryAccessPort AmbaAhb3Bus rev 2");
    }

    #[test]
    fn dpidr_fields() {
        let dpidr = dp::Dpidr::from(0x2BA0_1477);
        assert!(dpidr.ra0());
        assert_eq!(dpidr.designer().value(), 0x23B);
        assert_eq!(dpidr.version().value(), 1);
        assert_eq!(dpidr.partno(), 0xBA);
        assert_eq!(dpidr.revision().value(), 0x2);
    }
}
