//! Cortex-M System Control Space debug registers

use bilge::prelude::*;
use std::fmt::Display;

use crate::DapError;

pub const CPUID: u32 = 0xE000_ED00;
/// Debug Halting Control and Status Register
pub const DHCSR: u32 = 0xE000_EDF0;
/// Debug Core Register Selector Register
pub const DCRSR: u32 = 0xE000_EDF4;
/// Debug Core Register Data Register
pub const DCRDR: u32 = 0xE000_EDF8;

/// Must accompany every DHCSR write in bits [31:16], otherwise the write is ignored
pub const DBGKEY: u16 = 0xA05F;

pub const C_DEBUGEN: u16 = 1 << 0;
pub const C_HALT: u16 = 1 << 1;
pub const C_STEP: u16 = 1 << 2;
pub const C_MASKINTS: u16 = 1 << 3;

/// DCRSR REGWnR, set for a write to the selected core register
pub const DCRSR_REGWNR: u32 = 1 << 16;

/// Value written to DHCSR to apply `control` bits
pub fn dhcsr_write(control: u16) -> u32 {
    (DBGKEY as u32) << 16 | control as u32
}

/// DHCSR as read back; the upper half carries status instead of the key
#[bitsize(32)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct Dhcsr {
    pub c_debugen: bool,
    pub c_halt: bool,
    pub c_step: bool,
    pub c_maskints: bool,
    pub res4: bool,
    pub c_snapstall: bool,
    pub res6: u10,
    pub s_regrdy: bool,
    pub s_halt: bool,
    pub s_sleep: bool,
    pub s_lockup: bool,
    pub res20: u4,
    pub s_retire_st: bool,
    pub s_reset_st: bool,
    pub res26: u6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreStatus {
    pub debug_enabled: bool,
    pub halted: bool,
    pub sleeping: bool,
    pub lockup: bool,
    pub register_ready: bool,
    pub retired_since_read: bool,
    pub reset_since_read: bool,
}

impl From<Dhcsr> for CoreStatus {
    fn from(dhcsr: Dhcsr) -> Self {
        Self {
            debug_enabled: dhcsr.c_debugen(),
            halted: dhcsr.s_halt(),
            sleeping: dhcsr.s_sleep(),
            lockup: dhcsr.s_lockup(),
            register_ready: dhcsr.s_regrdy(),
            retired_since_read: dhcsr.s_retire_st(),
            reset_since_read: dhcsr.s_reset_st(),
        }
    }
}

impl Display for CoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.lockup {
            "locked up"
        } else if self.halted {
            "halted"
        } else if self.sleeping {
            "sleeping"
        } else {
            "running"
        };
        write!(f, "{state}")?;
        if !self.debug_enabled {
            f.write_str(" (debug disabled)")?;
        }
        if self.reset_since_read {
            f.write_str(" (reset)")?;
        }
        Ok(())
    }
}

/// Core registers reachable through DCRSR/DCRDR
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreRegister(u8);

impl CoreRegister {
    pub const SP: Self = Self(13);
    pub const LR: Self = Self(14);
    pub const PC: Self = Self(15);
    pub const XPSR: Self = Self(16);
    pub const MSP: Self = Self(17);
    pub const PSP: Self = Self(18);
    /// CONTROL, FAULTMASK, BASEPRI and PRIMASK packed in one word
    pub const SPECIAL: Self = Self(20);

    pub fn new(index: u8) -> Result<Self, DapError> {
        // 19 is reserved on every ARMv6-M/ARMv7-M part but still selectable
        if index > 20 {
            return Err(DapError::InvalidCoreRegister(index));
        }
        Ok(Self(index))
    }

    pub fn index(&self) -> u8 {
        self.0
    }
}

impl Display for CoreRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            13 => f.write_str("SP"),
            14 => f.write_str("LR"),
            15 => f.write_str("PC"),
            16 => f.write_str("xPSR"),
            17 => f.write_str("MSP"),
            18 => f.write_str("PSP"),
            20 => f.write_str("CONTROL/FAULTMASK/BASEPRI/PRIMASK"),
            n => write!(f, "R{n}"),
        }
    }
}

#[bitsize(32)]
#[derive(FromBits, Copy, Clone, DebugBits, PartialEq, Eq)]
pub struct Cpuid {
    pub revision: u4,
    pub partno: u12,
    pub architecture: u4,
    pub variant: u4,
    pub implementer: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CortexM {
    M0,
    M1,
    M3,
    M4,
    M0Plus,
}

impl CortexM {
    pub fn from_part_number(part_number: u16) -> Option<Self> {
        match part_number {
            0xC20 => Some(Self::M0),
            0xC21 => Some(Self::M1),
            0xC23 => Some(Self::M3),
            0xC24 => Some(Self::M4),
            0xC60 => Some(Self::M0Plus),
            _ => None,
        }
    }
}

impl Display for CortexM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CortexM::M0 => f.write_str("Cortex M0"),
            CortexM::M1 => f.write_str("Cortex M1"),
            CortexM::M3 => f.write_str("Cortex M3"),
            CortexM::M4 => f.write_str("Cortex M4"),
            CortexM::M0Plus => f.write_str("Cortex M0+"),
        }
    }
}

/// Decoded CPUID. `revision` is the rN variant field, `patch` the pN field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CpuIdentity {
    pub implementer: u8,
    pub part_number: u16,
    pub revision: u8,
    pub patch: u8,
    pub raw: u32,
}

impl CpuIdentity {
    pub fn core(&self) -> Option<CortexM> {
        CortexM::from_part_number(self.part_number)
    }
}

impl From<u32> for CpuIdentity {
    fn from(raw: u32) -> Self {
        let cpuid = Cpuid::from(raw);
        Self {
            implementer: cpuid.implementer(),
            part_number: cpuid.partno().value(),
            revision: cpuid.variant().value(),
            patch: cpuid.revision().value(),
            raw,
        }
    }
}

impl Display for CpuIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.core() {
            Some(core) => write!(f, "{core} r{}p{}", self.revision, self.patch),
            None => write!(f, "unknown: {:#010x}", self.raw),
        }
    }
}
