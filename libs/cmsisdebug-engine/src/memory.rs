//! MEM-AP memory access and Cortex-M core control built on DP/AP accesses

use bilge::prelude::*;
use cmsisdebug_common::{ApRegister, DpRegister, RegisterAddress, Transport};

use crate::adi::{ap, dp};
use crate::commands::TransferBlock;
use crate::cortex_m::{self, CoreRegister, CoreStatus, CpuIdentity, Dhcsr};
use crate::{Dap, DapError};

/// Bytes of a TransferBlock response ahead of the data words
const TRANSFER_BLOCK_OVERHEAD: usize = 4;

/// DP.SELECT value addressing `apbanksel` of AP 0
pub(crate) fn bank_select(apbanksel: u8) -> u32 {
    u32::from(dp::Select::ap_bank(0, u4::new(apbanksel & 0xF)))
}

impl<T: Transport> Dap<T> {
    /// Points DP.SELECT at `apbanksel` of AP 0, skipping the write if it is already there
    pub fn select_bank(&mut self, apbanksel: u8) -> Result<(), DapError> {
        let select = bank_select(apbanksel);
        if self.session.selected_bank == Some(select) {
            return Ok(());
        }
        self.write_dp(DpRegister::Select, select)
    }

    fn configure_csw(&mut self) -> Result<(), DapError> {
        let csw = u32::from(ap::Csw::word_auto_increment());
        if self.session.csw == Some(csw) {
            return Ok(());
        }
        self.write_ap(ApRegister::Csw, csw)
    }

    fn prepare_memory_access(&mut self, address: u32) -> Result<(), DapError> {
        self.select_bank(0)?;
        self.configure_csw()?;
        self.write_ap(ApRegister::Tar, address)
    }

    /// Reads one word. The AHB read is posted, so a bus error only shows up
    /// in CTRL/STAT, which is checked before the value is returned.
    pub fn read_memory_word(&mut self, address: u32) -> Result<u32, DapError> {
        self.prepare_memory_access(address)?;
        let value = self.read_ap(ApRegister::Drw)?;
        self.check_sticky_errors()?;
        log::debug!("mem[{address:#010x}] → {value:#010x}");
        Ok(value)
    }

    /// Writes one word and then checks CTRL/STAT for sticky errors the write
    /// may have raised on the AHB.
    pub fn write_memory_word(&mut self, address: u32, value: u32) -> Result<(), DapError> {
        self.prepare_memory_access(address)?;
        self.write_ap(ApRegister::Drw, value)?;
        log::debug!("mem[{address:#010x}] ← {value:#010x}");
        self.check_sticky_errors()
    }

    fn check_sticky_errors(&mut self) -> Result<(), DapError> {
        let ctrl_stat = self.read_dp(DpRegister::CtrlStat)?;
        if ctrl_stat & dp::STAT_STICKY_MASK != 0 {
            log::warn!("sticky error after memory access, CTRL/STAT = {ctrl_stat:#010x}");
            self.write_abort(dp::ABORT_CLEAR_STICKY)?;
            return Err(DapError::StickyError(ctrl_stat));
        }
        Ok(())
    }

    /// Reads `count` consecutive words. Requests are split so that TAR never
    /// crosses a 1 KiB boundary and every response fits in one report.
    pub fn read_memory_block(&mut self, address: u32, count: usize) -> Result<Vec<u32>, DapError> {
        let per_report = (self.packet_size.saturating_sub(TRANSFER_BLOCK_OVERHEAD) / 4).max(1);
        let mut words = Vec::with_capacity(count);
        let mut address = address & !0x3;
        while words.len() < count {
            let to_wrap = ((ap::AUTO_INCREMENT_WRAP - (address % ap::AUTO_INCREMENT_WRAP)) / 4) as usize;
            let chunk = (count - words.len()).min(to_wrap).min(per_report);
            self.prepare_memory_access(address)?;
            let response = self.send(&TransferBlock {
                transfer_count: chunk as u16,
                request: RegisterAddress::from(ApRegister::Drw).request(true),
                data: Vec::new(),
            })?;
            if response.transfer_count as usize != chunk {
                self.check_status(response.status)?;
                return Err(DapError::TransferCount {
                    expected: chunk as u16,
                    actual: response.transfer_count,
                });
            }
            self.check_status(response.status)?;
            self.check_sticky_errors()?;
            words.extend_from_slice(&response.data);
            address = address.wrapping_add(4 * chunk as u32);
        }
        Ok(words)
    }

    pub fn cpu_id(&mut self) -> Result<CpuIdentity, DapError> {
        self.read_memory_word(cortex_m::CPUID).map(CpuIdentity::from)
    }

    pub fn halt_core(&mut self) -> Result<(), DapError> {
        self.write_memory_word(
            cortex_m::DHCSR,
            cortex_m::dhcsr_write(cortex_m::C_HALT | cortex_m::C_DEBUGEN),
        )
    }

    pub fn resume_core(&mut self) -> Result<(), DapError> {
        self.write_memory_word(
            cortex_m::DHCSR,
            cortex_m::dhcsr_write(cortex_m::C_DEBUGEN),
        )
    }

    pub fn core_status(&mut self) -> Result<CoreStatus, DapError> {
        let dhcsr = self.read_memory_word(cortex_m::DHCSR)?;
        Ok(CoreStatus::from(Dhcsr::from(dhcsr)))
    }

    /// Selects `register` in DCRSR and reads DCRDR. Only meaningful while the core is halted.
    pub fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, DapError> {
        self.write_memory_word(cortex_m::DCRSR, register.index() as u32)?;
        self.read_memory_word(cortex_m::DCRDR)
    }

    pub fn write_core_register(&mut self, register: CoreRegister, value: u32) -> Result<(), DapError> {
        self.write_memory_word(cortex_m::DCRDR, value)?;
        self.write_memory_word(
            cortex_m::DCRSR,
            cortex_m::DCRSR_REGWNR | register.index() as u32,
        )
    }

    /// Powers up the debug domain, clears sticky errors and reads the IDR of AP 0
    pub fn ap_identification(&mut self) -> Result<u32, DapError> {
        self.write_dp(DpRegister::CtrlStat, dp::CTRL_POWER_UP)?;
        self.write_abort(dp::ABORT_CLEAR_STICKY)?;
        let ctrl_stat = self.read_dp(DpRegister::CtrlStat)?;
        if ctrl_stat & dp::CTRL_CDBGPWRUPACK == 0 {
            log::warn!("debug power-up not acknowledged, CTRL/STAT = {ctrl_stat:#010x}");
        }
        self.select_bank(ap::ID_BANK)?;
        let idr = self.read_ap(ApRegister::Drw)?;
        log::debug!("AP IDR {idr:#010x}: {}", ap::Idr::from(idr));
        Ok(idr)
    }

    pub fn read_dpidr(&mut self) -> Result<u32, DapError> {
        let dpidr = self.read_dp(DpRegister::IdrAbort)?;
        self.session.dpidr = Some(dpidr);
        Ok(dpidr)
    }
}

#[cfg(test)]
mod test {
    use cmsisdebug_common::ApRegister;

    use crate::adi::dp;
    use crate::commands::TransferAck;
    use crate::cortex_m::{CoreRegister, CortexM};
    use crate::sim::{Access, SimProbe};
    use crate::{Dap, DapError, SwdConfig};

    fn dap() -> Dap<SimProbe> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut dap = Dap::new(SimProbe::claimed(), SwdConfig::default());
        dap.connect_line().unwrap();
        dap
    }

    #[test]
    fn memory_word_round_trip() {
        let mut dap = dap();
        dap.write_memory_word(0x2000_0000, 0xDEAD_BEEF).unwrap();
        assert_eq!(dap.read_memory_word(0x2000_0000).unwrap(), 0xDEAD_BEEF);
        assert_eq!(dap.read_memory_word(0x2000_0004).unwrap(), 0);
    }

    #[test]
    fn memory_read_frames() {
        let mut dap = dap();
        dap.transport_mut().clear_frames();
        dap.read_memory_word(0xE000_ED00).unwrap();
        assert_eq!(
            dap.transport().frames(),
            &[
                // SELECT bank 0
                vec![0x05, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00],
                // CSW
                vec![0x06, 0x00, 0x01, 0x00, 0x01, 0x12, 0x00, 0x00, 0x23],
                // TAR
                vec![0x06, 0x00, 0x01, 0x00, 0x05, 0x00, 0xED, 0x00, 0xE0],
                // DRW
                vec![0x06, 0x00, 0x01, 0x00, 0x0F],
                // CTRL/STAT
                vec![0x05, 0x00, 0x01, 0x06],
            ]
        );
    }

    #[test]
    fn select_and_csw_are_cached() {
        let mut dap = dap();
        dap.read_memory_word(0x2000_0000).unwrap();
        dap.transport_mut().clear_frames();
        dap.read_memory_word(0x2000_0004).unwrap();
        // TAR, DRW and CTRL/STAT only
        assert_eq!(dap.transport().frames().len(), 3);
    }

    #[test]
    fn csw_written_through_ap_updates_cache() {
        let mut dap = dap();
        dap.read_memory_word(0x2000_0000).unwrap();
        // Byte-sized, no increment
        dap.write_ap(ApRegister::Csw, 0x2300_0000).unwrap();
        dap.transport_mut().clear_frames();
        dap.read_memory_word(0x2000_0000).unwrap();
        assert_eq!(
            dap.transport().frames()[0],
            vec![0x06, 0x00, 0x01, 0x00, 0x01, 0x12, 0x00, 0x00, 0x23]
        );
    }

    #[test]
    fn cpu_identity_from_sim() {
        let mut dap = dap();
        let cpu = dap.cpu_id().unwrap();
        assert_eq!(cpu.core(), Some(CortexM::M4));
        assert_eq!(cpu.to_string(), "Cortex M4 r0p1");
    }

    #[test]
    fn halt_and_resume() {
        let mut dap = dap();
        dap.halt_core().unwrap();
        assert!(dap.transport().target().halted());
        assert!(dap.core_status().unwrap().halted);
        dap.resume_core().unwrap();
        assert!(!dap.transport().target().halted());
        assert_eq!(dap.transport().target().rejected_dhcsr_writes(), 0);
    }

    #[test]
    fn dhcsr_without_key_is_ignored() {
        let mut dap = dap();
        dap.write_memory_word(crate::cortex_m::DHCSR, 0x0000_0003).unwrap();
        assert!(!dap.transport().target().halted());
        assert_eq!(dap.transport().target().rejected_dhcsr_writes(), 1);
    }

    #[test]
    fn core_registers_through_dcrsr() {
        let mut dap = dap();
        dap.transport_mut().target_mut().set_core_register(15, 0x0800_01C4);
        dap.halt_core().unwrap();
        assert_eq!(dap.read_core_register(CoreRegister::PC).unwrap(), 0x0800_01C4);
        dap.write_core_register(CoreRegister::new(2).unwrap(), 0x1234_5678)
            .unwrap();
        assert_eq!(dap.transport().target().core_register(2), 0x1234_5678);
    }

    #[test]
    fn bus_fault_sets_sticky_error() {
        let mut dap = dap();
        dap.transport_mut().target_mut().add_fault_region(0x6000_0000..0x6000_1000);
        assert!(matches!(
            dap.write_memory_word(0x6000_0000, 1),
            Err(DapError::StickyError(_))
        ));
        // Abort cleared the flag, later accesses go through
        dap.write_memory_word(0x2000_0000, 1).unwrap();
    }

    #[test]
    fn bus_fault_on_read_is_an_error() {
        let mut dap = dap();
        dap.transport_mut().target_mut().add_fault_region(0x6000_0000..0x6000_1000);
        dap.transport_mut().target_mut().poke(0x2000_0000, 0x1234_5678);
        assert!(matches!(
            dap.read_memory_word(0x6000_0000),
            Err(DapError::StickyError(_))
        ));
        assert_eq!(dap.read_memory_word(0x2000_0000).unwrap(), 0x1234_5678);
        assert_eq!(dap.read_memory_word(0x2000_0000).unwrap(), 0x1234_5678);
    }

    #[test]
    fn bus_fault_inside_block_read_is_cleared() {
        let mut dap = dap();
        dap.transport_mut().target_mut().add_fault_region(0x6000_0008..0x6000_000C);
        assert!(matches!(
            dap.read_memory_block(0x6000_0000, 4),
            Err(DapError::Ack(TransferAck::Fault))
        ));
        assert_eq!(dap.transport().ctrl_stat() & dp::STAT_STICKY_MASK, 0);
        dap.read_memory_block(0x2000_0000, 4).unwrap();
    }

    #[test]
    fn block_read_splits_at_wrap_and_packet_size() {
        let mut dap = dap();
        for i in 0..40u32 {
            dap.transport_mut()
                .target_mut()
                .poke(0x2000_03C4 + 4 * i, i);
        }
        dap.transport_mut().clear_accesses();
        let words = dap.read_memory_block(0x2000_03C4, 40).unwrap();
        assert_eq!(words, (0..40).collect::<Vec<_>>());
        let tar_writes: Vec<u32> = dap
            .transport()
            .accesses()
            .iter()
            .filter_map(|access| match access {
                Access::Ap {
                    rnw: false,
                    offset: 0x4,
                    value,
                } => Some(*value),
                _ => None,
            })
            .collect();
        // 15 words up to the 1 KiB boundary, then at most 15 per 64 byte report
        assert_eq!(tar_writes, vec![0x2000_03C4, 0x2000_0400, 0x2000_043C]);
    }

    #[test]
    fn ap_identification_reads_idr_bank() {
        let mut dap = dap();
        dap.transport_mut().clear_frames();
        assert_eq!(dap.ap_identification().unwrap(), SimProbe::AP_IDR);
        let frames = dap.transport().frames();
        assert_eq!(frames[0], vec![0x05, 0x00, 0x01, 0x04, 0x00, 0x00, 0x00, 0x50]);
        assert_eq!(frames[1], vec![0x08, 0x00, 0x1E, 0x00, 0x00, 0x00]);
        assert_eq!(frames[3], vec![0x05, 0x00, 0x01, 0x08, 0xF0, 0x00, 0x00, 0x00]);
        assert_eq!(frames[4], vec![0x06, 0x00, 0x01, 0x00, 0x0F]);
    }
}
