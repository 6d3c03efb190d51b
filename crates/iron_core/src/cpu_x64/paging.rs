/*
    IronPC
    https://github.com/ironpc/ironpc

    Copyright 2023-2026 IronPC Contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    cpu_x64::paging.rs

    Linear-to-physical translation: the legacy two-level walk with 4M PSE
    pages, the long-mode four-level walk with 2M pages and NX, accessed and
    dirty bit maintenance, and page fault error code synthesis. Successful
    walks land in the ITLB or DTLB.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{CpuResult, Fault},
    cpu_x64::{
        tlb::{
            LPF_MASK_2M, LPF_MASK_4K, LPF_MASK_4M, TLB_GLOBAL_PAGE, TLB_SYS_READ_OK, TLB_SYS_WRITE_OK,
            TLB_USER_READ_OK, TLB_USER_WRITE_OK,
        },
        Intel64, CPU_FLAG_AC, CR0_WP, CR4_PGE, CR4_PSE, CR4_SMAP, CR4_SMEP, EFER_NXE,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

// Page fault error code bits
pub const PF_PROTECTION: u16 = 0x01;
pub const PF_WRITE: u16 = 0x02;
pub const PF_USER: u16 = 0x04;
pub const PF_RESERVED: u16 = 0x08;
pub const PF_INSTRUCTION: u16 = 0x10;

// Page table entry bits common to both formats
const PTE_P: u64 = 1 << 0;
const PTE_W: u64 = 1 << 1;
const PTE_U: u64 = 1 << 2;
const PTE_A: u64 = 1 << 5;
const PTE_D: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;
const PTE_G: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;

const ADDR_MASK_64: u64 = 0x000F_FFFF_FFFF_F000;

/// The leaf of a successful table walk, before the rights check.
struct WalkResult {
    ppf: u64,
    lpf_mask: u64,
    /// Combined U/S across all levels
    user_page: bool,
    /// Combined R/W across all levels
    writable: bool,
    nx: bool,
    global: bool,
}

impl Intel64 {
    fn page_fault(&mut self, laddr: u64, write: bool, user: bool, fetch: bool, code: u16) -> Fault {
        let mut error_code = code;
        if write {
            error_code |= PF_WRITE;
        }
        if user {
            error_code |= PF_USER;
        }
        if fetch && (self.efer() & EFER_NXE != 0 || self.cr4() & CR4_SMEP != 0) {
            error_code |= PF_INSTRUCTION;
        }
        self.set_cr2(laddr);
        log::trace!("page fault at {:X}, error code {:X}", laddr, error_code);
        Fault::pf(error_code)
    }

    /// Translate a linear address, filling the ITLB for instruction fetches
    /// and the DTLB for everything else. A hit that lacks the required
    /// permission re-walks so the fault carries a fresh error code and the
    /// dirty bit gets set on a first write to a read-cached page.
    pub(crate) fn translate_linear(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        user: bool,
        access: AccessType,
    ) -> CpuResult<u64> {
        if !self.paging_enabled() {
            return Ok(laddr);
        }

        let fetch = access == AccessType::Execute;
        let write = access == AccessType::Write;

        {
            let tlb = if fetch { &self.itlb } else { &self.dtlb };
            if let Some(entry) = tlb.lookup(laddr) {
                if entry.access_allowed(write, user) {
                    return Ok(entry.translate(laddr));
                }
            }
        }

        let walk = if self.long_mode() {
            self.walk_long(bus, laddr, write, user, fetch)?
        }
        else {
            self.walk_legacy(bus, laddr, write, user, fetch)?
        };

        self.check_page_rights(laddr, &walk, write, user, fetch)?;

        let access_bits = self.page_access_bits(&walk, fetch, write);
        let ppf = walk.ppf | (laddr & walk.lpf_mask & !0xFFF);
        let tlb = if fetch { &mut self.itlb } else { &mut self.dtlb };
        let entry = tlb.fill(laddr, ppf & !0xFFF, access_bits, walk.lpf_mask);
        Ok(entry.translate(laddr))
    }

    /// Instruction fetch translation at the current privilege level.
    #[inline]
    pub(crate) fn translate_execute(&mut self, bus: &mut BusInterface, laddr: u64) -> CpuResult<u64> {
        self.translate_linear(bus, laddr, self.user_mode(), AccessType::Execute)
    }

    fn check_page_rights(
        &mut self,
        laddr: u64,
        walk: &WalkResult,
        write: bool,
        user: bool,
        fetch: bool,
    ) -> CpuResult<()> {
        if user {
            if !walk.user_page {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
            if write && !walk.writable {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
            if fetch && walk.nx {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
        }
        else {
            // Supervisor access
            if write && !walk.writable && self.cr0() & CR0_WP != 0 {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
            if fetch && walk.nx {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
            if fetch && walk.user_page && self.cr4() & CR4_SMEP != 0 {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
            if !fetch && walk.user_page && self.cr4() & CR4_SMAP != 0 && !self.get_flag(CPU_FLAG_AC) {
                return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION));
            }
        }
        Ok(())
    }

    /// Convert walk results into the permission bits cached in the TLB.
    /// ITLB entries encode execute permission in the read slots. SMAP state
    /// is baked in here, which is why an AC flag change flushes the DTLB.
    /// Write permission is cached only once a write has actually walked, so
    /// the first write to a read-cached page still reaches the dirty bit.
    fn page_access_bits(&self, walk: &WalkResult, fetch: bool, write: bool) -> u32 {
        let mut bits: u32;
        if fetch {
            bits = if walk.nx { 0 } else { TLB_SYS_READ_OK };
            if walk.user_page {
                if self.cr4() & CR4_SMEP != 0 {
                    bits &= !TLB_SYS_READ_OK;
                }
                if !walk.nx {
                    bits |= TLB_USER_READ_OK;
                }
            }
        }
        else {
            bits = TLB_SYS_READ_OK;
            if write {
                bits |= TLB_SYS_WRITE_OK;
                if !walk.writable && self.cr0() & CR0_WP != 0 {
                    bits &= !TLB_SYS_WRITE_OK;
                }
            }
            if walk.user_page {
                bits |= TLB_USER_READ_OK;
                if write && walk.writable {
                    bits |= TLB_USER_WRITE_OK;
                }
                if self.cr4() & CR4_SMAP != 0 && !self.get_flag(CPU_FLAG_AC) {
                    bits &= !(TLB_SYS_READ_OK | TLB_SYS_WRITE_OK);
                }
            }
        }
        if walk.global && self.cr4() & CR4_PGE != 0 {
            bits |= TLB_GLOBAL_PAGE;
        }
        bits
    }

    /// SMAP permissions live in cached DTLB entries, so toggling RFLAGS.AC
    /// must drop them.
    pub(crate) fn handle_ac_flag_change(&mut self) {
        if self.cr4() & CR4_SMAP != 0 {
            self.dtlb.flush();
        }
    }

    /* --------------------------- Legacy 32-bit walk ------------------------ */

    fn walk_legacy(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        write: bool,
        user: bool,
        fetch: bool,
    ) -> CpuResult<WalkResult> {
        let pde_addr = (self.cr3() & 0xFFFF_F000) + ((laddr >> 20) & 0xFFC);
        let pde = bus.read_u32(pde_addr as usize).map_err(|_| Fault::gp(0))? as u64;

        if pde & PTE_P == 0 {
            return Err(self.page_fault(laddr, write, user, fetch, 0));
        }

        if pde & PTE_PS != 0 && self.cr4() & CR4_PSE != 0 {
            // 4M page
            let walk = WalkResult {
                ppf: pde & 0xFFC0_0000,
                lpf_mask: LPF_MASK_4M,
                user_page: pde & PTE_U != 0,
                writable: pde & PTE_W != 0,
                nx: false,
                global: pde & PTE_G != 0,
            };
            self.check_page_rights(laddr, &walk, write, user, fetch)?;
            let mut new_pde = pde | PTE_A;
            if write {
                new_pde |= PTE_D;
            }
            if new_pde != pde {
                bus.write_u32(pde_addr as usize, new_pde as u32).map_err(|_| Fault::gp(0))?;
            }
            return Ok(walk);
        }

        let pte_addr = (pde & 0xFFFF_F000) + ((laddr >> 10) & 0xFFC);
        let pte = bus.read_u32(pte_addr as usize).map_err(|_| Fault::gp(0))? as u64;

        if pte & PTE_P == 0 {
            return Err(self.page_fault(laddr, write, user, fetch, 0));
        }

        let walk = WalkResult {
            ppf: pte & 0xFFFF_F000,
            lpf_mask: LPF_MASK_4K,
            user_page: (pde & pte & PTE_U) != 0,
            writable: (pde & pte & PTE_W) != 0,
            nx: false,
            global: pte & PTE_G != 0,
        };
        // A/D updates happen only once the access is known to be permitted
        self.check_page_rights(laddr, &walk, write, user, fetch)?;

        if pde & PTE_A == 0 {
            bus.write_u32(pde_addr as usize, (pde | PTE_A) as u32).map_err(|_| Fault::gp(0))?;
        }
        let mut new_pte = pte | PTE_A;
        if write {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            bus.write_u32(pte_addr as usize, new_pte as u32).map_err(|_| Fault::gp(0))?;
        }
        Ok(walk)
    }

    /* ---------------------------- Long-mode walk --------------------------- */

    fn walk_long(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        write: bool,
        user: bool,
        fetch: bool,
    ) -> CpuResult<WalkResult> {
        let nxe = self.efer() & EFER_NXE != 0;

        let mut table = self.cr3() & ADDR_MASK_64;
        let mut user_page = true;
        let mut writable = true;
        let mut nx = false;
        let mut entries: [(u64, u64); 4] = [(0, 0); 4];

        // PML4 -> PDPT -> PD -> PT, stopping early on a 2M leaf
        let shifts = [39u32, 30, 21, 12];
        let mut leaf_level = 3;
        for (level, shift) in shifts.iter().enumerate() {
            let entry_addr = table + (((laddr >> shift) & 0x1FF) << 3);
            let entry = bus.read_u64(entry_addr as usize).map_err(|_| Fault::gp(0))?;
            entries[level] = (entry_addr, entry);

            if entry & PTE_P == 0 {
                return Err(self.page_fault(laddr, write, user, fetch, 0));
            }
            if entry & PTE_NX != 0 {
                if !nxe {
                    return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION | PF_RESERVED));
                }
                nx = true;
            }
            user_page &= entry & PTE_U != 0;
            writable &= entry & PTE_W != 0;

            match level {
                // PS in a PML4E is reserved; 1G pages are not modeled so a
                // PDPTE leaf is reserved as well
                0 | 1 => {
                    if entry & PTE_PS != 0 {
                        return Err(self.page_fault(laddr, write, user, fetch, PF_PROTECTION | PF_RESERVED));
                    }
                }
                2 => {
                    if entry & PTE_PS != 0 {
                        leaf_level = 2;
                        break;
                    }
                }
                _ => {}
            }
            table = entry & ADDR_MASK_64;
        }

        let (leaf_addr, leaf) = entries[leaf_level];
        let (ppf, lpf_mask) = if leaf_level == 2 {
            (leaf & 0x000F_FFFF_FFE0_0000, LPF_MASK_2M)
        }
        else {
            (leaf & ADDR_MASK_64, LPF_MASK_4K)
        };

        let walk = WalkResult {
            ppf,
            lpf_mask,
            user_page,
            writable,
            nx,
            global: leaf & PTE_G != 0,
        };
        self.check_page_rights(laddr, &walk, write, user, fetch)?;

        // Accessed on every level of the walk, dirty on the leaf
        for (entry_addr, entry) in entries.iter().take(leaf_level + 1) {
            if entry & PTE_A == 0 {
                bus.write_u64(*entry_addr as usize, entry | PTE_A).map_err(|_| Fault::gp(0))?;
            }
        }
        if write && leaf & PTE_D == 0 {
            bus.write_u64(leaf_addr as usize, leaf | PTE_A | PTE_D).map_err(|_| Fault::gp(0))?;
        }
        Ok(walk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_common::FaultKind;
    use crate::cpu_x64::{CR0_PE, CR0_PG};

    const PD: usize = 0x1000;
    const PT: usize = 0x2000;

    // Identity-map the first 4M through a single page table, with page 5
    // marked read-only and page 6 supervisor-only.
    fn setup_legacy() -> (Intel64, BusInterface) {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x80_0000);
        bus.write_u32(PD, (PT as u32) | 0x7).unwrap();
        for page in 0..1024u32 {
            let mut pte = (page << 12) | 0x7; // P|W|U
            if page == 5 {
                pte &= !(PTE_W as u32);
            }
            if page == 6 {
                pte &= !(PTE_U as u32);
            }
            bus.write_u32(PT + page as usize * 4, pte).unwrap();
        }
        cpu.write_cr(0, CR0_PE).unwrap();
        cpu.write_cr(3, PD as u64).unwrap();
        cpu.write_cr(0, CR0_PE | CR0_PG).unwrap();
        (cpu, bus)
    }

    #[test]
    fn legacy_walk_translates_and_sets_accessed() {
        let (mut cpu, mut bus) = setup_legacy();
        let paddr = cpu
            .translate_linear(&mut bus, 0x3ABC, false, AccessType::Read)
            .unwrap();
        assert_eq!(paddr, 0x3ABC);
        // A set on both levels, D clear
        assert_eq!(bus.read_u32(PD).unwrap() & PTE_A as u32, PTE_A as u32);
        let pte = bus.read_u32(PT + 3 * 4).unwrap();
        assert_eq!(pte & PTE_A as u32, PTE_A as u32);
        assert_eq!(pte & PTE_D as u32, 0);
    }

    #[test]
    fn write_sets_dirty_even_after_read_cached() {
        let (mut cpu, mut bus) = setup_legacy();
        cpu.translate_linear(&mut bus, 0x4000, false, AccessType::Read).unwrap();
        assert_eq!(bus.read_u32(PT + 4 * 4).unwrap() & PTE_D as u32, 0);
        // The read-filled DTLB entry lacks no write permission here, but a
        // permitted write through it must still mark the page dirty
        cpu.translate_linear(&mut bus, 0x4000, false, AccessType::Write).unwrap();
        assert_eq!(bus.read_u32(PT + 4 * 4).unwrap() & PTE_D as u32, PTE_D as u32);
    }

    #[test]
    fn not_present_page_faults_with_clear_p_bit() {
        let (mut cpu, mut bus) = setup_legacy();
        bus.write_u32(PT + 8 * 4, 0).unwrap();
        let err = cpu
            .translate_linear(&mut bus, 0x8000, true, AccessType::Read)
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::PageFault);
        assert_eq!(err.error_code, PF_USER);
        assert_eq!(cpu.cr2(), 0x8000);
    }

    #[test]
    fn user_write_to_readonly_page_faults() {
        let (mut cpu, mut bus) = setup_legacy();
        let err = cpu
            .translate_linear(&mut bus, 0x5000, true, AccessType::Write)
            .unwrap_err();
        assert_eq!(err.error_code, PF_PROTECTION | PF_WRITE | PF_USER);
    }

    #[test]
    fn supervisor_ignores_readonly_without_wp() {
        let (mut cpu, mut bus) = setup_legacy();
        assert!(cpu.translate_linear(&mut bus, 0x5000, false, AccessType::Write).is_ok());
        // With WP the same write faults
        cpu.write_cr(0, CR0_PE | CR0_PG | CR0_WP).unwrap();
        let err = cpu
            .translate_linear(&mut bus, 0x5000, false, AccessType::Write)
            .unwrap_err();
        assert_eq!(err.error_code, PF_PROTECTION | PF_WRITE);
    }

    #[test]
    fn user_access_to_supervisor_page_faults() {
        let (mut cpu, mut bus) = setup_legacy();
        let err = cpu
            .translate_linear(&mut bus, 0x6000, true, AccessType::Read)
            .unwrap_err();
        assert_eq!(err.error_code, PF_PROTECTION | PF_USER);
    }

    #[test]
    fn pse_4m_page_translates() {
        let (mut cpu, mut bus) = setup_legacy();
        cpu.write_cr(4, CR4_PSE).unwrap();
        // Second PDE: a 4M page at physical 0x40_0000
        bus.write_u32(PD + 4, 0x40_0000 | (PTE_PS as u32) | 0x7).unwrap();
        let paddr = cpu
            .translate_linear(&mut bus, 0x0047_1234, false, AccessType::Write)
            .unwrap();
        assert_eq!(paddr, 0x0047_1234);
        let pde = bus.read_u32(PD + 4).unwrap();
        assert_eq!(pde & (PTE_A | PTE_D) as u32, (PTE_A | PTE_D) as u32);
    }

    // A long-mode 4-level identity map of the low 2M via a single 4K chain
    fn setup_long() -> (Intel64, BusInterface) {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x80_0000);
        let (pml4, pdpt, pd, pt) = (0x10000usize, 0x11000, 0x12000, 0x13000);
        bus.write_u64(pml4, pdpt as u64 | 0x7).unwrap();
        bus.write_u64(pdpt, pd as u64 | 0x7).unwrap();
        bus.write_u64(pd, pt as u64 | 0x7).unwrap();
        for page in 0..512u64 {
            bus.write_u64(pt + page as usize * 8, (page << 12) | 0x3).unwrap();
        }
        cpu.write_cr(4, crate::cpu_x64::CR4_PAE).unwrap();
        cpu.set_efer(crate::cpu_x64::EFER_LME);
        cpu.write_cr(3, pml4 as u64).unwrap();
        cpu.write_cr(0, CR0_PE | CR0_PG).unwrap();
        assert!(cpu.long_mode());
        (cpu, bus)
    }

    #[test]
    fn long_mode_walk_translates() {
        let (mut cpu, mut bus) = setup_long();
        let paddr = cpu
            .translate_linear(&mut bus, 0x7ABC, false, AccessType::Read)
            .unwrap();
        assert_eq!(paddr, 0x7ABC);
    }

    #[test]
    fn nx_page_blocks_fetch_with_nxe() {
        let (mut cpu, mut bus) = setup_long();
        cpu.set_efer(cpu.efer() | EFER_NXE);
        bus.write_u64(0x13000 + 9 * 8, (9u64 << 12) | 0x3 | PTE_NX).unwrap();
        let err = cpu
            .translate_linear(&mut bus, 0x9000, false, AccessType::Execute)
            .unwrap_err();
        assert_eq!(err.error_code, PF_PROTECTION | PF_INSTRUCTION);
        // Data reads are unaffected
        assert!(cpu.translate_linear(&mut bus, 0x9000, false, AccessType::Read).is_ok());
    }

    #[test]
    fn nx_bit_without_nxe_is_reserved() {
        let (mut cpu, mut bus) = setup_long();
        bus.write_u64(0x13000 + 10 * 8, (10u64 << 12) | 0x3 | PTE_NX).unwrap();
        let err = cpu
            .translate_linear(&mut bus, 0xA000, false, AccessType::Read)
            .unwrap_err();
        assert_eq!(err.error_code & PF_RESERVED, PF_RESERVED);
    }

    #[test]
    fn fetch_fills_itlb_not_dtlb() {
        let (mut cpu, mut bus) = setup_legacy();
        cpu.translate_linear(&mut bus, 0x3000, false, AccessType::Execute).unwrap();
        assert!(cpu.itlb.lookup(0x3000).is_some());
        assert!(cpu.dtlb.lookup(0x3000).is_none());
    }
}
