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

    cpu_x64::segmentation.rs

    The segment register file and the protected-mode selector load paths:
    descriptor table fetches, privilege checks, accessed-bit write-back and
    the data-segment re-validation performed on outer-level returns.

*/

use modular_bitfield::prelude::*;

use crate::{
    bus::BusInterface,
    cpu_common::{CpuResult, Fault, FaultKind, Segment},
    cpu_x64::{
        descriptor::{Descriptor, SegmentDescriptor, SEG_TYPE_ACCESSED},
        Intel64,
    },
};

/// A raw segment selector: requested privilege, table indicator, and the
/// descriptor table index.
#[bitfield]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Selector {
    pub rpl: B2,
    pub ti: bool,
    pub index: B13,
}

impl Selector {
    #[inline]
    pub fn from_u16(raw: u16) -> Selector {
        Selector::from_bytes(raw.to_le_bytes())
    }

    #[inline]
    pub fn to_u16(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }

    /// Null for protection purposes: index 0 in the GDT, any RPL.
    #[inline]
    pub fn is_null(raw: u16) -> bool {
        raw & 0xFFFC == 0
    }
}

// Fast-path access summary bits kept on the descriptor cache.
pub const SEG_ACCESS_ROK: u8 = 0x01;
pub const SEG_ACCESS_WOK: u8 = 0x02;
pub const SEG_ACCESS_ROK4G: u8 = 0x04;
pub const SEG_ACCESS_WOK4G: u8 = 0x08;

#[derive(Copy, Clone, Debug, Default)]
pub struct SegmentCache {
    pub valid: bool,
    pub base: u64,
    pub limit_scaled: u32,
    pub seg_type: u8,
    pub dpl: u8,
    pub present: bool,
    pub d_b: bool,
    pub long: bool,
    pub g: bool,
    pub avl: bool,
    pub access: u8,
}

impl SegmentCache {
    pub fn from_descriptor(desc: &SegmentDescriptor) -> SegmentCache {
        let mut cache = SegmentCache {
            valid: true,
            base: desc.base,
            limit_scaled: desc.limit_scaled,
            seg_type: desc.seg_type,
            dpl: desc.dpl,
            present: desc.present,
            d_b: desc.d_b,
            long: desc.l,
            g: desc.g,
            avl: desc.avl,
            access: 0,
        };
        cache.update_access();
        cache
    }

    pub fn update_access(&mut self) {
        self.access = 0;
        if !self.valid {
            return;
        }
        let flat = self.base == 0 && self.limit_scaled == 0xFFFF_FFFF;
        if self.readable() {
            self.access |= SEG_ACCESS_ROK;
            if flat {
                self.access |= SEG_ACCESS_ROK4G;
            }
        }
        if self.writable() {
            self.access |= SEG_ACCESS_WOK;
            if flat {
                self.access |= SEG_ACCESS_WOK4G;
            }
        }
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.seg_type & 0x8 != 0
    }
    #[inline]
    pub fn readable(&self) -> bool {
        !self.is_code() || self.seg_type & 0x2 != 0
    }
    #[inline]
    pub fn writable(&self) -> bool {
        !self.is_code() && self.seg_type & 0x2 != 0
    }
    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.seg_type & 0x4 != 0
    }
    #[inline]
    pub fn expand_down(&self) -> bool {
        !self.is_code() && self.seg_type & 0x4 != 0
    }

    pub fn invalidate(&mut self) {
        *self = SegmentCache::default();
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: SegmentCache,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalTableRegister {
    pub base: u64,
    pub limit: u16,
}

/// LDTR and TR: selector plus a cached system-segment descriptor.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u64,
    pub limit_scaled: u32,
    pub sys_type: u8,
    pub valid: bool,
}

impl Intel64 {
    /* ----------------------- Descriptor table access ----------------------- */

    /// Linear address of the descriptor a selector names, after the table
    /// limit check. Faults carry the selector as error code, with the kind
    /// chosen by the caller (#GP normally, #TS during task switches, #SS
    /// for stack loads from the TSS).
    pub(crate) fn descriptor_addr(&self, raw_selector: u16, fault: FaultKind) -> CpuResult<u64> {
        let selector = Selector::from_u16(raw_selector);
        let offset = (selector.index() as u64) << 3;
        let err = Fault {
            kind: fault,
            error_code: raw_selector & 0xFFFC,
        };
        if selector.ti() {
            if !self.ldtr.valid {
                return Err(err);
            }
            if offset + 7 > self.ldtr.limit_scaled as u64 {
                return Err(err);
            }
            Ok(self.ldtr.base + offset)
        }
        else {
            if offset + 7 > self.gdtr.limit as u64 {
                return Err(err);
            }
            Ok(self.gdtr.base + offset)
        }
    }

    pub(crate) fn fetch_raw_descriptor(
        &mut self,
        bus: &mut BusInterface,
        raw_selector: u16,
        fault: FaultKind,
    ) -> CpuResult<(u32, u32)> {
        let addr = self.descriptor_addr(raw_selector, fault)?;
        let dword1 = self.system_read_u32(bus, addr)?;
        let dword2 = self.system_read_u32(bus, addr + 4)?;
        Ok((dword1, dword2))
    }

    /// 16-byte descriptor fetch for long-mode system descriptors and gates.
    /// The extension quadword must have a zero type field.
    pub(crate) fn fetch_raw_descriptor64(
        &mut self,
        bus: &mut BusInterface,
        raw_selector: u16,
        fault: FaultKind,
    ) -> CpuResult<(u32, u32, u32)> {
        let selector = Selector::from_u16(raw_selector);
        let offset = (selector.index() as u64) << 3;
        let err = Fault {
            kind: fault,
            error_code: raw_selector & 0xFFFC,
        };
        let base = if selector.ti() {
            if !self.ldtr.valid || offset + 15 > self.ldtr.limit_scaled as u64 {
                return Err(err);
            }
            self.ldtr.base
        }
        else {
            if offset + 15 > self.gdtr.limit as u64 {
                return Err(err);
            }
            self.gdtr.base
        };
        let dword1 = self.system_read_u32(bus, base + offset)?;
        let dword2 = self.system_read_u32(bus, base + offset + 4)?;
        let dword3 = self.system_read_u32(bus, base + offset + 8)?;
        let dword4 = self.system_read_u32(bus, base + offset + 12)?;
        if dword4 & 0x0000_1F00 != 0 {
            return Err(err);
        }
        Ok((dword1, dword2, dword3))
    }

    /// Set the accessed bit of a descriptor in guest memory. Skipped when
    /// the cached copy already has it.
    pub(crate) fn touch_segment(
        &mut self,
        bus: &mut BusInterface,
        raw_selector: u16,
        seg_type: u8,
    ) -> CpuResult<()> {
        if seg_type & SEG_TYPE_ACCESSED != 0 {
            return Ok(());
        }
        let addr = self.descriptor_addr(raw_selector, FaultKind::GeneralProtection)?;
        let ar = self.system_read_u8(bus, addr + 5)?;
        self.system_write_u8(bus, addr + 5, ar | SEG_TYPE_ACCESSED)?;
        Ok(())
    }

    /* --------------------------- Selector loads ---------------------------- */

    /// Real-mode and v8086 selector loads bypass the descriptor tables
    /// entirely: base tracks selector << 4 and the cached attributes stay
    /// (big real mode), except under v8086 where fixed 64K writable-data
    /// attributes apply.
    pub fn set_real_mode_segment(&mut self, seg: Segment, raw_selector: u16) {
        let reg = &mut self.sregs[seg as usize];
        reg.selector = raw_selector;
        reg.cache.base = (raw_selector as u64) << 4;
        reg.cache.valid = true;
        reg.cache.present = true;
        if !reg.cache.is_code() && reg.cache.seg_type == 0 {
            // Never loaded; give it fresh writable-data attributes
            reg.cache.seg_type = 0x3;
            reg.cache.limit_scaled = 0xFFFF;
        }
        reg.cache.update_access();
    }

    pub(crate) fn set_v8086_segment(&mut self, seg: Segment, raw_selector: u16) {
        let reg = &mut self.sregs[seg as usize];
        reg.selector = raw_selector;
        reg.cache = SegmentCache {
            valid: true,
            base: (raw_selector as u64) << 4,
            limit_scaled: 0xFFFF,
            seg_type: 0x3, // writable data, accessed
            dpl: 3,
            present: true,
            d_b: false,
            long: false,
            g: false,
            avl: false,
            access: 0,
        };
        reg.cache.update_access();
    }

    fn load_null_selector(&mut self, seg: Segment, raw_selector: u16) {
        let reg = &mut self.sregs[seg as usize];
        reg.selector = raw_selector;
        reg.cache.invalidate();
    }

    /// Load SS or a data segment register with full protection checks.
    /// CS has its own path through check_cs/load_cs.
    pub fn load_seg_reg(&mut self, bus: &mut BusInterface, seg: Segment, raw_selector: u16) -> CpuResult<()> {
        debug_assert!(seg != Segment::CS);

        if self.real_mode() {
            self.set_real_mode_segment(seg, raw_selector);
            return Ok(());
        }
        if self.v8086_mode() {
            self.set_v8086_segment(seg, raw_selector);
            return Ok(());
        }

        let selector = Selector::from_u16(raw_selector);

        if seg == Segment::SS {
            if Selector::is_null(raw_selector) {
                // A null SS is tolerated only in 64-bit mode below CPL 3,
                // with RPL matching CPL
                if self.long64_mode() && self.cpl != 3 && selector.rpl() == self.cpl {
                    self.load_null_selector(seg, raw_selector);
                    return Ok(());
                }
                return Err(Fault::gp(raw_selector));
            }

            if selector.rpl() != self.cpl {
                log::debug!("load_seg_reg(SS): rpl != CPL");
                return Err(Fault::gp(raw_selector));
            }

            let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::GeneralProtection)?;
            let descriptor = match Descriptor::parse(dword1, dword2) {
                Descriptor::Segment(d) => d,
                _ => {
                    log::debug!("load_seg_reg(SS): not a code/data segment");
                    return Err(Fault::gp(raw_selector));
                }
            };

            if !descriptor.writable() {
                log::debug!("load_seg_reg(SS): not a writable data segment");
                return Err(Fault::gp(raw_selector));
            }

            if descriptor.dpl != self.cpl {
                log::debug!("load_seg_reg(SS): dpl != CPL");
                return Err(Fault::gp(raw_selector));
            }

            // Stack-segment presence faults are #SS, not #NP
            if !descriptor.present {
                log::debug!("load_seg_reg(SS): segment not present");
                return Err(Fault::ss(raw_selector));
            }

            self.touch_segment(bus, raw_selector, descriptor.seg_type)?;
            let mut descriptor = descriptor;
            descriptor.seg_type |= SEG_TYPE_ACCESSED;

            let reg = &mut self.sregs[seg as usize];
            reg.selector = raw_selector;
            reg.cache = SegmentCache::from_descriptor(&descriptor);
            return Ok(());
        }

        // ES/DS/FS/GS
        if Selector::is_null(raw_selector) {
            self.load_null_selector(seg, raw_selector);
            return Ok(());
        }

        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::GeneralProtection)?;
        let descriptor = match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(d) => d,
            _ => {
                log::debug!("load_seg_reg({}): not a code/data segment", seg);
                return Err(Fault::gp(raw_selector));
            }
        };

        if !descriptor.readable() {
            log::debug!("load_seg_reg({}): execute-only code segment", seg);
            return Err(Fault::gp(raw_selector));
        }

        // Privilege applies to data segments and non-conforming code
        if descriptor.is_data() || !descriptor.conforming() {
            if selector.rpl() > descriptor.dpl || self.cpl > descriptor.dpl {
                log::debug!("load_seg_reg({}): privilege check failed", seg);
                return Err(Fault::gp(raw_selector));
            }
        }

        if !descriptor.present {
            log::debug!("load_seg_reg({}): segment not present", seg);
            return Err(Fault::np(raw_selector));
        }

        self.touch_segment(bus, raw_selector, descriptor.seg_type)?;
        let mut descriptor = descriptor;
        descriptor.seg_type |= SEG_TYPE_ACCESSED;

        let reg = &mut self.sregs[seg as usize];
        reg.selector = raw_selector;
        reg.cache = SegmentCache::from_descriptor(&descriptor);
        Ok(())
    }

    /// Install a validated code segment. The selector's RPL field is forced
    /// to the new CPL.
    pub(crate) fn load_cs(&mut self, raw_selector: u16, descriptor: &SegmentDescriptor, cpl: u8) {
        let mut descriptor = *descriptor;
        descriptor.seg_type |= SEG_TYPE_ACCESSED;
        let reg = &mut self.sregs[Segment::CS as usize];
        reg.selector = (raw_selector & 0xFFFC) | cpl as u16;
        reg.cache = SegmentCache::from_descriptor(&descriptor);
        self.cpl = cpl;
    }

    /// Install a validated stack segment at a given privilege level.
    pub(crate) fn load_ss(&mut self, raw_selector: u16, descriptor: &SegmentDescriptor, cpl: u8) {
        let mut descriptor = *descriptor;
        descriptor.seg_type |= SEG_TYPE_ACCESSED;
        let reg = &mut self.sregs[Segment::SS as usize];
        reg.selector = (raw_selector & 0xFFFC) | cpl as u16;
        reg.cache = SegmentCache::from_descriptor(&descriptor);
    }

    /// Null SS used when 64-bit mode transitions to an inner privilege
    /// level; the null selector carries the new CPL as its RPL.
    pub(crate) fn load_null_ss(&mut self, cpl: u8) {
        let reg = &mut self.sregs[Segment::SS as usize];
        reg.selector = cpl as u16;
        reg.cache.invalidate();
    }

    /// On a transition to an outer privilege level, each data segment
    /// register holding a descriptor the new level may not use is nulled.
    pub(crate) fn validate_seg_regs(&mut self) {
        for seg in Segment::DATA {
            let reg = &self.sregs[seg as usize];
            if !reg.cache.valid {
                continue;
            }
            if reg.cache.dpl < self.cpl && (!reg.cache.is_code() || !reg.cache.conforming()) {
                log::debug!("validate_seg_regs: invalidating {}", seg);
                let selector = reg.selector;
                self.load_null_selector(seg, selector & 0x0003);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cpu_x64::descriptor::encode_segment;

    pub(crate) const GDT_BASE: u64 = 0x0001_0000;

    // GDT layout used across the protection tests
    pub(crate) const SEL_CODE0: u16 = 0x08;
    pub(crate) const SEL_DATA0: u16 = 0x10;
    pub(crate) const SEL_STACK0: u16 = 0x18;
    pub(crate) const SEL_CODE3: u16 = 0x23;
    pub(crate) const SEL_DATA3: u16 = 0x2B;
    pub(crate) const SEL_NP: u16 = 0x30;
    pub(crate) const SEL_EXEC_ONLY: u16 = 0x38;

    pub(crate) fn write_descriptor(bus: &mut BusInterface, index: u16, dwords: (u32, u32)) {
        let addr = (GDT_BASE + (index as u64) * 8) as usize;
        bus.write_u32(addr, dwords.0).unwrap();
        bus.write_u32(addr + 4, dwords.1).unwrap();
    }

    pub(crate) fn setup_protected() -> (Intel64, BusInterface) {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x20_0000);

        // Flat 4G descriptors; type byte = P|DPL|S|type
        write_descriptor(&mut bus, 1, encode_segment(0, 0xF_FFFF, 0x9A, 0xC)); // code dpl0
        write_descriptor(&mut bus, 2, encode_segment(0, 0xF_FFFF, 0x92, 0xC)); // data dpl0
        write_descriptor(&mut bus, 3, encode_segment(0, 0xF_FFFF, 0x92, 0xC)); // stack dpl0
        write_descriptor(&mut bus, 4, encode_segment(0, 0xF_FFFF, 0xFA, 0xC)); // code dpl3
        write_descriptor(&mut bus, 5, encode_segment(0, 0xF_FFFF, 0xF2, 0xC)); // data dpl3
        write_descriptor(&mut bus, 6, encode_segment(0, 0xF_FFFF, 0x12, 0xC)); // data dpl0, not present
        write_descriptor(&mut bus, 7, encode_segment(0, 0xF_FFFF, 0x98, 0xC)); // execute-only code

        cpu.gdtr = GlobalTableRegister { base: GDT_BASE, limit: 0x3F };
        cpu.write_cr(0, crate::cpu_x64::CR0_PE).unwrap();

        // Start in flat ring-0 protected mode
        let (d1, d2) = encode_segment(0, 0xF_FFFF, 0x9A, 0xC);
        if let Descriptor::Segment(desc) = Descriptor::parse(d1, d2) {
            cpu.load_cs(SEL_CODE0, &desc, 0);
        }
        cpu.load_seg_reg(&mut bus, Segment::SS, SEL_STACK0).unwrap();
        (cpu, bus)
    }

    #[test]
    fn data_segment_load_sets_cache_and_accessed_bit() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.load_seg_reg(&mut bus, Segment::DS, SEL_DATA0).unwrap();
        let cache = cpu.seg(Segment::DS).cache;
        assert!(cache.valid);
        assert_eq!(cache.base, 0);
        assert_eq!(cache.limit_scaled, 0xFFFF_FFFF);
        assert!(cache.access & SEG_ACCESS_WOK4G != 0);

        // Accessed bit written back to the GDT copy
        let ar = bus.read_u8((GDT_BASE + 2 * 8 + 5) as usize).unwrap();
        assert_eq!(ar & 0x01, 0x01);
    }

    #[test]
    fn null_data_selector_loads_but_invalidates() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.load_seg_reg(&mut bus, Segment::DS, 0x0003).unwrap();
        assert!(!cpu.seg(Segment::DS).cache.valid);
        assert_eq!(cpu.seg(Segment::DS).selector, 0x0003);
    }

    #[test]
    fn rpl_violation_faults_gp_with_selector() {
        let (mut cpu, mut bus) = setup_protected();
        // RPL 3 selector naming a DPL 0 data segment
        let err = cpu.load_seg_reg(&mut bus, Segment::DS, SEL_DATA0 | 3).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_DATA0));
    }

    #[test]
    fn not_present_data_segment_faults_np() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::ES, SEL_NP).unwrap_err();
        assert_eq!(err.kind, FaultKind::SegmentNotPresent);
        assert_eq!(err.error_code, SEL_NP & 0xFFFC);
    }

    #[test]
    fn execute_only_code_not_loadable_as_data() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::DS, SEL_EXEC_ONLY).unwrap_err();
        assert_eq!(err.kind, FaultKind::GeneralProtection);
    }

    #[test]
    fn selector_beyond_table_limit_faults_with_selector() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::DS, 0x48).unwrap_err();
        assert_eq!(err, Fault::gp(0x48));
    }

    #[test]
    fn ss_null_selector_faults() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::SS, 0x0000).unwrap_err();
        assert_eq!(err.kind, FaultKind::GeneralProtection);
    }

    #[test]
    fn ss_rpl_must_match_cpl() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::SS, SEL_STACK0 | 3).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_STACK0 | 3));
    }

    #[test]
    fn ss_must_be_writable() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::SS, SEL_CODE0).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_CODE0));
    }

    #[test]
    fn ss_not_present_faults_stack_fault() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.load_seg_reg(&mut bus, Segment::SS, SEL_NP).unwrap_err();
        assert_eq!(err.kind, FaultKind::StackFault);
        assert_eq!(err.error_code, SEL_NP & 0xFFFC);
    }

    #[test]
    fn validate_seg_regs_nulls_inner_descriptors() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.load_seg_reg(&mut bus, Segment::DS, SEL_DATA0).unwrap();
        cpu.load_seg_reg(&mut bus, Segment::ES, SEL_DATA3).unwrap();

        // Drop to CPL 3 and re-validate
        cpu.set_cpl(3);
        cpu.validate_seg_regs();
        assert!(!cpu.seg(Segment::DS).cache.valid);
        assert!(cpu.seg(Segment::ES).cache.valid);
    }

    #[test]
    fn real_mode_load_tracks_selector_base() {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x10_0000);
        cpu.load_seg_reg(&mut bus, Segment::DS, 0x1234).unwrap();
        assert_eq!(cpu.seg(Segment::DS).cache.base, 0x12340);
        assert_eq!(cpu.seg(Segment::DS).cache.limit_scaled, 0xFFFF);
    }
}
