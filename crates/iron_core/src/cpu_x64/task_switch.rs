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

    cpu_x64::task_switch.rs

    Hardware task switching through 286 and 386 TSS segments: outgoing
    context save, busy-bit and back-link bookkeeping, and the re-validation
    of every segment register in the incoming task. Also the TSS lookups
    the stack-switch paths use (SS:eSP per privilege level, RSPn in long
    mode).

*/

use crate::{
    bus::BusInterface,
    cpu_common::{CpuResult, Fault, FaultKind, Segment},
    cpu_x64::{
        descriptor::{Descriptor, SegmentDescriptor, SEG_TYPE_ACCESSED, SYS_SEGMENT_LDT},
        segmentation::{SegmentCache, Selector, SystemSegment},
        Intel64,
        CPU_FLAG_NT,
        CPU_FLAG_RESERVED1,
        CPU_FLAG_VM,
        RAX,
        RBP,
        RBX,
        RCX,
        RDI,
        RDX,
        RSI,
        RSP,
    },
};

/// How a task switch was initiated; the three sources differ in busy-bit
/// handling, NT, and the back link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TaskSwitchReason {
    Jump,
    CallOrInterrupt,
    Iret,
}

// 386 TSS field offsets
const TSS386_LINK: u64 = 0x00;
const TSS386_ESP0: u64 = 0x04;
const TSS386_CR3: u64 = 0x1C;
const TSS386_EIP: u64 = 0x20;
const TSS386_EFLAGS: u64 = 0x24;
const TSS386_GPR: u64 = 0x28;
const TSS386_SEG: u64 = 0x48;
const TSS386_LDT: u64 = 0x60;
const TSS386_MIN_LIMIT: u32 = 0x67;

// 286 TSS field offsets
const TSS286_SP0: u64 = 0x02;
const TSS286_IP: u64 = 0x0E;
const TSS286_FLAGS: u64 = 0x10;
const TSS286_GPR: u64 = 0x12;
const TSS286_SEG: u64 = 0x22;
const TSS286_LDT: u64 = 0x2A;
const TSS286_MIN_LIMIT: u32 = 0x2B;

// 64-bit TSS: RSP0..RSP2 at 0x04, 8 bytes apiece
const TSS64_RSP0: u64 = 0x04;

// GPR order inside both TSS formats
const TSS_GPR_ORDER: [u8; 8] = [RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI];

impl Intel64 {
    /// Inner-stack pointer for a privilege level, read from the current
    /// TSS. Used by call gates and interrupt delivery.
    pub(crate) fn get_ss_esp_from_tss(&mut self, bus: &mut BusInterface, cpl: u8) -> CpuResult<(u16, u32)> {
        if !self.tr.valid {
            return Err(Fault::ts(0));
        }
        if self.tr.sys_type & 0x8 != 0 {
            // 386 TSS
            let offset = TSS386_ESP0 + cpl as u64 * 8;
            if offset + 7 > self.tr.limit_scaled as u64 {
                return Err(Fault::ts(self.tr.selector));
            }
            let esp = self.system_read_u32(bus, self.tr.base + offset)?;
            let ss = self.system_read_u16(bus, self.tr.base + offset + 4)?;
            Ok((ss, esp))
        }
        else {
            let offset = TSS286_SP0 + cpl as u64 * 4;
            if offset + 3 > self.tr.limit_scaled as u64 {
                return Err(Fault::ts(self.tr.selector));
            }
            let sp = self.system_read_u16(bus, self.tr.base + offset)?;
            let ss = self.system_read_u16(bus, self.tr.base + offset + 2)?;
            Ok((ss, sp as u32))
        }
    }

    /// Long-mode inner stack pointer (RSPn); the 64-bit TSS carries no
    /// segment selectors.
    pub(crate) fn get_rsp_from_tss(&mut self, bus: &mut BusInterface, cpl: u8) -> CpuResult<u64> {
        if !self.tr.valid {
            return Err(Fault::ts(0));
        }
        let offset = TSS64_RSP0 + cpl as u64 * 8;
        if offset + 7 > self.tr.limit_scaled as u64 {
            return Err(Fault::ts(self.tr.selector));
        }
        self.system_read_u64(bus, self.tr.base + offset)
    }

    /// Flip the busy bit of a TSS descriptor in the GDT.
    pub(crate) fn set_tss_busy(&mut self, bus: &mut BusInterface, raw_selector: u16, busy: bool) -> CpuResult<()> {
        let addr = self.descriptor_addr(raw_selector, FaultKind::InvalidTss)?;
        let ar = self.system_read_u8(bus, addr + 5)?;
        let ar = if busy { ar | 0x02 } else { ar & !0x02 };
        self.system_write_u8(bus, addr + 5, ar)
    }

    /// Switch to the task named by `raw_selector`. The outgoing context is
    /// saved into the current TSS, the incoming one loaded with every
    /// segment register re-validated under #TS semantics.
    pub(crate) fn task_switch(
        &mut self,
        bus: &mut BusInterface,
        raw_selector: u16,
        reason: TaskSwitchReason,
    ) -> CpuResult<()> {
        // Task state segments live in the GDT only
        let fault_kind = if reason == TaskSwitchReason::Iret {
            FaultKind::InvalidTss
        }
        else {
            FaultKind::GeneralProtection
        };
        let err = Fault { kind: fault_kind, error_code: raw_selector & 0xFFFC };

        if Selector::is_null(raw_selector) || Selector::from_u16(raw_selector).ti() {
            return Err(err);
        }

        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, fault_kind)?;
        let tss = match Descriptor::parse(dword1, dword2) {
            Descriptor::System(sys) if sys.is_tss() => sys,
            _ => return Err(err),
        };

        // Entering a task requires a non-busy TSS; returning requires the
        // busy one we left behind
        if reason == TaskSwitchReason::Iret {
            if !tss.is_busy_tss() {
                return Err(Fault::ts(raw_selector));
            }
        }
        else if tss.is_busy_tss() {
            return Err(Fault::gp(raw_selector));
        }

        if !tss.present {
            return Err(Fault::np(raw_selector));
        }
        let is_386 = tss.is_386_tss();
        let min_limit = if is_386 { TSS386_MIN_LIMIT } else { TSS286_MIN_LIMIT };
        if tss.limit_scaled < min_limit {
            return Err(Fault::ts(raw_selector));
        }

        log::trace!(
            "task switch: {:04X} -> {:04X} ({:?})",
            self.tr.selector,
            raw_selector,
            reason
        );

        // Save the outgoing context. An IRET leaves the task with NT clear
        // so a later re-entry does not immediately unwind again.
        let mut save_flags = self.rflags();
        if reason == TaskSwitchReason::Iret {
            save_flags &= !CPU_FLAG_NT;
        }
        let old_base = self.tr.base;
        let old_is_386 = self.tr.sys_type & 0x8 != 0;
        if old_is_386 {
            self.system_write_u32(bus, old_base + TSS386_EIP, self.rip() as u32)?;
            self.system_write_u32(bus, old_base + TSS386_EFLAGS, save_flags as u32)?;
            for (slot, reg) in TSS_GPR_ORDER.iter().enumerate() {
                self.system_write_u32(bus, old_base + TSS386_GPR + slot as u64 * 4, self.gpr32(*reg))?;
            }
            for (slot, seg) in Segment::ALL.iter().enumerate() {
                let sel = self.seg(*seg).selector;
                self.system_write_u32(bus, old_base + TSS386_SEG + slot as u64 * 4, sel as u32)?;
            }
        }
        else {
            self.system_write_u16(bus, old_base + TSS286_IP, self.rip() as u16)?;
            self.system_write_u16(bus, old_base + TSS286_FLAGS, save_flags as u16)?;
            for (slot, reg) in TSS_GPR_ORDER.iter().enumerate() {
                self.system_write_u16(bus, old_base + TSS286_GPR + slot as u64 * 2, self.gpr16(*reg))?;
            }
            // The 286 format stores ES, CS, SS, DS only
            for (slot, seg) in [Segment::ES, Segment::CS, Segment::SS, Segment::DS].iter().enumerate() {
                let sel = self.seg(*seg).selector;
                self.system_write_u16(bus, old_base + TSS286_SEG + slot as u64 * 2, sel)?;
            }
        }

        // Busy-bit bookkeeping: a nested task (call/interrupt) leaves the
        // outgoing TSS busy so the chain can unwind
        if reason != TaskSwitchReason::CallOrInterrupt && self.tr.valid {
            self.set_tss_busy(bus, self.tr.selector, false)?;
        }
        if reason != TaskSwitchReason::Iret {
            self.set_tss_busy(bus, raw_selector, true)?;
        }

        // Read the incoming context before touching any register
        let new_base = tss.base;
        let old_tr_selector = self.tr.selector;
        let (new_cr3, new_rip, new_flags, new_gpr, new_segs, new_ldt);
        if is_386 {
            new_cr3 = self.system_read_u32(bus, new_base + TSS386_CR3)? as u64;
            new_rip = self.system_read_u32(bus, new_base + TSS386_EIP)? as u64;
            new_flags = self.system_read_u32(bus, new_base + TSS386_EFLAGS)? as u64;
            let mut gpr = [0u32; 8];
            for (slot, value) in gpr.iter_mut().enumerate() {
                *value = self.system_read_u32(bus, new_base + TSS386_GPR + slot as u64 * 4)?;
            }
            new_gpr = gpr;
            let mut segs = [0u16; 6];
            for (slot, value) in segs.iter_mut().enumerate() {
                *value = self.system_read_u32(bus, new_base + TSS386_SEG + slot as u64 * 4)? as u16;
            }
            new_segs = segs;
            new_ldt = self.system_read_u32(bus, new_base + TSS386_LDT)? as u16;
        }
        else {
            new_cr3 = self.cr3();
            new_rip = self.system_read_u16(bus, new_base + TSS286_IP)? as u64;
            new_flags = self.system_read_u16(bus, new_base + TSS286_FLAGS)? as u64;
            let mut gpr = [0u32; 8];
            for (slot, value) in gpr.iter_mut().enumerate() {
                *value = self.system_read_u16(bus, new_base + TSS286_GPR + slot as u64 * 2)? as u32;
            }
            new_gpr = gpr;
            let mut segs = [0u16; 6];
            for (slot, value) in segs.iter_mut().take(4).enumerate() {
                *value = self.system_read_u16(bus, new_base + TSS286_SEG + slot as u64 * 2)?;
            }
            new_segs = segs;
            new_ldt = self.system_read_u16(bus, new_base + TSS286_LDT)?;
        }

        // Commit point: TR names the new task from here on
        self.tr = SystemSegment {
            selector: raw_selector,
            base: new_base,
            limit_scaled: tss.limit_scaled,
            sys_type: tss.sys_type | 0x2,
            valid: true,
        };

        if is_386 && self.paging_enabled() {
            self.write_cr(3, new_cr3)?;
        }

        let mut new_flags = (new_flags & !CPU_FLAG_RESERVED1) | CPU_FLAG_RESERVED1;
        if reason == TaskSwitchReason::CallOrInterrupt {
            new_flags |= CPU_FLAG_NT;
            self.system_write_u16(bus, new_base + TSS386_LINK, old_tr_selector)?;
        }
        self.set_rflags(new_flags);

        for (slot, reg) in TSS_GPR_ORDER.iter().enumerate() {
            self.set_gpr32(*reg, new_gpr[slot]);
        }
        self.set_rip(new_rip);

        // LDTR before the segment registers, which may live in it
        self.load_task_ldtr(bus, new_ldt)?;

        let [new_es, new_cs, new_ss, new_ds, new_fs, new_gs] = new_segs;
        if new_flags & CPU_FLAG_VM != 0 {
            self.set_cpl(3);
            self.set_v8086_segment(Segment::CS, new_cs);
            self.set_v8086_segment(Segment::SS, new_ss);
            self.set_v8086_segment(Segment::ES, new_es);
            self.set_v8086_segment(Segment::DS, new_ds);
            self.set_v8086_segment(Segment::FS, new_fs);
            self.set_v8086_segment(Segment::GS, new_gs);
            return Ok(());
        }

        // CS fixes the new CPL; everything else validates against it
        let new_cpl = Selector::from_u16(new_cs).rpl();
        self.set_cpl(new_cpl);
        self.task_load_cs(bus, new_cs)?;
        self.task_load_ss(bus, new_ss)?;
        for (seg, raw) in [
            (Segment::ES, new_es),
            (Segment::DS, new_ds),
            (Segment::FS, new_fs),
            (Segment::GS, new_gs),
        ] {
            self.task_load_data_seg(bus, seg, raw)?;
        }

        if self.rip() > self.seg(Segment::CS).cache.limit_scaled as u64 {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    fn load_task_ldtr(&mut self, bus: &mut BusInterface, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) {
            self.ldtr = SystemSegment { selector: raw_selector, ..SystemSegment::default() };
            return Ok(());
        }
        if Selector::from_u16(raw_selector).ti() {
            return Err(Fault::ts(raw_selector));
        }
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::InvalidTss)?;
        let ldt = match Descriptor::parse(dword1, dword2) {
            Descriptor::System(sys) if sys.sys_type == SYS_SEGMENT_LDT => sys,
            _ => return Err(Fault::ts(raw_selector)),
        };
        if !ldt.present {
            return Err(Fault::ts(raw_selector));
        }
        self.ldtr = SystemSegment {
            selector: raw_selector,
            base: ldt.base,
            limit_scaled: ldt.limit_scaled,
            sys_type: ldt.sys_type,
            valid: true,
        };
        Ok(())
    }

    /// Fetch and validate a code or data descriptor during a task switch;
    /// malformed descriptors raise #TS rather than #GP.
    fn task_fetch_segment(
        &mut self,
        bus: &mut BusInterface,
        raw_selector: u16,
    ) -> CpuResult<SegmentDescriptor> {
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::InvalidTss)?;
        match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(d) => Ok(d),
            _ => Err(Fault::ts(raw_selector)),
        }
    }

    fn task_load_cs(&mut self, bus: &mut BusInterface, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) {
            return Err(Fault::ts(0));
        }
        let descriptor = self.task_fetch_segment(bus, raw_selector)?;
        if !descriptor.is_code() {
            return Err(Fault::ts(raw_selector));
        }
        let rpl = Selector::from_u16(raw_selector).rpl();
        if descriptor.conforming() {
            if descriptor.dpl > rpl {
                return Err(Fault::ts(raw_selector));
            }
        }
        else if descriptor.dpl != rpl {
            return Err(Fault::ts(raw_selector));
        }
        if !descriptor.present {
            return Err(Fault::np(raw_selector));
        }
        self.touch_segment(bus, raw_selector, descriptor.seg_type)?;
        self.load_cs(raw_selector, &descriptor, rpl);
        Ok(())
    }

    fn task_load_ss(&mut self, bus: &mut BusInterface, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) {
            return Err(Fault::ts(0));
        }
        let descriptor = self.task_fetch_segment(bus, raw_selector)?;
        let rpl = Selector::from_u16(raw_selector).rpl();
        if descriptor.is_code() || !descriptor.writable() {
            return Err(Fault::ts(raw_selector));
        }
        if rpl != self.cpl() || descriptor.dpl != self.cpl() {
            return Err(Fault::ts(raw_selector));
        }
        if !descriptor.present {
            return Err(Fault::ss(raw_selector));
        }
        self.touch_segment(bus, raw_selector, descriptor.seg_type)?;
        self.load_ss(raw_selector, &descriptor, self.cpl());
        Ok(())
    }

    fn task_load_data_seg(&mut self, bus: &mut BusInterface, seg: Segment, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) {
            let reg = self.seg_mut(seg);
            reg.selector = raw_selector;
            reg.cache.invalidate();
            return Ok(());
        }
        let descriptor = self.task_fetch_segment(bus, raw_selector)?;
        if !descriptor.readable() {
            return Err(Fault::ts(raw_selector));
        }
        let rpl = Selector::from_u16(raw_selector).rpl();
        if descriptor.is_data() || !descriptor.conforming() {
            if rpl > descriptor.dpl || self.cpl() > descriptor.dpl {
                return Err(Fault::ts(raw_selector));
            }
        }
        if !descriptor.present {
            return Err(Fault::np(raw_selector));
        }
        self.touch_segment(bus, raw_selector, descriptor.seg_type)?;
        let mut descriptor = descriptor;
        descriptor.seg_type |= SEG_TYPE_ACCESSED;
        let reg = self.seg_mut(seg);
        reg.selector = raw_selector;
        reg.cache = SegmentCache::from_descriptor(&descriptor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_common::OperandWidth;
    use crate::cpu_x64::{
        descriptor::{encode_segment, SYS_SEGMENT_BUSY_386_TSS},
        segmentation::tests::{setup_protected, write_descriptor, SEL_CODE0, SEL_DATA0, SEL_STACK0},
    };

    const SEL_TSS_OLD: u16 = 0x40;
    const SEL_TSS_NEW: u16 = 0x48;
    const OLD_TSS_BASE: u64 = 0x8000;
    const NEW_TSS_BASE: u64 = 0x8800;

    fn write_tss_dword(bus: &mut BusInterface, base: u64, offset: u64, value: u32) {
        bus.write_u32((base + offset) as usize, value).unwrap();
    }

    /// Protected-mode machine with two 386 TSSs: the busy one we run in
    /// and an available target populated with a full register image.
    fn setup_tasks() -> (Intel64, BusInterface) {
        let (mut cpu, mut bus) = setup_protected();
        cpu.gdtr.limit = 0xFF;
        // type 0x8B = present busy 386 TSS, 0x89 = available
        write_descriptor(&mut bus, SEL_TSS_OLD >> 3, encode_segment(OLD_TSS_BASE as u32, 0x67, 0x8B, 0));
        write_descriptor(&mut bus, SEL_TSS_NEW >> 3, encode_segment(NEW_TSS_BASE as u32, 0x67, 0x89, 0));
        cpu.tr = SystemSegment {
            selector: SEL_TSS_OLD,
            base: OLD_TSS_BASE,
            limit_scaled: 0x67,
            sys_type: SYS_SEGMENT_BUSY_386_TSS,
            valid: true,
        };

        write_tss_dword(&mut bus, NEW_TSS_BASE, TSS386_EIP, 0x7777);
        write_tss_dword(&mut bus, NEW_TSS_BASE, TSS386_EFLAGS, 0x0002);
        write_tss_dword(&mut bus, NEW_TSS_BASE, TSS386_GPR, 0xAABB_CCDD); // EAX
        write_tss_dword(&mut bus, NEW_TSS_BASE, TSS386_GPR + 16, 0x0001_F000); // ESP
        let selectors = [SEL_DATA0, SEL_CODE0, SEL_STACK0, SEL_DATA0, 0, 0];
        for (slot, sel) in selectors.iter().enumerate() {
            write_tss_dword(&mut bus, NEW_TSS_BASE, TSS386_SEG + slot as u64 * 4, *sel as u32);
        }
        (cpu, bus)
    }

    fn gdt_type_byte(bus: &mut BusInterface, selector: u16) -> u8 {
        let addr = crate::cpu_x64::segmentation::tests::GDT_BASE + (selector >> 3) as u64 * 8 + 5;
        bus.read_u8(addr as usize).unwrap()
    }

    #[test]
    fn jump_switches_task_and_busy_bits() {
        let (mut cpu, mut bus) = setup_tasks();
        cpu.set_rip(0x1234);
        cpu.set_gpr32(RAX, 0x5555_5555);

        cpu.far_jump(&mut bus, SEL_TSS_NEW, 0, OperandWidth::Dword).unwrap();

        assert_eq!(cpu.tr.selector, SEL_TSS_NEW);
        assert_eq!(cpu.rip(), 0x7777);
        assert_eq!(cpu.gpr32(RAX), 0xAABB_CCDD);
        assert_eq!(cpu.gpr32(RSP), 0x0001_F000);
        assert_eq!(cpu.seg(Segment::CS).selector, SEL_CODE0);
        assert_eq!(cpu.seg(Segment::SS).selector, SEL_STACK0);
        assert_eq!(cpu.cpl(), 0);
        assert!(!cpu.get_flag(CPU_FLAG_NT));

        // Busy moved from the old TSS to the new one
        assert_eq!(gdt_type_byte(&mut bus, SEL_TSS_OLD) & 0x02, 0);
        assert_eq!(gdt_type_byte(&mut bus, SEL_TSS_NEW) & 0x02, 0x02);

        // Outgoing EIP and EAX landed in the old image
        assert_eq!(bus.read_u32((OLD_TSS_BASE + TSS386_EIP) as usize).unwrap(), 0x1234);
        assert_eq!(bus.read_u32((OLD_TSS_BASE + TSS386_GPR) as usize).unwrap(), 0x5555_5555);
    }

    #[test]
    fn call_sets_nt_back_link_and_keeps_old_busy() {
        let (mut cpu, mut bus) = setup_tasks();
        cpu.far_call(&mut bus, SEL_TSS_NEW, 0, OperandWidth::Dword).unwrap();

        assert!(cpu.get_flag(CPU_FLAG_NT));
        assert_eq!(
            bus.read_u16((NEW_TSS_BASE + TSS386_LINK) as usize).unwrap(),
            SEL_TSS_OLD
        );
        // Nested entry leaves both TSSs busy
        assert_eq!(gdt_type_byte(&mut bus, SEL_TSS_OLD) & 0x02, 0x02);
        assert_eq!(gdt_type_byte(&mut bus, SEL_TSS_NEW) & 0x02, 0x02);
    }

    #[test]
    fn iret_returns_through_back_link() {
        let (mut cpu, mut bus) = setup_tasks();
        cpu.set_rip(0x1234);
        cpu.far_call(&mut bus, SEL_TSS_NEW, 0, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.tr.selector, SEL_TSS_NEW);

        cpu.iret(&mut bus, OperandWidth::Dword).unwrap();

        assert_eq!(cpu.tr.selector, SEL_TSS_OLD);
        assert_eq!(cpu.rip(), 0x1234);
        assert!(!cpu.get_flag(CPU_FLAG_NT));
        // The task we left is available again
        assert_eq!(gdt_type_byte(&mut bus, SEL_TSS_NEW) & 0x02, 0);
    }

    #[test]
    fn jump_to_busy_tss_faults() {
        let (mut cpu, mut bus) = setup_tasks();
        let err = cpu.far_jump(&mut bus, SEL_TSS_OLD, 0, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_TSS_OLD));
    }

    #[test]
    fn truncated_tss_faults_invalid_tss() {
        let (mut cpu, mut bus) = setup_tasks();
        // Rewrite the target with a limit below the 386 minimum
        write_descriptor(&mut bus, SEL_TSS_NEW >> 3, encode_segment(NEW_TSS_BASE as u32, 0x2F, 0x89, 0));
        let err = cpu.far_jump(&mut bus, SEL_TSS_NEW, 0, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::ts(SEL_TSS_NEW));
    }

    #[test]
    fn ss_esp_lookup_respects_tss_format() {
        let (mut cpu, mut bus) = setup_tasks();
        write_tss_dword(&mut bus, OLD_TSS_BASE, TSS386_ESP0 + 8, 0x0003_0000); // ESP1
        write_tss_dword(&mut bus, OLD_TSS_BASE, TSS386_ESP0 + 12, SEL_STACK0 as u32); // SS1
        let (ss, esp) = cpu.get_ss_esp_from_tss(&mut bus, 1).unwrap();
        assert_eq!(ss, SEL_STACK0);
        assert_eq!(esp, 0x0003_0000);
    }

    #[test]
    fn rsp_lookup_beyond_limit_faults() {
        let (mut cpu, mut bus) = setup_tasks();
        cpu.tr.limit_scaled = 0x0B;
        let err = cpu.get_rsp_from_tss(&mut bus, 2).unwrap_err();
        assert_eq!(err.kind, FaultKind::InvalidTss);
    }
}
