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

    cpu_x64::exception.rs

    Interrupt and exception delivery: the IVT in real mode, 8-byte IDT
    gates in protected mode and 16-byte gates in long mode, with the stack
    switch, error-code push and flag clearing each path requires. A fault
    raised while delivering another is folded through the double-fault
    promotion matrix; a fault during double-fault delivery shuts the
    machine down.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{CpuError, CpuResult, Fault, FaultClass, FaultKind, OperandWidth, Segment},
    cpu_x64::{
        access::is_canonical,
        descriptor::{Descriptor, GATE_286_INTERRUPT, GATE_286_TRAP, GATE_386_INTERRUPT, GATE_386_TRAP},
        segmentation::Selector,
        task_switch::TaskSwitchReason,
        CpuActivity,
        Intel64,
        CPU_FLAG_INT_ENABLE,
        CPU_FLAG_NT,
        CPU_FLAG_RF,
        CPU_FLAG_TRAP,
        CPU_FLAG_VM,
        RSP,
    },
};

/// What kind of event is being delivered. Software interrupts are subject
/// to the gate DPL check and the v8086 IOPL check; the others are not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InterruptSource {
    External,
    Software,
    Exception,
}

// IST slots start at this offset in the 64-bit TSS
const TSS64_IST1: u64 = 0x24;

impl Intel64 {
    /// Deliver a fault to the guest, promoting through #DF when a second
    /// fault interrupts the first delivery. The only error this can
    /// surface is the triple-fault shutdown.
    pub(crate) fn deliver_fault(&mut self, bus: &mut BusInterface, fault: Fault, ext: bool) -> Result<(), CpuError> {
        let mut current = fault;
        let mut ext = ext;
        self.fault_depth = 0;

        loop {
            self.last_fault_class = Some(current.kind.class());
            log::trace!("delivering {} (depth {})", current, self.fault_depth);

            let error_code = if current.kind.pushes_error_code() {
                Some(current.error_code | ext as u16)
            }
            else {
                None
            };
            match self.interrupt(bus, current.kind.vector(), InterruptSource::Exception, error_code) {
                Ok(()) => {
                    self.fault_depth = 0;
                    self.last_fault_class = None;
                    return Ok(());
                }
                Err(next) => {
                    if current.kind == FaultKind::DoubleFault {
                        log::error!("triple fault ({} during #DF delivery), shutting down", next);
                        self.set_activity(CpuActivity::Shutdown);
                        return Err(CpuError::Panic(format!(
                            "triple fault: {} while delivering a double fault",
                            next
                        )));
                    }
                    let promote = matches!(
                        (current.kind.class(), next.kind.class()),
                        (FaultClass::Contributory, FaultClass::Contributory)
                            | (FaultClass::PageFault, FaultClass::Contributory)
                            | (FaultClass::PageFault, FaultClass::PageFault)
                    );
                    current = if promote {
                        Fault { kind: FaultKind::DoubleFault, error_code: 0 }
                    }
                    else {
                        next
                    };
                    // Secondary faults are machine-generated by definition
                    ext = true;
                    self.fault_depth += 1;
                }
            }
        }
    }

    /// Vector an event through the IDT (or IVT). Errors are faults to be
    /// delivered in turn; `deliver_fault` handles that recursion.
    pub(crate) fn interrupt(
        &mut self,
        bus: &mut BusInterface,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> CpuResult<()> {
        if source == InterruptSource::Software && self.v8086_mode() && self.iopl() < 3 {
            return Err(Fault::gp(0));
        }
        if self.real_mode() {
            self.interrupt_real(bus, vector)
        }
        else if self.long_mode() {
            self.interrupt_long(bus, vector, source, error_code)
        }
        else {
            self.interrupt_protected(bus, vector, source, error_code)
        }
    }

    fn interrupt_real(&mut self, bus: &mut BusInterface, vector: u8) -> CpuResult<()> {
        let offset = vector as u64 * 4;
        if offset + 3 > self.idtr.limit as u64 {
            return Err(Fault::gp(0));
        }
        let new_ip = self.system_read_u16(bus, self.idtr.base + offset)?;
        let new_cs = self.system_read_u16(bus, self.idtr.base + offset + 2)?;

        let flags = self.rflags();
        self.push_width(bus, OperandWidth::Word, flags)?;
        self.push_width(bus, OperandWidth::Word, self.seg(Segment::CS).selector as u64)?;
        self.push_width(bus, OperandWidth::Word, self.rip())?;

        self.set_rflags(flags & !(CPU_FLAG_INT_ENABLE | CPU_FLAG_TRAP | CPU_FLAG_RF));
        self.set_real_mode_segment(Segment::CS, new_cs);
        self.set_rip(new_ip as u64);
        Ok(())
    }

    fn interrupt_protected(
        &mut self,
        bus: &mut BusInterface,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> CpuResult<()> {
        // IDT-sourced faults carry vector*8 | IDT-flag as their error code
        let idt_err = ((vector as u16) << 3) | 2;
        let offset = vector as u64 * 8;
        if offset + 7 > self.idtr.limit as u64 {
            return Err(Fault::gp_raw(idt_err));
        }
        let dword1 = self.system_read_u32(bus, self.idtr.base + offset)?;
        let dword2 = self.system_read_u32(bus, self.idtr.base + offset + 4)?;

        let gate = match Descriptor::parse(dword1, dword2) {
            Descriptor::TaskGate(tg) => {
                if source == InterruptSource::Software && tg.dpl < self.cpl() {
                    return Err(Fault::gp_raw(idt_err));
                }
                if !tg.present {
                    return Err(Fault::np_raw(idt_err));
                }
                self.task_switch(bus, tg.tss_selector, TaskSwitchReason::CallOrInterrupt)?;
                if let Some(code) = error_code {
                    let width = if self.tr.sys_type & 0x8 != 0 { OperandWidth::Dword } else { OperandWidth::Word };
                    self.push_width(bus, width, code as u64)?;
                }
                return Ok(());
            }
            Descriptor::Gate(g)
                if matches!(
                    g.gate_type,
                    GATE_286_INTERRUPT | GATE_286_TRAP | GATE_386_INTERRUPT | GATE_386_TRAP
                ) =>
            {
                g
            }
            _ => return Err(Fault::gp_raw(idt_err)),
        };

        if source == InterruptSource::Software && gate.dpl < self.cpl() {
            return Err(Fault::gp_raw(idt_err));
        }
        if !gate.present {
            return Err(Fault::np_raw(idt_err));
        }

        let gate_width = if gate.is_386_gate() { OperandWidth::Dword } else { OperandWidth::Word };
        let raw_cs = gate.selector;
        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let (cs_d1, cs_d2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;
        let cs_descriptor = match Descriptor::parse(cs_d1, cs_d2) {
            Descriptor::Segment(d) if d.is_code() => d,
            _ => return Err(Fault::gp(raw_cs)),
        };
        if cs_descriptor.dpl > self.cpl() {
            return Err(Fault::gp(raw_cs));
        }
        if !cs_descriptor.present {
            return Err(Fault::np(raw_cs));
        }
        if gate.offset > cs_descriptor.limit_scaled as u64 {
            return Err(Fault::gp(0));
        }

        let old_flags = self.rflags();
        let from_v8086 = self.v8086_mode();

        if !cs_descriptor.conforming() && cs_descriptor.dpl < self.cpl() {
            // Interrupt to an inner privilege level
            if from_v8086 {
                // v8086 redirection must land on ring 0 through a 386 gate
                if cs_descriptor.dpl != 0 || !gate.is_386_gate() {
                    return Err(Fault::gp(raw_cs));
                }
            }
            let new_cpl = cs_descriptor.dpl;
            let (raw_ss, new_sp) = self.get_ss_esp_from_tss(bus, new_cpl)?;

            if Selector::is_null(raw_ss) {
                return Err(Fault::ts(0));
            }
            if Selector::from_u16(raw_ss).rpl() != new_cpl {
                return Err(Fault::ts(raw_ss));
            }
            let (ss_d1, ss_d2) = self.fetch_raw_descriptor(bus, raw_ss, FaultKind::InvalidTss)?;
            let ss_descriptor = match Descriptor::parse(ss_d1, ss_d2) {
                Descriptor::Segment(d) if !d.is_code() && d.writable() => d,
                _ => return Err(Fault::ts(raw_ss)),
            };
            if ss_descriptor.dpl != new_cpl {
                return Err(Fault::ts(raw_ss));
            }
            if !ss_descriptor.present {
                return Err(Fault::ss(raw_ss));
            }

            let old_ss = self.seg(Segment::SS).selector;
            let old_sp = self.stack_ptr();
            let old_cs = self.seg(Segment::CS).selector;
            let old_rip = self.rip();
            let v8086_segs = [
                self.seg(Segment::GS).selector,
                self.seg(Segment::FS).selector,
                self.seg(Segment::DS).selector,
                self.seg(Segment::ES).selector,
            ];

            self.load_ss(raw_ss, &ss_descriptor, new_cpl);
            self.set_stack_ptr(new_sp as u64);
            self.set_cpl(new_cpl);

            if from_v8086 {
                // The interrupted task's data segments ride along, then
                // get nulled so the handler starts clean
                for sel in v8086_segs {
                    self.push_width(bus, gate_width, sel as u64)?;
                }
                for seg in [Segment::GS, Segment::FS, Segment::DS, Segment::ES] {
                    let reg = self.seg_mut(seg);
                    reg.selector = 0;
                    reg.cache.invalidate();
                }
            }
            self.push_width(bus, gate_width, old_ss as u64)?;
            self.push_width(bus, gate_width, old_sp)?;
            self.push_width(bus, gate_width, old_flags)?;
            self.push_width(bus, gate_width, old_cs as u64)?;
            self.push_width(bus, gate_width, old_rip)?;
            if let Some(code) = error_code {
                self.push_width(bus, gate_width, code as u64)?;
            }

            self.commit_interrupt_flags(old_flags, gate.gate_type);
            self.load_cs(raw_cs, &cs_descriptor, new_cpl);
            self.set_rip(gate.offset);
            return Ok(());
        }

        // Same-privilege delivery; impossible from v8086, whose CPL is 3
        if from_v8086 {
            return Err(Fault::gp(raw_cs));
        }
        self.push_width(bus, gate_width, old_flags)?;
        self.push_width(bus, gate_width, self.seg(Segment::CS).selector as u64)?;
        self.push_width(bus, gate_width, self.rip())?;
        if let Some(code) = error_code {
            self.push_width(bus, gate_width, code as u64)?;
        }

        self.commit_interrupt_flags(old_flags, gate.gate_type);
        self.load_cs(raw_cs, &cs_descriptor, self.cpl());
        self.set_rip(gate.offset);
        Ok(())
    }

    fn interrupt_long(
        &mut self,
        bus: &mut BusInterface,
        vector: u8,
        source: InterruptSource,
        error_code: Option<u16>,
    ) -> CpuResult<()> {
        let idt_err = ((vector as u16) << 3) | 2;
        let offset = vector as u64 * 16;
        if offset + 15 > self.idtr.limit as u64 {
            return Err(Fault::gp_raw(idt_err));
        }
        let dword1 = self.system_read_u32(bus, self.idtr.base + offset)?;
        let dword2 = self.system_read_u32(bus, self.idtr.base + offset + 4)?;
        let dword3 = self.system_read_u32(bus, self.idtr.base + offset + 8)?;
        let dword4 = self.system_read_u32(bus, self.idtr.base + offset + 12)?;
        if dword4 & 0x0000_1F00 != 0 {
            return Err(Fault::gp_raw(idt_err));
        }

        let gate = match Descriptor::parse64(dword1, dword2, dword3) {
            Descriptor::Gate(g) if matches!(g.gate_type, GATE_386_INTERRUPT | GATE_386_TRAP) => g,
            _ => return Err(Fault::gp_raw(idt_err)),
        };
        if source == InterruptSource::Software && gate.dpl < self.cpl() {
            return Err(Fault::gp_raw(idt_err));
        }
        if !gate.present {
            return Err(Fault::np_raw(idt_err));
        }

        let raw_cs = gate.selector;
        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let (cs_d1, cs_d2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;
        let cs_descriptor = match Descriptor::parse(cs_d1, cs_d2) {
            Descriptor::Segment(d) if d.is_code() => d,
            _ => return Err(Fault::gp(raw_cs)),
        };
        if cs_descriptor.dpl > self.cpl() {
            return Err(Fault::gp(raw_cs));
        }
        // Handlers run in 64-bit mode only
        if !cs_descriptor.l || cs_descriptor.d_b {
            return Err(Fault::gp(raw_cs));
        }
        if !cs_descriptor.present {
            return Err(Fault::np(raw_cs));
        }
        if !is_canonical(gate.offset) {
            return Err(Fault::gp(0));
        }

        let new_cpl = if !cs_descriptor.conforming() && cs_descriptor.dpl < self.cpl() {
            cs_descriptor.dpl
        }
        else {
            self.cpl()
        };

        // IST request overrides the per-privilege stack; otherwise a stack
        // switch happens only on a privilege change
        let ist = gate.param_count & 0x7;
        let new_rsp = if ist != 0 {
            if !self.tr.valid {
                return Err(Fault::ts(0));
            }
            self.system_read_u64(bus, self.tr.base + TSS64_IST1 + (ist as u64 - 1) * 8)?
        }
        else if new_cpl != self.cpl() {
            self.get_rsp_from_tss(bus, new_cpl)?
        }
        else {
            self.gpr64(RSP)
        };
        if !is_canonical(new_rsp) {
            return Err(Fault::ss(0));
        }

        let old_flags = self.rflags();
        let old_ss = self.seg(Segment::SS).selector;
        let old_rsp = self.gpr64(RSP);
        let old_cs = self.seg(Segment::CS).selector;
        let old_rip = self.rip();

        if new_cpl != self.cpl() {
            self.load_null_ss(new_cpl);
            self.set_cpl(new_cpl);
        }
        // The 64-bit frame is always pushed on a 16-byte aligned stack and
        // always carries SS:RSP
        self.set_gpr64(RSP, new_rsp & !0xF);
        self.push_width(bus, OperandWidth::Qword, old_ss as u64)?;
        self.push_width(bus, OperandWidth::Qword, old_rsp)?;
        self.push_width(bus, OperandWidth::Qword, old_flags)?;
        self.push_width(bus, OperandWidth::Qword, old_cs as u64)?;
        self.push_width(bus, OperandWidth::Qword, old_rip)?;
        if let Some(code) = error_code {
            self.push_width(bus, OperandWidth::Qword, code as u64)?;
        }

        self.commit_interrupt_flags(old_flags, gate.gate_type);
        self.load_cs(raw_cs, &cs_descriptor, new_cpl);
        self.set_rip(gate.offset);
        Ok(())
    }

    /// Flag state on handler entry: VM, RF, NT and TF always drop;
    /// interrupt gates (even types) also mask IF.
    fn commit_interrupt_flags(&mut self, old_flags: u64, gate_type: u8) {
        let mut flags = old_flags & !(CPU_FLAG_VM | CPU_FLAG_RF | CPU_FLAG_NT | CPU_FLAG_TRAP);
        if gate_type & 0x1 == 0 {
            flags &= !CPU_FLAG_INT_ENABLE;
        }
        self.set_rflags(flags);
    }
}
