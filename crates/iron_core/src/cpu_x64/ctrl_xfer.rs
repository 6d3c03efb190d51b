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

    cpu_x64::ctrl_xfer.rs

    Far control transfers: JMP/CALL through code segments, call gates and
    task gates, far returns and IRET. Every descriptor check happens before
    any architectural state is committed, and each fault carries the error
    code the check order dictates (0 for limit/canonical violations, the
    selector index otherwise).

*/

use crate::{
    bus::BusInterface,
    cpu_common::{CpuResult, Fault, FaultKind, OperandWidth, Segment},
    cpu_x64::{
        access::is_canonical,
        descriptor::{Descriptor, GateDescriptor, SegmentDescriptor, GATE_386_CALL},
        segmentation::Selector,
        task_switch::TaskSwitchReason,
        Intel64,
        CPU_FLAGS_OSZAPC,
        CPU_FLAG_AC,
        CPU_FLAG_DIRECTION,
        CPU_FLAG_ID,
        CPU_FLAG_INT_ENABLE,
        CPU_FLAG_IOPL_MASK,
        CPU_FLAG_NT,
        CPU_FLAG_RF,
        CPU_FLAG_TRAP,
        CPU_FLAG_VM,
        RSP,
    },
};

impl Intel64 {
    /// Shared code-segment checks for every far transfer. `check_rpl` is
    /// the selector RPL for direct branches and zero for gated ones; a
    /// conforming target needs DPL <= CPL while a non-conforming one needs
    /// DPL == CPL exactly.
    pub(crate) fn check_cs(
        &self,
        raw_selector: u16,
        descriptor: &SegmentDescriptor,
        check_rpl: u8,
        check_cpl: u8,
    ) -> CpuResult<()> {
        if !descriptor.is_code() {
            log::debug!("check_cs: not a code segment");
            return Err(Fault::gp(raw_selector));
        }
        // L=1/D=1 is a reserved combination
        if self.long_mode() && descriptor.l && descriptor.d_b {
            return Err(Fault::gp(raw_selector));
        }
        if descriptor.conforming() {
            if descriptor.dpl > check_cpl {
                log::debug!("check_cs: conforming dpl > CPL");
                return Err(Fault::gp(raw_selector));
            }
        }
        else {
            if check_rpl > check_cpl {
                log::debug!("check_cs: rpl > CPL");
                return Err(Fault::gp(raw_selector));
            }
            if descriptor.dpl != check_cpl {
                log::debug!("check_cs: non-conforming dpl != CPL");
                return Err(Fault::gp(raw_selector));
            }
        }
        if !descriptor.present {
            return Err(Fault::np(raw_selector));
        }
        Ok(())
    }

    /// Target-offset check performed before committing a far branch: RIP
    /// must be canonical for a 64-bit destination, within the segment
    /// limit otherwise. Violations are #GP(0).
    fn validate_far_target(&self, descriptor: &SegmentDescriptor, new_rip: u64) -> CpuResult<()> {
        if self.long_mode() && descriptor.l {
            if !is_canonical(new_rip) {
                return Err(Fault::gp(0));
            }
        }
        else if new_rip > descriptor.limit_scaled as u64 {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    /// Commit a validated far branch: install CS at the given CPL and move
    /// RIP. Infallible by construction; all checks run beforehand.
    pub(crate) fn branch_far(&mut self, raw_selector: u16, descriptor: &SegmentDescriptor, new_rip: u64, cpl: u8) {
        self.load_cs(raw_selector, descriptor, cpl);
        self.set_rip(new_rip);
    }

    /* ------------------------------ Far JMP -------------------------------- */

    pub(crate) fn far_jump(
        &mut self,
        bus: &mut BusInterface,
        raw_cs: u16,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<()> {
        if self.real_mode() {
            self.set_real_mode_segment(Segment::CS, raw_cs);
            self.set_rip(offset & width.mask());
            return Ok(());
        }
        if self.v8086_mode() {
            self.set_v8086_segment(Segment::CS, raw_cs);
            self.set_rip(offset & 0xFFFF);
            return Ok(());
        }
        self.jump_protected(bus, raw_cs, offset, width)
    }

    fn jump_protected(
        &mut self,
        bus: &mut BusInterface,
        raw_cs: u16,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<()> {
        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let selector = Selector::from_u16(raw_cs);
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;

        match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(descriptor) => {
                self.check_cs(raw_cs, &descriptor, selector.rpl(), self.cpl())?;
                let new_rip = offset & width.mask();
                self.validate_far_target(&descriptor, new_rip)?;
                self.touch_segment(bus, raw_cs, descriptor.seg_type)?;
                self.branch_far(raw_cs, &descriptor, new_rip, self.cpl());
                Ok(())
            }
            _ if self.long_mode() => {
                // Long mode has no task switching and every legal gate is
                // the 16-byte call-gate form
                let (d1, d2, d3) = self.fetch_raw_descriptor64(bus, raw_cs, FaultKind::GeneralProtection)?;
                match Descriptor::parse64(d1, d2, d3) {
                    Descriptor::Gate(gate) if gate.gate_type == GATE_386_CALL => {
                        self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                        let (dest_raw, dest) = self.fetch_gate_target(bus, &gate)?;
                        if !dest.l || dest.d_b {
                            return Err(Fault::gp(dest_raw));
                        }
                        if !is_canonical(gate.offset) {
                            return Err(Fault::gp(0));
                        }
                        self.touch_segment(bus, dest_raw, dest.seg_type)?;
                        self.branch_far(dest_raw, &dest, gate.offset, self.cpl());
                        Ok(())
                    }
                    _ => Err(Fault::gp(raw_cs)),
                }
            }
            Descriptor::Gate(gate) if gate.is_call_gate() => {
                self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                let (dest_raw, dest) = self.fetch_gate_target(bus, &gate)?;
                // Through a gate, a non-conforming target must sit at
                // exactly the current privilege level for JMP
                self.check_cs(dest_raw, &dest, 0, self.cpl())?;
                self.validate_far_target(&dest, gate.offset)?;
                self.touch_segment(bus, dest_raw, dest.seg_type)?;
                self.branch_far(dest_raw, &dest, gate.offset, self.cpl());
                Ok(())
            }
            Descriptor::System(sys) if sys.is_tss() => {
                self.check_gate_privilege(raw_cs, sys.dpl, sys.present, selector.rpl())?;
                self.task_switch(bus, raw_cs, TaskSwitchReason::Jump)
            }
            Descriptor::TaskGate(gate) => {
                self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                self.task_switch(bus, gate.tss_selector, TaskSwitchReason::Jump)
            }
            _ => Err(Fault::gp(raw_cs)),
        }
    }

    /// Gate, TSS and task-gate descriptors share one privilege rule: the
    /// descriptor DPL must dominate both CPL and the selector's RPL.
    fn check_gate_privilege(&self, raw_selector: u16, dpl: u8, present: bool, rpl: u8) -> CpuResult<()> {
        if dpl < self.cpl() || dpl < rpl {
            log::debug!("gate privilege check failed: dpl {} cpl {} rpl {}", dpl, self.cpl(), rpl);
            return Err(Fault::gp(raw_selector));
        }
        if !present {
            return Err(Fault::np(raw_selector));
        }
        Ok(())
    }

    /// Fetch and pre-validate the code segment a call gate points at. The
    /// target DPL must dominate CPL whether or not a stack switch follows.
    fn fetch_gate_target(
        &mut self,
        bus: &mut BusInterface,
        gate: &GateDescriptor,
    ) -> CpuResult<(u16, SegmentDescriptor)> {
        let dest_raw = gate.selector;
        if Selector::is_null(dest_raw) {
            return Err(Fault::gp(0));
        }
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, dest_raw, FaultKind::GeneralProtection)?;
        let descriptor = match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(d) if d.is_code() => d,
            _ => return Err(Fault::gp(dest_raw)),
        };
        if descriptor.dpl > self.cpl() {
            return Err(Fault::gp(dest_raw));
        }
        if !descriptor.present {
            return Err(Fault::np(dest_raw));
        }
        Ok((dest_raw, descriptor))
    }

    /* ------------------------------ Far CALL ------------------------------- */

    pub(crate) fn far_call(
        &mut self,
        bus: &mut BusInterface,
        raw_cs: u16,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<()> {
        if self.real_mode() || self.v8086_mode() {
            let old_cs = self.seg(Segment::CS).selector;
            let old_ip = self.rip();
            self.push_width(bus, width, old_cs as u64)?;
            self.push_width(bus, width, old_ip)?;
            if self.real_mode() {
                self.set_real_mode_segment(Segment::CS, raw_cs);
            }
            else {
                self.set_v8086_segment(Segment::CS, raw_cs);
            }
            self.set_rip(offset & width.mask());
            return Ok(());
        }
        self.call_protected(bus, raw_cs, offset, width)
    }

    fn call_protected(
        &mut self,
        bus: &mut BusInterface,
        raw_cs: u16,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<()> {
        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let selector = Selector::from_u16(raw_cs);
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;

        match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(descriptor) => {
                self.check_cs(raw_cs, &descriptor, selector.rpl(), self.cpl())?;
                let new_rip = offset & width.mask();
                self.validate_far_target(&descriptor, new_rip)?;
                self.touch_segment(bus, raw_cs, descriptor.seg_type)?;

                let old_cs = self.seg(Segment::CS).selector;
                let old_rip = self.rip();
                self.push_width(bus, width, old_cs as u64)?;
                self.push_width(bus, width, old_rip)?;
                self.branch_far(raw_cs, &descriptor, new_rip, self.cpl());
                Ok(())
            }
            _ if self.long_mode() => {
                let (d1, d2, d3) = self.fetch_raw_descriptor64(bus, raw_cs, FaultKind::GeneralProtection)?;
                match Descriptor::parse64(d1, d2, d3) {
                    Descriptor::Gate(gate) if gate.gate_type == GATE_386_CALL => {
                        self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                        self.call_gate64(bus, &gate)
                    }
                    _ => Err(Fault::gp(raw_cs)),
                }
            }
            Descriptor::Gate(gate) if gate.is_call_gate() => {
                self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                self.call_gate_legacy(bus, &gate)
            }
            Descriptor::System(sys) if sys.is_tss() => {
                self.check_gate_privilege(raw_cs, sys.dpl, sys.present, selector.rpl())?;
                self.task_switch(bus, raw_cs, TaskSwitchReason::CallOrInterrupt)
            }
            Descriptor::TaskGate(gate) => {
                self.check_gate_privilege(raw_cs, gate.dpl, gate.present, selector.rpl())?;
                self.task_switch(bus, gate.tss_selector, TaskSwitchReason::CallOrInterrupt)
            }
            _ => Err(Fault::gp(raw_cs)),
        }
    }

    /// 286/386 call gate. A non-conforming target below CPL switches to the
    /// inner stack named by the TSS, copying `param_count` stack words from
    /// the outer frame before the return pointer is pushed.
    fn call_gate_legacy(&mut self, bus: &mut BusInterface, gate: &GateDescriptor) -> CpuResult<()> {
        let (dest_raw, dest) = self.fetch_gate_target(bus, gate)?;
        let gate_width = if gate.is_386_gate() { OperandWidth::Dword } else { OperandWidth::Word };
        let new_rip = gate.offset;

        if dest.conforming() || dest.dpl == self.cpl() {
            // Same-privilege transfer; the gate only redirects CS:EIP
            self.validate_far_target(&dest, new_rip)?;
            self.touch_segment(bus, dest_raw, dest.seg_type)?;
            let old_cs = self.seg(Segment::CS).selector;
            let old_rip = self.rip();
            self.push_width(bus, gate_width, old_cs as u64)?;
            self.push_width(bus, gate_width, old_rip)?;
            self.branch_far(dest_raw, &dest, new_rip, self.cpl());
            return Ok(());
        }

        let new_cpl = dest.dpl;
        let (raw_ss, new_sp) = self.get_ss_esp_from_tss(bus, new_cpl)?;

        // Validate the inner stack segment; failures here are #TS with the
        // new SS selector
        if Selector::is_null(raw_ss) {
            return Err(Fault::ts(0));
        }
        let ss_selector = Selector::from_u16(raw_ss);
        if ss_selector.rpl() != new_cpl {
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

        self.validate_far_target(&dest, new_rip)?;
        self.touch_segment(bus, dest_raw, dest.seg_type)?;
        self.touch_segment(bus, raw_ss, ss_descriptor.seg_type)?;

        // Read the parameters while the outer stack is still addressable
        let param_count = (gate.param_count & 0x1F) as u64;
        let step = gate_width.bytes() as u64;
        let outer_sp = self.stack_ptr();
        let mut params = Vec::with_capacity(param_count as usize);
        for slot in 0..param_count {
            let addr = self.wrap_sp(outer_sp.wrapping_add(slot * step));
            params.push(self.read_virtual_width(bus, Segment::SS, addr, gate_width)?);
        }

        let old_ss = self.seg(Segment::SS).selector;
        let old_sp = outer_sp;
        let old_cs = self.seg(Segment::CS).selector;
        let old_rip = self.rip();

        // Switch stacks, then rebuild the outer frame on the inner one:
        // SS:eSP, parameters deepest-first, then the return pointer
        self.load_ss(raw_ss, &ss_descriptor, new_cpl);
        self.set_stack_ptr(new_sp as u64);
        self.set_cpl(new_cpl);

        self.push_width(bus, gate_width, old_ss as u64)?;
        self.push_width(bus, gate_width, old_sp)?;
        for value in params.iter().rev() {
            self.push_width(bus, gate_width, *value)?;
        }
        self.push_width(bus, gate_width, old_cs as u64)?;
        self.push_width(bus, gate_width, old_rip)?;

        self.branch_far(dest_raw, &dest, new_rip, new_cpl);
        Ok(())
    }

    /// Long-mode call gate: 16-byte descriptor, 8-byte stack slots, no
    /// parameter copy. An inner transfer loads a null SS carrying the new
    /// CPL as its RPL.
    fn call_gate64(&mut self, bus: &mut BusInterface, gate: &GateDescriptor) -> CpuResult<()> {
        let (dest_raw, dest) = self.fetch_gate_target(bus, gate)?;
        if !dest.l || dest.d_b {
            return Err(Fault::gp(dest_raw));
        }
        if !is_canonical(gate.offset) {
            return Err(Fault::gp(0));
        }
        self.touch_segment(bus, dest_raw, dest.seg_type)?;

        let old_cs = self.seg(Segment::CS).selector;
        let old_rip = self.rip();

        if dest.conforming() || dest.dpl == self.cpl() {
            self.push_width(bus, OperandWidth::Qword, old_cs as u64)?;
            self.push_width(bus, OperandWidth::Qword, old_rip)?;
            self.branch_far(dest_raw, &dest, gate.offset, self.cpl());
            return Ok(());
        }

        let new_cpl = dest.dpl;
        let new_rsp = self.get_rsp_from_tss(bus, new_cpl)?;
        if !is_canonical(new_rsp) {
            return Err(Fault::ss(0));
        }

        let old_ss = self.seg(Segment::SS).selector;
        let old_rsp = self.gpr64(RSP);

        self.load_null_ss(new_cpl);
        self.set_gpr64(RSP, new_rsp);
        self.set_cpl(new_cpl);

        self.push_width(bus, OperandWidth::Qword, old_ss as u64)?;
        self.push_width(bus, OperandWidth::Qword, old_rsp)?;
        self.push_width(bus, OperandWidth::Qword, old_cs as u64)?;
        self.push_width(bus, OperandWidth::Qword, old_rip)?;

        self.branch_far(dest_raw, &dest, gate.offset, new_cpl);
        Ok(())
    }

    /* ------------------------------ Far RET -------------------------------- */

    pub(crate) fn far_return(&mut self, bus: &mut BusInterface, pop_bytes: u16, width: OperandWidth) -> CpuResult<()> {
        if self.real_mode() || self.v8086_mode() {
            let new_ip = self.pop_width(bus, width)?;
            let new_cs = self.pop_width(bus, width)? as u16;
            if self.real_mode() {
                self.set_real_mode_segment(Segment::CS, new_cs);
            }
            else {
                self.set_v8086_segment(Segment::CS, new_cs);
            }
            self.set_rip(new_ip & width.mask());
            self.drop_stack(OperandWidth::Byte, 0, pop_bytes as u64);
            return Ok(());
        }
        self.return_protected(bus, pop_bytes, width)
    }

    fn return_protected(&mut self, bus: &mut BusInterface, pop_bytes: u16, width: OperandWidth) -> CpuResult<()> {
        let return_rip = self.peek_stack(bus, width, 0)?;
        let raw_cs = self.peek_stack(bus, width, 1)? as u16;

        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let selector = Selector::from_u16(raw_cs);
        let return_rpl = selector.rpl();
        if return_rpl < self.cpl() {
            log::debug!("return_protected: rpl < CPL");
            return Err(Fault::gp(raw_cs));
        }

        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;
        let descriptor = match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(d) if d.is_code() => d,
            _ => return Err(Fault::gp(raw_cs)),
        };
        if descriptor.conforming() {
            if descriptor.dpl > return_rpl {
                return Err(Fault::gp(raw_cs));
            }
        }
        else if descriptor.dpl != return_rpl {
            return Err(Fault::gp(raw_cs));
        }
        if !descriptor.present {
            return Err(Fault::np(raw_cs));
        }

        if return_rpl == self.cpl() {
            self.validate_far_target(&descriptor, return_rip)?;
            self.touch_segment(bus, raw_cs, descriptor.seg_type)?;
            self.drop_stack(width, 2, pop_bytes as u64);
            self.branch_far(raw_cs, &descriptor, return_rip, return_rpl);
            return Ok(());
        }

        // Return to an outer privilege level: SS:eSP sit beyond the
        // parameter bytes the RET immediate discards
        let step = width.bytes() as u64;
        let base = self.stack_ptr();
        let return_sp = {
            let addr = self.wrap_sp(base.wrapping_add(2 * step + pop_bytes as u64));
            self.read_virtual_width(bus, Segment::SS, addr, width)?
        };
        let raw_ss = {
            let addr = self.wrap_sp(base.wrapping_add(3 * step + pop_bytes as u64));
            self.read_virtual_width(bus, Segment::SS, addr, width)? as u16
        };

        let ss_descriptor = self.check_return_ss(bus, raw_ss, return_rpl, descriptor.l)?;

        self.validate_far_target(&descriptor, return_rip)?;
        self.touch_segment(bus, raw_cs, descriptor.seg_type)?;

        self.branch_far(raw_cs, &descriptor, return_rip, return_rpl);
        match ss_descriptor {
            Some(ss_desc) => self.load_ss(raw_ss, &ss_desc, return_rpl),
            None => self.load_null_ss(return_rpl),
        }
        self.set_stack_ptr(self.wrap_sp(return_sp.wrapping_add(pop_bytes as u64)));
        self.validate_seg_regs();
        Ok(())
    }

    /// Stack-segment checks shared by the RET and IRET outer-privilege
    /// paths. `None` means a tolerated null SS (64-bit target below ring 3).
    fn check_return_ss(
        &mut self,
        bus: &mut BusInterface,
        raw_ss: u16,
        return_rpl: u8,
        dest_long: bool,
    ) -> CpuResult<Option<SegmentDescriptor>> {
        if Selector::is_null(raw_ss) {
            if self.long_mode() && dest_long && return_rpl != 3 {
                return Ok(None);
            }
            return Err(Fault::gp(0));
        }
        let ss_selector = Selector::from_u16(raw_ss);
        if ss_selector.rpl() != return_rpl {
            return Err(Fault::gp(raw_ss));
        }
        let (d1, d2) = self.fetch_raw_descriptor(bus, raw_ss, FaultKind::GeneralProtection)?;
        let ss_descriptor = match Descriptor::parse(d1, d2) {
            Descriptor::Segment(d) if !d.is_code() && d.writable() => d,
            _ => return Err(Fault::gp(raw_ss)),
        };
        if ss_descriptor.dpl != return_rpl {
            return Err(Fault::gp(raw_ss));
        }
        if !ss_descriptor.present {
            return Err(Fault::ss(raw_ss));
        }
        self.touch_segment(bus, raw_ss, ss_descriptor.seg_type)?;
        Ok(Some(ss_descriptor))
    }

    /* -------------------------------- IRET --------------------------------- */

    pub(crate) fn iret(&mut self, bus: &mut BusInterface, width: OperandWidth) -> CpuResult<()> {
        if self.real_mode() {
            let new_ip = self.pop_width(bus, width)?;
            let new_cs = self.pop_width(bus, width)? as u16;
            let new_flags = self.pop_width(bus, width)?;
            self.set_real_mode_segment(Segment::CS, new_cs);
            self.set_rip(new_ip & width.mask());
            self.write_eflags(new_flags, width, true, true, false);
            return Ok(());
        }
        if self.v8086_mode() {
            if self.iopl() < 3 {
                return Err(Fault::gp(0));
            }
            let new_ip = self.pop_width(bus, width)?;
            let new_cs = self.pop_width(bus, width)? as u16;
            let new_flags = self.pop_width(bus, width)?;
            self.set_v8086_segment(Segment::CS, new_cs);
            self.set_rip(new_ip & 0xFFFF);
            // IOPL is 3 here; VM and IOPL itself stay fixed
            self.write_eflags(new_flags, width, false, true, false);
            return Ok(());
        }
        self.iret_protected(bus, width)
    }

    fn iret_protected(&mut self, bus: &mut BusInterface, width: OperandWidth) -> CpuResult<()> {
        // NT set means this frame was entered by a task gate; unwind
        // through the back link instead of the stack
        if !self.long_mode() && self.get_flag(CPU_FLAG_NT) {
            let back_link = self.system_read_u16(bus, self.tr.base)?;
            return self.task_switch(bus, back_link, TaskSwitchReason::Iret);
        }

        let return_rip = self.peek_stack(bus, width, 0)?;
        let raw_cs = self.peek_stack(bus, width, 1)? as u16;
        let new_flags = self.peek_stack(bus, width, 2)?;

        // Flag-write permissions are judged at the privilege IRET runs at
        let change_if = self.cpl() <= self.iopl();
        let change_iopl = self.cpl() == 0;

        if !self.long_mode() && width == OperandWidth::Dword && new_flags & CPU_FLAG_VM != 0 && self.cpl() == 0 {
            return self.iret_to_v8086(bus, return_rip, raw_cs, new_flags);
        }

        if Selector::is_null(raw_cs) {
            return Err(Fault::gp(0));
        }
        let selector = Selector::from_u16(raw_cs);
        let return_rpl = selector.rpl();
        if return_rpl < self.cpl() {
            return Err(Fault::gp(raw_cs));
        }

        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_cs, FaultKind::GeneralProtection)?;
        let descriptor = match Descriptor::parse(dword1, dword2) {
            Descriptor::Segment(d) if d.is_code() => d,
            _ => return Err(Fault::gp(raw_cs)),
        };
        if descriptor.conforming() {
            if descriptor.dpl > return_rpl {
                return Err(Fault::gp(raw_cs));
            }
        }
        else if descriptor.dpl != return_rpl {
            return Err(Fault::gp(raw_cs));
        }
        if !descriptor.present {
            return Err(Fault::np(raw_cs));
        }

        let outer = return_rpl > self.cpl();

        // A 64-bit-mode IRET always restores SS:RSP, even to the same
        // privilege level
        if outer || self.long64_mode() {
            let return_sp = self.peek_stack(bus, width, 3)?;
            let raw_ss = self.peek_stack(bus, width, 4)? as u16;

            let ss_descriptor = self.check_return_ss(bus, raw_ss, return_rpl, descriptor.l)?;
            self.validate_far_target(&descriptor, return_rip)?;
            self.touch_segment(bus, raw_cs, descriptor.seg_type)?;

            self.branch_far(raw_cs, &descriptor, return_rip, return_rpl);
            match ss_descriptor {
                Some(ss_desc) => self.load_ss(raw_ss, &ss_desc, return_rpl),
                None => self.load_null_ss(return_rpl),
            }
            self.set_stack_ptr(self.wrap_sp(return_sp));
            self.write_eflags(new_flags, width, change_iopl, change_if, false);
            if outer {
                self.validate_seg_regs();
            }
        }
        else {
            self.validate_far_target(&descriptor, return_rip)?;
            self.touch_segment(bus, raw_cs, descriptor.seg_type)?;
            self.drop_stack(width, 3, 0);
            self.branch_far(raw_cs, &descriptor, return_rip, return_rpl);
            self.write_eflags(new_flags, width, change_iopl, change_if, false);
        }
        Ok(())
    }

    /// CPL-0 IRET with VM set in the flag image: resume the interrupted
    /// v8086 task. The frame carries nine dwords, ending with the four
    /// data segment selectors.
    fn iret_to_v8086(&mut self, bus: &mut BusInterface, new_eip: u64, new_cs: u16, new_flags: u64) -> CpuResult<()> {
        let w = OperandWidth::Dword;
        let new_esp = self.peek_stack(bus, w, 3)?;
        let new_ss = self.peek_stack(bus, w, 4)? as u16;
        let new_es = self.peek_stack(bus, w, 5)? as u16;
        let new_ds = self.peek_stack(bus, w, 6)? as u16;
        let new_fs = self.peek_stack(bus, w, 7)? as u16;
        let new_gs = self.peek_stack(bus, w, 8)? as u16;

        self.write_eflags(new_flags, w, true, true, true);
        self.set_cpl(3);
        self.set_v8086_segment(Segment::CS, new_cs);
        self.set_v8086_segment(Segment::SS, new_ss);
        self.set_v8086_segment(Segment::ES, new_es);
        self.set_v8086_segment(Segment::DS, new_ds);
        self.set_v8086_segment(Segment::FS, new_fs);
        self.set_v8086_segment(Segment::GS, new_gs);
        self.set_gpr32(RSP, new_esp as u32);
        self.set_rip(new_eip & 0xFFFF);
        Ok(())
    }

    /* --------------------------- EFLAGS updates ---------------------------- */

    /// Masked EFLAGS write shared by IRET and POPF. The arithmetic flags,
    /// TF, DF and NT always change; IF needs CPL <= IOPL, IOPL needs CPL 0,
    /// and VM only moves on the dword v8086-resume path. Word-sized writes
    /// leave the upper flag bits alone.
    pub(crate) fn write_eflags(
        &mut self,
        value: u64,
        width: OperandWidth,
        change_iopl: bool,
        change_if: bool,
        change_vm: bool,
    ) {
        let mut mask = CPU_FLAGS_OSZAPC | CPU_FLAG_TRAP | CPU_FLAG_DIRECTION | CPU_FLAG_NT;
        if change_if {
            mask |= CPU_FLAG_INT_ENABLE;
        }
        if change_iopl {
            mask |= CPU_FLAG_IOPL_MASK;
        }
        if width != OperandWidth::Word {
            mask |= CPU_FLAG_AC | CPU_FLAG_ID | CPU_FLAG_RF;
            if change_vm {
                mask |= CPU_FLAG_VM;
            }
        }

        let old = self.rflags();
        self.set_rflags((old & !mask) | (value & mask));
        if (old ^ self.rflags()) & CPU_FLAG_AC != 0 {
            self.handle_ac_flag_change();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_x64::{
        descriptor::{encode_segment, SYS_SEGMENT_BUSY_386_TSS},
        segmentation::{
            tests::{setup_protected, write_descriptor, SEL_CODE0, SEL_CODE3, SEL_DATA0, SEL_DATA3, SEL_STACK0},
            SystemSegment,
        },
    };

    const SEL_GATE: u16 = 0x48;
    const SEL_CONF: u16 = 0x50;

    fn encode_gate(selector: u16, offset: u32, gate_type: u8, dpl: u8, param_count: u8) -> (u32, u32) {
        let dword1 = ((selector as u32) << 16) | (offset & 0xFFFF);
        let dword2 = (offset & 0xFFFF_0000)
            | 0x8000
            | ((dpl as u32) << 13)
            | ((gate_type as u32) << 8)
            | param_count as u32;
        (dword1, dword2)
    }

    /// Demote the test CPU to ring 3 on its own code/stack/data segments.
    fn enter_ring3(cpu: &mut Intel64, bus: &mut BusInterface) {
        let (d1, d2) = encode_segment(0, 0xF_FFFF, 0xFA, 0xC);
        let code3 = match Descriptor::parse(d1, d2) {
            Descriptor::Segment(d) => d,
            _ => unreachable!(),
        };
        let (d1, d2) = encode_segment(0, 0xF_FFFF, 0xF2, 0xC);
        let data3 = match Descriptor::parse(d1, d2) {
            Descriptor::Segment(d) => d,
            _ => unreachable!(),
        };
        cpu.load_cs(SEL_CODE3, &code3, 3);
        cpu.load_ss(SEL_DATA3, &data3, 3);
        cpu.load_seg_reg(bus, Segment::DS, SEL_DATA3).unwrap();
    }

    #[test]
    fn real_mode_far_jump_sets_base_and_ip() {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x10_0000);
        cpu.far_jump(&mut bus, 0x1234, 0x0010, OperandWidth::Word).unwrap();
        assert_eq!(cpu.seg(Segment::CS).selector, 0x1234);
        assert_eq!(cpu.seg(Segment::CS).cache.base, 0x12340);
        assert_eq!(cpu.rip(), 0x0010);
    }

    #[test]
    fn protected_jump_same_privilege() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.far_jump(&mut bus, SEL_CODE0, 0x4000, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.seg(Segment::CS).selector, SEL_CODE0);
        assert_eq!(cpu.rip(), 0x4000);
        assert_eq!(cpu.cpl(), 0);
    }

    #[test]
    fn protected_jump_null_selector_faults() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.far_jump(&mut bus, 0x0000, 0x4000, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::gp(0));
    }

    #[test]
    fn protected_jump_to_data_segment_faults() {
        let (mut cpu, mut bus) = setup_protected();
        let err = cpu.far_jump(&mut bus, SEL_DATA0, 0x4000, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_DATA0));
    }

    #[test]
    fn nonconforming_dpl_mismatch_faults() {
        let (mut cpu, mut bus) = setup_protected();
        // Ring-0 CPL against a DPL-3 non-conforming target
        let err = cpu.far_jump(&mut bus, SEL_CODE3, 0x4000, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_CODE3));
    }

    #[test]
    fn conforming_target_allows_lower_dpl_caller() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.gdtr.limit = 0xFF;
        // Conforming DPL-0 code reachable from ring 3
        write_descriptor(&mut bus, (SEL_CONF >> 3), encode_segment(0, 0xF_FFFF, 0x9E, 0xC));
        enter_ring3(&mut cpu, &mut bus);
        cpu.far_jump(&mut bus, SEL_CONF | 3, 0x4000, OperandWidth::Dword).unwrap();
        // CPL stays 3; the selector RPL is forced to it
        assert_eq!(cpu.cpl(), 3);
        assert_eq!(cpu.seg(Segment::CS).selector, SEL_CONF | 3);
    }

    #[test]
    fn far_call_pushes_return_pointer() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.set_gpr32(RSP, 0x9000);
        cpu.set_rip(0x1111);
        cpu.far_call(&mut bus, SEL_CODE0, 0x4000, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.rip(), 0x4000);
        assert_eq!(cpu.gpr32(RSP), 0x9000 - 8);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x1111);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), SEL_CODE0 as u64);
    }

    #[test]
    fn call_gate_same_privilege_redirects_to_gate_offset() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.gdtr.limit = 0xFF;
        write_descriptor(&mut bus, (SEL_GATE >> 3), encode_gate(SEL_CODE0, 0x5000, GATE_386_CALL, 0, 0));
        cpu.set_gpr32(RSP, 0x9000);
        cpu.set_rip(0x2222);
        // The offset operand of the instruction is ignored for gates
        cpu.far_call(&mut bus, SEL_GATE, 0xDEAD_0000, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.rip(), 0x5000);
        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x2222);
    }

    /// Builds a 386 TSS with a ring-0 stack, demotes to ring 3, and
    /// returns the machine ready for an inner-privilege gate call.
    fn setup_ring3_with_tss() -> (Intel64, BusInterface) {
        let (mut cpu, mut bus) = setup_protected();
        cpu.gdtr.limit = 0xFF;
        // Gate DPL 3 so ring 3 may call through it; two stack parameters
        write_descriptor(&mut bus, (SEL_GATE >> 3), encode_gate(SEL_CODE0, 0x5000, GATE_386_CALL, 3, 2));

        let tss_base = 0x8000u64;
        bus.write_u32(tss_base as usize + 4, 0x7000).unwrap(); // ESP0
        bus.write_u32(tss_base as usize + 8, SEL_STACK0 as u32).unwrap(); // SS0
        cpu.tr = SystemSegment {
            selector: 0x40,
            base: tss_base,
            limit_scaled: 0x67,
            sys_type: SYS_SEGMENT_BUSY_386_TSS,
            valid: true,
        };

        enter_ring3(&mut cpu, &mut bus);
        (cpu, bus)
    }

    #[test]
    fn call_gate_inner_privilege_switches_stack_and_copies_params() {
        let (mut cpu, mut bus) = setup_ring3_with_tss();
        cpu.set_gpr32(RSP, 0x6000);
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x1111_0001).unwrap(); // first param
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x2222_0002).unwrap(); // second param
        cpu.set_rip(0x3333);

        cpu.far_call(&mut bus, SEL_GATE | 3, 0, OperandWidth::Dword).unwrap();

        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.rip(), 0x5000);
        assert_eq!(cpu.seg(Segment::SS).selector, SEL_STACK0);
        // Inner frame, top down: EIP, CS, params (same order as the outer
        // stack), outer ESP, outer SS
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x3333);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), (SEL_CODE3 | 3) as u64);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x2222_0002);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x1111_0001);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), 0x6000 - 8);
        assert_eq!(cpu.pop_width(&mut bus, OperandWidth::Dword).unwrap(), (SEL_DATA3 | 3) as u64);
    }

    #[test]
    fn far_return_to_outer_privilege_restores_stack() {
        let (mut cpu, mut bus) = setup_ring3_with_tss();
        cpu.set_gpr32(RSP, 0x6000);
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x1111_0001).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x2222_0002).unwrap();
        cpu.set_rip(0x3333);
        cpu.far_call(&mut bus, SEL_GATE | 3, 0, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.cpl(), 0);

        // RETF 8 discards the two copied parameters on the way out
        cpu.far_return(&mut bus, 8, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.cpl(), 3);
        assert_eq!(cpu.rip(), 0x3333);
        assert_eq!(cpu.seg(Segment::CS).selector, SEL_CODE3 | 3);
        assert_eq!(cpu.seg(Segment::SS).selector, SEL_DATA3 | 3);
        // Outer ESP was 0x6000-8 at call time; the 8 parameter bytes are
        // discarded on return
        assert_eq!(cpu.gpr32(RSP), 0x6000);
    }

    #[test]
    fn far_return_rpl_below_cpl_faults() {
        let (mut cpu, mut bus) = setup_ring3_with_tss();
        cpu.set_gpr32(RSP, 0x6000);
        // Forged frame naming a ring-0 selector from ring 3
        cpu.push_width(&mut bus, OperandWidth::Dword, SEL_CODE0 as u64).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x4000).unwrap();
        let err = cpu.far_return(&mut bus, 0, OperandWidth::Dword).unwrap_err();
        assert_eq!(err, Fault::gp(SEL_CODE0));
    }

    #[test]
    fn iret_same_privilege_restores_flags_and_rip() {
        let (mut cpu, mut bus) = setup_protected();
        cpu.set_gpr32(RSP, 0x9000);
        cpu.push_width(&mut bus, OperandWidth::Dword, CPU_FLAG_INT_ENABLE | CPU_FLAG_DIRECTION | 0x2).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, SEL_CODE0 as u64).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x4321).unwrap();
        cpu.iret(&mut bus, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.rip(), 0x4321);
        assert!(cpu.get_flag(CPU_FLAG_INT_ENABLE));
        assert!(cpu.get_flag(CPU_FLAG_DIRECTION));
        assert_eq!(cpu.gpr32(RSP), 0x9000);
    }

    #[test]
    fn iret_at_cpl3_cannot_raise_if_or_iopl() {
        let (mut cpu, mut bus) = setup_ring3_with_tss();
        cpu.clear_flag(CPU_FLAG_INT_ENABLE);
        cpu.set_gpr32(RSP, 0x6000);
        // Flag image asking for IF and IOPL 3 while running at CPL 3,
        // IOPL 0: both requests are dropped silently
        cpu.push_width(&mut bus, OperandWidth::Dword, CPU_FLAG_INT_ENABLE | CPU_FLAG_IOPL_MASK | 0x2).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, (SEL_CODE3 | 3) as u64).unwrap();
        cpu.push_width(&mut bus, OperandWidth::Dword, 0x4444).unwrap();
        cpu.iret(&mut bus, OperandWidth::Dword).unwrap();
        assert_eq!(cpu.rip(), 0x4444);
        assert!(!cpu.get_flag(CPU_FLAG_INT_ENABLE));
        assert_eq!(cpu.iopl(), 0);
    }

    #[test]
    fn v8086_iret_requires_iopl3() {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x10_0000);
        cpu.write_cr(0, crate::cpu_x64::CR0_PE).unwrap();
        cpu.set_rflags(cpu.rflags() | CPU_FLAG_VM);
        cpu.set_cpl(3);
        assert!(cpu.v8086_mode());
        let err = cpu.iret(&mut bus, OperandWidth::Word).unwrap_err();
        assert_eq!(err, Fault::gp(0));
    }

    #[test]
    fn word_flag_write_leaves_upper_bits() {
        let mut cpu = Intel64::new();
        cpu.set_rflags(cpu.rflags() | CPU_FLAG_ID);
        cpu.write_eflags(0, OperandWidth::Word, true, true, false);
        assert!(cpu.get_flag(CPU_FLAG_ID));
        cpu.write_eflags(0, OperandWidth::Dword, true, true, false);
        assert!(!cpu.get_flag(CPU_FLAG_ID));
    }
}
