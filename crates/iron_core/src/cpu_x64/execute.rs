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

    cpu_x64::execute.rs

    The execution engine. step() runs one decoded trace: pending stores
    over code are replayed into the trace cache, a deliverable external
    interrupt preempts the instruction stream, and the trace at CS:RIP is
    found in the cache or decoded into it. Instructions then dispatch on
    their mnemonic; a Fault raised mid-instruction rewinds RIP to the
    instruction start and goes through IDT delivery.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{
        AddrSize, AddressingMode, CpuError, CpuResult, ExecutionResult, Fault, FaultKind, Instruction, Mnemonic,
        OperandType, OperandWidth, Segment,
    },
    cpu_x64::{
        access::is_canonical,
        decode::{decode, DecodeParams, MAX_INSTRUCTION_LENGTH},
        descriptor::Descriptor,
        exception::InterruptSource,
        icache::MAX_TRACE_LENGTH,
        segmentation::{GlobalTableRegister, Selector, SystemSegment},
        CpuActivity, Intel64, CPU_FLAG_CARRY, CPU_FLAG_INT_ENABLE, CPU_FLAG_OVERFLOW, CPU_FLAG_PARITY, CPU_FLAG_RF,
        CPU_FLAG_SIGN, CPU_FLAG_VM, CPU_FLAG_ZERO, EFER_LMA, EFER_LME, EFER_NXE, EFER_SCE, MSR_EFER, RAX, RBP, RBX,
        RCX, RDX, RSP,
    },
};

#[inline]
fn addr_mask(size: AddrSize) -> u64 {
    match size {
        AddrSize::A16 => 0xFFFF,
        AddrSize::A32 => 0xFFFF_FFFF,
        AddrSize::A64 => u64::MAX,
    }
}

#[inline]
fn sign_extend_from(value: u64, width: OperandWidth) -> u64 {
    match width {
        OperandWidth::Byte => value as u8 as i8 as i64 as u64,
        OperandWidth::Word => value as u16 as i16 as i64 as u64,
        OperandWidth::Dword => value as u32 as i32 as i64 as u64,
        OperandWidth::Qword => value,
    }
}

impl Intel64 {
    /// Run one trace worth of instructions. Returns how the trace ended;
    /// the only hard error is a triple fault, which shuts the CPU down.
    pub fn step(&mut self, bus: &mut BusInterface) -> Result<ExecutionResult, CpuError> {
        if self.activity() == CpuActivity::Shutdown {
            return Ok(ExecutionResult::Halt);
        }

        self.sync_code_cache(bus);

        // STI and MOV SS shadow exactly one interrupt window
        let inhibited = self.interrupts_inhibited();
        self.set_interrupt_inhibit(false);

        if let Some(vector) = self.pending_intr() {
            if !inhibited && self.get_flag(CPU_FLAG_INT_ENABLE) {
                self.clear_intr();
                self.set_activity(CpuActivity::Running);
                if let Err(fault) = self.interrupt(bus, vector, InterruptSource::External, None) {
                    self.deliver_fault(bus, fault, true)?;
                }
                return Ok(ExecutionResult::OkayJump);
            }
        }

        if self.activity() == CpuActivity::Halted {
            return Ok(ExecutionResult::Halt);
        }

        let (start, length) = match self.fetch_trace(bus) {
            Ok(trace) => trace,
            Err(fault) => {
                self.deliver_fault(bus, fault, false)?;
                return Ok(ExecutionResult::OkayJump);
            }
        };

        let ip_mask = if self.long64_mode() {
            u64::MAX
        }
        else if self.seg(Segment::CS).cache.d_b {
            0xFFFF_FFFF
        }
        else {
            0xFFFF
        };

        for n in 0..length {
            let instr = *self.icache.get(start + n);
            let start_rip = self.rip();
            self.set_rip(start_rip.wrapping_add(instr.size as u64) & ip_mask);

            if self.trace().is_some() {
                let cs = self.seg(Segment::CS).selector;
                let line = format!("{:04X}:{:012X} {}", cs, start_rip, instr);
                self.trace().println(line);
            }

            let branch = instr.mnemonic.is_branch();
            match self.dispatch(bus, &instr) {
                Ok(result) => {
                    self.bump_instr_count();
                    if result == ExecutionResult::Halt {
                        return Ok(ExecutionResult::Halt);
                    }
                    if branch {
                        return Ok(ExecutionResult::OkayJump);
                    }
                }
                Err(fault) => {
                    self.set_rip(start_rip);
                    self.deliver_fault(bus, fault, false)?;
                    return Ok(ExecutionResult::OkayJump);
                }
            }
        }
        Ok(ExecutionResult::Okay)
    }

    /// Replay stores that overlapped decoded code since this CPU last
    /// looked. Falling too far behind the event ring flushes wholesale.
    fn sync_code_cache(&mut self, bus: &mut BusInterface) {
        match bus.smc_events_since(self.smc_generation_seen) {
            Some(events) => {
                for event in events {
                    self.icache.handle_smc(event.paddr, event.mask);
                }
            }
            None => {
                log::debug!("smc event ring overrun, flushing trace cache");
                self.icache.flush();
            }
        }
        self.smc_generation_seen = bus.smc_generation();
    }

    /* ----------------------------- Trace fetch ----------------------------- */

    /// Locate or build the trace starting at the current CS:RIP.
    fn fetch_trace(&mut self, bus: &mut BusInterface) -> CpuResult<(u32, u32)> {
        let laddr = if self.long64_mode() {
            let rip = self.rip();
            if !is_canonical(rip) {
                return Err(Fault::gp(0));
            }
            rip
        }
        else {
            if self.rip() > self.seg(Segment::CS).cache.limit_scaled as u64 {
                return Err(Fault::gp(0));
            }
            self.seg(Segment::CS).cache.base.wrapping_add(self.rip()) & 0xFFFF_FFFF
        };

        let fetch_mode = self.fetch_mode_mask();
        let paddr = self.translate_execute(bus, laddr)?;
        if let Some(hit) = self.icache.lookup(paddr, fetch_mode) {
            return Ok(hit);
        }
        self.build_trace(bus, laddr, paddr, fetch_mode)
    }

    /// Fetch a decode window at `laddr`. Returns the bytes available, the
    /// physical page of any spill bytes, and a fault to raise should the
    /// truncated window turn out too short to hold an instruction.
    fn fetch_window(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        buf: &mut [u8],
    ) -> CpuResult<(usize, Option<u64>, Option<Fault>)> {
        let want = buf.len();
        let page_remain = (0x1000 - (laddr & 0xFFF)) as usize;
        let paddr = self.translate_execute(bus, laddr)?;
        let take = want.min(page_remain);
        bus.read_bytes(paddr as usize, &mut buf[..take]).map_err(|_| Fault::gp(0))?;
        if take == want {
            return Ok((want, None, None));
        }
        match self.translate_execute(bus, laddr + page_remain as u64) {
            Ok(paddr2) => {
                bus.read_bytes(paddr2 as usize, &mut buf[take..]).map_err(|_| Fault::gp(0))?;
                Ok((want, Some(paddr2), None))
            }
            // The spill page is unreachable; the fault only matters if an
            // instruction actually needs bytes from it
            Err(fault) => Ok((take, None, Some(fault))),
        }
    }

    fn build_trace(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        paddr: u64,
        fetch_mode: usize,
    ) -> CpuResult<(u32, u32)> {
        let params = DecodeParams {
            cs_d: self.seg(Segment::CS).cache.d_b,
            long64: self.long64_mode(),
        };
        let cs_limit = self.seg(Segment::CS).cache.limit_scaled as u64;

        let start = self.icache.alloc();
        let mut count: u32 = 0;
        let mut byte_len: u32 = 0;
        let mut paddr2: Option<u64> = None;

        loop {
            // Clip the window at the code segment limit
            let mut want = MAX_INSTRUCTION_LENGTH;
            if !params.long64 {
                let ip = self.rip().wrapping_add(byte_len as u64);
                if ip > cs_limit {
                    if count > 0 {
                        break;
                    }
                    return Err(Fault::gp(0));
                }
                want = want.min((cs_limit - ip + 1) as usize);
            }

            let mut buf = [0u8; MAX_INSTRUCTION_LENGTH];
            let (avail, spill, pending) = match self.fetch_window(bus, laddr + byte_len as u64, &mut buf[..want]) {
                Ok(window) => window,
                Err(fault) => {
                    if count > 0 {
                        // Later instructions refetch and fault on their own
                        break;
                    }
                    return Err(fault);
                }
            };

            let instr = match decode(&buf[..avail], params) {
                Ok(instr) => instr,
                Err(err) => {
                    if count > 0 {
                        break;
                    }
                    return Err(pending.unwrap_or(err));
                }
            };
            if (instr.size as usize) > avail {
                if count > 0 {
                    break;
                }
                return Err(pending.unwrap_or_else(|| Fault::gp(0)));
            }
            if spill.is_some() && byte_len as usize + instr.size as usize > (0x1000 - (laddr & 0xFFF) as usize) {
                paddr2 = spill;
            }

            *self.icache.slot_mut(start + count) = instr;
            count += 1;
            byte_len += instr.size as u32;

            if instr.mnemonic.is_branch() || count as usize >= MAX_TRACE_LENGTH {
                break;
            }
        }

        let coverage = self.icache.commit(paddr, fetch_mode, start, count, byte_len, paddr2);
        bus.wstamp().mark_icache_mask(paddr, coverage.mask1);
        if let Some((ppf2, mask2)) = coverage.page2 {
            bus.wstamp().mark_icache_mask(ppf2, mask2);
        }
        Ok((start, count))
    }

    /* --------------------------- Operand plumbing -------------------------- */

    fn ea_offset(&self, mode: &AddressingMode) -> u64 {
        let reg = |r: u8| match mode.size {
            AddrSize::A16 => self.gpr16(r) as u64,
            AddrSize::A32 => self.gpr32(r) as u64,
            AddrSize::A64 => self.gpr64(r),
        };
        let mut addr = mode.disp as u64;
        if mode.rip_relative {
            addr = addr.wrapping_add(self.rip());
        }
        if let Some(base) = mode.base {
            addr = addr.wrapping_add(reg(base));
        }
        if let Some(index) = mode.index {
            addr = addr.wrapping_add(reg(index).wrapping_mul(mode.scale as u64));
        }
        addr & addr_mask(mode.size)
    }

    /// Segment and offset for a memory operand; rBP/rSP-based addressing
    /// defaults to SS, overrides win everywhere.
    fn operand_ea(&self, instr: &Instruction, mode: &AddressingMode) -> (Segment, u64) {
        let seg = instr.segment_override.unwrap_or(match mode.base {
            Some(base) if base == RBP || base == RSP => Segment::SS,
            _ => Segment::DS,
        });
        (seg, self.ea_offset(mode))
    }

    fn read_operand(
        &mut self,
        bus: &mut BusInterface,
        instr: &Instruction,
        operand: &OperandType,
        width: OperandWidth,
    ) -> CpuResult<u64> {
        match *operand {
            OperandType::Reg8 { reg, high } => Ok(self.gpr8(reg, high) as u64),
            OperandType::Reg16(reg) => Ok(self.gpr16(reg) as u64),
            OperandType::Reg32(reg) => Ok(self.gpr32(reg) as u64),
            OperandType::Reg64(reg) => Ok(self.gpr64(reg)),
            OperandType::Immediate(value) => Ok(value),
            OperandType::Relative(value) => Ok(value as u64),
            OperandType::SegmentRegister(seg) => Ok(self.seg(seg).selector as u64),
            OperandType::AddressingMode(mode) => {
                let (seg, offset) = self.operand_ea(instr, &mode);
                self.read_virtual_width(bus, seg, offset, width)
            }
            _ => Err(Fault::ud()),
        }
    }

    fn write_operand(
        &mut self,
        bus: &mut BusInterface,
        instr: &Instruction,
        operand: &OperandType,
        width: OperandWidth,
        value: u64,
    ) -> CpuResult<()> {
        match *operand {
            OperandType::Reg8 { reg, high } => {
                self.set_gpr8(reg, high, value as u8);
                Ok(())
            }
            OperandType::Reg16(reg) => {
                self.set_gpr16(reg, value as u16);
                Ok(())
            }
            OperandType::Reg32(reg) => {
                self.set_gpr32(reg, value as u32);
                Ok(())
            }
            OperandType::Reg64(reg) => {
                self.set_gpr64(reg, value);
                Ok(())
            }
            OperandType::AddressingMode(mode) => {
                let (seg, offset) = self.operand_ea(instr, &mode);
                self.write_virtual_width(bus, seg, offset, width, value)
            }
            _ => Err(Fault::ud()),
        }
    }

    /// Destination read for read-modify-write forms: memory goes through
    /// the RMW path so the write-back cannot fault.
    fn read_dest(&mut self, bus: &mut BusInterface, instr: &Instruction, width: OperandWidth) -> CpuResult<u64> {
        if let OperandType::AddressingMode(mode) = instr.operand1 {
            let (seg, offset) = self.operand_ea(instr, &mode);
            self.read_rmw_virtual_width(bus, seg, offset, width)
        }
        else {
            self.read_operand(bus, instr, &instr.operand1, width)
        }
    }

    fn write_dest(
        &mut self,
        bus: &mut BusInterface,
        instr: &Instruction,
        width: OperandWidth,
        value: u64,
    ) -> CpuResult<()> {
        if instr.operand1.is_memory() {
            self.write_rmw_width(bus, width, value)
        }
        else {
            self.write_operand(bus, instr, &instr.operand1, width, value)
        }
    }

    /* ----------------------------- Branch helpers -------------------------- */

    /// Near branches default to 64-bit targets in 64-bit mode regardless of
    /// the decoded operand size.
    #[inline]
    fn near_width(&self, width: OperandWidth) -> OperandWidth {
        if self.long64_mode() {
            OperandWidth::Qword
        }
        else {
            width
        }
    }

    fn check_code_target(&self, dest: u64) -> CpuResult<()> {
        if self.long64_mode() {
            if !is_canonical(dest) {
                return Err(Fault::gp(0));
            }
        }
        else if dest > self.seg(Segment::CS).cache.limit_scaled as u64 {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    fn near_branch(&mut self, target: u64, width: OperandWidth) -> CpuResult<()> {
        let dest = target & width.mask();
        self.check_code_target(dest)?;
        self.set_rip(dest);
        Ok(())
    }

    fn condition(&self, mnemonic: Mnemonic) -> bool {
        let cf = self.get_flag(CPU_FLAG_CARRY);
        let zf = self.get_flag(CPU_FLAG_ZERO);
        let sf = self.get_flag(CPU_FLAG_SIGN);
        let of = self.get_flag(CPU_FLAG_OVERFLOW);
        let pf = self.get_flag(CPU_FLAG_PARITY);
        match mnemonic {
            Mnemonic::JO => of,
            Mnemonic::JNO => !of,
            Mnemonic::JB => cf,
            Mnemonic::JNB => !cf,
            Mnemonic::JZ => zf,
            Mnemonic::JNZ => !zf,
            Mnemonic::JBE => cf || zf,
            Mnemonic::JNBE => !cf && !zf,
            Mnemonic::JS => sf,
            Mnemonic::JNS => !sf,
            Mnemonic::JP => pf,
            Mnemonic::JNP => !pf,
            Mnemonic::JL => sf != of,
            Mnemonic::JNL => sf == of,
            Mnemonic::JLE => zf || sf != of,
            Mnemonic::JNLE => !zf && sf == of,
            _ => false,
        }
    }

    fn read_far_pointer(&mut self, bus: &mut BusInterface, instr: &Instruction) -> CpuResult<(u16, u64)> {
        match instr.operand1 {
            OperandType::FarPointer(selector, offset) => Ok((selector, offset as u64)),
            OperandType::AddressingMode(mode) => {
                let (seg, ea) = self.operand_ea(instr, &mode);
                let offset = self.read_virtual_width(bus, seg, ea, instr.width)?;
                let selector = self.read_virtual_u16(bus, seg, ea.wrapping_add(instr.width.bytes() as u64))?;
                Ok((selector, offset))
            }
            _ => Err(Fault::ud()),
        }
    }

    /// IOPL gate shared by CLI and STI.
    fn check_iopl_sensitive(&self) -> CpuResult<()> {
        if self.v8086_mode() {
            if self.iopl() < 3 {
                return Err(Fault::gp(0));
            }
        }
        else if self.protected_mode() && self.cpl() > self.iopl() {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    fn check_supervisor(&self) -> CpuResult<()> {
        if self.protected_mode() && self.cpl() != 0 {
            return Err(Fault::gp(0));
        }
        Ok(())
    }

    /* ------------------------------- Dispatch ------------------------------ */

    fn dispatch(&mut self, bus: &mut BusInterface, instr: &Instruction) -> CpuResult<ExecutionResult> {
        use Mnemonic::*;
        let width = instr.width;

        match instr.mnemonic {
            NOP => {}

            ADD | OR | ADC | SBB | AND | SUB | XOR => {
                let a = self.read_dest(bus, instr, width)?;
                let b = self.read_operand(bus, instr, &instr.operand2, width)?;
                let result = match instr.mnemonic {
                    ADD => self.alu_op_add(width, a, b),
                    OR => self.alu_op_or(width, a, b),
                    ADC => self.alu_op_adc(width, a, b),
                    SBB => self.alu_op_sbb(width, a, b),
                    AND => self.alu_op_and(width, a, b),
                    SUB => self.alu_op_sub(width, a, b),
                    _ => self.alu_op_xor(width, a, b),
                };
                self.write_dest(bus, instr, width, result)?;
            }
            CMP => {
                let a = self.read_operand(bus, instr, &instr.operand1, width)?;
                let b = self.read_operand(bus, instr, &instr.operand2, width)?;
                self.alu_op_sub(width, a, b);
            }
            TEST => {
                let a = self.read_operand(bus, instr, &instr.operand1, width)?;
                let b = self.read_operand(bus, instr, &instr.operand2, width)?;
                self.alu_op_and(width, a, b);
            }

            NOT => {
                let a = self.read_dest(bus, instr, width)?;
                self.write_dest(bus, instr, width, !a & width.mask())?;
            }
            NEG => {
                let a = self.read_dest(bus, instr, width)?;
                let result = self.alu_op_neg(width, a);
                self.write_dest(bus, instr, width, result)?;
            }
            INC => {
                let a = self.read_dest(bus, instr, width)?;
                let result = self.alu_op_inc(width, a);
                self.write_dest(bus, instr, width, result)?;
            }
            DEC => {
                let a = self.read_dest(bus, instr, width)?;
                let result = self.alu_op_dec(width, a);
                self.write_dest(bus, instr, width, result)?;
            }

            SHL | SHR | SAR | ROL | ROR | RCL | RCR => {
                let count = match instr.operand2 {
                    OperandType::Immediate(n) => n as u8,
                    _ => self.gpr8(RCX, false),
                };
                let a = self.read_dest(bus, instr, width)?;
                let result = self.alu_op_shift(instr.mnemonic, width, a, count);
                self.write_dest(bus, instr, width, result)?;
            }

            MUL => {
                let src = self.read_operand(bus, instr, &instr.operand1, width)?;
                self.op_mul(width, src);
            }
            IMUL => {
                if let OperandType::Immediate(imm) = instr.operand3 {
                    let src = self.read_operand(bus, instr, &instr.operand2, width)?;
                    let result = self.op_imul_general(width, src, imm);
                    self.write_operand(bus, instr, &instr.operand1, width, result)?;
                }
                else if instr.operand2 != OperandType::NoOperand {
                    let a = self.read_operand(bus, instr, &instr.operand1, width)?;
                    let b = self.read_operand(bus, instr, &instr.operand2, width)?;
                    let result = self.op_imul_general(width, a, b);
                    self.write_operand(bus, instr, &instr.operand1, width, result)?;
                }
                else {
                    let src = self.read_operand(bus, instr, &instr.operand1, width)?;
                    self.op_imul_single(width, src);
                }
            }
            DIV => {
                let src = self.read_operand(bus, instr, &instr.operand1, width)?;
                self.op_div(width, src)?;
            }
            IDIV => {
                let src = self.read_operand(bus, instr, &instr.operand1, width)?;
                self.op_idiv(width, src)?;
            }

            MOV => self.op_mov(bus, instr)?,
            MOVZX | MOVSX | MOVSXD => {
                let raw = self.read_operand(bus, instr, &instr.operand2, instr.width2)?;
                let value = if instr.mnemonic == MOVZX {
                    raw & instr.width2.mask()
                }
                else {
                    sign_extend_from(raw, instr.width2)
                };
                self.write_operand(bus, instr, &instr.operand1, width, value & width.mask())?;
            }
            LEA => {
                if let OperandType::AddressingMode(mode) = instr.operand2 {
                    let ea = self.ea_offset(&mode);
                    self.write_operand(bus, instr, &instr.operand1, width, ea & width.mask())?;
                }
                else {
                    return Err(Fault::ud());
                }
            }

            XCHG => {
                let b = self.read_operand(bus, instr, &instr.operand2, width)?;
                let a = self.read_dest(bus, instr, width)?;
                self.write_dest(bus, instr, width, b)?;
                self.write_operand(bus, instr, &instr.operand2, width, a)?;
            }
            XADD => {
                let src = self.read_operand(bus, instr, &instr.operand2, width)?;
                let dst = self.read_dest(bus, instr, width)?;
                let sum = self.alu_op_add(width, dst, src);
                self.write_dest(bus, instr, width, sum)?;
                self.write_operand(bus, instr, &instr.operand2, width, dst)?;
            }
            CMPXCHG => {
                let acc = self.gpr_width(RAX, width);
                let dst = self.read_dest(bus, instr, width)?;
                self.alu_op_sub(width, acc, dst);
                if self.get_flag(CPU_FLAG_ZERO) {
                    let src = self.read_operand(bus, instr, &instr.operand2, width)?;
                    self.write_dest(bus, instr, width, src)?;
                }
                else {
                    // The destination is still written back, which matters
                    // for the locked memory form
                    self.write_dest(bus, instr, width, dst)?;
                    self.set_gpr_width(RAX, width, dst);
                }
            }
            CMPXCHG8B => {
                let mode = match instr.operand1 {
                    OperandType::AddressingMode(mode) => mode,
                    _ => return Err(Fault::ud()),
                };
                let (seg, ea) = self.operand_ea(instr, &mode);
                let current = self.read_rmw_virtual_width(bus, seg, ea, OperandWidth::Qword)?;
                let expected = ((self.gpr32(RDX) as u64) << 32) | self.gpr32(RAX) as u64;
                if current == expected {
                    let replacement = ((self.gpr32(RCX) as u64) << 32) | self.gpr32(RBX) as u64;
                    self.write_rmw_width(bus, OperandWidth::Qword, replacement)?;
                    self.set_flag(CPU_FLAG_ZERO);
                }
                else {
                    self.write_rmw_width(bus, OperandWidth::Qword, current)?;
                    self.set_gpr32(RAX, current as u32);
                    self.set_gpr32(RDX, (current >> 32) as u32);
                    self.clear_flag(CPU_FLAG_ZERO);
                }
            }

            PUSH => {
                let value = self.read_operand(bus, instr, &instr.operand1, width)?;
                self.push_width(bus, width, value)?;
            }
            POP => match instr.operand1 {
                OperandType::SegmentRegister(seg) => {
                    let selector = self.peek_stack(bus, width, 0)? as u16;
                    self.load_seg_reg(bus, seg, selector)?;
                    self.drop_stack(width, 1, 0);
                    if seg == Segment::SS {
                        self.set_interrupt_inhibit(true);
                    }
                }
                OperandType::AddressingMode(_) => {
                    let value = self.peek_stack(bus, width, 0)?;
                    self.write_operand(bus, instr, &instr.operand1, width, value)?;
                    self.drop_stack(width, 1, 0);
                }
                ref operand => {
                    let value = self.pop_width(bus, width)?;
                    self.write_operand(bus, instr, operand, width, value)?;
                }
            },
            PUSHF => {
                if self.v8086_mode() && self.iopl() < 3 {
                    return Err(Fault::gp(0));
                }
                let image = self.rflags() & !(CPU_FLAG_VM | CPU_FLAG_RF);
                self.push_width(bus, width, image & width.mask())?;
            }
            POPF => {
                if self.v8086_mode() && self.iopl() < 3 {
                    return Err(Fault::gp(0));
                }
                let value = self.pop_width(bus, width)?;
                let change_iopl = self.cpl() == 0;
                let change_if = self.cpl() <= self.iopl();
                self.write_eflags(value, width, change_iopl, change_if, false);
            }

            JMP => {
                let width = self.near_width(width);
                let target = match instr.operand1 {
                    OperandType::Relative(rel) => self.rip().wrapping_add(rel as u64),
                    ref operand => self.read_operand(bus, instr, operand, width)?,
                };
                self.near_branch(target, width)?;
            }
            CALL => {
                let width = self.near_width(width);
                let target = match instr.operand1 {
                    OperandType::Relative(rel) => self.rip().wrapping_add(rel as u64),
                    ref operand => self.read_operand(bus, instr, operand, width)?,
                };
                let dest = target & width.mask();
                self.check_code_target(dest)?;
                let ret = self.rip();
                self.push_width(bus, width, ret)?;
                self.set_rip(dest);
            }
            RETN => {
                let width = self.near_width(width);
                let pop_bytes = match instr.operand1 {
                    OperandType::Immediate(n) => n,
                    _ => 0,
                };
                let target = self.peek_stack(bus, width, 0)? & width.mask();
                self.check_code_target(target)?;
                self.drop_stack(width, 1, pop_bytes);
                self.set_rip(target);
            }

            JMPF => {
                let (selector, offset) = self.read_far_pointer(bus, instr)?;
                self.far_jump(bus, selector, offset, width)?;
            }
            CALLF => {
                let (selector, offset) = self.read_far_pointer(bus, instr)?;
                self.far_call(bus, selector, offset, width)?;
            }
            RETF => {
                let pop_bytes = match instr.operand1 {
                    OperandType::Immediate(n) => n as u16,
                    _ => 0,
                };
                self.far_return(bus, pop_bytes, width)?;
            }
            IRET => {
                self.iret(bus, width)?;
            }

            JO | JNO | JB | JNB | JZ | JNZ | JBE | JNBE | JS | JNS | JP | JNP | JL | JNL | JLE | JNLE => {
                if self.condition(instr.mnemonic) {
                    if let OperandType::Relative(rel) = instr.operand1 {
                        let width = self.near_width(width);
                        self.near_branch(self.rip().wrapping_add(rel as u64), width)?;
                    }
                }
            }

            LOOP | LOOPE | LOOPNE | JCXZ => {
                let mask = addr_mask(instr.addr_size);
                let taken = if instr.mnemonic == JCXZ {
                    self.gpr64(RCX) & mask == 0
                }
                else {
                    let count = (self.gpr64(RCX) & mask).wrapping_sub(1) & mask;
                    self.set_gpr64(RCX, (self.gpr64(RCX) & !mask) | count);
                    match instr.mnemonic {
                        LOOPE => count != 0 && self.get_flag(CPU_FLAG_ZERO),
                        LOOPNE => count != 0 && !self.get_flag(CPU_FLAG_ZERO),
                        _ => count != 0,
                    }
                };
                if taken {
                    if let OperandType::Relative(rel) = instr.operand1 {
                        let width = self.near_width(width);
                        self.near_branch(self.rip().wrapping_add(rel as u64), width)?;
                    }
                }
            }

            INT => {
                let vector = match instr.operand1 {
                    OperandType::Immediate(n) => n as u8,
                    _ => return Err(Fault::ud()),
                };
                self.interrupt(bus, vector, InterruptSource::Software, None)?;
            }
            INT3 => {
                self.interrupt(bus, 3, InterruptSource::Exception, None)?;
            }
            INTO => {
                if self.get_flag(CPU_FLAG_OVERFLOW) {
                    self.interrupt(bus, 4, InterruptSource::Exception, None)?;
                }
            }
            HLT => {
                self.check_supervisor()?;
                self.set_activity(CpuActivity::Halted);
                return Ok(ExecutionResult::Halt);
            }

            CLI => {
                self.check_iopl_sensitive()?;
                self.clear_flag(CPU_FLAG_INT_ENABLE);
            }
            STI => {
                self.check_iopl_sensitive()?;
                if !self.get_flag(CPU_FLAG_INT_ENABLE) {
                    self.set_flag(CPU_FLAG_INT_ENABLE);
                    self.set_interrupt_inhibit(true);
                }
            }
            CLC => self.clear_flag(CPU_FLAG_CARRY),
            STC => self.set_flag(CPU_FLAG_CARRY),
            CMC => {
                let cf = self.get_flag(CPU_FLAG_CARRY);
                self.set_flag_state(CPU_FLAG_CARRY, !cf);
            }
            CLD => self.clear_flag(crate::cpu_x64::CPU_FLAG_DIRECTION),
            STD => self.set_flag(crate::cpu_x64::CPU_FLAG_DIRECTION),

            MOVS | CMPS | STOS | LODS | SCAS | INS | OUTS => {
                self.exec_string(bus, instr)?;
            }
            IN => {
                self.allow_io()?;
                let width = if width == OperandWidth::Qword { OperandWidth::Dword } else { width };
                let port = match instr.operand2 {
                    OperandType::Immediate(n) => n as u16,
                    _ => self.gpr16(RDX),
                };
                let value = match width {
                    OperandWidth::Byte => bus.io_read_u8(port) as u64,
                    OperandWidth::Word => bus.io_read_u16(port) as u64,
                    _ => bus.io_read_u32(port) as u64,
                };
                self.set_gpr_width(RAX, width, value);
            }
            OUT => {
                self.allow_io()?;
                let width = if width == OperandWidth::Qword { OperandWidth::Dword } else { width };
                let port = match instr.operand1 {
                    OperandType::Immediate(n) => n as u16,
                    _ => self.gpr16(RDX),
                };
                let value = self.gpr_width(RAX, width);
                match width {
                    OperandWidth::Byte => bus.io_write_u8(port, value as u8),
                    OperandWidth::Word => bus.io_write_u16(port, value as u16),
                    _ => bus.io_write_u32(port, value as u32),
                }
            }

            LGDT | LIDT => {
                self.check_supervisor()?;
                let mode = match instr.operand1 {
                    OperandType::AddressingMode(mode) => mode,
                    _ => return Err(Fault::ud()),
                };
                let (seg, ea) = self.operand_ea(instr, &mode);
                let limit = self.read_virtual_u16(bus, seg, ea)?;
                let base = if self.long64_mode() {
                    self.read_virtual_u64(bus, seg, ea.wrapping_add(2))?
                }
                else {
                    let base = self.read_virtual_u32(bus, seg, ea.wrapping_add(2))? as u64;
                    if width == OperandWidth::Word {
                        base & 0x00FF_FFFF
                    }
                    else {
                        base
                    }
                };
                let table = GlobalTableRegister { base, limit };
                if instr.mnemonic == LGDT {
                    self.gdtr = table;
                }
                else {
                    self.idtr = table;
                }
            }
            LLDT => {
                if !self.protected_mode() || self.v8086_mode() {
                    return Err(Fault::ud());
                }
                self.check_supervisor()?;
                let selector = self.read_operand(bus, instr, &instr.operand1, OperandWidth::Word)? as u16;
                self.op_lldt(bus, selector)?;
            }
            LTR => {
                if !self.protected_mode() || self.v8086_mode() {
                    return Err(Fault::ud());
                }
                self.check_supervisor()?;
                let selector = self.read_operand(bus, instr, &instr.operand1, OperandWidth::Word)? as u16;
                self.op_ltr(bus, selector)?;
            }
            INVLPG => {
                self.check_supervisor()?;
                let mode = match instr.operand1 {
                    OperandType::AddressingMode(mode) => mode,
                    _ => return Err(Fault::ud()),
                };
                let (seg, ea) = self.operand_ea(instr, &mode);
                let laddr = self.agen(seg, ea, 1)?;
                self.itlb.invlpg(laddr);
                self.dtlb.invlpg(laddr);
            }
            RDMSR => {
                self.check_supervisor()?;
                let value = match self.gpr32(RCX) {
                    MSR_EFER => self.efer(),
                    msr => {
                        log::debug!("rdmsr: unknown msr {:08X}", msr);
                        return Err(Fault::gp(0));
                    }
                };
                self.set_gpr32(RAX, value as u32);
                self.set_gpr32(RDX, (value >> 32) as u32);
            }
            WRMSR => {
                self.check_supervisor()?;
                let value = ((self.gpr32(RDX) as u64) << 32) | self.gpr32(RAX) as u64;
                match self.gpr32(RCX) {
                    MSR_EFER => self.write_efer(value)?,
                    msr => {
                        log::debug!("wrmsr: unknown msr {:08X}", msr);
                        return Err(Fault::gp(0));
                    }
                }
            }

            MOVDQA | MOVDQU => self.op_movdq(bus, instr)?,
            PCMPESTRI | PCMPESTRM | PCMPISTRI | PCMPISTRM => {
                let a = match instr.operand1 {
                    OperandType::Xmm(reg) => self.xmm(reg),
                    _ => return Err(Fault::ud()),
                };
                let b = match instr.operand2 {
                    OperandType::Xmm(reg) => self.xmm(reg),
                    OperandType::AddressingMode(mode) => {
                        let (seg, ea) = self.operand_ea(instr, &mode);
                        self.read_virtual_xmm(bus, seg, ea)?
                    }
                    _ => return Err(Fault::ud()),
                };
                let imm = match instr.operand3 {
                    OperandType::Immediate(n) => n as u8,
                    _ => return Err(Fault::ud()),
                };
                self.op_pcmpstr(instr.mnemonic, a, b, imm);
            }

            InvalidOpcode => return Err(Fault::ud()),
        }
        Ok(ExecutionResult::Okay)
    }

    /* --------------------------- MOV special forms ------------------------- */

    fn op_mov(&mut self, bus: &mut BusInterface, instr: &Instruction) -> CpuResult<()> {
        let width = instr.width;
        match (instr.operand1, instr.operand2) {
            (OperandType::ControlRegister(cr), ref src) => {
                self.check_supervisor()?;
                let value = self.read_operand(bus, instr, src, width)?;
                self.write_cr(cr, value)?;
            }
            (ref dst, OperandType::ControlRegister(cr)) => {
                self.check_supervisor()?;
                let value = self.read_cr(cr)?;
                self.write_operand(bus, instr, dst, width, value)?;
            }
            (OperandType::SegmentRegister(seg), ref src) => {
                let selector = self.read_operand(bus, instr, src, OperandWidth::Word)? as u16;
                self.load_seg_reg(bus, seg, selector)?;
                if seg == Segment::SS {
                    self.set_interrupt_inhibit(true);
                }
            }
            (ref dst, OperandType::SegmentRegister(seg)) => {
                let value = self.seg(seg).selector as u64;
                // Stores to memory are always 16 bits; register destinations
                // zero-extend through their own operand width
                let store_width = if dst.is_memory() { OperandWidth::Word } else { width };
                self.write_operand(bus, instr, dst, store_width, value)?;
            }
            (ref dst, ref src) => {
                let value = self.read_operand(bus, instr, src, width)?;
                self.write_operand(bus, instr, dst, width, value)?;
            }
        }
        Ok(())
    }

    fn op_movdq(&mut self, bus: &mut BusInterface, instr: &Instruction) -> CpuResult<()> {
        let aligned = instr.mnemonic == Mnemonic::MOVDQA;
        match (instr.operand1, instr.operand2) {
            (OperandType::Xmm(dst), OperandType::Xmm(src)) => {
                let value = self.xmm(src);
                self.set_xmm(dst, value);
            }
            (OperandType::Xmm(dst), OperandType::AddressingMode(mode)) => {
                let (seg, ea) = self.operand_ea(instr, &mode);
                self.check_xmm_alignment(seg, ea, aligned)?;
                let value = self.read_virtual_xmm(bus, seg, ea)?;
                self.set_xmm(dst, value);
            }
            (OperandType::AddressingMode(mode), OperandType::Xmm(src)) => {
                let (seg, ea) = self.operand_ea(instr, &mode);
                self.check_xmm_alignment(seg, ea, aligned)?;
                let value = self.xmm(src);
                self.write_virtual_xmm(bus, seg, ea, value)?;
            }
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    fn check_xmm_alignment(&self, seg: Segment, offset: u64, aligned: bool) -> CpuResult<()> {
        if aligned {
            let laddr = self.agen(seg, offset, 16)?;
            if laddr & 0xF != 0 {
                return Err(Fault::gp(0));
            }
        }
        Ok(())
    }

    /* ---------------------------- System loads ----------------------------- */

    fn op_lldt(&mut self, bus: &mut BusInterface, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) {
            // A null LDTR simply makes every LDT-relative selector invalid
            self.ldtr = SystemSegment {
                selector: raw_selector,
                ..SystemSegment::default()
            };
            return Ok(());
        }
        if Selector::from_u16(raw_selector).ti() {
            return Err(Fault::gp(raw_selector));
        }
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::GeneralProtection)?;
        let ldt = match Descriptor::parse(dword1, dword2) {
            Descriptor::System(sys) if sys.is_ldt() => sys,
            _ => return Err(Fault::gp(raw_selector)),
        };
        if !ldt.present {
            return Err(Fault::np(raw_selector));
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

    fn op_ltr(&mut self, bus: &mut BusInterface, raw_selector: u16) -> CpuResult<()> {
        if Selector::is_null(raw_selector) || Selector::from_u16(raw_selector).ti() {
            return Err(Fault::gp(raw_selector));
        }
        let (dword1, dword2) = self.fetch_raw_descriptor(bus, raw_selector, FaultKind::GeneralProtection)?;
        let tss = match Descriptor::parse(dword1, dword2) {
            Descriptor::System(sys) if sys.is_tss() && !sys.is_busy_tss() => sys,
            _ => return Err(Fault::gp(raw_selector)),
        };
        if !tss.present {
            return Err(Fault::np(raw_selector));
        }
        self.set_tss_busy(bus, raw_selector, true)?;
        self.tr = SystemSegment {
            selector: raw_selector,
            base: tss.base,
            limit_scaled: tss.limit_scaled,
            sys_type: tss.sys_type | 0x2,
            valid: true,
        };
        Ok(())
    }

    fn write_efer(&mut self, value: u64) -> CpuResult<()> {
        const WRITABLE: u64 = EFER_SCE | EFER_LME | EFER_NXE;
        if value & !(WRITABLE | EFER_LMA) != 0 {
            return Err(Fault::gp(0));
        }
        // LMA is hardware-managed; flipping it directly is an error, as is
        // leaving long mode while it is active
        if (value ^ self.efer()) & EFER_LMA != 0 {
            return Err(Fault::gp(0));
        }
        if self.long_mode() && value & EFER_LME == 0 {
            return Err(Fault::gp(0));
        }
        self.set_efer((self.efer() & EFER_LMA) | (value & WRITABLE));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_x64::CPU_FLAG_DIRECTION;

    // A real-mode CPU with its code planted at 0000:0100.
    fn setup_real(code: &[u8]) -> (Intel64, BusInterface) {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x20_0000);
        cpu.set_real_mode_segment(Segment::CS, 0x0000);
        cpu.set_real_mode_segment(Segment::SS, 0x0000);
        cpu.set_gpr16(RSP, 0x8000);
        cpu.set_rip(0x100);
        bus.copy_from(code, 0x100).unwrap();
        (cpu, bus)
    }

    #[test]
    fn real_mode_block_executes_and_halts() {
        // mov ax, 0x1234 ; inc ax ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xB8, 0x34, 0x12, 0x40, 0xF4]);
        let result = cpu.step(&mut bus).unwrap();
        assert_eq!(result, ExecutionResult::Halt);
        assert_eq!(cpu.gpr16(RAX), 0x1235);
        assert_eq!(cpu.activity(), CpuActivity::Halted);
        assert_eq!(cpu.instr_count(), 3);
    }

    #[test]
    fn taken_jump_ends_the_trace() {
        // inc ax ; jmp $-1 (back to inc)
        let (mut cpu, mut bus) = setup_real(&[0x40, 0xEB, 0xFD]);
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.gpr16(RAX), 1);
        assert_eq!(cpu.rip(), 0x100);
        // Second pass comes out of the trace cache
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr16(RAX), 2);
    }

    #[test]
    fn memory_rmw_add() {
        // mov ax, 5 ; add [0x2000], ax ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xB8, 0x05, 0x00, 0x01, 0x06, 0x00, 0x20, 0xF4]);
        bus.write_u16(0x2000, 70).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(bus.read_u16(0x2000).unwrap(), 75);
    }

    #[test]
    fn movzx_from_memory() {
        // movzx ax, byte [0x2000] ; hlt
        let (mut cpu, mut bus) = setup_real(&[0x0F, 0xB6, 0x06, 0x00, 0x20, 0xF4]);
        cpu.set_gpr16(RAX, 0xFFFF);
        bus.write_u8(0x2000, 0x80).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr16(RAX), 0x0080);
    }

    #[test]
    fn movsx_sign_extends() {
        // movsx ax, byte [0x2000] ; hlt
        let (mut cpu, mut bus) = setup_real(&[0x0F, 0xBE, 0x06, 0x00, 0x20, 0xF4]);
        bus.write_u8(0x2000, 0x80).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr16(RAX), 0xFF80);
    }

    #[test]
    fn conditional_branch_taken_and_not() {
        // xor ax, ax ; jz +2 ; inc cx ; inc dx ; hlt
        let (mut cpu, mut bus) = setup_real(&[0x31, 0xC0, 0x74, 0x02, 0x41, 0x41, 0x42, 0xF4]);
        cpu.step(&mut bus).unwrap(); // xor, jz taken -> lands on inc dx
        cpu.step(&mut bus).unwrap(); // inc dx, hlt
        assert_eq!(cpu.gpr16(RCX), 0);
        assert_eq!(cpu.gpr16(RDX), 1);
    }

    #[test]
    fn loop_counts_down() {
        // mov cx, 3 ; inc ax ; loop $-1 ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xB9, 0x03, 0x00, 0x40, 0xE2, 0xFD, 0xF4]);
        while cpu.activity() == CpuActivity::Running {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.gpr16(RAX), 3);
        assert_eq!(cpu.gpr16(RCX), 0);
    }

    #[test]
    fn near_call_and_return() {
        // call +1 ; hlt ; inc ax ; ret
        let (mut cpu, mut bus) = setup_real(&[0xE8, 0x01, 0x00, 0xF4, 0x40, 0xC3]);
        cpu.step(&mut bus).unwrap(); // call
        assert_eq!(cpu.rip(), 0x104);
        cpu.step(&mut bus).unwrap(); // inc, ret
        assert_eq!(cpu.rip(), 0x103);
        cpu.step(&mut bus).unwrap(); // hlt
        assert_eq!(cpu.gpr16(RAX), 1);
        assert_eq!(cpu.gpr16(RSP), 0x8000);
    }

    #[test]
    fn self_modifying_store_invalidates_trace() {
        // mov al, 1 ; jmp $
        let (mut cpu, mut bus) = setup_real(&[0xB0, 0x01, 0xEB, 0xFE]);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr8(RAX, false), 1);

        // Rewrite the immediate under the decoded trace
        bus.write_u8(0x101, 0x07).unwrap();
        cpu.set_rip(0x100);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr8(RAX, false), 7);
    }

    #[test]
    fn external_interrupt_through_real_ivt() {
        // jmp $ at 0100, handler hlt at 0400, IVT slot for vector 0x20
        let (mut cpu, mut bus) = setup_real(&[0xEB, 0xFE]);
        bus.write_u16(0x20 * 4, 0x0400).unwrap();
        bus.write_u16(0x20 * 4 + 2, 0x0000).unwrap();
        bus.write_u8(0x400, 0xF4).unwrap();
        cpu.set_flag(CPU_FLAG_INT_ENABLE);

        cpu.step(&mut bus).unwrap();
        cpu.raise_intr(0x20);
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.rip(), 0x400);
        // Return address on the stack points at the spin jump
        assert_eq!(bus.read_u16(0x8000 - 6).unwrap(), 0x100);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.activity(), CpuActivity::Halted);
    }

    #[test]
    fn interrupt_wakes_halted_cpu() {
        let (mut cpu, mut bus) = setup_real(&[0xF4]);
        bus.write_u16(0x21 * 4, 0x0400).unwrap();
        bus.write_u16(0x21 * 4 + 2, 0x0000).unwrap();
        bus.write_u8(0x400, 0xF4).unwrap();
        cpu.set_flag(CPU_FLAG_INT_ENABLE);

        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::Halt);
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::Halt);
        cpu.raise_intr(0x21);
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.activity(), CpuActivity::Running);
    }

    #[test]
    fn sti_shadows_one_interrupt_window() {
        // sti ; hlt -- the interrupt must not preempt before hlt executes
        let (mut cpu, mut bus) = setup_real(&[0xFB, 0xF4]);
        bus.write_u16(0x22 * 4, 0x0400).unwrap();
        bus.write_u16(0x22 * 4 + 2, 0x0000).unwrap();
        bus.write_u8(0x400, 0xF4).unwrap();
        cpu.clear_flag(CPU_FLAG_INT_ENABLE);
        cpu.raise_intr(0x22);

        // IF is clear entering this step, so the vector waits
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::Halt);
        assert_eq!(cpu.rip(), 0x102);
        // The STI shadow still holds for one more boundary
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::Halt);
        // Now the shadow has expired and the vector is taken
        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.rip(), 0x400);
    }

    #[test]
    fn divide_error_rewinds_to_faulting_instruction() {
        // xor cx, cx ; div cx, with a vector 0 handler that halts
        let (mut cpu, mut bus) = setup_real(&[0x31, 0xC9, 0xF7, 0xF1]);
        bus.write_u16(0, 0x0400).unwrap();
        bus.write_u16(2, 0x0000).unwrap();
        bus.write_u8(0x400, 0xF4).unwrap();

        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.rip(), 0x400);
        // The pushed IP names the DIV itself so it can restart
        assert_eq!(bus.read_u16(0x8000 - 6).unwrap(), 0x102);
    }

    #[test]
    fn int_instruction_vectors_and_iret_returns() {
        // int 0x30 ; hlt -- handler: inc ax ; iret
        let (mut cpu, mut bus) = setup_real(&[0xCD, 0x30, 0xF4]);
        bus.write_u16(0x30 * 4, 0x0400).unwrap();
        bus.write_u16(0x30 * 4 + 2, 0x0000).unwrap();
        bus.copy_from(&[0x40, 0xCF], 0x400).unwrap();

        cpu.step(&mut bus).unwrap(); // int
        cpu.step(&mut bus).unwrap(); // inc ; iret
        assert_eq!(cpu.rip(), 0x102);
        cpu.step(&mut bus).unwrap(); // hlt
        assert_eq!(cpu.gpr16(RAX), 1);
        assert_eq!(cpu.activity(), CpuActivity::Halted);
    }

    #[test]
    fn string_rep_and_direction() {
        // cld ; mov cx, 4 ; rep stosb ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xFC, 0xB9, 0x04, 0x00, 0xF3, 0xAA, 0xF4]);
        cpu.set_real_mode_segment(Segment::ES, 0x0000);
        cpu.set_gpr8(RAX, false, 0x5A);
        cpu.set_gpr16(crate::cpu_x64::RDI, 0x3000);
        cpu.step(&mut bus).unwrap();
        for n in 0..4usize {
            assert_eq!(bus.read_u8(0x3000 + n).unwrap(), 0x5A);
        }
        assert!(!cpu.get_flag(CPU_FLAG_DIRECTION));
    }

    #[test]
    fn in_from_unmapped_port_reads_open_bus() {
        // in al, 0x60 ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xE4, 0x60, 0xF4]);
        cpu.set_gpr16(RAX, 0);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr8(RAX, false), 0xFF);
    }

    #[test]
    fn pushf_popf_round_trip_preserves_flags() {
        // stc ; pushf ; clc ; popf ; hlt
        let (mut cpu, mut bus) = setup_real(&[0xF9, 0x9C, 0xF8, 0x9D, 0xF4]);
        cpu.step(&mut bus).unwrap();
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn lgdt_loads_table_register() {
        // lgdt [0x2000] ; hlt
        let (mut cpu, mut bus) = setup_real(&[0x0F, 0x01, 0x16, 0x00, 0x20, 0xF4]);
        bus.write_u16(0x2000, 0x1F7).unwrap();
        bus.write_u32(0x2002, 0x0003_4000).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gdtr.limit, 0x1F7);
        // 16-bit operand size keeps only 24 base bits
        assert_eq!(cpu.gdtr.base, 0x3_4000);
    }

    #[test]
    fn cs_limit_violation_raises_gp() {
        let (mut cpu, mut bus) = setup_real(&[0x90]);
        // Vector 13 handler halts
        bus.write_u16(13 * 4, 0x0400).unwrap();
        bus.write_u16(13 * 4 + 2, 0x0000).unwrap();
        bus.write_u8(0x400, 0xF4).unwrap();
        cpu.seg_mut(Segment::CS).cache.limit_scaled = 0x7F;
        cpu.set_rip(0x100);

        assert_eq!(cpu.step(&mut bus).unwrap(), ExecutionResult::OkayJump);
        assert_eq!(cpu.rip(), 0x400);
    }

    #[test]
    fn xchg_and_cmpxchg() {
        // mov ax, 1 ; mov bx, 2 ; xchg ax, bx ; cmpxchg bx, cx ; hlt
        // After xchg: ax=2, bx=1. cmpxchg: ax==?bx fails -> ax = bx = 1
        let (mut cpu, mut bus) = setup_real(&[
            0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x87, 0xD8, 0x0F, 0xB1, 0xCB, 0xF4,
        ]);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.gpr16(RAX), 1);
        assert_eq!(cpu.gpr16(RBX), 1);
        assert!(!cpu.get_flag(CPU_FLAG_ZERO));
    }
}
