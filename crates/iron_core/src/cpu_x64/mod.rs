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

    cpu_x64::mod.rs

    Implementation of a protected-mode x86 CPU with long mode support:
    architectural state, flag handling and register access. The per-concern
    logic lives in the sibling modules.

*/

#![allow(dead_code)]
#![allow(clippy::unusual_byte_groupings)]

pub mod access;
pub mod alu_ops;
pub mod ctrl_xfer;
pub mod decode;
pub mod descriptor;
pub mod exception;
pub mod execute;
pub mod icache;
pub mod muldiv;
pub mod paging;
pub mod segmentation;
pub mod sse_string;
pub mod stack;
pub mod string_ops;
pub mod task_switch;
pub mod tlb;

use lazy_static::lazy_static;

use crate::{
    bus::BusInterface,
    cpu_common::{OperandWidth, Segment},
    cpu_x64::{
        access::AddressXlation,
        icache::ICache,
        segmentation::{GlobalTableRegister, SegmentRegister, SystemSegment},
        tlb::Tlb,
    },
    tracelogger::TraceLogger,
};

// RFLAGS bits
pub const CPU_FLAG_CARRY: u64 = 0b0000_0000_0000_0001;
pub const CPU_FLAG_RESERVED1: u64 = 0b0000_0000_0000_0010;
pub const CPU_FLAG_PARITY: u64 = 0b0000_0000_0000_0100;
pub const CPU_FLAG_AUX_CARRY: u64 = 0b0000_0000_0001_0000;
pub const CPU_FLAG_ZERO: u64 = 0b0000_0000_0100_0000;
pub const CPU_FLAG_SIGN: u64 = 0b0000_0000_1000_0000;
pub const CPU_FLAG_TRAP: u64 = 0b0000_0001_0000_0000;
pub const CPU_FLAG_INT_ENABLE: u64 = 0b0000_0010_0000_0000;
pub const CPU_FLAG_DIRECTION: u64 = 0b0000_0100_0000_0000;
pub const CPU_FLAG_OVERFLOW: u64 = 0b0000_1000_0000_0000;
pub const CPU_FLAG_IOPL_MASK: u64 = 0b0011_0000_0000_0000;
pub const CPU_FLAG_NT: u64 = 0b0100_0000_0000_0000;
pub const CPU_FLAG_RF: u64 = 0x0001_0000;
pub const CPU_FLAG_VM: u64 = 0x0002_0000;
pub const CPU_FLAG_AC: u64 = 0x0004_0000;
pub const CPU_FLAG_VIF: u64 = 0x0008_0000;
pub const CPU_FLAG_VIP: u64 = 0x0010_0000;
pub const CPU_FLAG_ID: u64 = 0x0020_0000;

pub const CPU_FLAGS_OSZAPC: u64 =
    CPU_FLAG_OVERFLOW | CPU_FLAG_SIGN | CPU_FLAG_ZERO | CPU_FLAG_AUX_CARRY | CPU_FLAG_PARITY | CPU_FLAG_CARRY;

/// Bits that may ever be set in RFLAGS on this model.
pub const CPU_FLAGS_VALID_MASK: u64 = CPU_FLAGS_OSZAPC
    | CPU_FLAG_TRAP
    | CPU_FLAG_INT_ENABLE
    | CPU_FLAG_DIRECTION
    | CPU_FLAG_IOPL_MASK
    | CPU_FLAG_NT
    | CPU_FLAG_RF
    | CPU_FLAG_VM
    | CPU_FLAG_AC
    | CPU_FLAG_VIF
    | CPU_FLAG_VIP
    | CPU_FLAG_ID;

// CR0 bits
pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_PG: u64 = 1 << 31;

// CR4 bits
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_PGE: u64 = 1 << 7;
pub const CR4_SMEP: u64 = 1 << 20;
pub const CR4_SMAP: u64 = 1 << 21;

// EFER bits
pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

pub const MSR_EFER: u32 = 0xC000_0080;

// GPR file indices
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

lazy_static! {
    pub static ref PARITY_TABLE: [bool; 256] = {
        let mut table = [false; 256];
        #[allow(clippy::needless_range_loop)]
        for n in 0..256usize {
            table[n] = (n.count_ones() & 1) == 0;
        }
        table
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuActivity {
    Running,
    Halted,
    Shutdown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Real,
    V8086,
    Protected,
    Compatibility,
    Long64,
}

/// A 128-bit SSE register stored as its byte image. Lane views go through
/// bytemuck so the same storage serves byte, word and qword element access.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Xmm(pub [u8; 16]);

impl Xmm {
    #[inline]
    pub fn u8l(&self, lane: usize) -> u8 {
        self.0[lane]
    }
    #[inline]
    pub fn set_u8l(&mut self, lane: usize, value: u8) {
        self.0[lane] = value;
    }
    #[inline]
    pub fn u16l(&self, lane: usize) -> u16 {
        bytemuck::pod_read_unaligned(&self.0[lane * 2..lane * 2 + 2])
    }
    #[inline]
    pub fn set_u16l(&mut self, lane: usize, value: u16) {
        self.0[lane * 2..lane * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
    #[inline]
    pub fn u64l(&self, lane: usize) -> u64 {
        bytemuck::pod_read_unaligned(&self.0[lane * 8..lane * 8 + 8])
    }
    #[inline]
    pub fn set_u64l(&mut self, lane: usize, value: u64) {
        self.0[lane * 8..lane * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }
}

pub struct Intel64 {
    // General register file
    gpr: [u64; 16],
    rip: u64,
    rflags: u64,
    xmm: [Xmm; 16],

    // Segmentation state
    sregs: [SegmentRegister; 6],
    pub gdtr: GlobalTableRegister,
    pub idtr: GlobalTableRegister,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,
    cpl: u8,

    // Control registers
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    efer: u64,

    // Address translation
    pub(crate) itlb: Tlb,
    pub(crate) dtlb: Tlb,
    pub(crate) address_xlation: AddressXlation,

    // Decoded instruction cache
    pub(crate) icache: ICache,
    pub(crate) smc_generation_seen: u64,

    // Execution state
    activity: CpuActivity,
    intr: Option<u8>,
    inhibit_interrupts: bool,
    pub(crate) fault_depth: u8,
    pub(crate) last_fault_class: Option<crate::cpu_common::FaultClass>,
    instr_count: u64,
    trace_logger: TraceLogger,
}

impl Intel64 {
    pub fn new() -> Intel64 {
        let mut cpu = Intel64 {
            gpr: [0; 16],
            rip: 0,
            rflags: CPU_FLAG_RESERVED1,
            xmm: [Xmm::default(); 16],
            sregs: [SegmentRegister::default(); 6],
            gdtr: GlobalTableRegister::default(),
            idtr: GlobalTableRegister::default(),
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
            cpl: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            itlb: Tlb::new(),
            dtlb: Tlb::new(),
            address_xlation: AddressXlation::default(),
            icache: ICache::new(),
            smc_generation_seen: 0,
            activity: CpuActivity::Running,
            intr: None,
            inhibit_interrupts: false,
            fault_depth: 0,
            last_fault_class: None,
            instr_count: 0,
            trace_logger: TraceLogger::None,
        };
        cpu.reset();
        cpu
    }

    /// Architectural reset state: real mode, CS:IP at the top-of-memory
    /// reset vector.
    pub fn reset(&mut self) {
        self.gpr = [0; 16];
        self.rflags = CPU_FLAG_RESERVED1;
        self.rip = 0xFFF0;
        self.cpl = 0;
        self.cr0 = 0;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.efer = 0;
        for seg in Segment::ALL {
            self.set_real_mode_segment(seg, 0);
        }
        self.set_real_mode_segment(Segment::CS, 0xF000);
        self.sregs[Segment::CS as usize].cache.base = 0xFFFF_0000;
        self.gdtr = GlobalTableRegister { base: 0, limit: 0xFFFF };
        self.idtr = GlobalTableRegister { base: 0, limit: 0x03FF };
        self.ldtr = SystemSegment::default();
        self.tr = SystemSegment::default();
        self.itlb.flush();
        self.dtlb.flush();
        self.icache.flush();
        self.activity = CpuActivity::Running;
        self.intr = None;
        self.inhibit_interrupts = false;
        self.fault_depth = 0;
        self.last_fault_class = None;
    }

    pub fn set_trace_logger(&mut self, logger: TraceLogger) {
        self.trace_logger = logger;
    }

    /// Drop all cached translations and decoded traces. Required after any
    /// memory change that bypassed the bus write path.
    pub fn flush_caches(&mut self) {
        self.itlb.flush();
        self.dtlb.flush();
        self.icache.flush();
    }

    /* ---------------------------- Mode helpers ---------------------------- */

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    pub fn real_mode(&self) -> bool {
        self.cr0 & CR0_PE == 0
    }

    #[inline]
    pub fn v8086_mode(&self) -> bool {
        !self.long_mode() && self.rflags & CPU_FLAG_VM != 0
    }

    #[inline]
    pub fn long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    #[inline]
    pub fn long64_mode(&self) -> bool {
        self.long_mode() && self.sregs[Segment::CS as usize].cache.long
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    pub fn operating_mode(&self) -> OperatingMode {
        if self.real_mode() {
            OperatingMode::Real
        }
        else if self.v8086_mode() {
            OperatingMode::V8086
        }
        else if self.long64_mode() {
            OperatingMode::Long64
        }
        else if self.long_mode() {
            OperatingMode::Compatibility
        }
        else {
            OperatingMode::Protected
        }
    }

    /// Code fetch attributes folded into the trace cache hash, so that
    /// traces decoded under one mode never serve another.
    #[inline]
    pub fn fetch_mode_mask(&self) -> usize {
        let mut mask = 0;
        if self.sregs[Segment::CS as usize].cache.d_b {
            mask |= 0x1;
        }
        if self.long64_mode() {
            mask |= 0x2;
        }
        mask
    }

    #[inline]
    pub fn user_mode(&self) -> bool {
        self.cpl == 3
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    #[inline]
    pub(crate) fn set_cpl(&mut self, cpl: u8) {
        self.cpl = cpl;
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.rflags & CPU_FLAG_IOPL_MASK) >> 12) as u8
    }

    #[inline]
    pub fn activity(&self) -> CpuActivity {
        self.activity
    }

    #[inline]
    pub(crate) fn set_activity(&mut self, activity: CpuActivity) {
        self.activity = activity;
    }

    #[inline]
    pub fn instr_count(&self) -> u64 {
        self.instr_count
    }

    #[inline]
    pub(crate) fn bump_instr_count(&mut self) {
        self.instr_count += 1;
    }

    /// Raise the external interrupt line with a vector. Delivered at the
    /// next instruction boundary when IF permits.
    pub fn raise_intr(&mut self, vector: u8) {
        self.intr = Some(vector);
    }

    #[inline]
    pub(crate) fn pending_intr(&self) -> Option<u8> {
        self.intr
    }

    #[inline]
    pub(crate) fn clear_intr(&mut self) {
        self.intr = None;
    }

    #[inline]
    pub(crate) fn interrupts_inhibited(&self) -> bool {
        self.inhibit_interrupts
    }

    #[inline]
    pub(crate) fn set_interrupt_inhibit(&mut self, state: bool) {
        self.inhibit_interrupts = state;
    }

    /* ------------------------------- Flags -------------------------------- */

    #[inline]
    pub fn get_flag(&self, flag: u64) -> bool {
        self.rflags & flag != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u64) {
        self.rflags |= flag;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u64) {
        self.rflags &= !flag;
    }

    #[inline]
    pub fn set_flag_state(&mut self, flag: u64, state: bool) {
        if state {
            self.rflags |= flag;
        }
        else {
            self.rflags &= !flag;
        }
    }

    #[inline]
    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Replace RFLAGS wholesale, normalizing the fixed bits. Privilege
    /// filtering is the caller's job (POPF/IRET apply their change masks
    /// before calling this).
    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = (value & CPU_FLAGS_VALID_MASK) | CPU_FLAG_RESERVED1;
    }

    pub fn set_szp_flags(&mut self, width: OperandWidth, result: u64) {
        let result = result & width.mask();
        self.set_flag_state(CPU_FLAG_ZERO, result == 0);
        self.set_flag_state(CPU_FLAG_SIGN, result & width.sign_bit() != 0);
        self.set_flag_state(CPU_FLAG_PARITY, PARITY_TABLE[(result & 0xFF) as usize]);
    }

    /* --------------------------- Register access -------------------------- */

    #[inline]
    pub fn gpr64(&self, reg: u8) -> u64 {
        self.gpr[reg as usize]
    }

    #[inline]
    pub fn set_gpr64(&mut self, reg: u8, value: u64) {
        self.gpr[reg as usize] = value;
    }

    #[inline]
    pub fn gpr32(&self, reg: u8) -> u32 {
        self.gpr[reg as usize] as u32
    }

    /// 32-bit writes zero-extend into the full register.
    #[inline]
    pub fn set_gpr32(&mut self, reg: u8, value: u32) {
        self.gpr[reg as usize] = value as u64;
    }

    #[inline]
    pub fn gpr16(&self, reg: u8) -> u16 {
        self.gpr[reg as usize] as u16
    }

    #[inline]
    pub fn set_gpr16(&mut self, reg: u8, value: u16) {
        self.gpr[reg as usize] = (self.gpr[reg as usize] & !0xFFFF) | value as u64;
    }

    #[inline]
    pub fn gpr8(&self, reg: u8, high: bool) -> u8 {
        if high {
            (self.gpr[reg as usize] >> 8) as u8
        }
        else {
            self.gpr[reg as usize] as u8
        }
    }

    #[inline]
    pub fn set_gpr8(&mut self, reg: u8, high: bool, value: u8) {
        if high {
            self.gpr[reg as usize] = (self.gpr[reg as usize] & !0xFF00) | ((value as u64) << 8);
        }
        else {
            self.gpr[reg as usize] = (self.gpr[reg as usize] & !0xFF) | value as u64;
        }
    }

    pub fn gpr_width(&self, reg: u8, width: OperandWidth) -> u64 {
        self.gpr[reg as usize] & width.mask()
    }

    pub fn set_gpr_width(&mut self, reg: u8, width: OperandWidth, value: u64) {
        match width {
            OperandWidth::Byte => self.set_gpr8(reg, false, value as u8),
            OperandWidth::Word => self.set_gpr16(reg, value as u16),
            OperandWidth::Dword => self.set_gpr32(reg, value as u32),
            OperandWidth::Qword => self.set_gpr64(reg, value),
        }
    }

    #[inline]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    #[inline]
    pub fn set_rip(&mut self, value: u64) {
        self.rip = value;
    }

    #[inline]
    pub fn xmm(&self, reg: u8) -> Xmm {
        self.xmm[reg as usize]
    }

    #[inline]
    pub fn set_xmm(&mut self, reg: u8, value: Xmm) {
        self.xmm[reg as usize] = value;
    }

    #[inline]
    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    #[inline]
    pub fn cr2(&self) -> u64 {
        self.cr2
    }

    #[inline]
    pub(crate) fn set_cr2(&mut self, value: u64) {
        self.cr2 = value;
    }

    #[inline]
    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    #[inline]
    pub fn efer(&self) -> u64 {
        self.efer
    }

    #[inline]
    pub(crate) fn set_efer(&mut self, value: u64) {
        self.efer = value;
    }

    #[inline]
    pub fn seg(&self, seg: Segment) -> &SegmentRegister {
        &self.sregs[seg as usize]
    }

    #[inline]
    pub(crate) fn seg_mut(&mut self, seg: Segment) -> &mut SegmentRegister {
        &mut self.sregs[seg as usize]
    }

    /// The TraceLogger sink, for per-instruction execution traces.
    #[inline]
    pub(crate) fn trace(&mut self) -> &mut TraceLogger {
        &mut self.trace_logger
    }

    /* -------------------------- Control registers ------------------------- */

    /// Writes to CR0/CR3/CR4 with the required TLB and mode side effects.
    pub fn write_cr(&mut self, index: u8, value: u64) -> crate::cpu_common::CpuResult<()> {
        use crate::cpu_common::Fault;
        match index {
            0 => {
                let old = self.cr0;
                self.cr0 = value & (CR0_PE | CR0_MP | CR0_EM | CR0_TS | CR0_NE | CR0_WP | CR0_AM | CR0_PG);
                // Entering long mode: paging on with LME set activates LMA
                if self.cr0 & CR0_PG != 0 && self.efer & EFER_LME != 0 {
                    if self.cr4 & CR4_PAE == 0 {
                        self.cr0 = old;
                        return Err(Fault::gp(0));
                    }
                    self.efer |= EFER_LMA;
                }
                else if self.cr0 & CR0_PG == 0 {
                    self.efer &= !EFER_LMA;
                }
                if (old ^ self.cr0) & (CR0_PG | CR0_WP | CR0_PE) != 0 {
                    self.itlb.flush();
                    self.dtlb.flush();
                }
                Ok(())
            }
            2 => {
                self.cr2 = value;
                Ok(())
            }
            3 => {
                self.cr3 = value;
                // MOV CR3 flushes non-global translations
                let pge = self.cr4 & CR4_PGE != 0;
                self.itlb.flush_non_global(pge);
                self.dtlb.flush_non_global(pge);
                Ok(())
            }
            4 => {
                let old = self.cr4;
                self.cr4 = value & (CR4_PSE | CR4_PAE | CR4_PGE | CR4_SMEP | CR4_SMAP);
                // Dropping PAE under long mode is illegal
                if self.efer & EFER_LMA != 0 && self.cr4 & CR4_PAE == 0 {
                    self.cr4 = old;
                    return Err(Fault::gp(0));
                }
                if (old ^ self.cr4) != 0 {
                    self.itlb.flush();
                    self.dtlb.flush();
                }
                Ok(())
            }
            _ => Err(Fault::ud()),
        }
    }

    pub fn read_cr(&self, index: u8) -> crate::cpu_common::CpuResult<u64> {
        use crate::cpu_common::Fault;
        match index {
            0 => Ok(self.cr0),
            2 => Ok(self.cr2),
            3 => Ok(self.cr3),
            4 => Ok(self.cr4),
            _ => Err(Fault::ud()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr32_write_zero_extends() {
        let mut cpu = Intel64::new();
        cpu.set_gpr64(RAX, 0xFFFF_FFFF_FFFF_FFFF);
        cpu.set_gpr32(RAX, 0x1234_5678);
        assert_eq!(cpu.gpr64(RAX), 0x1234_5678);
    }

    #[test]
    fn gpr16_write_preserves_upper() {
        let mut cpu = Intel64::new();
        cpu.set_gpr64(RBX, 0xAAAA_BBBB_CCCC_DDDD);
        cpu.set_gpr16(RBX, 0x1111);
        assert_eq!(cpu.gpr64(RBX), 0xAAAA_BBBB_CCCC_1111);
    }

    #[test]
    fn high_byte_registers() {
        let mut cpu = Intel64::new();
        cpu.set_gpr16(RAX, 0x1234);
        assert_eq!(cpu.gpr8(RAX, true), 0x12);
        cpu.set_gpr8(RAX, true, 0x56);
        assert_eq!(cpu.gpr16(RAX), 0x5634);
    }

    #[test]
    fn reset_enters_real_mode() {
        let cpu = Intel64::new();
        assert!(cpu.real_mode());
        assert_eq!(cpu.rip(), 0xFFF0);
        assert_eq!(cpu.seg(Segment::CS).cache.base, 0xFFFF_0000);
        assert_eq!(cpu.cpl(), 0);
    }

    #[test]
    fn szp_flags() {
        let mut cpu = Intel64::new();
        cpu.set_szp_flags(OperandWidth::Byte, 0x00);
        assert!(cpu.get_flag(CPU_FLAG_ZERO));
        assert!(cpu.get_flag(CPU_FLAG_PARITY));
        assert!(!cpu.get_flag(CPU_FLAG_SIGN));

        cpu.set_szp_flags(OperandWidth::Byte, 0x81);
        assert!(!cpu.get_flag(CPU_FLAG_ZERO));
        assert!(cpu.get_flag(CPU_FLAG_SIGN));
        // 0x81 has two set bits, parity even
        assert!(cpu.get_flag(CPU_FLAG_PARITY));
    }

    #[test]
    fn mov_cr3_flushes_non_global() {
        let mut cpu = Intel64::new();
        cpu.dtlb.fill(0x1000, 0x5000, tlb::TLB_SYS_READ_OK, 0xFFF);
        cpu.write_cr(3, 0x2000).unwrap();
        assert!(cpu.dtlb.lookup(0x1000).is_none());
    }
}
