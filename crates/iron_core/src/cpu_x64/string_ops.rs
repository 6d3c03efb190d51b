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

    cpu_x64::string_ops.rs

    String instructions and their REP forms. The source side honors
    segment overrides; the ES:rDI side never does. A faulting iteration
    leaves rSI/rDI/rCX pointing at the failed element so the instruction
    can restart after the fault is serviced.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{
        AddrSize, CpuResult, Instruction, Mnemonic, OperandWidth, Segment, OPCODE_PREFIX_REPNZ, OPCODE_PREFIX_REPZ,
        OPCODE_PREFIX_REP_MASK,
    },
    cpu_x64::{Intel64, CPU_FLAG_DIRECTION, CPU_FLAG_ZERO, RAX, RCX, RDI, RDX, RSI},
};

#[inline]
fn addr_mask(size: AddrSize) -> u64 {
    match size {
        AddrSize::A16 => 0xFFFF,
        AddrSize::A32 => 0xFFFF_FFFF,
        AddrSize::A64 => u64::MAX,
    }
}

impl Intel64 {
    #[inline]
    fn advance_index(&mut self, reg: u8, size: AddrSize, delta: i64) {
        let mask = addr_mask(size);
        let value = (self.gpr64(reg).wrapping_add(delta as u64)) & mask;
        self.set_gpr64(reg, (self.gpr64(reg) & !mask) | value);
    }

    pub(crate) fn exec_string(&mut self, bus: &mut BusInterface, instr: &Instruction) -> CpuResult<()> {
        // Port I/O string forms never move more than a dword
        let width = match instr.mnemonic {
            Mnemonic::INS | Mnemonic::OUTS if instr.width == OperandWidth::Qword => OperandWidth::Dword,
            _ => instr.width,
        };
        let size = instr.addr_size;
        let mask = addr_mask(size);
        let step = width.bytes() as i64;
        let delta = if self.get_flag(CPU_FLAG_DIRECTION) { -step } else { step };
        let seg_src = instr.segment_override.unwrap_or(Segment::DS);

        let repz = instr.has_prefix(OPCODE_PREFIX_REPZ);
        let repnz = instr.has_prefix(OPCODE_PREFIX_REPNZ);
        let rep = instr.prefixes & OPCODE_PREFIX_REP_MASK != 0;
        let conditional = matches!(instr.mnemonic, Mnemonic::CMPS | Mnemonic::SCAS);

        if matches!(instr.mnemonic, Mnemonic::INS | Mnemonic::OUTS) {
            self.allow_io()?;
        }

        if rep && self.gpr64(RCX) & mask == 0 {
            return Ok(());
        }

        loop {
            let si = self.gpr64(RSI) & mask;
            let di = self.gpr64(RDI) & mask;

            match instr.mnemonic {
                Mnemonic::MOVS => {
                    let value = self.read_virtual_width(bus, seg_src, si, width)?;
                    self.write_virtual_width(bus, Segment::ES, di, width, value)?;
                    self.advance_index(RSI, size, delta);
                    self.advance_index(RDI, size, delta);
                }
                Mnemonic::STOS => {
                    let value = self.gpr_width(RAX, width);
                    self.write_virtual_width(bus, Segment::ES, di, width, value)?;
                    self.advance_index(RDI, size, delta);
                }
                Mnemonic::LODS => {
                    let value = self.read_virtual_width(bus, seg_src, si, width)?;
                    self.set_gpr_width(RAX, width, value);
                    self.advance_index(RSI, size, delta);
                }
                Mnemonic::CMPS => {
                    let lhs = self.read_virtual_width(bus, seg_src, si, width)?;
                    let rhs = self.read_virtual_width(bus, Segment::ES, di, width)?;
                    self.alu_op_sub(width, lhs, rhs);
                    self.advance_index(RSI, size, delta);
                    self.advance_index(RDI, size, delta);
                }
                Mnemonic::SCAS => {
                    let rhs = self.read_virtual_width(bus, Segment::ES, di, width)?;
                    let lhs = self.gpr_width(RAX, width);
                    self.alu_op_sub(width, lhs, rhs);
                    self.advance_index(RDI, size, delta);
                }
                Mnemonic::INS => {
                    let port = self.gpr16(RDX);
                    let value = match width {
                        OperandWidth::Byte => bus.io_read_u8(port) as u64,
                        OperandWidth::Word => bus.io_read_u16(port) as u64,
                        _ => bus.io_read_u32(port) as u64,
                    };
                    self.write_virtual_width(bus, Segment::ES, di, width, value)?;
                    self.advance_index(RDI, size, delta);
                }
                Mnemonic::OUTS => {
                    let port = self.gpr16(RDX);
                    let value = self.read_virtual_width(bus, seg_src, si, width)?;
                    match width {
                        OperandWidth::Byte => bus.io_write_u8(port, value as u8),
                        OperandWidth::Word => bus.io_write_u16(port, value as u16),
                        _ => bus.io_write_u32(port, value as u32),
                    }
                    self.advance_index(RSI, size, delta);
                }
                _ => unreachable!("not a string instruction"),
            }

            if !rep {
                break;
            }
            let count = (self.gpr64(RCX) & mask).wrapping_sub(1) & mask;
            self.set_gpr64(RCX, (self.gpr64(RCX) & !mask) | count);
            if count == 0 {
                break;
            }
            if conditional {
                let zf = self.get_flag(CPU_FLAG_ZERO);
                if (repz && !zf) || (repnz && zf) {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_common::{OPCODE_PREFIX_REPNZ, OPCODE_PREFIX_REPZ};
    use crate::cpu_x64::segmentation::tests::{setup_protected, SEL_DATA0};
    use crate::cpu_x64::CPU_FLAG_CARRY;

    fn string_instr(mnemonic: Mnemonic, width: OperandWidth, prefixes: u32) -> Instruction {
        Instruction {
            mnemonic,
            width,
            addr_size: AddrSize::A32,
            prefixes,
            ..Instruction::default()
        }
    }

    fn setup() -> (Intel64, BusInterface) {
        let (mut cpu, mut bus) = setup_protected();
        cpu.load_seg_reg(&mut bus, Segment::DS, SEL_DATA0).unwrap();
        cpu.load_seg_reg(&mut bus, Segment::ES, SEL_DATA0).unwrap();
        (cpu, bus)
    }

    #[test]
    fn rep_movsb_copies_block() {
        let (mut cpu, mut bus) = setup();
        for i in 0..16u8 {
            bus.write_u8(0x4000 + i as usize, i).unwrap();
        }
        cpu.set_gpr32(RSI, 0x4000);
        cpu.set_gpr32(RDI, 0x5000);
        cpu.set_gpr32(RCX, 16);
        let i = string_instr(Mnemonic::MOVS, OperandWidth::Byte, OPCODE_PREFIX_REPZ);
        cpu.exec_string(&mut bus, &i).unwrap();
        for n in 0..16u8 {
            assert_eq!(bus.read_u8(0x5000 + n as usize).unwrap(), n);
        }
        assert_eq!(cpu.gpr32(RCX), 0);
        assert_eq!(cpu.gpr32(RSI), 0x4010);
        assert_eq!(cpu.gpr32(RDI), 0x5010);
    }

    #[test]
    fn movs_respects_direction_flag() {
        let (mut cpu, mut bus) = setup();
        bus.write_u32(0x4000, 0x11223344).unwrap();
        cpu.set_flag(CPU_FLAG_DIRECTION);
        cpu.set_gpr32(RSI, 0x4000);
        cpu.set_gpr32(RDI, 0x5000);
        let i = string_instr(Mnemonic::MOVS, OperandWidth::Dword, 0);
        cpu.exec_string(&mut bus, &i).unwrap();
        assert_eq!(cpu.gpr32(RSI), 0x3FFC);
        assert_eq!(cpu.gpr32(RDI), 0x4FFC);
    }

    #[test]
    fn rep_stosd_fills() {
        let (mut cpu, mut bus) = setup();
        cpu.set_gpr32(RAX, 0xCAFE_F00D);
        cpu.set_gpr32(RDI, 0x6000);
        cpu.set_gpr32(RCX, 4);
        let i = string_instr(Mnemonic::STOS, OperandWidth::Dword, OPCODE_PREFIX_REPZ);
        cpu.exec_string(&mut bus, &i).unwrap();
        for n in 0..4usize {
            assert_eq!(bus.read_u32(0x6000 + n * 4).unwrap(), 0xCAFE_F00D);
        }
    }

    #[test]
    fn repe_cmpsb_stops_at_mismatch() {
        let (mut cpu, mut bus) = setup();
        bus.copy_from(b"abcdef", 0x4000).unwrap();
        bus.copy_from(b"abcxef", 0x5000).unwrap();
        cpu.set_gpr32(RSI, 0x4000);
        cpu.set_gpr32(RDI, 0x5000);
        cpu.set_gpr32(RCX, 6);
        let i = string_instr(Mnemonic::CMPS, OperandWidth::Byte, OPCODE_PREFIX_REPZ);
        cpu.exec_string(&mut bus, &i).unwrap();
        // Stops after comparing 'd' vs 'x' (the fourth byte)
        assert_eq!(cpu.gpr32(RCX), 2);
        assert_eq!(cpu.gpr32(RSI), 0x4004);
        assert!(!cpu.get_flag(CPU_FLAG_ZERO));
        assert!(cpu.get_flag(CPU_FLAG_CARRY)); // 'd' < 'x'
    }

    #[test]
    fn repne_scasb_finds_byte() {
        let (mut cpu, mut bus) = setup();
        bus.copy_from(b"hello\0world", 0x4000).unwrap();
        cpu.set_gpr8(RAX, false, 0);
        cpu.set_gpr32(RDI, 0x4000);
        cpu.set_gpr32(RCX, 32);
        let i = string_instr(Mnemonic::SCAS, OperandWidth::Byte, OPCODE_PREFIX_REPNZ);
        cpu.exec_string(&mut bus, &i).unwrap();
        // rDI points one past the NUL at offset 5
        assert_eq!(cpu.gpr32(RDI), 0x4006);
        assert!(cpu.get_flag(CPU_FLAG_ZERO));
    }

    #[test]
    fn rep_with_zero_count_is_noop() {
        let (mut cpu, mut bus) = setup();
        cpu.set_gpr32(RCX, 0);
        cpu.set_gpr32(RDI, 0x6000);
        bus.write_u8(0x6000, 0x55).unwrap();
        let i = string_instr(Mnemonic::STOS, OperandWidth::Byte, OPCODE_PREFIX_REPZ);
        cpu.exec_string(&mut bus, &i).unwrap();
        assert_eq!(bus.read_u8(0x6000).unwrap(), 0x55);
        assert_eq!(cpu.gpr32(RDI), 0x6000);
    }

    #[test]
    fn lods_loads_accumulator() {
        let (mut cpu, mut bus) = setup();
        bus.write_u16(0x4000, 0xBEEF).unwrap();
        cpu.set_gpr32(RSI, 0x4000);
        let i = string_instr(Mnemonic::LODS, OperandWidth::Word, 0);
        cpu.exec_string(&mut bus, &i).unwrap();
        assert_eq!(cpu.gpr16(RAX), 0xBEEF);
        assert_eq!(cpu.gpr32(RSI), 0x4002);
    }
}
