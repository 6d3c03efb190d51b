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

    cpu_x64::decode.rs

    Byte decoder for the supported instruction set: legacy prefixes, REX,
    ModRM/SIB effective addresses in all three address sizes, and the one-
    and two-byte opcode maps. The decoder is pure over a fetched byte
    buffer; undefined encodings decode to InvalidOpcode and fault at
    execution time.

*/

use crate::{
    cpu_common::{
        AddrSize, AddressingMode, CpuResult, Fault, Instruction, Mnemonic, OperandType, OperandWidth, Segment,
        OPCODE_PREFIX_ADDRSIZE, OPCODE_PREFIX_LOCK, OPCODE_PREFIX_OPSIZE, OPCODE_PREFIX_REP_MASK,
        OPCODE_PREFIX_REPNZ, OPCODE_PREFIX_REPZ,
    },
    cpu_x64::{RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP},
};

pub const MAX_INSTRUCTION_LENGTH: usize = 15;

const REX_B: u8 = 0x01;
const REX_X: u8 = 0x02;
const REX_R: u8 = 0x04;
const REX_W: u8 = 0x08;

#[derive(Copy, Clone)]
pub struct DecodeParams {
    /// CS.D: 32-bit default operand and address size
    pub cs_d: bool,
    pub long64: bool,
}

/// Jcc mnemonics in opcode order (0x70..0x7F low nibble).
const JCC: [Mnemonic; 16] = [
    Mnemonic::JO,
    Mnemonic::JNO,
    Mnemonic::JB,
    Mnemonic::JNB,
    Mnemonic::JZ,
    Mnemonic::JNZ,
    Mnemonic::JBE,
    Mnemonic::JNBE,
    Mnemonic::JS,
    Mnemonic::JNS,
    Mnemonic::JP,
    Mnemonic::JNP,
    Mnemonic::JL,
    Mnemonic::JNL,
    Mnemonic::JLE,
    Mnemonic::JNLE,
];

const GROUP1: [Mnemonic; 8] = [
    Mnemonic::ADD,
    Mnemonic::OR,
    Mnemonic::ADC,
    Mnemonic::SBB,
    Mnemonic::AND,
    Mnemonic::SUB,
    Mnemonic::XOR,
    Mnemonic::CMP,
];

const SHIFT_GROUP: [Mnemonic; 8] = [
    Mnemonic::ROL,
    Mnemonic::ROR,
    Mnemonic::RCL,
    Mnemonic::RCR,
    Mnemonic::SHL,
    Mnemonic::SHR,
    Mnemonic::SHL, // /6 aliases SAL
    Mnemonic::SAR,
];

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    // Running off the end means the instruction exceeded what the fetch
    // window could legally supply.
    fn u8(&mut self) -> CpuResult<u8> {
        if self.pos >= self.buf.len() || self.pos >= MAX_INSTRUCTION_LENGTH {
            return Err(Fault::gp(0));
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> CpuResult<u16> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> CpuResult<u32> {
        Ok(u32::from_le_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn u64(&mut self) -> CpuResult<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }
}

enum Rm {
    Reg(u8),
    Mem(AddressingMode),
}

/// Decoded ModRM byte with its effective-address expression.
struct ModRm {
    reg: u8,
    rm: Rm,
}

fn modrm(r: &mut Reader, addr_size: AddrSize, rex: u8, long64: bool) -> CpuResult<ModRm> {
    let byte = r.u8()?;
    let md = byte >> 6;
    let reg = ((byte >> 3) & 0x7) | if rex & REX_R != 0 { 8 } else { 0 };
    let rm_bits = byte & 0x7;

    if md == 3 {
        let rm_reg = rm_bits | if rex & REX_B != 0 { 8 } else { 0 };
        return Ok(ModRm {
            reg,
            rm: Rm::Reg(rm_reg),
        });
    }

    if addr_size == AddrSize::A16 {
        // Classic 16-bit base/index pairs
        let (base, index) = match rm_bits {
            0 => (Some(RBX), Some(RSI)),
            1 => (Some(RBX), Some(RDI)),
            2 => (Some(RBP), Some(RSI)),
            3 => (Some(RBP), Some(RDI)),
            4 => (Some(RSI), None),
            5 => (Some(RDI), None),
            6 => (Some(RBP), None),
            _ => (Some(RBX), None),
        };
        let (base, disp) = match md {
            0 => {
                if rm_bits == 6 {
                    // Direct address
                    (None, r.u16()? as i64)
                }
                else {
                    (base, 0)
                }
            }
            1 => (base, r.u8()? as i8 as i64),
            _ => (base, r.u16()? as i16 as i64),
        };
        let index = if base.is_none() && md == 0 && rm_bits == 6 { None } else { index };
        return Ok(ModRm {
            reg,
            rm: Rm::Mem(AddressingMode {
                base,
                index,
                scale: 1,
                disp,
                rip_relative: false,
                size: AddrSize::A16,
            }),
        });
    }

    // 32/64-bit forms
    let mut base = None;
    let mut index = None;
    let mut scale = 1u8;
    let mut rip_relative = false;
    let mut disp: i64 = 0;

    if rm_bits == 4 {
        // SIB
        let sib = r.u8()?;
        let scale_bits = sib >> 6;
        let index_bits = ((sib >> 3) & 0x7) | if rex & REX_X != 0 { 8 } else { 0 };
        let base_bits = (sib & 0x7) | if rex & REX_B != 0 { 8 } else { 0 };
        scale = 1 << scale_bits;
        if index_bits != RSP {
            // index=100b (no REX.X) encodes no index
            index = Some(index_bits);
        }
        if md == 0 && (base_bits & 0x7) == RBP {
            disp = r.u32()? as i32 as i64;
        }
        else {
            base = Some(base_bits);
        }
    }
    else if md == 0 && rm_bits == 5 {
        disp = r.u32()? as i32 as i64;
        if long64 {
            rip_relative = true;
        }
    }
    else {
        base = Some(rm_bits | if rex & REX_B != 0 { 8 } else { 0 });
    }

    match md {
        1 => disp += r.u8()? as i8 as i64,
        2 => disp += r.u32()? as i32 as i64,
        _ => {}
    }

    Ok(ModRm {
        reg,
        rm: Rm::Mem(AddressingMode {
            base,
            index,
            scale,
            disp,
            rip_relative,
            size: addr_size,
        }),
    })
}

fn reg_operand(width: OperandWidth, reg: u8, rex_present: bool) -> OperandType {
    match width {
        OperandWidth::Byte => {
            if !rex_present && (4..8).contains(&reg) {
                OperandType::Reg8 {
                    reg: reg - 4,
                    high: true,
                }
            }
            else {
                OperandType::Reg8 { reg, high: false }
            }
        }
        OperandWidth::Word => OperandType::Reg16(reg),
        OperandWidth::Dword => OperandType::Reg32(reg),
        OperandWidth::Qword => OperandType::Reg64(reg),
    }
}

fn rm_operand(width: OperandWidth, rm: &Rm, rex_present: bool) -> OperandType {
    match rm {
        Rm::Reg(reg) => reg_operand(width, *reg, rex_present),
        Rm::Mem(mode) => OperandType::AddressingMode(*mode),
    }
}

fn seg_from_index(index: u8) -> Option<Segment> {
    match index {
        0 => Some(Segment::ES),
        1 => Some(Segment::CS),
        2 => Some(Segment::SS),
        3 => Some(Segment::DS),
        4 => Some(Segment::FS),
        5 => Some(Segment::GS),
        _ => None,
    }
}

struct Ctx {
    width: OperandWidth,
    addr_size: AddrSize,
    rex: u8,
    rex_present: bool,
    long64: bool,
}

impl Ctx {
    /// Immediate of the operand width; 64-bit operands take a
    /// sign-extended 32-bit immediate except where noted.
    fn imm(&self, r: &mut Reader) -> CpuResult<u64> {
        Ok(match self.width {
            OperandWidth::Byte => r.u8()? as u64,
            OperandWidth::Word => r.u16()? as u64,
            OperandWidth::Dword => r.u32()? as u64,
            OperandWidth::Qword => r.u32()? as i32 as i64 as u64,
        })
    }

    fn rel(&self, r: &mut Reader) -> CpuResult<i64> {
        Ok(match self.width {
            OperandWidth::Word => r.u16()? as i16 as i64,
            _ => r.u32()? as i32 as i64,
        })
    }

    fn reg(&self, reg: u8) -> OperandType {
        reg_operand(self.width, reg, self.rex_present)
    }

    fn rm(&self, rm: &Rm) -> OperandType {
        rm_operand(self.width, rm, self.rex_present)
    }

    fn moffs(&self, r: &mut Reader) -> CpuResult<OperandType> {
        let disp = match self.addr_size {
            AddrSize::A16 => r.u16()? as i64,
            AddrSize::A32 => r.u32()? as i64,
            AddrSize::A64 => r.u64()? as i64,
        };
        Ok(OperandType::AddressingMode(AddressingMode::direct(disp, self.addr_size)))
    }
}

/// Decode a single instruction from a fetched byte window.
pub fn decode(buf: &[u8], params: DecodeParams) -> CpuResult<Instruction> {
    let mut r = Reader::new(buf);
    let mut instr = Instruction::default();
    let mut rex: u8 = 0;
    let mut rex_present = false;

    // Prefix scan; in 64-bit mode a REX byte is only effective when it is
    // the last byte before the opcode.
    let opcode = loop {
        let byte = r.u8()?;
        match byte {
            0xF0 => instr.prefixes |= OPCODE_PREFIX_LOCK,
            0xF2 => {
                instr.prefixes = (instr.prefixes & !OPCODE_PREFIX_REP_MASK) | OPCODE_PREFIX_REPNZ;
            }
            0xF3 => {
                instr.prefixes = (instr.prefixes & !OPCODE_PREFIX_REP_MASK) | OPCODE_PREFIX_REPZ;
            }
            0x66 => instr.prefixes |= OPCODE_PREFIX_OPSIZE,
            0x67 => instr.prefixes |= OPCODE_PREFIX_ADDRSIZE,
            0x26 => instr.segment_override = Some(Segment::ES),
            0x2E => instr.segment_override = Some(Segment::CS),
            0x36 => instr.segment_override = Some(Segment::SS),
            0x3E => instr.segment_override = Some(Segment::DS),
            0x64 => instr.segment_override = Some(Segment::FS),
            0x65 => instr.segment_override = Some(Segment::GS),
            0x40..=0x4F if params.long64 => {
                // Only a REX immediately before the opcode applies; any
                // later prefix voids it via the reset below
                rex = byte & 0x0F;
                rex_present = true;
                continue;
            }
            _ => break byte,
        }
        rex = 0;
        rex_present = false;
    };

    let opsize_prefix = instr.prefixes & OPCODE_PREFIX_OPSIZE != 0;
    let width = if params.long64 {
        if rex & REX_W != 0 {
            OperandWidth::Qword
        }
        else if opsize_prefix {
            OperandWidth::Word
        }
        else {
            OperandWidth::Dword
        }
    }
    else if params.cs_d != opsize_prefix {
        OperandWidth::Dword
    }
    else {
        OperandWidth::Word
    };

    let addrsize_prefix = instr.prefixes & OPCODE_PREFIX_ADDRSIZE != 0;
    let addr_size = if params.long64 {
        if addrsize_prefix {
            AddrSize::A32
        }
        else {
            AddrSize::A64
        }
    }
    else if params.cs_d != addrsize_prefix {
        AddrSize::A32
    }
    else {
        AddrSize::A16
    };

    let mut ctx = Ctx {
        width,
        addr_size,
        rex,
        rex_present,
        long64: params.long64,
    };
    instr.width = width;
    instr.addr_size = addr_size;
    instr.rex = rex;

    // Stack-referencing instructions default to 64-bit operands in 64-bit
    // mode without needing REX.W.
    let stack_width = |ctx: &Ctx| {
        if ctx.long64 && ctx.width != OperandWidth::Word {
            OperandWidth::Qword
        }
        else {
            ctx.width
        }
    };

    match opcode {
        0x0F => decode_0f(&mut r, &mut ctx, &mut instr, params)?,

        // The regular ALU block: op r/m,r; op r,r/m; op acc,imm
        0x00..=0x3D if opcode & 0x07 <= 0x05 && !matches!(opcode, 0x0F | 0x26 | 0x2E | 0x36 | 0x3E) => {
            let mnemonic = GROUP1[(opcode >> 3) as usize];
            decode_alu_form(&mut r, &mut ctx, &mut instr, mnemonic, opcode & 0x07)?;
        }

        // Segment register pushes and pops (legacy modes)
        0x06 | 0x0E | 0x16 | 0x1E if !params.long64 => {
            instr.mnemonic = Mnemonic::PUSH;
            instr.operand1 = OperandType::SegmentRegister(seg_from_index(opcode >> 3).ok_or_else(Fault::ud)?);
        }
        0x07 | 0x17 | 0x1F if !params.long64 => {
            instr.mnemonic = Mnemonic::POP;
            instr.operand1 = OperandType::SegmentRegister(seg_from_index(opcode >> 3).ok_or_else(Fault::ud)?);
        }

        0x40..=0x47 if !params.long64 => {
            instr.mnemonic = Mnemonic::INC;
            instr.operand1 = ctx.reg(opcode & 0x7);
        }
        0x48..=0x4F if !params.long64 => {
            instr.mnemonic = Mnemonic::DEC;
            instr.operand1 = ctx.reg(opcode & 0x7);
        }

        0x50..=0x57 => {
            ctx.width = stack_width(&ctx);
            instr.width = ctx.width;
            instr.mnemonic = Mnemonic::PUSH;
            instr.operand1 = ctx.reg((opcode & 0x7) | if rex & REX_B != 0 { 8 } else { 0 });
        }
        0x58..=0x5F => {
            ctx.width = stack_width(&ctx);
            instr.width = ctx.width;
            instr.mnemonic = Mnemonic::POP;
            instr.operand1 = ctx.reg((opcode & 0x7) | if rex & REX_B != 0 { 8 } else { 0 });
        }

        0x63 if params.long64 => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::MOVSXD;
            instr.width2 = OperandWidth::Dword;
            instr.operand1 = ctx.reg(m.reg);
            instr.operand2 = rm_operand(OperandWidth::Dword, &m.rm, rex_present);
        }

        0x68 => {
            ctx.width = stack_width(&ctx);
            instr.width = ctx.width;
            instr.mnemonic = Mnemonic::PUSH;
            let imm = match instr.width {
                OperandWidth::Word => r.u16()? as u64,
                _ => r.u32()? as i32 as i64 as u64,
            };
            instr.operand1 = OperandType::Immediate(imm);
        }
        0x6A => {
            ctx.width = stack_width(&ctx);
            instr.width = ctx.width;
            instr.mnemonic = Mnemonic::PUSH;
            instr.operand1 = OperandType::Immediate(r.u8()? as i8 as i64 as u64);
        }
        0x69 | 0x6B => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::IMUL;
            instr.operand1 = ctx.reg(m.reg);
            instr.operand2 = ctx.rm(&m.rm);
            let imm = if opcode == 0x6B {
                r.u8()? as i8 as i64 as u64
            }
            else {
                ctx.imm(&mut r)?
            };
            instr.operand3 = OperandType::Immediate(imm);
        }

        0x6C | 0x6D => {
            instr.mnemonic = Mnemonic::INS;
            if opcode == 0x6C {
                instr.width = OperandWidth::Byte;
            }
        }
        0x6E | 0x6F => {
            instr.mnemonic = Mnemonic::OUTS;
            if opcode == 0x6E {
                instr.width = OperandWidth::Byte;
            }
        }

        0x70..=0x7F => {
            instr.mnemonic = JCC[(opcode & 0x0F) as usize];
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }

        0x80 | 0x82 => {
            ctx.width = OperandWidth::Byte;
            instr.width = ctx.width;
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = GROUP1[(m.reg & 0x7) as usize];
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = OperandType::Immediate(r.u8()? as u64);
        }
        0x81 => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = GROUP1[(m.reg & 0x7) as usize];
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = OperandType::Immediate(ctx.imm(&mut r)?);
        }
        0x83 => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = GROUP1[(m.reg & 0x7) as usize];
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = OperandType::Immediate(r.u8()? as i8 as i64 as u64 & ctx.width.mask());
        }

        0x84 | 0x85 => {
            if opcode == 0x84 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::TEST;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = ctx.reg(m.reg);
        }
        0x86 | 0x87 => {
            if opcode == 0x86 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::XCHG;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = ctx.reg(m.reg);
        }

        0x88 | 0x89 | 0x8A | 0x8B => {
            if opcode & 0x01 == 0 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::MOV;
            if opcode & 0x02 == 0 {
                instr.operand1 = ctx.rm(&m.rm);
                instr.operand2 = ctx.reg(m.reg);
            }
            else {
                instr.operand1 = ctx.reg(m.reg);
                instr.operand2 = ctx.rm(&m.rm);
            }
        }

        0x8C | 0x8E => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            let seg = seg_from_index(m.reg & 0x7).ok_or_else(Fault::ud)?;
            instr.mnemonic = Mnemonic::MOV;
            if opcode == 0x8C {
                instr.operand1 = rm_operand(OperandWidth::Word, &m.rm, rex_present);
                instr.operand2 = OperandType::SegmentRegister(seg);
            }
            else {
                if seg == Segment::CS {
                    return Err(Fault::ud());
                }
                instr.operand1 = OperandType::SegmentRegister(seg);
                instr.operand2 = rm_operand(OperandWidth::Word, &m.rm, rex_present);
            }
        }

        0x8D => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            if let Rm::Mem(_) = m.rm {
                instr.mnemonic = Mnemonic::LEA;
                instr.operand1 = ctx.reg(m.reg);
                instr.operand2 = ctx.rm(&m.rm);
            }
            else {
                return Err(Fault::ud());
            }
        }

        0x8F => {
            ctx.width = stack_width(&ctx);
            instr.width = ctx.width;
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = Mnemonic::POP;
            instr.operand1 = ctx.rm(&m.rm);
        }

        0x90 => {
            instr.mnemonic = Mnemonic::NOP;
        }
        0x91..=0x97 => {
            instr.mnemonic = Mnemonic::XCHG;
            instr.operand1 = ctx.reg(RAX);
            instr.operand2 = ctx.reg((opcode & 0x7) | if rex & REX_B != 0 { 8 } else { 0 });
        }

        0x9A if !params.long64 => {
            instr.mnemonic = Mnemonic::CALLF;
            let offset = match width {
                OperandWidth::Word => r.u16()? as u32,
                _ => r.u32()?,
            };
            let selector = r.u16()?;
            instr.operand1 = OperandType::FarPointer(selector, offset);
        }

        0x9C => {
            instr.width = stack_width(&ctx);
            instr.mnemonic = Mnemonic::PUSHF;
        }
        0x9D => {
            instr.width = stack_width(&ctx);
            instr.mnemonic = Mnemonic::POPF;
        }

        0xA0 | 0xA1 | 0xA2 | 0xA3 => {
            if opcode & 0x01 == 0 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::MOV;
            let mem = ctx.moffs(&mut r)?;
            if opcode & 0x02 == 0 {
                instr.operand1 = ctx.reg(RAX);
                instr.operand2 = mem;
            }
            else {
                instr.operand1 = mem;
                instr.operand2 = ctx.reg(RAX);
            }
        }

        0xA4 | 0xA5 => {
            instr.mnemonic = Mnemonic::MOVS;
            if opcode == 0xA4 {
                instr.width = OperandWidth::Byte;
            }
        }
        0xA6 | 0xA7 => {
            instr.mnemonic = Mnemonic::CMPS;
            if opcode == 0xA6 {
                instr.width = OperandWidth::Byte;
            }
        }
        0xA8 | 0xA9 => {
            if opcode == 0xA8 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::TEST;
            instr.operand1 = ctx.reg(RAX);
            instr.operand2 = OperandType::Immediate(ctx.imm(&mut r)?);
        }
        0xAA | 0xAB => {
            instr.mnemonic = Mnemonic::STOS;
            if opcode == 0xAA {
                instr.width = OperandWidth::Byte;
            }
        }
        0xAC | 0xAD => {
            instr.mnemonic = Mnemonic::LODS;
            if opcode == 0xAC {
                instr.width = OperandWidth::Byte;
            }
        }
        0xAE | 0xAF => {
            instr.mnemonic = Mnemonic::SCAS;
            if opcode == 0xAE {
                instr.width = OperandWidth::Byte;
            }
        }

        0xB0..=0xB7 => {
            ctx.width = OperandWidth::Byte;
            instr.width = ctx.width;
            instr.mnemonic = Mnemonic::MOV;
            instr.operand1 = ctx.reg((opcode & 0x7) | if rex & REX_B != 0 { 8 } else { 0 });
            instr.operand2 = OperandType::Immediate(r.u8()? as u64);
        }
        0xB8..=0xBF => {
            instr.mnemonic = Mnemonic::MOV;
            instr.operand1 = ctx.reg((opcode & 0x7) | if rex & REX_B != 0 { 8 } else { 0 });
            // The one form that takes a full 64-bit immediate
            let imm = match width {
                OperandWidth::Word => r.u16()? as u64,
                OperandWidth::Dword => r.u32()? as u64,
                OperandWidth::Qword => r.u64()?,
                OperandWidth::Byte => r.u8()? as u64,
            };
            instr.operand2 = OperandType::Immediate(imm);
        }

        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            if opcode & 0x01 == 0 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.mnemonic = SHIFT_GROUP[(m.reg & 0x7) as usize];
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = match opcode {
                0xC0 | 0xC1 => OperandType::Immediate(r.u8()? as u64),
                0xD0 | 0xD1 => OperandType::Immediate(1),
                _ => OperandType::Reg8 { reg: RCX, high: false },
            };
        }

        0xC2 => {
            instr.mnemonic = Mnemonic::RETN;
            instr.operand1 = OperandType::Immediate(r.u16()? as u64);
        }
        0xC3 => {
            instr.mnemonic = Mnemonic::RETN;
        }
        0xCA => {
            instr.mnemonic = Mnemonic::RETF;
            instr.operand1 = OperandType::Immediate(r.u16()? as u64);
        }
        0xCB => {
            instr.mnemonic = Mnemonic::RETF;
        }

        0xC6 | 0xC7 => {
            if opcode == 0xC6 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            if m.reg & 0x7 != 0 {
                return Err(Fault::ud());
            }
            instr.mnemonic = Mnemonic::MOV;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = OperandType::Immediate(ctx.imm(&mut r)?);
        }

        0xCC => {
            instr.mnemonic = Mnemonic::INT3;
        }
        0xCD => {
            instr.mnemonic = Mnemonic::INT;
            instr.operand1 = OperandType::Immediate(r.u8()? as u64);
        }
        0xCE if !params.long64 => {
            instr.mnemonic = Mnemonic::INTO;
        }
        0xCF => {
            instr.width = stack_width(&ctx);
            instr.mnemonic = Mnemonic::IRET;
        }

        0xE0 => {
            instr.mnemonic = Mnemonic::LOOPNE;
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }
        0xE1 => {
            instr.mnemonic = Mnemonic::LOOPE;
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }
        0xE2 => {
            instr.mnemonic = Mnemonic::LOOP;
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }
        0xE3 => {
            instr.mnemonic = Mnemonic::JCXZ;
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }

        0xE4 | 0xE5 => {
            if opcode == 0xE4 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::IN;
            instr.operand1 = ctx.reg(RAX);
            instr.operand2 = OperandType::Immediate(r.u8()? as u64);
        }
        0xE6 | 0xE7 => {
            if opcode == 0xE6 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::OUT;
            instr.operand1 = OperandType::Immediate(r.u8()? as u64);
            instr.operand2 = ctx.reg(RAX);
        }
        0xEC | 0xED => {
            if opcode == 0xEC {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::IN;
            instr.operand1 = ctx.reg(RAX);
            instr.operand2 = OperandType::Reg16(RDX);
        }
        0xEE | 0xEF => {
            if opcode == 0xEE {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            instr.mnemonic = Mnemonic::OUT;
            instr.operand1 = OperandType::Reg16(RDX);
            instr.operand2 = ctx.reg(RAX);
        }

        0xE8 => {
            instr.mnemonic = Mnemonic::CALL;
            instr.operand1 = OperandType::Relative(ctx.rel(&mut r)?);
        }
        0xE9 => {
            instr.mnemonic = Mnemonic::JMP;
            instr.operand1 = OperandType::Relative(ctx.rel(&mut r)?);
        }
        0xEA if !params.long64 => {
            instr.mnemonic = Mnemonic::JMPF;
            let offset = match width {
                OperandWidth::Word => r.u16()? as u32,
                _ => r.u32()?,
            };
            let selector = r.u16()?;
            instr.operand1 = OperandType::FarPointer(selector, offset);
        }
        0xEB => {
            instr.mnemonic = Mnemonic::JMP;
            instr.operand1 = OperandType::Relative(r.u8()? as i8 as i64);
        }

        0xF4 => {
            instr.mnemonic = Mnemonic::HLT;
        }
        0xF5 => {
            instr.mnemonic = Mnemonic::CMC;
        }
        0xF8 => {
            instr.mnemonic = Mnemonic::CLC;
        }
        0xF9 => {
            instr.mnemonic = Mnemonic::STC;
        }
        0xFA => {
            instr.mnemonic = Mnemonic::CLI;
        }
        0xFB => {
            instr.mnemonic = Mnemonic::STI;
        }
        0xFC => {
            instr.mnemonic = Mnemonic::CLD;
        }
        0xFD => {
            instr.mnemonic = Mnemonic::STD;
        }

        0xF6 | 0xF7 => {
            if opcode == 0xF6 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.operand1 = ctx.rm(&m.rm);
            match m.reg & 0x7 {
                0 | 1 => {
                    instr.mnemonic = Mnemonic::TEST;
                    instr.operand2 = OperandType::Immediate(ctx.imm(&mut r)?);
                }
                2 => instr.mnemonic = Mnemonic::NOT,
                3 => instr.mnemonic = Mnemonic::NEG,
                4 => instr.mnemonic = Mnemonic::MUL,
                5 => instr.mnemonic = Mnemonic::IMUL,
                6 => instr.mnemonic = Mnemonic::DIV,
                _ => instr.mnemonic = Mnemonic::IDIV,
            }
        }

        0xFE => {
            ctx.width = OperandWidth::Byte;
            instr.width = ctx.width;
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            instr.operand1 = ctx.rm(&m.rm);
            match m.reg & 0x7 {
                0 => instr.mnemonic = Mnemonic::INC,
                1 => instr.mnemonic = Mnemonic::DEC,
                _ => return Err(Fault::ud()),
            }
        }
        0xFF => {
            let m = modrm(&mut r, addr_size, rex, params.long64)?;
            match m.reg & 0x7 {
                0 => {
                    instr.mnemonic = Mnemonic::INC;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                1 => {
                    instr.mnemonic = Mnemonic::DEC;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                2 => {
                    ctx.width = stack_width(&ctx);
                    instr.width = ctx.width;
                    instr.mnemonic = Mnemonic::CALL;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                3 => {
                    instr.mnemonic = Mnemonic::CALLF;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                4 => {
                    ctx.width = stack_width(&ctx);
                    instr.width = ctx.width;
                    instr.mnemonic = Mnemonic::JMP;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                5 => {
                    instr.mnemonic = Mnemonic::JMPF;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                6 => {
                    ctx.width = stack_width(&ctx);
                    instr.width = ctx.width;
                    instr.mnemonic = Mnemonic::PUSH;
                    instr.operand1 = ctx.rm(&m.rm);
                }
                _ => return Err(Fault::ud()),
            }
            // Far forms through FF take a memory pointer only
            if matches!(instr.mnemonic, Mnemonic::CALLF | Mnemonic::JMPF) && !instr.operand1.is_memory() {
                return Err(Fault::ud());
            }
        }

        _ => {
            instr.mnemonic = Mnemonic::InvalidOpcode;
        }
    }

    instr.size = r.pos as u8;
    Ok(instr)
}

fn decode_alu_form(
    r: &mut Reader,
    ctx: &mut Ctx,
    instr: &mut Instruction,
    mnemonic: Mnemonic,
    form: u8,
) -> CpuResult<()> {
    instr.mnemonic = mnemonic;
    if matches!(form, 0 | 2 | 4) {
        ctx.width = OperandWidth::Byte;
        instr.width = ctx.width;
    }
    match form {
        0 | 1 => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = ctx.reg(m.reg);
        }
        2 | 3 => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.operand1 = ctx.reg(m.reg);
            instr.operand2 = ctx.rm(&m.rm);
        }
        _ => {
            instr.operand1 = ctx.reg(RAX);
            instr.operand2 = OperandType::Immediate(ctx.imm(r)?);
        }
    }
    Ok(())
}

fn decode_0f(r: &mut Reader, ctx: &mut Ctx, instr: &mut Instruction, params: DecodeParams) -> CpuResult<()> {
    let opcode = r.u8()?;
    match opcode {
        0x00 => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.operand1 = rm_operand(OperandWidth::Word, &m.rm, ctx.rex_present);
            match m.reg & 0x7 {
                2 => instr.mnemonic = Mnemonic::LLDT,
                3 => instr.mnemonic = Mnemonic::LTR,
                _ => instr.mnemonic = Mnemonic::InvalidOpcode,
            }
        }
        0x01 => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.operand1 = ctx.rm(&m.rm);
            match m.reg & 0x7 {
                2 => instr.mnemonic = Mnemonic::LGDT,
                3 => instr.mnemonic = Mnemonic::LIDT,
                7 => instr.mnemonic = Mnemonic::INVLPG,
                _ => instr.mnemonic = Mnemonic::InvalidOpcode,
            }
            if !instr.operand1.is_memory() && instr.mnemonic != Mnemonic::InvalidOpcode {
                return Err(Fault::ud());
            }
        }

        0x20 | 0x22 => {
            // MOV to/from control registers; mod bits are ignored and the
            // rm field always names a register
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            let gpr = match m.rm {
                Rm::Reg(reg) => reg,
                Rm::Mem(_) => return Err(Fault::ud()),
            };
            let gpr_width = if params.long64 {
                OperandWidth::Qword
            }
            else {
                OperandWidth::Dword
            };
            instr.mnemonic = Mnemonic::MOV;
            if opcode == 0x20 {
                instr.operand1 = reg_operand(gpr_width, gpr, ctx.rex_present);
                instr.operand2 = OperandType::ControlRegister(m.reg);
            }
            else {
                instr.operand1 = OperandType::ControlRegister(m.reg);
                instr.operand2 = reg_operand(gpr_width, gpr, ctx.rex_present);
            }
        }

        0x30 => instr.mnemonic = Mnemonic::WRMSR,
        0x32 => instr.mnemonic = Mnemonic::RDMSR,

        0x3A => {
            let sub = r.u8()?;
            if instr.prefixes & OPCODE_PREFIX_OPSIZE == 0 {
                instr.mnemonic = Mnemonic::InvalidOpcode;
                return Ok(());
            }
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = match sub {
                0x60 => Mnemonic::PCMPESTRM,
                0x61 => Mnemonic::PCMPESTRI,
                0x62 => Mnemonic::PCMPISTRM,
                0x63 => Mnemonic::PCMPISTRI,
                _ => {
                    instr.mnemonic = Mnemonic::InvalidOpcode;
                    return Ok(());
                }
            };
            instr.operand1 = OperandType::Xmm(m.reg);
            instr.operand2 = match m.rm {
                Rm::Reg(reg) => OperandType::Xmm(reg),
                Rm::Mem(mode) => OperandType::AddressingMode(mode),
            };
            instr.operand3 = OperandType::Immediate(r.u8()? as u64);
        }

        0x6F | 0x7F => {
            let aligned = instr.prefixes & OPCODE_PREFIX_OPSIZE != 0;
            let unaligned = instr.prefixes & OPCODE_PREFIX_REPZ != 0;
            if !aligned && !unaligned {
                instr.mnemonic = Mnemonic::InvalidOpcode;
                return Ok(());
            }
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = if aligned { Mnemonic::MOVDQA } else { Mnemonic::MOVDQU };
            let rm = match m.rm {
                Rm::Reg(reg) => OperandType::Xmm(reg),
                Rm::Mem(mode) => OperandType::AddressingMode(mode),
            };
            if opcode == 0x6F {
                instr.operand1 = OperandType::Xmm(m.reg);
                instr.operand2 = rm;
            }
            else {
                instr.operand1 = rm;
                instr.operand2 = OperandType::Xmm(m.reg);
            }
        }

        0x80..=0x8F => {
            instr.mnemonic = JCC[(opcode & 0x0F) as usize];
            instr.operand1 = OperandType::Relative(ctx.rel(r)?);
        }

        0xA0 => {
            instr.mnemonic = Mnemonic::PUSH;
            instr.operand1 = OperandType::SegmentRegister(Segment::FS);
        }
        0xA1 => {
            instr.mnemonic = Mnemonic::POP;
            instr.operand1 = OperandType::SegmentRegister(Segment::FS);
        }
        0xA8 => {
            instr.mnemonic = Mnemonic::PUSH;
            instr.operand1 = OperandType::SegmentRegister(Segment::GS);
        }
        0xA9 => {
            instr.mnemonic = Mnemonic::POP;
            instr.operand1 = OperandType::SegmentRegister(Segment::GS);
        }

        0xAF => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = Mnemonic::IMUL;
            instr.operand1 = ctx.reg(m.reg);
            instr.operand2 = ctx.rm(&m.rm);
        }

        0xB0 | 0xB1 => {
            if opcode == 0xB0 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = Mnemonic::CMPXCHG;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = ctx.reg(m.reg);
        }

        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = if opcode & 0x08 == 0 { Mnemonic::MOVZX } else { Mnemonic::MOVSX };
            instr.operand1 = ctx.reg(m.reg);
            let src_width = if opcode & 0x01 == 0 { OperandWidth::Byte } else { OperandWidth::Word };
            instr.width2 = src_width;
            instr.operand2 = rm_operand(src_width, &m.rm, ctx.rex_present);
        }

        0xC0 | 0xC1 => {
            if opcode == 0xC0 {
                ctx.width = OperandWidth::Byte;
                instr.width = ctx.width;
            }
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            instr.mnemonic = Mnemonic::XADD;
            instr.operand1 = ctx.rm(&m.rm);
            instr.operand2 = ctx.reg(m.reg);
        }

        0xC7 => {
            let m = modrm(r, ctx.addr_size, ctx.rex, ctx.long64)?;
            if m.reg & 0x7 != 1 || !matches!(m.rm, Rm::Mem(_)) {
                return Err(Fault::ud());
            }
            instr.mnemonic = Mnemonic::CMPXCHG8B;
            instr.operand1 = ctx.rm(&m.rm);
        }

        _ => {
            instr.mnemonic = Mnemonic::InvalidOpcode;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const P32: DecodeParams = DecodeParams {
        cs_d: true,
        long64: false,
    };
    const P16: DecodeParams = DecodeParams {
        cs_d: false,
        long64: false,
    };
    const P64: DecodeParams = DecodeParams {
        cs_d: false,
        long64: true,
    };

    #[test]
    fn add_rm32_r32() {
        // add [ebx+8], ecx
        let i = decode(&[0x01, 0x4B, 0x08], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::ADD);
        assert_eq!(i.size, 3);
        assert_eq!(i.width, OperandWidth::Dword);
        match i.operand1 {
            OperandType::AddressingMode(m) => {
                assert_eq!(m.base, Some(RBX));
                assert_eq!(m.disp, 8);
            }
            _ => panic!("expected memory operand"),
        }
        assert_eq!(i.operand2, OperandType::Reg32(RCX));
    }

    #[test]
    fn opsize_prefix_toggles_width() {
        let i = decode(&[0x66, 0x01, 0xD8], P32).unwrap();
        assert_eq!(i.width, OperandWidth::Word);
        let i = decode(&[0x66, 0x01, 0xD8], P16).unwrap();
        assert_eq!(i.width, OperandWidth::Dword);
    }

    #[test]
    fn modrm16_bp_si() {
        // mov ax, [bp+si+0x10]
        let i = decode(&[0x8B, 0x42, 0x10], P16).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::MOV);
        match i.operand2 {
            OperandType::AddressingMode(m) => {
                assert_eq!(m.base, Some(RBP));
                assert_eq!(m.index, Some(RSI));
                assert_eq!(m.disp, 0x10);
                assert_eq!(m.size, AddrSize::A16);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn modrm16_direct() {
        // mov ax, [0x1234]
        let i = decode(&[0x8B, 0x06, 0x34, 0x12], P16).unwrap();
        match i.operand2 {
            OperandType::AddressingMode(m) => {
                assert_eq!(m.base, None);
                assert_eq!(m.index, None);
                assert_eq!(m.disp, 0x1234);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn sib_scaled_index() {
        // mov eax, [ebx+esi*4+0x20]
        let i = decode(&[0x8B, 0x44, 0xB3, 0x20], P32).unwrap();
        match i.operand2 {
            OperandType::AddressingMode(m) => {
                assert_eq!(m.base, Some(RBX));
                assert_eq!(m.index, Some(RSI));
                assert_eq!(m.scale, 4);
                assert_eq!(m.disp, 0x20);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn rex_w_and_extended_regs() {
        // add r8, rax => REX.WB 01 C0
        let i = decode(&[0x49, 0x01, 0xC0], P64).unwrap();
        assert_eq!(i.width, OperandWidth::Qword);
        assert_eq!(i.operand1, OperandType::Reg64(8));
        assert_eq!(i.operand2, OperandType::Reg64(RAX));
    }

    #[test]
    fn rex_before_legacy_prefix_is_voided() {
        // REX ahead of an operand-size prefix still decodes: mov ax, ax
        let i = decode(&[0x40, 0x66, 0x89, 0xC0], P64).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::MOV);
        assert_eq!(i.width, OperandWidth::Word);
        // The early REX.B carries no register extension either
        let i = decode(&[0x41, 0x66, 0x89, 0xC0], P64).unwrap();
        assert_eq!(i.operand1, OperandType::Reg16(RAX));
        // Only a REX directly before the opcode applies
        let i = decode(&[0x66, 0x41, 0x89, 0xC0], P64).unwrap();
        assert_eq!(i.operand1, OperandType::Reg16(8));
    }

    #[test]
    fn rip_relative_in_long_mode() {
        // mov rax, [rip+0x100]
        let i = decode(&[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00], P64).unwrap();
        match i.operand2 {
            OperandType::AddressingMode(m) => {
                assert!(m.rip_relative);
                assert_eq!(m.disp, 0x100);
            }
            _ => panic!("expected memory operand"),
        }
    }

    #[test]
    fn high_byte_regs_without_rex() {
        // mov ah, bl
        let i = decode(&[0x88, 0xDC], P32).unwrap();
        assert_eq!(i.operand1, OperandType::Reg8 { reg: RAX, high: true });
        assert_eq!(i.operand2, OperandType::Reg8 { reg: RBX, high: false });
        // With REX, the same encoding names SPL
        let i = decode(&[0x40, 0x88, 0xDC], P64).unwrap();
        assert_eq!(i.operand1, OperandType::Reg8 { reg: RSP, high: false });
    }

    #[test]
    fn push_defaults_to_64_in_long_mode() {
        let i = decode(&[0x50], P64).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::PUSH);
        assert_eq!(i.operand1, OperandType::Reg64(RAX));
    }

    #[test]
    fn group3_div() {
        // div ecx
        let i = decode(&[0xF7, 0xF1], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::DIV);
        assert_eq!(i.operand1, OperandType::Reg32(RCX));
        // idiv bl
        let i = decode(&[0xF6, 0xFB], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::IDIV);
        assert_eq!(i.width, OperandWidth::Byte);
    }

    #[test]
    fn group1_imm8_sign_extends() {
        // sub eax, -1 via 83 /5
        let i = decode(&[0x83, 0xE8, 0xFF], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::SUB);
        assert_eq!(i.operand2, OperandType::Immediate(0xFFFF_FFFF));
    }

    #[test]
    fn far_jump_direct() {
        // jmp 0x0008:0x1000
        let i = decode(&[0xEA, 0x00, 0x10, 0x00, 0x00, 0x08, 0x00], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::JMPF);
        assert_eq!(i.operand1, OperandType::FarPointer(0x0008, 0x1000));
    }

    #[test]
    fn jcc_rel8_and_rel32() {
        let i = decode(&[0x74, 0xFE], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::JZ);
        assert_eq!(i.operand1, OperandType::Relative(-2));
        let i = decode(&[0x0F, 0x85, 0x00, 0x02, 0x00, 0x00], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::JNZ);
        assert_eq!(i.operand1, OperandType::Relative(0x200));
    }

    #[test]
    fn rep_prefix_recorded() {
        let i = decode(&[0xF3, 0xA4], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::MOVS);
        assert_eq!(i.width, OperandWidth::Byte);
        assert!(i.has_prefix(OPCODE_PREFIX_REPZ));
    }

    #[test]
    fn pcmpistri_decodes() {
        // 66 0F 3A 63 C1 0C => pcmpistri xmm0, xmm1, 0x0C
        let i = decode(&[0x66, 0x0F, 0x3A, 0x63, 0xC1, 0x0C], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::PCMPISTRI);
        assert_eq!(i.operand1, OperandType::Xmm(0));
        assert_eq!(i.operand2, OperandType::Xmm(1));
        assert_eq!(i.operand3, OperandType::Immediate(0x0C));
    }

    #[test]
    fn movdqa_vs_movdqu() {
        let i = decode(&[0x66, 0x0F, 0x6F, 0x00], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::MOVDQA);
        let i = decode(&[0xF3, 0x0F, 0x6F, 0x00], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::MOVDQU);
    }

    #[test]
    fn lgdt_requires_memory_operand() {
        assert!(decode(&[0x0F, 0x01, 0xD0], P32).is_err());
        let i = decode(&[0x0F, 0x01, 0x16, 0x00, 0x20], P16).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::LGDT);
    }

    #[test]
    fn mov_imm64() {
        let i = decode(
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            P64,
        )
        .unwrap();
        assert_eq!(i.operand2, OperandType::Immediate(0x1122_3344_5566_7788));
        assert_eq!(i.size, 10);
    }

    #[test]
    fn mov_to_cs_is_invalid() {
        assert!(decode(&[0x8E, 0xC8], P32).is_err());
    }

    #[test]
    fn undefined_opcode_marks_invalid() {
        let i = decode(&[0xD6], P32).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::InvalidOpcode);
    }

    #[test]
    fn truncated_instruction_errors() {
        assert!(decode(&[0x81, 0xC0, 0x01], P32).is_err());
    }
}
