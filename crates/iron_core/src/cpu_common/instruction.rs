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

    cpu_common::instruction.rs

    The decoded instruction representation stored in the trace cache.

*/

use std::fmt;

use crate::cpu_common::{AddrSize, Mnemonic, OperandType, Segment};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OperandWidth {
    #[inline]
    pub fn bytes(&self) -> u32 {
        match self {
            OperandWidth::Byte => 1,
            OperandWidth::Word => 2,
            OperandWidth::Dword => 4,
            OperandWidth::Qword => 8,
        }
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.bytes() * 8
    }

    #[inline]
    pub fn mask(&self) -> u64 {
        match self {
            OperandWidth::Byte => 0xFF,
            OperandWidth::Word => 0xFFFF,
            OperandWidth::Dword => 0xFFFF_FFFF,
            OperandWidth::Qword => u64::MAX,
        }
    }

    #[inline]
    pub fn sign_bit(&self) -> u64 {
        1u64 << (self.bits() - 1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Instruction {
    pub mnemonic: Mnemonic,
    pub width: OperandWidth,
    /// Source width for the widening moves, where it differs from `width`.
    pub width2: OperandWidth,
    pub addr_size: AddrSize,
    pub prefixes: u32,
    pub segment_override: Option<Segment>,
    pub rex: u8,
    pub size: u8,
    pub operand1: OperandType,
    pub operand2: OperandType,
    pub operand3: OperandType,
}

impl Default for Instruction {
    fn default() -> Instruction {
        Instruction {
            mnemonic: Mnemonic::NOP,
            width: OperandWidth::Dword,
            width2: OperandWidth::Dword,
            addr_size: AddrSize::A32,
            prefixes: 0,
            segment_override: None,
            rex: 0,
            size: 1,
            operand1: OperandType::NoOperand,
            operand2: OperandType::NoOperand,
            operand3: OperandType::NoOperand,
        }
    }
}

impl Instruction {
    #[inline]
    pub fn has_prefix(&self, prefix: u32) -> bool {
        self.prefixes & prefix != 0
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        if self.operand1 != OperandType::NoOperand {
            write!(f, " {:?}", self.operand1)?;
        }
        if self.operand2 != OperandType::NoOperand {
            write!(f, ", {:?}", self.operand2)?;
        }
        Ok(())
    }
}
