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

    cpu_common::operands.rs

    Operand representations produced by the decoder and consumed by the
    execution dispatch.

*/

use crate::cpu_common::Segment;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrSize {
    A16,
    A32,
    A64,
}

/// A decoded effective-address expression. The address itself is computed
/// at execution time from the live register file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressingMode {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i64,
    pub rip_relative: bool,
    pub size: AddrSize,
}

impl AddressingMode {
    pub fn direct(disp: i64, size: AddrSize) -> AddressingMode {
        AddressingMode {
            base: None,
            index: None,
            scale: 1,
            disp,
            rip_relative: false,
            size,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OperandType {
    /// 8-bit GPR; `high` selects AH/CH/DH/BH in non-REX encodings.
    Reg8 { reg: u8, high: bool },
    Reg16(u8),
    Reg32(u8),
    Reg64(u8),
    Xmm(u8),
    SegmentRegister(Segment),
    ControlRegister(u8),
    Immediate(u64),
    Relative(i64),
    AddressingMode(AddressingMode),
    FarPointer(u16, u32),
    NoOperand,
}

impl OperandType {
    pub fn is_memory(&self) -> bool {
        matches!(self, OperandType::AddressingMode(_))
    }
}
