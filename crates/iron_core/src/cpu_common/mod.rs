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

    cpu_common::mod.rs

    Types shared between CPU implementations and the rest of the core.

*/

#![allow(dead_code)]

pub mod alu;
pub mod error;
pub mod instruction;
pub mod mnemonic;
pub mod operands;

pub use error::{CpuError, CpuResult, Fault, FaultClass, FaultKind};
pub use instruction::{Instruction, OperandWidth};
pub use mnemonic::Mnemonic;
pub use operands::{AddrSize, AddressingMode, OperandType};

use strum_macros::Display;

// Instruction prefixes
pub const OPCODE_PREFIX_LOCK: u32 = 0b0000_0001;
pub const OPCODE_PREFIX_REPZ: u32 = 0b0000_0010;
pub const OPCODE_PREFIX_REPNZ: u32 = 0b0000_0100;
pub const OPCODE_PREFIX_OPSIZE: u32 = 0b0000_1000;
pub const OPCODE_PREFIX_ADDRSIZE: u32 = 0b0001_0000;
pub const OPCODE_PREFIX_0F: u32 = 0b0010_0000;
pub const OPCODE_PREFIX_REP_MASK: u32 = OPCODE_PREFIX_REPZ | OPCODE_PREFIX_REPNZ;

/// Segment register file indices, in descriptor-cache order.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq)]
pub enum Segment {
    ES = 0,
    CS = 1,
    SS = 2,
    #[default]
    DS = 3,
    FS = 4,
    GS = 5,
}

impl Segment {
    pub const ALL: [Segment; 6] = [Segment::ES, Segment::CS, Segment::SS, Segment::DS, Segment::FS, Segment::GS];

    /// The data segment registers subject to privilege re-validation on an
    /// outer-level return.
    pub const DATA: [Segment; 4] = [Segment::ES, Segment::DS, Segment::FS, Segment::GS];
}

/// How a trace of instructions ended.
#[derive(Debug, Default, PartialEq)]
pub enum ExecutionResult {
    #[default]
    Okay,
    OkayJump,
    Halt,
}
