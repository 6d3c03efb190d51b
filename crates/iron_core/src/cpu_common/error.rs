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

    cpu_common::error.rs

    Error types for the CPU cores. A Fault is an architectural exception
    that will be delivered to the guest through the IDT; a CpuError is a
    host-level failure that stops the machine.

*/

use std::{error::Error, fmt, fmt::Display};

/// Result type used by every operation that can raise a guest-visible
/// exception. Faults propagate with `?` up to the instruction dispatch
/// boundary, which converts them into IDT delivery.
pub type CpuResult<T> = Result<T, Fault>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackFault,
    GeneralProtection,
    PageFault,
    AlignmentCheck,
}

/// Exception classes used by the double-fault promotion rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Contributory,
    PageFault,
}

impl FaultKind {
    pub fn vector(&self) -> u8 {
        match self {
            FaultKind::DivideError => 0,
            FaultKind::Debug => 1,
            FaultKind::Breakpoint => 3,
            FaultKind::Overflow => 4,
            FaultKind::BoundRange => 5,
            FaultKind::InvalidOpcode => 6,
            FaultKind::DeviceNotAvailable => 7,
            FaultKind::DoubleFault => 8,
            FaultKind::InvalidTss => 10,
            FaultKind::SegmentNotPresent => 11,
            FaultKind::StackFault => 12,
            FaultKind::GeneralProtection => 13,
            FaultKind::PageFault => 14,
            FaultKind::AlignmentCheck => 17,
        }
    }

    pub fn pushes_error_code(&self) -> bool {
        matches!(
            self,
            FaultKind::DoubleFault
                | FaultKind::InvalidTss
                | FaultKind::SegmentNotPresent
                | FaultKind::StackFault
                | FaultKind::GeneralProtection
                | FaultKind::PageFault
                | FaultKind::AlignmentCheck
        )
    }

    pub fn class(&self) -> FaultClass {
        match self {
            FaultKind::DivideError
            | FaultKind::InvalidTss
            | FaultKind::SegmentNotPresent
            | FaultKind::StackFault
            | FaultKind::GeneralProtection => FaultClass::Contributory,
            FaultKind::PageFault => FaultClass::PageFault,
            _ => FaultClass::Benign,
        }
    }
}

/// An architectural exception together with its error code. The error code
/// for selector-sourced faults is the selector with the RPL bits masked;
/// the EXT bit is OR-ed in at delivery time when appropriate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub error_code: u16,
}

impl Fault {
    pub fn de() -> Fault {
        Fault { kind: FaultKind::DivideError, error_code: 0 }
    }
    pub fn db() -> Fault {
        Fault { kind: FaultKind::Debug, error_code: 0 }
    }
    pub fn bp() -> Fault {
        Fault { kind: FaultKind::Breakpoint, error_code: 0 }
    }
    pub fn of() -> Fault {
        Fault { kind: FaultKind::Overflow, error_code: 0 }
    }
    pub fn br() -> Fault {
        Fault { kind: FaultKind::BoundRange, error_code: 0 }
    }
    pub fn ud() -> Fault {
        Fault { kind: FaultKind::InvalidOpcode, error_code: 0 }
    }
    pub fn nm() -> Fault {
        Fault { kind: FaultKind::DeviceNotAvailable, error_code: 0 }
    }
    pub fn ts(selector: u16) -> Fault {
        Fault { kind: FaultKind::InvalidTss, error_code: selector & 0xFFFC }
    }
    pub fn np(selector: u16) -> Fault {
        Fault { kind: FaultKind::SegmentNotPresent, error_code: selector & 0xFFFC }
    }
    pub fn ss(selector: u16) -> Fault {
        Fault { kind: FaultKind::StackFault, error_code: selector & 0xFFFC }
    }
    pub fn gp(selector: u16) -> Fault {
        Fault { kind: FaultKind::GeneralProtection, error_code: selector & 0xFFFC }
    }
    pub fn pf(error_code: u16) -> Fault {
        Fault { kind: FaultKind::PageFault, error_code }
    }
    pub fn ac() -> Fault {
        Fault { kind: FaultKind::AlignmentCheck, error_code: 0 }
    }
    /// Interrupt-vector faults raised during IDT-limit or gate checks carry
    /// `vector*8 + 2 (+ EXT)` as their error code; those callers build the
    /// code themselves.
    pub fn gp_raw(error_code: u16) -> Fault {
        Fault { kind: FaultKind::GeneralProtection, error_code }
    }
    pub fn np_raw(error_code: u16) -> Fault {
        Fault { kind: FaultKind::SegmentNotPresent, error_code }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception {:?} (vector {}) error code {:04X}", self.kind, self.kind.vector(), self.error_code)
    }
}

#[derive(Debug)]
pub enum CpuError {
    InvalidInstructionError(u8, u64),
    UnhandledInstructionError(u8, u64),
    InstructionDecodeError(u64),
    ExecutionError(u64, String),
    Panic(String),
}
impl Error for CpuError {}
impl Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self {
            CpuError::InvalidInstructionError(o, addr) => write!(
                f,
                "An invalid instruction was encountered: {:02X} at address: {:012X}",
                o, addr
            ),
            CpuError::UnhandledInstructionError(o, addr) => write!(
                f,
                "An unhandled instruction was encountered: {:02X} at address: {:012X}",
                o, addr
            ),
            CpuError::InstructionDecodeError(addr) => write!(
                f,
                "An error occurred during instruction decode at address: {:012X}",
                addr
            ),
            CpuError::ExecutionError(addr, err) => {
                write!(f, "An execution error occurred at: {:012X} Message: {}", addr, err)
            }
            CpuError::Panic(msg) => {
                write!(f, "The CPU model entered an inconsistent state: {}", msg)
            }
        }
    }
}
