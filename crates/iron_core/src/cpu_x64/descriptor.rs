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

    cpu_x64::descriptor.rs

    Descriptor-table entry parsing. Raw descriptors are decoded once into a
    tagged sum type so the rest of the protection logic can never confuse a
    gate for a segment or read a field that a given descriptor class does
    not have.

*/

// System descriptor types
pub const SYS_SEGMENT_AVAIL_286_TSS: u8 = 1;
pub const SYS_SEGMENT_LDT: u8 = 2;
pub const SYS_SEGMENT_BUSY_286_TSS: u8 = 3;
pub const SYS_SEGMENT_AVAIL_386_TSS: u8 = 9;
pub const SYS_SEGMENT_BUSY_386_TSS: u8 = 11;

// Gate descriptor types
pub const GATE_286_CALL: u8 = 4;
pub const GATE_TASK: u8 = 5;
pub const GATE_286_INTERRUPT: u8 = 6;
pub const GATE_286_TRAP: u8 = 7;
pub const GATE_386_CALL: u8 = 12;
pub const GATE_386_INTERRUPT: u8 = 14;
pub const GATE_386_TRAP: u8 = 15;

// Code/data segment type bits
pub const SEG_TYPE_ACCESSED: u8 = 0x1;
pub const SEG_TYPE_CODE: u8 = 0x8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u64,
    pub limit_scaled: u32,
    pub seg_type: u8,
    pub dpl: u8,
    pub present: bool,
    pub avl: bool,
    pub l: bool,
    pub d_b: bool,
    pub g: bool,
}

impl SegmentDescriptor {
    #[inline]
    pub fn is_code(&self) -> bool {
        self.seg_type & SEG_TYPE_CODE != 0
    }
    #[inline]
    pub fn is_data(&self) -> bool {
        !self.is_code()
    }
    #[inline]
    pub fn accessed(&self) -> bool {
        self.seg_type & SEG_TYPE_ACCESSED != 0
    }
    /// Data segments are always readable; code segments only with the R bit.
    #[inline]
    pub fn readable(&self) -> bool {
        self.is_data() || self.seg_type & 0x2 != 0
    }
    #[inline]
    pub fn writable(&self) -> bool {
        self.is_data() && self.seg_type & 0x2 != 0
    }
    #[inline]
    pub fn conforming(&self) -> bool {
        self.is_code() && self.seg_type & 0x4 != 0
    }
    #[inline]
    pub fn expand_down(&self) -> bool {
        self.is_data() && self.seg_type & 0x4 != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GateDescriptor {
    pub gate_type: u8,
    pub dpl: u8,
    pub present: bool,
    pub selector: u16,
    pub offset: u64,
    pub param_count: u8,
}

impl GateDescriptor {
    #[inline]
    pub fn is_call_gate(&self) -> bool {
        matches!(self.gate_type, GATE_286_CALL | GATE_386_CALL)
    }
    #[inline]
    pub fn is_386_gate(&self) -> bool {
        self.gate_type & 0x8 != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskGateDescriptor {
    pub dpl: u8,
    pub present: bool,
    pub tss_selector: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemDescriptor {
    pub sys_type: u8,
    pub base: u64,
    pub limit_scaled: u32,
    pub dpl: u8,
    pub present: bool,
    pub g: bool,
    pub avl: bool,
}

impl SystemDescriptor {
    #[inline]
    pub fn is_ldt(&self) -> bool {
        self.sys_type == SYS_SEGMENT_LDT
    }
    #[inline]
    pub fn is_tss(&self) -> bool {
        matches!(
            self.sys_type,
            SYS_SEGMENT_AVAIL_286_TSS | SYS_SEGMENT_BUSY_286_TSS | SYS_SEGMENT_AVAIL_386_TSS | SYS_SEGMENT_BUSY_386_TSS
        )
    }
    #[inline]
    pub fn is_busy_tss(&self) -> bool {
        matches!(self.sys_type, SYS_SEGMENT_BUSY_286_TSS | SYS_SEGMENT_BUSY_386_TSS)
    }
    #[inline]
    pub fn is_386_tss(&self) -> bool {
        matches!(self.sys_type, SYS_SEGMENT_AVAIL_386_TSS | SYS_SEGMENT_BUSY_386_TSS)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Segment(SegmentDescriptor),
    Gate(GateDescriptor),
    TaskGate(TaskGateDescriptor),
    System(SystemDescriptor),
    Invalid { raw_type: u8, dpl: u8, present: bool },
}

impl Descriptor {
    /// Decode an 8-byte descriptor from its two raw dwords.
    pub fn parse(dword1: u32, dword2: u32) -> Descriptor {
        let raw_type = ((dword2 >> 8) & 0xF) as u8;
        let s = dword2 & 0x1000 != 0;
        let dpl = ((dword2 >> 13) & 0x3) as u8;
        let present = dword2 & 0x8000 != 0;

        if s {
            // Code or data segment
            let limit = (dword1 & 0xFFFF) | (dword2 & 0x000F_0000);
            let g = dword2 & 0x0080_0000 != 0;
            let limit_scaled = if g { (limit << 12) | 0xFFF } else { limit };
            let base =
                ((dword1 >> 16) | ((dword2 & 0xFF) << 16) | (dword2 & 0xFF00_0000)) as u64;
            return Descriptor::Segment(SegmentDescriptor {
                base,
                limit_scaled,
                seg_type: raw_type,
                dpl,
                present,
                avl: dword2 & 0x0010_0000 != 0,
                l: dword2 & 0x0020_0000 != 0,
                d_b: dword2 & 0x0040_0000 != 0,
                g,
            });
        }

        match raw_type {
            GATE_286_CALL | GATE_286_INTERRUPT | GATE_286_TRAP => Descriptor::Gate(GateDescriptor {
                gate_type: raw_type,
                dpl,
                present,
                selector: (dword1 >> 16) as u16,
                offset: (dword1 & 0xFFFF) as u64,
                param_count: (dword2 & 0x1F) as u8,
            }),
            GATE_386_CALL | GATE_386_INTERRUPT | GATE_386_TRAP => Descriptor::Gate(GateDescriptor {
                gate_type: raw_type,
                dpl,
                present,
                selector: (dword1 >> 16) as u16,
                offset: ((dword1 & 0xFFFF) | (dword2 & 0xFFFF_0000)) as u64,
                param_count: (dword2 & 0x1F) as u8,
            }),
            GATE_TASK => Descriptor::TaskGate(TaskGateDescriptor {
                dpl,
                present,
                tss_selector: (dword1 >> 16) as u16,
            }),
            SYS_SEGMENT_LDT
            | SYS_SEGMENT_AVAIL_286_TSS
            | SYS_SEGMENT_BUSY_286_TSS
            | SYS_SEGMENT_AVAIL_386_TSS
            | SYS_SEGMENT_BUSY_386_TSS => {
                let limit = (dword1 & 0xFFFF) | (dword2 & 0x000F_0000);
                let g = dword2 & 0x0080_0000 != 0;
                let limit_scaled = if g { (limit << 12) | 0xFFF } else { limit };
                let base =
                    ((dword1 >> 16) | ((dword2 & 0xFF) << 16) | (dword2 & 0xFF00_0000)) as u64;
                Descriptor::System(SystemDescriptor {
                    sys_type: raw_type,
                    base,
                    limit_scaled,
                    dpl,
                    present,
                    g,
                    avl: dword2 & 0x0010_0000 != 0,
                })
            }
            _ => Descriptor::Invalid { raw_type, dpl, present },
        }
    }

    /// Decode a 16-byte long-mode system descriptor; dword3 extends the base
    /// (system segments) or the offset (gates) to 64 bits.
    pub fn parse64(dword1: u32, dword2: u32, dword3: u32) -> Descriptor {
        match Descriptor::parse(dword1, dword2) {
            Descriptor::Gate(mut gate) => {
                gate.offset |= (dword3 as u64) << 32;
                Descriptor::Gate(gate)
            }
            Descriptor::System(mut sys) => {
                sys.base |= (dword3 as u64) << 32;
                Descriptor::System(sys)
            }
            other => other,
        }
    }

    pub fn dpl(&self) -> u8 {
        match self {
            Descriptor::Segment(d) => d.dpl,
            Descriptor::Gate(d) => d.dpl,
            Descriptor::TaskGate(d) => d.dpl,
            Descriptor::System(d) => d.dpl,
            Descriptor::Invalid { dpl, .. } => *dpl,
        }
    }

    pub fn present(&self) -> bool {
        match self {
            Descriptor::Segment(d) => d.present,
            Descriptor::Gate(d) => d.present,
            Descriptor::TaskGate(d) => d.present,
            Descriptor::System(d) => d.present,
            Descriptor::Invalid { present, .. } => *present,
        }
    }
}

/// Build the raw dwords of a code/data descriptor. Test support for laying
/// out descriptor tables in guest memory.
#[cfg(test)]
pub fn encode_segment(base: u32, limit: u32, type_byte: u8, flags: u8) -> (u32, u32) {
    let dword1 = ((base & 0xFFFF) << 16) | (limit & 0xFFFF);
    let dword2 = (base & 0xFF00_0000)
        | ((flags as u32 & 0xF) << 20)
        | (limit & 0x000F_0000)
        | ((type_byte as u32) << 8)
        | ((base >> 16) & 0xFF);
    (dword1, dword2)
}
