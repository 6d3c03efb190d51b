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

    cpu_x64::stack.rs

    Stack push and pop. The stack pointer width follows SS.B (or 64-bit
    mode), wraps within that width, and is only committed after the memory
    access succeeds, so a faulting push leaves RSP intact.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{AddrSize, CpuResult, OperandWidth, Segment},
    cpu_x64::{Intel64, RSP},
};

impl Intel64 {
    /// Width of stack pointer arithmetic: 64-bit mode uses RSP, otherwise
    /// SS.B selects ESP or SP.
    #[inline]
    pub(crate) fn stack_addr_size(&self) -> AddrSize {
        if self.long64_mode() {
            AddrSize::A64
        }
        else if self.seg(Segment::SS).cache.d_b {
            AddrSize::A32
        }
        else {
            AddrSize::A16
        }
    }

    #[inline]
    pub(crate) fn stack_ptr(&self) -> u64 {
        match self.stack_addr_size() {
            AddrSize::A16 => self.gpr16(RSP) as u64,
            AddrSize::A32 => self.gpr32(RSP) as u64,
            AddrSize::A64 => self.gpr64(RSP),
        }
    }

    #[inline]
    pub(crate) fn set_stack_ptr(&mut self, value: u64) {
        match self.stack_addr_size() {
            AddrSize::A16 => self.set_gpr16(RSP, value as u16),
            AddrSize::A32 => self.set_gpr32(RSP, value as u32),
            AddrSize::A64 => self.set_gpr64(RSP, value),
        }
    }

    pub(crate) fn wrap_sp(&self, value: u64) -> u64 {
        match self.stack_addr_size() {
            AddrSize::A16 => value & 0xFFFF,
            AddrSize::A32 => value & 0xFFFF_FFFF,
            AddrSize::A64 => value,
        }
    }

    pub(crate) fn push_width(&mut self, bus: &mut BusInterface, width: OperandWidth, value: u64) -> CpuResult<()> {
        let new_sp = self.wrap_sp(self.stack_ptr().wrapping_sub(width.bytes() as u64));
        self.write_virtual_width(bus, Segment::SS, new_sp, width, value)?;
        self.set_stack_ptr(new_sp);
        Ok(())
    }

    pub(crate) fn pop_width(&mut self, bus: &mut BusInterface, width: OperandWidth) -> CpuResult<u64> {
        let sp = self.stack_ptr();
        let value = self.read_virtual_width(bus, Segment::SS, sp, width)?;
        self.set_stack_ptr(self.wrap_sp(sp.wrapping_add(width.bytes() as u64)));
        Ok(value)
    }

    /// Peek at stack slots without moving RSP, used by the far return and
    /// IRET paths which must validate before committing.
    pub(crate) fn peek_stack(&mut self, bus: &mut BusInterface, width: OperandWidth, slot: u64) -> CpuResult<u64> {
        let sp = self.wrap_sp(self.stack_ptr().wrapping_add(slot * width.bytes() as u64));
        self.read_virtual_width(bus, Segment::SS, sp, width)
    }

    /// Discard stack slots after a successful far return.
    pub(crate) fn drop_stack(&mut self, width: OperandWidth, slots: u64, extra_bytes: u64) {
        let sp = self.stack_ptr();
        let new_sp = self.wrap_sp(sp.wrapping_add(slots * width.bytes() as u64 + extra_bytes));
        self.set_stack_ptr(new_sp);
    }
}
