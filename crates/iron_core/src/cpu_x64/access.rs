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

    cpu_x64::access.rs

    The segment-checked memory access layer. Every guest data access flows
    through here: segment limit and attribute checks, linear address
    generation with canonical checks in 64-bit mode, page-split handling,
    and the saved translation used by read-modify-write instructions.

*/

use crate::{
    bus::BusInterface,
    cpu_common::{CpuResult, Fault, OperandWidth, Segment},
    cpu_x64::{
        paging::AccessType,
        segmentation::{SEG_ACCESS_ROK4G, SEG_ACCESS_WOK4G},
        Intel64, Xmm, CPU_FLAG_AC, CR0_AM,
    },
};

/// Physical translation saved by the read half of a read-modify-write
/// access so the write half cannot fault or re-translate.
#[derive(Copy, Clone, Debug, Default)]
pub struct AddressXlation {
    pub paddr1: u64,
    pub paddr2: u64,
    pub len1: u32,
    pub len2: u32,
    pub pages: u32,
}

#[inline]
pub fn is_canonical(laddr: u64) -> bool {
    ((laddr as i64) << 16 >> 16) == laddr as i64
}

impl Intel64 {
    /// Segment violations report #SS for SS-relative accesses, #GP for
    /// everything else.
    #[inline]
    pub(crate) fn seg_fault(&self, seg: Segment) -> Fault {
        if seg == Segment::SS {
            Fault::ss(0)
        }
        else {
            Fault::gp(0)
        }
    }

    #[inline]
    fn alignment_check_active(&self) -> bool {
        self.cr0() & CR0_AM != 0 && self.get_flag(CPU_FLAG_AC) && self.cpl() == 3
    }

    /* ------------------------- Segment limit checks ------------------------ */

    pub(crate) fn read_virtual_checks(&self, seg: Segment, offset: u64, length: u32) -> CpuResult<()> {
        if self.long64_mode() {
            return Ok(());
        }
        let cache = &self.seg(seg).cache;
        if cache.access & SEG_ACCESS_ROK4G != 0 {
            return Ok(());
        }
        if !cache.valid || !cache.present {
            log::debug!("read_virtual_checks: segment {} not usable", seg);
            return Err(self.seg_fault(seg));
        }
        if !cache.readable() {
            log::debug!("read_virtual_checks: execute-only segment {}", seg);
            return Err(self.seg_fault(seg));
        }
        self.limit_check(seg, offset, length)
    }

    pub(crate) fn write_virtual_checks(&self, seg: Segment, offset: u64, length: u32) -> CpuResult<()> {
        if self.long64_mode() {
            return Ok(());
        }
        let cache = &self.seg(seg).cache;
        if cache.access & SEG_ACCESS_WOK4G != 0 {
            return Ok(());
        }
        if !cache.valid || !cache.present {
            log::debug!("write_virtual_checks: segment {} not usable", seg);
            return Err(self.seg_fault(seg));
        }
        if !cache.writable() {
            log::debug!("write_virtual_checks: segment {} not writable", seg);
            return Err(self.seg_fault(seg));
        }
        self.limit_check(seg, offset, length)
    }

    /// The length-1 limit check, in both normal and expand-down forms.
    fn limit_check(&self, seg: Segment, offset: u64, length: u32) -> CpuResult<()> {
        let cache = &self.seg(seg).cache;
        let length = (length - 1) as u64;
        let limit = cache.limit_scaled as u64;

        if cache.expand_down() {
            let upper_limit: u64 = if cache.d_b { 0xFFFF_FFFF } else { 0xFFFF };
            if offset <= limit || offset > upper_limit || (upper_limit - offset) < length {
                log::debug!("limit_check: expand-down violation in {}", seg);
                return Err(self.seg_fault(seg));
            }
        }
        else if length > limit || offset > limit - length {
            log::debug!(
                "limit_check: offset {:X} len {:X} beyond limit {:X} in {}",
                offset,
                length + 1,
                limit,
                seg
            );
            return Err(self.seg_fault(seg));
        }
        Ok(())
    }

    /* ------------------------- Linear address build ------------------------ */

    /// Build the linear address for a segment-relative access. In 64-bit
    /// mode only FS/GS carry a base and the result must be canonical.
    pub(crate) fn agen(&self, seg: Segment, offset: u64, length: u32) -> CpuResult<u64> {
        if self.long64_mode() {
            let base = match seg {
                Segment::FS | Segment::GS => self.seg(seg).cache.base,
                _ => 0,
            };
            let laddr = base.wrapping_add(offset);
            if !is_canonical(laddr) || !is_canonical(laddr.wrapping_add(length as u64 - 1)) {
                log::debug!("agen: non-canonical access at {:X}", laddr);
                return Err(self.seg_fault(seg));
            }
            Ok(laddr)
        }
        else {
            Ok(self.seg(seg).cache.base.wrapping_add(offset) & 0xFFFF_FFFF)
        }
    }

    /* ----------------------------- Linear layer ---------------------------- */

    pub(crate) fn read_linear(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        user: bool,
        buf: &mut [u8],
    ) -> CpuResult<()> {
        let len = buf.len() as u64;
        let page_remain = 0x1000 - (laddr & 0xFFF);
        if len <= page_remain {
            let paddr = self.translate_linear(bus, laddr, user, AccessType::Read)?;
            bus.read_bytes(paddr as usize, buf).map_err(|_| Fault::gp(0))?;
        }
        else {
            // Page split: translate both halves before reading either
            let paddr1 = self.translate_linear(bus, laddr, user, AccessType::Read)?;
            let paddr2 = self.translate_linear(bus, laddr + page_remain, user, AccessType::Read)?;
            let (first, second) = buf.split_at_mut(page_remain as usize);
            bus.read_bytes(paddr1 as usize, first).map_err(|_| Fault::gp(0))?;
            bus.read_bytes(paddr2 as usize, second).map_err(|_| Fault::gp(0))?;
        }
        Ok(())
    }

    /// Translate the whole range before any byte is stored, so a fault on
    /// the second page cannot leave a torn write on the first.
    pub(crate) fn write_linear(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        user: bool,
        data: &[u8],
    ) -> CpuResult<()> {
        let len = data.len() as u64;
        let page_remain = 0x1000 - (laddr & 0xFFF);
        if len <= page_remain {
            let paddr = self.translate_linear(bus, laddr, user, AccessType::Write)?;
            bus.write_bytes(paddr as usize, data).map_err(|_| Fault::gp(0))?;
        }
        else {
            let paddr1 = self.translate_linear(bus, laddr, user, AccessType::Write)?;
            let paddr2 = self.translate_linear(bus, laddr + page_remain, user, AccessType::Write)?;
            let (first, second) = data.split_at(page_remain as usize);
            bus.write_bytes(paddr1 as usize, first).map_err(|_| Fault::gp(0))?;
            bus.write_bytes(paddr2 as usize, second).map_err(|_| Fault::gp(0))?;
        }
        Ok(())
    }

    /// Read half of an RMW access: translated with write intent and the
    /// physical mapping saved for the write half.
    fn read_rmw_linear(
        &mut self,
        bus: &mut BusInterface,
        laddr: u64,
        user: bool,
        buf: &mut [u8],
    ) -> CpuResult<()> {
        let len = buf.len() as u64;
        let page_remain = 0x1000 - (laddr & 0xFFF);
        if len <= page_remain {
            let paddr = self.translate_linear(bus, laddr, user, AccessType::Write)?;
            bus.read_bytes(paddr as usize, buf).map_err(|_| Fault::gp(0))?;
            self.address_xlation = AddressXlation {
                paddr1: paddr,
                paddr2: 0,
                len1: buf.len() as u32,
                len2: 0,
                pages: 1,
            };
        }
        else {
            let paddr1 = self.translate_linear(bus, laddr, user, AccessType::Write)?;
            let paddr2 = self.translate_linear(bus, laddr + page_remain, user, AccessType::Write)?;
            let (first, second) = buf.split_at_mut(page_remain as usize);
            bus.read_bytes(paddr1 as usize, first).map_err(|_| Fault::gp(0))?;
            bus.read_bytes(paddr2 as usize, second).map_err(|_| Fault::gp(0))?;
            self.address_xlation = AddressXlation {
                paddr1,
                paddr2,
                len1: page_remain as u32,
                len2: (len - page_remain) as u32,
                pages: 2,
            };
        }
        Ok(())
    }

    /// Write half of an RMW access; reuses the translation recorded by the
    /// read half and therefore cannot fault on translation.
    pub(crate) fn write_rmw(&mut self, bus: &mut BusInterface, data: &[u8]) -> CpuResult<()> {
        let xlat = self.address_xlation;
        debug_assert_eq!(xlat.len1 + xlat.len2, data.len() as u32);
        if xlat.pages == 1 {
            bus.write_bytes(xlat.paddr1 as usize, data).map_err(|_| Fault::gp(0))?;
        }
        else {
            let (first, second) = data.split_at(xlat.len1 as usize);
            bus.write_bytes(xlat.paddr1 as usize, first).map_err(|_| Fault::gp(0))?;
            bus.write_bytes(xlat.paddr2 as usize, second).map_err(|_| Fault::gp(0))?;
        }
        Ok(())
    }

    /* -------------------------- Virtual accessors -------------------------- */

    fn read_virtual(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, buf: &mut [u8]) -> CpuResult<()> {
        let len = buf.len() as u32;
        self.read_virtual_checks(seg, offset, len)?;
        let laddr = self.agen(seg, offset, len)?;
        if len > 1 && self.alignment_check_active() && laddr & (len as u64 - 1) != 0 {
            return Err(Fault::ac());
        }
        self.read_linear(bus, laddr, self.user_mode(), buf)
    }

    fn write_virtual(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: &[u8]) -> CpuResult<()> {
        let len = data.len() as u32;
        self.write_virtual_checks(seg, offset, len)?;
        let laddr = self.agen(seg, offset, len)?;
        if len > 1 && self.alignment_check_active() && laddr & (len as u64 - 1) != 0 {
            return Err(Fault::ac());
        }
        self.write_linear(bus, laddr, self.user_mode(), data)
    }

    pub fn read_virtual_u8(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64) -> CpuResult<u8> {
        let mut buf = [0u8; 1];
        self.read_virtual(bus, seg, offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_virtual_u16(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64) -> CpuResult<u16> {
        let mut buf = [0u8; 2];
        self.read_virtual(bus, seg, offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_virtual_u32(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64) -> CpuResult<u32> {
        let mut buf = [0u8; 4];
        self.read_virtual(bus, seg, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_virtual_u64(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64) -> CpuResult<u64> {
        let mut buf = [0u8; 8];
        self.read_virtual(bus, seg, offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_virtual_xmm(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64) -> CpuResult<Xmm> {
        let mut buf = [0u8; 16];
        self.read_virtual(bus, seg, offset, &mut buf)?;
        Ok(Xmm(buf))
    }

    pub fn write_virtual_u8(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: u8) -> CpuResult<()> {
        self.write_virtual(bus, seg, offset, &[data])
    }

    pub fn write_virtual_u16(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: u16) -> CpuResult<()> {
        self.write_virtual(bus, seg, offset, &data.to_le_bytes())
    }

    pub fn write_virtual_u32(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: u32) -> CpuResult<()> {
        self.write_virtual(bus, seg, offset, &data.to_le_bytes())
    }

    pub fn write_virtual_u64(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: u64) -> CpuResult<()> {
        self.write_virtual(bus, seg, offset, &data.to_le_bytes())
    }

    pub fn write_virtual_xmm(&mut self, bus: &mut BusInterface, seg: Segment, offset: u64, data: Xmm) -> CpuResult<()> {
        self.write_virtual(bus, seg, offset, &data.0)
    }

    /// Width-generic read used by the operand dispatcher.
    pub fn read_virtual_width(
        &mut self,
        bus: &mut BusInterface,
        seg: Segment,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<u64> {
        match width {
            OperandWidth::Byte => Ok(self.read_virtual_u8(bus, seg, offset)? as u64),
            OperandWidth::Word => Ok(self.read_virtual_u16(bus, seg, offset)? as u64),
            OperandWidth::Dword => Ok(self.read_virtual_u32(bus, seg, offset)? as u64),
            OperandWidth::Qword => self.read_virtual_u64(bus, seg, offset),
        }
    }

    pub fn write_virtual_width(
        &mut self,
        bus: &mut BusInterface,
        seg: Segment,
        offset: u64,
        width: OperandWidth,
        data: u64,
    ) -> CpuResult<()> {
        match width {
            OperandWidth::Byte => self.write_virtual_u8(bus, seg, offset, data as u8),
            OperandWidth::Word => self.write_virtual_u16(bus, seg, offset, data as u16),
            OperandWidth::Dword => self.write_virtual_u32(bus, seg, offset, data as u32),
            OperandWidth::Qword => self.write_virtual_u64(bus, seg, offset, data),
        }
    }

    /// RMW read: write-checked, write-translated, translation saved.
    pub fn read_rmw_virtual_width(
        &mut self,
        bus: &mut BusInterface,
        seg: Segment,
        offset: u64,
        width: OperandWidth,
    ) -> CpuResult<u64> {
        let len = width.bytes();
        self.write_virtual_checks(seg, offset, len)?;
        let laddr = self.agen(seg, offset, len)?;
        if len > 1 && self.alignment_check_active() && laddr & (len as u64 - 1) != 0 {
            return Err(Fault::ac());
        }
        let mut buf = [0u8; 8];
        self.read_rmw_linear(bus, laddr, self.user_mode(), &mut buf[..len as usize])?;
        let mut bytes = [0u8; 8];
        bytes[..len as usize].copy_from_slice(&buf[..len as usize]);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_rmw_width(&mut self, bus: &mut BusInterface, width: OperandWidth, data: u64) -> CpuResult<()> {
        let bytes = data.to_le_bytes();
        self.write_rmw(bus, &bytes[..width.bytes() as usize])
    }

    /* --------------------------- System accessors -------------------------- */

    // Linear-address accesses used for descriptor tables, the IDT and the
    // TSS. Always performed at supervisor privilege.

    pub(crate) fn system_read_u8(&mut self, bus: &mut BusInterface, laddr: u64) -> CpuResult<u8> {
        let mut buf = [0u8; 1];
        self.read_linear(bus, laddr, false, &mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn system_read_u16(&mut self, bus: &mut BusInterface, laddr: u64) -> CpuResult<u16> {
        let mut buf = [0u8; 2];
        self.read_linear(bus, laddr, false, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) fn system_read_u32(&mut self, bus: &mut BusInterface, laddr: u64) -> CpuResult<u32> {
        let mut buf = [0u8; 4];
        self.read_linear(bus, laddr, false, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn system_read_u64(&mut self, bus: &mut BusInterface, laddr: u64) -> CpuResult<u64> {
        let mut buf = [0u8; 8];
        self.read_linear(bus, laddr, false, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn system_write_u8(&mut self, bus: &mut BusInterface, laddr: u64, data: u8) -> CpuResult<()> {
        self.write_linear(bus, laddr, false, &[data])
    }

    pub(crate) fn system_write_u16(&mut self, bus: &mut BusInterface, laddr: u64, data: u16) -> CpuResult<()> {
        self.write_linear(bus, laddr, false, &data.to_le_bytes())
    }

    pub(crate) fn system_write_u32(&mut self, bus: &mut BusInterface, laddr: u64, data: u32) -> CpuResult<()> {
        self.write_linear(bus, laddr, false, &data.to_le_bytes())
    }

    /* ------------------------------ Port I/O ------------------------------- */

    /// IN/OUT and INS/OUTS privilege gate: IOPL class check in protected
    /// and v8086 modes.
    pub(crate) fn allow_io(&self) -> CpuResult<()> {
        if self.protected_mode() && (self.cpl() > self.iopl() || self.v8086_mode() && self.iopl() < 3) {
            return Err(Fault::gp(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_x64::descriptor::{encode_segment, Descriptor};
    use crate::cpu_x64::segmentation::GlobalTableRegister;
    use crate::cpu_common::FaultKind;

    // Protected-mode CPU with a data segment of limit 0xFFF at base 0x4000
    // and an expand-down segment for the inverted checks.
    fn setup() -> (Intel64, BusInterface) {
        let mut cpu = Intel64::new();
        let mut bus = BusInterface::new(0x10_0000);
        let gdt = 0x1000u64;

        let write_desc = |bus: &mut BusInterface, index: u64, d: (u32, u32)| {
            bus.write_u32((gdt + index * 8) as usize, d.0).unwrap();
            bus.write_u32((gdt + index * 8 + 4) as usize, d.1).unwrap();
        };
        write_desc(&mut bus, 1, encode_segment(0, 0xF_FFFF, 0x9A, 0xC)); // flat code
        write_desc(&mut bus, 2, encode_segment(0, 0xF_FFFF, 0x92, 0xC)); // flat data
        write_desc(&mut bus, 3, encode_segment(0x4000, 0xFFF, 0x92, 0x4)); // small data
        write_desc(&mut bus, 4, encode_segment(0x4000, 0xFFF, 0x96, 0x4)); // expand-down, d_b

        cpu.gdtr = GlobalTableRegister { base: gdt, limit: 0x27 };
        cpu.write_cr(0, crate::cpu_x64::CR0_PE).unwrap();
        if let Descriptor::Segment(code) = Descriptor::parse(encode_segment(0, 0xF_FFFF, 0x9A, 0xC).0, encode_segment(0, 0xF_FFFF, 0x9A, 0xC).1) {
            cpu.load_cs(0x08, &code, 0);
        }
        cpu.load_seg_reg(&mut bus, Segment::SS, 0x10).unwrap();
        cpu.load_seg_reg(&mut bus, Segment::DS, 0x18).unwrap();
        (cpu, bus)
    }

    #[test]
    fn access_within_limit_succeeds() {
        let (mut cpu, mut bus) = setup();
        cpu.write_virtual_u32(&mut bus, Segment::DS, 0xFFC, 0xDEAD_BEEF).unwrap();
        assert_eq!(cpu.read_virtual_u32(&mut bus, Segment::DS, 0xFFC).unwrap(), 0xDEAD_BEEF);
        // Lands at segment base 0x4000 physically
        assert_eq!(bus.read_u32(0x4FFC).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn limit_boundary_exact() {
        let (mut cpu, mut bus) = setup();
        // Byte at the limit itself is legal
        cpu.read_virtual_u8(&mut bus, Segment::DS, 0xFFF).unwrap();
        // One past is not
        let err = cpu.read_virtual_u8(&mut bus, Segment::DS, 0x1000).unwrap_err();
        assert_eq!(err, Fault::gp(0));
    }

    #[test]
    fn multi_byte_crossing_limit_faults() {
        let (mut cpu, mut bus) = setup();
        // limit - length + 1 is the first failing offset for a dword
        assert!(cpu.read_virtual_u32(&mut bus, Segment::DS, 0xFFC).is_ok());
        let err = cpu.read_virtual_u32(&mut bus, Segment::DS, 0xFFD).unwrap_err();
        assert_eq!(err.kind, FaultKind::GeneralProtection);
    }

    #[test]
    fn ss_relative_violation_is_stack_fault() {
        let (mut cpu, mut bus) = setup();
        cpu.load_seg_reg(&mut bus, Segment::SS, 0x18).unwrap();
        let err = cpu.write_virtual_u32(&mut bus, Segment::SS, 0x1000, 0).unwrap_err();
        assert_eq!(err.kind, FaultKind::StackFault);
    }

    #[test]
    fn expand_down_inverts_valid_range() {
        let (mut cpu, mut bus) = setup();
        cpu.load_seg_reg(&mut bus, Segment::ES, 0x20).unwrap();
        // Offsets at or below the limit fault
        assert!(cpu.read_virtual_u8(&mut bus, Segment::ES, 0xFFF).is_err());
        assert!(cpu.read_virtual_u8(&mut bus, Segment::ES, 0x0).is_err());
        // Above the limit is the live region
        assert!(cpu.read_virtual_u8(&mut bus, Segment::ES, 0x1000).is_ok());
    }

    #[test]
    fn null_segment_access_faults() {
        let (mut cpu, mut bus) = setup();
        cpu.load_seg_reg(&mut bus, Segment::ES, 0x0000).unwrap();
        let err = cpu.read_virtual_u8(&mut bus, Segment::ES, 0).unwrap_err();
        assert_eq!(err, Fault::gp(0));
    }

    #[test]
    fn rmw_reuses_translation() {
        let (mut cpu, mut bus) = setup();
        bus.write_u32(0x4100, 0x11).unwrap();
        let value = cpu
            .read_rmw_virtual_width(&mut bus, Segment::DS, 0x100, OperandWidth::Dword)
            .unwrap();
        assert_eq!(value, 0x11);
        assert_eq!(cpu.address_xlation.pages, 1);
        assert_eq!(cpu.address_xlation.paddr1, 0x4100);
        cpu.write_rmw_width(&mut bus, OperandWidth::Dword, 0x22).unwrap();
        assert_eq!(bus.read_u32(0x4100).unwrap(), 0x22);
    }

    #[test]
    fn flat_4g_fast_path_allows_high_offsets() {
        let (mut cpu, mut bus) = setup();
        // SS is flat 4G; offset far beyond any small limit works
        cpu.write_virtual_u8(&mut bus, Segment::SS, 0x8_0000, 0x5A).unwrap();
        assert_eq!(bus.read_u8(0x8_0000).unwrap(), 0x5A);
    }
}
