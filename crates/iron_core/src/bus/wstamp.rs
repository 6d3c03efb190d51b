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

    bus::wstamp.rs

    Per-physical-page write stamps used for self-modifying-code detection.
    Each page gets a 32-bit mask, one bit per 128-byte line. Decoding an
    instruction marks the lines it occupies; a store that touches a marked
    line reports the overlap so the instruction caches can invalidate.

    Multiple physical pages may alias one table slot when guest memory is
    not a power-of-two page count. Aliasing only ever produces spurious
    invalidations, never missed ones.

*/

pub const PAGE_SIZE: usize = 4096;
pub const LINE_SHIFT: u64 = 7;

pub struct PageWriteStampTable {
    fine_granularity: Vec<u32>,
    index_mask: usize,
}

impl PageWriteStampTable {
    pub fn new(mem_size: usize) -> PageWriteStampTable {
        let pages = (mem_size / PAGE_SIZE).next_power_of_two().max(1);
        PageWriteStampTable {
            fine_granularity: vec![0; pages],
            index_mask: pages - 1,
        }
    }

    #[inline]
    pub fn hash(&self, paddr: u64) -> usize {
        ((paddr >> 12) as usize) & self.index_mask
    }

    /// Line mask for a byte range. The range must not split a 4K page; the
    /// access layer splits page-crossing stores before they get here.
    #[inline]
    pub fn line_mask(paddr: u64, len: usize) -> u32 {
        let first = 1u32 << ((paddr & 0xFFF) >> LINE_SHIFT);
        let last = 1u32 << (((paddr + len as u64 - 1) & 0xFFF) >> LINE_SHIFT);
        first | last
    }

    #[inline]
    pub fn get(&self, paddr: u64) -> u32 {
        let index = self.hash(paddr);
        self.fine_granularity[index]
    }

    #[inline]
    pub fn mark_icache(&mut self, paddr: u64, len: usize) {
        let index = self.hash(paddr);
        self.fine_granularity[index] |= Self::line_mask(paddr, len);
    }

    #[inline]
    pub fn mark_icache_mask(&mut self, paddr: u64, mask: u32) {
        let index = self.hash(paddr);
        self.fine_granularity[index] |= mask;
    }

    /// Record a store. If the store overlaps lines holding decoded code,
    /// clear those bits and return the overlap mask so the caller can
    /// invalidate the affected traces. Returns 0 when no code is touched.
    #[inline]
    pub fn dec_write_stamp(&mut self, paddr: u64, len: usize) -> u32 {
        let index = self.hash(paddr);
        if self.fine_granularity[index] != 0 {
            let mask = Self::line_mask(paddr, len);
            if self.fine_granularity[index] & mask != 0 {
                self.fine_granularity[index] &= !mask;
                return mask;
            }
        }
        0
    }

    pub fn reset(&mut self) {
        self.fine_granularity.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_to_unmarked_page_reports_nothing() {
        let mut table = PageWriteStampTable::new(1024 * 1024);
        assert_eq!(table.dec_write_stamp(0x1000, 4), 0);
    }

    #[test]
    fn store_overlapping_marked_line_reports_and_clears() {
        let mut table = PageWriteStampTable::new(1024 * 1024);
        table.mark_icache(0x1080, 3);
        // Offset 0x80 is line 1
        assert_eq!(table.get(0x1080), 0x2);
        assert_eq!(table.dec_write_stamp(0x1082, 1), 0x2);
        // Second store to the same spot is silent
        assert_eq!(table.dec_write_stamp(0x1082, 1), 0);
    }

    #[test]
    fn store_to_different_line_is_silent() {
        let mut table = PageWriteStampTable::new(1024 * 1024);
        table.mark_icache(0x1000, 4);
        assert_eq!(table.dec_write_stamp(0x1F00, 4), 0);
        // Marked line still intact
        assert_eq!(table.get(0x1000), 0x1);
    }

    #[test]
    fn mark_spanning_lines_sets_first_and_last() {
        let mut table = PageWriteStampTable::new(1024 * 1024);
        // 10 bytes starting just below a line boundary touch lines 0 and 1
        table.mark_icache(0x207E, 10);
        assert_eq!(table.get(0x2000), 0x3);
    }
}
