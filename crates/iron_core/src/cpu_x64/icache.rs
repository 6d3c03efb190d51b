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

    cpu_x64::icache.rs

    Decoded instruction trace cache. Traces are keyed by the physical
    address of their first byte plus the fetch mode, and hold up to
    MAX_TRACE_LENGTH decoded instructions in a shared pool. Each entry
    remembers which 128-byte lines of its starting page it covers, so a
    store that lands on those lines can invalidate exactly the affected
    traces. Traces that spill onto a second page go through a small victim
    ring, since their entry cannot be found from the second page's address.

*/

use crate::{
    bus::wstamp::{LINE_SHIFT, PAGE_SIZE},
    cpu_common::Instruction,
};

pub const ICACHE_ENTRIES: usize = 16384; // must be a power of 2
pub const POOL_SIZE: usize = 65536;
pub const MAX_TRACE_LENGTH: usize = 32;
pub const PAGE_SPLIT_ENTRIES: usize = 8;

const INVALID_PADDR: u64 = !0u64;
const LINES_PER_PAGE: u32 = (PAGE_SIZE / (1 << LINE_SHIFT)) as u32;

#[derive(Copy, Clone)]
pub struct TraceEntry {
    paddr: u64,
    fetch_mode: usize,
    /// First instruction slot in the pool
    start: u32,
    /// Number of decoded instructions
    length: u32,
    /// 128-byte lines of the starting page covered by this trace
    trace_mask: u32,
}

impl TraceEntry {
    #[inline]
    fn invalid() -> TraceEntry {
        TraceEntry {
            paddr: INVALID_PADDR,
            fetch_mode: 0,
            start: 0,
            length: 0,
            trace_mask: 0,
        }
    }

    #[inline]
    fn valid(&self) -> bool {
        self.paddr != INVALID_PADDR
    }
}

#[derive(Copy, Clone)]
struct PageSplitEntry {
    /// Physical page frame the trace spilled onto
    ppf2: u64,
    entry_index: usize,
}

pub struct ICache {
    entries: Vec<TraceEntry>,
    pool: Vec<Instruction>,
    pool_used: usize,
    page_splits: [PageSplitEntry; PAGE_SPLIT_ENTRIES],
    split_next: usize,
}

/// Line coverage masks a committed trace contributes to the write stamp
/// table: one for the starting page and, for a page-split trace, one for
/// the spill page.
pub struct TraceCoverage {
    pub mask1: u32,
    pub page2: Option<(u64, u32)>,
}

impl ICache {
    pub fn new() -> ICache {
        ICache {
            entries: vec![TraceEntry::invalid(); ICACHE_ENTRIES],
            pool: vec![Instruction::default(); POOL_SIZE],
            pool_used: 0,
            page_splits: [PageSplitEntry {
                ppf2: INVALID_PADDR,
                entry_index: 0,
            }; PAGE_SPLIT_ENTRIES],
            split_next: 0,
        }
    }

    // Identity-style hash: every trace starting on a given 4K page lands
    // in one page-aligned window of PAGE_SIZE entries, so SMC invalidation
    // never scans past that window.
    #[inline]
    fn hash(paddr: u64, fetch_mode: usize) -> usize {
        ((paddr as usize) & (ICACHE_ENTRIES - 1)) ^ fetch_mode
    }

    /// Look up a trace for the given physical fetch address and mode.
    /// Returns (pool start, instruction count).
    pub fn lookup(&self, paddr: u64, fetch_mode: usize) -> Option<(u32, u32)> {
        let entry = &self.entries[Self::hash(paddr, fetch_mode)];
        if entry.paddr == paddr && entry.fetch_mode == fetch_mode {
            Some((entry.start, entry.length))
        }
        else {
            None
        }
    }

    #[inline]
    pub fn get(&self, index: u32) -> &Instruction {
        &self.pool[index as usize]
    }

    /// Reserve pool space for a new trace, flushing everything when the
    /// pool cannot hold a maximum-length trace.
    pub fn alloc(&mut self) -> u32 {
        if self.pool_used + MAX_TRACE_LENGTH > POOL_SIZE {
            log::debug!("trace pool exhausted, flushing");
            self.flush();
        }
        self.pool_used as u32
    }

    #[inline]
    pub fn slot_mut(&mut self, index: u32) -> &mut Instruction {
        &mut self.pool[index as usize]
    }

    fn line_mask(first_offset: u64, last_offset: u64) -> u32 {
        let first = (first_offset >> LINE_SHIFT) as u32;
        let last = (last_offset >> LINE_SHIFT) as u32;
        let high = if last >= LINES_PER_PAGE - 1 {
            !0u32
        }
        else {
            (1u32 << (last + 1)) - 1
        };
        high & !((1u32 << first) - 1)
    }

    /// Publish a decoded trace. `byte_len` covers all fetched bytes, and
    /// `paddr2` names the physical page any spill bytes landed on.
    pub fn commit(
        &mut self,
        paddr: u64,
        fetch_mode: usize,
        start: u32,
        length: u32,
        byte_len: u32,
        paddr2: Option<u64>,
    ) -> TraceCoverage {
        debug_assert!(length as usize <= MAX_TRACE_LENGTH);
        self.pool_used = (start + length) as usize;

        let offset = paddr & (PAGE_SIZE as u64 - 1);
        let end = offset + byte_len as u64 - 1;
        let index = Self::hash(paddr, fetch_mode);

        let coverage = if end < PAGE_SIZE as u64 {
            TraceCoverage {
                mask1: Self::line_mask(offset, end),
                page2: None,
            }
        }
        else {
            // Page split: cover through the last line here, the remainder
            // on the spill page, and remember the entry in the victim ring
            let ppf2 = paddr2.unwrap_or(0) & !(PAGE_SIZE as u64 - 1);
            let mask2 = Self::line_mask(0, end - PAGE_SIZE as u64);
            // The ring slot's previous occupant loses its spill tracking,
            // so it cannot be allowed to survive
            let victim = self.page_splits[self.split_next];
            if victim.ppf2 != INVALID_PADDR {
                self.entries[victim.entry_index] = TraceEntry::invalid();
            }
            self.page_splits[self.split_next] = PageSplitEntry {
                ppf2,
                entry_index: index,
            };
            self.split_next = (self.split_next + 1) % PAGE_SPLIT_ENTRIES;
            TraceCoverage {
                mask1: Self::line_mask(offset, PAGE_SIZE as u64 - 1),
                page2: Some((ppf2, mask2)),
            }
        };

        self.entries[index] = TraceEntry {
            paddr,
            fetch_mode,
            start,
            length,
            trace_mask: coverage.mask1,
        };
        coverage
    }

    /// A store overlapped decoded code: drop every trace on the written
    /// page whose line coverage intersects the cleared mask, and any
    /// page-split trace that spilled onto the page. Only the page's entry
    /// window is scanned, and only up to the highest written line; a trace
    /// starting past that line cannot cover it.
    pub fn handle_smc(&mut self, paddr: u64, mask: u32) {
        let page = paddr & !(PAGE_SIZE as u64 - 1);

        for split in self.page_splits.iter_mut() {
            if split.ppf2 == page {
                self.entries[split.entry_index] = TraceEntry::invalid();
                split.ppf2 = INVALID_PADDR;
            }
        }

        // The fetch-mode XOR only flips bits below the line index, so
        // scanning whole lines covers every mode
        let base = Self::hash(page, 0);
        for line in 0..LINES_PER_PAGE as usize {
            let line_mask = 1u32 << line;
            if line_mask > mask {
                break;
            }
            let first = base + (line << LINE_SHIFT);
            for entry in self.entries[first..first + (1 << LINE_SHIFT)].iter_mut() {
                if entry.valid() && (entry.paddr & !(PAGE_SIZE as u64 - 1)) == page && entry.trace_mask & mask != 0 {
                    *entry = TraceEntry::invalid();
                }
            }
        }
    }

    pub fn flush(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = TraceEntry::invalid();
        }
        for split in self.page_splits.iter_mut() {
            split.ppf2 = INVALID_PADDR;
        }
        self.pool_used = 0;
    }
}
