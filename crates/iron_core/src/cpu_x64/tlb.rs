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

    cpu_x64::tlb.rs

    Direct-mapped translation lookaside buffer. Entries are kept at 4K
    granularity; a large page occupies the slot of whichever 4K chunk was
    last touched, carrying a wider lpf_mask so invlpg can still find it.

*/

pub const TLB_SIZE: usize = 1024; // must be a power of 2

// Entry permission bits. The permission test below indexes them as
// 1 << ((write << 1) | user).
pub const TLB_SYS_READ_OK: u32 = 0x01;
pub const TLB_USER_READ_OK: u32 = 0x02;
pub const TLB_SYS_WRITE_OK: u32 = 0x04;
pub const TLB_USER_WRITE_OK: u32 = 0x08;
pub const TLB_GLOBAL_PAGE: u32 = 0x8000_0000;

pub const TLB_READ_ACCESS_MASK: u32 = TLB_SYS_READ_OK | TLB_USER_READ_OK;
pub const TLB_WRITE_ACCESS_MASK: u32 = TLB_SYS_WRITE_OK | TLB_USER_WRITE_OK;

const INVALID_LPF: u64 = !0u64;

pub const LPF_MASK_4K: u64 = 0xFFF;
pub const LPF_MASK_4M: u64 = 0x3F_FFFF;
pub const LPF_MASK_2M: u64 = 0x1F_FFFF;

#[inline]
pub fn lpf_of(laddr: u64) -> u64 {
    laddr & !0xFFF
}

#[derive(Copy, Clone, Debug)]
pub struct TlbEntry {
    pub lpf: u64,
    pub ppf: u64,
    pub access_bits: u32,
    pub lpf_mask: u64,
}

impl TlbEntry {
    #[inline]
    fn invalid() -> TlbEntry {
        TlbEntry {
            lpf: INVALID_LPF,
            ppf: 0,
            access_bits: 0,
            lpf_mask: LPF_MASK_4K,
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.lpf != INVALID_LPF
    }

    #[inline]
    pub fn access_allowed(&self, write: bool, user: bool) -> bool {
        self.access_bits & (1 << (((write as u32) << 1) | user as u32)) != 0
    }

    #[inline]
    pub fn translate(&self, laddr: u64) -> u64 {
        self.ppf | (laddr & 0xFFF)
    }
}

pub struct Tlb {
    entries: Vec<TlbEntry>,
    /// Set whenever a large-page entry is resident; invlpg then has to scan
    /// since the victim may live in a different slot than its 4K index.
    split_large: bool,
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            entries: vec![TlbEntry::invalid(); TLB_SIZE],
            split_large: false,
        }
    }

    #[inline]
    fn index_of(lpf: u64) -> usize {
        ((lpf & ((TLB_SIZE as u64 - 1) << 12)) >> 12) as usize
    }

    #[inline]
    pub fn lookup(&self, laddr: u64) -> Option<&TlbEntry> {
        let lpf = lpf_of(laddr);
        let entry = &self.entries[Self::index_of(lpf)];
        if entry.lpf == lpf {
            Some(entry)
        }
        else {
            None
        }
    }

    pub fn fill(&mut self, laddr: u64, ppf: u64, access_bits: u32, lpf_mask: u64) -> &TlbEntry {
        let lpf = lpf_of(laddr);
        let index = Self::index_of(lpf);
        self.entries[index] = TlbEntry {
            lpf,
            ppf,
            access_bits,
            lpf_mask,
        };
        if lpf_mask > LPF_MASK_4K {
            self.split_large = true;
        }
        &self.entries[index]
    }

    pub fn invlpg(&mut self, laddr: u64) {
        if self.split_large {
            // Large pages can alias any slot; compare each entry under its
            // own mask.
            let mut split_left = false;
            for entry in self.entries.iter_mut() {
                if entry.valid() {
                    if (entry.lpf & !entry.lpf_mask) == (laddr & !entry.lpf_mask) {
                        *entry = TlbEntry::invalid();
                    }
                    else if entry.lpf_mask > LPF_MASK_4K {
                        split_left = true;
                    }
                }
            }
            self.split_large = split_left;
        }
        else {
            let lpf = lpf_of(laddr);
            let entry = &mut self.entries[Self::index_of(lpf)];
            if entry.lpf == lpf {
                *entry = TlbEntry::invalid();
            }
        }
    }

    pub fn flush(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = TlbEntry::invalid();
        }
        self.split_large = false;
    }

    /// Flush everything except global pages. Without PGE this degenerates to
    /// a full flush.
    pub fn flush_non_global(&mut self, pge: bool) {
        if !pge {
            self.flush();
            return;
        }
        let mut split_left = false;
        for entry in self.entries.iter_mut() {
            if entry.valid() {
                if entry.access_bits & TLB_GLOBAL_PAGE == 0 {
                    *entry = TlbEntry::invalid();
                }
                else if entry.lpf_mask > LPF_MASK_4K {
                    split_left = true;
                }
            }
        }
        self.split_large = split_left;
    }
}
