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

    cpu_x64::sse_string.rs

    The SSE4.2 string compare family. All four instructions share the same
    three stages: element-wise aggregation into an intermediate bit vector,
    polarity adjustment, and output as either an index (ECX) or a mask
    (XMM0). Lengths come from a null scan for the implicit forms and from
    rAX/rDX for the explicit ones.

*/

use crate::{
    cpu_common::{Mnemonic, OperandWidth},
    cpu_x64::{
        Intel64, Xmm, CPU_FLAG_AUX_CARRY, CPU_FLAG_CARRY, CPU_FLAG_OVERFLOW, CPU_FLAG_PARITY, CPU_FLAG_SIGN,
        CPU_FLAG_ZERO, RAX, RCX, RDX,
    },
};

// imm8 control fields
const FMT_WORDS: u8 = 0x01;
const FMT_SIGNED: u8 = 0x02;
const AGG_MASK: u8 = 0x0C;
const AGG_EQUAL_ANY: u8 = 0x00;
const AGG_RANGES: u8 = 0x04;
const AGG_EQUAL_EACH: u8 = 0x08;
const AGG_EQUAL_ORDERED: u8 = 0x0C;
const POL_NEGATIVE: u8 = 0x10;
const POL_MASKED: u8 = 0x20;
const OUT_MSB_OR_ELEMENT_MASK: u8 = 0x40;

struct StrSource {
    elements: [i32; 16],
    count: u32,
}

fn unpack(x: &Xmm, imm: u8) -> [i32; 16] {
    let mut out = [0i32; 16];
    if imm & FMT_WORDS != 0 {
        for (lane, slot) in out.iter_mut().enumerate().take(8) {
            let raw = x.u16l(lane);
            *slot = if imm & FMT_SIGNED != 0 { raw as i16 as i32 } else { raw as i32 };
        }
    }
    else {
        for (lane, slot) in out.iter_mut().enumerate() {
            let raw = x.u8l(lane);
            *slot = if imm & FMT_SIGNED != 0 { raw as i8 as i32 } else { raw as i32 };
        }
    }
    out
}

fn implicit_length(elements: &[i32; 16], num: u32) -> u32 {
    for i in 0..num {
        if elements[i as usize] == 0 {
            return i;
        }
    }
    num
}

impl Intel64 {
    fn explicit_length(&self, reg: u8, num: u32) -> u32 {
        let raw = self.gpr32(reg) as i32;
        (raw.unsigned_abs()).min(num)
    }

    fn aggregate(a: &StrSource, b: &StrSource, imm: u8, num: u32) -> u16 {
        let mut intres1: u16 = 0;
        match imm & AGG_MASK {
            AGG_EQUAL_ANY => {
                // Characters of b that appear in the set a
                for j in 0..b.count {
                    for i in 0..a.count {
                        if a.elements[i as usize] == b.elements[j as usize] {
                            intres1 |= 1 << j;
                            break;
                        }
                    }
                }
            }
            AGG_RANGES => {
                // a holds (low, high) pairs; both pair elements must be valid
                for j in 0..b.count {
                    let v = b.elements[j as usize];
                    for i in (0..a.count.saturating_sub(1)).step_by(2) {
                        if v >= a.elements[i as usize] && v <= a.elements[i as usize + 1] {
                            intres1 |= 1 << j;
                            break;
                        }
                    }
                }
            }
            AGG_EQUAL_EACH => {
                for idx in 0..num {
                    let av = idx < a.count;
                    let bv = idx < b.count;
                    let matched = if av && bv {
                        a.elements[idx as usize] == b.elements[idx as usize]
                    }
                    else {
                        // Both past their ends compare equal
                        !av && !bv
                    };
                    if matched {
                        intres1 |= 1 << idx;
                    }
                }
            }
            _ => {
                // Equal ordered: substring search for a within b
                for j in 0..num {
                    let mut matched = true;
                    for k in 0..a.count {
                        if j + k >= b.count {
                            matched = false;
                            break;
                        }
                        if a.elements[k as usize] != b.elements[(j + k) as usize] {
                            matched = false;
                            break;
                        }
                    }
                    if matched {
                        intres1 |= 1 << j;
                    }
                }
            }
        }
        intres1
    }

    fn apply_polarity(intres1: u16, imm: u8, b_count: u32, num: u32) -> u16 {
        let all = ((1u32 << num) - 1) as u16;
        if imm & POL_NEGATIVE == 0 {
            return intres1;
        }
        if imm & POL_MASKED != 0 {
            // Invert only where the second string is valid
            let valid = ((1u32 << b_count) - 1) as u16;
            intres1 ^ valid
        }
        else {
            (intres1 ^ all) & all
        }
    }

    /// Execute one of the four PCMPxSTRx forms over already-fetched
    /// operands, writing ECX or XMM0 and the full flag set.
    pub(crate) fn op_pcmpstr(&mut self, mnemonic: Mnemonic, a: Xmm, b: Xmm, imm: u8) {
        let num: u32 = if imm & FMT_WORDS != 0 { 8 } else { 16 };
        let a_elems = unpack(&a, imm);
        let b_elems = unpack(&b, imm);

        let explicit = matches!(mnemonic, Mnemonic::PCMPESTRI | Mnemonic::PCMPESTRM);
        let (a_count, b_count) = if explicit {
            (self.explicit_length(RAX, num), self.explicit_length(RDX, num))
        }
        else {
            (implicit_length(&a_elems, num), implicit_length(&b_elems, num))
        };

        let src_a = StrSource {
            elements: a_elems,
            count: a_count,
        };
        let src_b = StrSource {
            elements: b_elems,
            count: b_count,
        };

        let intres1 = Self::aggregate(&src_a, &src_b, imm, num);
        let intres2 = Self::apply_polarity(intres1, imm, b_count, num);

        self.set_flag_state(CPU_FLAG_CARRY, intres2 != 0);
        self.set_flag_state(CPU_FLAG_ZERO, b_count < num);
        self.set_flag_state(CPU_FLAG_SIGN, a_count < num);
        self.set_flag_state(CPU_FLAG_OVERFLOW, intres2 & 1 != 0);
        self.clear_flag(CPU_FLAG_AUX_CARRY);
        self.clear_flag(CPU_FLAG_PARITY);

        match mnemonic {
            Mnemonic::PCMPESTRI | Mnemonic::PCMPISTRI => {
                let index = if intres2 == 0 {
                    num
                }
                else if imm & OUT_MSB_OR_ELEMENT_MASK != 0 {
                    15 - intres2.leading_zeros()
                }
                else {
                    intres2.trailing_zeros()
                };
                self.set_gpr_width(RCX, OperandWidth::Dword, index as u64);
            }
            _ => {
                let mut mask = Xmm::default();
                if imm & OUT_MSB_OR_ELEMENT_MASK != 0 {
                    // Expand each result bit to a full element
                    if num == 8 {
                        for lane in 0..8 {
                            if intres2 & (1 << lane) != 0 {
                                mask.set_u16l(lane, 0xFFFF);
                            }
                        }
                    }
                    else {
                        for lane in 0..16 {
                            if intres2 & (1 << lane) != 0 {
                                mask.set_u8l(lane, 0xFF);
                            }
                        }
                    }
                }
                else {
                    mask.set_u16l(0, intres2);
                }
                self.set_xmm(0, mask);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xmm_str(s: &[u8]) -> Xmm {
        let mut x = Xmm::default();
        x.0[..s.len()].copy_from_slice(s);
        x
    }

    #[test]
    fn equal_any_finds_set_members() {
        let mut cpu = Intel64::new();
        let set = xmm_str(b"aeiou");
        let hay = xmm_str(b"xylophone");
        // Unsigned bytes, equal any, LSB index => first vowel
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, set, hay, 0x00);
        assert_eq!(cpu.gpr32(RCX), 3); // the 'o' in xylophone
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_ZERO)); // haystack shorter than 16
    }

    #[test]
    fn equal_any_no_match_returns_num() {
        let mut cpu = Intel64::new();
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, xmm_str(b"xyz"), xmm_str(b"aeiou"), 0x00);
        assert_eq!(cpu.gpr32(RCX), 16);
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn equal_ordered_substring_search() {
        let mut cpu = Intel64::new();
        let needle = xmm_str(b"llo");
        let hay = xmm_str(b"hello hello");
        // Equal ordered, LSB index: classic strstr
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, needle, hay, 0x0C);
        assert_eq!(cpu.gpr32(RCX), 2);
        // MSB select finds the later occurrence
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, needle, hay, 0x4C);
        assert_eq!(cpu.gpr32(RCX), 8);
    }

    #[test]
    fn ranges_classify_digits() {
        let mut cpu = Intel64::new();
        let range = xmm_str(b"09");
        let text = xmm_str(b"a1b23");
        cpu.op_pcmpstr(Mnemonic::PCMPISTRM, range, text, 0x44); // ranges, element mask
        let mask = cpu.xmm(0);
        assert_eq!(mask.u8l(0), 0x00); // 'a'
        assert_eq!(mask.u8l(1), 0xFF); // '1'
        assert_eq!(mask.u8l(2), 0x00); // 'b'
        assert_eq!(mask.u8l(3), 0xFF); // '2'
        assert_eq!(mask.u8l(4), 0xFF); // '3'
    }

    #[test]
    fn explicit_lengths_override_nulls() {
        let mut cpu = Intel64::new();
        // Embedded nulls are data under explicit lengths
        let a = xmm_str(b"a\0c");
        let b = xmm_str(b"a\0c");
        cpu.set_gpr32(RAX, 3);
        cpu.set_gpr32(RDX, 3);
        // Equal each, bit mask output
        cpu.op_pcmpstr(Mnemonic::PCMPESTRM, a, b, 0x08);
        // All three compare equal, plus both-invalid positions
        let bits = cpu.xmm(0).u16l(0);
        assert_eq!(bits, 0xFFFF);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn negative_polarity_inverts() {
        let mut cpu = Intel64::new();
        let set = xmm_str(b"a");
        let hay = xmm_str(b"aba");
        // Equal any with masked negative polarity: valid non-members
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, set, hay, 0x30);
        assert_eq!(cpu.gpr32(RCX), 1); // the 'b'
    }

    #[test]
    fn word_format_uses_eight_lanes() {
        let mut cpu = Intel64::new();
        let mut a = Xmm::default();
        let mut b = Xmm::default();
        a.set_u16l(0, 0x1234);
        b.set_u16l(0, 0x9999);
        b.set_u16l(1, 0x1234);
        // Unsigned words, equal any
        cpu.op_pcmpstr(Mnemonic::PCMPISTRI, a, b, 0x01);
        assert_eq!(cpu.gpr32(RCX), 1);
        assert!(cpu.get_flag(CPU_FLAG_ZERO));
        assert!(cpu.get_flag(CPU_FLAG_SIGN));
    }

    #[test]
    fn signed_ranges() {
        let mut cpu = Intel64::new();
        let mut range = Xmm::default();
        // [-5, 5] as signed bytes
        range.set_u8l(0, (-5i8) as u8);
        range.set_u8l(1, 5);
        let mut vals = Xmm::default();
        vals.set_u8l(0, (-3i8) as u8);
        vals.set_u8l(1, 100);
        cpu.set_gpr32(RAX, 2);
        cpu.set_gpr32(RDX, 2);
        // Signed bytes, ranges
        cpu.op_pcmpstr(Mnemonic::PCMPESTRM, range, vals, 0x06);
        let bits = cpu.xmm(0).u16l(0);
        assert_eq!(bits, 0b01);
    }
}
