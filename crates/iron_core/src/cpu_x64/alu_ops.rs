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

    cpu_x64::alu_ops.rs

    Architectural ALU operations: width dispatch over the pure flag
    kernels, RFLAGS updates, and the x86 shift/rotate count rules.

*/

use crate::{
    cpu_common::{
        alu::{
            AluAdc, AluAdd, AluNeg, AluRotateCarryLeft, AluRotateCarryRight, AluRotateLeft, AluRotateRight, AluSbb,
            AluShiftArithmeticRight, AluShiftLeft, AluShiftRight, AluSub,
        },
        Mnemonic, OperandWidth,
    },
    cpu_x64::{Intel64, CPU_FLAG_AUX_CARRY, CPU_FLAG_CARRY, CPU_FLAG_OVERFLOW},
};

macro_rules! arith_dispatch {
    ($width:expr, $a:expr, $method:ident ( $($arg:expr),* )) => {
        match $width {
            OperandWidth::Byte => {
                let (r, c, o, x) = ($a as u8).$method($($arg),*);
                (r as u64, c, o, x)
            }
            OperandWidth::Word => {
                let (r, c, o, x) = ($a as u16).$method($($arg),*);
                (r as u64, c, o, x)
            }
            OperandWidth::Dword => {
                let (r, c, o, x) = ($a as u32).$method($($arg),*);
                (r as u64, c, o, x)
            }
            OperandWidth::Qword => $a.$method($($arg),*),
        }
    };
}

macro_rules! shift_dispatch {
    ($width:expr, $a:expr, $method:ident ( $($arg:expr),* )) => {
        match $width {
            OperandWidth::Byte => {
                let (r, c) = ($a as u8).$method($($arg),*);
                (r as u64, c)
            }
            OperandWidth::Word => {
                let (r, c) = ($a as u16).$method($($arg),*);
                (r as u64, c)
            }
            OperandWidth::Dword => {
                let (r, c) = ($a as u32).$method($($arg),*);
                (r as u64, c)
            }
            OperandWidth::Qword => $a.$method($($arg),*),
        }
    };
}

impl Intel64 {
    fn set_arith_flags(&mut self, width: OperandWidth, result: u64, carry: bool, overflow: bool, aux: bool) {
        self.set_flag_state(CPU_FLAG_CARRY, carry);
        self.set_flag_state(CPU_FLAG_OVERFLOW, overflow);
        self.set_flag_state(CPU_FLAG_AUX_CARRY, aux);
        self.set_szp_flags(width, result);
    }

    /// Logical operations clear CF, OF and AF.
    fn set_logic_flags(&mut self, width: OperandWidth, result: u64) {
        self.clear_flag(CPU_FLAG_CARRY);
        self.clear_flag(CPU_FLAG_OVERFLOW);
        self.clear_flag(CPU_FLAG_AUX_CARRY);
        self.set_szp_flags(width, result);
    }

    pub(crate) fn alu_op_add(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let (result, carry, overflow, aux) = arith_dispatch!(width, a, alu_add(b as _));
        self.set_arith_flags(width, result, carry, overflow, aux);
        result
    }

    pub(crate) fn alu_op_adc(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let cf = self.get_flag(CPU_FLAG_CARRY);
        let (result, carry, overflow, aux) = arith_dispatch!(width, a, alu_adc(b as _, cf));
        self.set_arith_flags(width, result, carry, overflow, aux);
        result
    }

    pub(crate) fn alu_op_sub(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let (result, carry, overflow, aux) = arith_dispatch!(width, a, alu_sub(b as _));
        self.set_arith_flags(width, result, carry, overflow, aux);
        result
    }

    pub(crate) fn alu_op_sbb(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let cf = self.get_flag(CPU_FLAG_CARRY);
        let (result, carry, overflow, aux) = arith_dispatch!(width, a, alu_sbb(b as _, cf));
        self.set_arith_flags(width, result, carry, overflow, aux);
        result
    }

    pub(crate) fn alu_op_neg(&mut self, width: OperandWidth, a: u64) -> u64 {
        let (result, carry, overflow, aux) = arith_dispatch!(width, a, alu_neg());
        self.set_arith_flags(width, result, carry, overflow, aux);
        result
    }

    pub(crate) fn alu_op_and(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let result = (a & b) & width.mask();
        self.set_logic_flags(width, result);
        result
    }

    pub(crate) fn alu_op_or(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let result = (a | b) & width.mask();
        self.set_logic_flags(width, result);
        result
    }

    pub(crate) fn alu_op_xor(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let result = (a ^ b) & width.mask();
        self.set_logic_flags(width, result);
        result
    }

    /// INC and DEC leave CF untouched.
    pub(crate) fn alu_op_inc(&mut self, width: OperandWidth, a: u64) -> u64 {
        let cf = self.get_flag(CPU_FLAG_CARRY);
        let result = self.alu_op_add(width, a, 1);
        self.set_flag_state(CPU_FLAG_CARRY, cf);
        result
    }

    pub(crate) fn alu_op_dec(&mut self, width: OperandWidth, a: u64) -> u64 {
        let cf = self.get_flag(CPU_FLAG_CARRY);
        let result = self.alu_op_sub(width, a, 1);
        self.set_flag_state(CPU_FLAG_CARRY, cf);
        result
    }

    /// Shift and rotate with the x86 count rules: the count is masked to
    /// 5 bits (6 for 64-bit operands), a masked count of zero changes
    /// nothing, and the through-carry rotates reduce modulo width+1 for
    /// the narrow operands.
    pub(crate) fn alu_op_shift(&mut self, mnemonic: Mnemonic, width: OperandWidth, value: u64, count: u8) -> u64 {
        let count_mask = if width == OperandWidth::Qword { 0x3F } else { 0x1F };
        let count = count & count_mask;
        if count == 0 {
            return value & width.mask();
        }

        let msb_of = |v: u64| v & width.sign_bit() != 0;

        match mnemonic {
            Mnemonic::SHL => {
                let (result, carry) = shift_dispatch!(width, value, alu_shl(count));
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.set_flag_state(CPU_FLAG_OVERFLOW, carry != msb_of(result));
                self.clear_flag(CPU_FLAG_AUX_CARRY);
                self.set_szp_flags(width, result);
                result
            }
            Mnemonic::SHR => {
                let (result, carry) = shift_dispatch!(width, value, alu_shr(count));
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.set_flag_state(CPU_FLAG_OVERFLOW, msb_of(value));
                self.clear_flag(CPU_FLAG_AUX_CARRY);
                self.set_szp_flags(width, result);
                result
            }
            Mnemonic::SAR => {
                let (result, carry) = shift_dispatch!(width, value, alu_sar(count));
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.clear_flag(CPU_FLAG_OVERFLOW);
                self.clear_flag(CPU_FLAG_AUX_CARRY);
                self.set_szp_flags(width, result);
                result
            }
            Mnemonic::ROL => {
                let rot = count % width.bits() as u8;
                let (result, _) = shift_dispatch!(width, value, alu_rol(rot));
                let carry = result & 1 != 0;
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.set_flag_state(CPU_FLAG_OVERFLOW, carry != msb_of(result));
                result
            }
            Mnemonic::ROR => {
                let rot = count % width.bits() as u8;
                let (result, _) = shift_dispatch!(width, value, alu_ror(rot));
                let msb = msb_of(result);
                let next = result & (width.sign_bit() >> 1) != 0;
                self.set_flag_state(CPU_FLAG_CARRY, msb);
                self.set_flag_state(CPU_FLAG_OVERFLOW, msb != next);
                result
            }
            Mnemonic::RCL => {
                let rot = match width {
                    OperandWidth::Byte => count % 9,
                    OperandWidth::Word => count % 17,
                    _ => count,
                };
                let cf = self.get_flag(CPU_FLAG_CARRY);
                let (result, carry) = shift_dispatch!(width, value, alu_rcl(rot, cf));
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.set_flag_state(CPU_FLAG_OVERFLOW, carry != msb_of(result));
                result
            }
            Mnemonic::RCR => {
                let rot = match width {
                    OperandWidth::Byte => count % 9,
                    OperandWidth::Word => count % 17,
                    _ => count,
                };
                let cf = self.get_flag(CPU_FLAG_CARRY);
                let (result, carry) = shift_dispatch!(width, value, alu_rcr(rot, cf));
                let msb = msb_of(result);
                let next = result & (width.sign_bit() >> 1) != 0;
                self.set_flag_state(CPU_FLAG_CARRY, carry);
                self.set_flag_state(CPU_FLAG_OVERFLOW, msb != next);
                result
            }
            _ => value & width.mask(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_x64::{CPU_FLAG_SIGN, CPU_FLAG_ZERO};

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_add(OperandWidth::Byte, 0x7F, 0x01);
        assert_eq!(r, 0x80);
        assert!(cpu.get_flag(CPU_FLAG_OVERFLOW));
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_SIGN));
        assert!(cpu.get_flag(CPU_FLAG_AUX_CARRY));

        let r = cpu.alu_op_add(OperandWidth::Byte, 0xFF, 0x01);
        assert_eq!(r, 0x00);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_ZERO));
        assert!(!cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn adc_chains_carry() {
        let mut cpu = Intel64::new();
        cpu.alu_op_add(OperandWidth::Dword, 0xFFFF_FFFF, 1); // CF=1
        let r = cpu.alu_op_adc(OperandWidth::Dword, 10, 20);
        assert_eq!(r, 31);
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn sub_borrow() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_sub(OperandWidth::Word, 0x0000, 0x0001);
        assert_eq!(r, 0xFFFF);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(!cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut cpu = Intel64::new();
        cpu.set_flag(CPU_FLAG_CARRY);
        let r = cpu.alu_op_inc(OperandWidth::Byte, 0xFF);
        assert_eq!(r, 0);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_ZERO));
    }

    #[test]
    fn logic_clears_carry() {
        let mut cpu = Intel64::new();
        cpu.set_flag(CPU_FLAG_CARRY);
        cpu.set_flag(CPU_FLAG_OVERFLOW);
        let r = cpu.alu_op_and(OperandWidth::Dword, 0xFF00, 0x0FF0);
        assert_eq!(r, 0x0F00);
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
        assert!(!cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn shl_carry_and_overflow() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_shift(Mnemonic::SHL, OperandWidth::Byte, 0xC0, 1);
        assert_eq!(r, 0x80);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        // CF=1 and MSB=1: no overflow
        assert!(!cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn shift_count_zero_leaves_flags() {
        let mut cpu = Intel64::new();
        cpu.set_flag(CPU_FLAG_CARRY);
        // Count 32 masks to zero for a byte operand
        let r = cpu.alu_op_shift(Mnemonic::SHR, OperandWidth::Byte, 0xAA, 32);
        assert_eq!(r, 0xAA);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn sar_keeps_sign() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_shift(Mnemonic::SAR, OperandWidth::Byte, 0x82, 1);
        assert_eq!(r, 0xC1);
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn rcl_rotates_through_carry() {
        let mut cpu = Intel64::new();
        cpu.set_flag(CPU_FLAG_CARRY);
        // 9-bit rotate by 9 on a byte is the identity
        let r = cpu.alu_op_shift(Mnemonic::RCL, OperandWidth::Byte, 0x55, 9);
        assert_eq!(r, 0x55);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));

        cpu.clear_flag(CPU_FLAG_CARRY);
        let r = cpu.alu_op_shift(Mnemonic::RCL, OperandWidth::Byte, 0x80, 1);
        assert_eq!(r, 0x00);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn ror_sets_overflow_from_top_bits() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_shift(Mnemonic::ROR, OperandWidth::Byte, 0x01, 1);
        assert_eq!(r, 0x80);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn qword_shift_uses_six_bit_count() {
        let mut cpu = Intel64::new();
        let r = cpu.alu_op_shift(Mnemonic::SHL, OperandWidth::Qword, 1, 0x3F);
        assert_eq!(r, 0x8000_0000_0000_0000);
        // Count 64 masks to zero
        let r = cpu.alu_op_shift(Mnemonic::SHL, OperandWidth::Qword, 1, 64);
        assert_eq!(r, 1);
    }
}
