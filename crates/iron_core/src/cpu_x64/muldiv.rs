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

    cpu_x64::muldiv.rs

    Widening multiply and narrowing divide. The divide error checks happen
    in architectural order: a zero divisor raises #DE before the quotient
    range is ever examined, and no register is written once #DE is raised.

*/

use crate::{
    cpu_common::{CpuResult, Fault, OperandWidth},
    cpu_x64::{Intel64, CPU_FLAG_AUX_CARRY, CPU_FLAG_CARRY, CPU_FLAG_OVERFLOW, RAX, RDX},
};

fn sign_extend(value: u64, width: OperandWidth) -> i64 {
    match width {
        OperandWidth::Byte => value as u8 as i8 as i64,
        OperandWidth::Word => value as u16 as i16 as i64,
        OperandWidth::Dword => value as u32 as i32 as i64,
        OperandWidth::Qword => value as i64,
    }
}

impl Intel64 {
    /// The double-width product register pair: AH:AL for bytes, otherwise
    /// rDX:rAX.
    fn read_dividend(&self, width: OperandWidth) -> u128 {
        if width == OperandWidth::Byte {
            self.gpr16(RAX) as u128
        }
        else {
            let lo = self.gpr_width(RAX, width) as u128;
            let hi = self.gpr_width(RDX, width) as u128;
            (hi << width.bits()) | lo
        }
    }

    fn write_quotient_remainder(&mut self, width: OperandWidth, quotient: u64, remainder: u64) {
        if width == OperandWidth::Byte {
            self.set_gpr8(RAX, false, quotient as u8);
            self.set_gpr8(RAX, true, remainder as u8);
        }
        else {
            self.set_gpr_width(RAX, width, quotient);
            self.set_gpr_width(RDX, width, remainder);
        }
    }

    fn write_product(&mut self, width: OperandWidth, product: u128) {
        if width == OperandWidth::Byte {
            self.set_gpr16(RAX, product as u16);
        }
        else {
            self.set_gpr_width(RAX, width, product as u64);
            self.set_gpr_width(RDX, width, (product >> width.bits()) as u64);
        }
    }

    /// Unsigned widening multiply of the accumulator. CF and OF report a
    /// non-zero upper half.
    pub(crate) fn op_mul(&mut self, width: OperandWidth, src: u64) {
        let a = self.gpr_width(RAX, width) as u128;
        let b = (src & width.mask()) as u128;
        let product = a * b;
        self.write_product(width, product);

        let upper = (product >> width.bits()) as u64;
        self.set_flag_state(CPU_FLAG_CARRY, upper != 0);
        self.set_flag_state(CPU_FLAG_OVERFLOW, upper != 0);
        self.clear_flag(CPU_FLAG_AUX_CARRY);
        self.set_szp_flags(width, product as u64);
    }

    /// One-operand signed multiply. CF and OF are set when the full
    /// product no longer fits in the low half.
    pub(crate) fn op_imul_single(&mut self, width: OperandWidth, src: u64) {
        let a = sign_extend(self.gpr_width(RAX, width), width) as i128;
        let b = sign_extend(src, width) as i128;
        let product = a * b;
        self.write_product(width, product as u128);

        let truncated = sign_extend(product as u64, width) as i128;
        let fits = truncated == product;
        self.set_flag_state(CPU_FLAG_CARRY, !fits);
        self.set_flag_state(CPU_FLAG_OVERFLOW, !fits);
        self.clear_flag(CPU_FLAG_AUX_CARRY);
        self.set_szp_flags(width, product as u64);
    }

    /// Two- and three-operand IMUL forms: the truncated product is the
    /// result, CF/OF flag the truncation.
    pub(crate) fn op_imul_general(&mut self, width: OperandWidth, a: u64, b: u64) -> u64 {
        let product = (sign_extend(a, width) as i128) * (sign_extend(b, width) as i128);
        let result = product as u64 & width.mask();

        let fits = sign_extend(result, width) as i128 == product;
        self.set_flag_state(CPU_FLAG_CARRY, !fits);
        self.set_flag_state(CPU_FLAG_OVERFLOW, !fits);
        self.clear_flag(CPU_FLAG_AUX_CARRY);
        self.set_szp_flags(width, result);
        result
    }

    pub(crate) fn op_div(&mut self, width: OperandWidth, divisor: u64) -> CpuResult<()> {
        let divisor = (divisor & width.mask()) as u128;
        if divisor == 0 {
            return Err(Fault::de());
        }
        let dividend = self.read_dividend(width);
        let quotient = dividend / divisor;
        if quotient > width.mask() as u128 {
            return Err(Fault::de());
        }
        let remainder = (dividend % divisor) as u64;
        self.write_quotient_remainder(width, quotient as u64, remainder);
        Ok(())
    }

    pub(crate) fn op_idiv(&mut self, width: OperandWidth, divisor: u64) -> CpuResult<()> {
        let divisor = sign_extend(divisor, width) as i128;
        if divisor == 0 {
            return Err(Fault::de());
        }

        let raw = self.read_dividend(width);
        let shift = 128 - 2 * width.bits();
        let dividend = ((raw << shift) as i128) >> shift;

        let quotient = dividend / divisor;
        let min = -(1i128 << (width.bits() - 1));
        let max = (1i128 << (width.bits() - 1)) - 1;
        if quotient < min || quotient > max {
            return Err(Fault::de());
        }
        let remainder = dividend % divisor;
        self.write_quotient_remainder(width, quotient as u64 & width.mask(), remainder as u64 & width.mask());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_common::FaultKind;

    #[test]
    fn mul_byte_into_ax() {
        let mut cpu = Intel64::new();
        cpu.set_gpr8(RAX, false, 200);
        cpu.op_mul(OperandWidth::Byte, 3);
        assert_eq!(cpu.gpr16(RAX), 600);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_OVERFLOW));

        cpu.set_gpr8(RAX, false, 5);
        cpu.op_mul(OperandWidth::Byte, 5);
        assert_eq!(cpu.gpr16(RAX), 25);
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn mul_qword_fills_rdx() {
        let mut cpu = Intel64::new();
        cpu.set_gpr64(RAX, u64::MAX);
        cpu.op_mul(OperandWidth::Qword, 2);
        assert_eq!(cpu.gpr64(RAX), u64::MAX - 1);
        assert_eq!(cpu.gpr64(RDX), 1);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn imul_sign_handling() {
        let mut cpu = Intel64::new();
        cpu.set_gpr32(RAX, (-5i32) as u32);
        cpu.op_imul_single(OperandWidth::Dword, 7);
        assert_eq!(cpu.gpr32(RAX) as i32, -35);
        assert_eq!(cpu.gpr32(RDX), 0xFFFF_FFFF); // sign extension of the product
        assert!(!cpu.get_flag(CPU_FLAG_CARRY));
    }

    #[test]
    fn imul_general_truncation_sets_flags() {
        let mut cpu = Intel64::new();
        let r = cpu.op_imul_general(OperandWidth::Word, 0x4000, 4);
        assert_eq!(r, 0x0000);
        assert!(cpu.get_flag(CPU_FLAG_CARRY));
        assert!(cpu.get_flag(CPU_FLAG_OVERFLOW));

        let r = cpu.op_imul_general(OperandWidth::Word, 100, 20);
        assert_eq!(r, 2000);
        assert!(!cpu.get_flag(CPU_FLAG_OVERFLOW));
    }

    #[test]
    fn div_by_zero_faults_before_anything_else() {
        let mut cpu = Intel64::new();
        cpu.set_gpr64(RAX, 1234);
        cpu.set_gpr64(RDX, 0);
        let err = cpu.op_div(OperandWidth::Dword, 0).unwrap_err();
        assert_eq!(err.kind, FaultKind::DivideError);
        // Registers untouched
        assert_eq!(cpu.gpr64(RAX), 1234);
    }

    #[test]
    fn div_quotient_overflow_faults() {
        let mut cpu = Intel64::new();
        // 0x0001_0000 / 1 does not fit in 16 bits
        cpu.set_gpr16(RAX, 0);
        cpu.set_gpr16(RDX, 1);
        assert!(cpu.op_div(OperandWidth::Word, 1).is_err());
        // The same dividend divided by 2 fits exactly
        assert!(cpu.op_div(OperandWidth::Word, 2).is_ok());
        assert_eq!(cpu.gpr16(RAX), 0x8000);
        assert_eq!(cpu.gpr16(RDX), 0);
    }

    #[test]
    fn div_byte_uses_ah_al() {
        let mut cpu = Intel64::new();
        cpu.set_gpr16(RAX, 1000);
        cpu.op_div(OperandWidth::Byte, 7).unwrap();
        assert_eq!(cpu.gpr8(RAX, false), (1000 / 7) as u8);
        assert_eq!(cpu.gpr8(RAX, true), (1000 % 7) as u8);
    }

    #[test]
    fn idiv_min_int_overflow() {
        let mut cpu = Intel64::new();
        // AX = -32768, divisor -1: quotient +32768 does not fit
        cpu.set_gpr16(RAX, 0x8000);
        cpu.set_gpr16(RDX, 0xFFFF);
        let err = cpu.op_idiv(OperandWidth::Word, 0xFFFF).unwrap_err();
        assert_eq!(err.kind, FaultKind::DivideError);
    }

    #[test]
    fn idiv_remainder_keeps_dividend_sign() {
        let mut cpu = Intel64::new();
        // EDX:EAX = -7, divisor 2 => quotient -3, remainder -1
        cpu.set_gpr32(RAX, (-7i32) as u32);
        cpu.set_gpr32(RDX, 0xFFFF_FFFF);
        cpu.op_idiv(OperandWidth::Dword, 2).unwrap();
        assert_eq!(cpu.gpr32(RAX) as i32, -3);
        assert_eq!(cpu.gpr32(RDX) as i32, -1);
    }

    #[test]
    fn idiv_qword() {
        let mut cpu = Intel64::new();
        cpu.set_gpr64(RAX, (-100i64) as u64);
        cpu.set_gpr64(RDX, u64::MAX); // sign extension
        cpu.op_idiv(OperandWidth::Qword, 9).unwrap();
        assert_eq!(cpu.gpr64(RAX) as i64, -11);
        assert_eq!(cpu.gpr64(RDX) as i64, -1);
    }
}
