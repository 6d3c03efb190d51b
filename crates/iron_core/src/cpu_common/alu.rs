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

    cpu_common::alu.rs

    Flag-pure arithmetic kernels shared by the CPU cores. Every operation
    takes plain integer inputs and returns the result together with the
    derived carry/overflow/aux flags as a tuple; no CPU state is read or
    written here.

*/

pub trait AluNeg: Sized {
    fn alu_neg(self) -> (Self, bool, bool, bool);
}

pub trait AluSub<Rhs = Self>: Sized {
    fn alu_sub(self, rhs: Rhs) -> (Self, bool, bool, bool);
}

pub trait AluSbb<Rhs = Self>: Sized {
    fn alu_sbb(self, rhs: Rhs, carry: bool) -> (Self, bool, bool, bool);
}

pub trait AluAdd<Rhs = Self>: Sized {
    fn alu_add(self, rhs: Rhs) -> (Self, bool, bool, bool);
}

pub trait AluAdc<Rhs = Self>: Sized {
    fn alu_adc(self, rhs: Rhs, carry: bool) -> (Self, bool, bool, bool);
}

macro_rules! impl_neg {
    ($prim:ty) => {
        impl AluNeg for $prim {
            /// Negation
            ///
            /// Implemented as Sub(0 - Self); flags are identical to Sub.
            fn alu_neg(self) -> (Self, bool, bool, bool) {
                0.alu_sub(self)
            }
        }
    };
}

macro_rules! impl_sub {
    ($prim:ty) => {
        impl AluSub for $prim {
            /// Subtraction
            ///
            /// Carry flag is set if unsigned overflow occurred
            /// Overflow flag is set if signed overflow occurred
            /// AF flag is set on borrow from the top nibble
            fn alu_sub(self, rhs: Self) -> (Self, bool, bool, bool) {
                let (result, carry) = self.overflowing_sub(rhs);
                let overflow = (self ^ rhs) & (self ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((self ^ rhs ^ result) & 0x10) != 0;
                (result, carry, overflow, aux_carry)
            }
        }
    };
}

macro_rules! impl_sbb {
    ($prim:ty) => {
        impl AluSbb for $prim {
            /// Subtraction with borrow from carry flag
            ///
            /// DEST := DEST - (SRC + CF). The borrow chain is computed in two
            /// steps so the widest primitive needs no wider intermediate.
            fn alu_sbb(self, rhs: Self, carry_in: bool) -> (Self, bool, bool, bool) {
                let (partial, carry1) = self.overflowing_sub(rhs);
                let (result, carry2) = partial.overflowing_sub(carry_in as $prim);
                let carry = carry1 | carry2;
                let overflow = (self ^ rhs) & (self ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((self ^ rhs ^ result) & 0x10) != 0;
                (result, carry, overflow, aux_carry)
            }
        }
    };
}

macro_rules! impl_add {
    ($prim:ty) => {
        impl AluAdd for $prim {
            /// Addition
            ///
            /// Carry flag is set if unsigned overflow occurred
            /// Overflow flag is set if signed overflow occurred
            /// AF flag is set on carry out of the low nibble
            fn alu_add(self, rhs: Self) -> (Self, bool, bool, bool) {
                let (result, carry) = self.overflowing_add(rhs);
                let overflow = (self ^ result) & (rhs ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((self ^ rhs ^ result) & 0x10) != 0;
                (result, carry, overflow, aux_carry)
            }
        }
    };
}

macro_rules! impl_adc {
    ($prim:ty) => {
        impl AluAdc for $prim {
            /// Addition with carry from carry flag
            ///
            /// DEST := DEST + SRC + CF, two-step carry chain as for Sbb.
            fn alu_adc(self, rhs: Self, carry_in: bool) -> (Self, bool, bool, bool) {
                let (partial, carry1) = self.overflowing_add(rhs);
                let (result, carry2) = partial.overflowing_add(carry_in as $prim);
                let carry = carry1 | carry2;
                let overflow = (self ^ result) & (rhs ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((self ^ rhs ^ result) & 0x10) != 0;
                (result, carry, overflow, aux_carry)
            }
        }
    };
}

impl_neg!(u8);
impl_neg!(u16);
impl_neg!(u32);
impl_neg!(u64);
impl_sub!(u8);
impl_sub!(u16);
impl_sub!(u32);
impl_sub!(u64);
impl_sbb!(u8);
impl_sbb!(u16);
impl_sbb!(u32);
impl_sbb!(u64);
impl_add!(u8);
impl_add!(u16);
impl_add!(u32);
impl_add!(u64);
impl_adc!(u8);
impl_adc!(u16);
impl_adc!(u32);
impl_adc!(u64);

/* ------------------------- Bitwise operations ---------------------------- */

pub trait AluShiftLeft: Sized {
    fn alu_shl(self, count: u8) -> (Self, bool);
}

macro_rules! impl_shl {
    ($prim:ty) => {
        impl AluShiftLeft for $prim {
            fn alu_shl(mut self, mut count: u8) -> (Self, bool) {
                let mut carry = false;
                while count > 0 {
                    carry = self >> (<$prim>::BITS - 1) != 0;
                    self <<= 1;
                    count -= 1;
                }
                (self, carry)
            }
        }
    };
}

pub trait AluShiftRight: Sized {
    fn alu_shr(self, count: u8) -> (Self, bool);
}

macro_rules! impl_shr {
    ($prim:ty) => {
        impl AluShiftRight for $prim {
            fn alu_shr(mut self, mut count: u8) -> (Self, bool) {
                let mut carry = false;
                while count > 0 {
                    carry = self & 0x01 != 0;
                    self >>= 1;
                    count -= 1;
                }
                (self, carry)
            }
        }
    };
}

pub trait AluShiftArithmeticRight: Sized {
    fn alu_sar(self, count: u8) -> (Self, bool);
}

macro_rules! impl_sar {
    ($prim:ty, $signed:ty) => {
        impl AluShiftArithmeticRight for $prim {
            fn alu_sar(mut self, mut count: u8) -> (Self, bool) {
                let mut carry = false;
                while count > 0 {
                    carry = self & 0x01 != 0;
                    self = ((self as $signed) >> 1) as $prim;
                    count -= 1;
                }
                (self, carry)
            }
        }
    };
}

pub trait AluRotateLeft: Sized {
    fn alu_rol(self, count: u8) -> (Self, bool);
}

macro_rules! impl_rol {
    ($prim:ty) => {
        impl AluRotateLeft for $prim {
            fn alu_rol(mut self, count: u8) -> (Self, bool) {
                let mut carry = 0 as $prim;
                for _ in 0..count {
                    carry = self & (1 << (<$prim>::BITS - 1));
                    self <<= 1;
                    self |= carry >> (<$prim>::BITS - 1);
                }
                (self, carry != 0)
            }
        }
    };
}

pub trait AluRotateRight: Sized {
    fn alu_ror(self, count: u8) -> (Self, bool);
}

macro_rules! impl_ror {
    ($prim:ty) => {
        impl AluRotateRight for $prim {
            fn alu_ror(mut self, count: u8) -> (Self, bool) {
                let mut carry = 0 as $prim;
                for _ in 0..count {
                    carry = self & 0x01;
                    self >>= 1;
                    self |= carry << (<$prim>::BITS - 1);
                }
                (self, carry != 0)
            }
        }
    };
}

pub trait AluRotateCarryLeft: Sized {
    fn alu_rcl(self, count: u8, carry: bool) -> (Self, bool);
}

macro_rules! impl_rcl {
    ($prim:ty) => {
        impl AluRotateCarryLeft for $prim {
            fn alu_rcl(mut self, count: u8, mut carry: bool) -> (Self, bool) {
                for _ in 0..count {
                    let msb = self >> (<$prim>::BITS - 1) != 0;
                    self <<= 1;
                    self |= carry as $prim;
                    carry = msb;
                }
                (self, carry)
            }
        }
    };
}

pub trait AluRotateCarryRight: Sized {
    fn alu_rcr(self, count: u8, carry: bool) -> (Self, bool);
}

macro_rules! impl_rcr {
    ($prim:ty) => {
        impl AluRotateCarryRight for $prim {
            fn alu_rcr(mut self, count: u8, mut carry: bool) -> (Self, bool) {
                for _ in 0..count {
                    let lsb = self & 0x01 != 0;
                    self >>= 1;
                    self |= (carry as $prim) << (<$prim>::BITS - 1);
                    carry = lsb;
                }
                (self, carry)
            }
        }
    };
}

impl_shl!(u8);
impl_shl!(u16);
impl_shl!(u32);
impl_shl!(u64);
impl_shr!(u8);
impl_shr!(u16);
impl_shr!(u32);
impl_shr!(u64);
impl_sar!(u8, i8);
impl_sar!(u16, i16);
impl_sar!(u32, i32);
impl_sar!(u64, i64);
impl_rol!(u8);
impl_rol!(u16);
impl_rol!(u32);
impl_rol!(u64);
impl_ror!(u8);
impl_ror!(u16);
impl_ror!(u32);
impl_ror!(u64);
impl_rcl!(u8);
impl_rcl!(u16);
impl_rcl!(u32);
impl_rcl!(u64);
impl_rcr!(u8);
impl_rcr!(u16);
impl_rcr!(u32);
impl_rcr!(u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_flags() {
        // 8-bit signed overflow without unsigned overflow
        let (r, c, o, a) = 0x7Fu8.alu_add(0x01);
        assert_eq!(r, 0x80);
        assert!(!c);
        assert!(o);
        assert!(a);

        // 32-bit unsigned wrap
        let (r, c, o, _) = 0xFFFF_FFFFu32.alu_add(1);
        assert_eq!(r, 0);
        assert!(c);
        assert!(!o);

        // 64-bit signed overflow
        let (r, c, o, _) = 0x7FFF_FFFF_FFFF_FFFFu64.alu_add(1);
        assert_eq!(r, 0x8000_0000_0000_0000);
        assert!(!c);
        assert!(o);
    }

    #[test]
    fn adc_carry_chain() {
        let (r, c, o, _) = 0xFFu8.alu_adc(0x00, true);
        assert_eq!(r, 0x00);
        assert!(c);
        assert!(!o);

        let (r, c, _, _) = 0xFFFF_FFFF_FFFF_FFFFu64.alu_adc(0xFFFF_FFFF_FFFF_FFFF, true);
        assert_eq!(r, 0xFFFF_FFFF_FFFF_FFFF);
        assert!(c);
    }

    #[test]
    fn sub_flags() {
        let (r, c, o, _) = 0x00u8.alu_sub(0x01);
        assert_eq!(r, 0xFF);
        assert!(c);
        assert!(!o);

        let (r, c, o, _) = 0x8000_0000u32.alu_sub(1);
        assert_eq!(r, 0x7FFF_FFFF);
        assert!(!c);
        assert!(o);
    }

    #[test]
    fn sbb_borrow_chain() {
        // 0 - (0xFF + 1) wraps cleanly with carry out and no signed overflow
        let (r, c, o, _) = 0x00u8.alu_sbb(0xFF, true);
        assert_eq!(r, 0x00);
        assert!(c);
        assert!(!o);

        let (r, _, o, _) = 0x80u8.alu_sbb(0x7F, true);
        assert_eq!(r, 0x00);
        assert!(o);
    }

    #[test]
    fn neg_flags() {
        let (r, c, o, _) = 0x80u8.alu_neg();
        assert_eq!(r, 0x80);
        assert!(c);
        assert!(o);

        let (r, c, _, _) = 0x00u16.alu_neg();
        assert_eq!(r, 0);
        assert!(!c);
    }

    #[test]
    fn shifts() {
        let (r, c) = 0x80u8.alu_shl(1);
        assert_eq!(r, 0x00);
        assert!(c);

        let (r, c) = 0x01u64.alu_shr(1);
        assert_eq!(r, 0);
        assert!(c);

        let (r, c) = 0xF0u8.alu_sar(4);
        assert_eq!(r, 0xFF);
        assert!(!c);
    }

    #[test]
    fn rotates() {
        let (r, c) = 0x81u8.alu_rol(1);
        assert_eq!(r, 0x03);
        assert!(c);

        let (r, c) = 0x01u8.alu_ror(1);
        assert_eq!(r, 0x80);
        assert!(c);

        let (r, c) = 0x80u8.alu_rcl(1, true);
        assert_eq!(r, 0x01);
        assert!(c);

        let (r, c) = 0x01u8.alu_rcr(1, false);
        assert_eq!(r, 0x00);
        assert!(c);
    }

    #[test]
    fn kernels_are_pure() {
        // Same inputs always give identical outputs
        for a in [0u32, 1, 0x7FFF_FFFF, 0x8000_0000, 0xFFFF_FFFF] {
            for b in [0u32, 1, 0x1234_5678, 0xFFFF_FFFF] {
                assert_eq!(a.alu_add(b), a.alu_add(b));
                assert_eq!(a.alu_sub(b), a.alu_sub(b));
                assert_eq!(a.alu_adc(b, true), a.alu_adc(b, true));
                assert_eq!(a.alu_sbb(b, true), a.alu_sbb(b, true));
            }
        }
    }
}
