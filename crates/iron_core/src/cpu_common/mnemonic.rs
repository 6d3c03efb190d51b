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

    cpu_common::mnemonic.rs

    Mnemonic enum for the decoded instruction set.

*/

use strum_macros::Display;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq)]
pub enum Mnemonic {
    #[default]
    NOP,
    // ALU
    ADD,
    OR,
    ADC,
    SBB,
    AND,
    SUB,
    XOR,
    CMP,
    TEST,
    NOT,
    NEG,
    MUL,
    IMUL,
    DIV,
    IDIV,
    INC,
    DEC,
    SHL,
    SHR,
    SAR,
    ROL,
    ROR,
    RCL,
    RCR,
    // Data movement
    MOV,
    MOVZX,
    MOVSX,
    MOVSXD,
    LEA,
    XCHG,
    XADD,
    CMPXCHG,
    CMPXCHG8B,
    PUSH,
    POP,
    PUSHF,
    POPF,
    // Control transfer
    JMP,
    JMPF,
    CALL,
    CALLF,
    RETN,
    RETF,
    IRET,
    JO,
    JNO,
    JB,
    JNB,
    JZ,
    JNZ,
    JBE,
    JNBE,
    JS,
    JNS,
    JP,
    JNP,
    JL,
    JNL,
    JLE,
    JNLE,
    LOOP,
    LOOPE,
    LOOPNE,
    JCXZ,
    INT,
    INT3,
    INTO,
    HLT,
    // Flags
    CLI,
    STI,
    CLC,
    STC,
    CMC,
    CLD,
    STD,
    // String & port I/O
    MOVS,
    CMPS,
    STOS,
    LODS,
    SCAS,
    INS,
    OUTS,
    IN,
    OUT,
    // System
    LGDT,
    LIDT,
    LLDT,
    LTR,
    INVLPG,
    RDMSR,
    WRMSR,
    // SSE
    MOVDQA,
    MOVDQU,
    PCMPESTRI,
    PCMPESTRM,
    PCMPISTRI,
    PCMPISTRM,
    InvalidOpcode,
}

impl Mnemonic {
    /// True for instructions that end a decoded trace.
    pub fn is_branch(&self) -> bool {
        use Mnemonic::*;
        matches!(
            self,
            JMP | JMPF
                | CALL
                | CALLF
                | RETN
                | RETF
                | IRET
                | JO
                | JNO
                | JB
                | JNB
                | JZ
                | JNZ
                | JBE
                | JNBE
                | JS
                | JNS
                | JP
                | JNP
                | JL
                | JNL
                | JLE
                | JNLE
                | LOOP
                | LOOPE
                | LOOPNE
                | JCXZ
                | INT
                | INT3
                | INTO
                | HLT
        )
    }
}
