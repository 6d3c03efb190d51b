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

    ---------------------------------------------------------------------------

    benches::cpu_bench.rs

    Benchmarks for the CPU core

*/

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use iron_core::{
    bus::BusInterface,
    cpu_common::Segment,
    cpu_x64::{decode::{decode, DecodeParams}, Intel64},
};

pub fn cpu_decode_bench(c: &mut Criterion) {
    // A representative mix: ALU reg/imm, memory operand, jcc
    let streams: [&[u8]; 4] = [
        &[0xB8, 0x34, 0x12, 0x00, 0x00],
        &[0x01, 0x86, 0x00, 0x20, 0x00, 0x00],
        &[0x0F, 0xB6, 0x46, 0x01],
        &[0x74, 0x10],
    ];
    let params = DecodeParams { cs_d: true, long64: false };

    let mut n = 0usize;
    c.bench_function("cpu_decode_bench", |b| {
        b.iter(|| {
            n = (n + 1) & 3;
            _ = black_box(decode(streams[n], params));
        });
    });
}

pub fn cpu_trace_execute_bench(c: &mut Criterion) {
    let mut cpu = Intel64::new();
    let mut bus = BusInterface::new(0x10_0000);
    cpu.set_real_mode_segment(Segment::CS, 0);
    cpu.set_real_mode_segment(Segment::SS, 0);
    cpu.set_gpr16(iron_core::cpu_x64::RSP, 0x8000);

    // inc ax ; add bx, ax ; xor dx, 5 ; jmp back to start
    bus.copy_from(&[0x40, 0x01, 0xC3, 0x83, 0xF2, 0x05, 0xEB, 0xF8], 0x100).unwrap();

    c.bench_function("cpu_trace_execute_bench", |b| {
        b.iter(|| {
            cpu.set_rip(0x100);
            _ = cpu.step(&mut bus);
        });
    });
}

pub fn cpu_trace_rebuild_bench(c: &mut Criterion) {
    let mut cpu = Intel64::new();
    let mut bus = BusInterface::new(0x10_0000);
    cpu.set_real_mode_segment(Segment::CS, 0);
    cpu.set_real_mode_segment(Segment::SS, 0);
    cpu.set_gpr16(iron_core::cpu_x64::RSP, 0x8000);
    bus.copy_from(&[0x40, 0x01, 0xC3, 0x83, 0xF2, 0x05, 0xEB, 0xF8], 0x100).unwrap();

    c.bench_function("cpu_trace_rebuild_bench", |b| {
        b.iter(|| {
            // Flushing each iteration measures decode + commit, not the hit path
            cpu.flush_caches();
            cpu.set_rip(0x100);
            _ = cpu.step(&mut bus);
        });
    });
}

pub fn cpu_bus_write_bench(c: &mut Criterion) {
    let mut bus = BusInterface::new(0x10_0000);

    let mut addr = 0usize;
    c.bench_function("cpu_bus_write_bench", |b| {
        b.iter(|| {
            addr = (addr + 7919) & 0xF_FFFF;
            _ = bus.write_u8(addr, 0xFF);
        });
    });
}

criterion_group!(
    cpu_benches,
    cpu_decode_bench,
    cpu_trace_execute_bench,
    cpu_trace_rebuild_bench,
    cpu_bus_write_bench,
);

criterion_main!(cpu_benches);
