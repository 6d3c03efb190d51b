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

    machine.rs

    Assembles a machine from a CoreConfig: the memory bus plus one or more
    CPU cores, and a round-robin run loop that gives each core a quantum of
    instructions in turn.

*/

use anyhow::{anyhow, Context, Error};

use crate::{
    bus::BusInterface,
    coreconfig::CoreConfig,
    cpu_common::ExecutionResult,
    cpu_x64::{CpuActivity, Intel64},
    tracelogger::TraceLogger,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MachineState {
    Running,
    /// Every core is halted with interrupts pending on none of them.
    Idle,
    Shutdown,
}

/// A callback fired between quanta, never mid-instruction. Device models
/// use these to raise interrupt lines on the cores.
pub type TimerCallback = Box<dyn FnMut(&mut [Intel64], &mut BusInterface)>;

struct Timer {
    period: u64,
    next: u64,
    callback: TimerCallback,
}

pub struct Machine {
    config: CoreConfig,
    bus: BusInterface,
    cpus: Vec<Intel64>,
    timers: Vec<Timer>,
    quantum_count: u64,
    state: MachineState,
}

impl Machine {
    pub fn new(config: CoreConfig) -> Result<Machine, Error> {
        config.validate().context("core configuration rejected")?;

        let bus = BusInterface::new(config.mem_size);
        let mut cpus = Vec::with_capacity(config.cpu_count);
        for n in 0..config.cpu_count {
            let mut cpu = Intel64::new();
            if config.trace_on {
                if let Some(path) = &config.trace_file {
                    let path = if config.cpu_count > 1 {
                        path.with_extension(format!("cpu{}.log", n))
                    }
                    else {
                        path.clone()
                    };
                    cpu.set_trace_logger(TraceLogger::from_filename(&path));
                }
            }
            cpus.push(cpu);
        }

        Ok(Machine {
            config,
            bus,
            cpus,
            timers: Vec::new(),
            quantum_count: 0,
            state: MachineState::Running,
        })
    }

    pub fn from_toml(fragment: &str) -> Result<Machine, Error> {
        let config = CoreConfig::from_toml(fragment).context("parsing core configuration")?;
        Machine::new(config)
    }

    #[inline]
    pub fn state(&self) -> MachineState {
        self.state
    }

    #[inline]
    pub fn bus(&mut self) -> &mut BusInterface {
        &mut self.bus
    }

    #[inline]
    pub fn cpu(&mut self, index: usize) -> &mut Intel64 {
        &mut self.cpus[index]
    }

    #[inline]
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Load a program image into guest memory. Caches are flushed on every
    /// core since the load bypasses the write stamps.
    pub fn load_image(&mut self, image: &[u8], address: usize) -> Result<(), Error> {
        self.bus
            .copy_from(image, address)
            .map_err(|e| anyhow!("loading {} byte image at {:08X}: {}", image.len(), address, e))?;
        for cpu in self.cpus.iter_mut() {
            cpu.flush_caches();
        }
        Ok(())
    }

    /// Register a periodic callback, with the period counted in quanta.
    /// Callbacks fire between quanta so they never observe memory
    /// mid-instruction.
    pub fn schedule_timer(&mut self, period: u64, callback: TimerCallback) {
        let period = period.max(1);
        self.timers.push(Timer {
            period,
            next: self.quantum_count + period,
            callback,
        });
    }

    fn run_timers(&mut self) {
        for timer in self.timers.iter_mut() {
            if self.quantum_count >= timer.next {
                timer.next = self.quantum_count + timer.period;
                (timer.callback)(&mut self.cpus, &mut self.bus);
            }
        }
    }

    /// Run each core for up to one quantum of instructions. Returns the
    /// machine state after the pass.
    pub fn run_quantum(&mut self) -> Result<MachineState, Error> {
        if self.state == MachineState::Shutdown {
            return Ok(self.state);
        }

        self.quantum_count += 1;
        self.run_timers();

        let mut all_parked = true;
        for (n, cpu) in self.cpus.iter_mut().enumerate() {
            let target = cpu.instr_count() + self.config.quantum_instructions as u64;
            loop {
                match cpu.step(&mut self.bus) {
                    Ok(ExecutionResult::Halt) => break,
                    Ok(_) => {
                        all_parked = false;
                        if cpu.instr_count() >= target {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("cpu{}: {}", n, e);
                        self.state = MachineState::Shutdown;
                        return Err(Error::new(e)).with_context(|| format!("cpu{} stopped", n));
                    }
                }
            }
            if cpu.activity() == CpuActivity::Shutdown {
                self.state = MachineState::Shutdown;
                return Ok(self.state);
            }
        }

        self.state = if all_parked { MachineState::Idle } else { MachineState::Running };
        Ok(self.state)
    }

    /// Run until every core halts or a core shuts down. An embedder with
    /// timers that can wake parked cores should drive `run_quantum` itself
    /// instead of treating Idle as final.
    pub fn run(&mut self) -> Result<MachineState, Error> {
        loop {
            match self.run_quantum()? {
                MachineState::Running => {}
                state => return Ok(state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_common::Segment;
    use crate::cpu_x64::{RAX, RSP};

    fn small_machine() -> Machine {
        Machine::from_toml("mem_size = 1048576").unwrap()
    }

    #[test]
    fn loads_and_runs_to_halt() {
        let mut machine = small_machine();
        // mov ax, 7 ; hlt
        machine.load_image(&[0xB8, 0x07, 0x00, 0xF4], 0x100).unwrap();
        let cpu = machine.cpu(0);
        cpu.set_real_mode_segment(Segment::CS, 0);
        cpu.set_rip(0x100);

        assert_eq!(machine.run().unwrap(), MachineState::Idle);
        assert_eq!(machine.cpu(0).gpr16(RAX), 7);
    }

    #[test]
    fn quantum_preempts_a_spinning_core() {
        let mut machine = Machine::from_toml("mem_size = 1048576\nquantum_instructions = 100").unwrap();
        // jmp $
        machine.load_image(&[0xEB, 0xFE], 0x100).unwrap();
        let cpu = machine.cpu(0);
        cpu.set_real_mode_segment(Segment::CS, 0);
        cpu.set_rip(0x100);

        assert_eq!(machine.run_quantum().unwrap(), MachineState::Running);
        let count = machine.cpu(0).instr_count();
        assert!(count >= 100);
        // A single quantum cannot run unbounded
        assert!(count < 200);
    }

    #[test]
    fn timer_wakes_a_halted_core() {
        let mut machine = small_machine();
        // hlt at 0100; vector 0x40 handler: inc ax ; hlt
        machine.load_image(&[0xF4], 0x100).unwrap();
        machine.load_image(&[0x40, 0xF4], 0x400).unwrap();
        machine.bus().write_u16(0x40 * 4, 0x0400).unwrap();
        machine.bus().write_u16(0x40 * 4 + 2, 0x0000).unwrap();
        let cpu = machine.cpu(0);
        cpu.set_real_mode_segment(Segment::CS, 0);
        cpu.set_real_mode_segment(Segment::SS, 0);
        cpu.set_gpr16(RSP, 0x8000);
        cpu.set_flag(crate::cpu_x64::CPU_FLAG_INT_ENABLE);
        cpu.set_rip(0x100);

        machine.schedule_timer(2, Box::new(|cpus, _bus| cpus[0].raise_intr(0x40)));

        // Quantum 1 parks the core; quantum 2 fires the timer and the core
        // vectors into the handler
        assert_eq!(machine.run_quantum().unwrap(), MachineState::Idle);
        assert_eq!(machine.run_quantum().unwrap(), MachineState::Running);
        assert_eq!(machine.cpu(0).gpr16(RAX), 1);
    }

    #[test]
    fn configures_requested_cpu_count() {
        let machine = Machine::from_toml("mem_size = 1048576\ncpu_count = 2").unwrap();
        assert_eq!(machine.cpu_count(), 2);
    }
}
