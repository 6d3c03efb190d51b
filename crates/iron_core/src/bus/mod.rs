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

    bus::mod.rs

    The BusInterface owns guest physical memory, the write-stamp table used
    for self-modifying-code detection, and the dispatch seams for memory
    mapped and port I/O devices. One bus is shared by every vCPU in the
    machine; CPUs borrow it mutably for the duration of a quantum.

*/

#![allow(dead_code)]

pub mod wstamp;

pub use wstamp::PageWriteStampTable;

use fxhash::FxHashMap;

use crate::memerror::MemError;

pub(crate) const OPEN_BUS_BYTE: u8 = 0xFF; // This is the byte read from an unmapped memory address.
pub(crate) const NO_IO_BYTE: u8 = 0xFF; // This is the byte read from a unconnected IO address.

/// Ring capacity for pending self-modifying-code events. A vCPU that falls
/// further behind than this simply flushes its whole instruction cache.
pub const SMC_EVENT_RING: usize = 16;

#[derive(Copy, Clone, Debug, Default)]
pub struct SmcEvent {
    pub paddr: u64,
    pub mask: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct MemRangeDescriptor {
    pub address: usize,
    pub size: usize,
}

impl MemRangeDescriptor {
    #[inline]
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address + len > self.address && address < self.address + self.size
    }
}

pub trait IoDevice {
    /// Read a byte from the specified port. The default implementation
    /// returns NO_IO_BYTE (0xFF).
    fn read_u8(&mut self, _port: u16) -> u8 {
        NO_IO_BYTE
    }

    /// Write a byte to the specified port. The default implementation does
    /// nothing.
    fn write_u8(&mut self, _port: u16, _data: u8) {}

    /// Return the list of ports this device responds to.
    fn port_list(&self) -> Vec<u16>;
}

pub trait MmioDevice {
    fn mmio_read_u8(&mut self, address: usize) -> u8;
    fn mmio_write_u8(&mut self, address: usize, data: u8);
}

pub struct BusInterface {
    memory: Vec<u8>,
    wstamp: PageWriteStampTable,

    smc_events: [SmcEvent; SMC_EVENT_RING],
    smc_generation: u64,

    mmio: Vec<(MemRangeDescriptor, Box<dyn MmioDevice>)>,
    io_map: FxHashMap<u16, usize>,
    io_devices: Vec<Box<dyn IoDevice>>,
}

impl BusInterface {
    pub fn new(mem_size: usize) -> BusInterface {
        BusInterface {
            memory: vec![0; mem_size],
            wstamp: PageWriteStampTable::new(mem_size),
            smc_events: [SmcEvent::default(); SMC_EVENT_RING],
            smc_generation: 0,
            mmio: Vec::new(),
            io_map: FxHashMap::default(),
            io_devices: Vec::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn wstamp(&mut self) -> &mut PageWriteStampTable {
        &mut self.wstamp
    }

    /* --------------------------- SMC event ring --------------------------- */

    #[inline]
    pub fn smc_generation(&self) -> u64 {
        self.smc_generation
    }

    fn push_smc_event(&mut self, paddr: u64, mask: u32) {
        let slot = (self.smc_generation as usize) % SMC_EVENT_RING;
        self.smc_events[slot] = SmcEvent { paddr, mask };
        self.smc_generation += 1;
    }

    /// Return the SMC events a consumer has not yet seen, oldest first.
    /// Returns None if the consumer is too far behind to replay precisely;
    /// it must then flush its instruction cache wholesale.
    pub fn smc_events_since(&self, seen: u64) -> Option<Vec<SmcEvent>> {
        let pending = self.smc_generation - seen;
        if pending == 0 {
            return Some(Vec::new());
        }
        if pending > SMC_EVENT_RING as u64 {
            return None;
        }
        let mut events = Vec::with_capacity(pending as usize);
        for n in seen..self.smc_generation {
            events.push(self.smc_events[(n as usize) % SMC_EVENT_RING]);
        }
        Some(events)
    }

    /* --------------------------- Device seams ----------------------------- */

    pub fn register_mmio_device(&mut self, range: MemRangeDescriptor, device: Box<dyn MmioDevice>) {
        self.mmio.push((range, device));
    }

    pub fn register_io_device(&mut self, device: Box<dyn IoDevice>) {
        let index = self.io_devices.len();
        for port in device.port_list() {
            if self.io_map.insert(port, index).is_some() {
                log::warn!("Port {:04X} registered twice; last device wins", port);
            }
        }
        self.io_devices.push(device);
    }

    fn mmio_index(&self, address: usize, len: usize) -> Option<usize> {
        self.mmio.iter().position(|(range, _)| range.contains(address, len))
    }

    /* --------------------------- Memory reads ----------------------------- */

    pub fn read_u8(&mut self, address: usize) -> Result<u8, MemError> {
        if let Some(index) = self.mmio_index(address, 1) {
            return Ok(self.mmio[index].1.mmio_read_u8(address));
        }
        match self.memory.get(address) {
            Some(&byte) => Ok(byte),
            None => Ok(OPEN_BUS_BYTE),
        }
    }

    pub fn read_u16(&mut self, address: usize) -> Result<u16, MemError> {
        let mut bytes = [0u8; 2];
        self.read_bytes(address, &mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn read_u32(&mut self, address: usize) -> Result<u32, MemError> {
        let mut bytes = [0u8; 4];
        self.read_bytes(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self, address: usize) -> Result<u64, MemError> {
        let mut bytes = [0u8; 8];
        self.read_bytes(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_bytes(&mut self, address: usize, buf: &mut [u8]) -> Result<(), MemError> {
        if self.mmio_index(address, buf.len()).is_some() {
            for (n, slot) in buf.iter_mut().enumerate() {
                *slot = self.read_u8(address + n)?;
            }
            return Ok(());
        }
        let end = address.saturating_add(buf.len());
        if end <= self.memory.len() {
            buf.copy_from_slice(&self.memory[address..end]);
        }
        else {
            for (n, slot) in buf.iter_mut().enumerate() {
                *slot = self.memory.get(address + n).copied().unwrap_or(OPEN_BUS_BYTE);
            }
        }
        Ok(())
    }

    /* --------------------------- Memory writes ---------------------------- */

    /// All guest stores funnel through here. Code invalidation happens
    /// before the data is committed so no stale trace can be fetched between
    /// the two.
    pub fn write_bytes(&mut self, address: usize, data: &[u8]) -> Result<(), MemError> {
        if let Some(index) = self.mmio_index(address, data.len()) {
            for (n, &byte) in data.iter().enumerate() {
                self.mmio[index].1.mmio_write_u8(address + n, byte);
            }
            return Ok(());
        }
        if address >= self.memory.len() {
            // Open bus; store is ignored
            return Ok(());
        }
        let mask = self.wstamp.dec_write_stamp(address as u64, data.len());
        if mask != 0 {
            self.push_smc_event(address as u64, mask);
        }
        let end = (address + data.len()).min(self.memory.len());
        self.memory[address..end].copy_from_slice(&data[..end - address]);
        Ok(())
    }

    pub fn write_u8(&mut self, address: usize, data: u8) -> Result<(), MemError> {
        self.write_bytes(address, &[data])
    }

    pub fn write_u16(&mut self, address: usize, data: u16) -> Result<(), MemError> {
        self.write_bytes(address, &data.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: usize, data: u32) -> Result<(), MemError> {
        self.write_bytes(address, &data.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: usize, data: u64) -> Result<(), MemError> {
        self.write_bytes(address, &data.to_le_bytes())
    }

    /// Host-side bulk load (program images, boot code). Bypasses the write
    /// stamps; callers load before execution starts or flush caches after.
    pub fn copy_from(&mut self, src: &[u8], address: usize) -> Result<(), MemError> {
        if address + src.len() > self.memory.len() {
            return Err(MemError::WriteOutOfBoundsError);
        }
        self.memory[address..address + src.len()].copy_from_slice(src);
        Ok(())
    }

    /* ----------------------------- Port I/O ------------------------------- */

    pub fn io_read_u8(&mut self, port: u16) -> u8 {
        match self.io_map.get(&port) {
            Some(&index) => self.io_devices[index].read_u8(port),
            None => NO_IO_BYTE,
        }
    }

    pub fn io_write_u8(&mut self, port: u16, data: u8) {
        if let Some(&index) = self.io_map.get(&port) {
            self.io_devices[index].write_u8(port, data);
        }
    }

    pub fn io_read_u16(&mut self, port: u16) -> u16 {
        let lo = self.io_read_u8(port) as u16;
        let hi = self.io_read_u8(port.wrapping_add(1)) as u16;
        hi << 8 | lo
    }

    pub fn io_write_u16(&mut self, port: u16, data: u16) {
        self.io_write_u8(port, data as u8);
        self.io_write_u8(port.wrapping_add(1), (data >> 8) as u8);
    }

    pub fn io_read_u32(&mut self, port: u16) -> u32 {
        let lo = self.io_read_u16(port) as u32;
        let hi = self.io_read_u16(port.wrapping_add(2)) as u32;
        hi << 16 | lo
    }

    pub fn io_write_u32(&mut self, port: u16, data: u32) {
        self.io_write_u16(port, data as u16);
        self.io_write_u16(port.wrapping_add(2), (data >> 16) as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScratchPort {
        last: u8,
    }

    impl IoDevice for ScratchPort {
        fn read_u8(&mut self, _port: u16) -> u8 {
            self.last
        }
        fn write_u8(&mut self, _port: u16, data: u8) {
            self.last = data;
        }
        fn port_list(&self) -> Vec<u16> {
            vec![0x80]
        }
    }

    #[test]
    fn open_bus_reads_ff() {
        let mut bus = BusInterface::new(0x1000);
        assert_eq!(bus.read_u8(0x2000).unwrap(), 0xFF);
        assert_eq!(bus.read_u32(0xFFFF_0000).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn rmw_little_endian() {
        let mut bus = BusInterface::new(0x1000);
        bus.write_u32(0x100, 0x1122_3344).unwrap();
        assert_eq!(bus.read_u8(0x100).unwrap(), 0x44);
        assert_eq!(bus.read_u16(0x102).unwrap(), 0x1122);
    }

    #[test]
    fn store_to_decoded_code_raises_smc_event() {
        let mut bus = BusInterface::new(0x10000);
        bus.wstamp().mark_icache(0x400, 16);
        let gen0 = bus.smc_generation();
        bus.write_u8(0x404, 0x90).unwrap();
        assert_eq!(bus.smc_generation(), gen0 + 1);
        let events = bus.smc_events_since(gen0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].paddr, 0x404);
        assert_eq!(events[0].mask, 0x1);
    }

    #[test]
    fn far_behind_consumer_is_told_to_flush() {
        let mut bus = BusInterface::new(0x10000);
        for n in 0..SMC_EVENT_RING + 1 {
            bus.wstamp().mark_icache(0x1000 + n as u64 * 0x80, 4);
            bus.write_u8(0x1000 + n * 0x80, 0).unwrap();
        }
        assert!(bus.smc_events_since(0).is_none());
    }

    #[test]
    fn port_dispatch() {
        let mut bus = BusInterface::new(0x1000);
        bus.register_io_device(Box::new(ScratchPort { last: 0 }));
        bus.io_write_u8(0x80, 0xA5);
        assert_eq!(bus.io_read_u8(0x80), 0xA5);
        assert_eq!(bus.io_read_u8(0x81), 0xFF);
    }
}
