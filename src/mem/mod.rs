//! Physical memory: a host-backed byte array, the A20 mask, and the sparse
//! memory-provider map over the first megabyte.
//!
//! Modeled as a trait (`MemoryProvider`) the CPU's consumer implements for
//! ROM, VGA RAM and similar devices, which this crate deliberately doesn't
//! own — only the seam they plug into.

const PROVIDER_BLOCK_SIZE: usize = 16 * 1024;
const PROVIDER_REGION_BYTES: usize = 1024 * 1024;
const PROVIDER_BLOCK_COUNT: usize = PROVIDER_REGION_BYTES / PROVIDER_BLOCK_SIZE;

/// A memory-mapped device. Reads/writes are dispatched serially; a provider
/// must not call back into the CPU's execution path.
pub trait MemoryProvider {
    fn base(&self) -> u32;
    fn size(&self) -> u32;
    fn read(&mut self, offset: u32, width: u32) -> u32;
    fn write(&mut self, offset: u32, width: u32, value: u32);

    /// A stable pointer usable for direct reads, if the provider can offer
    /// one (e.g. a ROM image mapped read-only). `None` forces the caller
    /// through `read`.
    fn direct_read_ptr(&self) -> Option<*const u8> {
        None
    }
}

/// Notified whenever a write lands in the VGA text window, so a consumer can
/// redraw without the CPU owning a framebuffer.
pub trait MemoryWriteObserver {
    fn on_write(&mut self, physical_address: u32, len: u32);
}

const TEXT_WINDOW_START: u32 = 0xB8000;
const TEXT_WINDOW_END: u32 = 0xC0000;

pub struct PhysicalMemory {
    bytes: Vec<u8>,
    a20_enabled: bool,
    providers: Vec<Box<dyn MemoryProvider>>,
    /// Maps each 16 KiB block in the low megabyte to an index into
    /// `providers`, if owned.
    block_owner: [Option<usize>; PROVIDER_BLOCK_COUNT],
    write_observer: Option<Box<dyn MemoryWriteObserver>>,
}

impl PhysicalMemory {
    pub fn new(size_bytes: usize) -> PhysicalMemory {
        PhysicalMemory {
            bytes: vec![0; size_bytes],
            a20_enabled: true,
            providers: Vec::new(),
            block_owner: [None; PROVIDER_BLOCK_COUNT],
            write_observer: None,
        }
    }

    pub fn set_write_observer(&mut self, observer: Box<dyn MemoryWriteObserver>) {
        self.write_observer = Some(observer);
    }

    pub fn set_a20_enabled(&mut self, enabled: bool) {
        self.a20_enabled = enabled;
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_enabled
    }

    /// ANDs off the 21st address line (bit 20) when A20 is masked.
    pub fn apply_a20(&self, physical_address: u32) -> u32 {
        if self.a20_enabled {
            physical_address
        } else {
            physical_address & !(1 << 20)
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Registers a provider owning `[provider.base(), provider.base() +
    /// provider.size())`, which must lie within the low megabyte and align
    /// to the 16 KiB block grid, and must not overlap an already-owned
    /// block.
    pub fn register_provider(&mut self, provider: Box<dyn MemoryProvider>) {
        let base = provider.base() as usize;
        let size = provider.size() as usize;
        assert!(base + size <= PROVIDER_REGION_BYTES, "provider range exceeds the low megabyte");
        assert_eq!(base % PROVIDER_BLOCK_SIZE, 0, "provider base must be block-aligned");

        let index = self.providers.len();
        let first_block = base / PROVIDER_BLOCK_SIZE;
        let block_count = (size + PROVIDER_BLOCK_SIZE - 1) / PROVIDER_BLOCK_SIZE;
        for block in first_block..first_block + block_count {
            assert!(self.block_owner[block].is_none(), "provider ranges must not overlap");
            self.block_owner[block] = Some(index);
        }
        self.providers.push(provider);
    }

    fn provider_for(&self, physical_address: u32) -> Option<usize> {
        if (physical_address as usize) >= PROVIDER_REGION_BYTES {
            return None;
        }
        self.block_owner[physical_address as usize / PROVIDER_BLOCK_SIZE]
    }

    pub fn read(&mut self, physical_address: u32, width_bytes: u32) -> u32 {
        let physical_address = self.apply_a20(physical_address);
        if let Some(index) = self.provider_for(physical_address) {
            let provider = &mut self.providers[index];
            let offset = physical_address - provider.base();
            return provider.read(offset, width_bytes * 8);
        }
        let mut value = 0u32;
        for i in 0..width_bytes {
            let byte = self.raw_byte(physical_address + i);
            value |= (byte as u32) << (i * 8);
        }
        value
    }

    pub fn write(&mut self, physical_address: u32, width_bytes: u32, value: u32) {
        let physical_address = self.apply_a20(physical_address);
        if let Some(index) = self.provider_for(physical_address) {
            let provider = &mut self.providers[index];
            let offset = physical_address - provider.base();
            provider.write(offset, width_bytes * 8, value);
        } else {
            for i in 0..width_bytes {
                self.set_raw_byte(physical_address + i, (value >> (i * 8)) as u8);
            }
        }
        self.notify_if_text_window(physical_address, width_bytes);
    }

    fn notify_if_text_window(&mut self, physical_address: u32, len: u32) {
        let end = physical_address.saturating_add(len);
        if physical_address < TEXT_WINDOW_END && end > TEXT_WINDOW_START {
            if let Some(observer) = self.write_observer.as_mut() {
                observer.on_write(physical_address, len);
            }
        }
    }

    fn raw_byte(&self, physical_address: u32) -> u8 {
        *self.bytes.get(physical_address as usize).unwrap_or(&0xFF)
    }

    fn set_raw_byte(&mut self, physical_address: u32, value: u8) {
        if let Some(slot) = self.bytes.get_mut(physical_address as usize) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoggingRom {
        base: u32,
        data: Vec<u8>,
    }

    impl MemoryProvider for LoggingRom {
        fn base(&self) -> u32 {
            self.base
        }
        fn size(&self) -> u32 {
            self.data.len() as u32
        }
        fn read(&mut self, offset: u32, width: u32) -> u32 {
            let mut value = 0u32;
            for i in 0..(width / 8) {
                value |= (*self.data.get((offset + i) as usize).unwrap_or(&0) as u32) << (i * 8);
            }
            value
        }
        fn write(&mut self, _offset: u32, _width: u32, _value: u32) {}
    }

    #[test]
    fn raw_array_round_trips() {
        let mut mem = PhysicalMemory::new(0x10000);
        mem.write(0x100, 4, 0xDEAD_BEEF);
        assert_eq!(mem.read(0x100, 4), 0xDEAD_BEEF);
    }

    #[test]
    fn provider_bypasses_raw_array() {
        let mut mem = PhysicalMemory::new(0x10_0000);
        mem.register_provider(Box::new(LoggingRom {
            base: 0,
            data: vec![0xAA, 0xBB],
        }));
        assert_eq!(mem.read(0, 1), 0xAA);
        // Raw array underneath is untouched.
        assert_eq!(mem.bytes[0], 0);
    }

    #[test]
    fn a20_mask_wraps_bit_20() {
        let mut mem = PhysicalMemory::new(2 * 1024 * 1024);
        mem.set_a20_enabled(false);
        mem.write(0x10_0000, 1, 0x42);
        assert_eq!(mem.read(0x0, 1), 0x42);
    }
}
