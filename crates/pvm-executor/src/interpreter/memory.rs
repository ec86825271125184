//! Paged VM memory.

use std::collections::BTreeMap;

use crate::{
    constants::vm::{PAGE_SIZE, RESERVED_LOW_MEMORY},
    MemoryFault,
};

/// Access rights of a mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    /// The page can only be read.
    ReadOnly,
    /// The page can be read and written.
    ReadWrite,
}

#[derive(Debug, Clone)]
struct Page {
    data: Box<[u8]>,
    access: PageAccess,
}

/// A sparse, page-granular address space.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    pages: BTreeMap<u32, Page>,
}

/// Start address of the page containing `address`.
pub const fn page_start(address: u32) -> u32 {
    address - address % PAGE_SIZE
}

impl Memory {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `page_count` zeroed pages starting at the page-aligned `start`, then copies `contents`
    /// to the beginning of the region.
    pub fn map(&mut self, start: u32, page_count: u32, access: PageAccess, contents: &[u8]) {
        debug_assert_eq!(start % PAGE_SIZE, 0, "unaligned mapping");
        for (index, page) in (0..page_count).map(|i| start + i * PAGE_SIZE).enumerate() {
            let mut data = vec![0; PAGE_SIZE as usize].into_boxed_slice();
            let offset = index * PAGE_SIZE as usize;
            if let Some(chunk) = contents.get(offset..) {
                let len = chunk.len().min(PAGE_SIZE as usize);
                data[..len].copy_from_slice(&chunk[..len]);
            }
            self.pages.insert(page, Page { data, access });
        }
    }

    /// Checks that every byte of `[address, address + length)` can be accessed.
    fn check(&self, address: u32, length: u32, write: bool) -> Result<(), MemoryFault> {
        if length == 0 {
            return Ok(());
        }
        let last = address
            .checked_add(length - 1)
            .ok_or(MemoryFault::Page { page: page_start(u32::MAX) })?;
        if address < RESERVED_LOW_MEMORY {
            return Err(MemoryFault::Reserved { address });
        }
        let mut page = page_start(address);
        loop {
            match self.pages.get(&page) {
                Some(entry) if !write || entry.access == PageAccess::ReadWrite => {}
                _ => return Err(MemoryFault::Page { page }),
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) if next <= last => page = next,
                _ => return Ok(()),
            }
        }
    }

    /// Reads `length` bytes starting at `address`.
    pub fn read(&self, address: u32, length: u32) -> Result<Vec<u8>, MemoryFault> {
        self.check(address, length, false)?;
        let mut out = Vec::with_capacity(length as usize);
        let mut cursor = address;
        let end = address as u64 + length as u64;
        while (cursor as u64) < end {
            let page = page_start(cursor);
            let offset = (cursor - page) as usize;
            let take = (PAGE_SIZE as usize - offset).min((end - cursor as u64) as usize);
            let data = &self.pages[&page].data;
            out.extend_from_slice(&data[offset..offset + take]);
            cursor = cursor.wrapping_add(take as u32);
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    /// Writes `bytes` starting at `address`.
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryFault> {
        let length = u32::try_from(bytes.len())
            .map_err(|_| MemoryFault::Page { page: page_start(address) })?;
        self.check(address, length, true)?;
        let mut cursor = address;
        let mut rest = bytes;
        while !rest.is_empty() {
            let page = page_start(cursor);
            let offset = (cursor - page) as usize;
            let take = (PAGE_SIZE as usize - offset).min(rest.len());
            if let Some(entry) = self.pages.get_mut(&page) {
                entry.data[offset..offset + take].copy_from_slice(&rest[..take]);
            }
            rest = &rest[take..];
            cursor = cursor.wrapping_add(take as u32);
        }
        Ok(())
    }

    /// Reads a little-endian integer of `N` bytes, zero extended.
    pub fn read_uint<const N: usize>(&self, address: u32) -> Result<u64, MemoryFault> {
        let bytes = self.read(address, N as u32)?;
        Ok(bytes.iter().rev().fold(0, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    /// Writes the low `N` bytes of `value` in little-endian order.
    pub fn write_uint<const N: usize>(&mut self, address: u32, value: u64) -> Result<(), MemoryFault> {
        self.write(address, &value.to_le_bytes()[..N])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::vm::HEAP_START;

    #[test]
    fn test_read_write_across_pages() {
        let mut memory = Memory::new();
        memory.map(HEAP_START, 2, PageAccess::ReadWrite, &[]);
        let address = HEAP_START + PAGE_SIZE - 2;
        memory.write(address, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read(address, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(memory.read_uint::<4>(address).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_faults() {
        let mut memory = Memory::new();
        memory.map(HEAP_START, 1, PageAccess::ReadOnly, &[7]);
        assert_eq!(memory.read(HEAP_START, 1).unwrap(), vec![7]);
        assert_eq!(memory.write(HEAP_START, &[1]), Err(MemoryFault::Page { page: HEAP_START }));
        assert_eq!(
            memory.read(HEAP_START + PAGE_SIZE - 1, 2),
            Err(MemoryFault::Page { page: HEAP_START + PAGE_SIZE })
        );
        assert_eq!(memory.read(16, 1), Err(MemoryFault::Reserved { address: 16 }));
    }

    #[test]
    fn test_empty_access_never_faults() {
        let memory = Memory::new();
        assert_eq!(memory.read(0, 0).unwrap(), Vec::<u8>::new());
    }
}
