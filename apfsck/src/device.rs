use std::io::{Read, Seek, SeekFrom};

use crate::error::{corrupt_bare, ApfsckError, Result};

/// First byte address served by the tier-2 device of a fusion pair. Offsets
/// at or above this boundary are read from tier 2 after subtracting it.
pub const TIER2_BYTE_ADDR: u64 = 0x4000_0000_0000_0000;

/// Block size assumed before the container superblock has been parsed.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Smallest block size the on-disk format allows.
pub const MIN_BLOCK_SIZE: u32 = 4096;

struct Device<R> {
    inner: R,
    bytes: u64,
}

impl<R: Read + Seek> Device<R> {
    fn open(mut inner: R) -> Result<Self> {
        let bytes = inner.seek(SeekFrom::End(0))?;
        Ok(Device { inner, bytes })
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| corrupt_bare("Block address overflows the byte offset."))?;
        if end > self.bytes {
            return Err(ApfsckError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at offset {} past end of device", buf.len(), offset),
            )));
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

/// The block address space of a container: the main device plus the optional
/// tier-2 device of a fusion drive. Every read is a fresh positional read;
/// nothing is cached and nothing is ever written.
pub struct BlockSpace<R> {
    main: Device<R>,
    tier2: Option<Device<R>>,
    block_size: u32,
}

impl<R: Read + Seek> BlockSpace<R> {
    pub fn new(main: R) -> Result<Self> {
        Ok(BlockSpace {
            main: Device::open(main)?,
            tier2: None,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    pub fn with_tier2(mut self, tier2: R) -> Result<Self> {
        self.tier2 = Some(Device::open(tier2)?);
        Ok(self)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Adopt the block size reported by the container superblock. Fixed for
    /// the rest of the run.
    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    /// Number of whole blocks on the main device.
    pub fn block_count(&self) -> u64 {
        self.main.bytes / self.block_size as u64
    }

    pub fn has_tier2(&self) -> bool {
        self.tier2.is_some()
    }

    /// Number of whole blocks on the tier-2 device, or zero without one.
    pub fn tier2_block_count(&self) -> u64 {
        match &self.tier2 {
            Some(dev) => dev.bytes / self.block_size as u64,
            None => 0,
        }
    }

    /// Read the block at physical address `paddr` into a fresh buffer.
    pub fn read_block(&mut self, paddr: u64) -> Result<Vec<u8>> {
        let block_size = self.block_size;
        let offset = paddr
            .checked_mul(block_size as u64)
            .ok_or_else(|| corrupt_bare("Block address overflows the byte offset."))?;

        let mut buf = vec![0u8; block_size as usize];
        if offset >= TIER2_BYTE_ADDR {
            let dev = self
                .tier2
                .as_mut()
                .ok_or_else(|| corrupt_bare("Address in missing tier 2 device."))?;
            dev.read_at(offset - TIER2_BYTE_ADDR, &mut buf)?;
        } else {
            self.main.read_at(offset, &mut buf)?;
        }
        Ok(buf)
    }

    /// Read `count` consecutive blocks starting at `paddr`. Used for
    /// ephemeral objects, which may span several blocks.
    pub fn read_blocks(&mut self, paddr: u64, count: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(count as usize * self.block_size as usize);
        for i in 0..count as u64 {
            buf.extend_from_slice(&self.read_block(paddr + i)?);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_block() {
        let mut image = vec![0u8; 4096 * 4];
        image[4096] = 0xAB;
        let mut space = BlockSpace::new(Cursor::new(image)).unwrap();

        assert_eq!(space.block_count(), 4);
        let block = space.read_block(1).unwrap();
        assert_eq!(block[0], 0xAB);
        assert_eq!(block.len(), 4096);
    }

    #[test]
    fn test_read_past_end() {
        let mut space = BlockSpace::new(Cursor::new(vec![0u8; 4096])).unwrap();
        match space.read_block(1) {
            Err(ApfsckError::Io(_)) => {}
            other => panic!("expected I/O error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_tier2() {
        let mut space = BlockSpace::new(Cursor::new(vec![0u8; 4096])).unwrap();
        let paddr = TIER2_BYTE_ADDR / 4096 + 1;
        let err = space.read_block(paddr).unwrap_err();
        assert_eq!(err.to_string(), "Address in missing tier 2 device.");
    }

    #[test]
    fn test_tier2_read() {
        let main = vec![0u8; 4096];
        let mut tier2 = vec![0u8; 4096 * 2];
        tier2[4096] = 0xCD;

        let mut space = BlockSpace::new(Cursor::new(main))
            .unwrap()
            .with_tier2(Cursor::new(tier2))
            .unwrap();

        assert_eq!(space.tier2_block_count(), 2);
        let paddr = TIER2_BYTE_ADDR / 4096 + 1;
        let block = space.read_block(paddr).unwrap();
        assert_eq!(block[0], 0xCD);
    }
}
