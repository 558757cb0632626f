//! Physical NOR access.
//!
//! The FTL talks to the chip only through [`NorFlash`]. Offsets and block
//! indices address the medium handed to the FTL; retry policy, bus timing and
//! chip quirks belong to the adapter.

use crate::config::{Addr, BlockIx, Counter};
use crate::error::FlashError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    pub block_count: BlockIx,
    pub block_size: u32,
}

impl FlashGeometry {
    pub fn size(&self) -> Addr {
        Addr::from(self.block_count) * Addr::from(self.block_size)
    }
}

pub trait NorFlash {
    fn geometry(&self) -> FlashGeometry;

    /// Sets every byte of `block` to 0xFF.
    fn erase_block(&mut self, block: BlockIx) -> Result<(), FlashError>;

    fn read(&mut self, offset: Addr, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Programs `data` at `offset`. Bits can only go from 1 to 0.
    fn write(&mut self, offset: Addr, data: &[u8]) -> Result<(), FlashError>;
}

impl<T: NorFlash + ?Sized> NorFlash for &mut T {
    fn geometry(&self) -> FlashGeometry {
        (**self).geometry()
    }

    fn erase_block(&mut self, block: BlockIx) -> Result<(), FlashError> {
        (**self).erase_block(block)
    }

    fn read(&mut self, offset: Addr, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: Addr, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(offset, data)
    }
}

/// In-memory NOR device.
///
/// Programs AND into the array and refuse to set bits, so an FTL bug that
/// relies on overwriting shows up as [`FlashError::BitSet`]. A power cut can be
/// scheduled after a number of erase/program operations; every mutating call
/// past that point fails with [`FlashError::PowerLoss`] and leaves the array
/// untouched.
#[derive(Clone)]
pub struct RamFlash {
    geometry: FlashGeometry,
    data: Vec<u8>,
    erase_counts: Vec<Counter>,
    ops_left: Option<usize>,
    ops: usize,
}

impl RamFlash {
    /// A factory-fresh (fully erased) device.
    pub fn new(block_count: BlockIx, block_size: u32) -> Self {
        let geometry = FlashGeometry {
            block_count,
            block_size,
        };
        RamFlash {
            geometry,
            data: vec![0xFF; geometry.size() as usize],
            erase_counts: vec![0; block_count as usize],
            ops_left: None,
            ops: 0,
        }
    }

    /// Let `ops` more erase/program calls through, then cut power.
    pub fn cut_power_after(&mut self, ops: usize) {
        self.ops_left = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.ops_left = None;
    }

    /// Erase/program calls accepted so far.
    pub fn op_count(&self) -> usize {
        self.ops
    }

    /// How many times `block` was erased since this device was created.
    pub fn erase_count(&self, block: BlockIx) -> Counter {
        self.erase_counts[block as usize]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: Addr, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let size = self.geometry.size();
        match offset.checked_add(len as Addr) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(FlashError::OutOfBounds { offset, len, size }),
        }
    }

    fn take_op(&mut self) -> Result<(), FlashError> {
        match self.ops_left {
            Some(0) => Err(FlashError::PowerLoss),
            Some(ref mut left) => {
                *left -= 1;
                self.ops += 1;
                Ok(())
            }
            None => {
                self.ops += 1;
                Ok(())
            }
        }
    }
}

impl NorFlash for RamFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn erase_block(&mut self, block: BlockIx) -> Result<(), FlashError> {
        if block >= self.geometry.block_count {
            return Err(FlashError::BadBlock(block));
        }
        self.take_op()?;

        let size = self.geometry.block_size as usize;
        let start = block as usize * size;
        self.data[start..start + size].fill(0xFF);
        self.erase_counts[block as usize] += 1;
        Ok(())
    }

    fn read(&mut self, offset: Addr, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, offset: Addr, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(offset, data.len())?;
        for (i, (cell, new)) in self.data[range.clone()].iter().zip(data).enumerate() {
            if cell & new != *new {
                return Err(FlashError::BitSet {
                    offset: offset + i as Addr,
                });
            }
        }
        self.take_op()?;

        for (cell, new) in self.data[range].iter_mut().zip(data) {
            *cell &= new;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_device_reads_erased() {
        let mut flash = RamFlash::new(2, 64);
        let mut buf = [0u8; 16];
        flash.read(70, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn program_only_clears_bits() {
        let mut flash = RamFlash::new(1, 64);
        flash.write(0, &[0xF0]).unwrap();
        flash.write(0, &[0x30]).unwrap();
        assert_eq!(flash.as_bytes()[0], 0x30);

        assert_eq!(flash.write(0, &[0xFF]), Err(FlashError::BitSet { offset: 0 }));
        assert_eq!(flash.as_bytes()[0], 0x30);
    }

    #[test]
    fn erase_restores_block_and_counts() {
        let mut flash = RamFlash::new(2, 64);
        flash.write(64, &[0u8; 64]).unwrap();
        flash.erase_block(1).unwrap();

        assert!(flash.as_bytes()[64..].iter().all(|b| *b == 0xFF));
        assert_eq!(flash.erase_count(0), 0);
        assert_eq!(flash.erase_count(1), 1);
        assert_eq!(flash.erase_block(2), Err(FlashError::BadBlock(2)));
    }

    #[test]
    fn rejects_access_past_end() {
        let mut flash = RamFlash::new(1, 64);
        let mut buf = [0u8; 8];
        assert!(matches!(flash.read(60, &mut buf), Err(FlashError::OutOfBounds { .. })));
    }

    #[test]
    fn power_cut_stops_mutation() {
        let mut flash = RamFlash::new(1, 64);
        flash.cut_power_after(1);
        flash.write(0, &[0x00]).unwrap();
        assert_eq!(flash.write(1, &[0x00]), Err(FlashError::PowerLoss));
        assert_eq!(flash.erase_block(0), Err(FlashError::PowerLoss));
        assert_eq!(flash.as_bytes()[1], 0xFF);
        assert_eq!(flash.op_count(), 1);

        flash.restore_power();
        flash.erase_block(0).unwrap();
        assert_eq!(flash.as_bytes()[0], 0xFF);
    }
}
