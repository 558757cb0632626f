//! Generic sector device interface.
//!
//! Front ends (a file system, a USB mass-storage class, a test harness) reach
//! the FTL through [`BlockDevice`] and never see blocks, headers or the map.

use crate::config::SectorNbr;
use crate::error::Result;
use crate::flash::NorFlash;
use crate::ftl::Ftl;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDevInfo {
    pub sector_size: u32,
    pub sector_size_log2: u8,
    pub sector_count: SectorNbr,
    /// Medium cannot be removed.
    pub fixed: bool,
}

pub trait BlockDevice {
    /// Makes the device ready for I/O. Opening an open device does nothing.
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn read(&mut self, start: SectorNbr, count: SectorNbr, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, start: SectorNbr, count: SectorNbr, buf: &[u8]) -> Result<()>;
    /// Tells the device the contents of `sector` are no longer needed.
    fn trim(&mut self, sector: SectorNbr) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn query(&self) -> BlockDevInfo;
}

impl<F: NorFlash> BlockDevice for Ftl<F> {
    fn open(&mut self) -> Result<()> {
        self.mount()
    }

    fn close(&mut self) {
        self.unmount();
    }

    fn read(&mut self, start: SectorNbr, count: SectorNbr, buf: &mut [u8]) -> Result<()> {
        Ftl::read(self, start, count, buf)
    }

    fn write(&mut self, start: SectorNbr, count: SectorNbr, buf: &[u8]) -> Result<()> {
        Ftl::write(self, start, count, buf)
    }

    fn trim(&mut self, sector: SectorNbr) -> Result<()> {
        Ftl::trim(self, sector)
    }

    fn sync(&mut self) -> Result<()> {
        Ftl::sync(self)
    }

    fn query(&self) -> BlockDevInfo {
        let geo = self.geometry();
        BlockDevInfo {
            sector_size: geo.sector_size,
            sector_size_log2: geo.sector_size_log2,
            sector_count: geo.disk_sectors,
            fixed: true,
        }
    }
}
