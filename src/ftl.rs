use crate::config::*;
use crate::error::{FtlError, Result};
use crate::flash::NorFlash;
use crate::geometry::Geometry;
use crate::layout::*;
use crate::tables::{ActiveBlock, ActiveBlocks, BlockTable, L2pMap};

/// Running totals since the instance was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FtlStats {
    /// Sectors relocated out of a block being reclaimed.
    pub sectors_copied: u64,
    /// Sectors dropped by `trim`.
    pub sectors_released: u64,
    /// Inactive blocks whose last valid sector went away.
    pub blocks_invalidated: u64,
    pub blocks_erased: u64,
    /// Blocks picked for reclaim by the wear leveler.
    pub wear_level_moves: u64,
}

/// Snapshot of how the blocks and sectors are used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FtlUsage {
    pub blocks_valid: Counter,
    pub blocks_erased: Counter,
    pub blocks_invalid: Counter,
    pub sectors_valid: Counter,
    pub sectors_erased: Counter,
    pub sectors_invalid: Counter,
    pub active_blocks: usize,
}

/// Translation layer over one NOR medium.
///
/// Owns the adapter for its whole life; [`Ftl::into_inner`] hands it back.
/// Every piece of state besides the configuration is rebuilt by [`Ftl::mount`].
pub struct Ftl<F: NorFlash> {
    pub(crate) flash: F,
    pub(crate) cfg: FtlConfig,
    pub(crate) geo: Geometry,

    pub(crate) l2p: L2pMap,
    pub(crate) blocks: BlockTable,
    pub(crate) active: ActiveBlocks,
    pub(crate) erased_blk_cnt: Counter,

    /// May lag behind the medium; refreshed at mount and before wear leveling.
    pub(crate) erase_cnt_min: EraseCount,
    pub(crate) erase_cnt_max: EraseCount,
    /// A block was picked for wear leveling and no erased block was taken since.
    pub(crate) wear_pending: bool,

    pub(crate) mounted: bool,
    pub(crate) stats: FtlStats,
}

pub(crate) fn corrupt(msg: impl Into<String>) -> FtlError {
    let msg = msg.into();
    error!("{}", msg);
    FtlError::CorruptFormat(msg)
}

impl<F: NorFlash> Ftl<F> {
    /// Attaches to `flash`. Nothing is read until [`Ftl::mount`] or
    /// [`Ftl::low_level_format`].
    pub fn new(flash: F, cfg: FtlConfig) -> Result<Self> {
        let cfg = cfg.clamped();
        let geo = Geometry::calc(flash.geometry(), &cfg)?;

        Ok(Ftl {
            l2p: L2pMap::new(geo.disk_sectors, geo.l2p_entry_bits),
            blocks: BlockTable::new(geo.block_count, geo.sectors_per_block),
            active: ActiveBlocks::new(cfg.active_block_count),
            erased_blk_cnt: 0,
            erase_cnt_min: 0,
            erase_cnt_max: 0,
            wear_pending: false,
            mounted: false,
            stats: FtlStats::default(),
            flash,
            cfg,
            geo,
        })
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn config(&self) -> &FtlConfig {
        &self.cfg
    }

    pub fn stats(&self) -> FtlStats {
        self.stats
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Logical capacity in sectors.
    pub fn sector_count(&self) -> SectorNbr {
        self.geo.disk_sectors
    }

    pub fn usage(&self) -> FtlUsage {
        let spb = self.geo.sectors_per_block;
        let mut usage = FtlUsage {
            active_blocks: self.active.count(),
            ..FtlUsage::default()
        };

        for blk_ix in 0..self.geo.block_count {
            if self.blocks.is_erased(blk_ix) {
                usage.blocks_erased += 1;
                usage.sectors_erased += spb;
                continue;
            }
            let valid = self.blocks.valid_count(blk_ix);
            usage.sectors_valid += valid;
            if valid > 0 || self.active.is_active(blk_ix) {
                usage.blocks_valid += 1;
            } else {
                usage.blocks_invalid += 1;
            }
        }

        usage.sectors_erased += self.active.erased_total(spb);
        usage.sectors_invalid = self.geo.total_sectors - usage.sectors_valid - usage.sectors_erased;
        usage
    }

    /// Erases every block and writes fresh headers. Erase counts found in
    /// valid headers carry over; blocks without one get the highest count seen.
    pub fn low_level_format(&mut self) -> Result<()> {
        if self.mounted {
            self.unmount();
        }

        let mut counts = Vec::with_capacity(self.geo.block_count as usize);
        for blk_ix in 0..self.geo.block_count {
            let cnt = match self.read_block_header(blk_ix) {
                Ok(hdr) if hdr.is_formatted() && hdr.erase_count != ERASE_CNT_INVALID => {
                    Some(hdr.erase_count.saturating_add(1).min(ERASE_CNT_INVALID - 1))
                }
                Ok(_) => None,
                Err(e) => {
                    warn!("Block {} header unreadable: {}", blk_ix, e);
                    None
                }
            };
            counts.push(cnt);
        }

        let cnt_max = counts.iter().flatten().copied().max().unwrap_or(0);
        for (blk_ix, cnt) in counts.into_iter().enumerate() {
            self.format_block(blk_ix as BlockIx, cnt.unwrap_or(cnt_max))?;
        }

        info!("Formatted {} blocks, max erase count {}", self.geo.block_count, cnt_max);
        Ok(())
    }

    /// Reads `count` sectors starting at `start` into `buf`.
    pub fn read(&mut self, start: SectorNbr, count: SectorNbr, buf: &mut [u8]) -> Result<()> {
        self.check_mounted()?;
        self.check_range(start, count)?;
        self.check_buf(count, buf.len())?;

        let sec_size = self.geo.sector_size as usize;
        for (lsn, chunk) in (start..start + count).zip(buf.chunks_exact_mut(sec_size)) {
            self.read_sector_data(lsn, chunk)?;
        }
        Ok(())
    }

    /// Writes `count` sectors starting at `start` from `buf`.
    pub fn write(&mut self, start: SectorNbr, count: SectorNbr, buf: &[u8]) -> Result<()> {
        self.check_mounted()?;
        self.check_range(start, count)?;
        self.check_buf(count, buf.len())?;

        let sec_size = self.geo.sector_size as usize;
        for (lsn, chunk) in (start..start + count).zip(buf.chunks_exact(sec_size)) {
            self.reclaim_if_needed()?;
            self.write_sector_internal(lsn, chunk)?;
        }
        Ok(())
    }

    pub fn read_sector(&mut self, lsn: SectorNbr, buf: &mut [u8]) -> Result<()> {
        self.read(lsn, 1, buf)
    }

    pub fn write_sector(&mut self, lsn: SectorNbr, data: &[u8]) -> Result<()> {
        self.write(lsn, 1, data)
    }

    /// Drops the contents of `lsn`; it reads as erased afterwards.
    pub fn trim(&mut self, lsn: SectorNbr) -> Result<()> {
        self.check_mounted()?;
        self.check_range(lsn, 1)?;

        let sec_nbr_phy = self.l2p.get(lsn);
        if sec_nbr_phy == INVALID_SEC_NBR {
            return Ok(());
        }

        self.invalidate_sector(sec_nbr_phy)?;
        self.l2p.set(lsn, INVALID_SEC_NBR);
        self.stats.sectors_released += 1;
        trace!("Trimmed lsn {} at {}", lsn, sec_nbr_phy);
        Ok(())
    }

    /// Every write is on the medium once the call returns.
    pub fn sync(&mut self) -> Result<()> {
        self.check_mounted()
    }

    fn read_sector_data(&mut self, lsn: SectorNbr, buf: &mut [u8]) -> Result<()> {
        let sec_nbr_phy = self.l2p.get(lsn);
        if sec_nbr_phy == INVALID_SEC_NBR {
            buf.fill(0xFF);
            return Ok(());
        }

        let addr = self.geo.sector_addr(sec_nbr_phy) + Addr::from(SEC_HDR_LEN);
        self.flash.read(addr, buf)?;
        Ok(())
    }

    /// Writes one sector without consulting the reclaim policy.
    pub(crate) fn write_sector_internal(&mut self, lsn: SectorNbr, data: &[u8]) -> Result<()> {
        let sec_nbr_phy = self.find_free_sector(lsn)?;
        let addr = self.geo.sector_addr(sec_nbr_phy);

        self.flash
            .write(addr + SEC_HDR_OFFSET_STATUS as Addr, &SectorStatus::Writing.encode())?;
        self.flash.write(addr + Addr::from(SEC_HDR_LEN), data)?;
        self.flash.write(addr, &SectorHeader::valid(lsn).encode())?;

        self.blocks.inc_valid(self.geo.sector_block(sec_nbr_phy));
        let sec_nbr_old = self.l2p.get(lsn);
        self.l2p.set(lsn, sec_nbr_phy);

        if sec_nbr_old != INVALID_SEC_NBR {
            self.invalidate_sector(sec_nbr_old)?;
        }
        Ok(())
    }

    pub(crate) fn invalidate_sector(&mut self, sec_nbr_phy: SectorNbr) -> Result<()> {
        self.write_sector_status(sec_nbr_phy, SectorStatus::Invalid)?;

        let blk_ix = self.geo.sector_block(sec_nbr_phy);
        self.blocks.dec_valid(blk_ix);
        if self.blocks.valid_count(blk_ix) == 0 && !self.active.is_active(blk_ix) {
            debug!("Block {} holds no valid sectors", blk_ix);
            self.stats.blocks_invalidated += 1;
        }
        Ok(())
    }

    /// Takes the next erased sector of the active block serving `lsn`.
    fn find_free_sector(&mut self, lsn: SectorNbr) -> Result<SectorNbr> {
        let ab_cnt = self.active.capacity();
        let disk_sectors = u64::from(self.geo.disk_sectors);
        let mut slot_ix = (u64::from(lsn) * ab_cnt as u64 * 2 / disk_sectors) as usize;
        if slot_ix >= ab_cnt {
            slot_ix -= ab_cnt;
        }

        if self.active.slot(slot_ix).is_none() {
            match self.find_erased_block()? {
                Some(blk_ix) => {
                    self.set_block_erased(blk_ix, false);
                    *self.active.slot_mut(slot_ix) = Some(ActiveBlock { blk_ix, sec_ix_next: 0 });
                    trace!("Block {} active in slot {}", blk_ix, slot_ix);
                }
                None => {
                    slot_ix = (0..ab_cnt)
                        .find(|ix| self.active.slot(*ix).is_some())
                        .ok_or_else(|| corrupt(format!("no free sector for lsn {}", lsn)))?;
                }
            }
        }

        let slot = self.active.slot_mut(slot_ix);
        let ab = slot.as_mut().ok_or_else(|| corrupt("active slot vanished"))?;
        let sec_nbr_phy = self.geo.block_first_sector(ab.blk_ix) + ab.sec_ix_next;
        ab.sec_ix_next += 1;
        if ab.sec_ix_next == self.geo.sectors_per_block {
            trace!("Block {} full", ab.blk_ix);
            *slot = None;
        }

        Ok(sec_nbr_phy)
    }

    /// Erased block with the lowest erase count.
    fn find_erased_block(&mut self) -> Result<Option<BlockIx>> {
        let mut found: Option<(EraseCount, BlockIx)> = None;
        for blk_ix in 0..self.geo.block_count {
            if !self.blocks.is_erased(blk_ix) {
                continue;
            }
            let cnt = self.read_block_header(blk_ix)?.erase_count;
            if found.map_or(true, |(cnt_min, _)| cnt < cnt_min) {
                found = Some((cnt, blk_ix));
            }
        }

        if found.is_some() {
            self.wear_pending = false;
        }
        Ok(found.map(|(_, blk_ix)| blk_ix))
    }

    pub(crate) fn set_block_erased(&mut self, blk_ix: BlockIx, erased: bool) {
        match (self.blocks.is_erased(blk_ix), erased) {
            (false, true) => self.erased_blk_cnt += 1,
            (true, false) => self.erased_blk_cnt -= 1,
            _ => {}
        }
        self.blocks.set_erased(blk_ix, erased);
        if erased {
            self.blocks.set_valid_count(blk_ix, 0);
        }
    }

    /// Erases `blk_ix` and stamps a fresh header carrying `erase_count`.
    pub(crate) fn format_block(&mut self, blk_ix: BlockIx, erase_count: EraseCount) -> Result<()> {
        self.flash.erase_block(self.geo.first_block + blk_ix)?;
        let hdr = BlockHeader::new(
            erase_count,
            self.geo.sector_size as u16,
            self.geo.block_count as u16,
        );
        self.flash.write(self.geo.block_addr(blk_ix), &hdr.encode())?;
        Ok(())
    }

    pub(crate) fn read_block_header(&mut self, blk_ix: BlockIx) -> Result<BlockHeader> {
        let mut buf: BlockHeaderBytes = [0; BLK_HDR_LEN as usize];
        self.flash.read(self.geo.block_addr(blk_ix), &mut buf)?;
        Ok(BlockHeader::decode(&buf))
    }

    pub(crate) fn block_header_valid(&self, hdr: &BlockHeader) -> bool {
        hdr.is_valid_for(self.geo.sector_size as u16, self.geo.block_count as u16)
    }

    pub(crate) fn read_sector_header(&mut self, sec_nbr_phy: SectorNbr) -> Result<SectorHeader> {
        let mut buf: SectorHeaderBytes = [0; SEC_HDR_LEN as usize];
        self.flash.read(self.geo.sector_addr(sec_nbr_phy), &mut buf)?;
        Ok(SectorHeader::decode(&buf))
    }

    pub(crate) fn write_sector_status(
        &mut self,
        sec_nbr_phy: SectorNbr,
        status: SectorStatus,
    ) -> Result<()> {
        let addr = self.geo.sector_addr(sec_nbr_phy) + SEC_HDR_OFFSET_STATUS as Addr;
        self.flash.write(addr, &status.encode())?;
        Ok(())
    }

    pub(crate) fn check_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(FtlError::NotMounted)
        }
    }

    fn check_range(&self, start: SectorNbr, count: SectorNbr) -> Result<()> {
        let capacity = self.geo.disk_sectors;
        match start.checked_add(count) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(FtlError::OutOfRange { start, count, capacity }),
        }
    }

    fn check_buf(&self, count: SectorNbr, actual: usize) -> Result<()> {
        let expected = count as usize * self.geo.sector_size as usize;
        if actual == expected {
            Ok(())
        } else {
            Err(FtlError::BufferSize { expected, actual })
        }
    }
}
