//! Block reclaim and wear leveling.
//!
//! Before each write the policy may pick one block to empty: the least worn
//! block when erase counts drift too far apart, or the block with the fewest
//! live sectors when erased blocks run short. Its valid sectors are copied
//! through the normal write path, then the block is erased with its erase
//! count bumped.

use crate::config::*;
use crate::error::Result;
use crate::flash::NorFlash;
use crate::ftl::Ftl;
use crate::layout::{SectorStatus, ERASE_CNT_INVALID};

impl<F: NorFlash> Ftl<F> {
    /// Runs the policy until it has nothing left to reclaim.
    pub(crate) fn reclaim_if_needed(&mut self) -> Result<()> {
        while let Some(blk_ix) = self.find_reclaim_block()? {
            self.reclaim_block(blk_ix)?;
        }
        Ok(())
    }

    pub(crate) fn find_reclaim_block(&mut self) -> Result<Option<BlockIx>> {
        if let Some(blk_ix) = self.find_wear_block()? {
            self.wear_pending = true;
            self.stats.wear_level_moves += 1;
            return Ok(Some(blk_ix));
        }
        Ok(self.find_space_block())
    }

    /// Least worn inactive block, once the erase count spread passes the
    /// threshold.
    fn find_wear_block(&mut self) -> Result<Option<BlockIx>> {
        if self.erased_blk_cnt == 0 || self.wear_pending {
            return Ok(None);
        }
        let th = EraseCount::from(self.cfg.erase_count_diff_threshold);
        let cnt_max = self.erase_cnt_max;
        if cnt_max.saturating_sub(self.erase_cnt_min) <= th {
            return Ok(None);
        }

        // Cached min may be stale. Refresh it while looking for a victim.
        let limit = cnt_max - th;
        let mut cnt_min = ERASE_CNT_INVALID;
        let mut found: Option<(EraseCount, Counter, BlockIx)> = None;
        for blk_ix in 0..self.geo.block_count {
            let hdr = self.read_block_header(blk_ix)?;
            if !self.block_header_valid(&hdr) || hdr.erase_count == ERASE_CNT_INVALID {
                continue;
            }
            cnt_min = cnt_min.min(hdr.erase_count);

            if self.blocks.is_erased(blk_ix)
                || self.active.is_active(blk_ix)
                || hdr.erase_count > limit
                || !self.fits_elsewhere(blk_ix)
            {
                continue;
            }
            let key = (hdr.erase_count, self.blocks.valid_count(blk_ix), blk_ix);
            if found.map_or(true, |best| key < best) {
                found = Some(key);
            }
        }

        if cnt_min != ERASE_CNT_INVALID {
            self.erase_cnt_min = cnt_min;
        }
        if cnt_max - self.erase_cnt_min <= th {
            return Ok(None);
        }

        Ok(found.map(|(cnt, valid, blk_ix)| {
            debug!(
                "Wear leveling block {}: erase count {} of {}..{}, {} valid",
                blk_ix, cnt, self.erase_cnt_min, cnt_max, valid
            );
            blk_ix
        }))
    }

    /// Block to empty when erased blocks run low.
    pub(crate) fn find_space_block(&self) -> Option<BlockIx> {
        let needed = if self.active.count() == 0 {
            self.erased_blk_cnt < 2
        } else {
            self.erased_blk_cnt < 1
        };
        if !needed {
            return None;
        }
        self.find_space_victim()
    }

    /// Non-erased block with the fewest live sectors, counting the erased
    /// tail of an active block as live. Blocks with nothing dead in them are
    /// never picked, nor blocks whose valid sectors do not fit elsewhere.
    pub(crate) fn find_space_victim(&self) -> Option<BlockIx> {
        let spb = self.geo.sectors_per_block;
        (0..self.geo.block_count)
            .filter(|blk_ix| !self.blocks.is_erased(*blk_ix))
            .map(|blk_ix| {
                let live = self.blocks.valid_count(blk_ix) + self.active.erased_in(blk_ix, spb);
                (live, blk_ix)
            })
            .filter(|(live, blk_ix)| *live < spb && self.fits_elsewhere(*blk_ix))
            .min()
            .map(|(_, blk_ix)| blk_ix)
    }

    /// Whether the valid sectors of `blk_ix` fit into erased sectors outside
    /// it with one left over. A copy cut short by a power loss burns at most
    /// that one.
    pub(crate) fn fits_elsewhere(&self, blk_ix: BlockIx) -> bool {
        let spb = self.geo.sectors_per_block;
        let valid = self.blocks.valid_count(blk_ix);
        let room = self.erased_blk_cnt * spb + self.active.erased_total(spb)
            - self.active.erased_in(blk_ix, spb);
        valid == 0 || valid < room
    }

    fn is_reclaimable(&self, blk_ix: BlockIx) -> bool {
        !self.blocks.is_erased(blk_ix)
            && !self.active.is_active(blk_ix)
            && self.blocks.valid_count(blk_ix) < self.geo.sectors_per_block
    }

    /// Moves every valid sector out of `blk_ix` and erases it.
    pub(crate) fn reclaim_block(&mut self, blk_ix: BlockIx) -> Result<()> {
        let lost = self.active.erased_in(blk_ix, self.geo.sectors_per_block);
        if self.active.remove(blk_ix).is_some() {
            trace!("Block {} evicted, {} sectors lost", blk_ix, lost);
        }
        trace!("Reclaiming block {} with {} valid", blk_ix, self.blocks.valid_count(blk_ix));

        let first = self.geo.block_first_sector(blk_ix);
        let mut buf = vec![0u8; self.geo.sector_size as usize];

        for sec_ix in 0..self.geo.sectors_per_block {
            if self.blocks.valid_count(blk_ix) == 0 {
                break;
            }
            let sec_nbr_phy = first + sec_ix;
            let hdr = self.read_sector_header(sec_nbr_phy)?;
            if hdr.status != SectorStatus::Valid || hdr.sector_nbr >= self.geo.disk_sectors {
                continue;
            }
            if self.l2p.get(hdr.sector_nbr) != sec_nbr_phy {
                warn!("Stale copy of lsn {} at {}", hdr.sector_nbr, sec_nbr_phy);
                continue;
            }

            self.flash
                .read(self.geo.sector_addr(sec_nbr_phy) + Addr::from(SEC_HDR_LEN), &mut buf)?;
            // Invalidates the source once the copy is valid.
            self.write_sector_internal(hdr.sector_nbr, &buf)?;
            self.stats.sectors_copied += 1;
        }

        self.erase_block_fmt(blk_ix)
    }

    /// Erases `blk_ix` and gives it the next erase count.
    pub(crate) fn erase_block_fmt(&mut self, blk_ix: BlockIx) -> Result<()> {
        let cnt = match self.read_block_header(blk_ix) {
            Ok(hdr) if self.block_header_valid(&hdr) && hdr.erase_count < ERASE_CNT_INVALID - 1 => {
                hdr.erase_count + 1
            }
            Ok(_) => self.erase_cnt_max,
            Err(e) => {
                warn!("Block {} header unreadable: {}", blk_ix, e);
                self.erase_cnt_max
            }
        };
        if cnt > self.erase_cnt_max {
            self.erase_cnt_max = cnt;
        }

        self.format_block(blk_ix, cnt)?;
        self.set_block_erased(blk_ix, true);
        self.stats.blocks_erased += 1;
        trace!("Block {} erased, count {}", blk_ix, cnt);
        Ok(())
    }

    /// Reclaims every block holding stale sectors so live data sits in as
    /// few blocks as possible.
    pub fn compact(&mut self) -> Result<()> {
        self.check_mounted()?;

        for blk_ix in 0..self.geo.block_count {
            if !self.is_reclaimable(blk_ix) {
                continue;
            }
            self.reclaim_if_needed()?;
            if self.is_reclaimable(blk_ix) && self.fits_elsewhere(blk_ix) {
                self.reclaim_block(blk_ix)?;
            }
        }

        debug!("Compacted: {:?}", self.usage());
        Ok(())
    }

    /// Compacts, then rewrites every written sector in logical order.
    pub fn defrag(&mut self) -> Result<()> {
        self.compact()?;

        let evicted: Vec<_> = self.active.iter().collect();
        for ab in evicted {
            self.active.remove(ab.blk_ix);
            let lost = self.geo.sectors_per_block - ab.sec_ix_next;
            trace!("Block {} evicted, {} sectors lost", ab.blk_ix, lost);
        }

        let lsns: Vec<SectorNbr> = self.l2p.mapped().map(|(lsn, _)| lsn).collect();
        let mut buf = vec![0u8; self.geo.sector_size as usize];
        for lsn in lsns {
            self.read_sector(lsn, &mut buf)?;
            self.write_sector(lsn, &buf)?;
        }

        debug!("Defragmented: {:?}", self.usage());
        Ok(())
    }
}
