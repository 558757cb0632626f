//! Rebuilding the in-memory tables from the medium.

use crate::config::*;
use crate::error::Result;
use crate::flash::NorFlash;
use crate::ftl::{corrupt, Ftl};
use crate::layout::{SectorHeader, SectorStatus, ERASE_CNT_INVALID};

impl<F: NorFlash> Ftl<F> {
    /// Scans every block and sector header and rebuilds the map.
    ///
    /// Repairs what an interrupted operation can leave behind: a single block
    /// with a torn header, duplicate valid copies of one logical sector and a
    /// medium with no erased block left.
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }
        self.clear_state();

        let mut bad_blk = None;
        let mut cnt_min = ERASE_CNT_INVALID;
        let mut cnt_max = 0;

        for blk_ix in 0..self.geo.block_count {
            let hdr = self.read_block_header(blk_ix)?;
            if !self.block_header_valid(&hdr) {
                if let Some(first) = bad_blk {
                    let msg = format!("blocks {} and {} have no valid header", first, blk_ix);
                    return Err(corrupt(msg));
                }
                bad_blk = Some(blk_ix);
                continue;
            }
            if hdr.erase_count != ERASE_CNT_INVALID {
                cnt_min = cnt_min.min(hdr.erase_count);
                cnt_max = cnt_max.max(hdr.erase_count);
            }
        }
        if cnt_min == ERASE_CNT_INVALID {
            cnt_min = 0;
        }
        self.erase_cnt_min = cnt_min;
        self.erase_cnt_max = cnt_max;

        if let Some(blk_ix) = bad_blk {
            warn!("Block {} header invalid, erasing with count {}", blk_ix, cnt_max);
            self.format_block(blk_ix, cnt_max)?;
            self.set_block_erased(blk_ix, true);
        }

        for blk_ix in (0..self.geo.block_count).filter(|blk_ix| Some(*blk_ix) != bad_blk) {
            self.scan_block(blk_ix)?;
        }

        self.relocate_if_no_free_block()?;

        self.mounted = true;
        let usage = self.usage();
        debug!(
            "Mounted: {} valid, {} erased, {} invalid blocks; {} valid sectors; erase count {}..{}",
            usage.blocks_valid,
            usage.blocks_erased,
            usage.blocks_invalid,
            usage.sectors_valid,
            self.erase_cnt_min,
            self.erase_cnt_max
        );
        Ok(())
    }

    /// Drops everything derived from the medium.
    pub fn unmount(&mut self) {
        self.clear_state();
        self.mounted = false;
        debug!("Unmounted");
    }

    fn clear_state(&mut self) {
        self.l2p.clear();
        self.blocks.clear();
        self.active.clear();
        self.erased_blk_cnt = 0;
        self.wear_pending = false;
    }

    fn scan_block(&mut self, blk_ix: BlockIx) -> Result<()> {
        let first = self.geo.block_first_sector(blk_ix);
        let mut last_written = None;
        let mut valid_cnt = 0;

        for sec_ix in 0..self.geo.sectors_per_block {
            let sec_nbr_phy = first + sec_ix;
            let hdr = self.read_sector_header(sec_nbr_phy)?;
            if hdr == SectorHeader::erased() {
                continue;
            }
            last_written = Some(sec_ix);

            if hdr.status != SectorStatus::Valid || hdr.sector_nbr >= self.geo.disk_sectors {
                continue;
            }

            let lsn = hdr.sector_nbr;
            let sec_nbr_kept = self.l2p.get(lsn);
            if sec_nbr_kept == INVALID_SEC_NBR {
                self.l2p.set(lsn, sec_nbr_phy);
                valid_cnt += 1;
            } else {
                error!(
                    "Lsn {} valid at {} and {}, dropping the latter",
                    lsn, sec_nbr_kept, sec_nbr_phy
                );
                self.write_sector_status(sec_nbr_phy, SectorStatus::Invalid)?;
            }
        }

        let sec_ix_tail = match last_written {
            None => {
                self.set_block_erased(blk_ix, true);
                return Ok(());
            }
            Some(sec_ix) => sec_ix + 1,
        };

        self.blocks.set_valid_count(blk_ix, valid_cnt);

        if sec_ix_tail < self.geo.sectors_per_block {
            if self.active.add(blk_ix, sec_ix_tail) {
                trace!("Block {} active from sector {}", blk_ix, sec_ix_tail);
            } else {
                let lost = self.geo.sectors_per_block - sec_ix_tail;
                trace!("Block {} tail of {} sectors dropped", blk_ix, lost);
            }
        }
        Ok(())
    }

    /// A write or reclaim cut short can leave no erased block behind, with
    /// torn sectors taking up room in the active blocks. Empty one block so
    /// writes have somewhere to go. With nothing to empty, writes may still
    /// go into the erased tails of the active blocks.
    fn relocate_if_no_free_block(&mut self) -> Result<()> {
        if self.erased_blk_cnt > 0 {
            return Ok(());
        }

        if let Some(blk_ix) = self.find_space_victim() {
            warn!("No free block, relocating block {}", blk_ix);
            return self.reclaim_block(blk_ix);
        }

        let room = self.active.erased_total(self.geo.sectors_per_block);
        if room == 0 {
            return Err(corrupt("no erased block and none to reclaim"));
        }
        warn!("No free block, {} sectors left in active blocks", room);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::FtlError;
    use crate::flash::RamFlash;
    use crate::geometry::Geometry;
    use crate::layout::{BlockHeader, SEC_HDR_OFFSET_STATUS};
    use crate::test_util::*;

    fn program_status(
        flash: &mut RamFlash,
        geo: &Geometry,
        sec_nbr_phy: SectorNbr,
        status: SectorStatus,
    ) {
        let addr = geo.sector_addr(sec_nbr_phy) + SEC_HDR_OFFSET_STATUS as Addr;
        flash.write(addr, &status.encode()).unwrap();
    }

    fn remount(flash: RamFlash) -> Ftl<RamFlash> {
        let mut ftl = Ftl::new(flash, small_cfg()).unwrap();
        ftl.mount().unwrap();
        ftl
    }

    #[test]
    fn freshly_formatted_medium_is_empty() {
        let ftl = small_ftl();
        let usage = ftl.usage();
        assert_eq!(usage.blocks_erased, 8);
        assert_eq!(usage.sectors_valid, 0);
        assert_eq!(usage.active_blocks, 0);
    }

    #[test]
    fn partial_block_becomes_active_again() {
        let mut ftl = small_ftl();
        for lsn in 0..20 {
            ftl.write_sector(lsn, &pattern(lsn, 0, 512)).unwrap();
        }

        let mut ftl = remount(ftl.into_inner());
        assert_eq!(ftl.active.iter().collect::<Vec<_>>().len(), 1);
        assert_eq!(ftl.active.erased_in(1, 16), 12);

        ftl.write_sector(20, &pattern(20, 0, 512)).unwrap();
        assert_eq!(ftl.l2p.get(20), 20);
    }

    #[test]
    fn keeps_one_of_duplicate_copies() {
        let mut ftl = small_ftl();
        ftl.write_sector(4, &pattern(4, 0, 512)).unwrap();
        ftl.write_sector(5, &pattern(5, 0, 512)).unwrap();
        let geo = *ftl.geometry();
        let mut flash = ftl.into_inner();

        // Second valid copy of lsn 4, as left by a write cut before the
        // old copy was invalidated.
        let addr = geo.sector_addr(2);
        flash.write(addr + 8, &pattern(4, 1, 512)).unwrap();
        flash.write(addr, &SectorHeader::valid(4).encode()).unwrap();
        assert_eq!(valid_copies(&flash, &geo).get(&4), Some(&2));

        let mut ftl = remount(flash);
        let mut buf = vec![0u8; 512];
        ftl.read_sector(4, &mut buf).unwrap();
        assert_eq!(buf, pattern(4, 0, 512));
        assert_eq!(ftl.usage().sectors_valid, 2);
        assert_eq!(valid_copies(ftl.flash(), &geo).get(&4), Some(&1));
    }

    #[test]
    fn torn_sectors_count_as_invalid() {
        let mut ftl = small_ftl();
        ftl.write_sector(0, &pattern(0, 0, 512)).unwrap();
        let geo = *ftl.geometry();
        let mut flash = ftl.into_inner();

        // Status programmed to writing, payload never made it.
        program_status(&mut flash, &geo, 1, SectorStatus::Writing);

        let ftl = remount(flash);
        let usage = ftl.usage();
        assert_eq!(usage.sectors_valid, 1);
        assert_eq!(usage.sectors_invalid, 1);
        assert_eq!(ftl.active.erased_in(0, 16), 14);
    }

    #[test]
    fn erased_gap_is_not_reused() {
        let mut ftl = small_ftl();
        let geo = *ftl.geometry();
        ftl.write_sector(0, &pattern(0, 0, 512)).unwrap();
        let mut flash = ftl.into_inner();
        flash.write(geo.sector_addr(3), &SectorHeader::valid(7).encode()).unwrap();

        let ftl = remount(flash);
        assert_eq!(ftl.active.erased_in(0, 16), 12);
        assert_eq!(ftl.usage().sectors_invalid, 2);
    }

    #[test]
    fn repairs_interrupted_erase() {
        let mut ftl = small_ftl();
        for lsn in 0..20 {
            ftl.write_sector(lsn, &pattern(lsn, 0, 512)).unwrap();
        }
        let mut flash = ftl.into_inner();
        flash.erase_block(5).unwrap();

        let mut ftl = remount(flash);
        assert_eq!(ftl.usage().blocks_erased, 6);
        let hdr = ftl.read_block_header(5).unwrap();
        assert!(ftl.block_header_valid(&hdr));
        assert_eq!(hdr.erase_count, 0);

        let mut buf = vec![0u8; 512];
        ftl.read_sector(19, &mut buf).unwrap();
        assert_eq!(buf, pattern(19, 0, 512));
    }

    #[test]
    fn two_torn_headers_are_fatal() {
        let ftl = small_ftl();
        let mut flash = ftl.into_inner();
        flash.erase_block(2).unwrap();
        flash.erase_block(6).unwrap();

        let mut ftl = Ftl::new(flash, small_cfg()).unwrap();
        assert!(matches!(ftl.mount(), Err(FtlError::CorruptFormat(_))));
        assert!(!ftl.is_mounted());
    }

    #[test]
    fn header_from_other_geometry_is_invalid() {
        let ftl = small_ftl();
        let geo = *ftl.geometry();
        let mut flash = ftl.into_inner();
        flash.erase_block(3).unwrap();
        flash
            .write(geo.block_addr(3), &BlockHeader::new(0, 1024, 8).encode())
            .unwrap();

        let mut ftl = remount(flash);
        let hdr = ftl.read_block_header(3).unwrap();
        assert!(ftl.block_header_valid(&hdr));
        assert_eq!(ftl.usage().blocks_erased, 8);
    }

    #[test]
    fn surplus_tails_are_dropped() {
        let ftl = small_ftl();
        let geo = *ftl.geometry();
        let mut flash = ftl.into_inner();

        // Three half-written blocks, one active slot.
        for (i, blk_ix) in [0u32, 2, 4].iter().enumerate() {
            let phy = geo.block_first_sector(*blk_ix);
            let lsn = i as SectorNbr;
            flash.write(geo.sector_addr(phy) + 8, &pattern(lsn, 0, 512)).unwrap();
            flash.write(geo.sector_addr(phy), &SectorHeader::valid(lsn).encode()).unwrap();
        }

        let ftl = remount(flash);
        let usage = ftl.usage();
        assert_eq!(usage.active_blocks, 1);
        assert!(ftl.active.is_active(0));
        assert_eq!(usage.blocks_valid, 3);
        assert_eq!(usage.sectors_invalid, 30);
    }

    /// Every logical sector written, half of blocks 0 and 1 overwritten into
    /// block 6. Block 7 is the only erased block left.
    fn one_free_block_left() -> (RamFlash, Geometry) {
        let mut ftl = small_ftl();
        for lsn in 0..ftl.sector_count() {
            ftl.write_sector(lsn, &pattern(lsn, 0, 512)).unwrap();
        }
        for lsn in (0..8).chain(16..24) {
            ftl.write_sector(lsn, &pattern(lsn, 1, 512)).unwrap();
        }
        assert_eq!(ftl.usage().blocks_erased, 1);
        assert_eq!(ftl.usage().active_blocks, 0);

        let geo = *ftl.geometry();
        (ftl.into_inner(), geo)
    }

    fn gen_after_overwrite(lsn: SectorNbr) -> u32 {
        if lsn < 8 || (16..24).contains(&lsn) {
            1
        } else {
            0
        }
    }

    fn assert_data_intact(ftl: &mut Ftl<RamFlash>) {
        let mut buf = vec![0u8; 512];
        for lsn in 0..ftl.sector_count() {
            ftl.read_sector(lsn, &mut buf).unwrap();
            assert_eq!(buf, pattern(lsn, gen_after_overwrite(lsn), 512), "lsn {}", lsn);
        }
        let geo = *ftl.geometry();
        assert!(valid_copies(ftl.flash(), &geo).values().all(|n| *n == 1));
    }

    #[test]
    fn relocates_when_no_block_is_free() {
        let (mut flash, geo) = one_free_block_left();

        // Reclaim of block 0 into block 7 cut short: lsn 8..12 copied and
        // invalidated at the source, lsn 12..16 still in place.
        for (sec_ix, lsn) in (8..12).enumerate() {
            let dst = geo.block_first_sector(7) + sec_ix as SectorNbr;
            flash.write(geo.sector_addr(dst) + 8, &pattern(lsn, 0, 512)).unwrap();
            flash.write(geo.sector_addr(dst), &SectorHeader::valid(lsn).encode()).unwrap();
            program_status(&mut flash, &geo, lsn, SectorStatus::Invalid);
        }

        let mut ftl = remount(flash);
        assert_eq!(ftl.stats().sectors_copied, 4);
        assert_eq!(ftl.stats().blocks_erased, 1);
        let usage = ftl.usage();
        assert_eq!(usage.blocks_erased, 1);
        assert_eq!(usage.active_blocks, 1);
        assert!(ftl.blocks.is_erased(0));
        assert_eq!(ftl.active.erased_in(7, 16), 8);

        assert_data_intact(&mut ftl);
        ftl.write_sector(50, &pattern(50, 0, 512)).unwrap();
    }

    #[test]
    fn torn_active_block_is_emptied_when_nothing_is_erased() {
        let (mut flash, geo) = one_free_block_left();

        // Writes into the last erased block kept getting cut after the
        // status program.
        for sec_ix in 0..12 {
            let dst = geo.block_first_sector(7) + sec_ix;
            program_status(&mut flash, &geo, dst, SectorStatus::Writing);
        }

        let mut ftl = remount(flash);
        assert_eq!(ftl.stats().sectors_copied, 0);
        assert_eq!(ftl.stats().blocks_erased, 1);
        assert_eq!(ftl.usage().blocks_erased, 1);
        assert_eq!(ftl.usage().active_blocks, 0);
        assert_eq!(ftl.read_block_header(7).unwrap().erase_count, 1);

        assert_data_intact(&mut ftl);
        for lsn in 8..16 {
            ftl.write_sector(lsn, &pattern(lsn, 0, 512)).unwrap();
        }
        assert_data_intact(&mut ftl);
    }

    #[test]
    fn writes_into_active_tail_when_nothing_fits() {
        let (mut flash, geo) = one_free_block_left();

        // Block 7 holds torn sectors and one copy of lsn 9. Its tail is too
        // short to take block 0 or block 1 with a sector to spare.
        for sec_ix in 0..8 {
            let dst = geo.block_first_sector(7) + sec_ix;
            program_status(&mut flash, &geo, dst, SectorStatus::Writing);
        }
        let dst = geo.block_first_sector(7) + 8;
        flash.write(geo.sector_addr(dst) + 8, &pattern(9, 0, 512)).unwrap();
        flash.write(geo.sector_addr(dst), &SectorHeader::valid(9).encode()).unwrap();
        program_status(&mut flash, &geo, 9, SectorStatus::Invalid);

        let mut ftl = remount(flash);
        assert_eq!(ftl.stats().blocks_erased, 0);
        assert_eq!(ftl.usage().blocks_erased, 0);
        assert_eq!(ftl.active.erased_in(7, 16), 7);
        assert_data_intact(&mut ftl);
    }

    #[test]
    fn relocation_without_room_is_fatal() {
        let (mut flash, geo) = one_free_block_left();

        // Block 7 filled up with a copy of lsn 8 and garbage: nothing
        // erased anywhere, and every block holds valid data.
        for sec_ix in 0..16 {
            let lsn = if sec_ix == 0 { 8 } else { 200 };
            let dst = geo.block_first_sector(7) + sec_ix;
            flash.write(geo.sector_addr(dst), &SectorHeader::valid(lsn).encode()).unwrap();
        }
        program_status(&mut flash, &geo, 8, SectorStatus::Invalid);

        let mut ftl = Ftl::new(flash, small_cfg()).unwrap();
        assert!(matches!(ftl.mount(), Err(FtlError::CorruptFormat(_))));
    }

    #[test]
    fn unmount_forgets_everything() {
        let mut ftl = small_ftl();
        ftl.write_sector(1, &pattern(1, 0, 512)).unwrap();
        ftl.unmount();
        assert!(!ftl.is_mounted());
        assert_eq!(ftl.l2p.get(1), INVALID_SEC_NBR);

        ftl.mount().unwrap();
        let mut buf = vec![0u8; 512];
        ftl.read_sector(1, &mut buf).unwrap();
        assert_eq!(buf, pattern(1, 0, 512));
    }
}
