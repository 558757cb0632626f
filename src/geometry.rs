use byte_unit::Byte;

use crate::config::*;
use crate::error::{FtlError, Result};
use crate::flash::FlashGeometry;

/// Layout of the FTL region, derived once when the instance is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub sector_size: u32,
    pub sector_size_log2: u8,
    /// First chip block used by the FTL; blocks before it are left alone.
    pub first_block: BlockIx,
    pub block_count: BlockIx,
    pub sectors_per_block: SectorNbr,
    /// Physical sectors over every used block.
    pub total_sectors: SectorNbr,
    pub reserved_sectors: SectorNbr,
    /// Logical capacity exposed to callers.
    pub disk_sectors: SectorNbr,
    /// Width of one logical-to-physical map entry.
    pub l2p_entry_bits: u8,
}

fn invalid(msg: impl Into<String>) -> FtlError {
    let msg = msg.into();
    error!("{}", msg);
    FtlError::InvalidConfig(msg)
}

/// Number of bits needed to write `val`.
pub(crate) fn bit_len(val: u32) -> u8 {
    (u32::BITS - val.leading_zeros()) as u8
}

impl Geometry {
    pub fn calc(flash: FlashGeometry, cfg: &FtlConfig) -> Result<Self> {
        let blk_cnt = flash.block_count;
        let blk_size = flash.block_size;

        if blk_cnt == 0 {
            return Err(invalid("medium has no blocks"));
        }

        let sec_size = cfg.sector_size.unwrap_or(blk_size.min(SEC_SIZE_DFLT));
        if !SEC_SIZES.contains(&sec_size) {
            return Err(invalid(format!("sector size {} not supported", sec_size)));
        }

        if sec_size + BLK_HDR_LEN + SEC_HDR_LEN > blk_size {
            return Err(invalid(format!(
                "block size {} cannot hold one {} byte sector",
                blk_size, sec_size
            )));
        }

        let rsvd_blk_cnt = cfg.start_offset / Addr::from(blk_size);
        if rsvd_blk_cnt >= Addr::from(blk_cnt) {
            return Err(invalid(format!(
                "start offset {} leaves no blocks (block count {})",
                cfg.start_offset, blk_cnt
            )));
        }
        let first_block = rsvd_blk_cnt as BlockIx;
        let avail_blk_cnt = blk_cnt - first_block;

        let ftl_blk_cnt = match cfg.device_size {
            None => avail_blk_cnt,
            Some(size) => (size / Addr::from(blk_size)).min(Addr::from(avail_blk_cnt)) as BlockIx,
        };
        if ftl_blk_cnt == 0 {
            return Err(invalid("device size smaller than one block"));
        }
        if ftl_blk_cnt > BlockIx::from(u16::MAX) {
            return Err(invalid(format!("{} blocks do not fit the block header", ftl_blk_cnt)));
        }

        let sec_cnt_blk = (blk_size - BLK_HDR_LEN) / (sec_size + SEC_HDR_LEN);
        let ftl_sec_cnt = sec_cnt_blk
            .checked_mul(ftl_blk_cnt)
            .filter(|cnt| *cnt < INVALID_SEC_NBR)
            .ok_or_else(|| invalid("physical sector count overflows"))?;

        // At least one block per active slot, each of which may strand its
        // erased tail, plus one spare block. With a single spare block every
        // reclaim of a full device is an exact fit, and one torn program
        // during it leaves no block that can ever be emptied.
        let pct = u64::from(cfg.pct_reserved.clamp(PCT_RSVD_MIN, PCT_RSVD_MAX));
        let ab_cnt = cfg.active_block_count.clamp(1, ACTIVE_BLK_CNT_MAX) as SectorNbr;
        let sec_cnt_rsvd_min = sec_cnt_blk * (ab_cnt + 1);
        let sec_cnt_rsvd_pct = (u64::from(ftl_sec_cnt) * pct / 100) as SectorNbr;
        let sec_cnt_rsvd = sec_cnt_rsvd_pct.max(sec_cnt_rsvd_min);
        if sec_cnt_rsvd >= ftl_sec_cnt {
            return Err(invalid(format!(
                "reserve of {} sectors leaves no capacity out of {}",
                sec_cnt_rsvd, ftl_sec_cnt
            )));
        }

        let out = Geometry {
            block_size: blk_size,
            sector_size: sec_size,
            sector_size_log2: sec_size.trailing_zeros() as u8,
            first_block,
            block_count: ftl_blk_cnt,
            sectors_per_block: sec_cnt_blk,
            total_sectors: ftl_sec_cnt,
            reserved_sectors: sec_cnt_rsvd,
            disk_sectors: ftl_sec_cnt - sec_cnt_rsvd,
            l2p_entry_bits: bit_len(ftl_sec_cnt),
        };

        let phys = u128::from(ftl_sec_cnt) * u128::from(sec_size);
        let user = u128::from(out.disk_sectors) * u128::from(sec_size);
        trace!("Blocks: {} x {} bytes, first {}", ftl_blk_cnt, blk_size, first_block);
        trace!("Sectors: {} bytes, {} per block", sec_size, sec_cnt_blk);
        trace!(
            "Physical Capacity: {} bytes, {}",
            phys,
            Byte::from_bytes(phys).get_appropriate_unit(true).to_string()
        );
        trace!(
            "User Capacity: {} bytes, {}",
            user,
            Byte::from_bytes(user).get_appropriate_unit(true).to_string()
        );
        trace!("Reserved: {} sectors", sec_cnt_rsvd);

        Ok(out)
    }

    /// Byte offset of `blk_ix` (relative to the FTL region) on the medium.
    pub fn block_addr(&self, blk_ix: BlockIx) -> Addr {
        Addr::from(self.first_block + blk_ix) * Addr::from(self.block_size)
    }

    /// Byte offset of the header of a physical sector.
    pub fn sector_addr(&self, sec_nbr_phy: SectorNbr) -> Addr {
        let blk_ix = sec_nbr_phy / self.sectors_per_block;
        let sec_ix = sec_nbr_phy % self.sectors_per_block;
        self.block_addr(blk_ix)
            + Addr::from(BLK_HDR_LEN)
            + Addr::from(sec_ix) * Addr::from(self.sector_size + SEC_HDR_LEN)
    }

    pub fn sector_block(&self, sec_nbr_phy: SectorNbr) -> BlockIx {
        sec_nbr_phy / self.sectors_per_block
    }

    pub fn block_first_sector(&self, blk_ix: BlockIx) -> SectorNbr {
        blk_ix * self.sectors_per_block
    }
}
